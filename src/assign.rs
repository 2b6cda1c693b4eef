use crate::Error;
use crate::KindId;
use crate::Result;
use crate::RowId;
use std::collections::VecDeque;

/// fifo of assignments. pushing a row id equal to the current front
/// means the stream has lapped the assigned interval, which is the
/// driver bug the duplicate check exists to catch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Queue<T> {
    queue: VecDeque<T>,
}

impl<T: Copy + PartialEq> Queue<T> {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn front(&self) -> Option<&T> {
        self.queue.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.queue.back()
    }

    pub fn get(&self, i: usize) -> &T {
        &self.queue[i]
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn push(&mut self, value: T) {
        self.queue.push_back(value);
    }

    pub fn try_push(&mut self, value: T) -> bool {
        if self.queue.front() == Some(&value) {
            false
        } else {
            self.queue.push_back(value);
            true
        }
    }

    pub fn pop(&mut self) -> Result<T> {
        self.queue.pop_front().ok_or(Error::EmptyPop)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter()
    }
}

/// the store of current assignments: a row-id fifo plus one group-id
/// fifo per kind, always of equal length. index i gives the assignment
/// of the i-th currently-assigned row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assignments {
    rowids: Queue<RowId>,
    groupids: Vec<Queue<u32>>,
}

impl Assignments {
    pub fn init(&mut self, kind_count: usize) {
        self.clear();
        self.groupids = vec![Queue::default(); kind_count];
    }

    pub fn clear(&mut self) {
        self.rowids.clear();
        for groupids in self.groupids.iter_mut() {
            groupids.clear();
        }
    }

    pub fn row_count(&self) -> usize {
        self.rowids.len()
    }

    pub fn kind_count(&self) -> usize {
        self.groupids.len()
    }

    pub fn rowids(&self) -> &Queue<RowId> {
        &self.rowids
    }

    pub fn push_row(&mut self, id: RowId) -> Result<()> {
        if self.rowids.try_push(id) {
            Ok(())
        } else {
            Err(Error::DuplicateRow(id))
        }
    }

    pub fn pop_row(&mut self) -> Result<RowId> {
        self.rowids.pop()
    }

    pub fn push_group(&mut self, kind: KindId, global: u32) {
        self.groupids[kind].push(global);
    }

    pub fn pop_group(&mut self, kind: KindId) -> Result<u32> {
        self.groupids[kind].pop()
    }

    pub fn groupids(&self, kind: KindId) -> &Queue<u32> {
        &self.groupids[kind]
    }

    /// append an empty per-kind fifo for a freshly created kind
    pub fn packed_add_kind(&mut self) -> &mut Queue<u32> {
        self.groupids.push(Queue::default());
        self.groupids.last_mut().expect("just pushed")
    }

    /// swap-remove the fifo of a destroyed kind
    pub fn packed_remove_kind(&mut self, kind: KindId) {
        self.groupids.swap_remove(kind);
    }

    /// split into the row fifo and the per-kind fifos for the pipeline's
    /// mutate stage, which pins one thread to each
    pub fn split_mut(&mut self) -> (&mut Queue<RowId>, &mut [Queue<u32>]) {
        (&mut self.rowids, &mut self.groupids)
    }

    pub fn validate(&self) {
        for groupids in self.groupids.iter() {
            debug_assert_eq!(groupids.len(), self.rowids.len());
        }
    }
}
