use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::RwLock;

// Bounded ring of task slots driven through ordered stages by a fixed
// set of consumer threads. Each slot carries a state word packing
// (stage, pending-consumers-in-stage); the last consumer of a stage
// advances the slot and wakes the next stage's waiters. The producer
// blocks while the ring is full, which is the backpressure.

const MAX_STAGES: usize = 48;
const COUNT_MASK: u64 = 0xFFFF;

fn pack(stage: usize, count: u64) -> u64 {
    debug_assert!(stage < MAX_STAGES);
    debug_assert!(count <= COUNT_MASK);
    (0x10000u64 << stage) | count
}

fn stage_bits(pair: u64) -> u64 {
    pair & !COUNT_MASK
}

fn count_bits(pair: u64) -> u64 {
    pair & COUNT_MASK
}

/// the atomic state word of one slot. acquire/release ordering makes a
/// consumer's writes visible to the consumers of the following stage.
struct StageState(AtomicU64);

impl StageState {
    fn load_stage(&self) -> u64 {
        stage_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, pair: u64) {
        self.0.store(pair, Ordering::Release);
    }

    fn decrement(&self) -> u64 {
        count_bits(self.0.fetch_sub(1, Ordering::AcqRel))
    }
}

/// per-stage rendezvous: the state word every slot must reach to enter
/// the stage, and the condvar its consumers sleep on
struct Guard {
    ready: u64,
    stage: u64,
    lock: Mutex<()>,
    woken: Condvar,
}

impl Guard {
    fn new(stage_number: usize, count: usize) -> Self {
        Self {
            ready: pack(stage_number, count as u64),
            stage: pack(stage_number, 0),
            lock: Mutex::new(()),
            woken: Condvar::new(),
        }
    }

    fn acquire(&self, state: &StageState) {
        if state.load_stage() != self.stage {
            let mut guard = self.lock.lock().expect("pipeline lock");
            while state.load_stage() != self.stage {
                guard = self.woken.wait(guard).expect("pipeline lock");
            }
        }
    }

    fn release(&self, state: &StageState) {
        if state.decrement() == 1 {
            state.store(self.ready);
            // take the lock so sleepers cannot miss the store
            drop(self.lock.lock().expect("pipeline lock"));
            self.woken.notify_all();
        }
    }

    fn set_ready(&self, state: &StageState) {
        state.store(self.ready);
    }
}

struct Slot<T> {
    state: StageState,
    envelope: RwLock<Envelope<T>>,
}

/// a task plus the exit sentinel the producer enqueues on shutdown
pub struct Envelope<T> {
    pub task: T,
    pub exit: bool,
}

pub struct Pipeline<T> {
    slots: Vec<Slot<T>>,
    guards: Vec<Guard>,
    stage_count: usize,
    consumer_counts: Vec<usize>,
}

impl<T: Default> Pipeline<T> {
    /// capacity + 1 slots, so a full ring still has the fence slot the
    /// producer waits on
    pub fn new(capacity: usize, stage_count: usize) -> Self {
        debug_assert!(capacity > 0, "cannot use a zero-length queue");
        debug_assert!(stage_count >= 1 && stage_count + 1 < MAX_STAGES);
        let slots: Vec<Slot<T>> = (0..capacity + 1)
            .map(|_| Slot {
                state: StageState(AtomicU64::new(0)),
                envelope: RwLock::new(Envelope {
                    task: T::default(),
                    exit: false,
                }),
            })
            .collect();
        let mut guards: Vec<Guard> = (0..stage_count).map(|s| Guard::new(s, 0)).collect();
        guards.push(Guard::new(stage_count, 1));
        for slot in slots.iter() {
            guards[stage_count].set_ready(&slot.state);
        }
        Self {
            slots,
            guards,
            stage_count,
            consumer_counts: vec![0; stage_count],
        }
    }

    /// register one consumer thread for a stage; call every registration
    /// before any thread starts consuming
    pub fn add_consumer(&mut self, stage: usize) {
        debug_assert!(stage < self.stage_count);
        self.consumer_counts[stage] += 1;
        self.guards[stage] = Guard::new(stage, self.consumer_counts[stage]);
    }

    pub fn validate(&self) {
        for (stage, count) in self.consumer_counts.iter().enumerate() {
            debug_assert!(*count > 0, "no threads in stage {}", stage);
        }
    }

    fn slot(&self, position: u64) -> &Slot<T> {
        &self.slots[position as usize % self.slots.len()]
    }

    /// write the task at `position`, blocking until every consumer has
    /// released the fence slot ahead of it
    pub fn produce(&self, position: u64, fill: impl FnOnce(&mut T)) {
        let done = &self.guards[self.stage_count];
        done.acquire(&self.slot(position + 1).state);
        let slot = self.slot(position);
        {
            let mut envelope = slot.envelope.write().expect("pipeline slot");
            envelope.exit = false;
            fill(&mut envelope.task);
        }
        self.guards[0].release(&slot.state);
    }

    /// enqueue the exit sentinel; every consumer terminates on observing it
    pub fn produce_exit(&self, position: u64) {
        let done = &self.guards[self.stage_count];
        done.acquire(&self.slot(position + 1).state);
        let slot = self.slot(position);
        slot.envelope.write().expect("pipeline slot").exit = true;
        self.guards[0].release(&slot.state);
    }

    /// run one consumer step with exclusive access to the task
    pub fn consume_mut(&self, stage: usize, position: u64, work: impl FnOnce(&mut Envelope<T>)) {
        let slot = self.slot(position);
        self.guards[stage].acquire(&slot.state);
        work(&mut slot.envelope.write().expect("pipeline slot"));
        self.guards[stage + 1].release(&slot.state);
    }

    /// run one consumer step with shared access, so the mutate stage's
    /// per-kind threads overlap on the same slot
    pub fn consume(&self, stage: usize, position: u64, work: impl FnOnce(&Envelope<T>)) {
        let slot = self.slot(position);
        self.guards[stage].acquire(&slot.state);
        work(&slot.envelope.read().expect("pipeline slot"));
        self.guards[stage + 1].release(&slot.state);
    }

    /// block until everything produced so far has fully drained
    pub fn wait(&self, position: u64) {
        let last = position + self.slots.len() as u64 - 1;
        self.guards[self.stage_count].acquire(&self.slot(last).state);
    }
}

/// the standard consumer loop: step through positions with exclusive
/// task access until the exit sentinel comes by
pub fn consume_loop<T: Default>(
    pipeline: &Pipeline<T>,
    stage: usize,
    mut work: impl FnMut(u64, &mut Envelope<T>),
) {
    let mut position = 0u64;
    loop {
        let mut alive = true;
        pipeline.consume_mut(stage, position, |envelope| {
            if envelope.exit {
                alive = false;
            } else {
                work(position, envelope);
            }
        });
        if !alive {
            return;
        }
        position += 1;
    }
}

/// consumer loop over shared references, for stage-2 threads that only
/// read the task and mutate their own kind
pub fn consume_shared_loop<T: Default>(
    pipeline: &Pipeline<T>,
    stage: usize,
    mut work: impl FnMut(u64, &Envelope<T>),
) {
    let mut position = 0u64;
    loop {
        let mut alive = true;
        pipeline.consume(stage, position, |envelope| {
            if envelope.exit {
                alive = false;
            } else {
                work(position, envelope);
            }
        });
        if !alive {
            return;
        }
        position += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Task {
        value: u64,
        doubled: u64,
    }

    #[test]
    fn tasks_traverse_stages_in_order() {
        let mut pipeline: Pipeline<Task> = Pipeline::new(4, 2);
        pipeline.add_consumer(0);
        pipeline.add_consumer(1);
        pipeline.validate();
        let results = Mutex::new(vec![]);

        std::thread::scope(|scope| {
            let pipeline = &pipeline;
            let results = &results;
            scope.spawn(move || {
                consume_loop(pipeline, 0, |_, envelope| {
                    envelope.task.doubled = envelope.task.value * 2;
                });
            });
            scope.spawn(move || {
                consume_shared_loop(pipeline, 1, |_, envelope| {
                    results.lock().unwrap().push(envelope.task.doubled);
                });
            });
            let mut position = 0u64;
            for value in 0..100u64 {
                pipeline.produce(position, |task| task.value = value);
                position += 1;
            }
            pipeline.produce_exit(position);
            position += 1;
            pipeline.wait(position);
        });

        let results = results.into_inner().unwrap();
        assert_eq!(results, (0..100).map(|v| v * 2).collect::<Vec<u64>>());
    }

    #[test]
    fn multiple_consumers_all_release_each_slot() {
        let mut pipeline: Pipeline<Task> = Pipeline::new(2, 2);
        pipeline.add_consumer(0);
        pipeline.add_consumer(1);
        pipeline.add_consumer(1);
        pipeline.validate();
        let sum = AtomicU64::new(0);

        std::thread::scope(|scope| {
            let pipeline = &pipeline;
            let sum = &sum;
            scope.spawn(move || {
                consume_loop(pipeline, 0, |_, envelope| {
                    envelope.task.doubled = envelope.task.value;
                });
            });
            for _ in 0..2 {
                scope.spawn(move || {
                    consume_shared_loop(pipeline, 1, |_, envelope| {
                        sum.fetch_add(envelope.task.doubled, Ordering::Relaxed);
                    });
                });
            }
            let mut position = 0u64;
            for value in 1..=50u64 {
                pipeline.produce(position, |task| task.value = value);
                position += 1;
            }
            pipeline.produce_exit(position);
            pipeline.wait(position + 1);
        });

        // both stage-1 consumers saw every task
        assert_eq!(sum.load(Ordering::Relaxed), 2 * (50 * 51) / 2);
    }

    #[test]
    fn producer_blocks_until_consumers_drain() {
        // a slow consumer must not be overrun by a fast producer
        let mut pipeline: Pipeline<Task> = Pipeline::new(1, 1);
        pipeline.add_consumer(0);
        let seen = Mutex::new(vec![]);

        std::thread::scope(|scope| {
            let pipeline = &pipeline;
            let seen = &seen;
            scope.spawn(move || {
                consume_loop(pipeline, 0, |_, envelope| {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    seen.lock().unwrap().push(envelope.task.value);
                });
            });
            let mut position = 0u64;
            for value in 0..20u64 {
                pipeline.produce(position, |task| task.value = value);
                position += 1;
            }
            pipeline.produce_exit(position);
            pipeline.wait(position + 1);
        });

        assert_eq!(seen.into_inner().unwrap(), (0..20).collect::<Vec<u64>>());
    }
}
