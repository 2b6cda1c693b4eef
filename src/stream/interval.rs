use super::codec;
use super::files::RecordReader;
use crate::assign::Assignments;
use crate::Error;
use crate::Result;

/// two cursors over the same row file. the unassigned cursor reads the
/// next row not yet given to the chain; the assigned cursor reads the
/// oldest row still in it. both wrap at end of file, so multi-pass
/// inference sees an infinitely repeating corpus.
pub struct StreamInterval {
    unassigned: RecordReader,
    assigned: RecordReader,
}

impl StreamInterval {
    pub fn open(rows_in: &str) -> Result<Self> {
        Ok(Self {
            unassigned: RecordReader::open(rows_in)?,
            assigned: RecordReader::open(rows_in)?,
        })
    }

    pub fn positions(&self) -> (u64, u64) {
        (self.unassigned.position(), self.assigned.position())
    }

    pub fn seek(&mut self, unassigned_pos: u64, assigned_pos: u64) -> Result<()> {
        self.unassigned.seek(unassigned_pos)?;
        self.assigned.seek(assigned_pos)
    }

    pub fn read_unassigned(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        self.unassigned.cyclic_read(buffer)
    }

    pub fn read_assigned(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        self.assigned.cyclic_read(buffer)
    }

    /// the pipeline's unzip stage owns one cursor per thread
    pub fn split_mut(&mut self) -> (&mut RecordReader, &mut RecordReader) {
        (&mut self.unassigned, &mut self.assigned)
    }

    /// place both cursors by streaming and peeking: the unassigned
    /// cursor lands one past the newest assigned row, the assigned
    /// cursor on the oldest assigned row
    pub fn init_from_assignments(&mut self, assignments: &Assignments) -> Result<()> {
        debug_assert!(assignments.row_count() > 0, "nothing to initialize");
        if !self.assigned.is_file() {
            return Err(Error::Parse(
                "only files support resumable stream intervals".to_string(),
            ));
        }
        let newest = *assignments.rowids().back().ok_or(Error::EmptyPop)?;
        let oldest = *assignments.rowids().front().ok_or(Error::EmptyPop)?;
        let mut buffer = vec![];
        loop {
            if !self.unassigned.try_read(&mut buffer)? {
                return Err(Error::Parse(format!("row id not found: {}", newest)));
            }
            if codec::peek_row_id(&buffer)? == newest {
                break;
            }
        }
        let mut peeker = RecordReader::open(self.assigned.name())?;
        let mut unused = vec![];
        loop {
            if !peeker.try_read(&mut buffer)? {
                return Err(Error::Parse(format!("row id not found: {}", oldest)));
            }
            if codec::peek_row_id(&buffer)? == oldest {
                break;
            }
            self.assigned.try_read(&mut unused)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::files::RecordWriter;
    use crate::value::Diff;
    use crate::value::ProductValue;
    use crate::value::Row;

    fn row(id: u64) -> Row {
        Row {
            id,
            diff: Diff::from(ProductValue::default()),
        }
    }

    fn write_rows(path: &str, ids: &[u64]) {
        let mut writer = RecordWriter::create(path).unwrap();
        for id in ids {
            writer.write_record(&codec::encode_row(&row(*id))).unwrap();
        }
        writer.flush().unwrap();
    }

    #[test]
    fn cursors_wrap_independently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows").to_string_lossy().into_owned();
        write_rows(&path, &[0, 1, 2]);
        let mut interval = StreamInterval::open(&path).unwrap();
        let mut buffer = vec![];
        for expected in [0, 1, 2, 0, 1] {
            interval.read_unassigned(&mut buffer).unwrap();
            assert_eq!(codec::peek_row_id(&buffer).unwrap(), expected);
        }
        for expected in [0, 1] {
            interval.read_assigned(&mut buffer).unwrap();
            assert_eq!(codec::peek_row_id(&buffer).unwrap(), expected);
        }
    }

    #[test]
    fn resume_lands_on_the_assigned_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows").to_string_lossy().into_owned();
        write_rows(&path, &[10, 11, 12, 13, 14]);
        // rows 11..=13 are assigned
        let mut assignments = Assignments::default();
        assignments.init(0);
        for id in [11, 12, 13] {
            assignments.push_row(id).unwrap();
        }
        let mut interval = StreamInterval::open(&path).unwrap();
        interval.init_from_assignments(&assignments).unwrap();
        let mut buffer = vec![];
        interval.read_unassigned(&mut buffer).unwrap();
        assert_eq!(codec::peek_row_id(&buffer).unwrap(), 14);
        interval.read_assigned(&mut buffer).unwrap();
        assert_eq!(codec::peek_row_id(&buffer).unwrap(), 11);
    }

    #[test]
    fn positions_survive_a_seek_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows").to_string_lossy().into_owned();
        write_rows(&path, &[0, 1, 2]);
        let mut interval = StreamInterval::open(&path).unwrap();
        let mut buffer = vec![];
        interval.read_unassigned(&mut buffer).unwrap();
        interval.read_unassigned(&mut buffer).unwrap();
        interval.read_assigned(&mut buffer).unwrap();
        let (unassigned_pos, assigned_pos) = interval.positions();

        let mut resumed = StreamInterval::open(&path).unwrap();
        resumed.seek(unassigned_pos, assigned_pos).unwrap();
        resumed.read_unassigned(&mut buffer).unwrap();
        assert_eq!(codec::peek_row_id(&buffer).unwrap(), 2);
        resumed.read_assigned(&mut buffer).unwrap();
        assert_eq!(codec::peek_row_id(&buffer).unwrap(), 1);
    }
}
