use crate::Error;
use crate::Result;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

/// all structured files are a concatenation of length-prefixed records:
/// little-endian u32 length, then that many bytes. "-" denotes stdio.
pub struct RecordWriter {
    out: Box<dyn Write + Send>,
    name: String,
}

impl RecordWriter {
    pub fn create(path: &str) -> Result<Self> {
        let out: Box<dyn Write + Send> = if path == "-" {
            Box::new(BufWriter::new(std::io::stdout()))
        } else {
            let file = File::create(path).map_err(Error::io(path))?;
            Box::new(BufWriter::new(file))
        };
        Ok(Self {
            out,
            name: path.to_string(),
        })
    }

    pub fn write_record(&mut self, bytes: &[u8]) -> Result<()> {
        let len = (bytes.len() as u32).to_le_bytes();
        self.out.write_all(&len).map_err(Error::io(self.name.as_str()))?;
        self.out.write_all(bytes).map_err(Error::io(self.name.as_str()))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(Error::io(self.name.as_str()))
    }
}

enum Input {
    File { reader: BufReader<File>, position: u64 },
    Stdin(BufReader<std::io::Stdin>),
}

pub struct RecordReader {
    input: Input,
    name: String,
}

impl RecordReader {
    pub fn open(path: &str) -> Result<Self> {
        let input = if path == "-" {
            Input::Stdin(BufReader::new(std::io::stdin()))
        } else {
            let file = File::open(path).map_err(Error::io(path))?;
            Input::File {
                reader: BufReader::new(file),
                position: 0,
            }
        };
        Ok(Self {
            input,
            name: path.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_file(&self) -> bool {
        matches!(self.input, Input::File { .. })
    }

    /// byte offset of the next record; files only
    pub fn position(&self) -> u64 {
        match &self.input {
            Input::File { position, .. } => *position,
            Input::Stdin(_) => 0,
        }
    }

    pub fn seek(&mut self, target: u64) -> Result<()> {
        match &mut self.input {
            Input::File { reader, position } => {
                reader
                    .seek(SeekFrom::Start(target))
                    .map_err(Error::io(self.name.as_str()))?;
                *position = target;
                Ok(())
            }
            Input::Stdin(_) => Err(Error::Parse("cannot seek on stdin".to_string())),
        }
    }

    /// read the next record into the buffer; false at end of stream
    pub fn try_read(&mut self, buffer: &mut Vec<u8>) -> Result<bool> {
        let (reader, position): (&mut dyn Read, Option<&mut u64>) = match &mut self.input {
            Input::File { reader, position } => (reader, Some(position)),
            Input::Stdin(reader) => (reader, None),
        };
        let length = match reader.read_u32::<LittleEndian>() {
            Ok(length) => length,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(Error::io(self.name.as_str())(e)),
        };
        buffer.resize(length as usize, 0);
        reader
            .read_exact(buffer)
            .map_err(|e| Error::Parse(format!("{}: truncated record: {}", self.name, e)))?;
        if let Some(position) = position {
            *position += 4 + length as u64;
        }
        Ok(true)
    }

    /// read the next record, wrapping to the start of the file at end of
    /// stream: the driver treats the corpus as infinitely repeating
    pub fn cyclic_read(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        if self.try_read(buffer)? {
            return Ok(());
        }
        self.seek(0)?;
        if self.try_read(buffer)? {
            Ok(())
        } else {
            Err(Error::Parse(format!("{}: empty row stream", self.name)))
        }
    }

    /// scan the whole stream once, counting records
    pub fn count_records(path: &str) -> Result<usize> {
        let mut reader = Self::open(path)?;
        let mut buffer = vec![];
        let mut count = 0;
        while reader.try_read(&mut buffer)? {
            count += 1;
        }
        Ok(count)
    }
}

/// convenience loader for short streams of decodable records
pub fn read_stream<T>(path: &str, decode: impl Fn(&[u8]) -> Result<T>) -> Result<Vec<T>> {
    let mut reader = RecordReader::open(path)?;
    let mut buffer = vec![];
    let mut records = vec![];
    while reader.try_read(&mut buffer)? {
        records.push(decode(&buffer)?);
    }
    Ok(records)
}

/// ensure the parent directory of a path exists
pub fn create_parent_dirs(path: &str) -> Result<()> {
    if path == "-" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(Error::io(path))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_with_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records").to_string_lossy().into_owned();
        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write_record(b"alpha").unwrap();
        writer.write_record(b"").unwrap();
        writer.write_record(b"omega").unwrap();
        writer.flush().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let mut buffer = vec![];
        assert!(reader.try_read(&mut buffer).unwrap());
        assert_eq!(buffer, b"alpha");
        let second = reader.position();
        assert!(reader.try_read(&mut buffer).unwrap());
        assert_eq!(buffer, b"");
        assert!(reader.try_read(&mut buffer).unwrap());
        assert_eq!(buffer, b"omega");
        assert!(!reader.try_read(&mut buffer).unwrap());

        reader.seek(second).unwrap();
        assert!(reader.try_read(&mut buffer).unwrap());
        assert_eq!(buffer, b"");
    }

    #[test]
    fn cyclic_reads_wrap_around() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle").to_string_lossy().into_owned();
        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write_record(b"one").unwrap();
        writer.write_record(b"two").unwrap();
        writer.flush().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let mut buffer = vec![];
        for expected in [&b"one"[..], b"two", b"one", b"two", b"one"] {
            reader.cyclic_read(&mut buffer).unwrap();
            assert_eq!(buffer, expected);
        }
    }

    #[test]
    fn truncated_records_fail_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad").to_string_lossy().into_owned();
        std::fs::write(&path, 100u32.to_le_bytes()).unwrap();
        let mut reader = RecordReader::open(&path).unwrap();
        let mut buffer = vec![];
        assert!(matches!(
            reader.try_read(&mut buffer),
            Err(Error::Parse(_))
        ));
    }
}
