//! Binlog
//!
//! Append-only log of every mutation at a storage node, used as the
//! replication transport. Records are fixed-format text lines so the file can
//! be appended in place and tailed across crashes; a torn final line is
//! simply not yet visible to readers.
//!
//! Record line: `<10-digit timestamp> <op> <source-id> <filename>`

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{FastDFSError, Result};

/// Binlog files rotate once they exceed this size
pub const BINLOG_ROTATE_SIZE: u64 = 256 * 1024 * 1024;

/// Mutation kinds recorded in the binlog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogOp {
    Create,
    Delete,
    UpdateMeta,
    Append,
    Modify,
    Truncate,
    CreateLink,
    DeleteLink,
    Rename,
}

impl BinlogOp {
    pub fn as_char(self) -> char {
        match self {
            BinlogOp::Create => 'C',
            BinlogOp::Delete => 'D',
            BinlogOp::UpdateMeta => 'U',
            BinlogOp::Append => 'A',
            BinlogOp::Modify => 'M',
            BinlogOp::Truncate => 'T',
            BinlogOp::CreateLink => 'L',
            BinlogOp::DeleteLink => 'X',
            BinlogOp::Rename => 'R',
        }
    }

    pub fn from_char(c: char) -> Option<BinlogOp> {
        match c {
            'C' => Some(BinlogOp::Create),
            'D' => Some(BinlogOp::Delete),
            'U' => Some(BinlogOp::UpdateMeta),
            'A' => Some(BinlogOp::Append),
            'M' => Some(BinlogOp::Modify),
            'T' => Some(BinlogOp::Truncate),
            'L' => Some(BinlogOp::CreateLink),
            'X' => Some(BinlogOp::DeleteLink),
            'R' => Some(BinlogOp::Rename),
            _ => None,
        }
    }
}

/// One binlog record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogRecord {
    /// Seconds since the epoch; non-decreasing within one node
    pub timestamp: u64,
    pub op: BinlogOp,
    /// Identity of the node where the mutation originated
    pub source_id: String,
    /// Remote filename the mutation applies to
    pub filename: String,
}

impl BinlogRecord {
    pub fn format_line(&self) -> String {
        format!(
            "{:010} {} {} {}\n",
            self.timestamp,
            self.op.as_char(),
            self.source_id,
            self.filename
        )
    }

    pub fn parse_line(line: &str) -> Result<BinlogRecord> {
        let mut parts = line.trim_end_matches('\n').splitn(4, ' ');
        let (ts, op, source, filename) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => {
                return Err(FastDFSError::InvalidArgument(format!(
                    "malformed binlog line: {:?}",
                    line
                )))
            }
        };

        let timestamp: u64 = ts.parse().map_err(|_| {
            FastDFSError::InvalidArgument(format!("malformed binlog timestamp: {:?}", ts))
        })?;
        let op = op
            .chars()
            .next()
            .and_then(BinlogOp::from_char)
            .ok_or_else(|| {
                FastDFSError::InvalidArgument(format!("unknown binlog op: {:?}", op))
            })?;
        if source.is_empty() || filename.is_empty() {
            return Err(FastDFSError::InvalidArgument(format!(
                "malformed binlog line: {:?}",
                line
            )));
        }

        Ok(BinlogRecord {
            timestamp,
            op,
            source_id: source.to_string(),
            filename: filename.to_string(),
        })
    }
}

fn binlog_file_name(index: u32) -> String {
    format!("binlog.{:03}", index)
}

fn binlog_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(binlog_file_name(index))
}

struct Writer {
    file: File,
    index: u32,
    written: u64,
    dirty: bool,
}

/// The append side of the binlog
///
/// A single mutex serialises appends; readers never take it because they use
/// their own file handles and positional reads.
pub struct Binlog {
    dir: PathBuf,
    rotate_size: u64,
    writer: Mutex<Writer>,
}

impl Binlog {
    /// Opens the binlog directory, continuing the highest existing file
    pub fn open(dir: impl Into<PathBuf>) -> Result<Binlog> {
        Self::open_with_rotate_size(dir, BINLOG_ROTATE_SIZE)
    }

    pub fn open_with_rotate_size(dir: impl Into<PathBuf>, rotate_size: u64) -> Result<Binlog> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index = Self::highest_index(&dir)?.unwrap_or(0);
        let path = binlog_path(&dir, index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Binlog {
            dir,
            rotate_size,
            writer: Mutex::new(Writer {
                file,
                index,
                written,
                dirty: false,
            }),
        })
    }

    fn highest_index(dir: &Path) -> Result<Option<u32>> {
        let mut highest = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(num) = name.strip_prefix("binlog.") {
                    if let Ok(index) = num.parse::<u32>() {
                        highest = Some(highest.map_or(index, |h: u32| h.max(index)));
                    }
                }
            }
        }
        Ok(highest)
    }

    /// Appends one record and pushes it to the OS before returning
    ///
    /// The caller replies to its client only after this returns, which keeps
    /// the file-exists/record-exists pairing crash-consistent.
    pub fn append(&self, record: &BinlogRecord) -> Result<()> {
        let line = record.format_line();
        let mut writer = self.writer.lock();

        if writer.written >= self.rotate_size {
            let next = writer.index + 1;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(binlog_path(&self.dir, next))?;
            writer.file.sync_data()?;
            writer.file = file;
            writer.index = next;
            writer.written = 0;
        }

        writer.file.write_all(line.as_bytes())?;
        writer.file.flush()?;
        writer.written += line.len() as u64;
        writer.dirty = true;
        Ok(())
    }

    /// Forces appended records to stable storage
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.dirty {
            writer.file.sync_data()?;
            writer.dirty = false;
        }
        Ok(())
    }

    /// Current append position as `(file index, byte offset)`
    pub fn position(&self) -> (u32, u64) {
        let writer = self.writer.lock();
        (writer.index, writer.written)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens a tail reader at the given cursor
    pub fn reader_at(&self, index: u32, offset: u64) -> BinlogReader {
        BinlogReader {
            dir: self.dir.clone(),
            index,
            offset,
            file: None,
        }
    }
}

/// A positional reader tailing the binlog
///
/// Readers stop at the last complete line; a record whose newline has not
/// reached the file yet is invisible until the next poll. When a file is
/// exhausted and a successor exists, the reader rolls forward.
pub struct BinlogReader {
    dir: PathBuf,
    index: u32,
    offset: u64,
    file: Option<File>,
}

impl BinlogReader {
    /// Opens a standalone reader (no Binlog handle needed)
    pub fn open(dir: impl Into<PathBuf>, index: u32, offset: u64) -> BinlogReader {
        BinlogReader {
            dir: dir.into(),
            index,
            offset,
            file: None,
        }
    }

    /// Cursor as `(file index, byte offset)` of the next unread byte
    pub fn position(&self) -> (u32, u64) {
        (self.index, self.offset)
    }

    fn ensure_file(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        let path = binlog_path(&self.dir, self.index);
        match File::open(&path) {
            Ok(file) => {
                self.file = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FastDFSError::Io(e)),
        }
    }

    /// Reads the next complete record, or None when the tail is reached
    pub fn read_next(&mut self) -> Result<Option<BinlogRecord>> {
        loop {
            if !self.ensure_file()? {
                return Ok(None);
            }

            let file = match self.file.as_mut() {
                Some(file) => file,
                None => return Ok(None),
            };
            file.seek(SeekFrom::Start(self.offset))?;

            let mut buf = Vec::with_capacity(256);
            let mut chunk = [0u8; 256];
            let newline_at = loop {
                let n = file.read(&mut chunk)?;
                if n == 0 {
                    break None;
                }
                let start = buf.len();
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
                    break Some(start + pos);
                }
            };

            match newline_at {
                Some(pos) => {
                    let line = std::str::from_utf8(&buf[..pos]).map_err(|_| {
                        FastDFSError::InvalidArgument("binlog line not utf-8".to_string())
                    })?;
                    let record = BinlogRecord::parse_line(line)?;
                    self.offset += pos as u64 + 1;
                    return Ok(Some(record));
                }
                None => {
                    // End of this file; roll to the successor if it exists,
                    // abandoning any torn trailing bytes.
                    if binlog_path(&self.dir, self.index + 1).exists() && buf.is_empty() {
                        self.index += 1;
                        self.offset = 0;
                        self.file = None;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u64, op: BinlogOp, source: &str, name: &str) -> BinlogRecord {
        BinlogRecord {
            timestamp: ts,
            op,
            source_id: source.to_string(),
            filename: name.to_string(),
        }
    }

    #[test]
    fn test_record_line_round_trip() {
        let rec = record(1700000000, BinlogOp::Create, "10.0.0.1", "M00/00/1f/abc.txt");
        let line = rec.format_line();
        assert!(line.ends_with('\n'));
        assert_eq!(BinlogRecord::parse_line(&line).unwrap(), rec);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BinlogRecord::parse_line("not a record").is_err());
        assert!(BinlogRecord::parse_line("0000000001 ? src file").is_err());
        assert!(BinlogRecord::parse_line("abc C src file").is_err());
    }

    #[test]
    fn test_append_then_tail() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = Binlog::open(dir.path()).unwrap();

        let first = record(100, BinlogOp::Create, "10.0.0.1", "M00/00/00/a.txt");
        let second = record(101, BinlogOp::Delete, "10.0.0.2", "M00/00/00/a.txt");
        binlog.append(&first).unwrap();
        binlog.append(&second).unwrap();

        let mut reader = binlog.reader_at(0, 0);
        assert_eq!(reader.read_next().unwrap(), Some(first));
        assert_eq!(reader.read_next().unwrap(), Some(second));
        assert_eq!(reader.read_next().unwrap(), None);

        // New appends become visible on the next poll.
        let third = record(102, BinlogOp::Append, "10.0.0.1", "M00/00/00/b.txt");
        binlog.append(&third).unwrap();
        assert_eq!(reader.read_next().unwrap(), Some(third));
    }

    #[test]
    fn test_torn_trailing_line_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = Binlog::open(dir.path()).unwrap();
        binlog
            .append(&record(100, BinlogOp::Create, "10.0.0.1", "M00/00/00/a.txt"))
            .unwrap();

        // Simulate a torn append: bytes present but no newline yet.
        let path = dir.path().join("binlog.000");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"0000000101 C 10.0.0.1 M00/00").unwrap();

        let mut reader = binlog.reader_at(0, 0);
        assert!(reader.read_next().unwrap().is_some());
        assert_eq!(reader.read_next().unwrap(), None);

        // Completing the line makes the record visible.
        file.write_all(b"/00/b.txt\n").unwrap();
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.filename, "M00/00/00/b.txt");
    }

    #[test]
    fn test_rotation_and_cross_file_read() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny rotate size: every record lands in its own file.
        let binlog = Binlog::open_with_rotate_size(dir.path(), 1).unwrap();

        for i in 0..3 {
            binlog
                .append(&record(
                    100 + i,
                    BinlogOp::Create,
                    "10.0.0.1",
                    &format!("M00/00/00/f{}.txt", i),
                ))
                .unwrap();
        }
        assert_eq!(binlog.position().0, 2);

        let mut reader = binlog.reader_at(0, 0);
        let mut names = Vec::new();
        while let Some(rec) = reader.read_next().unwrap() {
            names.push(rec.filename);
        }
        assert_eq!(
            names,
            vec!["M00/00/00/f0.txt", "M00/00/00/f1.txt", "M00/00/00/f2.txt"]
        );
    }

    #[test]
    fn test_reopen_continues_highest_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let binlog = Binlog::open_with_rotate_size(dir.path(), 1).unwrap();
            binlog
                .append(&record(100, BinlogOp::Create, "s", "M00/00/00/a.txt"))
                .unwrap();
            binlog
                .append(&record(101, BinlogOp::Create, "s", "M00/00/00/b.txt"))
                .unwrap();
        }

        let binlog = Binlog::open_with_rotate_size(dir.path(), 1).unwrap();
        let (index, _) = binlog.position();
        assert_eq!(index, 1);

        binlog
            .append(&record(102, BinlogOp::Create, "s", "M00/00/00/c.txt"))
            .unwrap();
        let mut reader = binlog.reader_at(0, 0);
        let mut count = 0;
        while reader.read_next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
