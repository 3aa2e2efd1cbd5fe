//! Mark Files
//!
//! One cursor file per `(local node, peer)` pair recording how much of the
//! local binlog has been shipped to that peer. Written atomically via a
//! temporary sibling so a crash never leaves a torn cursor; losing the last
//! few acknowledged records only causes idempotent re-sends.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{FastDFSError, Result};

/// Cursor state for one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mark {
    /// Binlog file index the next read starts in
    pub binlog_index: u32,
    /// Byte offset of the next unread record
    pub binlog_offset: u64,
    /// Highest record timestamp acknowledged by the peer
    pub last_timestamp: u64,
    /// Records examined since the cursor was created
    pub scan_count: u64,
    /// Records actually shipped to the peer
    pub sync_count: u64,
}

/// The on-disk home of one peer's cursor
pub struct MarkFile {
    path: PathBuf,
}

impl MarkFile {
    /// Cursor file for `peer_id` under `dir` (usually `<base>/mark`)
    pub fn new(dir: impl AsRef<Path>, peer_id: &str) -> MarkFile {
        MarkFile {
            path: dir.as_ref().join(format!("{}.mark", peer_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the cursor; a missing file is a fresh cursor at the origin
    pub fn load(&self) -> Result<Mark> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Mark::default());
            }
            Err(e) => return Err(FastDFSError::Io(e)),
        };

        let mut mark = Mark::default();
        for line in content.lines() {
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let value: u64 = value.parse().map_err(|_| {
                FastDFSError::InvalidArgument(format!(
                    "malformed mark entry in {}: {:?}",
                    self.path.display(),
                    line
                ))
            })?;
            match key {
                "binlog_index" => mark.binlog_index = value as u32,
                "binlog_offset" => mark.binlog_offset = value,
                "last_timestamp" => mark.last_timestamp = value,
                "scan_count" => mark.scan_count = value,
                "sync_count" => mark.sync_count = value,
                _ => {}
            }
        }
        Ok(mark)
    }

    /// Persists the cursor with write-then-rename
    pub fn save(&self, mark: &Mark) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = format!(
            "binlog_index={}\nbinlog_offset={}\nlast_timestamp={}\nscan_count={}\nsync_count={}\n",
            mark.binlog_index,
            mark.binlog_offset,
            mark.last_timestamp,
            mark.scan_count,
            mark.sync_count,
        );

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_fresh_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mark_file = MarkFile::new(dir.path(), "10.0.0.2");
        assert_eq!(mark_file.load().unwrap(), Mark::default());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mark_file = MarkFile::new(dir.path().join("mark"), "10.0.0.2");

        let mark = Mark {
            binlog_index: 3,
            binlog_offset: 4096,
            last_timestamp: 1700000000,
            scan_count: 120,
            sync_count: 118,
        };
        mark_file.save(&mark).unwrap();
        assert_eq!(mark_file.load().unwrap(), mark);

        // Overwrite keeps only the latest cursor.
        let newer = Mark {
            binlog_offset: 8192,
            ..mark
        };
        mark_file.save(&newer).unwrap();
        assert_eq!(mark_file.load().unwrap(), newer);
    }

    #[test]
    fn test_malformed_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mark_file = MarkFile::new(dir.path(), "peer");
        fs::write(mark_file.path(), "binlog_offset=not-a-number\n").unwrap();
        assert!(mark_file.load().is_err());
    }
}
