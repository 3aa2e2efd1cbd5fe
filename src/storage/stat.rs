//! Storage Statistics
//!
//! Per-category operation counters and the source/sync update timestamps a
//! storage server reports in its heartbeats. Persisted to `storage_stat.dat`
//! on a timer and at shutdown so counters survive restarts.

use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{FastDFSError, Result};
use crate::types::{now_unix, OpCategory, StatReport, StorageCounters};

pub const STAT_FILE: &str = "storage_stat.dat";

/// Tracks the counters and update timestamps of one storage server
pub struct StatTracker {
    path: PathBuf,
    counters: Mutex<StorageCounters>,
    last_source_update: AtomicU64,
    last_sync_update: AtomicU64,
}

impl StatTracker {
    /// Opens the tracker, restoring persisted counters if present
    pub fn open(base_path: impl AsRef<Path>) -> Result<StatTracker> {
        let path = base_path.as_ref().join(STAT_FILE);
        let tracker = StatTracker {
            path,
            counters: Mutex::new(StorageCounters::default()),
            last_source_update: AtomicU64::new(0),
            last_sync_update: AtomicU64::new(0),
        };
        tracker.load()?;
        Ok(tracker)
    }

    /// Counts one operation outcome
    pub fn record(&self, category: OpCategory, success: bool) {
        let mut counters = self.counters.lock();
        counters.totals[category as usize] += 1;
        if success {
            counters.successes[category as usize] += 1;
        }
    }

    /// Stamps a client-originated mutation
    pub fn mark_source_update(&self) {
        self.last_source_update.store(now_unix(), Ordering::Release);
    }

    /// Stamps a replication-originated mutation
    pub fn mark_sync_update(&self) {
        self.last_sync_update.store(now_unix(), Ordering::Release);
    }

    pub fn last_source_update(&self) -> u64 {
        self.last_source_update.load(Ordering::Acquire)
    }

    pub fn last_sync_update(&self) -> u64 {
        self.last_sync_update.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> StorageCounters {
        *self.counters.lock()
    }

    /// Assembles the heartbeat statistics block
    pub fn report(&self, total_mb: u64, free_mb: u64, last_synced_timestamp: u64) -> StatReport {
        StatReport {
            total_mb,
            free_mb,
            last_source_update: self.last_source_update(),
            last_sync_update: self.last_sync_update(),
            last_synced_timestamp,
            counters: self.counters(),
        }
    }

    fn load(&self) -> Result<()> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FastDFSError::Io(e)),
        };

        let mut counters = self.counters.lock();
        for line in content.lines() {
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let value: u64 = value.parse().map_err(|_| {
                FastDFSError::InvalidArgument(format!("malformed stat entry: {:?}", line))
            })?;
            match key {
                "last_source_update" => {
                    self.last_source_update.store(value, Ordering::Relaxed)
                }
                "last_sync_update" => self.last_sync_update.store(value, Ordering::Relaxed),
                _ => {
                    if let Some((name, kind)) = key.rsplit_once('_') {
                        if let Some(idx) = category_index(name) {
                            match kind {
                                "total" => counters.totals[idx] = value,
                                "success" => counters.successes[idx] = value,
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Persists counters with write-then-rename
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let counters = self.counters();
        let mut content = String::new();
        content.push_str(&format!(
            "last_source_update={}\nlast_sync_update={}\n",
            self.last_source_update(),
            self.last_sync_update()
        ));
        for (idx, name) in CATEGORY_NAMES.iter().enumerate() {
            content.push_str(&format!(
                "{}_total={}\n{}_success={}\n",
                name, counters.totals[idx], name, counters.successes[idx]
            ));
        }

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

const CATEGORY_NAMES: [&str; 10] = [
    "upload",
    "download",
    "delete",
    "set_meta",
    "get_meta",
    "append",
    "modify",
    "truncate",
    "create_link",
    "delete_link",
];

fn category_index(name: &str) -> Option<usize> {
    CATEGORY_NAMES.iter().position(|n| *n == name)
}
