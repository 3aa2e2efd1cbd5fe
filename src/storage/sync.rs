//! Replication Sync Engine
//!
//! For every other member of the group an independent sender task tails the
//! local binlog and ships records (plus the referenced file bytes) to the
//! peer over the storage-to-storage command range. Each sender owns its mark
//! file; nothing else writes it. Catch-up for a newly joined peer is the same
//! loop started at the beginning of the binlog instead of the tail.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionPool};
use crate::errors::{FastDFSError, Result};
use crate::protocol::{pad_string, unpad_string};
use crate::storage::binlog::{Binlog, BinlogOp, BinlogReader, BinlogRecord};
use crate::storage::mark::{Mark, MarkFile};
use crate::storage::store::FileStore;
use crate::types::{now_unix, StorageCommand, FDFS_GROUP_NAME_MAX_LEN, FDFS_STORAGE_ID_MAX_SIZE};

/// Tail-poll backoff bounds: EOF polling starts fast and decays
const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_secs(1);

/// Retry backoff bounds for peer errors
const RETRY_MIN: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(10);

/// Seconds between time-driven mark flushes
const MARK_FLUSH_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Sync frame codec
// ---------------------------------------------------------------------------

/// Operation payload of one sync frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    Create { filename: String, data: Bytes },
    Delete { filename: String },
    UpdateMeta { filename: String, meta: Bytes },
    Append { filename: String, data: Bytes },
    Modify { filename: String, offset: u64, data: Bytes },
    Truncate { filename: String, new_size: u64 },
}

/// One storage-to-storage replication frame
///
/// Every body starts `timestamp(8) | source_id(16) | group(16)` so the
/// receiver can write its own binlog record with the original attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFrame {
    pub timestamp: u64,
    pub source_id: String,
    pub group_name: String,
    pub op: SyncOp,
}

const SYNC_COMMON_LEN: usize = 8 + FDFS_STORAGE_ID_MAX_SIZE + FDFS_GROUP_NAME_MAX_LEN;

impl SyncFrame {
    /// The storage command code this frame travels under
    pub fn cmd(&self) -> u8 {
        match self.op {
            SyncOp::Create { .. } => StorageCommand::SyncCreateFile as u8,
            SyncOp::Delete { .. } => StorageCommand::SyncDeleteFile as u8,
            SyncOp::UpdateMeta { .. } => StorageCommand::SyncUpdateFile as u8,
            SyncOp::Append { .. } => StorageCommand::SyncAppendFile as u8,
            SyncOp::Modify { .. } => StorageCommand::SyncModifyFile as u8,
            SyncOp::Truncate { .. } => StorageCommand::SyncTruncateFile as u8,
        }
    }

    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(self.timestamp);
        buf.put(pad_string(&self.source_id, FDFS_STORAGE_ID_MAX_SIZE));
        buf.put(pad_string(&self.group_name, FDFS_GROUP_NAME_MAX_LEN));

        match &self.op {
            SyncOp::Create { filename, data } => {
                buf.put_u64(filename.len() as u64);
                buf.put_u64(data.len() as u64);
                buf.put_slice(filename.as_bytes());
                buf.put_slice(data);
            }
            SyncOp::Delete { filename } => {
                buf.put_slice(filename.as_bytes());
            }
            SyncOp::UpdateMeta { filename, meta } => {
                buf.put_u64(filename.len() as u64);
                buf.put_u64(meta.len() as u64);
                buf.put_slice(filename.as_bytes());
                buf.put_slice(meta);
            }
            SyncOp::Append { filename, data } => {
                buf.put_u64(filename.len() as u64);
                buf.put_u64(data.len() as u64);
                buf.put_slice(filename.as_bytes());
                buf.put_slice(data);
            }
            SyncOp::Modify {
                filename,
                offset,
                data,
            } => {
                buf.put_u64(filename.len() as u64);
                buf.put_u64(*offset);
                buf.put_u64(data.len() as u64);
                buf.put_slice(filename.as_bytes());
                buf.put_slice(data);
            }
            SyncOp::Truncate { filename, new_size } => {
                buf.put_u64(filename.len() as u64);
                buf.put_u64(*new_size);
                buf.put_slice(filename.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Parses a received sync frame
    pub fn decode(cmd: u8, body: &[u8]) -> Result<SyncFrame> {
        if body.len() < SYNC_COMMON_LEN {
            return Err(FastDFSError::InvalidRequest(
                "sync frame too short".to_string(),
            ));
        }
        let mut buf = &body[..];
        let timestamp = buf.get_u64();
        let source_id = unpad_string(&body[8..8 + FDFS_STORAGE_ID_MAX_SIZE]);
        let group_name = unpad_string(&body[8 + FDFS_STORAGE_ID_MAX_SIZE..SYNC_COMMON_LEN]);
        let rest = &body[SYNC_COMMON_LEN..];

        let op = match cmd {
            c if c == StorageCommand::SyncCreateFile as u8 => {
                let (filename, data) = split_len_prefixed_2(rest)?;
                SyncOp::Create { filename, data }
            }
            c if c == StorageCommand::SyncDeleteFile as u8 => {
                let filename = String::from_utf8_lossy(rest).to_string();
                if filename.is_empty() {
                    return Err(FastDFSError::InvalidRequest(
                        "sync delete missing filename".to_string(),
                    ));
                }
                SyncOp::Delete { filename }
            }
            c if c == StorageCommand::SyncUpdateFile as u8 => {
                let (filename, meta) = split_len_prefixed_2(rest)?;
                SyncOp::UpdateMeta { filename, meta }
            }
            c if c == StorageCommand::SyncAppendFile as u8 => {
                let (filename, data) = split_len_prefixed_2(rest)?;
                SyncOp::Append { filename, data }
            }
            c if c == StorageCommand::SyncModifyFile as u8 => {
                if rest.len() < 24 {
                    return Err(FastDFSError::InvalidRequest(
                        "sync modify frame too short".to_string(),
                    ));
                }
                let mut head = &rest[..24];
                let fn_len = head.get_u64() as usize;
                let offset = head.get_u64();
                let data_len = head.get_u64() as usize;
                if rest.len() != 24 + fn_len + data_len {
                    return Err(FastDFSError::InvalidRequest(
                        "sync modify length mismatch".to_string(),
                    ));
                }
                SyncOp::Modify {
                    filename: String::from_utf8_lossy(&rest[24..24 + fn_len]).to_string(),
                    offset,
                    data: Bytes::copy_from_slice(&rest[24 + fn_len..]),
                }
            }
            c if c == StorageCommand::SyncTruncateFile as u8 => {
                if rest.len() < 16 {
                    return Err(FastDFSError::InvalidRequest(
                        "sync truncate frame too short".to_string(),
                    ));
                }
                let mut head = &rest[..16];
                let fn_len = head.get_u64() as usize;
                let new_size = head.get_u64();
                if rest.len() != 16 + fn_len {
                    return Err(FastDFSError::InvalidRequest(
                        "sync truncate length mismatch".to_string(),
                    ));
                }
                SyncOp::Truncate {
                    filename: String::from_utf8_lossy(&rest[16..]).to_string(),
                    new_size,
                }
            }
            other => {
                return Err(FastDFSError::InvalidRequest(format!(
                    "unknown sync command {}",
                    other
                )))
            }
        };

        if timestamp == 0 || source_id.is_empty() || group_name.is_empty() {
            return Err(FastDFSError::InvalidRequest(
                "sync frame missing attribution".to_string(),
            ));
        }

        Ok(SyncFrame {
            timestamp,
            source_id,
            group_name,
            op,
        })
    }
}

/// Splits a `len(8) | len(8) | first | second` tail
fn split_len_prefixed_2(rest: &[u8]) -> Result<(String, Bytes)> {
    if rest.len() < 16 {
        return Err(FastDFSError::InvalidRequest(
            "sync frame too short".to_string(),
        ));
    }
    let mut head = &rest[..16];
    let first_len = head.get_u64() as usize;
    let second_len = head.get_u64() as usize;
    if rest.len() != 16 + first_len + second_len {
        return Err(FastDFSError::InvalidRequest(
            "sync frame length mismatch".to_string(),
        ));
    }
    let first = String::from_utf8_lossy(&rest[16..16 + first_len]).to_string();
    let second = Bytes::copy_from_slice(&rest[16 + first_len..]);
    if first.is_empty() {
        return Err(FastDFSError::InvalidRequest(
            "sync frame missing filename".to_string(),
        ));
    }
    Ok((first, second))
}

// ---------------------------------------------------------------------------
// Per-peer sender
// ---------------------------------------------------------------------------

/// State a sender shares with the heartbeat loop
pub struct PeerProgress {
    /// Highest record timestamp acknowledged by the peer
    pub last_timestamp: AtomicU64,
    /// Watermark the tracker reports for the peer; records at or below it
    /// are already there and are skipped
    pub peer_known_synced: AtomicU64,
}

struct PeerHandle {
    progress: Arc<PeerProgress>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Spawns and stops per-peer senders as group membership changes
pub struct SyncManager {
    group_name: String,
    self_id: String,
    binlog: Arc<Binlog>,
    store: Arc<FileStore>,
    pool: Arc<ConnectionPool>,
    mark_dir: PathBuf,
    storage_port: u16,
    network_timeout: u64,
    mark_flush_records: u64,
    peers: Mutex<HashMap<String, PeerHandle>>,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_name: String,
        self_id: String,
        binlog: Arc<Binlog>,
        store: Arc<FileStore>,
        pool: Arc<ConnectionPool>,
        mark_dir: PathBuf,
        storage_port: u16,
        network_timeout: u64,
        mark_flush_records: u64,
    ) -> Self {
        Self {
            group_name,
            self_id,
            binlog,
            store,
            pool,
            mark_dir,
            storage_port,
            network_timeout,
            mark_flush_records,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a sender exists for `peer_ip`
    ///
    /// `replay_from_start` forces the catch-up mode used when this node is
    /// the elected sync source for a new member: the binlog is replayed from
    /// its origin rather than the saved cursor.
    pub fn ensure_peer(&self, peer_ip: &str, replay_from_start: bool) {
        if peer_ip == self.self_id {
            return;
        }
        let mut peers = self.peers.lock();
        if peers.contains_key(peer_ip) {
            return;
        }

        info!(peer = %peer_ip, replay_from_start, "starting replication sender");
        let progress = Arc::new(PeerProgress {
            last_timestamp: AtomicU64::new(0),
            peer_known_synced: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sender = PeerSender {
            group_name: self.group_name.clone(),
            self_id: self.self_id.clone(),
            peer_id: peer_ip.to_string(),
            peer_addr: format!("{}:{}", peer_ip, self.storage_port),
            binlog: Arc::clone(&self.binlog),
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
            mark_file: MarkFile::new(&self.mark_dir, peer_ip),
            progress: Arc::clone(&progress),
            network_timeout: self.network_timeout,
            mark_flush_records: self.mark_flush_records.max(1),
            replay_from_start,
        };
        let task = tokio::spawn(sender.run(shutdown_rx));

        peers.insert(
            peer_ip.to_string(),
            PeerHandle {
                progress,
                shutdown_tx,
                task,
            },
        );
    }

    /// Stops and forgets the sender for `peer_ip`
    pub fn remove_peer(&self, peer_ip: &str) {
        if let Some(handle) = self.peers.lock().remove(peer_ip) {
            info!(peer = %peer_ip, "stopping replication sender");
            let _ = handle.shutdown_tx.send(true);
            handle.task.abort();
        }
    }

    /// Records the tracker-reported synced watermark for a peer
    pub fn note_peer_synced(&self, peer_ip: &str, timestamp: u64) {
        if let Some(handle) = self.peers.lock().get(peer_ip) {
            let current = handle.progress.peer_known_synced.load(Ordering::Relaxed);
            if timestamp > current {
                handle
                    .progress
                    .peer_known_synced
                    .store(timestamp, Ordering::Relaxed);
            }
        }
    }

    /// `(peer, last acknowledged timestamp)` for the heartbeat sync report
    pub fn progress_report(&self) -> Vec<(String, u64)> {
        let peers = self.peers.lock();
        let mut entries: Vec<(String, u64)> = peers
            .iter()
            .map(|(ip, handle)| (ip.clone(), handle.progress.last_timestamp.load(Ordering::Relaxed)))
            .collect();
        entries.sort();
        entries
    }

    /// The minimum acknowledged timestamp across peers, for shutdown logs
    pub fn min_synced_timestamp(&self) -> u64 {
        self.peers
            .lock()
            .values()
            .map(|h| h.progress.last_timestamp.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
    }

    /// Signals every sender and waits briefly for mark flushes
    pub async fn shutdown(&self) {
        let handles: Vec<PeerHandle> = {
            let mut peers = self.peers.lock();
            peers.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            let _ = handle.shutdown_tx.send(true);
        }
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle.task).await;
        }
    }
}

/// The per-peer sender loop
struct PeerSender {
    group_name: String,
    self_id: String,
    peer_id: String,
    peer_addr: String,
    binlog: Arc<Binlog>,
    store: Arc<FileStore>,
    pool: Arc<ConnectionPool>,
    mark_file: MarkFile,
    progress: Arc<PeerProgress>,
    network_timeout: u64,
    mark_flush_records: u64,
    replay_from_start: bool,
}

impl PeerSender {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let fresh = !self.mark_file.path().exists();
        let mut mark = match self.mark_file.load() {
            Ok(mark) => mark,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "mark file unreadable, starting fresh");
                Mark::default()
            }
        };
        // A brand-new peer normally starts at the tail: history reaches it
        // through its elected sync source. Only that source replays from the
        // origin.
        if fresh && !self.replay_from_start {
            let (index, offset) = self.binlog.position();
            mark.binlog_index = index;
            mark.binlog_offset = offset;
        }
        self.progress
            .last_timestamp
            .store(mark.last_timestamp, Ordering::Relaxed);

        let mut reader = BinlogReader::open(
            self.binlog.dir().to_path_buf(),
            mark.binlog_index,
            mark.binlog_offset,
        );
        let mut conn: Option<Connection> = None;
        let mut poll_delay = POLL_MIN;
        let mut unflushed: u64 = 0;
        let mut flush_timer = tokio::time::interval(Duration::from_secs(MARK_FLUSH_SECS));

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let next = match reader.read_next() {
                Ok(next) => next,
                Err(e) => {
                    warn!(peer = %self.peer_id, error = %e, "binlog read failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_MAX) => continue,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            };

            let record = match next {
                Some(record) => {
                    poll_delay = POLL_MIN;
                    record
                }
                None => {
                    // Tail reached: every existing record is acked, so the
                    // peer is synced through now. The one-second margin
                    // keeps a same-second append from hiding behind the
                    // watermark.
                    let caught_up = now_unix().saturating_sub(1);
                    if caught_up > mark.last_timestamp {
                        mark.last_timestamp = caught_up;
                        self.progress
                            .last_timestamp
                            .store(caught_up, Ordering::Relaxed);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll_delay) => {}
                        _ = flush_timer.tick() => {
                            if unflushed > 0 {
                                self.flush_mark(&mut mark, &reader, &mut unflushed);
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                    poll_delay = (poll_delay * 2).min(POLL_MAX);
                    continue;
                }
            };

            mark.scan_count += 1;

            // Peers never get their own writes echoed back, and records the
            // tracker already confirmed at the peer are not resent.
            let known = self.progress.peer_known_synced.load(Ordering::Relaxed);
            let skip =
                record.source_id == self.peer_id || (known > 0 && record.timestamp <= known);

            if !skip {
                match self.ship(&record, &mut conn, &mut shutdown_rx).await {
                    ShipOutcome::Sent => {
                        mark.sync_count += 1;
                        mark.last_timestamp = mark.last_timestamp.max(record.timestamp);
                        self.progress
                            .last_timestamp
                            .store(mark.last_timestamp, Ordering::Relaxed);
                    }
                    ShipOutcome::Skipped => {}
                    ShipOutcome::Shutdown => break,
                }
            }

            let (index, offset) = reader.position();
            mark.binlog_index = index;
            mark.binlog_offset = offset;
            unflushed += 1;
            if unflushed >= self.mark_flush_records {
                self.flush_mark(&mut mark, &reader, &mut unflushed);
            }
        }

        if let Some(conn) = conn {
            self.pool.put(conn).await;
        }
        let (index, offset) = reader.position();
        mark.binlog_index = index;
        mark.binlog_offset = offset;
        if let Err(e) = self.mark_file.save(&mark) {
            warn!(peer = %self.peer_id, error = %e, "final mark flush failed");
        }
        debug!(peer = %self.peer_id, "replication sender stopped");
    }

    fn flush_mark(&self, mark: &mut Mark, reader: &BinlogReader, unflushed: &mut u64) {
        let (index, offset) = reader.position();
        mark.binlog_index = index;
        mark.binlog_offset = offset;
        if let Err(e) = self.mark_file.save(mark) {
            // The replay cursor can no longer be upheld.
            tracing::error!(peer = %self.peer_id, error = %e, "mark file write failed, aborting");
            std::process::abort();
        }
        *unflushed = 0;
    }

    /// Translates a record into a sync frame and delivers it, retrying
    /// transient failures with bounded exponential backoff
    async fn ship(
        &self,
        record: &BinlogRecord,
        conn: &mut Option<Connection>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> ShipOutcome {
        let frame = match self.build_frame(record) {
            Ok(Some(frame)) => frame,
            Ok(None) => return ShipOutcome::Skipped,
            Err(e) => {
                debug!(peer = %self.peer_id, file = %record.filename, error = %e,
                       "record no longer applicable, skipping");
                return ShipOutcome::Skipped;
            }
        };
        let body = frame.encode_body();

        let mut delay = RETRY_MIN;
        loop {
            if *shutdown_rx.borrow() {
                return ShipOutcome::Shutdown;
            }

            let mut active = match conn.take() {
                Some(active) => active,
                None => match self.pool.get(Some(&self.peer_addr)).await {
                    Ok(active) => active,
                    Err(e) => {
                        debug!(peer = %self.peer_id, error = %e, "peer connect failed, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => return ShipOutcome::Shutdown,
                        }
                        delay = (delay * 2).min(RETRY_MAX);
                        continue;
                    }
                },
            };

            match active.request(frame.cmd(), &body, self.network_timeout).await {
                Ok(_) => {
                    *conn = Some(active);
                    return ShipOutcome::Sent;
                }
                Err(FastDFSError::FileNotFound(_)) => {
                    // Deleting a file the peer never had is harmless.
                    *conn = Some(active);
                    debug!(peer = %self.peer_id, file = %record.filename,
                           "peer reported missing file, advancing");
                    return ShipOutcome::Sent;
                }
                Err(e) if e.is_retryable() => {
                    debug!(peer = %self.peer_id, error = %e, "sync send failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => return ShipOutcome::Shutdown,
                    }
                    delay = (delay * 2).min(RETRY_MAX);
                }
                Err(e) => {
                    warn!(peer = %self.peer_id, file = %record.filename, error = %e,
                          "peer rejected record, advancing past it");
                    return ShipOutcome::Sent;
                }
            }
        }
    }

    /// Builds the wire frame for a record, loading file bytes as needed
    ///
    /// Returns None when the record cannot be materialised any more (the
    /// file was deleted after the record was written); the later delete
    /// record carries the final state.
    fn build_frame(&self, record: &BinlogRecord) -> Result<Option<SyncFrame>> {
        let op = match record.op {
            BinlogOp::Create | BinlogOp::CreateLink => {
                if !self.store.exists(&record.filename) {
                    return Ok(None);
                }
                SyncOp::Create {
                    filename: record.filename.clone(),
                    data: self.store.read(&record.filename, 0, 0)?,
                }
            }
            BinlogOp::Delete | BinlogOp::DeleteLink => SyncOp::Delete {
                filename: record.filename.clone(),
            },
            BinlogOp::UpdateMeta => {
                if !self.store.exists(&record.filename) {
                    return Ok(None);
                }
                SyncOp::UpdateMeta {
                    filename: record.filename.clone(),
                    meta: self.store.raw_metadata(&record.filename)?,
                }
            }
            // Append, modify and truncate replicate the resulting state: the
            // peer replaces its copy with the current bytes. Replaying the
            // delta against an unknown peer state would not converge.
            BinlogOp::Append | BinlogOp::Modify | BinlogOp::Truncate | BinlogOp::Rename => {
                if !self.store.exists(&record.filename) {
                    return Ok(None);
                }
                SyncOp::Create {
                    filename: record.filename.clone(),
                    data: self.store.read(&record.filename, 0, 0)?,
                }
            }
        };

        Ok(Some(SyncFrame {
            timestamp: record.timestamp,
            source_id: record.source_id.clone(),
            group_name: self.group_name.clone(),
            op,
        }))
    }
}

enum ShipOutcome {
    Sent,
    Skipped,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_frame_create_round_trip() {
        let frame = SyncFrame {
            timestamp: 1700000000,
            source_id: "10.0.0.1".to_string(),
            group_name: "group1".to_string(),
            op: SyncOp::Create {
                filename: "M00/00/00/abc.txt".to_string(),
                data: Bytes::from_static(b"Hello, World!"),
            },
        };
        let body = frame.encode_body();
        let decoded = SyncFrame::decode(frame.cmd(), &body).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_sync_frame_delete_round_trip() {
        let frame = SyncFrame {
            timestamp: 42,
            source_id: "10.0.0.2".to_string(),
            group_name: "group1".to_string(),
            op: SyncOp::Delete {
                filename: "M00/00/00/abc.txt".to_string(),
            },
        };
        let body = frame.encode_body();
        assert_eq!(SyncFrame::decode(frame.cmd(), &body).unwrap(), frame);
    }

    #[test]
    fn test_sync_frame_modify_and_truncate_round_trip() {
        let modify = SyncFrame {
            timestamp: 9,
            source_id: "10.0.0.1".to_string(),
            group_name: "group1".to_string(),
            op: SyncOp::Modify {
                filename: "M00/00/00/app.log".to_string(),
                offset: 128,
                data: Bytes::from_static(b"patch"),
            },
        };
        let body = modify.encode_body();
        assert_eq!(SyncFrame::decode(modify.cmd(), &body).unwrap(), modify);

        let truncate = SyncFrame {
            timestamp: 10,
            source_id: "10.0.0.1".to_string(),
            group_name: "group1".to_string(),
            op: SyncOp::Truncate {
                filename: "M00/00/00/app.log".to_string(),
                new_size: 64,
            },
        };
        let body = truncate.encode_body();
        assert_eq!(SyncFrame::decode(truncate.cmd(), &body).unwrap(), truncate);
    }

    #[test]
    fn test_sync_frame_rejects_torn_bodies() {
        let frame = SyncFrame {
            timestamp: 1,
            source_id: "10.0.0.1".to_string(),
            group_name: "group1".to_string(),
            op: SyncOp::Create {
                filename: "M00/00/00/a.txt".to_string(),
                data: Bytes::from_static(b"data"),
            },
        };
        let body = frame.encode_body();
        assert!(SyncFrame::decode(frame.cmd(), &body[..body.len() - 1]).is_err());
        assert!(SyncFrame::decode(frame.cmd(), &body[..10]).is_err());
    }
}
