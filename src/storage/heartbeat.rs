//! Tracker Heartbeat Client
//!
//! The storage side of the control channel: join every configured tracker at
//! startup, then beat on a fixed cadence, absorbing peer-status diffs from
//! the replies and keeping the replication senders in step with group
//! membership. Disk usage and per-peer sync progress ride a slower cadence.

use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionPool;
use crate::errors::Result;
use crate::protocol::*;
use crate::storage::server::StorageServer;
use crate::types::*;

/// Spawns the heartbeat task for a storage server
pub fn spawn(server: Arc<StorageServer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task = HeartbeatTask::new(server);
        task.run().await;
    })
}

struct HeartbeatTask {
    server: Arc<StorageServer>,
    pool: ConnectionPool,
    last_report: parking_lot::Mutex<Option<StatReport>>,
}

impl HeartbeatTask {
    fn new(server: Arc<StorageServer>) -> Self {
        let pool = ConnectionPool::new(
            server.config.tracker_servers.clone(),
            2,
            Duration::from_millis(server.config.connect_timeout),
            Duration::from_millis(server.config.connection_pool_max_idle_time),
        );
        Self {
            server,
            pool,
            last_report: parking_lot::Mutex::new(None),
        }
    }

    /// Identity prefix every storage control command carries
    fn prefix(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE);
        buf.put(pad_string(
            &self.server.config.group_name,
            FDFS_GROUP_NAME_MAX_LEN,
        ));
        buf.put(pad_string(
            &self.server.config.advertised_ip,
            IP_ADDRESS_SIZE,
        ));
        buf
    }

    async fn run(self) {
        let mut shutdown_rx = self.server.shutdown_tx.subscribe();

        // Join first: retry until one tracker accepts.
        loop {
            match self.join_cluster().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "join failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                }
            }
        }

        let beat_every = Duration::from_secs(self.server.config.heart_beat_interval.max(1));
        let report_every = Duration::from_secs(self.server.config.stat_report_interval.max(1));
        let mut beat_tick = tokio::time::interval(beat_every);
        let mut report_tick = tokio::time::interval(report_every);

        loop {
            tokio::select! {
                _ = beat_tick.tick() => {
                    self.beat_all().await;
                }
                _ = report_tick.tick() => {
                    self.report_all().await;
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        self.pool.close().await;
    }

    /// Sends STORAGE_JOIN to every tracker; at least one must accept
    async fn join_cluster(&self) -> Result<()> {
        let config = &self.server.config;
        let req = JoinRequest {
            group_name: config.group_name.clone(),
            ip_addr: config.advertised_ip.clone(),
            port: config.port,
            http_port: config.http_port,
            store_path_count: config.store_path_count(),
            subdir_count_per_path: config.subdir_count_per_path,
            upload_priority: config.upload_priority,
            join_time: now_unix(),
            up_time: now_unix(),
            version: crate::FDFS_VERSION.to_string(),
            domain_name: config.domain_name.clone(),
            init_flag: true,
            status: StorageStatus::Init,
        };
        let body = encode_join_request(&req);

        let mut joined = false;
        let mut last_err = None;
        for tracker in &config.tracker_servers {
            match self.request(tracker, TrackerCommand::StorageJoin as u8, &body).await {
                Ok(reply) => {
                    joined = true;
                    match decode_sync_source(&reply)? {
                        Some(src) => {
                            info!(source = %src.ip_addr, until = src.until_timestamp,
                                  "joined group, catching up from sync source");
                        }
                        None => {
                            info!("joined group as first member");
                        }
                    }
                }
                Err(e) => {
                    debug!(tracker = %tracker, error = %e, "join attempt failed");
                    last_err = Some(e);
                }
            }
        }

        if joined {
            Ok(())
        } else {
            Err(last_err.unwrap_or(crate::errors::FastDFSError::NoStorageServer))
        }
    }

    /// One heartbeat round against every tracker
    async fn beat_all(&self) {
        let report = self.server.stat.report(
            self.server.store.total_mb(),
            self.server.store.free_mb(),
            self.server.sync.min_synced_timestamp(),
        );
        // The stats block rides along only when something changed.
        let body = {
            let mut last = self.last_report.lock();
            let mut body = self.prefix();
            if last.as_ref() != Some(&report) {
                body.put(encode_stat_report(&report));
                *last = Some(report);
            }
            body.freeze()
        };

        for tracker in &self.server.config.tracker_servers {
            match self
                .request(tracker, TrackerCommand::StorageBeat as u8, &body)
                .await
            {
                Ok(reply) => match decode_peer_changes(&reply) {
                    Ok(changes) => self.apply_peer_changes(tracker, &changes).await,
                    Err(e) => warn!(tracker = %tracker, error = %e, "bad beat reply"),
                },
                Err(e) => {
                    debug!(tracker = %tracker, error = %e, "beat failed");
                }
            }
        }
    }

    /// Reacts to the peer-status diff in a beat reply
    async fn apply_peer_changes(&self, tracker: &str, changes: &[PeerChange]) {
        for change in changes {
            if change.ip_addr == self.server.config.advertised_ip {
                continue;
            }
            match change.status {
                StorageStatus::Deleted | StorageStatus::IpChanged => {
                    self.server.sync.remove_peer(&change.ip_addr);
                }
                StorageStatus::WaitSync => {
                    // A brand-new member: the tracker may have elected us as
                    // its sync source, in which case history replays from the
                    // binlog origin.
                    let replay = self
                        .is_sync_source_for(tracker, &change.ip_addr)
                        .await
                        .unwrap_or(false);
                    self.server.sync.ensure_peer(&change.ip_addr, replay);
                }
                status if status.is_serving() => {
                    self.server.sync.ensure_peer(&change.ip_addr, false);
                }
                _ => {
                    // OFFLINE peers keep their sender; it backs off until the
                    // peer returns.
                }
            }
        }
    }

    /// Asks the tracker whether this node is `dest`'s elected sync source
    async fn is_sync_source_for(&self, tracker: &str, dest: &str) -> Result<bool> {
        let mut body = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE);
        body.put(pad_string(
            &self.server.config.group_name,
            FDFS_GROUP_NAME_MAX_LEN,
        ));
        body.put(pad_string(dest, IP_ADDRESS_SIZE));
        let reply = self
            .request(tracker, TrackerCommand::StorageSyncSrcReq as u8, &body)
            .await?;
        Ok(decode_sync_source(&reply)?
            .map(|src| src.ip_addr == self.server.config.advertised_ip)
            .unwrap_or(false))
    }

    /// The slow cadence: disk usage, sync progress, peer watermarks
    async fn report_all(&self) {
        let usage = self.server.store.disk_usage();
        let mut usage_body = self.prefix();
        usage_body.put(encode_disk_usage(&usage));
        let usage_body = usage_body.freeze();

        let progress = self.server.sync.progress_report();
        let mut sync_body = self.prefix();
        sync_body.put(encode_sync_report(&progress));
        let sync_body = sync_body.freeze();

        for tracker in &self.server.config.tracker_servers {
            if let Err(e) = self
                .request(tracker, TrackerCommand::StorageReportDiskUsage as u8, &usage_body)
                .await
            {
                debug!(tracker = %tracker, error = %e, "disk usage report failed");
            }
            if !progress.is_empty() {
                if let Err(e) = self
                    .request(tracker, TrackerCommand::StorageSyncReport as u8, &sync_body)
                    .await
                {
                    debug!(tracker = %tracker, error = %e, "sync report failed");
                }
            }

            // Pull each peer's confirmed watermark so senders can skip
            // records the whole group already holds.
            for (peer, _) in &progress {
                let mut body = BytesMut::new();
                body.put(pad_string(
                    &self.server.config.group_name,
                    FDFS_GROUP_NAME_MAX_LEN,
                ));
                body.put(pad_string(peer, IP_ADDRESS_SIZE));
                match self
                    .request(tracker, TrackerCommand::StorageSyncTimestamp as u8, &body)
                    .await
                {
                    Ok(reply) => {
                        if let Ok(entries) = decode_sync_report(&reply) {
                            if let Some(min) = entries.iter().map(|(_, ts)| *ts).min() {
                                self.server.sync.note_peer_synced(peer, min);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(tracker = %tracker, peer = %peer, error = %e,
                               "sync timestamp query failed");
                    }
                }
            }
        }
    }

    async fn request(&self, tracker: &str, cmd: u8, body: &[u8]) -> Result<bytes::Bytes> {
        let mut conn = self.pool.get(Some(tracker)).await?;
        let result = conn
            .request(cmd, body, self.server.config.network_timeout)
            .await;
        if result.is_ok() {
            self.pool.put(conn).await;
        }
        result
    }
}
