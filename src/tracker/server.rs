//! Tracker Server
//!
//! Accepts framed requests from clients, storage servers and peer trackers,
//! dispatches them against the registry, and runs the maintenance loops:
//! offline sweep, leader election and snapshot flushing.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::errors::{error_to_status, FastDFSError, Result, STATUS_EBUSY, STATUS_OK};
use crate::protocol::*;
use crate::tracker::leader::TrackerCluster;
use crate::tracker::registry::Registry;
use crate::tracker::select::StoreSelector;
use crate::tracker::snapshot;
use crate::types::*;

/// The tracker daemon
pub struct TrackerServer {
    config: TrackerConfig,
    registry: Arc<Registry>,
    selector: StoreSelector,
    cluster: Arc<TrackerCluster>,
    conn_count: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl TrackerServer {
    /// Builds the server, restoring the registry from snapshot files
    pub fn new(config: TrackerConfig) -> Result<Arc<Self>> {
        let registry = Arc::new(Registry::new(
            config.check_active_interval,
            config.startup_grace,
        ));
        snapshot::load(&registry, &config.base_path)?;

        let self_addr = format!("{}:{}", config.bind_addr, config.port);
        let cluster = Arc::new(TrackerCluster::new(
            config.tracker_peers.clone(),
            self_addr,
            config.connect_timeout,
            config.network_timeout,
        ));

        let (shutdown_tx, _) = watch::channel(false);
        let selector = StoreSelector::new(&config);

        Ok(Arc::new(Self {
            config,
            registry,
            selector,
            cluster,
            conn_count: AtomicUsize::new(0),
            shutdown_tx,
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Binds the listener, spawns the accept loop and maintenance tasks, and
    /// returns the bound address
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let bind = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "tracker listening");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.maintenance_loop().await;
        });

        Ok(local_addr)
    }

    /// Signals every task to stop and flushes a final snapshot
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = snapshot::save(&self.registry, &self.config.base_path) {
            error!(error = %e, "final tracker snapshot failed");
        }
        self.cluster.close().await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if self.conn_count.load(Ordering::Relaxed)
                                >= self.config.max_connections
                            {
                                self.reject_busy(stream, peer).await;
                                continue;
                            }
                            self.conn_count.fetch_add(1, Ordering::Relaxed);
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!(peer = %peer, error = %e, "tracker connection closed");
                                }
                                server.conn_count.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "tracker accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn reject_busy(&self, mut stream: TcpStream, peer: SocketAddr) {
        warn!(peer = %peer, "connection cap reached, rejecting");
        let _ = write_frame(
            &mut stream,
            FDFS_PROTO_CMD_RESP,
            STATUS_EBUSY,
            &[],
            self.config.network_timeout,
        )
        .await;
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.check_active_interval.max(1),
        ));
        let mut snap = tokio::time::interval(Duration::from_secs(
            self.config.snapshot_interval.max(1),
        ));

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let marked = self.registry.sweep_offline();
                    if marked > 0 {
                        info!(marked, "storage servers marked offline");
                    }
                    if let Err(e) = self.cluster.elect().await {
                        debug!(error = %e, "election round failed");
                    }
                }
                _ = snap.tick() => {
                    if let Err(e) = snapshot::save(&self.registry, &self.config.base_path) {
                        error!(error = %e, "tracker snapshot failed");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    /// One connection: read frames until QUIT, EOF or error
    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        loop {
            let header = read_header(&mut stream, self.config.network_timeout).await?;
            if header.length > FDFS_MAX_BODY_SIZE {
                return Err(FastDFSError::InvalidRequest(format!(
                    "body of {} bytes exceeds cap",
                    header.length
                )));
            }
            let body =
                read_body(&mut stream, header.length as usize, self.config.network_timeout)
                    .await?;

            if header.cmd == FDFS_PROTO_CMD_QUIT {
                return Ok(());
            }
            if header.cmd == FDFS_PROTO_CMD_ACTIVE_TEST {
                write_frame(
                    &mut stream,
                    FDFS_PROTO_CMD_RESP,
                    STATUS_OK,
                    &[],
                    self.config.network_timeout,
                )
                .await?;
                continue;
            }

            let (status, reply) = match self.dispatch(header.cmd, &body) {
                Ok(reply) => (STATUS_OK, reply),
                Err(e) => {
                    debug!(cmd = header.cmd, error = %e, "tracker command failed");
                    (error_to_status(&e), Bytes::new())
                }
            };
            write_frame(
                &mut stream,
                FDFS_PROTO_CMD_RESP,
                status,
                &reply,
                self.config.network_timeout,
            )
            .await?;
        }
    }

    fn dispatch(&self, cmd: u8, body: &[u8]) -> Result<Bytes> {
        match cmd {
            c if c == TrackerCommand::StorageJoin as u8 => self.handle_join(body),
            c if c == TrackerCommand::StorageBeat as u8 => self.handle_beat(body),
            c if c == TrackerCommand::StorageReportDiskUsage as u8 => {
                self.handle_disk_usage(body)
            }
            c if c == TrackerCommand::StorageSyncReport as u8 => self.handle_sync_report(body),
            c if c == TrackerCommand::StorageSyncSrcReq as u8
                || c == TrackerCommand::StorageSyncDestReq as u8 =>
            {
                self.handle_sync_query(body)
            }
            c if c == TrackerCommand::StorageSyncTimestamp as u8 => {
                self.handle_sync_timestamp(body)
            }
            c if c == TrackerCommand::StorageReportStatus as u8 => self.handle_report_status(body),
            c if c == TrackerCommand::StorageReportIpChanged as u8 => {
                self.handle_ip_changed(body)
            }
            c if c == TrackerCommand::TrackerGetStatus as u8 => {
                Ok(encode_tracker_status(&self.cluster.running_status()))
            }
            c if c == TrackerCommand::TrackerGetLeader as u8 => self.handle_get_leader(),
            c if c == TrackerCommand::ServerListAllGroups as u8 => {
                let mut buf = BytesMut::new();
                for stat in self.registry.group_stats() {
                    buf.put(encode_group_stat(&stat));
                }
                Ok(buf.freeze())
            }
            c if c == TrackerCommand::ServerListOneGroup as u8 => self.handle_list_one_group(body),
            c if c == TrackerCommand::ServerListStorage as u8 => self.handle_list_storage(body),
            c if c == TrackerCommand::ServerDeleteStorage as u8 => self.handle_delete_storage(body),
            c if c == TrackerCommand::ServiceQueryStoreWithoutGroupOne as u8 => {
                self.handle_query_store(None, false)
            }
            c if c == TrackerCommand::ServiceQueryStoreWithGroupOne as u8 => {
                let group = decode_group_field(body)?;
                self.handle_query_store(Some(group), false)
            }
            c if c == TrackerCommand::ServiceQueryStoreWithoutGroupAll as u8 => {
                self.handle_query_store(None, true)
            }
            c if c == TrackerCommand::ServiceQueryStoreWithGroupAll as u8 => {
                let group = decode_group_field(body)?;
                self.handle_query_store(Some(group), true)
            }
            c if c == TrackerCommand::ServiceQueryFetchOne as u8 => self.handle_fetch(body, false),
            c if c == TrackerCommand::ServiceQueryFetchAll as u8 => self.handle_fetch(body, true),
            c if c == TrackerCommand::ServiceQueryUpdate as u8 => self.handle_update(body),
            other => Err(FastDFSError::InvalidRequest(format!(
                "unknown tracker command {}",
                other
            ))),
        }
    }

    fn handle_join(&self, body: &[u8]) -> Result<Bytes> {
        let req = decode_join_request(body)?;
        info!(group = %req.group_name, ip = %req.ip_addr, "storage join");
        match self.registry.join(&req)? {
            Some(src) => Ok(encode_sync_source(&src)),
            None => Ok(Bytes::new()),
        }
    }

    fn handle_beat(&self, body: &[u8]) -> Result<Bytes> {
        let (group, id, rest) = decode_storage_prefix(body)?;
        let stat = if rest.is_empty() {
            None
        } else {
            Some(decode_stat_report(rest)?)
        };
        let changes = self.registry.beat(&group, &id, stat.as_ref())?;
        Ok(encode_peer_changes(&changes))
    }

    fn handle_disk_usage(&self, body: &[u8]) -> Result<Bytes> {
        let (group, id, rest) = decode_storage_prefix(body)?;
        let paths = decode_disk_usage(rest)?;
        self.registry.report_disk_usage(&group, &id, &paths)?;
        Ok(Bytes::new())
    }

    fn handle_sync_report(&self, body: &[u8]) -> Result<Bytes> {
        let (group, id, rest) = decode_storage_prefix(body)?;
        let entries = decode_sync_report(rest)?;
        self.registry.sync_report(&group, &id, &entries)?;
        Ok(Bytes::new())
    }

    fn handle_sync_query(&self, body: &[u8]) -> Result<Bytes> {
        let (group, dest, _) = decode_storage_prefix(body)?;
        match self.registry.sync_source_of(&group, &dest)? {
            Some(src) => Ok(encode_sync_source(&src)),
            None => Ok(Bytes::new()),
        }
    }

    fn handle_sync_timestamp(&self, body: &[u8]) -> Result<Bytes> {
        let (group, dest, _) = decode_storage_prefix(body)?;
        let entries = self.registry.sync_timestamps_for(&group, &dest)?;
        Ok(encode_sync_report(&entries))
    }

    fn handle_report_status(&self, body: &[u8]) -> Result<Bytes> {
        let (group, id, rest) = decode_storage_prefix(body)?;
        if rest.len() != 1 {
            return Err(FastDFSError::InvalidRequest(
                "report status body malformed".to_string(),
            ));
        }
        self.registry
            .report_status(&group, &id, StorageStatus::from_u8(rest[0]))?;
        Ok(Bytes::new())
    }

    fn handle_ip_changed(&self, body: &[u8]) -> Result<Bytes> {
        if body.len() != FDFS_GROUP_NAME_MAX_LEN + 2 * IP_ADDRESS_SIZE {
            return Err(FastDFSError::InvalidRequest(
                "ip changed body malformed".to_string(),
            ));
        }
        let group = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
        let old_ip = unpad_string(
            &body[FDFS_GROUP_NAME_MAX_LEN..FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE],
        );
        let new_ip = unpad_string(&body[FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE..]);
        self.registry.report_ip_changed(&group, &old_ip, &new_ip)?;
        Ok(Bytes::new())
    }

    fn handle_get_leader(&self) -> Result<Bytes> {
        let leader = self.cluster.leader_addr();
        let (host, port) = leader
            .rsplit_once(':')
            .ok_or_else(|| FastDFSError::InvalidResponse(format!("bad leader addr {}", leader)))?;
        let port: u64 = port
            .parse()
            .map_err(|_| FastDFSError::InvalidResponse(format!("bad leader addr {}", leader)))?;

        let mut buf = BytesMut::with_capacity(IP_ADDRESS_SIZE + 8);
        buf.put(pad_string(host, IP_ADDRESS_SIZE));
        buf.put_u64(port);
        Ok(buf.freeze())
    }

    fn handle_list_one_group(&self, body: &[u8]) -> Result<Bytes> {
        let group = decode_group_field(body)?;
        let group_arc = self
            .registry
            .group(group)
            .ok_or_else(|| FastDFSError::GroupNotFound(group.to_string()))?;
        let stat = group_arc.read().stat();
        Ok(encode_group_stat(&stat))
    }

    fn handle_list_storage(&self, body: &[u8]) -> Result<Bytes> {
        let group = decode_group_field(body)?;
        let mut buf = BytesMut::new();
        for entry in self.registry.storage_stats(group)? {
            buf.put(encode_storage_stat_entry(&entry));
        }
        Ok(buf.freeze())
    }

    fn handle_delete_storage(&self, body: &[u8]) -> Result<Bytes> {
        if body.len() != FDFS_GROUP_NAME_MAX_LEN + FDFS_STORAGE_ID_MAX_SIZE {
            return Err(FastDFSError::InvalidRequest(
                "delete storage body malformed".to_string(),
            ));
        }
        let group = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
        let id = unpad_string(&body[FDFS_GROUP_NAME_MAX_LEN..]);
        self.registry.delete_storage(&group, &id)?;
        Ok(Bytes::new())
    }

    fn handle_query_store(&self, group: Option<&str>, all: bool) -> Result<Bytes> {
        self.check_grace(group)?;
        if all {
            let (selection, ips) = self.selector.select_store_all(&self.registry, group)?;
            Ok(encode_query_store_all(
                &selection.group_name,
                &ips,
                selection.port,
                selection.store_path_index,
            ))
        } else {
            let selection = self.selector.select_store(&self.registry, group)?;
            Ok(encode_query_store(
                &selection.group_name,
                &selection.ip_addr,
                selection.port,
                selection.store_path_index,
            ))
        }
    }

    fn handle_fetch(&self, body: &[u8], all: bool) -> Result<Bytes> {
        let (group, _filename) = decode_group_and_filename(body)?;
        self.check_grace(Some(&group))?;
        let selection = self.selector.select_fetch(&self.registry, &group, all)?;
        Ok(encode_query_fetch(
            &selection.group_name,
            &selection.ip_addr,
            selection.port,
            &selection.extra_ips,
        ))
    }

    fn handle_update(&self, body: &[u8]) -> Result<Bytes> {
        let (group, filename) = decode_group_and_filename(body)?;
        self.check_grace(Some(&group))?;
        let selection = self.selector.select_update(&self.registry, &group, &filename)?;
        Ok(encode_query_fetch(
            &selection.group_name,
            &selection.ip_addr,
            selection.port,
            &selection.extra_ips,
        ))
    }

    /// During the post-restart grace window the registry is still being
    /// reconciled by heartbeats; routing queries answer ENOENT-group.
    fn check_grace(&self, group: Option<&str>) -> Result<()> {
        if self.registry.in_grace_window() {
            return Err(FastDFSError::GroupNotFound(
                group.unwrap_or("*").to_string(),
            ));
        }
        Ok(())
    }
}

/// Decodes the `group(16) | ip(16)` prefix carried by storage control
/// commands, returning the remaining body
fn decode_storage_prefix(body: &[u8]) -> Result<(String, String, &[u8])> {
    const PREFIX: usize = FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE;
    if body.len() < PREFIX {
        return Err(FastDFSError::InvalidRequest(
            "storage prefix too short".to_string(),
        ));
    }
    let group = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
    let id = unpad_string(&body[FDFS_GROUP_NAME_MAX_LEN..PREFIX]);
    if group.is_empty() || id.is_empty() {
        return Err(FastDFSError::InvalidRequest(
            "storage prefix missing group or id".to_string(),
        ));
    }
    Ok((group, id, &body[PREFIX..]))
}

fn decode_group_field(body: &[u8]) -> Result<&str> {
    if body.len() != FDFS_GROUP_NAME_MAX_LEN {
        return Err(FastDFSError::InvalidRequest(format!(
            "group field length {} != {}",
            body.len(),
            FDFS_GROUP_NAME_MAX_LEN
        )));
    }
    let end = body
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    std::str::from_utf8(&body[..end])
        .map_err(|_| FastDFSError::InvalidRequest("group field not utf-8".to_string()))
}

/// Decodes a `group(16) | filename...` body (fetch and update queries)
fn decode_group_and_filename(body: &[u8]) -> Result<(String, String)> {
    if body.len() <= FDFS_GROUP_NAME_MAX_LEN {
        return Err(FastDFSError::InvalidRequest(
            "fetch body missing filename".to_string(),
        ));
    }
    let group = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
    let filename = String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).to_string();
    if group.is_empty() || filename.is_empty() {
        return Err(FastDFSError::InvalidRequest(
            "fetch body missing group or filename".to_string(),
        ));
    }
    Ok((group, filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_storage_prefix() {
        let mut body = BytesMut::new();
        body.put(pad_string("group1", FDFS_GROUP_NAME_MAX_LEN));
        body.put(pad_string("10.0.0.1", IP_ADDRESS_SIZE));
        body.put_u64(42);

        let (group, id, rest) = decode_storage_prefix(&body).unwrap();
        assert_eq!(group, "group1");
        assert_eq!(id, "10.0.0.1");
        assert_eq!(rest.len(), 8);
    }

    #[test]
    fn test_decode_group_and_filename() {
        let mut body = BytesMut::new();
        body.put(pad_string("group1", FDFS_GROUP_NAME_MAX_LEN));
        body.put_slice(b"M00/00/00/abc.txt");

        let (group, filename) = decode_group_and_filename(&body).unwrap();
        assert_eq!(group, "group1");
        assert_eq!(filename, "M00/00/00/abc.txt");
    }

    #[test]
    fn test_prefix_rejects_short_bodies() {
        assert!(decode_storage_prefix(&[0u8; 8]).is_err());
        assert!(decode_group_and_filename(&[0u8; 16]).is_err());
    }
}
