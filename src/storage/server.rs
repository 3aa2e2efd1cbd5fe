//! Storage Server
//!
//! Accepts client commands (upload, download, delete, metadata, appender
//! operations) and the storage-to-storage sync commands. Every mutation runs
//! the same sequence: validate, apply to the file store atomically, append
//! the binlog record, then reply. The binlog append sits before the reply so
//! a crash never leaves a file without its record.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::connection::ConnectionPool;
use crate::errors::{error_to_status, FastDFSError, Result, STATUS_EBUSY, STATUS_OK};
use crate::protocol::*;
use crate::storage::binlog::{Binlog, BinlogOp, BinlogRecord};
use crate::storage::stat::StatTracker;
use crate::storage::store::FileStore;
use crate::storage::sync::{SyncFrame, SyncManager, SyncOp};
use crate::types::*;

/// The storage daemon
pub struct StorageServer {
    pub(crate) config: StorageConfig,
    pub(crate) store: Arc<FileStore>,
    pub(crate) binlog: Arc<Binlog>,
    pub(crate) stat: Arc<StatTracker>,
    pub(crate) sync: Arc<SyncManager>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    conn_count: AtomicUsize,
}

impl StorageServer {
    /// Builds the server: opens the store, the binlog and the counters, and
    /// prepares the replication manager
    pub fn new(config: StorageConfig) -> Result<Arc<Self>> {
        let store = Arc::new(FileStore::open(&config)?);
        let binlog = Arc::new(Binlog::open(config.base_path.join("binlog"))?);
        let stat = Arc::new(StatTracker::open(&config.base_path)?);

        let pool = Arc::new(ConnectionPool::new(
            Vec::new(),
            if config.use_connection_pool { 4 } else { 0 },
            Duration::from_millis(config.connect_timeout),
            Duration::from_millis(config.connection_pool_max_idle_time),
        ));
        let sync = Arc::new(SyncManager::new(
            config.group_name.clone(),
            config.advertised_ip.clone(),
            Arc::clone(&binlog),
            Arc::clone(&store),
            pool,
            config.base_path.join("mark"),
            config.port,
            config.network_timeout,
            config.sync_mark_flush_records,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            binlog,
            stat,
            sync,
            shutdown_tx,
            conn_count: AtomicUsize::new(0),
        }))
    }

    /// Binds the listener and spawns the accept loop plus the flush timer;
    /// returns the bound address
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let bind = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, group = %self.config.group_name, "storage listening");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.flush_loop().await;
        });

        Ok(local_addr)
    }

    /// Stops the senders with a bounded grace period and flushes state
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.sync.shutdown().await;
        if let Err(e) = self.binlog.sync() {
            error!(error = %e, "final binlog sync failed");
        }
        if let Err(e) = self.stat.save() {
            error!(error = %e, "final stat flush failed");
        }
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut binlog_tick = tokio::time::interval(Duration::from_secs(
            self.config.sync_binlog_buff_interval.max(1),
        ));
        let mut stat_tick = tokio::time::interval(Duration::from_secs(
            self.config.stat_report_interval.max(1),
        ));
        loop {
            tokio::select! {
                _ = binlog_tick.tick() => {
                    if let Err(e) = self.binlog.sync() {
                        error!(error = %e, "binlog sync failed, aborting");
                        std::process::abort();
                    }
                }
                _ = stat_tick.tick() => {
                    if let Err(e) = self.stat.save() {
                        warn!(error = %e, "stat flush failed");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
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
                                    debug!(peer = %peer, error = %e, "storage connection closed");
                                }
                                server.conn_count.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "storage accept failed");
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
                    debug!(cmd = header.cmd, error = %e, "storage command failed");
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
            c if c == StorageCommand::UploadFile as u8 => self.handle_upload(body, false),
            c if c == StorageCommand::UploadAppenderFile as u8 => self.handle_upload(body, true),
            c if c == StorageCommand::UploadSlaveFile as u8 => self.handle_upload_slave(body),
            c if c == StorageCommand::DeleteFile as u8 => self.handle_delete(body),
            c if c == StorageCommand::DownloadFile as u8 => self.handle_download(body),
            c if c == StorageCommand::SetMetadata as u8 => self.handle_set_metadata(body),
            c if c == StorageCommand::GetMetadata as u8 => self.handle_get_metadata(body),
            c if c == StorageCommand::QueryFileInfo as u8 => self.handle_file_info(body),
            c if c == StorageCommand::AppendFile as u8 => self.handle_append(body),
            c if c == StorageCommand::ModifyFile as u8 => self.handle_modify(body),
            c if c == StorageCommand::TruncateFile as u8 => self.handle_truncate(body),
            c if (StorageCommand::SyncCreateFile as u8..=StorageCommand::SyncRenameFile as u8)
                .contains(&c) =>
            {
                self.handle_sync(c, body)
            }
            other => Err(FastDFSError::InvalidRequest(format!(
                "unknown storage command {}",
                other
            ))),
        }
    }

    /// Appends the binlog record that makes a mutation durable
    ///
    /// A failed append means the node can no longer uphold the
    /// file/record pairing; the process aborts.
    fn append_binlog(&self, op: BinlogOp, source_id: &str, filename: &str) {
        let record = BinlogRecord {
            timestamp: now_unix(),
            op,
            source_id: source_id.to_string(),
            filename: filename.to_string(),
        };
        if let Err(e) = self.binlog.append(&record) {
            error!(error = %e, file = %filename, "binlog append failed, aborting");
            std::process::abort();
        }
    }

    fn check_group(&self, group: &str) -> Result<()> {
        if group != self.config.group_name {
            return Err(FastDFSError::InvalidArgument(format!(
                "group {} does not match {}",
                group, self.config.group_name
            )));
        }
        Ok(())
    }

    // -- client command handlers --------------------------------------------

    /// `path_index(1) | file_size(8) | ext(6) | data`
    fn handle_upload(&self, body: &[u8], appender: bool) -> Result<Bytes> {
        const FIXED: usize = 1 + 8 + FDFS_FILE_EXT_NAME_MAX_LEN;
        if body.len() < FIXED {
            self.stat.record(OpCategory::Upload, false);
            return Err(FastDFSError::InvalidRequest(
                "upload body too short".to_string(),
            ));
        }
        let path_index = body[0];
        let file_size = decode_int64(&body[1..9]) as usize;
        let ext = unpad_string(&body[9..FIXED]);
        let data = &body[FIXED..];
        if data.len() != file_size {
            self.stat.record(OpCategory::Upload, false);
            return Err(FastDFSError::InvalidRequest(format!(
                "declared size {} != payload {}",
                file_size,
                data.len()
            )));
        }

        let result = self.store.store_new(path_index, data, &ext, appender);
        match result {
            Ok(remote) => {
                self.append_binlog(BinlogOp::Create, &self.config.advertised_ip, &remote);
                self.stat.record(OpCategory::Upload, true);
                self.stat.mark_source_update();

                let mut reply = BytesMut::new();
                reply.put(pad_string(&self.config.group_name, FDFS_GROUP_NAME_MAX_LEN));
                reply.put_slice(remote.as_bytes());
                Ok(reply.freeze())
            }
            Err(e) => {
                self.stat.record(OpCategory::Upload, false);
                Err(e)
            }
        }
    }

    /// `master_len(8) | file_size(8) | prefix(16) | ext(6) | master | data`
    fn handle_upload_slave(&self, body: &[u8]) -> Result<Bytes> {
        const FIXED: usize = 8 + 8 + FDFS_FILE_PREFIX_MAX_LEN + FDFS_FILE_EXT_NAME_MAX_LEN;
        if body.len() < FIXED {
            self.stat.record(OpCategory::Upload, false);
            return Err(FastDFSError::InvalidRequest(
                "slave upload body too short".to_string(),
            ));
        }
        let master_len = decode_int64(&body[..8]) as usize;
        let file_size = decode_int64(&body[8..16]) as usize;
        let prefix = unpad_string(&body[16..16 + FDFS_FILE_PREFIX_MAX_LEN]);
        let ext = unpad_string(&body[16 + FDFS_FILE_PREFIX_MAX_LEN..FIXED]);
        if body.len() != FIXED + master_len + file_size {
            self.stat.record(OpCategory::Upload, false);
            return Err(FastDFSError::InvalidRequest(
                "slave upload length mismatch".to_string(),
            ));
        }
        let master = String::from_utf8_lossy(&body[FIXED..FIXED + master_len]).to_string();
        let data = &body[FIXED + master_len..];

        if !self.store.exists(&master) {
            self.stat.record(OpCategory::Upload, false);
            return Err(FastDFSError::FileNotFound(master));
        }

        match self.store.store_slave(&master, &prefix, &ext, data) {
            Ok(remote) => {
                self.append_binlog(BinlogOp::Create, &self.config.advertised_ip, &remote);
                self.stat.record(OpCategory::Upload, true);
                self.stat.mark_source_update();

                let mut reply = BytesMut::new();
                reply.put(pad_string(&self.config.group_name, FDFS_GROUP_NAME_MAX_LEN));
                reply.put_slice(remote.as_bytes());
                Ok(reply.freeze())
            }
            Err(e) => {
                self.stat.record(OpCategory::Upload, false);
                Err(e)
            }
        }
    }

    /// `group(16) | filename`
    fn handle_delete(&self, body: &[u8]) -> Result<Bytes> {
        let (group, filename) = decode_group_filename(body)?;
        self.check_group(&group)?;

        match self.store.delete(&filename) {
            Ok(()) => {
                self.append_binlog(BinlogOp::Delete, &self.config.advertised_ip, &filename);
                self.stat.record(OpCategory::Delete, true);
                self.stat.mark_source_update();
                Ok(Bytes::new())
            }
            Err(e) => {
                self.stat.record(OpCategory::Delete, false);
                Err(e)
            }
        }
    }

    /// `offset(8) | length(8) | group(16) | filename`
    fn handle_download(&self, body: &[u8]) -> Result<Bytes> {
        const FIXED: usize = 8 + 8 + FDFS_GROUP_NAME_MAX_LEN;
        if body.len() <= FIXED {
            self.stat.record(OpCategory::Download, false);
            return Err(FastDFSError::InvalidRequest(
                "download body too short".to_string(),
            ));
        }
        let offset = decode_int64(&body[..8]);
        let length = decode_int64(&body[8..16]);
        let group = unpad_string(&body[16..FIXED]);
        let filename = String::from_utf8_lossy(&body[FIXED..]).to_string();
        self.check_group(&group)?;

        match self.store.read(&filename, offset, length) {
            Ok(data) => {
                self.stat.record(OpCategory::Download, true);
                Ok(data)
            }
            Err(e) => {
                self.stat.record(OpCategory::Download, false);
                Err(e)
            }
        }
    }

    /// `fn_len(8) | meta_len(8) | flag(1) | group(16) | filename | meta`
    fn handle_set_metadata(&self, body: &[u8]) -> Result<Bytes> {
        const FIXED: usize = 8 + 8 + 1 + FDFS_GROUP_NAME_MAX_LEN;
        if body.len() < FIXED {
            self.stat.record(OpCategory::SetMeta, false);
            return Err(FastDFSError::InvalidRequest(
                "set metadata body too short".to_string(),
            ));
        }
        let fn_len = decode_int64(&body[..8]) as usize;
        let meta_len = decode_int64(&body[8..16]) as usize;
        let flag = match body[16] {
            b'O' => MetadataFlag::Overwrite,
            b'M' => MetadataFlag::Merge,
            other => {
                self.stat.record(OpCategory::SetMeta, false);
                return Err(FastDFSError::InvalidRequest(format!(
                    "unknown metadata flag {}",
                    other
                )));
            }
        };
        let group = unpad_string(&body[17..FIXED]);
        if body.len() != FIXED + fn_len + meta_len {
            self.stat.record(OpCategory::SetMeta, false);
            return Err(FastDFSError::InvalidRequest(
                "set metadata length mismatch".to_string(),
            ));
        }
        let filename = String::from_utf8_lossy(&body[FIXED..FIXED + fn_len]).to_string();
        let metadata = decode_metadata(&body[FIXED + fn_len..])?;
        self.check_group(&group)?;

        match self.store.set_metadata(&filename, &metadata, flag) {
            Ok(()) => {
                self.append_binlog(BinlogOp::UpdateMeta, &self.config.advertised_ip, &filename);
                self.stat.record(OpCategory::SetMeta, true);
                self.stat.mark_source_update();
                Ok(Bytes::new())
            }
            Err(e) => {
                self.stat.record(OpCategory::SetMeta, false);
                Err(e)
            }
        }
    }

    fn handle_get_metadata(&self, body: &[u8]) -> Result<Bytes> {
        let (group, filename) = decode_group_filename(body)?;
        self.check_group(&group)?;

        if !self.store.exists(&filename) {
            self.stat.record(OpCategory::GetMeta, false);
            return Err(FastDFSError::FileNotFound(filename));
        }
        let raw = self.store.raw_metadata(&filename)?;
        self.stat.record(OpCategory::GetMeta, true);
        Ok(raw)
    }

    /// Reply: `size(8) | create_ts(8) | crc32(4) | source ip(16)`
    fn handle_file_info(&self, body: &[u8]) -> Result<Bytes> {
        let (group, filename) = decode_group_filename(body)?;
        self.check_group(&group)?;

        let (meta, size) = self.store.file_info(&filename)?;
        let mut reply = BytesMut::with_capacity(8 + 8 + 4 + IP_ADDRESS_SIZE);
        reply.put_u64(size);
        reply.put_u64(meta.create_timestamp);
        reply.put_u32(meta.crc32);
        reply.put(pad_string(&meta.source_ip, IP_ADDRESS_SIZE));
        Ok(reply.freeze())
    }

    /// `fn_len(8) | size(8) | filename | data`
    fn handle_append(&self, body: &[u8]) -> Result<Bytes> {
        let (filename, data) = decode_len_sized(body, "append")?;
        match self.store.append(&filename, &data) {
            Ok(()) => {
                self.append_binlog(BinlogOp::Append, &self.config.advertised_ip, &filename);
                self.stat.record(OpCategory::Append, true);
                self.stat.mark_source_update();
                Ok(Bytes::new())
            }
            Err(e) => {
                self.stat.record(OpCategory::Append, false);
                Err(e)
            }
        }
    }

    /// `fn_len(8) | offset(8) | size(8) | filename | data`
    fn handle_modify(&self, body: &[u8]) -> Result<Bytes> {
        if body.len() < 24 {
            self.stat.record(OpCategory::Modify, false);
            return Err(FastDFSError::InvalidRequest(
                "modify body too short".to_string(),
            ));
        }
        let fn_len = decode_int64(&body[..8]) as usize;
        let offset = decode_int64(&body[8..16]);
        let size = decode_int64(&body[16..24]) as usize;
        if body.len() != 24 + fn_len + size {
            self.stat.record(OpCategory::Modify, false);
            return Err(FastDFSError::InvalidRequest(
                "modify length mismatch".to_string(),
            ));
        }
        let filename = String::from_utf8_lossy(&body[24..24 + fn_len]).to_string();
        let data = &body[24 + fn_len..];

        match self.store.modify(&filename, offset, data) {
            Ok(()) => {
                self.append_binlog(BinlogOp::Modify, &self.config.advertised_ip, &filename);
                self.stat.record(OpCategory::Modify, true);
                self.stat.mark_source_update();
                Ok(Bytes::new())
            }
            Err(e) => {
                self.stat.record(OpCategory::Modify, false);
                Err(e)
            }
        }
    }

    /// `fn_len(8) | new_size(8) | filename`
    fn handle_truncate(&self, body: &[u8]) -> Result<Bytes> {
        if body.len() < 16 {
            self.stat.record(OpCategory::Truncate, false);
            return Err(FastDFSError::InvalidRequest(
                "truncate body too short".to_string(),
            ));
        }
        let fn_len = decode_int64(&body[..8]) as usize;
        let new_size = decode_int64(&body[8..16]);
        if body.len() != 16 + fn_len {
            self.stat.record(OpCategory::Truncate, false);
            return Err(FastDFSError::InvalidRequest(
                "truncate length mismatch".to_string(),
            ));
        }
        let filename = String::from_utf8_lossy(&body[16..]).to_string();

        match self.store.truncate(&filename, new_size) {
            Ok(()) => {
                self.append_binlog(BinlogOp::Truncate, &self.config.advertised_ip, &filename);
                self.stat.record(OpCategory::Truncate, true);
                self.stat.mark_source_update();
                Ok(Bytes::new())
            }
            Err(e) => {
                self.stat.record(OpCategory::Truncate, false);
                Err(e)
            }
        }
    }

    // -- replication receiver -----------------------------------------------

    /// Applies one sync frame from a group peer
    ///
    /// Conflicts resolve last-write-wins on the record timestamp; operations
    /// that no longer apply (file already gone) are acked success so the
    /// sender's cursor advances.
    fn handle_sync(&self, cmd: u8, body: &[u8]) -> Result<Bytes> {
        let frame = SyncFrame::decode(cmd, body)?;
        self.check_group(&frame.group_name)?;

        match &frame.op {
            SyncOp::Create { filename, data } => {
                if let Some(local_ts) = self.store.local_timestamp(filename) {
                    if local_ts > frame.timestamp {
                        debug!(file = %filename, "incoming record older than local copy, skipping");
                        return Ok(Bytes::new());
                    }
                }
                self.store.store_at(filename, data, true)?;
                self.append_binlog(BinlogOp::Create, &frame.source_id, filename);
                self.stat.mark_sync_update();
            }
            SyncOp::Delete { filename } => {
                match self.store.delete(filename) {
                    Ok(()) => {
                        self.append_binlog(BinlogOp::Delete, &frame.source_id, filename);
                        self.stat.mark_sync_update();
                    }
                    Err(FastDFSError::FileNotFound(_)) => {
                        debug!(file = %filename, "sync delete for absent file, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
            SyncOp::UpdateMeta { filename, meta } => {
                if !self.store.exists(filename) {
                    debug!(file = %filename, "sync metadata for absent file, skipping");
                    return Ok(Bytes::new());
                }
                let metadata = decode_metadata(meta)?;
                self.store
                    .set_metadata(filename, &metadata, MetadataFlag::Overwrite)?;
                self.append_binlog(BinlogOp::UpdateMeta, &frame.source_id, filename);
                self.stat.mark_sync_update();
            }
            SyncOp::Append { filename, data } => {
                if !self.store.exists(filename) {
                    debug!(file = %filename, "sync append for absent file, skipping");
                    return Ok(Bytes::new());
                }
                self.store.append(filename, data)?;
                self.append_binlog(BinlogOp::Append, &frame.source_id, filename);
                self.stat.mark_sync_update();
            }
            SyncOp::Modify {
                filename,
                offset,
                data,
            } => {
                if !self.store.exists(filename) {
                    debug!(file = %filename, "sync modify for absent file, skipping");
                    return Ok(Bytes::new());
                }
                self.store.modify(filename, *offset, data)?;
                self.append_binlog(BinlogOp::Modify, &frame.source_id, filename);
                self.stat.mark_sync_update();
            }
            SyncOp::Truncate { filename, new_size } => {
                if !self.store.exists(filename) {
                    debug!(file = %filename, "sync truncate for absent file, skipping");
                    return Ok(Bytes::new());
                }
                self.store.truncate(filename, *new_size)?;
                self.append_binlog(BinlogOp::Truncate, &frame.source_id, filename);
                self.stat.mark_sync_update();
            }
        }
        Ok(Bytes::new())
    }
}

fn decode_group_filename(body: &[u8]) -> Result<(String, String)> {
    if body.len() <= FDFS_GROUP_NAME_MAX_LEN {
        return Err(FastDFSError::InvalidRequest(
            "body missing filename".to_string(),
        ));
    }
    let group = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
    let filename = String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).to_string();
    if group.is_empty() || filename.is_empty() {
        return Err(FastDFSError::InvalidRequest(
            "body missing group or filename".to_string(),
        ));
    }
    Ok((group, filename))
}

/// Decodes `fn_len(8) | size(8) | filename | data`
fn decode_len_sized(body: &[u8], what: &str) -> Result<(String, Bytes)> {
    if body.len() < 16 {
        return Err(FastDFSError::InvalidRequest(format!(
            "{} body too short",
            what
        )));
    }
    let fn_len = decode_int64(&body[..8]) as usize;
    let size = decode_int64(&body[8..16]) as usize;
    if body.len() != 16 + fn_len + size {
        return Err(FastDFSError::InvalidRequest(format!(
            "{} length mismatch",
            what
        )));
    }
    let filename = String::from_utf8_lossy(&body[16..16 + fn_len]).to_string();
    let data = Bytes::copy_from_slice(&body[16 + fn_len..]);
    Ok((filename, data))
}
