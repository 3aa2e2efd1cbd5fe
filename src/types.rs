//! FastDFS Protocol Types and Constants
//!
//! This module defines all protocol-level constants, command codes, and data structures
//! shared by the tracker server, the storage server and the client.

use std::time::SystemTime;

/// Default network ports for FastDFS servers
pub const TRACKER_DEFAULT_PORT: u16 = 22122;
pub const STORAGE_DEFAULT_PORT: u16 = 23000;

/// Protocol header size
pub const FDFS_PROTO_HEADER_LEN: usize = 10;

/// Field size limits
pub const FDFS_GROUP_NAME_MAX_LEN: usize = 16;
pub const FDFS_FILE_EXT_NAME_MAX_LEN: usize = 6;
pub const FDFS_MAX_META_NAME_LEN: usize = 64;
pub const FDFS_MAX_META_VALUE_LEN: usize = 256;
pub const FDFS_FILE_PREFIX_MAX_LEN: usize = 16;
pub const FDFS_STORAGE_ID_MAX_SIZE: usize = 16;
pub const FDFS_VERSION_SIZE: usize = 8;
pub const FDFS_DOMAIN_NAME_MAX_SIZE: usize = 128;
pub const IP_ADDRESS_SIZE: usize = 16;

/// Largest body a server accepts before treating the frame as hostile
pub const FDFS_MAX_BODY_SIZE: u64 = 512 * 1024 * 1024;

/// Per-category operation counters carried in heartbeats
pub const FDFS_STAT_CATEGORY_COUNT: usize = 10;

/// Protocol separators
pub const FDFS_RECORD_SEPARATOR: u8 = 0x01;
pub const FDFS_FIELD_SEPARATOR: u8 = 0x02;

/// Commands shared by every server role
pub const FDFS_PROTO_CMD_QUIT: u8 = 79;
pub const FDFS_PROTO_CMD_ACTIVE_TEST: u8 = 111;
pub const FDFS_PROTO_CMD_RESP: u8 = 100;

/// Tracker protocol commands
///
/// Codes 101-107 are the client-facing service queries, 90-98 the server-list
/// and report commands, and 81-89 the storage/tracker control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackerCommand {
    StorageJoin = 81,
    StorageBeat = 83,
    StorageSyncSrcReq = 86,
    StorageSyncDestReq = 87,
    TrackerGetStatus = 88,
    TrackerGetLeader = 89,
    ServerListOneGroup = 90,
    ServerListAllGroups = 91,
    ServerListStorage = 92,
    ServerDeleteStorage = 93,
    StorageReportIpChanged = 94,
    StorageReportStatus = 95,
    StorageReportDiskUsage = 96,
    StorageSyncTimestamp = 97,
    StorageSyncReport = 98,
    ServiceQueryStoreWithoutGroupOne = 101,
    ServiceQueryFetchOne = 102,
    ServiceQueryUpdate = 103,
    ServiceQueryStoreWithGroupOne = 104,
    ServiceQueryFetchAll = 105,
    ServiceQueryStoreWithoutGroupAll = 106,
    ServiceQueryStoreWithGroupAll = 107,
}

impl From<TrackerCommand> for u8 {
    fn from(cmd: TrackerCommand) -> u8 {
        cmd as u8
    }
}

/// Storage protocol commands
///
/// Codes below 40 are client-facing; the 80-88 range is the storage-to-storage
/// replication channel and never appears on client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageCommand {
    UploadFile = 11,
    DeleteFile = 12,
    SetMetadata = 13,
    DownloadFile = 14,
    GetMetadata = 15,
    UploadSlaveFile = 21,
    QueryFileInfo = 22,
    UploadAppenderFile = 23,
    AppendFile = 24,
    ModifyFile = 34,
    TruncateFile = 36,
    SyncCreateFile = 80,
    SyncDeleteFile = 81,
    SyncUpdateFile = 82,
    SyncAppendFile = 83,
    SyncModifyFile = 84,
    SyncTruncateFile = 85,
    SyncCreateLink = 86,
    SyncDeleteLink = 87,
    SyncRenameFile = 88,
}

impl From<StorageCommand> for u8 {
    fn from(cmd: StorageCommand) -> u8 {
        cmd as u8
    }
}

/// Storage server status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StorageStatus {
    Init = 0,
    WaitSync = 1,
    Syncing = 2,
    IpChanged = 3,
    Deleted = 4,
    Offline = 5,
    Online = 6,
    Active = 7,
    Recovery = 9,
    None = 99,
}

impl StorageStatus {
    /// Decodes a one-byte wire status
    pub fn from_u8(b: u8) -> StorageStatus {
        match b {
            0 => StorageStatus::Init,
            1 => StorageStatus::WaitSync,
            2 => StorageStatus::Syncing,
            3 => StorageStatus::IpChanged,
            4 => StorageStatus::Deleted,
            5 => StorageStatus::Offline,
            6 => StorageStatus::Online,
            7 => StorageStatus::Active,
            9 => StorageStatus::Recovery,
            _ => StorageStatus::None,
        }
    }

    /// Whether this server may receive client traffic
    pub fn is_active(self) -> bool {
        self == StorageStatus::Active
    }

    /// Whether this server is a live group member that peers replicate to
    pub fn is_serving(self) -> bool {
        matches!(
            self,
            StorageStatus::WaitSync
                | StorageStatus::Syncing
                | StorageStatus::Online
                | StorageStatus::Active
        )
    }
}

/// Metadata operation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataFlag {
    /// Replace all existing metadata with new values
    Overwrite = b'O',
    /// Merge new metadata with existing metadata
    Merge = b'M',
}

impl From<MetadataFlag> for u8 {
    fn from(flag: MetadataFlag) -> u8 {
        flag as u8
    }
}

/// Information about a file stored in FastDFS
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Size of the file in bytes
    pub file_size: u64,
    /// Timestamp when the file was created
    pub create_time: SystemTime,
    /// CRC32 checksum of the file
    pub crc32: u32,
    /// IP address of the source storage server
    pub source_ip_addr: String,
}

/// Represents a storage endpoint returned by a tracker query
#[derive(Debug, Clone)]
pub struct StorageEndpoint {
    /// IP address of the storage server
    pub ip_addr: String,
    /// Port number of the storage server
    pub port: u16,
    /// Index of the storage path to use (0-based)
    pub store_path_index: u8,
}

/// FastDFS protocol header (10 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerHeader {
    /// Length of the message body (not including header)
    pub length: u64,
    /// Command code (request type or response type)
    pub cmd: u8,
    /// Status code (0 for success, error code otherwise)
    pub status: u8,
}

/// Response from an upload operation
#[derive(Debug, Clone)]
pub struct UploadResponse {
    /// Storage group where the file was stored
    pub group_name: String,
    /// Path and filename on the storage server
    pub remote_filename: String,
}

/// Per-category operation counters reported by a storage server
///
/// Wire order: upload, download, delete, set_meta, get_meta, append, modify,
/// truncate, create_link, delete_link; each category as (total, success).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCounters {
    pub totals: [u64; FDFS_STAT_CATEGORY_COUNT],
    pub successes: [u64; FDFS_STAT_CATEGORY_COUNT],
}

/// Indices into [`StorageCounters`] arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum OpCategory {
    Upload = 0,
    Download = 1,
    Delete = 2,
    SetMeta = 3,
    GetMeta = 4,
    Append = 5,
    Modify = 6,
    Truncate = 7,
    CreateLink = 8,
    DeleteLink = 9,
}

/// Statistics block carried in a heartbeat when anything changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatReport {
    pub total_mb: u64,
    pub free_mb: u64,
    pub last_source_update: u64,
    pub last_sync_update: u64,
    pub last_synced_timestamp: u64,
    pub counters: StorageCounters,
}

/// Body of a STORAGE_JOIN request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub group_name: String,
    pub ip_addr: String,
    pub port: u16,
    pub http_port: u16,
    pub store_path_count: u32,
    pub subdir_count_per_path: u32,
    pub upload_priority: u32,
    pub join_time: u64,
    pub up_time: u64,
    pub version: String,
    pub domain_name: String,
    pub init_flag: bool,
    pub status: StorageStatus,
}

/// Where a joining server pulls history from, and the cut-off timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSource {
    pub ip_addr: String,
    pub until_timestamp: u64,
}

/// One peer-status change entry in a heartbeat reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChange {
    pub status: StorageStatus,
    pub ip_addr: String,
}

/// Aggregate statistics for one group, as listed by the tracker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStat {
    pub group_name: String,
    pub total_mb: u64,
    pub free_mb: u64,
    pub server_count: u64,
    pub storage_port: u64,
    pub storage_http_port: u64,
    pub active_count: u64,
    pub current_write_server: u64,
    pub store_path_count: u64,
    pub subdir_count_per_path: u64,
}

/// Per-server statistics entry, as listed by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStatEntry {
    pub id: String,
    pub ip_addr: String,
    pub status: StorageStatus,
    pub join_time: u64,
    pub up_time: u64,
    pub total_mb: u64,
    pub free_mb: u64,
    pub upload_priority: u64,
    pub last_heart_beat_time: u64,
    pub last_source_update: u64,
    pub last_sync_update: u64,
    pub last_synced_timestamp: u64,
    pub counters: StorageCounters,
}

/// Status block exchanged between tracker peers during leader election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerRunningStatus {
    pub if_leader: bool,
    pub up_time: u64,
    pub running_time: u64,
}

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// List of tracker server addresses in format "host:port"
    pub tracker_addrs: Vec<String>,
    /// Maximum number of idle connections kept per server
    pub max_conns: usize,
    /// Timeout for establishing connections in milliseconds
    pub connect_timeout: u64,
    /// Timeout for network I/O operations in milliseconds
    pub network_timeout: u64,
    /// Timeout for idle connections in the pool in milliseconds
    pub idle_timeout: u64,
    /// Number of retries for failed operations
    pub retry_count: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tracker_addrs: Vec::new(),
            max_conns: 10,
            connect_timeout: 5000,
            network_timeout: 30000,
            idle_timeout: 60000,
            retry_count: 3,
        }
    }
}

impl ClientConfig {
    /// Creates a new client configuration with tracker addresses
    pub fn new(tracker_addrs: Vec<String>) -> Self {
        Self {
            tracker_addrs,
            ..Default::default()
        }
    }

    /// Sets the maximum number of idle connections per server
    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    /// Sets the connection timeout in milliseconds
    pub fn with_connect_timeout(mut self, timeout: u64) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the network timeout in milliseconds
    pub fn with_network_timeout(mut self, timeout: u64) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Sets the idle timeout in milliseconds
    pub fn with_idle_timeout(mut self, timeout: u64) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the retry count
    pub fn with_retry_count(mut self, count: usize) -> Self {
        self.retry_count = count;
        self
    }
}

/// Fields embedded in a generated remote filename
///
/// The encoding is an internal contract between storage nodes; clients treat
/// remote filenames as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub source_ip: String,
    pub create_timestamp: u64,
    pub file_size: u64,
    pub crc32: u32,
    pub appender: bool,
}

/// Metadata dictionary type
pub type Metadata = std::collections::HashMap<String, String>;

/// Seconds since the unix epoch
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
