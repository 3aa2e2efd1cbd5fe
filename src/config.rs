//! Server Configuration
//!
//! Builder-style configuration for the tracker and storage daemons, mirroring
//! how [`crate::ClientConfig`] works on the client side. Policy knobs follow
//! the recognised core options of the deployment configuration.

use std::path::PathBuf;

/// How the tracker picks a group for a store query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreLookup {
    /// Rotate across groups
    #[default]
    RoundRobin,
    /// Always use the configured group
    SpecGroup,
    /// Pick the group with the most free space
    LoadBalance,
}

/// How the tracker picks a member within the chosen group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreServerPolicy {
    /// Advance the group's write cursor on every query
    #[default]
    RoundRobin,
    /// First member that passes the eligibility filter
    FirstAlive,
    /// Highest upload priority wins
    Priority,
}

/// How a store path is picked on the chosen member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePathPolicy {
    /// Rotate across store paths
    #[default]
    RoundRobin,
    /// Path with the most free space
    MostFree,
}

/// Tracker daemon configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Listener bind address
    pub bind_addr: String,
    /// Listener port
    pub port: u16,
    /// Other trackers in the cluster, `host:port`; the order defines the
    /// election tie-break index
    pub tracker_peers: Vec<String>,
    /// Where snapshot files live
    pub base_path: PathBuf,
    /// Connect timeout in milliseconds
    pub connect_timeout: u64,
    /// Network I/O timeout in milliseconds
    pub network_timeout: u64,
    /// Accepted connection cap; beyond it requests are answered EBUSY
    pub max_connections: usize,
    /// Group selection policy
    pub store_lookup: StoreLookup,
    /// Group used by the SpecGroup policy
    pub store_group: String,
    /// Member selection policy
    pub store_server: StoreServerPolicy,
    /// Store path selection policy
    pub store_path: StorePathPolicy,
    /// Minimum free space in MB a member must keep to accept writes
    pub reserved_storage_space_mb: u64,
    /// Heartbeat staleness threshold in seconds; OFFLINE at twice this
    pub check_active_interval: u64,
    /// Seconds between snapshot flushes
    pub snapshot_interval: u64,
    /// Seconds after startup during which unknown groups answer ENOENT
    /// instead of being created implicitly by stale clients
    pub startup_grace: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: crate::types::TRACKER_DEFAULT_PORT,
            tracker_peers: Vec::new(),
            base_path: PathBuf::from("/var/lib/fastdfs/tracker"),
            connect_timeout: 5000,
            network_timeout: 30000,
            max_connections: 256,
            store_lookup: StoreLookup::RoundRobin,
            store_group: String::new(),
            store_server: StoreServerPolicy::RoundRobin,
            store_path: StorePathPolicy::RoundRobin,
            reserved_storage_space_mb: 1024,
            check_active_interval: 30,
            snapshot_interval: 60,
            startup_grace: 10,
        }
    }
}

impl TrackerConfig {
    /// Creates a tracker configuration listening on the given address
    pub fn new(bind_addr: impl Into<String>, port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the snapshot directory
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = path.into();
        self
    }

    /// Sets the tracker peer list (election index order)
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.tracker_peers = peers;
        self
    }

    /// Sets the group selection policy
    pub fn with_store_lookup(mut self, policy: StoreLookup) -> Self {
        self.store_lookup = policy;
        self
    }

    /// Sets the dedicated group for the SpecGroup policy
    pub fn with_store_group(mut self, group: impl Into<String>) -> Self {
        self.store_group = group.into();
        self
    }

    /// Sets the member selection policy
    pub fn with_store_server(mut self, policy: StoreServerPolicy) -> Self {
        self.store_server = policy;
        self
    }

    /// Sets the store path selection policy
    pub fn with_store_path(mut self, policy: StorePathPolicy) -> Self {
        self.store_path = policy;
        self
    }

    /// Sets the reserved free-space threshold in MB
    pub fn with_reserved_space_mb(mut self, mb: u64) -> Self {
        self.reserved_storage_space_mb = mb;
        self
    }

    /// Sets the heartbeat staleness threshold in seconds
    pub fn with_check_active_interval(mut self, secs: u64) -> Self {
        self.check_active_interval = secs;
        self
    }

    /// Sets the connection cap
    pub fn with_max_connections(mut self, cap: usize) -> Self {
        self.max_connections = cap;
        self
    }
}

/// Storage daemon configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Group this server belongs to
    pub group_name: String,
    /// Listener bind address
    pub bind_addr: String,
    /// Listener port
    pub port: u16,
    /// Advertised HTTP port (carried in the registry, not served here)
    pub http_port: u16,
    /// Address advertised to the tracker and embedded in generated filenames
    pub advertised_ip: String,
    /// Tracker cluster addresses, `host:port`
    pub tracker_servers: Vec<String>,
    /// Base path for binlog, mark files and stat persistence
    pub base_path: PathBuf,
    /// Storage tree roots; index order defines the M00/M01 prefixes
    pub store_paths: Vec<PathBuf>,
    /// Hash fan-out per directory level under each store path
    pub subdir_count_per_path: u32,
    /// Declared capacity of each store path in MB; free space is reported
    /// against this figure
    pub path_capacity_mb: u64,
    /// Connect timeout in milliseconds
    pub connect_timeout: u64,
    /// Network I/O timeout in milliseconds
    pub network_timeout: u64,
    /// Accepted connection cap
    pub max_connections: usize,
    /// Seconds between heartbeats to the trackers
    pub heart_beat_interval: u64,
    /// Seconds between disk usage reports to the trackers
    pub stat_report_interval: u64,
    /// Seconds between binlog buffer flushes
    pub sync_binlog_buff_interval: u64,
    /// Records between mark-file flushes on each sender
    pub sync_mark_flush_records: u64,
    /// Upload priority advertised to the tracker (lower wins)
    pub upload_priority: u32,
    /// Domain name advertised to the tracker
    pub domain_name: String,
    /// Whether outbound channels reuse pooled connections
    pub use_connection_pool: bool,
    /// Idle age in milliseconds after which a pooled connection is dropped
    pub connection_pool_max_idle_time: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            group_name: "group1".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            port: crate::types::STORAGE_DEFAULT_PORT,
            http_port: 8888,
            advertised_ip: "127.0.0.1".to_string(),
            tracker_servers: Vec::new(),
            base_path: PathBuf::from("/var/lib/fastdfs/storage"),
            store_paths: Vec::new(),
            subdir_count_per_path: 256,
            path_capacity_mb: 10_240,
            connect_timeout: 5000,
            network_timeout: 30000,
            max_connections: 256,
            heart_beat_interval: 30,
            stat_report_interval: 300,
            sync_binlog_buff_interval: 10,
            sync_mark_flush_records: 500,
            upload_priority: 10,
            domain_name: String::new(),
            use_connection_pool: true,
            connection_pool_max_idle_time: 60000,
        }
    }
}

impl StorageConfig {
    /// Creates a storage configuration for the given group and listener
    pub fn new(group_name: impl Into<String>, bind_addr: impl Into<String>, port: u16) -> Self {
        Self {
            group_name: group_name.into(),
            bind_addr: bind_addr.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the tracker cluster addresses
    pub fn with_trackers(mut self, trackers: Vec<String>) -> Self {
        self.tracker_servers = trackers;
        self
    }

    /// Sets the base path for binlog and cursor state
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = path.into();
        self
    }

    /// Sets the storage tree roots
    pub fn with_store_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.store_paths = paths;
        self
    }

    /// Sets the address advertised to trackers and peers
    pub fn with_advertised_ip(mut self, ip: impl Into<String>) -> Self {
        self.advertised_ip = ip.into();
        self
    }

    /// Sets the heartbeat cadence in seconds
    pub fn with_heart_beat_interval(mut self, secs: u64) -> Self {
        self.heart_beat_interval = secs;
        self
    }

    /// Sets the directory fan-out per store path
    pub fn with_subdir_count(mut self, count: u32) -> Self {
        self.subdir_count_per_path = count;
        self
    }

    /// Sets the upload priority (lower wins under the Priority policy)
    pub fn with_upload_priority(mut self, priority: u32) -> Self {
        self.upload_priority = priority;
        self
    }

    /// Sets the connection cap
    pub fn with_max_connections(mut self, cap: usize) -> Self {
        self.max_connections = cap;
        self
    }

    /// The number of configured store paths
    pub fn store_path_count(&self) -> u32 {
        self.store_paths.len() as u32
    }

    /// The endpoint string advertised to the cluster
    pub fn advertised_addr(&self) -> String {
        format!("{}:{}", self.advertised_ip, self.port)
    }
}
