//! FastDFS Client
//!
//! Main client struct for interacting with a FastDFS cluster.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::connection::ConnectionPool;
use crate::errors::{FastDFSError, Result};
use crate::operations::Operations;
use crate::types::{
    ClientConfig, FileInfo, GroupStat, Metadata, MetadataFlag, StorageEndpoint, StorageStatEntry,
};

/// FastDFS client for file operations
///
/// Asks a tracker for a storage endpoint, then streams bytes directly to
/// that storage. Connections to both roles are pooled; transient failures
/// retry with backoff.
///
/// # Example
///
/// ```no_run
/// use fastdfs::{Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::new(vec!["192.168.1.100:22122".to_string()]);
///     let client = Client::new(config)?;
///
///     let file_id = client.upload_file("test.jpg", None).await?;
///     let data = client.download_file(&file_id).await?;
///     client.delete_file(&file_id).await?;
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct Client {
    tracker_pool: Arc<ConnectionPool>,
    storage_pool: Arc<ConnectionPool>,
    ops: Arc<Operations>,
    closed: Arc<RwLock<bool>>,
}

impl Client {
    /// Creates a new FastDFS client with the given configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::validate_config(&config)?;

        let tracker_pool = Arc::new(ConnectionPool::new(
            config.tracker_addrs.clone(),
            config.max_conns,
            std::time::Duration::from_millis(config.connect_timeout),
            std::time::Duration::from_millis(config.idle_timeout),
        ));

        // Storage servers are discovered dynamically through the trackers.
        let storage_pool = Arc::new(ConnectionPool::new(
            Vec::new(),
            config.max_conns,
            std::time::Duration::from_millis(config.connect_timeout),
            std::time::Duration::from_millis(config.idle_timeout),
        ));

        let ops = Arc::new(Operations::new(
            Arc::clone(&tracker_pool),
            Arc::clone(&storage_pool),
            config.network_timeout,
            config.retry_count,
        ));

        Ok(Self {
            tracker_pool,
            storage_pool,
            ops,
            closed: Arc::new(RwLock::new(false)),
        })
    }

    /// Validates the client configuration
    fn validate_config(config: &ClientConfig) -> Result<()> {
        if config.tracker_addrs.is_empty() {
            return Err(FastDFSError::InvalidArgument(
                "Tracker addresses are required".to_string(),
            ));
        }

        for addr in &config.tracker_addrs {
            if addr.is_empty() || !addr.contains(':') {
                return Err(FastDFSError::InvalidArgument(format!(
                    "Invalid tracker address: {}",
                    addr
                )));
            }
        }

        Ok(())
    }

    /// Checks if the client is closed
    async fn check_closed(&self) -> Result<()> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(FastDFSError::ClientClosed);
        }
        Ok(())
    }

    /// Uploads a file from the local filesystem to FastDFS
    pub async fn upload_file(&self, local_filename: &str, metadata: Option<&Metadata>) -> Result<String> {
        self.check_closed().await?;
        self.ops.upload_file(local_filename, metadata, false).await
    }

    /// Uploads data from a buffer to FastDFS
    pub async fn upload_buffer(
        &self,
        data: &[u8],
        file_ext_name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed().await?;
        self.ops.upload_buffer(data, file_ext_name, metadata, false).await
    }

    /// Uploads an appender file that can be modified later
    pub async fn upload_appender_file(
        &self,
        local_filename: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed().await?;
        self.ops.upload_file(local_filename, metadata, true).await
    }

    /// Uploads an appender file from buffer
    pub async fn upload_appender_buffer(
        &self,
        data: &[u8],
        file_ext_name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed().await?;
        self.ops.upload_buffer(data, file_ext_name, metadata, true).await
    }

    /// Uploads a slave file attached to an existing master file
    ///
    /// The slave's remote name derives from the master's plus the prefix, so
    /// a client holding the master id can compute the slave id.
    pub async fn upload_slave_buffer(
        &self,
        master_file_id: &str,
        prefix: &str,
        data: &[u8],
        file_ext_name: &str,
    ) -> Result<String> {
        self.check_closed().await?;
        self.ops
            .upload_slave_buffer(master_file_id, prefix, data, file_ext_name)
            .await
    }

    /// Downloads a file from FastDFS and returns its content
    pub async fn download_file(&self, file_id: &str) -> Result<Bytes> {
        self.check_closed().await?;
        self.ops.download_file(file_id, 0, 0).await
    }

    /// Downloads a specific range of bytes from a file
    pub async fn download_file_range(&self, file_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.check_closed().await?;
        self.ops.download_file(file_id, offset, length).await
    }

    /// Downloads a file and saves it to the local filesystem
    pub async fn download_to_file(&self, file_id: &str, local_filename: &str) -> Result<()> {
        self.check_closed().await?;
        self.ops.download_to_file(file_id, local_filename).await
    }

    /// Deletes a file from FastDFS
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.check_closed().await?;
        self.ops.delete_file(file_id).await
    }

    /// Appends data to an appender file
    pub async fn append_file(&self, file_id: &str, data: &[u8]) -> Result<()> {
        self.check_closed().await?;
        self.ops.append_file(file_id, data).await
    }

    /// Overwrites a byte range of an appender file
    pub async fn modify_file(&self, file_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.check_closed().await?;
        self.ops.modify_file(file_id, offset, data).await
    }

    /// Truncates an appender file to the given size
    pub async fn truncate_file(&self, file_id: &str, new_size: u64) -> Result<()> {
        self.check_closed().await?;
        self.ops.truncate_file(file_id, new_size).await
    }

    /// Sets metadata for a file
    pub async fn set_metadata(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        self.check_closed().await?;
        self.ops.set_metadata(file_id, metadata, flag).await
    }

    /// Retrieves metadata for a file
    pub async fn get_metadata(&self, file_id: &str) -> Result<Metadata> {
        self.check_closed().await?;
        self.ops.get_metadata(file_id).await
    }

    /// Retrieves file information including size, create time, and CRC32
    pub async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.check_closed().await?;
        self.ops.get_file_info(file_id).await
    }

    /// Checks if a file exists on the storage server
    pub async fn file_exists(&self, file_id: &str) -> bool {
        self.check_closed().await.is_ok() && self.ops.get_file_info(file_id).await.is_ok()
    }

    /// Every ACTIVE storage endpoint holding a file
    pub async fn fetch_all_storages(&self, file_id: &str) -> Result<Vec<StorageEndpoint>> {
        self.check_closed().await?;
        self.ops.fetch_all_storages(file_id).await
    }

    /// Lists every group known to the tracker
    pub async fn list_groups(&self) -> Result<Vec<GroupStat>> {
        self.check_closed().await?;
        self.ops.list_groups().await
    }

    /// Lists the storage servers of one group
    pub async fn list_storages(&self, group_name: &str) -> Result<Vec<StorageStatEntry>> {
        self.check_closed().await?;
        self.ops.list_storages(group_name).await
    }

    /// Closes the client and releases all resources
    ///
    /// After calling close, all operations will return ClientClosed error.
    /// It's safe to call close multiple times.
    pub async fn close(&self) {
        let mut closed = self.closed.write().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        self.tracker_pool.close().await;
        self.storage_pool.close().await;
    }
}
