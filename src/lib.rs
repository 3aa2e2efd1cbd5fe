//! FastDFS Distributed File System
//!
//! A distributed object store with three roles: stateless **tracker**
//! coordination servers, replicated **storage** nodes organised into groups,
//! and thin **clients** that ask a tracker for a storage endpoint and then
//! stream bytes directly to it.
//!
//! The crate ships all three roles: the [`Client`], the [`TrackerServer`]
//! behind `fdfs_trackerd`, and the [`StorageServer`] behind `fdfs_storaged`.
//! Storage nodes replicate every mutation to their group peers by tailing a
//! local binlog; consistency is eventual, converging within the sync settle
//! time.
//!
//! # Client example
//!
//! ```no_run
//! use fastdfs::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(vec!["192.168.1.100:22122".to_string()]);
//!     let client = Client::new(config)?;
//!
//!     let file_id = client.upload_buffer(b"Hello, FastDFS!", "txt", None).await?;
//!     let data = client.download_file(&file_id).await?;
//!     client.delete_file(&file_id).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod client;
mod operations;

pub mod config;
pub mod connection;
pub mod errors;
pub mod protocol;
pub mod storage;
pub mod tracker;
pub mod types;

/// Version string advertised by servers when joining the cluster
pub const FDFS_VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export public API
pub use client::Client;
pub use config::{StoreLookup, StorePathPolicy, StoreServerPolicy, StorageConfig, TrackerConfig};
pub use errors::{FastDFSError, Result};
pub use storage::StorageServer;
pub use tracker::TrackerServer;
pub use types::{
    ClientConfig, FileInfo, GroupStat, Metadata, MetadataFlag, StorageCommand, StorageEndpoint,
    StorageStatEntry, StorageStatus, TrackerCommand,
};
