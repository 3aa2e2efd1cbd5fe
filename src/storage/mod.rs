//! Storage Role
//!
//! The replica-bearing server: local blob store, append-only binlog of every
//! mutation, per-peer replication senders and the tracker heartbeat channel.

pub mod binlog;
pub mod heartbeat;
pub mod mark;
pub mod server;
pub mod stat;
pub mod store;
pub mod sync;

pub use binlog::{Binlog, BinlogOp, BinlogReader, BinlogRecord};
pub use mark::{Mark, MarkFile};
pub use server::StorageServer;
pub use stat::StatTracker;
pub use store::FileStore;
pub use sync::{SyncFrame, SyncManager, SyncOp};
