//! FastDFS Error Definitions
//!
//! This module defines all error types for the client and the two server roles.
//! Internally errors are typed; on the wire they collapse to the single errno
//! byte carried in the response header status field.

use thiserror::Error;

/// Result type alias for FastDFS operations
pub type Result<T> = std::result::Result<T, FastDFSError>;

/// Wire status bytes (unix errno values reused by the protocol)
pub const STATUS_OK: u8 = 0;
pub const STATUS_ENOENT: u8 = 2;
pub const STATUS_EIO: u8 = 5;
pub const STATUS_EEXIST: u8 = 6;
pub const STATUS_EBUSY: u8 = 16;
pub const STATUS_EINVAL: u8 = 22;
pub const STATUS_ENOSPC: u8 = 28;

/// Base error type for all FastDFS errors
#[derive(Error, Debug)]
pub enum FastDFSError {
    /// Client has been closed
    #[error("Client is closed")]
    ClientClosed,

    /// Requested file does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Requested group does not exist
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// No storage server is available
    #[error("No storage server available")]
    NoStorageServer,

    /// Connection timeout
    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    /// Network I/O timeout
    #[error("Network timeout during {0}")]
    NetworkTimeout(String),

    /// File ID format is invalid
    #[error("Invalid file ID: {0}")]
    InvalidFileId(String),

    /// Server response is invalid
    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    /// Request frame is malformed or carries an unknown command
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Storage server is offline
    #[error("Storage server is offline: {0}")]
    StorageServerOffline(String),

    /// Tracker server is offline
    #[error("Tracker server is offline: {0}")]
    TrackerServerOffline(String),

    /// Insufficient storage space
    #[error("Insufficient storage space")]
    InsufficientSpace,

    /// Server is at its connection cap
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// File already exists
    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    /// Invalid metadata format
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Operation is not supported
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Invalid argument was provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Binlog or cursor state cannot be upheld; callers abort the process
    #[error("Data integrity failure: {0}")]
    Integrity(String),

    /// Protocol-level error
    #[error("Protocol error (code {code}): {message}")]
    Protocol { code: u8, message: String },

    /// Network-related error
    #[error("Network error during {operation} to {addr}: {source}")]
    Network {
        operation: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 conversion error
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl FastDFSError {
    /// Whether a client retry can possibly succeed
    ///
    /// Invalid arguments and missing files surface immediately; transient
    /// network failures and busy servers are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FastDFSError::ConnectionTimeout(_)
            | FastDFSError::NetworkTimeout(_)
            | FastDFSError::Network { .. }
            | FastDFSError::ServerBusy(_)
            | FastDFSError::StorageServerOffline(_)
            | FastDFSError::TrackerServerOffline(_) => true,
            FastDFSError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

/// Maps FastDFS protocol status codes to Rust errors
///
/// Status code 0 indicates success (no error).
pub fn map_status_to_error(status: u8) -> Option<FastDFSError> {
    match status {
        STATUS_OK => None,
        STATUS_ENOENT => Some(FastDFSError::FileNotFound(String::new())),
        STATUS_EEXIST => Some(FastDFSError::FileAlreadyExists(String::new())),
        STATUS_EBUSY => Some(FastDFSError::ServerBusy(String::new())),
        STATUS_EINVAL => Some(FastDFSError::InvalidArgument(String::new())),
        STATUS_ENOSPC => Some(FastDFSError::InsufficientSpace),
        _ => Some(FastDFSError::Protocol {
            code: status,
            message: format!("Unknown error code: {}", status),
        }),
    }
}

/// Collapses an internal error to the errno byte a server puts in the
/// response header
pub fn error_to_status(err: &FastDFSError) -> u8 {
    match err {
        FastDFSError::FileNotFound(_) | FastDFSError::GroupNotFound(_) => STATUS_ENOENT,
        FastDFSError::FileAlreadyExists(_) => STATUS_EEXIST,
        FastDFSError::ServerBusy(_) => STATUS_EBUSY,
        FastDFSError::InsufficientSpace | FastDFSError::NoStorageServer => STATUS_ENOSPC,
        FastDFSError::InvalidArgument(_)
        | FastDFSError::InvalidRequest(_)
        | FastDFSError::InvalidResponse(_)
        | FastDFSError::InvalidFileId(_)
        | FastDFSError::InvalidMetadata(_)
        | FastDFSError::OperationNotSupported(_) => STATUS_EINVAL,
        FastDFSError::Protocol { code, .. } => *code,
        FastDFSError::Io(e) => match e.kind() {
            std::io::ErrorKind::NotFound => STATUS_ENOENT,
            std::io::ErrorKind::AlreadyExists => STATUS_EEXIST,
            _ => STATUS_EIO,
        },
        _ => STATUS_EIO,
    }
}
