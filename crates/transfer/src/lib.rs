//! Parallel, resumable transfer of data objects between a local filesystem
//! and an iRODS zone.
//!
//! Large files are split into contiguous byte ranges, each moved by its own
//! task over its own pooled connection. Parallel uploads share one open
//! replica through a replica access token; downloads can persist per-range
//! progress to a checkpoint file and resume after a crash. The same
//! machinery is also offered in block mode, where fixed-size blocks are
//! pulled off a shared queue and completed offsets are streamed back to the
//! caller.

mod blocks;
pub mod checkpoint;
pub mod checksum;
pub mod config;
mod download;
mod engine;
pub mod partition;
pub mod progress;
pub mod replica;
pub mod session;
mod types;
mod upload;
mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use blocks::BlockTransfer;
pub use checkpoint::{CheckpointEntry, CheckpointWriter, TransferCheckpoint, checkpoint_path};
pub use checksum::{ChecksumAlgorithm, checksum_bytes, file_checksum, verify_file};
pub use config::TransferConfig;
pub use engine::TransferEngine;
pub use partition::{block_length, block_offsets, partition_ranges, task_count};
pub use progress::{ProgressAggregator, ProgressCallback, TaskProgress};
pub use replica::ReplicaCoordinator;
pub use session::{
    ConnectionPool, ConnectionProvider, Connector, DataObjectConnection, PooledConnection,
    RpcFuture,
};
pub use types::{ByteRange, TransferJob, TransferOptions};

/// Files smaller than this are always moved by a single task: 32 MiB.
pub const MIN_TASK_SIZE: i64 = 32 * 1024 * 1024;

/// Upper bound on concurrent tasks when the caller does not ask for more.
pub const MAX_TASK_COUNT: usize = 4;

/// Default block size for block-mode transfers: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: i64 = 1024 * 1024;

/// Default per-task copy buffer: 8 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection error: {0}")]
    Transport(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl TransferError {
    /// Returns `true` when the connection that produced this error should not
    /// be returned to a pool.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, TransferError::Transport(_) | TransferError::Timeout(_))
    }
}

impl From<irods_protocol::ProtocolError> for TransferError {
    fn from(err: irods_protocol::ProtocolError) -> Self {
        TransferError::Protocol(err.to_string())
    }
}
