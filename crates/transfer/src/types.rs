use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::progress::ProgressCallback;

/// Contiguous span of a file moved by one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: i64,
    pub length: i64,
}

impl ByteRange {
    pub fn new(offset: i64, length: i64) -> Self {
        Self { offset, length }
    }

    /// First offset past the range.
    pub fn end(&self) -> i64 {
        self.offset + self.length
    }
}

/// One file transfer, shared read-only by every task working on it.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub resource: String,
    pub total_length: i64,
    pub block_size: i64,
    pub task_count: usize,
}

/// Per-call knobs for a transfer.
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Concurrent tasks to use; 0 lets the engine decide.
    pub task_count: usize,
    /// Block size for block mode; 0 uses the configured default.
    pub block_size: i64,
    /// Replicate the object after a successful upload.
    pub replicate: bool,
    /// Persist download progress and resume from a previous checkpoint.
    pub resume: bool,
    pub progress: Option<ProgressCallback>,
    /// Cancelled by the caller to stop workers between buffers.
    pub cancel: CancellationToken,
}

impl TransferOptions {
    pub fn with_task_count(mut self, task_count: usize) -> Self {
        self.task_count = task_count;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn resumable(mut self) -> Self {
        self.resume = true;
        self
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("task_count", &self.task_count)
            .field("block_size", &self.block_size)
            .field("replicate", &self.replicate)
            .field("resume", &self.resume)
            .field("progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
