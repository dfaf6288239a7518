//! Transfer tunables.
//!
//! Loaded from JSON. Every field is optional; missing fields take the
//! defaults below. Timeouts are written as whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE, MAX_TASK_COUNT, MIN_TASK_SIZE, TransferError};

/// Tunables shared by every transfer started from one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Files at or below this size are moved by one task.
    pub min_task_size: i64,
    /// Task count used when the caller does not request one.
    pub max_task_count: usize,
    /// Block size for block-mode transfers.
    pub block_size: i64,
    /// Per-worker copy buffer.
    pub buffer_size: usize,
    /// Limit applied to each data-object RPC.
    #[serde(with = "secs")]
    pub operation_timeout: Duration,
    /// Limit for replication and redirection completion.
    #[serde(with = "secs")]
    pub long_operation_timeout: Duration,
    /// Limit for dialing a resource server.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Socket buffer size requested on resource-server connections.
    pub tcp_buffer_size: usize,
    /// Verify checksums reported by the server after redirected downloads.
    pub verify_checksum: bool,
    /// Times a download task reconnects after losing its connection.
    pub task_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_task_size: MIN_TASK_SIZE,
            max_task_count: MAX_TASK_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            operation_timeout: Duration::from_secs(300),
            long_operation_timeout: Duration::from_secs(1800),
            connect_timeout: Duration::from_secs(30),
            tcp_buffer_size: 4 * 1024 * 1024,
            verify_checksum: true,
            task_retries: 3,
        }
    }
}

impl TransferConfig {
    /// Loads configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no transfer config, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&content)
    }

    /// Parses configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, TransferError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Writes configuration to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "transfer config saved");
        Ok(())
    }

    /// Replaces zero sizes with defaults so later arithmetic never divides by zero.
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.min_task_size <= 0 {
            self.min_task_size = defaults.min_task_size;
        }
        if self.max_task_count == 0 {
            self.max_task_count = defaults.max_task_count;
        }
        if self.block_size <= 0 {
            self.block_size = defaults.block_size;
        }
        if self.buffer_size == 0 {
            self.buffer_size = defaults.buffer_size;
        }
        self
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
