use std::sync::Arc;

use crate::config::TransferConfig;
use crate::session::ConnectionProvider;

/// Entry point for moving files to and from a zone.
///
/// Cheap to clone; clones share the provider and configuration.
pub struct TransferEngine<P: ConnectionProvider> {
    pub(crate) provider: Arc<P>,
    pub(crate) config: Arc<TransferConfig>,
}

impl<P: ConnectionProvider> Clone for TransferEngine<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            config: Arc::clone(&self.config),
        }
    }
}

impl<P: ConnectionProvider> TransferEngine<P> {
    pub fn new(provider: Arc<P>, config: TransferConfig) -> Self {
        Self {
            provider,
            config: Arc::new(config),
        }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Resolves an empty resource name to the provider's default.
    pub(crate) fn resource_or_default(&self, resource: &str) -> String {
        if resource.is_empty() {
            self.provider.default_resource().to_string()
        } else {
            resource.to_string()
        }
    }
}

/// Returns `Err(Cancelled)` once `cancel` has fired.
pub(crate) fn check_cancelled(
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(), crate::TransferError> {
    if cancel.is_cancelled() {
        return Err(crate::TransferError::Cancelled);
    }
    Ok(())
}

/// Copy buffer size for a range of `length` bytes.
pub(crate) fn buffer_len(config: &TransferConfig, length: i64) -> usize {
    (config.buffer_size as i64).min(length).max(1) as usize
}
