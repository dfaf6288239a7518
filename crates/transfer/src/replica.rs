//! Coordination of parallel writes into a single replica.
//!
//! The coordinator opens the logical object on a control connection and
//! fetches a replica access token. Workers open the same replica with that
//! token on their own connections and close it with `close_replica`, which
//! does not finalize the object. Once every worker has closed, the
//! coordinator closes its main handle, which finalizes the object.

use irods_protocol::{FileHandle, OpenMode, ReplicaAccessToken};
use tracing::{debug, warn};

use crate::TransferError;
use crate::config::TransferConfig;
use crate::session::{DataObjectConnection, with_timeout};

/// Holds the main handle of an object being written by several connections.
#[derive(Debug)]
pub struct ReplicaCoordinator {
    main: FileHandle,
    token: ReplicaAccessToken,
}

impl ReplicaCoordinator {
    /// Opens `path` for writing and obtains its replica access token.
    ///
    /// If the token cannot be fetched the main handle is closed again and
    /// the error is returned, so no worker is ever started.
    pub async fn begin<C>(
        conn: &mut C,
        path: &str,
        resource: &str,
        config: &TransferConfig,
    ) -> Result<Self, TransferError>
    where
        C: DataObjectConnection + ?Sized,
    {
        let (main, _) = with_timeout(
            config.operation_timeout,
            "open for parallel write",
            conn.open(path, resource, OpenMode::WriteRead),
        )
        .await?;

        let token = match with_timeout(
            config.operation_timeout,
            "replica access info",
            conn.replica_access_info(&main),
        )
        .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(path, error = %e, "could not obtain replica token, aborting");
                if let Err(close_err) =
                    with_timeout(config.operation_timeout, "close", conn.close(&main)).await
                {
                    warn!(path, error = %close_err, "failed to close main handle");
                }
                return Err(e);
            }
        };

        debug!(path, hierarchy = %token.resource_hierarchy, "replica token acquired");
        Ok(Self { main, token })
    }

    pub fn token(&self) -> &ReplicaAccessToken {
        &self.token
    }

    pub fn main_handle(&self) -> &FileHandle {
        &self.main
    }

    /// Opens the shared replica on a worker connection.
    pub async fn open_replica<C>(
        conn: &mut C,
        path: &str,
        token: &ReplicaAccessToken,
        config: &TransferConfig,
    ) -> Result<FileHandle, TransferError>
    where
        C: DataObjectConnection + ?Sized,
    {
        with_timeout(
            config.operation_timeout,
            "open with replica token",
            conn.open_with_replica_token(path, token, OpenMode::Write),
        )
        .await
    }

    /// Closes a worker's replica handle without finalizing the object.
    pub async fn close_replica<C>(
        conn: &mut C,
        handle: &FileHandle,
        config: &TransferConfig,
    ) -> Result<(), TransferError>
    where
        C: DataObjectConnection + ?Sized,
    {
        with_timeout(
            config.operation_timeout,
            "close replica",
            conn.close_replica(handle),
        )
        .await
    }

    /// Closes the main handle. Call only after every worker has closed its
    /// replica handle.
    pub async fn finish<C>(self, conn: &mut C, config: &TransferConfig) -> Result<(), TransferError>
    where
        C: DataObjectConnection + ?Sized,
    {
        with_timeout(config.operation_timeout, "finalize", conn.close(&self.main)).await?;
        debug!(path = %self.main.path, "parallel write finalized");
        Ok(())
    }
}

/// Replicates `path` to every resource that should hold it.
pub async fn replicate<C>(conn: &mut C, path: &str, config: &TransferConfig) -> Result<(), TransferError>
where
    C: DataObjectConnection + ?Sized,
{
    debug!(path, "replicating");
    with_timeout(
        config.long_operation_timeout,
        "replicate",
        conn.replicate(path, "", true, false),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryServer;

    #[tokio::test]
    async fn token_failure_closes_main_handle() {
        let server = MemoryServer::new();
        server.fail_replica_token(true);
        let mut conn = server.connect();

        let err = ReplicaCoordinator::begin(&mut conn, "/z/a", "demoResc", &TransferConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        assert_eq!(server.open_handles(), 0);
        assert_eq!(server.stats().token_opens, 0);
    }

    #[tokio::test]
    async fn workers_write_through_token() {
        let server = MemoryServer::new();
        let config = TransferConfig::default();
        let mut control = server.connect();
        let mut worker = server.connect();

        let coordinator = ReplicaCoordinator::begin(&mut control, "/z/a", "demoResc", &config)
            .await
            .unwrap();
        let handle =
            ReplicaCoordinator::open_replica(&mut worker, "/z/a", coordinator.token(), &config)
                .await
                .unwrap();
        worker.write(&handle, b"abc").await.unwrap();
        ReplicaCoordinator::close_replica(&mut worker, &handle, &config)
            .await
            .unwrap();
        coordinator.finish(&mut control, &config).await.unwrap();

        assert_eq!(server.object("/z/a").unwrap(), b"abc");
        let stats = server.stats();
        assert_eq!(stats.replica_closes, 1);
        assert_eq!(stats.open_replicas_at_finalize, 0);
        assert_eq!(server.open_handles(), 0);
    }
}
