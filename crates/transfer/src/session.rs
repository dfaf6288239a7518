//! Connection seams used by the transfer engine.
//!
//! [`DataObjectConnection`] is one authenticated server connection able to
//! issue data-object RPCs. [`ConnectionProvider`] lends such connections out;
//! [`ConnectionPool`] is a bounded provider built on a [`Connector`].

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use irods_protocol::{
    EncryptionContext, FileHandle, OpenMode, RedirectionHandle, ReplicaAccessToken, Whence,
};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::TransferError;

/// Boxed future returned by connection trait methods.
pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Runs `fut`, failing with [`TransferError::Timeout`] after `limit`.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout(format!("{what} after {}s", limit.as_secs()))),
    }
}

/// Seeks `handle` to an absolute `offset`, checking where the server landed.
pub async fn seek_to<C>(
    conn: &mut C,
    handle: &FileHandle,
    offset: i64,
    limit: Duration,
) -> Result<(), TransferError>
where
    C: DataObjectConnection + ?Sized,
{
    let landed = with_timeout(limit, "seek", conn.seek(handle, offset, Whence::Set)).await?;
    if landed != offset {
        return Err(TransferError::Protocol(format!(
            "seek to {offset} landed at {landed}"
        )));
    }
    Ok(())
}

/// Data-object RPCs on one server connection.
pub trait DataObjectConnection: Send {
    /// Opens a data object, returning the handle and its starting offset.
    fn open<'a>(
        &'a mut self,
        path: &'a str,
        resource: &'a str,
        mode: OpenMode,
    ) -> RpcFuture<'a, (FileHandle, i64)>;

    /// Opens the replica another connection holds open, using its access token.
    fn open_with_replica_token<'a>(
        &'a mut self,
        path: &'a str,
        token: &'a ReplicaAccessToken,
        mode: OpenMode,
    ) -> RpcFuture<'a, FileHandle>;

    /// Moves the handle's position and returns the new absolute offset.
    fn seek<'a>(
        &'a mut self,
        handle: &'a FileHandle,
        offset: i64,
        whence: Whence,
    ) -> RpcFuture<'a, i64>;

    /// Reads into `buf`. Returns 0 at end of object.
    fn read<'a>(&'a mut self, handle: &'a FileHandle, buf: &'a mut [u8]) -> RpcFuture<'a, usize>;

    fn write<'a>(&'a mut self, handle: &'a FileHandle, data: &'a [u8]) -> RpcFuture<'a, ()>;

    fn close<'a>(&'a mut self, handle: &'a FileHandle) -> RpcFuture<'a, ()>;

    /// Closes a handle opened with a replica token without finalizing the object.
    fn close_replica<'a>(&'a mut self, handle: &'a FileHandle) -> RpcFuture<'a, ()>;

    fn replicate<'a>(
        &'a mut self,
        path: &'a str,
        resource: &'a str,
        update: bool,
        admin: bool,
    ) -> RpcFuture<'a, ()>;

    /// Fetches the token that lets other connections write into `handle`'s replica.
    fn replica_access_info<'a>(
        &'a mut self,
        handle: &'a FileHandle,
    ) -> RpcFuture<'a, ReplicaAccessToken>;

    /// Asks where to fetch `path` from. `size` lets the server pick a
    /// stream count.
    fn redirection_for_get<'a>(
        &'a mut self,
        path: &'a str,
        resource: &'a str,
        size: i64,
    ) -> RpcFuture<'a, RedirectionHandle>;

    fn redirection_for_put<'a>(
        &'a mut self,
        path: &'a str,
        resource: &'a str,
        size: i64,
    ) -> RpcFuture<'a, RedirectionHandle>;

    /// Tells the catalog a redirected transfer is over. Must be sent exactly
    /// once per handle, on the connection that obtained it.
    fn complete_redirection<'a>(&'a mut self, handle: &'a RedirectionHandle) -> RpcFuture<'a, ()>;

    /// Encryption negotiated for this connection, if any.
    fn encryption(&self) -> Option<EncryptionContext>;
}

/// Lends out data-object connections.
pub trait ConnectionProvider: Send + Sync + 'static {
    type Connection: DataObjectConnection + 'static;

    /// Waits for one connection.
    fn acquire(&self) -> RpcFuture<'_, Self::Connection>;

    /// Returns between one and `count` connections.
    fn acquire_many(&self, count: usize) -> RpcFuture<'_, Vec<Self::Connection>>;

    /// Returns a healthy connection.
    fn release(&self, conn: Self::Connection);

    /// Drops a connection that must not be reused.
    fn discard(&self, conn: Self::Connection);

    /// Whether the server accepts writes from several connections into one replica.
    fn supports_parallel_write(&self) -> bool;

    fn max_pool_size(&self) -> usize;

    /// Resource used when a caller passes an empty resource name.
    fn default_resource(&self) -> &str;
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A lent connection that goes back to its provider when dropped.
///
/// A connection dropped while marked broken, or during a panic, is
/// discarded instead of being returned for reuse.
pub struct PooledConnection<P: ConnectionProvider> {
    provider: Arc<P>,
    conn: Option<P::Connection>,
    broken: bool,
}

impl<P: ConnectionProvider> PooledConnection<P> {
    pub async fn acquire(provider: &Arc<P>) -> Result<Self, TransferError> {
        let conn = provider.acquire().await?;
        Ok(Self::wrap(provider, conn))
    }

    pub async fn acquire_many(provider: &Arc<P>, count: usize) -> Result<Vec<Self>, TransferError> {
        let conns = provider.acquire_many(count).await?;
        Ok(conns.into_iter().map(|c| Self::wrap(provider, c)).collect())
    }

    fn wrap(provider: &Arc<P>, conn: P::Connection) -> Self {
        Self {
            provider: Arc::clone(provider),
            conn: Some(conn),
            broken: false,
        }
    }

    /// Discards the connection instead of releasing it on drop.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Undoes [`mark_broken`](Self::mark_broken) once the connection is
    /// known to be idle again.
    pub fn mark_healthy(&mut self) {
        self.broken = false;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Marks the connection broken if `result` failed at the transport level.
    pub fn check<T>(&mut self, result: &Result<T, TransferError>) {
        if let Err(e) = result {
            if e.is_connection_fatal() {
                self.broken = true;
            }
        }
    }
}

impl<P: ConnectionProvider> Deref for PooledConnection<P> {
    type Target = P::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is only taken on drop")
    }
}

impl<P: ConnectionProvider> DerefMut for PooledConnection<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is only taken on drop")
    }
}

impl<P: ConnectionProvider> Drop for PooledConnection<P> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken || std::thread::panicking() {
            self.provider.discard(conn);
        } else {
            self.provider.release(conn);
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

/// Establishes new server connections for a [`ConnectionPool`].
pub trait Connector: Send + Sync + 'static {
    type Connection: DataObjectConnection + 'static;

    fn connect(&self) -> RpcFuture<'_, Self::Connection>;

    fn supports_parallel_write(&self) -> bool {
        true
    }
}

/// Bounded pool that reuses idle connections.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    permits: Semaphore,
    idle: Mutex<Vec<C::Connection>>,
    max_size: usize,
    default_resource: String,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, max_size: usize, default_resource: impl Into<String>) -> Self {
        let max_size = max_size.max(1);
        Self {
            connector,
            permits: Semaphore::new(max_size),
            idle: Mutex::new(Vec::new()),
            max_size,
            default_resource: default_resource.into(),
        }
    }

    /// Connections currently lent out.
    pub fn in_use(&self) -> usize {
        self.max_size - self.permits.available_permits()
    }

    /// Connections waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle_conns().len()
    }

    fn idle_conns(&self) -> std::sync::MutexGuard<'_, Vec<C::Connection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands out an idle connection or dials a new one. The caller holds a
    /// permit and forgets it only once this succeeds.
    async fn checkout(&self) -> Result<C::Connection, TransferError> {
        let reused = self.idle_conns().pop();
        if let Some(conn) = reused {
            return Ok(conn);
        }
        let conn = self.connector.connect().await?;
        debug!(in_use = self.in_use(), "opened pooled connection");
        Ok(conn)
    }
}

impl<C: Connector> ConnectionProvider for ConnectionPool<C> {
    type Connection = C::Connection;

    fn acquire(&self) -> RpcFuture<'_, Self::Connection> {
        Box::pin(async move {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| TransferError::Transport("connection pool closed".into()))?;
            // Dropping this future mid-dial hands the permit back.
            let conn = self.checkout().await?;
            permit.forget();
            Ok(conn)
        })
    }

    fn acquire_many(&self, count: usize) -> RpcFuture<'_, Vec<Self::Connection>> {
        Box::pin(async move {
            let count = count.clamp(1, self.max_size);
            let mut conns = vec![self.acquire().await?];

            // Take only what is free right now so concurrent transfers cannot
            // deadlock each other waiting for a full set.
            while conns.len() < count {
                let Ok(permit) = self.permits.try_acquire() else {
                    break;
                };
                match self.checkout().await {
                    Ok(conn) => {
                        permit.forget();
                        conns.push(conn);
                    }
                    Err(e) => {
                        warn!(error = %e, got = conns.len(), "could not open extra connection");
                        break;
                    }
                }
            }
            Ok(conns)
        })
    }

    fn release(&self, conn: Self::Connection) {
        self.idle_conns().push(conn);
        self.permits.add_permits(1);
    }

    fn discard(&self, conn: Self::Connection) {
        drop(conn);
        self.permits.add_permits(1);
    }

    fn supports_parallel_write(&self) -> bool {
        self.connector.supports_parallel_write()
    }

    fn max_pool_size(&self) -> usize {
        self.max_size
    }

    fn default_resource(&self) -> &str {
        &self.default_resource
    }
}
