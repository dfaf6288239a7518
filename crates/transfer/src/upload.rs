use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use irods_protocol::{FileHandle, OpenMode, ReplicaAccessToken};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TransferConfig;
use crate::engine::{TransferEngine, buffer_len, check_cancelled};
use crate::partition::{partition_ranges, task_count};
use crate::progress::{ProgressAggregator, TaskProgress};
use crate::replica::{ReplicaCoordinator, replicate};
use crate::session::{
    ConnectionProvider, DataObjectConnection, PooledConnection, seek_to, with_timeout,
};
use crate::types::{ByteRange, TransferJob, TransferOptions};
use crate::worker::WorkerPool;
use crate::TransferError;

impl<P: ConnectionProvider> TransferEngine<P> {
    /// Uploads `local_path` to `remote_path`.
    ///
    /// Large files are written by several tasks into one replica when the
    /// server supports it; otherwise the file is streamed over a single
    /// connection.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        resource: &str,
        options: &TransferOptions,
    ) -> Result<(), TransferError> {
        let total = tokio::fs::metadata(local_path).await?.len() as i64;
        let parallel = self.provider.supports_parallel_write();
        // One connection is reserved for the coordinator.
        let worker_cap = self.provider.max_pool_size().saturating_sub(1).max(1);
        let tasks = task_count(total, options.task_count, &self.config, parallel).min(worker_cap);

        let job = Arc::new(TransferJob {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            resource: self.resource_or_default(resource),
            total_length: total,
            block_size: 0,
            task_count: tasks,
        });

        info!(
            local = %local_path.display(),
            remote = remote_path,
            size = total,
            tasks,
            "uploading"
        );

        let progress = ProgressAggregator::new(total, options.progress.clone());
        progress.notify();

        if total == 0 || tasks <= 1 {
            let conn = PooledConnection::acquire(&self.provider).await?;
            return self.upload_serial(conn, &job, &progress, options).await;
        }

        let mut conns = PooledConnection::acquire_many(&self.provider, tasks + 1).await?;
        if conns.len() < 2 {
            debug!(remote = remote_path, "only one connection available, uploading serially");
            let conn = conns.remove(0);
            return self.upload_serial(conn, &job, &progress, options).await;
        }

        let control = conns.remove(0);
        self.upload_parallel(control, conns, job, progress, options).await
    }

    async fn upload_serial(
        &self,
        mut conn: PooledConnection<P>,
        job: &TransferJob,
        progress: &ProgressAggregator,
        options: &TransferOptions,
    ) -> Result<(), TransferError> {
        upload_whole(&mut conn, job, progress.task(), &self.config, &options.cancel).await?;

        if options.replicate {
            let replicated = replicate(&mut *conn, &job.remote_path, &self.config).await;
            conn.check(&replicated);
            replicated?;
        }
        info!(remote = %job.remote_path, "upload complete");
        Ok(())
    }

    async fn upload_parallel(
        &self,
        mut control: PooledConnection<P>,
        workers: Vec<PooledConnection<P>>,
        job: Arc<TransferJob>,
        progress: ProgressAggregator,
        options: &TransferOptions,
    ) -> Result<(), TransferError> {
        // The coordinator holds the replica open until `finish`.
        control.mark_broken();
        let begun =
            ReplicaCoordinator::begin(&mut *control, &job.remote_path, &job.resource, &self.config)
                .await;
        let coordinator = match begun {
            Ok(coordinator) => coordinator,
            Err(e) => {
                if !e.is_connection_fatal() {
                    control.mark_healthy();
                }
                return Err(e);
            }
        };

        let ranges = partition_ranges(job.total_length, workers.len());
        let mut pool = WorkerPool::new(ranges.len());
        for (task_id, (range, conn)) in ranges.into_iter().zip(workers).enumerate() {
            pool.spawn(
                task_id,
                upload_range(
                    conn,
                    Arc::clone(&job),
                    coordinator.token().clone(),
                    range,
                    progress.task(),
                    Arc::clone(&self.config),
                    options.cancel.clone(),
                ),
            );
        }
        debug!(remote = %job.remote_path, tasks = pool.len(), "upload tasks started");

        let outcome = pool.join().await;
        let finished = coordinator.finish(&mut *control, &self.config).await;
        if finished.is_ok() {
            control.mark_healthy();
        }
        control.check(&finished);
        outcome?;
        finished?;

        if options.replicate {
            let replicated = replicate(&mut *control, &job.remote_path, &self.config).await;
            control.check(&replicated);
            replicated?;
        }
        info!(remote = %job.remote_path, "parallel upload complete");
        Ok(())
    }
}

/// Writes the whole local file through a freshly opened handle.
///
/// The connection stays marked broken unless the handle was closed cleanly.
async fn upload_whole<P: ConnectionProvider>(
    conn: &mut PooledConnection<P>,
    job: &TransferJob,
    mut progress: TaskProgress,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    conn.mark_broken();
    let opened = with_timeout(
        config.operation_timeout,
        "open",
        conn.open(&job.remote_path, &job.resource, OpenMode::Write),
    )
    .await;
    let handle = match opened {
        Ok((handle, _)) => handle,
        Err(e) => {
            if !e.is_connection_fatal() {
                conn.mark_healthy();
            }
            return Err(e);
        }
    };

    let range = ByteRange::new(0, job.total_length);
    let streamed =
        send_local_range(&mut **conn, &handle, &job.local_path, range, &mut progress, config, cancel)
            .await;
    let closed = with_timeout(config.operation_timeout, "close", conn.close(&handle)).await;
    if closed.is_ok() {
        conn.mark_healthy();
    }
    conn.check(&streamed);
    streamed.map(|_| ()).and(closed)
}

/// One parallel upload task: open the shared replica, write one range, close.
async fn upload_range<P: ConnectionProvider>(
    mut conn: PooledConnection<P>,
    job: Arc<TransferJob>,
    token: ReplicaAccessToken,
    range: ByteRange,
    mut progress: TaskProgress,
    config: Arc<TransferConfig>,
    cancel: CancellationToken,
) -> Result<(), TransferError> {
    debug!(offset = range.offset, length = range.length, "upload task starting");

    // Stays broken unless the replica handle is closed again.
    conn.mark_broken();
    let opened = ReplicaCoordinator::open_replica(&mut *conn, &job.remote_path, &token, &config).await;
    let handle = match opened {
        Ok(handle) => handle,
        Err(e) => {
            if !e.is_connection_fatal() {
                conn.mark_healthy();
            }
            return Err(e);
        }
    };

    let streamed = async {
        seek_to(&mut *conn, &handle, range.offset, config.operation_timeout).await?;
        send_local_range(&mut *conn, &handle, &job.local_path, range, &mut progress, &config, &cancel)
            .await
    }
    .await;
    let closed = ReplicaCoordinator::close_replica(&mut *conn, &handle, &config).await;
    if closed.is_ok() {
        conn.mark_healthy();
    }
    conn.check(&streamed);
    streamed.map(|_| ()).and(closed)
}

/// Streams `range` of a local file to `handle`, which must already be
/// positioned at `range.offset`. Returns the bytes sent.
///
/// A local file that ends before the range does is an
/// [`UnexpectedEof`](std::io::ErrorKind::UnexpectedEof) error.
pub(crate) async fn send_local_range<C>(
    conn: &mut C,
    handle: &FileHandle,
    local_path: &Path,
    range: ByteRange,
    progress: &mut TaskProgress,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<i64, TransferError>
where
    C: DataObjectConnection + ?Sized,
{
    let mut file = tokio::fs::File::open(local_path).await?;
    if range.offset > 0 {
        file.seek(SeekFrom::Start(range.offset as u64)).await?;
    }

    let mut buf = vec![0u8; buffer_len(config, range.length)];
    let mut sent = 0i64;
    while sent < range.length {
        check_cancelled(cancel)?;

        let want = ((range.length - sent) as usize).min(buf.len());
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} ended at {} inside range ending at {}",
                    local_path.display(),
                    range.offset + sent,
                    range.end()
                ),
            )));
        }

        with_timeout(config.operation_timeout, "write", conn.write(handle, &buf[..n])).await?;
        sent += n as i64;
        progress.advance(n as i64);
    }
    Ok(sent)
}
