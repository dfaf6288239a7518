//! Block-mode transfers.
//!
//! The file is cut into fixed-size blocks whose offsets are queued up front.
//! Each task holds one connection and one open handle, and keeps pulling the
//! next offset off the shared queue until it is empty. The offset of every
//! finished block is sent to the caller as it completes.

use std::path::Path;
use std::sync::Arc;

use irods_protocol::{OpenMode, ReplicaAccessToken};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointEntry, CheckpointWriter, TransferCheckpoint};
use crate::config::TransferConfig;
use crate::download::{load_checkpoint, prepare_local_file, receive_remote_range};
use crate::engine::{TransferEngine, check_cancelled};
use crate::partition::{block_length, block_offsets, task_count};
use crate::progress::{ProgressAggregator, TaskProgress};
use crate::replica::{ReplicaCoordinator, replicate};
use crate::session::{
    ConnectionProvider, DataObjectConnection, PooledConnection, seek_to, with_timeout,
};
use crate::types::{ByteRange, TransferJob, TransferOptions};
use crate::upload::send_local_range;
use crate::worker::WorkerPool;
use crate::TransferError;

/// A running block-mode transfer.
///
/// Both receivers close once every task has finished.
pub struct BlockTransfer {
    /// Start offset of each block as it completes.
    pub completed: mpsc::Receiver<i64>,
    pub errors: mpsc::Receiver<TransferError>,
    pub handle: JoinHandle<()>,
}

impl BlockTransfer {
    /// Drains both queues and waits for the transfer to end.
    ///
    /// Returns the completed offsets in arrival order, or the first error.
    pub async fn wait(mut self) -> Result<Vec<i64>, TransferError> {
        let mut offsets = Vec::new();
        while let Some(offset) = self.completed.recv().await {
            offsets.push(offset);
        }
        let first = self.errors.recv().await;
        while self.errors.recv().await.is_some() {}

        self.handle
            .await
            .map_err(|e| TransferError::TaskFailed(e.to_string()))?;
        match first {
            Some(e) => Err(e),
            None => Ok(offsets),
        }
    }
}

/// Offsets waiting to be transferred, shared by every task.
#[derive(Clone)]
struct BlockQueue {
    rx: Arc<Mutex<mpsc::Receiver<i64>>>,
}

impl BlockQueue {
    /// Queues `offsets`; the queue is closed once they are taken.
    fn new(offsets: Vec<i64>) -> Self {
        let (tx, rx) = mpsc::channel(offsets.len().max(1));
        for offset in offsets {
            // Capacity covers every offset.
            let _ = tx.try_send(offset);
        }
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    async fn next(&self) -> Option<i64> {
        self.rx.lock().await.recv().await
    }
}

impl<P: ConnectionProvider> TransferEngine<P> {
    /// Starts downloading `remote_path` block by block and returns at once.
    ///
    /// With `options.resume`, blocks recorded as complete in the checkpoint
    /// are reported without being fetched.
    pub fn download_file_in_blocks(
        &self,
        remote_path: &str,
        resource: &str,
        local_path: &Path,
        length: i64,
        options: &TransferOptions,
    ) -> BlockTransfer {
        let block_size = self.block_size(options);
        let offsets = block_offsets(length, block_size);
        let tasks = task_count(length, options.task_count, &self.config, true)
            .min(self.provider.max_pool_size())
            .min(offsets.len().max(1));
        let job = Arc::new(TransferJob {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            resource: self.resource_or_default(resource),
            total_length: length,
            block_size,
            task_count: tasks,
        });

        let (completed_tx, completed) = mpsc::channel(offsets.len().max(1));
        let (errors_tx, errors) = mpsc::channel(tasks + 2);
        let engine = self.clone();
        let options = options.clone();
        let handle = tokio::spawn(async move {
            let result = engine
                .run_block_download(job, offsets, &options, completed_tx, errors_tx.clone())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "block download failed");
                let _ = errors_tx.send(e).await;
            }
        });

        BlockTransfer {
            completed,
            errors,
            handle,
        }
    }

    /// Starts uploading `local_path` block by block and returns at once.
    ///
    /// Without parallel-write support the blocks are written by one task.
    pub fn upload_file_in_blocks(
        &self,
        local_path: &Path,
        remote_path: &str,
        resource: &str,
        options: &TransferOptions,
    ) -> BlockTransfer {
        let block_size = self.block_size(options);
        let size = std::fs::metadata(local_path).map(|m| m.len() as i64);
        let length = *size.as_ref().unwrap_or(&0);
        let offsets = block_offsets(length, block_size);

        let parallel = self.provider.supports_parallel_write();
        let worker_cap = self.provider.max_pool_size().saturating_sub(1).max(1);
        let tasks = task_count(length, options.task_count, &self.config, parallel)
            .min(worker_cap)
            .min(offsets.len().max(1));
        let job = Arc::new(TransferJob {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            resource: self.resource_or_default(resource),
            total_length: length,
            block_size,
            task_count: tasks,
        });

        let (completed_tx, completed) = mpsc::channel(offsets.len().max(1));
        let (errors_tx, errors) = mpsc::channel(tasks + 2);
        let engine = self.clone();
        let options = options.clone();
        let handle = tokio::spawn(async move {
            let result = match size {
                Ok(_) => {
                    engine
                        .run_block_upload(job, offsets, &options, completed_tx, errors_tx.clone())
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(error = %e, "block upload failed");
                let _ = errors_tx.send(e).await;
            }
        });

        BlockTransfer {
            completed,
            errors,
            handle,
        }
    }

    fn block_size(&self, options: &TransferOptions) -> i64 {
        if options.block_size > 0 {
            options.block_size
        } else {
            self.config.block_size
        }
    }

    async fn run_block_download(
        &self,
        job: Arc<TransferJob>,
        offsets: Vec<i64>,
        options: &TransferOptions,
        completed: mpsc::Sender<i64>,
        errors: mpsc::Sender<TransferError>,
    ) -> Result<(), TransferError> {
        info!(
            remote = %job.remote_path,
            local = %job.local_path.display(),
            size = job.total_length,
            blocks = offsets.len(),
            tasks = job.task_count,
            "downloading in blocks"
        );

        let progress = ProgressAggregator::new(job.total_length, options.progress.clone());
        progress.notify();

        if job.total_length <= 0 {
            prepare_local_file(&job.local_path, 0, true).await?;
            return Ok(());
        }

        let conns = PooledConnection::acquire_many(&self.provider, job.task_count).await?;

        let checkpoint = if options.resume {
            Some(load_checkpoint(&job.local_path, job.total_length, conns.len()).await?)
        } else {
            None
        };
        let fresh = checkpoint.as_ref().is_none_or(TransferCheckpoint::is_empty);
        prepare_local_file(&job.local_path, job.total_length, fresh).await?;
        let mut writer = match &checkpoint {
            Some(cp) => Some(CheckpointWriter::create(cp).await?),
            None => None,
        };

        let mut pending = Vec::with_capacity(offsets.len());
        let mut skipped = progress.task();
        for offset in offsets {
            let length = block_length(job.total_length, job.block_size, offset);
            let done = checkpoint
                .as_ref()
                .map(|cp| cp.completed_for(offset, length))
                .unwrap_or(0);
            if done >= length {
                skipped.advance(length);
                let _ = completed.send(offset).await;
            } else {
                pending.push(offset);
            }
        }
        debug!(pending = pending.len(), "blocks queued");

        let queue = BlockQueue::new(pending);
        let (status_tx, mut status_rx) = mpsc::channel::<CheckpointEntry>(conns.len() * 16);
        let mut pool = WorkerPool::reporting_to(errors);
        for (task_id, conn) in conns.into_iter().enumerate() {
            pool.spawn(
                task_id,
                download_blocks(
                    conn,
                    Arc::clone(&job),
                    queue.clone(),
                    progress.task(),
                    completed.clone(),
                    writer.is_some().then(|| status_tx.clone()),
                    Arc::clone(&self.config),
                    options.cancel.clone(),
                ),
            );
        }
        drop(status_tx);
        drop(completed);

        while let Some(entry) = status_rx.recv().await {
            if let Some(w) = writer.as_mut() {
                if let Err(e) = w.append(&entry).await {
                    warn!(error = %e, offset = entry.start_offset, "failed to record checkpoint");
                }
            }
        }

        let joined = pool.join().await;
        if let Some(w) = writer {
            if joined.is_ok() {
                w.remove().await?;
            }
        }
        if joined.is_ok() {
            info!(remote = %job.remote_path, "block download complete");
        }
        Ok(())
    }

    async fn run_block_upload(
        &self,
        job: Arc<TransferJob>,
        offsets: Vec<i64>,
        options: &TransferOptions,
        completed: mpsc::Sender<i64>,
        errors: mpsc::Sender<TransferError>,
    ) -> Result<(), TransferError> {
        info!(
            local = %job.local_path.display(),
            remote = %job.remote_path,
            size = job.total_length,
            blocks = offsets.len(),
            tasks = job.task_count,
            "uploading in blocks"
        );

        let progress = ProgressAggregator::new(job.total_length, options.progress.clone());
        progress.notify();

        let want = if job.task_count > 1 { job.task_count + 1 } else { 1 };
        let mut conns = PooledConnection::acquire_many(&self.provider, want).await?;
        let queue = BlockQueue::new(offsets);
        let mut pool = WorkerPool::reporting_to(errors);

        if conns.len() < 2 {
            let conn = conns.remove(0);
            pool.spawn(
                0,
                upload_blocks(
                    conn,
                    Arc::clone(&job),
                    WriteTarget::Direct,
                    queue,
                    progress.task(),
                    completed,
                    Arc::clone(&self.config),
                    options.cancel.clone(),
                ),
            );
            if pool.join().await.is_ok() {
                if options.replicate {
                    let mut conn = PooledConnection::acquire(&self.provider).await?;
                    let replicated = replicate(&mut *conn, &job.remote_path, &self.config).await;
                    conn.check(&replicated);
                    replicated?;
                }
                info!(remote = %job.remote_path, "block upload complete");
            }
            return Ok(());
        }

        let mut control = conns.remove(0);
        let begun =
            ReplicaCoordinator::begin(&mut *control, &job.remote_path, &job.resource, &self.config)
                .await;
        control.check(&begun);
        let coordinator = begun?;

        for (task_id, conn) in conns.into_iter().enumerate() {
            pool.spawn(
                task_id,
                upload_blocks(
                    conn,
                    Arc::clone(&job),
                    WriteTarget::Replica(coordinator.token().clone()),
                    queue.clone(),
                    progress.task(),
                    completed.clone(),
                    Arc::clone(&self.config),
                    options.cancel.clone(),
                ),
            );
        }
        drop(completed);

        let joined = pool.join().await;
        let finished = coordinator.finish(&mut *control, &self.config).await;
        control.check(&finished);
        finished?;

        if joined.is_ok() {
            if options.replicate {
                let replicated = replicate(&mut *control, &job.remote_path, &self.config).await;
                control.check(&replicated);
                replicated?;
            }
            info!(remote = %job.remote_path, "block upload complete");
        }
        Ok(())
    }
}

/// Pulls blocks off `queue` and copies each into the local file.
#[allow(clippy::too_many_arguments)]
async fn download_blocks<P: ConnectionProvider>(
    mut conn: PooledConnection<P>,
    job: Arc<TransferJob>,
    queue: BlockQueue,
    mut progress: TaskProgress,
    completed: mpsc::Sender<i64>,
    status: Option<mpsc::Sender<CheckpointEntry>>,
    config: Arc<TransferConfig>,
    cancel: CancellationToken,
) -> Result<(), TransferError> {
    // Stays broken unless the handle is closed again.
    conn.mark_broken();
    let opened = with_timeout(
        config.operation_timeout,
        "open",
        conn.open(&job.remote_path, &job.resource, OpenMode::Read),
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

    let fetched = async {
        loop {
            check_cancelled(&cancel)?;
            let Some(offset) = queue.next().await else {
                break;
            };
            let block = ByteRange::new(offset, block_length(job.total_length, job.block_size, offset));
            let mut got = 0;
            receive_remote_range(
                &mut *conn,
                &handle,
                &job.local_path,
                block,
                &mut got,
                &mut progress,
                None,
                &config,
                &cancel,
            )
            .await?;
            if got < block.length {
                return Err(TransferError::Protocol(format!(
                    "object ended inside block at {offset} ({got} of {} bytes)",
                    block.length
                )));
            }

            if let Some(tx) = &status {
                let entry = CheckpointEntry {
                    start_offset: offset,
                    length: block.length,
                    completed_length: block.length,
                };
                let _ = tx.send(entry).await;
            }
            let _ = completed.send(offset).await;
        }
        Ok::<(), TransferError>(())
    }
    .await;

    let closed = with_timeout(config.operation_timeout, "close", conn.close(&handle)).await;
    if closed.is_ok() {
        conn.mark_healthy();
    }
    conn.check(&fetched);
    fetched.and(closed)
}

/// How an upload task opens the object.
enum WriteTarget {
    /// Sole writer: open and close normally.
    Direct,
    /// One of several writers sharing a replica.
    Replica(ReplicaAccessToken),
}

/// Pulls blocks off `queue` and writes each from the local file.
#[allow(clippy::too_many_arguments)]
async fn upload_blocks<P: ConnectionProvider>(
    mut conn: PooledConnection<P>,
    job: Arc<TransferJob>,
    target: WriteTarget,
    queue: BlockQueue,
    mut progress: TaskProgress,
    completed: mpsc::Sender<i64>,
    config: Arc<TransferConfig>,
    cancel: CancellationToken,
) -> Result<(), TransferError> {
    // Stays broken unless the handle is closed again.
    conn.mark_broken();
    let opened = match &target {
        WriteTarget::Direct => with_timeout(
            config.operation_timeout,
            "open",
            conn.open(&job.remote_path, &job.resource, OpenMode::Write),
        )
        .await
        .map(|(handle, _)| handle),
        WriteTarget::Replica(token) => {
            ReplicaCoordinator::open_replica(&mut *conn, &job.remote_path, token, &config).await
        }
    };
    let handle = match opened {
        Ok(handle) => handle,
        Err(e) => {
            if !e.is_connection_fatal() {
                conn.mark_healthy();
            }
            return Err(e);
        }
    };

    let sent = async {
        loop {
            check_cancelled(&cancel)?;
            let Some(offset) = queue.next().await else {
                break;
            };
            let block = ByteRange::new(offset, block_length(job.total_length, job.block_size, offset));
            seek_to(&mut *conn, &handle, offset, config.operation_timeout).await?;
            send_local_range(
                &mut *conn,
                &handle,
                &job.local_path,
                block,
                &mut progress,
                &config,
                &cancel,
            )
            .await?;
            let _ = completed.send(offset).await;
        }
        Ok::<(), TransferError>(())
    }
    .await;

    let closed = match &target {
        WriteTarget::Direct => {
            with_timeout(config.operation_timeout, "close", conn.close(&handle)).await
        }
        WriteTarget::Replica(_) => {
            ReplicaCoordinator::close_replica(&mut *conn, &handle, &config).await
        }
    };
    if closed.is_ok() {
        conn.mark_healthy();
    }
    conn.check(&sent);
    sent.and(closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::checkpoint::{TransferCheckpoint, checkpoint_path};
    use crate::session::ConnectionPool;
    use crate::testing::{MemoryConnector, MemoryServer, pattern};

    const MIB: usize = 1024 * 1024;

    fn engine(server: &MemoryServer) -> TransferEngine<ConnectionPool<MemoryConnector>> {
        let pool = ConnectionPool::new(server.connector(), 8, "demoResc");
        let config = TransferConfig {
            min_task_size: 4 * MIB as i64,
            buffer_size: 256 * 1024,
            ..Default::default()
        };
        TransferEngine::new(Arc::new(pool), config)
    }

    #[tokio::test]
    async fn download_reports_every_block() {
        let server = MemoryServer::new();
        let data = pattern(5 * MIB + 100);
        server.put_object("/z/a", data.clone());
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");

        let transfer = engine(&server).download_file_in_blocks(
            "/z/a",
            "",
            &local,
            data.len() as i64,
            &TransferOptions::default().with_task_count(3),
        );
        let mut offsets = transfer.wait().await.unwrap();
        offsets.sort();

        let expected: Vec<i64> = (0..6).map(|i| i * MIB as i64).collect();
        assert_eq!(offsets, expected);
        assert!(std::fs::read(&local).unwrap() == data);
        assert_eq!(server.open_handles(), 0);
    }

    #[tokio::test]
    async fn resumed_download_fetches_only_missing_block() {
        let server = MemoryServer::new();
        let data = pattern(3 * MIB);
        server.put_object("/z/a", data.clone());
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");
        let engine = engine(&server);
        let options = TransferOptions::default().with_task_count(1).resumable();

        server.fail_read_at(Some(2 * MIB as i64 + 10));
        let err = engine
            .download_file_in_blocks("/z/a", "", &local, data.len() as i64, &options)
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transport(_)));

        let checkpoint = TransferCheckpoint::load(&local).unwrap().unwrap();
        assert!(checkpoint.entry(0).unwrap().is_complete());
        assert!(checkpoint.entry(MIB as i64).unwrap().is_complete());
        assert!(checkpoint.entry(2 * MIB as i64).is_none());

        server.fail_read_at(None);
        server.reset_stats();
        let mut offsets = engine
            .download_file_in_blocks("/z/a", "", &local, data.len() as i64, &options)
            .wait()
            .await
            .unwrap();
        offsets.sort();

        assert_eq!(offsets, vec![0, MIB as i64, 2 * MIB as i64]);
        assert!(std::fs::read(&local).unwrap() == data);
        assert!(!checkpoint_path(&local).exists());

        let reads = server.stats().read_offsets;
        assert!(!reads.is_empty());
        assert!(reads.iter().all(|&off| off >= 2 * MIB as i64));
    }

    #[tokio::test]
    async fn resumed_block_download_drops_stale_tail() {
        let server = MemoryServer::new();
        let data = pattern(MIB + 7);
        server.put_object("/z/a", data.clone());
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");
        std::fs::write(&local, vec![0xAA; 3 * MIB]).unwrap();

        engine(&server)
            .download_file_in_blocks(
                "/z/a",
                "",
                &local,
                data.len() as i64,
                &TransferOptions::default().resumable(),
            )
            .wait()
            .await
            .unwrap();

        assert!(std::fs::read(&local).unwrap() == data);
    }

    #[tokio::test]
    async fn upload_in_blocks_through_replica_token() {
        let server = MemoryServer::new();
        let data = pattern(4 * MIB + 3);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");
        std::fs::write(&local, &data).unwrap();

        let options = TransferOptions {
            task_count: 3,
            block_size: MIB as i64,
            ..Default::default()
        };
        let offsets = engine(&server)
            .upload_file_in_blocks(&local, "/z/a", "", &options)
            .wait()
            .await
            .unwrap();

        assert_eq!(offsets.len(), 5);
        assert!(server.object("/z/a").unwrap() == data);
        let stats = server.stats();
        assert_eq!(stats.token_opens, 3);
        assert_eq!(stats.open_replicas_at_finalize, 0);
    }

    #[tokio::test]
    async fn upload_in_blocks_without_parallel_write() {
        let server = MemoryServer::new();
        server.set_parallel_write(false);
        let data = pattern(3 * MIB);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");
        std::fs::write(&local, &data).unwrap();

        let offsets = engine(&server)
            .upload_file_in_blocks(&local, "/z/a", "", &TransferOptions::default().with_task_count(4))
            .wait()
            .await
            .unwrap();

        assert_eq!(offsets, vec![0, MIB as i64, 2 * MIB as i64]);
        assert!(server.object("/z/a").unwrap() == data);
        assert_eq!(server.stats().token_opens, 0);
    }

    #[tokio::test]
    async fn missing_local_file_reports_error() {
        let server = MemoryServer::new();
        let dir = tempfile::tempdir().unwrap();

        let err = engine(&server)
            .upload_file_in_blocks(&dir.path().join("absent"), "/z/a", "", &TransferOptions::default())
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
