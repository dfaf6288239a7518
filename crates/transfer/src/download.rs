use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use irods_protocol::{FileHandle, OpenMode};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointEntry, CheckpointWriter, TransferCheckpoint};
use crate::config::TransferConfig;
use crate::engine::{TransferEngine, buffer_len, check_cancelled};
use crate::partition::{partition_ranges, task_count};
use crate::progress::{ProgressAggregator, TaskProgress};
use crate::session::{
    ConnectionProvider, DataObjectConnection, PooledConnection, seek_to, with_timeout,
};
use crate::types::{ByteRange, TransferJob, TransferOptions};
use crate::worker::WorkerPool;
use crate::TransferError;

impl<P: ConnectionProvider> TransferEngine<P> {
    /// Downloads `length` bytes of `remote_path` into `local_path`.
    ///
    /// With `options.resume` set this behaves like
    /// [`download_file_resumable`](Self::download_file_resumable).
    pub async fn download_file(
        &self,
        remote_path: &str,
        resource: &str,
        local_path: &Path,
        length: i64,
        options: &TransferOptions,
    ) -> Result<(), TransferError> {
        self.download_ranges(remote_path, resource, local_path, length, options, options.resume)
            .await
    }

    /// Downloads with a checkpoint file next to `local_path`.
    ///
    /// Ranges recorded as done by an earlier attempt are not fetched again.
    /// The checkpoint is deleted on success and kept on failure.
    pub async fn download_file_resumable(
        &self,
        remote_path: &str,
        resource: &str,
        local_path: &Path,
        length: i64,
        options: &TransferOptions,
    ) -> Result<(), TransferError> {
        self.download_ranges(remote_path, resource, local_path, length, options, true)
            .await
    }

    async fn download_ranges(
        &self,
        remote_path: &str,
        resource: &str,
        local_path: &Path,
        length: i64,
        options: &TransferOptions,
        resume: bool,
    ) -> Result<(), TransferError> {
        let tasks = task_count(length, options.task_count, &self.config, true)
            .min(self.provider.max_pool_size());
        let job = Arc::new(TransferJob {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            resource: self.resource_or_default(resource),
            total_length: length,
            block_size: 0,
            task_count: tasks,
        });

        info!(
            remote = remote_path,
            local = %local_path.display(),
            size = length,
            tasks,
            resume,
            "downloading"
        );

        let progress = ProgressAggregator::new(length, options.progress.clone());
        progress.notify();

        if length <= 0 {
            tokio::fs::File::create(local_path).await?;
            return Ok(());
        }

        let conns = PooledConnection::acquire_many(&self.provider, tasks).await?;
        let ranges = partition_ranges(length, conns.len());

        let checkpoint = if resume {
            Some(load_checkpoint(local_path, length, ranges.len()).await?)
        } else {
            None
        };
        // Bytes on disk are only trusted when a checkpoint vouches for them.
        let fresh = checkpoint.as_ref().is_none_or(TransferCheckpoint::is_empty);
        prepare_local_file(local_path, length, fresh).await?;
        let mut writer = match &checkpoint {
            Some(cp) => Some(CheckpointWriter::create(cp).await?),
            None => None,
        };

        let (status_tx, mut status_rx) = mpsc::channel::<CheckpointEntry>(ranges.len() * 16);
        let mut pool = WorkerPool::new(ranges.len());
        for (task_id, (range, conn)) in ranges.into_iter().zip(conns).enumerate() {
            let pieces = match &checkpoint {
                Some(cp) => cp.remaining(range),
                None => vec![range],
            };
            let missing: i64 = pieces.iter().map(|p| p.length).sum();
            let mut task_progress = progress.task();
            task_progress.update(range.length - missing);
            if pieces.is_empty() {
                debug!(task_id, offset = range.offset, "range already complete");
                continue;
            }

            pool.spawn(
                task_id,
                download_range(
                    conn,
                    Arc::clone(&self.provider),
                    Arc::clone(&job),
                    pieces,
                    task_progress,
                    writer.is_some().then(|| status_tx.clone()),
                    Arc::clone(&self.config),
                    options.cancel.clone(),
                ),
            );
        }
        drop(status_tx);
        debug!(remote = remote_path, tasks = pool.len(), "download tasks started");

        // Tasks report range progress here; this loop is the only writer of
        // the checkpoint file.
        while let Some(entry) = status_rx.recv().await {
            if let Some(w) = writer.as_mut() {
                if let Err(e) = w.append(&entry).await {
                    warn!(error = %e, offset = entry.start_offset, "failed to record checkpoint");
                }
            }
        }

        let outcome = pool.join().await;
        match (&outcome, writer) {
            (Ok(()), Some(w)) => w.remove().await?,
            (Err(_), Some(w)) => {
                debug!(checkpoint = %w.path().display(), "keeping checkpoint for resume");
            }
            _ => {}
        }
        outcome?;

        info!(remote = remote_path, "download complete");
        Ok(())
    }
}

/// Loads a matching checkpoint, ignoring it if the partial file is gone.
pub(crate) async fn load_checkpoint(
    local_path: &Path,
    size: i64,
    threads: usize,
) -> Result<TransferCheckpoint, TransferError> {
    let exists = tokio::fs::try_exists(local_path).await.unwrap_or(false);
    let mut checkpoint = if exists {
        let path = local_path.to_path_buf();
        tokio::task::spawn_blocking(move || TransferCheckpoint::get_or_create(&path, size, threads))
            .await
            .map_err(|e| TransferError::TaskFailed(e.to_string()))?
    } else {
        TransferCheckpoint::new(local_path, size, threads)
    };
    checkpoint.threads = threads;
    Ok(checkpoint)
}

/// Creates the local file at exactly `length` bytes before any task writes
/// into it. Existing contents are kept unless `truncate` is set.
pub(crate) async fn prepare_local_file(
    local_path: &Path,
    length: i64,
    truncate: bool,
) -> Result<(), TransferError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(local_path)
        .await?;
    file.set_len(length.max(0) as u64).await?;
    Ok(())
}

/// One download task: fetch each missing piece of its range.
///
/// A piece that fails at the transport level is retried on a new
/// connection, resuming after the bytes already written.
#[allow(clippy::too_many_arguments)]
async fn download_range<P: ConnectionProvider>(
    mut conn: PooledConnection<P>,
    provider: Arc<P>,
    job: Arc<TransferJob>,
    pieces: Vec<ByteRange>,
    mut progress: TaskProgress,
    status: Option<mpsc::Sender<CheckpointEntry>>,
    config: Arc<TransferConfig>,
    cancel: CancellationToken,
) -> Result<(), TransferError> {
    for piece in pieces {
        debug!(offset = piece.offset, length = piece.length, "download task starting");
        let mut done = 0;
        let mut attempt = 0;
        loop {
            let fetched = fetch_piece(
                &mut conn,
                &job,
                piece,
                &mut done,
                &mut progress,
                status.as_ref(),
                &config,
                &cancel,
            )
            .await;
            match fetched {
                Ok(()) => break,
                Err(e) if e.is_connection_fatal() && attempt < config.task_retries => {
                    attempt += 1;
                    warn!(
                        offset = piece.offset + done,
                        attempt,
                        error = %e,
                        "connection lost, retrying on a new one"
                    );
                    conn.mark_broken();
                    drop(conn);
                    conn = PooledConnection::acquire(&provider).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Opens a read handle, copies `piece` from `done` onwards, and closes it.
///
/// The connection stays marked broken unless the handle was closed cleanly.
#[allow(clippy::too_many_arguments)]
async fn fetch_piece<P: ConnectionProvider>(
    conn: &mut PooledConnection<P>,
    job: &TransferJob,
    piece: ByteRange,
    done: &mut i64,
    progress: &mut TaskProgress,
    status: Option<&mpsc::Sender<CheckpointEntry>>,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
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

    let fetched = receive_remote_range(
        &mut **conn,
        &handle,
        &job.local_path,
        piece,
        done,
        progress,
        status,
        config,
        cancel,
    )
    .await;
    let closed = with_timeout(config.operation_timeout, "close", conn.close(&handle)).await;
    if closed.is_ok() {
        conn.mark_healthy();
    }
    conn.check(&fetched);
    fetched.and(closed)
}

/// Copies `range` of the remote object into the local file at the same
/// offsets, starting `done` bytes into the range. `done` tracks the bytes
/// of the range present locally, also when the copy fails.
///
/// End of object stops the copy without error. With `status`, the range's
/// progress is reported after each buffer is flushed to disk.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn receive_remote_range<C>(
    conn: &mut C,
    handle: &FileHandle,
    local_path: &Path,
    range: ByteRange,
    done: &mut i64,
    progress: &mut TaskProgress,
    status: Option<&mpsc::Sender<CheckpointEntry>>,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<(), TransferError>
where
    C: DataObjectConnection + ?Sized,
{
    let start = range.offset + *done;
    seek_to(conn, handle, start, config.operation_timeout).await?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(local_path)
        .await?;
    file.seek(SeekFrom::Start(start as u64)).await?;

    let mut buf = vec![0u8; buffer_len(config, range.length - *done)];
    while *done < range.length {
        check_cancelled(cancel)?;

        let want = ((range.length - *done) as usize).min(buf.len());
        let n = with_timeout(
            config.operation_timeout,
            "read",
            conn.read(handle, &mut buf[..want]),
        )
        .await?;
        if n == 0 {
            debug!(offset = range.offset + *done, "end of object inside range");
            break;
        }

        file.write_all(&buf[..n]).await?;
        *done += n as i64;
        progress.advance(n as i64);

        if let Some(tx) = status {
            file.flush().await?;
            let entry = CheckpointEntry {
                start_offset: range.offset,
                length: range.length,
                completed_length: *done,
            };
            // The coordinator outlives every task, so a closed channel only
            // means the transfer is being torn down.
            let _ = tx.send(entry).await;
        }
    }
    file.flush().await?;
    Ok(())
}
