//! Redirect-aware downloads and uploads.
//!
//! The catalog decides per request whether bytes flow over its own
//! connections or through a resource server. Either way the redirection is
//! completed on the control connection that requested it, exactly once,
//! after every stream has finished.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use irods_protocol::{EncryptionContext, RedirectionHandle, RedirectionInfo};
use irods_transfer::progress::ProgressAggregator;
use irods_transfer::replica::replicate;
use irods_transfer::session::{
    ConnectionProvider, DataObjectConnection, PooledConnection, with_timeout,
};
use irods_transfer::{TransferConfig, TransferEngine, TransferError, TransferOptions, verify_file};
use tokio::fs::OpenOptions;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{receive_frames, send_frames};
use crate::connection::ResourceServerConnection;
use crate::error::ResourceServerError;

/// Downloads `remote_path`, following a resource-server redirection when
/// the catalog hands one out.
///
/// Without a redirection the request is completed and its connection
/// released before falling back to [`TransferEngine::download_file`].
pub async fn download_via_redirection<P: ConnectionProvider>(
    engine: &TransferEngine<P>,
    remote_path: &str,
    resource: &str,
    local_path: &Path,
    length: i64,
    options: &TransferOptions,
) -> Result<(), ResourceServerError> {
    let config = engine.config();
    let resource = resolve_resource(engine, resource);
    let mut control = PooledConnection::acquire(engine.provider()).await?;
    // Broken until completed: the catalog holds a descriptor for the request.
    control.mark_broken();
    let requested = with_timeout(
        config.operation_timeout,
        "redirection for get",
        control.redirection_for_get(remote_path, &resource, length),
    )
    .await;
    let handle = settle_request(&mut control, requested)?;

    match handle.redirect_target() {
        None => {
            let completed = complete(&mut control, &handle, config).await;
            // The engine checks out its own connections.
            drop(control);
            completed?;
            debug!(remote = remote_path, "no redirection, downloading over catalog connections");
            engine
                .download_file(remote_path, &resource, local_path, length, options)
                .await?;
        }
        Some(target) => {
            info!(
                remote = remote_path,
                address = %target.address(),
                threads = handle.threads,
                "download redirected to resource server"
            );
            let streams = StreamSetup::new(target, control.encryption(), local_path, config, options);
            let outcome = stream_download(&handle, streams, length, options).await;
            let completed = complete(&mut control, &handle, config).await;
            outcome?;
            completed?;
        }
    }

    if config.verify_checksum && !handle.checksum.is_empty() {
        let path = local_path.to_path_buf();
        let expected = handle.checksum.clone();
        tokio::task::spawn_blocking(move || verify_file(&path, &expected))
            .await
            .map_err(|e| ResourceServerError::TaskFailed(e.to_string()))??;
    }
    info!(remote = remote_path, local = %local_path.display(), "download complete");
    Ok(())
}

/// Uploads `local_path`, following a resource-server redirection when the
/// catalog hands one out.
///
/// Without a redirection the request is completed and its connection
/// released before falling back to [`TransferEngine::upload_file`].
pub async fn upload_via_redirection<P: ConnectionProvider>(
    engine: &TransferEngine<P>,
    local_path: &Path,
    remote_path: &str,
    resource: &str,
    options: &TransferOptions,
) -> Result<(), ResourceServerError> {
    let config = engine.config();
    let resource = resolve_resource(engine, resource);
    let length = tokio::fs::metadata(local_path).await?.len() as i64;
    let mut control = PooledConnection::acquire(engine.provider()).await?;
    control.mark_broken();
    let requested = with_timeout(
        config.operation_timeout,
        "redirection for put",
        control.redirection_for_put(remote_path, &resource, length),
    )
    .await;
    let handle = settle_request(&mut control, requested)?;

    match handle.redirect_target() {
        None => {
            let completed = complete(&mut control, &handle, config).await;
            drop(control);
            completed?;
            debug!(remote = remote_path, "no redirection, uploading over catalog connections");
            // Replicates through the engine when asked to.
            engine
                .upload_file(local_path, remote_path, &resource, options)
                .await?;
        }
        Some(target) => {
            info!(
                remote = remote_path,
                address = %target.address(),
                threads = handle.threads,
                "upload redirected to resource server"
            );
            let streams = StreamSetup::new(target, control.encryption(), local_path, config, options);
            let outcome = stream_upload(&handle, streams, length, options).await;
            let completed = complete(&mut control, &handle, config).await;
            outcome?;
            completed?;

            if options.replicate {
                let replicated = replicate(&mut *control, remote_path, config).await;
                control.check(&replicated);
                replicated?;
            }
        }
    }
    info!(remote = remote_path, size = length, "upload complete");
    Ok(())
}

/// A failed request that left the connection usable hands it back healthy.
fn settle_request<P: ConnectionProvider>(
    control: &mut PooledConnection<P>,
    requested: Result<RedirectionHandle, TransferError>,
) -> Result<RedirectionHandle, ResourceServerError> {
    if let Err(e) = &requested {
        if !e.is_connection_fatal() {
            control.mark_healthy();
        }
    }
    Ok(requested?)
}

/// Bytes moved by one resource-server stream.
type StreamResult = Result<i64, ResourceServerError>;

/// What every stream of one redirected transfer needs.
struct StreamSetup {
    target: RedirectionInfo,
    encryption: Option<EncryptionContext>,
    local_path: PathBuf,
    config: TransferConfig,
    cancel: CancellationToken,
}

impl StreamSetup {
    fn new(
        target: &RedirectionInfo,
        encryption: Option<EncryptionContext>,
        local_path: &Path,
        config: &TransferConfig,
        options: &TransferOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            target: target.clone(),
            encryption,
            local_path: local_path.to_path_buf(),
            config: config.clone(),
            cancel: options.cancel.clone(),
        })
    }

    async fn connect(&self) -> Result<ResourceServerConnection, ResourceServerError> {
        ResourceServerConnection::connect(
            &self.target,
            self.encryption.as_ref(),
            &self.config,
            &self.cancel,
        )
        .await
    }
}

async fn stream_download(
    handle: &RedirectionHandle,
    setup: Arc<StreamSetup>,
    length: i64,
    options: &TransferOptions,
) -> Result<(), ResourceServerError> {
    setup.target.validate()?;
    tokio::fs::File::create(&setup.local_path).await?;

    let progress = ProgressAggregator::new(length, options.progress.clone());
    progress.notify();

    let mut streams: JoinSet<StreamResult> = JoinSet::new();
    for stream_id in 0..handle.threads {
        let setup = Arc::clone(&setup);
        let mut task_progress = progress.task();
        streams.spawn(async move {
            let mut conn = setup.connect().await?;
            let mut file = OpenOptions::new().write(true).open(&setup.local_path).await?;
            let received =
                receive_frames(&mut conn, &mut file, &mut task_progress, &setup.config, &setup.cancel)
                    .await?;
            debug!(stream_id, received, "download stream finished");
            Ok::<_, ResourceServerError>(received)
        });
    }

    let received = join_streams(streams).await?;
    debug!(path = %handle.path, received, "redirected download streams joined");
    Ok(())
}

async fn stream_upload(
    handle: &RedirectionHandle,
    setup: Arc<StreamSetup>,
    length: i64,
    options: &TransferOptions,
) -> Result<(), ResourceServerError> {
    setup.target.validate()?;

    let progress = ProgressAggregator::new(length, options.progress.clone());
    progress.notify();

    let mut streams: JoinSet<StreamResult> = JoinSet::new();
    for stream_id in 0..handle.threads {
        let setup = Arc::clone(&setup);
        let mut task_progress = progress.task();
        streams.spawn(async move {
            let mut conn = setup.connect().await?;
            let mut file = tokio::fs::File::open(&setup.local_path).await?;
            let sent =
                send_frames(&mut conn, &mut file, &mut task_progress, &setup.config, &setup.cancel)
                    .await?;
            debug!(stream_id, sent, "upload stream finished");
            Ok::<_, ResourceServerError>(sent)
        });
    }

    let sent = join_streams(streams).await?;
    debug!(path = %handle.path, sent, "redirected upload streams joined");
    Ok(())
}

/// Waits for every stream, then reports the first failure.
async fn join_streams(mut streams: JoinSet<StreamResult>) -> StreamResult {
    let mut total = 0i64;
    let mut first_error = None;

    while let Some(joined) = streams.join_next().await {
        let failure = match joined {
            Ok(Ok(bytes)) => {
                total += bytes;
                continue;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "resource server stream failed");
                e
            }
            Err(e) => {
                error!(error = %e, "resource server stream aborted");
                ResourceServerError::TaskFailed(e.to_string())
            }
        };
        if first_error.is_none() {
            first_error = Some(failure);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

async fn complete<P: ConnectionProvider>(
    control: &mut PooledConnection<P>,
    handle: &RedirectionHandle,
    config: &TransferConfig,
) -> Result<(), ResourceServerError> {
    let completed = with_timeout(
        config.long_operation_timeout,
        "complete redirection",
        control.complete_redirection(handle),
    )
    .await;
    if completed.is_ok() {
        control.mark_healthy();
    }
    control.check(&completed);
    if let Err(e) = &completed {
        warn!(path = %handle.path, error = %e, "failed to complete redirection");
    }
    Ok(completed?)
}

fn resolve_resource<P: ConnectionProvider>(engine: &TransferEngine<P>, resource: &str) -> String {
    if resource.is_empty() {
        engine.provider().default_resource().to_string()
    } else {
        resource.to_string()
    }
}
