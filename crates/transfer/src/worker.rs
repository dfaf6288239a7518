use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::TransferError;

/// Runs transfer tasks to completion and collects their failures.
///
/// A failing task does not stop its siblings. [`WorkerPool::join`] waits for
/// every task before reporting.
pub(crate) struct WorkerPool {
    tasks: JoinSet<()>,
    errors: mpsc::Sender<TransferError>,
    collected: Option<mpsc::Receiver<TransferError>>,
    failures: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Pool that keeps errors to itself; `join` returns the first one.
    pub fn new(task_count: usize) -> Self {
        // Every task sends at most one error, so sends never wait.
        let (errors, collected) = mpsc::channel(task_count.max(1));
        Self {
            tasks: JoinSet::new(),
            errors,
            collected: Some(collected),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pool that forwards every error to `errors`.
    ///
    /// `join` then only says whether something failed.
    pub fn reporting_to(errors: mpsc::Sender<TransferError>) -> Self {
        Self {
            tasks: JoinSet::new(),
            errors,
            collected: None,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spawn<F>(&mut self, task_id: usize, task: F)
    where
        F: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        let errors = self.errors.clone();
        let failures = Arc::clone(&self.failures);
        self.tasks.spawn(async move {
            match task.await {
                Ok(()) => debug!(task_id, "task finished"),
                Err(e) => {
                    warn!(task_id, error = %e, "task failed");
                    failures.fetch_add(1, Ordering::AcqRel);
                    let _ = errors.send(e).await;
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every task, then returns the first reported error.
    ///
    /// When errors are forwarded elsewhere, a failure is summarized as
    /// [`TransferError::TaskFailed`].
    pub async fn join(self) -> Result<(), TransferError> {
        let Self {
            mut tasks,
            errors,
            collected,
            failures,
        } = self;

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "transfer task aborted");
                failures.fetch_add(1, Ordering::AcqRel);
                let _ = errors.send(TransferError::TaskFailed(e.to_string())).await;
            }
        }
        drop(errors);

        let failed = failures.load(Ordering::Acquire);
        match collected {
            Some(mut rx) => match rx.try_recv() {
                Ok(first) => Err(first),
                Err(_) => Ok(()),
            },
            None if failed > 0 => Err(TransferError::TaskFailed(format!("{failed} tasks failed"))),
            None => Ok(()),
        }
    }
}
