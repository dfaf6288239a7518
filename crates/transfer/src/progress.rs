//! Progress reporting shared by the tasks of one transfer.
//!
//! Tasks add deltas to one atomic total. The callback only ever sees a
//! value larger than every value it was given before; a task that loses
//! the race to a larger total skips its own notification.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Callback invoked with `(bytes_so_far, total_length)`.
pub type ProgressCallback = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// Aggregates progress from every task of one transfer.
///
/// Tasks report through their own [`TaskProgress`], which turns absolute
/// per-task counts into deltas so the shared total never double counts.
#[derive(Clone)]
pub struct ProgressAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    done: AtomicI64,
    /// Largest total handed to the callback.
    emitted: AtomicI64,
    total_length: i64,
    callback: Option<ProgressCallback>,
}

impl ProgressAggregator {
    pub fn new(total_length: i64, callback: Option<ProgressCallback>) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                done: AtomicI64::new(0),
                emitted: AtomicI64::new(-1),
                total_length,
                callback,
            }),
        }
    }

    /// Returns a reporter for one task.
    pub fn task(&self) -> TaskProgress {
        TaskProgress {
            aggregate: self.clone(),
            reported: 0,
        }
    }

    /// Bytes reported so far across all tasks.
    pub fn done(&self) -> i64 {
        self.inner.done.load(Ordering::Acquire)
    }

    pub fn total_length(&self) -> i64 {
        self.inner.total_length
    }

    /// Emits the current total without changing it.
    pub fn notify(&self) {
        self.emit(self.done());
    }

    fn add(&self, delta: i64) {
        let done = self.inner.done.fetch_add(delta, Ordering::AcqRel) + delta;
        self.emit(done);
    }

    fn emit(&self, done: i64) {
        let Some(cb) = &self.inner.callback else {
            return;
        };
        if self.inner.emitted.fetch_max(done, Ordering::AcqRel) < done {
            cb(done, self.inner.total_length);
        }
    }
}

/// Progress reporter owned by a single task.
pub struct TaskProgress {
    aggregate: ProgressAggregator,
    reported: i64,
}

impl TaskProgress {
    /// Records that this task has processed `processed` bytes in total.
    ///
    /// Values at or below the last report are ignored.
    pub fn update(&mut self, processed: i64) {
        if processed <= self.reported {
            return;
        }
        let delta = processed - self.reported;
        self.reported = processed;
        self.aggregate.add(delta);
    }

    /// Records `n` more bytes.
    pub fn advance(&mut self, n: i64) {
        self.update(self.reported + n);
    }

    /// Bytes this task has reported.
    pub fn reported(&self) -> i64 {
        self.reported
    }
}
