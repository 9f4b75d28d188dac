//! Detached background work
//!
//! Write-back persistence, refresh-ahead, prefetch and backfill jobs are
//! submitted here instead of being spawned ad hoc. Jobs sit in a bounded
//! queue, run on their own tokio task once the submitting call has returned,
//! and report failures to the log rather than to any caller.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc, mpsc::error::TrySendError};
use tracing::{debug, error, warn};

use crate::BoxError;

struct QueuedJob {
    kind: &'static str,
    key: String,
    fut: BoxFuture<'static, Result<(), BoxError>>,
}

#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    idle: Notify,
}

impl Shared {
    fn job_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Marks a job finished even if it panics or is aborted
struct PendingGuard(Arc<Shared>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.job_done();
    }
}

/// Counters describing background activity since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub pending: usize,
}

/// Handle to the background job queue. Cloning shares the queue.
#[derive(Clone)]
pub struct BackgroundTasks {
    tx: mpsc::Sender<QueuedJob>,
    shared: Arc<Shared>,
}

impl BackgroundTasks {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedJob>(capacity.max(1));
        let shared = Arc::new(Shared::default());

        let dispatcher_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let guard = PendingGuard(Arc::clone(&dispatcher_shared));
                tokio::spawn(async move {
                    let QueuedJob { kind, key, fut } = job;
                    match fut.await {
                        Ok(()) => {
                            guard.0.completed.fetch_add(1, Ordering::Relaxed);
                            debug!(kind = kind, key = %key, "Background task completed");
                        }
                        Err(e) => {
                            guard.0.failed.fetch_add(1, Ordering::Relaxed);
                            error!(kind = kind, key = %key, error = %e, "Background task failed");
                        }
                    }
                    drop(guard);
                });
            }
            debug!("Background task queue closed");
        });

        Self { tx, shared }
    }

    /// Queue a job. Returns `false` when the queue is full and the job was dropped.
    pub fn submit<F>(&self, kind: &'static str, key: impl Into<String>, fut: F) -> bool
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let key = key.into();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        let job = QueuedJob {
            kind,
            key,
            fut: Box::pin(fut),
        };
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                let (TrySendError::Full(job) | TrySendError::Closed(job)) = e;
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = job.kind,
                    key = %job.key,
                    "Background task queue unavailable, dropping job"
                );
                self.shared.job_done();
                false
            }
        }
    }

    /// Wait until every submitted job has finished
    pub async fn drain(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            pending: self.shared.pending.load(Ordering::Acquire),
        }
    }
}
