//! Debounced job queue with retry backoff and periodic reconcile ticks.
//!
//! The scheduler is tick-driven: callers feed it the current time and
//! it invokes the [`JobProcessor`] for whatever is due. It never
//! sleeps on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::warn;

/// Kind of a scheduled per-file job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JobKind {
    Metadata,
    Content,
}

impl JobKind {
    fn as_str(&self) -> &'static str {
        match self {
            JobKind::Metadata => "metadata",
            JobKind::Content => "content",
        }
    }
}

/// A due job handed to the [`JobProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    pub mount_id: String,
    pub source_ref: String,
}

/// Work seam invoked by the scheduler.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> crate::error::Result<()>;
    async fn reconcile(&self, mount_id: &str) -> crate::error::Result<()>;
}

struct PendingJob {
    job: Job,
    due_at_ms: i64,
    attempt: usize,
}

struct ReconcileEntry {
    interval_ms: i64,
    next_run_at_ms: i64,
}

/// Debounced coordinator for watch-triggered work.
pub struct SyncScheduler {
    processor: Arc<dyn JobProcessor>,
    debounce_ms: i64,
    backoff_ms: Vec<i64>,
    pending: Mutex<HashMap<String, PendingJob>>,
    reconcile: Mutex<HashMap<String, ReconcileEntry>>,
}

impl SyncScheduler {
    pub fn new(processor: Arc<dyn JobProcessor>, debounce_ms: i64, backoff_ms: Vec<i64>) -> Self {
        Self {
            processor,
            debounce_ms,
            backoff_ms,
            pending: Mutex::new(HashMap::new()),
            reconcile: Mutex::new(HashMap::new()),
        }
    }

    fn pending_slot(&self) -> MutexGuard<'_, HashMap<String, PendingJob>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconcile_slot(&self) -> MutexGuard<'_, HashMap<String, ReconcileEntry>> {
        self.reconcile.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues (or re-debounces) a job; a fresh enqueue replaces any
    /// prior entry for the same key, retry state included.
    pub fn enqueue(&self, kind: JobKind, mount_id: &str, source_ref: &str, now_ms: i64) {
        let key = format!("{}:{}:{}", kind.as_str(), mount_id, source_ref);
        let job = Job { kind, mount_id: mount_id.to_owned(), source_ref: source_ref.to_owned() };
        self.pending_slot().insert(
            key,
            PendingJob { job, due_at_ms: now_ms + self.debounce_ms, attempt: 0 },
        );
    }

    pub fn pending_len(&self) -> usize {
        self.pending_slot().len()
    }

    /// Runs every due job; failures are rescheduled with bounded
    /// backoff, then dropped once the ladder is exhausted.
    pub async fn flush_due(&self, now_ms: i64) -> usize {
        let due: Vec<(String, Job)> = self
            .pending_slot()
            .iter()
            .filter(|(_, pending)| pending.due_at_ms <= now_ms)
            .map(|(key, pending)| (key.clone(), pending.job.clone()))
            .collect();

        let mut processed = 0;
        for (key, job) in due {
            match self.processor.process(&job).await {
                Ok(()) => {
                    self.pending_slot().remove(&key);
                    processed += 1;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "scheduled job failed");
                    let mut pending = self.pending_slot();
                    let exhausted = match pending.get_mut(&key) {
                        Some(entry) => {
                            entry.attempt += 1;
                            if entry.attempt > self.backoff_ms.len() {
                                true
                            } else {
                                let step = (entry.attempt - 1).min(self.backoff_ms.len() - 1);
                                entry.due_at_ms = now_ms + self.backoff_ms[step];
                                false
                            }
                        }
                        None => false,
                    };
                    if exhausted {
                        pending.remove(&key);
                    }
                }
            }
        }
        processed
    }

    /// Registers (or reschedules) the periodic reconcile for a mount.
    pub fn register_reconcile(&self, mount_id: &str, interval_ms: i64, now_ms: i64) {
        self.reconcile_slot().insert(
            mount_id.to_owned(),
            ReconcileEntry { interval_ms, next_run_at_ms: now_ms + interval_ms },
        );
    }

    pub fn unregister_reconcile(&self, mount_id: &str) {
        self.reconcile_slot().remove(mount_id);
    }

    /// Invokes the reconcile callback for every mount whose tick has
    /// arrived, then advances its next run time.
    pub async fn run_reconcile_due(&self, now_ms: i64) -> usize {
        let due: Vec<String> = self
            .reconcile_slot()
            .iter()
            .filter(|(_, entry)| entry.next_run_at_ms <= now_ms)
            .map(|(mount_id, _)| mount_id.clone())
            .collect();

        for mount_id in &due {
            if let Err(err) = self.processor.reconcile(mount_id).await {
                warn!(mount_id = %mount_id, error = %err, "reconcile tick failed");
            }
            let mut reconcile = self.reconcile_slot();
            if let Some(entry) = reconcile.get_mut(mount_id) {
                entry.next_run_at_ms = now_ms + entry.interval_ms;
            }
        }
        due.len()
    }
}
