//! Durable deployment job queue contract.
//!
//! Producers `enqueue`; the worker `reserve`s a job (moving it to an
//! in-flight set), then either `ack`s it or reports a failure with `fail`.
//! Jobs left in flight by a crashed process are returned to the pending
//! list by `recover`.

pub mod redis_queue;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::errors::{JobError, QueueError};

pub use redis_queue::RedisQueue;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub id: Uuid,
    pub deployment_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Deliveries that already failed.
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl DeploymentJob {
    pub fn new(deployment_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            deployment_id: deployment_id.into(),
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// A reserved job. `raw` is the exact encoded form held by the queue.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: DeploymentJob,
    pub(crate) raw: String,
}

impl Lease {
    pub(crate) fn encode(job: DeploymentJob) -> Result<Self, QueueError> {
        let raw = serde_json::to_string(&job)?;
        Ok(Self { job, raw })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Re-delivered later; `attempt` is the number of failures so far.
    Requeued { attempt: u32 },
    DeadLettered,
}

/// Whether a failed job goes back on the queue.
pub fn disposition(job: &DeploymentJob, error: &JobError, max_attempts: u32) -> FailDisposition {
    let attempt = job.attempts + 1;
    if error.is_retryable() && attempt < max_attempts {
        FailDisposition::Requeued { attempt }
    } else {
        FailDisposition::DeadLettered
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &DeploymentJob) -> Result<(), QueueError>;

    /// Wait up to `wait` for a job. `Ok(None)` on timeout.
    async fn reserve(&self, wait: Duration) -> Result<Option<Lease>, QueueError>;

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    async fn fail(&self, lease: &Lease, error: &JobError) -> Result<FailDisposition, QueueError>;

    /// Return in-flight jobs to pending. Returns how many moved.
    async fn recover(&self) -> Result<usize, QueueError>;
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<DeploymentJob>,
    processing: HashMap<Uuid, DeploymentJob>,
    failed: Vec<DeploymentJob>,
}

/// In-process queue for development and tests.
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
    closed: AtomicBool,
    max_attempts: u32,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl MemoryQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            max_attempts,
        }
    }

    /// Reject new jobs and wake all waiters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    pub fn failed(&self) -> Vec<DeploymentJob> {
        self.lock().failed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // Every update is a single step, so a poisoned lock still holds valid state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_next(&self) -> Option<DeploymentJob> {
        let mut state = self.lock();
        let job = state.pending.pop_front()?;
        state.processing.insert(job.id, job.clone());
        Some(job)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &DeploymentJob) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.lock().pending.push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.take_next() {
                return Lease::encode(job).map(Some);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        self.lock().processing.remove(&lease.job.id);
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: &JobError) -> Result<FailDisposition, QueueError> {
        let outcome = disposition(&lease.job, error, self.max_attempts);
        let mut job = lease.job.clone();
        job.attempts += 1;
        {
            let mut state = self.lock();
            state.processing.remove(&job.id);
            match outcome {
                FailDisposition::Requeued { .. } => state.pending.push_back(job),
                FailDisposition::DeadLettered => state.failed.push(job),
            }
        }
        if matches!(outcome, FailDisposition::Requeued { .. }) {
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut state = self.lock();
        let stranded: Vec<DeploymentJob> = state.processing.drain().map(|(_, job)| job).collect();
        let moved = stranded.len();
        for job in stranded {
            state.pending.push_front(job);
        }
        drop(state);
        if moved > 0 {
            self.notify.notify_waiters();
        }
        Ok(moved)
    }
}
