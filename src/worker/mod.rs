//! Background deployment job worker.

pub mod script;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{BootstrapError, JobError, QueueError};
use crate::queue::{DeploymentJob, FailDisposition, JobQueue, Lease};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Runs one deployment to completion.
#[async_trait]
pub trait DeploymentPipeline: Send + Sync {
    async fn run(&self, job: &DeploymentJob) -> Result<(), JobError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(JobError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

/// Observable worker state. Transitions only move forward.
#[derive(Clone)]
pub struct WorkerLifecycle {
    tx: Arc<watch::Sender<WorkerState>>,
}

impl Default for WorkerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerLifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(WorkerState::NotStarted);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> WorkerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }

    /// `NotStarted -> Starting`. Any other starting state is rejected.
    pub fn begin_start(&self) -> Result<(), BootstrapError> {
        let mut accepted = false;
        self.tx.send_if_modified(|state| {
            if *state == WorkerState::NotStarted {
                *state = WorkerState::Starting;
                accepted = true;
            }
            accepted
        });
        if accepted {
            Ok(())
        } else {
            Err(BootstrapError::WorkerAlreadyStarted)
        }
    }

    fn mark_running(&self) {
        self.tx.send_if_modified(|state| {
            let advance = *state == WorkerState::Starting;
            if advance {
                *state = WorkerState::Running;
            }
            advance
        });
    }

    fn mark_stopped(&self) {
        self.tx.send_replace(WorkerState::Stopped);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: usize,
    pub failed: usize,
}

pub struct DeploymentWorker {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<dyn DeploymentPipeline>,
    concurrency: usize,
    poll_interval: Duration,
    lifecycle: WorkerLifecycle,
}

impl DeploymentWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<dyn DeploymentPipeline>,
        concurrency: usize,
        lifecycle: WorkerLifecycle,
    ) -> Self {
        Self {
            queue,
            pipeline,
            concurrency: concurrency.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lifecycle,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn lifecycle(&self) -> &WorkerLifecycle {
        &self.lifecycle
    }

    /// Consume jobs until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerReport {
        self.lifecycle.mark_running();
        info!(concurrency = self.concurrency, "Deployment worker running");

        match self.queue.recover().await {
            Ok(0) => {}
            Ok(moved) => info!(moved, "Requeued jobs left in flight by a previous run"),
            Err(e) => warn!(error = %e, "Failed to recover in-flight jobs"),
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        let mut report = WorkerReport::default();

        loop {
            while let Some(done) = tasks.try_join_next() {
                tally(&mut report, done);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let reserved = tokio::select! {
                _ = shutdown.cancelled() => break,
                reserved = self.queue.reserve(self.poll_interval) => reserved,
            };

            match reserved {
                Ok(Some(lease)) => {
                    let queue = self.queue.clone();
                    let pipeline = self.pipeline.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        process_lease(queue.as_ref(), pipeline, lease).await
                    });
                }
                Ok(None) => {}
                Err(QueueError::Closed) => {
                    info!("Job queue closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to reserve job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight deployments");
        }
        while let Some(done) = tasks.join_next().await {
            tally(&mut report, done);
        }

        self.lifecycle.mark_stopped();
        info!(
            completed = report.completed,
            failed = report.failed,
            "Deployment worker stopped"
        );
        report
    }
}

fn tally(report: &mut WorkerReport, done: Result<JobOutcome, tokio::task::JoinError>) {
    match done {
        Ok(JobOutcome::Completed) => report.completed += 1,
        Ok(JobOutcome::Failed(_)) => report.failed += 1,
        Err(e) => {
            error!(error = %e, "Job task aborted");
            report.failed += 1;
        }
    }
}

/// Run one reserved job and settle it with the queue.
pub async fn process_lease(
    queue: &dyn JobQueue,
    pipeline: Arc<dyn DeploymentPipeline>,
    lease: Lease,
) -> JobOutcome {
    let job_id = lease.job.id;
    let deployment_id = lease.job.deployment_id.clone();
    info!(%job_id, %deployment_id, attempt = lease.job.attempts + 1, "Starting deployment");

    let job = lease.job.clone();
    let outcome = match tokio::spawn(async move { pipeline.run(&job).await }).await {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(e)) => JobOutcome::Failed(e),
        Err(join) => JobOutcome::Failed(JobError::Terminal(format!(
            "pipeline panicked: {}",
            join
        ))),
    };

    match &outcome {
        JobOutcome::Completed => {
            if let Err(e) = queue.ack(&lease).await {
                warn!(%job_id, error = %e, "Failed to ack job");
            }
            info!(%job_id, %deployment_id, "Deployment completed");
        }
        JobOutcome::Failed(err) => {
            if err.is_retryable() {
                warn!(%job_id, %deployment_id, error = %err, "Deployment failed");
            } else {
                error!(%job_id, %deployment_id, error = %err, "Deployment failed");
            }
            match queue.fail(&lease, err).await {
                Ok(FailDisposition::Requeued { attempt }) => {
                    debug!(%job_id, attempt, "Job requeued");
                }
                Ok(FailDisposition::DeadLettered) => {
                    warn!(%job_id, "Job moved to dead letter list");
                }
                Err(e) => warn!(%job_id, error = %e, "Failed to record job failure"),
            }
        }
    }
    outcome
}
