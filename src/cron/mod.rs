//! Process-wide recurring task scheduler.

pub mod tasks;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const EVERY_MINUTE: &str = "0 * * * * *";
pub const DAILY_MIDNIGHT: &str = "0 0 0 * * *";

#[async_trait]
pub trait CronTask: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<()>;
}

struct Registration {
    schedule: Cron,
    expression: String,
    task: Arc<dyn CronTask>,
}

/// Runs every registered task on its own schedule until cancelled.
pub struct CronScheduler {
    entries: Vec<Arc<Registration>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

fn parse_schedule(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .with_context(|| format!("Invalid cron expression '{}'", expression))
}

impl CronScheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            entries: Vec::new(),
            started: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn register(&mut self, expression: &str, task: Arc<dyn CronTask>) -> Result<()> {
        let schedule = parse_schedule(expression)?;
        self.entries.push(Arc::new(Registration {
            schedule,
            expression: expression.to_string(),
            task,
        }));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn one loop per task. Returns `false` if already started.
    pub fn start(&self) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Cron scheduler already started, ignoring");
            return false;
        }
        for entry in &self.entries {
            info!(
                task = entry.task.name(),
                schedule = %entry.expression,
                "Scheduling cron task"
            );
            tokio::spawn(run_loop(entry.clone(), self.shutdown.clone()));
        }
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

async fn run_loop(entry: Arc<Registration>, shutdown: CancellationToken) {
    loop {
        let now = Utc::now();
        let next = match entry.schedule.find_next_occurrence(&now, false) {
            Ok(next) => next,
            Err(e) => {
                error!(task = entry.task.name(), error = %e, "No next occurrence, stopping task");
                return;
            }
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(task = entry.task.name(), "Cron loop stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }
        execute_once(entry.task.clone()).await;
    }
}

/// Run a task once, containing both errors and panics.
pub async fn execute_once(task: Arc<dyn CronTask>) -> bool {
    let name = task.name();
    let handle = tokio::spawn(async move { task.run().await });
    match handle.await {
        Ok(Ok(())) => {
            debug!(task = name, "Cron task completed");
            true
        }
        Ok(Err(e)) => {
            error!(task = name, error = %format!("{:#}", e), "Cron task failed");
            false
        }
        Err(join) => {
            error!(task = name, error = %join, "Cron task panicked");
            false
        }
    }
}

/// Validate an expression without registering it.
pub fn validate_expression(expression: &str) -> Result<()> {
    parse_schedule(expression).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CronTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        async fn run(&self) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CronTask for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn run(&self) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    struct Panicking;

    #[async_trait]
    impl CronTask for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        async fn run(&self) -> Result<()> {
            panic!("task blew up")
        }
    }

    #[test]
    fn test_default_expressions_parse() {
        validate_expression(EVERY_MINUTE).unwrap();
        validate_expression(DAILY_MIDNIGHT).unwrap();
        validate_expression("*/5 * * * *").unwrap();
        assert!(validate_expression("not a schedule").is_err());
    }

    #[tokio::test]
    async fn test_execute_once_contains_errors_and_panics() {
        assert!(!execute_once(Arc::new(Failing)).await);
        assert!(!execute_once(Arc::new(Panicking)).await);
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(execute_once(Arc::new(Counter { hits: hits.clone() })).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_is_guarded() {
        let scheduler = CronScheduler::new(CancellationToken::new());
        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_started());
    }

    #[tokio::test]
    async fn test_failing_task_does_not_stop_others() {
        let shutdown = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut scheduler = CronScheduler::new(shutdown.clone());
        scheduler.register("* * * * * *", Arc::new(Panicking)).unwrap();
        scheduler.register("* * * * * *", Arc::new(Failing)).unwrap();
        scheduler
            .register("* * * * * *", Arc::new(Counter { hits: hits.clone() }))
            .unwrap();
        assert_eq!(scheduler.len(), 3);
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_loops() {
        let shutdown = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut scheduler = CronScheduler::new(shutdown.clone());
        scheduler
            .register("* * * * * *", Arc::new(Counter { hits: hits.clone() }))
            .unwrap();
        shutdown.cancel();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
