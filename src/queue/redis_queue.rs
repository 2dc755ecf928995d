//! Redis-backed job queue.
//!
//! Layout under `<prefix>`:
//! - `<prefix>:pending`: producers `LPUSH`, the worker takes from the right
//! - `<prefix>:processing`: jobs reserved with `BLMOVE` and not yet settled
//! - `<prefix>:failed`: dead letters
//!
//! `BLMOVE` holds its connection until it returns, and Redis serves one
//! connection's commands in order. Reserves therefore run on their own
//! connection so acks and requeues from finished jobs never wait behind them.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{DeploymentJob, FailDisposition, JobQueue, Lease, disposition};
use crate::errors::{JobError, QueueError};

pub const DEFAULT_PREFIX: &str = "shipyard:deployments";

/// Which connection a command runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    /// Non-blocking commands: enqueue, ack, fail, recover.
    Commands,
    /// `BLMOVE` reserves only.
    Blocking,
}

pub struct RedisQueue {
    client: redis::Client,
    commands: OnceCell<ConnectionManager>,
    blocking: OnceCell<ConnectionManager>,
    prefix: String,
    max_attempts: u32,
}

impl RedisQueue {
    /// Validates the URL; the connection is opened on first use.
    pub fn new(url: &str, max_attempts: u32) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            commands: OnceCell::new(),
            blocking: OnceCell::new(),
            prefix: DEFAULT_PREFIX.to_string(),
            max_attempts,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    pub fn processing_key(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn failed_key(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    fn cell(&self, channel: Channel) -> &OnceCell<ConnectionManager> {
        match channel {
            Channel::Commands => &self.commands,
            Channel::Blocking => &self.blocking,
        }
    }

    async fn connection(&self, channel: Channel) -> Result<ConnectionManager, QueueError> {
        let conn = self
            .cell(channel)
            .get_or_try_init(|| async {
                let conn = self.client.get_connection_manager().await?;
                info!(prefix = %self.prefix, ?channel, "Connected to Redis job queue");
                Ok::<_, QueueError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Move an undecodable entry out of the processing list.
    async fn quarantine(&self, raw: &str) -> Result<(), QueueError> {
        let mut conn = self.connection(Channel::Commands).await?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.processing_key(), 1, raw)
            .ignore()
            .lpush(self.failed_key(), raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &DeploymentJob) -> Result<(), QueueError> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.connection(Channel::Commands).await?;
        let _: () = conn.lpush(self.pending_key(), raw).await?;
        debug!(job_id = %job.id, deployment_id = %job.deployment_id, "Enqueued job");
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        let mut conn = self.connection(Channel::Blocking).await?;
        let raw: Option<String> = conn
            .blmove(
                self.pending_key(),
                self.processing_key(),
                Direction::Right,
                Direction::Left,
                wait.as_secs_f64(),
            )
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<DeploymentJob>(&raw) {
            Ok(job) => Ok(Some(Lease { job, raw })),
            Err(e) => {
                warn!(error = %e, "Dead-lettering undecodable job");
                self.quarantine(&raw).await?;
                Err(QueueError::Payload(e))
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut conn = self.connection(Channel::Commands).await?;
        let _: () = conn.lrem(self.processing_key(), 1, &lease.raw).await?;
        Ok(())
    }

    async fn fail(
        &self,
        lease: &Lease,
        error: &JobError,
    ) -> Result<FailDisposition, QueueError> {
        let outcome = disposition(&lease.job, error, self.max_attempts);
        let mut job = lease.job.clone();
        job.attempts += 1;
        let raw = serde_json::to_string(&job)?;
        let target = match outcome {
            FailDisposition::Requeued { .. } => self.pending_key(),
            FailDisposition::DeadLettered => self.failed_key(),
        };

        let mut conn = self.connection(Channel::Commands).await?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.processing_key(), 1, &lease.raw)
            .ignore()
            .lpush(target, raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(outcome)
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection(Channel::Commands).await?;
        let mut moved = 0;
        loop {
            let raw: Option<String> = conn
                .lmove(
                    self.processing_key(),
                    self.pending_key(),
                    Direction::Left,
                    Direction::Right,
                )
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(moved, "Recovered in-flight jobs");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_use_prefix() {
        let queue = RedisQueue::new("redis://127.0.0.1:6379", 3)
            .unwrap()
            .with_prefix("test:q");
        assert_eq!(queue.pending_key(), "test:q:pending");
        assert_eq!(queue.processing_key(), "test:q:processing");
        assert_eq!(queue.failed_key(), "test:q:failed");
    }

    #[test]
    fn test_reserve_does_not_share_the_command_connection() {
        let queue = RedisQueue::new("redis://127.0.0.1:6379", 3).unwrap();
        assert!(!std::ptr::eq(
            queue.cell(Channel::Blocking),
            queue.cell(Channel::Commands)
        ));
        assert!(queue.cell(Channel::Blocking).get().is_none());
        assert!(queue.cell(Channel::Commands).get().is_none());
    }

    #[test]
    fn test_invalid_url_rejected_up_front() {
        assert!(matches!(
            RedisQueue::new("not a url", 3),
            Err(QueueError::Redis(_))
        ));
    }
}
