//! Typed error hierarchy for the Shipyard server.
//!
//! Four enums follow the propagation policy of the process:
//! - `BootstrapError`: fatal, aborts startup before any traffic is served
//! - `RegistryError`: startup-time endpoint misconfiguration
//! - `JobError`: per-job failure, reported back to the queue
//! - `QueueError`: queue transport failures seen by the worker loop

use std::net::SocketAddr;

use thiserror::Error;

/// Fatal errors from the bootstrap sequence.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Initialization step '{step}' failed: {source:#}")]
    Step {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Listening socket is already bound")]
    AlreadyBound,

    #[error("Deployment worker already started")]
    WorkerAlreadyStarted,

    #[error("Deployment worker cannot start before migrations complete")]
    WorkerBeforeMigration,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while populating the WebSocket endpoint registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("WebSocket path '{path}' is already registered")]
    DuplicatePath { path: String },

    #[error("WebSocket path '{path}' must start with '/'")]
    InvalidPath { path: String },
}

/// Outcome of a failed deployment job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Transient failure; the queue may re-deliver the job.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent failure; the job is not re-delivered.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

/// Errors from the durable job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Queue closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_error_step_names_the_step() {
        let err = BootstrapError::Step {
            step: "postgres",
            source: anyhow::anyhow!("image pull failed"),
        };
        let msg = err.to_string();
        assert!(msg.contains("postgres"));
        assert!(msg.contains("image pull failed"));
    }

    #[test]
    fn bootstrap_error_bind_carries_addr() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = BootstrapError::Bind { addr, source: io_err };
        match &err {
            BootstrapError::Bind { addr: a, source } => {
                assert_eq!(a.port(), 3000);
                assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
            }
            _ => panic!("Expected Bind variant"),
        }
    }

    #[test]
    fn registry_error_converts_into_bootstrap_error() {
        let inner = RegistryError::DuplicatePath {
            path: "/terminal".to_string(),
        };
        let err: BootstrapError = inner.into();
        match &err {
            BootstrapError::Registry(RegistryError::DuplicatePath { path }) => {
                assert_eq!(path, "/terminal");
            }
            _ => panic!("Expected BootstrapError::Registry(DuplicatePath)"),
        }
    }

    #[test]
    fn job_error_retryable_classification() {
        assert!(JobError::Retryable("redis down".into()).is_retryable());
        assert!(!JobError::Terminal("bad compose file".into()).is_retryable());
    }

    #[test]
    fn config_error_names_variable() {
        let err = ConfigError::Invalid("PORT", "not a number".into());
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BootstrapError::AlreadyBound);
        assert_std_error(&RegistryError::InvalidPath { path: "x".into() });
        assert_std_error(&JobError::Terminal("x".into()));
        assert_std_error(&QueueError::Closed);
    }
}
