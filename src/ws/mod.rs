//! WebSocket endpoint registry.
//!
//! Every long-lived socket protocol is a [`SocketHandler`] bound to one
//! upgrade path. Paths are registered on a [`RegistryBuilder`] during
//! startup; [`RegistryBuilder::build`] freezes the mapping into an
//! [`EndpointRegistry`] that is only ever read afterwards, so concurrent
//! dispatch needs no locking.

pub mod bridge;
pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, ws::WebSocket};
use axum::http::Uri;

use crate::config::{PlatformPaths, StartupFlags};
use crate::errors::RegistryError;

pub const CONTAINER_LOGS_PATH: &str = "/docker-container-logs";
pub const CONTAINER_TERMINAL_PATH: &str = "/docker-container-terminal";
pub const CONTAINER_STATS_PATH: &str = "/listen-docker-stats-monitoring";
pub const DEPLOYMENT_LOGS_PATH: &str = "/listen-deployment";
pub const TERMINAL_PATH: &str = "/terminal";

/// The upgrade request as seen by a handler: the matched path plus the
/// decoded query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub query: HashMap<String, String>,
}

impl UpgradeRequest {
    pub fn from_uri(uri: &Uri) -> Self {
        let query = Query::<HashMap<String, String>>::try_from_uri(uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        Self {
            path: uri.path().to_string(),
            query,
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// A per-connection protocol. The handler owns the socket until it returns.
#[async_trait]
pub trait SocketHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, socket: WebSocket, request: UpgradeRequest);
}

#[derive(Default)]
pub struct RegistryBuilder {
    endpoints: HashMap<String, Arc<dyn SocketHandler>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `path`. Registering a path twice is a startup error.
    pub fn register(
        &mut self,
        path: &str,
        handler: Arc<dyn SocketHandler>,
    ) -> Result<&mut Self, RegistryError> {
        if !path.starts_with('/') {
            return Err(RegistryError::InvalidPath {
                path: path.to_string(),
            });
        }
        if self.endpoints.contains_key(path) {
            return Err(RegistryError::DuplicatePath {
                path: path.to_string(),
            });
        }
        self.endpoints.insert(path.to_string(), handler);
        Ok(self)
    }

    pub fn build(self) -> EndpointRegistry {
        EndpointRegistry {
            endpoints: self.endpoints,
        }
    }
}

/// Read-only path → handler mapping.
pub struct EndpointRegistry {
    endpoints: HashMap<String, Arc<dyn SocketHandler>>,
}

impl EndpointRegistry {
    /// Exact-match lookup; no prefix or trailing-slash normalisation.
    pub fn get(&self, path: &str) -> Option<Arc<dyn SocketHandler>> {
        self.endpoints.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.endpoints.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

/// Register the platform's reserved endpoints.
///
/// Container stats monitoring reads the local Docker daemon and is only
/// offered in self-hosted mode.
pub fn default_registry(
    flags: &StartupFlags,
    paths: &PlatformPaths,
) -> Result<EndpointRegistry, RegistryError> {
    use handlers::*;

    let mut builder = RegistryBuilder::new();
    builder
        .register(DEPLOYMENT_LOGS_PATH, Arc::new(DeploymentLogHandler::new(paths.clone())))?
        .register(CONTAINER_LOGS_PATH, Arc::new(ContainerLogsHandler))?
        .register(CONTAINER_TERMINAL_PATH, Arc::new(ContainerTerminalHandler))?
        .register(TERMINAL_PATH, Arc::new(TerminalHandler::from_env()))?;
    if !flags.is_hosted() {
        builder.register(CONTAINER_STATS_PATH, Arc::new(ContainerStatsHandler::default()))?;
    }
    Ok(builder.build())
}
