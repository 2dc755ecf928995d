//! Default maintenance tasks.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use super::CronTask;
use crate::infra::docker::ContainerRuntime;

/// Verifies the managed containers are up.
pub struct ContainerHealthTask {
    runtime: Arc<dyn ContainerRuntime>,
    containers: Vec<String>,
}

impl ContainerHealthTask {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, containers: Vec<String>) -> Self {
        Self {
            runtime,
            containers,
        }
    }
}

#[async_trait]
impl CronTask for ContainerHealthTask {
    fn name(&self) -> &'static str {
        "container-health"
    }

    async fn run(&self) -> Result<()> {
        let mut down = Vec::new();
        for name in &self.containers {
            if !self.runtime.is_running(name).await? {
                warn!(container = %name, "Managed container is not running");
                down.push(name.as_str());
            }
        }
        if !down.is_empty() {
            bail!("containers not running: {}", down.join(", "));
        }
        Ok(())
    }
}

pub struct DockerCleanupTask {
    runtime: Arc<dyn ContainerRuntime>,
}

impl DockerCleanupTask {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl CronTask for DockerCleanupTask {
    fn name(&self) -> &'static str {
        "docker-cleanup"
    }

    async fn run(&self) -> Result<()> {
        let removed = self.runtime.prune_dangling_images().await?;
        info!(removed, "Pruned dangling images");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::testing::FakeRuntime;

    #[tokio::test]
    async fn test_health_reports_stopped_containers() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.running.lock().unwrap().insert("shipyard-redis".into());
        let task = ContainerHealthTask::new(
            runtime,
            vec!["shipyard-redis".into(), "shipyard-postgres".into()],
        );
        let err = task.run().await.unwrap_err();
        assert!(err.to_string().contains("shipyard-postgres"));
        assert!(!err.to_string().contains("shipyard-redis"));
    }

    #[tokio::test]
    async fn test_health_passes_when_all_running() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.running.lock().unwrap().insert("shipyard-redis".into());
        let task = ContainerHealthTask::new(runtime, vec!["shipyard-redis".into()]);
        task.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_prunes() {
        let runtime = Arc::new(FakeRuntime::default());
        DockerCleanupTask::new(runtime.clone()).run().await.unwrap();
        assert_eq!(*runtime.pruned.lock().unwrap(), 1);
    }
}
