//! Self-hosted infrastructure provisioning.
//!
//! Every operation is idempotent: re-running against an already provisioned
//! host leaves it unchanged.

pub mod docker;
pub mod services;
pub mod traefik;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::config::PlatformPaths;
use docker::ContainerRuntime;
use services::ManagedServices;

/// One method per infra initialization step, in bootstrap order.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn setup_directories(&self) -> Result<()>;
    async fn create_default_middlewares(&self) -> Result<()>;
    async fn initialize_network(&self) -> Result<()>;
    async fn create_default_traefik_config(&self) -> Result<()>;
    async fn create_default_server_traefik_config(&self) -> Result<()>;
    async fn initialize_postgres(&self) -> Result<()>;
    async fn initialize_traefik(&self) -> Result<()>;
    async fn initialize_redis(&self) -> Result<()>;
}

pub struct PlatformProvisioner {
    paths: PlatformPaths,
    port: u16,
    runtime: Arc<dyn ContainerRuntime>,
    services: ManagedServices,
}

impl PlatformProvisioner {
    pub fn new(
        paths: PlatformPaths,
        port: u16,
        runtime: Arc<dyn ContainerRuntime>,
        services: ManagedServices,
    ) -> Self {
        Self {
            paths,
            port,
            runtime,
            services,
        }
    }

    fn log_written(file: &str, written: bool) {
        if written {
            info!(file, "Wrote default config");
        } else {
            info!(file, "Config present, leaving untouched");
        }
    }
}

#[async_trait]
impl Provisioner for PlatformProvisioner {
    async fn setup_directories(&self) -> Result<()> {
        for dir in self.paths.all_directories() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        info!(base = %self.paths.base.display(), "Directories ready");
        Ok(())
    }

    async fn create_default_middlewares(&self) -> Result<()> {
        let written = traefik::create_default_middlewares(&self.paths)?;
        Self::log_written(traefik::MIDDLEWARES_FILE, written);
        Ok(())
    }

    async fn initialize_network(&self) -> Result<()> {
        self.runtime.ensure_network(&self.services.network).await?;
        Ok(())
    }

    async fn create_default_traefik_config(&self) -> Result<()> {
        let written = traefik::create_default_traefik_config(&self.paths)?;
        Self::log_written(traefik::STATIC_CONFIG_FILE, written);
        Ok(())
    }

    async fn create_default_server_traefik_config(&self) -> Result<()> {
        let written = traefik::create_default_server_traefik_config(&self.paths, self.port)?;
        Self::log_written(traefik::SERVER_CONFIG_FILE, written);
        Ok(())
    }

    async fn initialize_postgres(&self) -> Result<()> {
        self.runtime.ensure_container(&self.services.postgres).await
    }

    async fn initialize_traefik(&self) -> Result<()> {
        self.runtime.ensure_container(&self.services.traefik).await
    }

    async fn initialize_redis(&self) -> Result<()> {
        self.runtime.ensure_container(&self.services.redis).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::docker::ContainerRuntime;
    use super::services::{NetworkSpec, ServiceSpec};
    use anyhow::{Result, bail};
    use async_trait::async_trait;

    /// In-memory container runtime that records every call.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub networks: Mutex<HashSet<String>>,
        pub running: Mutex<HashSet<String>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_container: Option<String>,
        pub pruned: Mutex<u64>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ensure_network(&self, spec: &NetworkSpec) -> Result<bool> {
            self.calls.lock().unwrap().push(format!("network:{}", spec.name));
            Ok(self.networks.lock().unwrap().insert(spec.name.clone()))
        }

        async fn ensure_container(&self, spec: &ServiceSpec) -> Result<()> {
            self.calls.lock().unwrap().push(format!("container:{}", spec.name));
            if self.fail_container.as_deref() == Some(spec.name.as_str()) {
                bail!("pull of {} failed", spec.image);
            }
            self.running.lock().unwrap().insert(spec.name.clone());
            Ok(())
        }

        async fn is_running(&self, name: &str) -> Result<bool> {
            Ok(self.running.lock().unwrap().contains(name))
        }

        async fn prune_dangling_images(&self) -> Result<u64> {
            let mut pruned = self.pruned.lock().unwrap();
            *pruned += 1;
            Ok(2)
        }
    }
}
