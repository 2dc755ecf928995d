//! Container runtime abstraction and its Docker Engine implementation.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{
    ContainerCreateBody, HostConfig, NetworkCreateRequest, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    InspectNetworkOptions, PruneImagesOptions, StartContainerOptions,
};
use futures_util::TryStreamExt;
use tracing::{debug, info};

use super::services::{NetworkSpec, ServiceSpec};

/// The container operations infra provisioning and maintenance need.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the network if missing. Returns whether it was created.
    async fn ensure_network(&self, spec: &NetworkSpec) -> Result<bool>;

    /// Make sure a container matching `spec` exists and is running.
    async fn ensure_container(&self, spec: &ServiceSpec) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    /// Remove dangling images. Returns the number removed.
    async fn prune_dangling_images(&self) -> Result<u64>;
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self { docker })
    }

    /// `None` when the container does not exist.
    async fn container_running(&self, name: &str) -> Result<Option<bool>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(
                info.state.and_then(|s| s.running).unwrap_or(false),
            )),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect container {}", name)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "Pulling image");
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .with_context(|| format!("Failed to pull image {}", image))?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", name))
    }
}

fn container_body(spec: &ServiceSpec) -> ContainerCreateBody {
    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .ports
        .iter()
        .map(|(host, container)| {
            (
                format!("{}/tcp", container),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                }]),
            )
        })
        .collect();

    let host_config = HostConfig {
        binds: Some(spec.bind_list()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        network_mode: Some(spec.network.clone()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: Some(spec.env_list()),
        cmd: spec.command.clone(),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, spec: &NetworkSpec) -> Result<bool> {
        match self
            .docker
            .inspect_network(&spec.name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => {
                debug!(network = %spec.name, "Network already exists");
                return Ok(false);
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect network {}", spec.name));
            }
        }

        let request = NetworkCreateRequest {
            name: spec.name.clone(),
            driver: Some(spec.driver.clone()),
            attachable: Some(true),
            ..Default::default()
        };
        self.docker
            .create_network(request)
            .await
            .with_context(|| format!("Failed to create network {}", spec.name))?;
        info!(network = %spec.name, driver = %spec.driver, "Created network");
        Ok(true)
    }

    async fn ensure_container(&self, spec: &ServiceSpec) -> Result<()> {
        match self.container_running(&spec.name).await? {
            Some(true) => {
                debug!(container = %spec.name, "Container already running");
                Ok(())
            }
            Some(false) => {
                info!(container = %spec.name, "Starting stopped container");
                self.start(&spec.name).await
            }
            None => {
                self.pull_image(&spec.image).await?;
                let options = CreateContainerOptionsBuilder::default()
                    .name(&spec.name)
                    .build();
                self.docker
                    .create_container(Some(options), container_body(spec))
                    .await
                    .with_context(|| format!("Failed to create container {}", spec.name))?;
                self.start(&spec.name).await?;
                info!(container = %spec.name, image = %spec.image, "Container created");
                Ok(())
            }
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.container_running(name).await?.unwrap_or(false))
    }

    async fn prune_dangling_images(&self) -> Result<u64> {
        let response = self
            .docker
            .prune_images(None::<PruneImagesOptions>)
            .await
            .context("Failed to prune images")?;
        let removed = response.images_deleted.map(|d| d.len()).unwrap_or(0) as u64;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "shipyard-redis".into(),
            image: "redis:7".into(),
            env: HashMap::from([("A".to_string(), "1".to_string())]),
            volumes: HashMap::from([("redis-data-volume".to_string(), "/data".to_string())]),
            ports: vec![(6379, 6379)],
            network: "shipyard-network".into(),
            command: None,
        }
    }

    #[test]
    fn test_container_body_maps_ports_and_binds() {
        let body = container_body(&spec());
        let host = body.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["6379/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("6379"));
        assert_eq!(host.binds.unwrap(), vec!["redis-data-volume:/data"]);
        assert_eq!(host.network_mode.as_deref(), Some("shipyard-network"));
        assert_eq!(body.env.unwrap(), vec!["A=1"]);
    }

    #[test]
    fn test_container_body_without_ports() {
        let mut spec = spec();
        spec.ports.clear();
        let body = container_body(&spec);
        assert!(body.host_config.unwrap().port_bindings.is_none());
    }

    #[test]
    fn test_not_found_detection() {
        let err = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(is_not_found(&err));
        let err = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(!is_not_found(&err));
    }
}
