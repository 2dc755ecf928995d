use std::collections::HashMap;

use crate::config::{
    NETWORK_NAME, POSTGRES_SERVICE, PlatformConfig, REDIS_SERVICE, TRAEFIK_SERVICE,
};

/// Desired state of one managed container.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// `host_path_or_volume` → `container_path`
    pub volumes: HashMap<String, String>,
    /// `host_port` → `container_port`
    pub ports: Vec<(u16, u16)>,
    pub network: String,
    pub command: Option<Vec<String>>,
}

impl ServiceSpec {
    fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            env: HashMap::new(),
            volumes: HashMap::new(),
            ports: Vec::new(),
            network: NETWORK_NAME.to_string(),
            command: None,
        }
    }

    /// `KEY=value` pairs, sorted for stable container definitions.
    pub fn env_list(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();
        env
    }

    pub fn bind_list(&self) -> Vec<String> {
        let mut binds: Vec<String> = self
            .volumes
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect();
        binds.sort();
        binds
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
}

/// The containers the platform runs for itself in self-hosted mode.
#[derive(Debug, Clone)]
pub struct ManagedServices {
    pub network: NetworkSpec,
    pub postgres: ServiceSpec,
    pub redis: ServiceSpec,
    pub traefik: ServiceSpec,
}

impl ManagedServices {
    pub fn from_config(config: &PlatformConfig) -> Self {
        let mut postgres = ServiceSpec::new(POSTGRES_SERVICE, "postgres:16");
        postgres.env.insert("POSTGRES_USER".into(), "shipyard".into());
        postgres.env.insert("POSTGRES_DB".into(), "shipyard".into());
        postgres
            .env
            .insert("POSTGRES_PASSWORD".into(), config.postgres_password.clone());
        postgres
            .volumes
            .insert("shipyard-postgres-database".into(), "/var/lib/postgresql/data".into());
        if !config.flags.is_production() {
            postgres.ports.push((5432, 5432));
        }

        let mut redis = ServiceSpec::new(REDIS_SERVICE, "redis:7");
        redis.volumes.insert("redis-data-volume".into(), "/data".into());
        if !config.flags.is_production() {
            redis.ports.push((6379, 6379));
        }

        let mut traefik = ServiceSpec::new(TRAEFIK_SERVICE, "traefik:v3.1.2");
        let traefik_dir = config.paths.traefik_dir();
        traefik.volumes.insert(
            traefik_dir.join("traefik.yml").display().to_string(),
            "/etc/traefik/traefik.yml".into(),
        );
        traefik.volumes.insert(
            config.paths.dynamic_dir().display().to_string(),
            "/etc/shipyard/traefik/dynamic".into(),
        );
        traefik
            .volumes
            .insert("/var/run/docker.sock".into(), "/var/run/docker.sock".into());
        traefik.ports = vec![(80, 80), (443, 443)];

        Self {
            network: NetworkSpec {
                name: NETWORK_NAME.to_string(),
                driver: "bridge".to_string(),
            },
            postgres,
            redis,
            traefik,
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        vec![
            self.postgres.name.clone(),
            self.traefik.name.clone(),
            self.redis.name.clone(),
        ]
    }
}
