//! Configuration loading from environment variables.
//!
//! `PlatformConfig::from_env` reads the process environment (after
//! `dotenvy` has loaded `.env`); `from_lookup` takes any key lookup so the
//! parsing rules can be tested without touching process state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(7);
pub const DEFAULT_BASE_PATH: &str = "/etc/shipyard";

pub const NETWORK_NAME: &str = "shipyard-network";
pub const POSTGRES_SERVICE: &str = "shipyard-postgres";
pub const REDIS_SERVICE: &str = "shipyard-redis";
pub const TRAEFIK_SERVICE: &str = "shipyard-traefik";

/// Where the platform is running. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Multi-tenant managed deployment; infra is provisioned externally.
    Hosted,
    /// Single-tenant deployment; this process provisions its own infra.
    SelfHosted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Production,
    Development,
}

/// The three flags that decide which initialization steps apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupFlags {
    pub mode: DeploymentMode,
    pub build: BuildMode,
    pub setup_services: bool,
}

impl StartupFlags {
    pub fn new(mode: DeploymentMode, build: BuildMode, setup_services: bool) -> Self {
        Self {
            mode,
            build,
            setup_services,
        }
    }

    pub fn is_hosted(&self) -> bool {
        self.mode == DeploymentMode::Hosted
    }

    pub fn is_production(&self) -> bool {
        self.build == BuildMode::Production
    }

    /// Self-hosted with `SETUP_SERVICES=true`: this process owns its infra.
    pub fn provisions_infra(&self) -> bool {
        !self.is_hosted() && self.setup_services
    }

    /// Hosted mode delegates job consumption to a separate deployment.
    pub fn runs_worker(&self) -> bool {
        !self.is_hosted() && (!self.is_production() || self.setup_services)
    }
}

/// On-disk layout rooted at `BASE_PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPaths {
    pub base: PathBuf,
}

impl PlatformPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn traefik_dir(&self) -> PathBuf {
        self.base.join("traefik")
    }

    pub fn dynamic_dir(&self) -> PathBuf {
        self.traefik_dir().join("dynamic")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Every directory the initializer must create, parents first.
    pub fn all_directories(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.base.clone(), self.traefik_dir(), self.dynamic_dir()];
        for sub in [
            "logs",
            "applications",
            "compose",
            "ssh",
            "monitoring",
            "registry",
            "schedules",
            "volume-backups",
        ] {
            dirs.push(self.base.join(sub));
        }
        dirs
    }

    /// Resolve a client-supplied log path, rejecting anything outside `logs/`.
    pub fn resolve_log_path(&self, requested: &str) -> Option<PathBuf> {
        let candidate = Path::new(requested);
        let logs = self.logs_dir();
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            logs.join(candidate)
        };
        let escapes = joined
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes || !joined.starts_with(&logs) {
            return None;
        }
        Some(joined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub dir: Option<PathBuf>,
}

/// Runtime configuration for the platform process.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub flags: StartupFlags,
    pub host: IpAddr,
    pub port: u16,
    pub settle_delay: Duration,
    pub database_url: String,
    pub migrations_dir: PathBuf,
    pub redis_url: String,
    pub paths: PlatformPaths,
    pub app_upstream: Option<String>,
    pub worker_concurrency: usize,
    pub deploy_script: Option<String>,
    pub restart_webhooks: Vec<String>,
    pub postgres_password: String,
    pub log: LogConfig,
}

fn is_true(value: Option<String>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
    reason: &str,
) -> Result<T, ConfigError> {
    match value {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, format!("{} (got '{}')", reason, raw))),
        _ => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl PlatformConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Optional (with defaults):
    /// - `IS_CLOUD`: `true` selects hosted mode (default: self-hosted)
    /// - `SETUP_SERVICES`: `true` enables infra bootstrap (default: false)
    /// - `APP_ENV`: `production` selects a production build (default: development)
    /// - `PORT`: listen port (default: 3000)
    /// - `SETTLE_DELAY_SECS`: wait before the post-setup migration (default: 7)
    /// - `WORKER_CONCURRENCY`: concurrent deployment jobs (default: 1)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = if is_true(lookup("IS_CLOUD")) {
            DeploymentMode::Hosted
        } else {
            DeploymentMode::SelfHosted
        };
        let build = match lookup("APP_ENV").as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("production") => BuildMode::Production,
            _ => BuildMode::Development,
        };
        let flags = StartupFlags::new(mode, build, is_true(lookup("SETUP_SERVICES")));

        let host = parse_or(
            "HOST",
            lookup("HOST"),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            "must be an IP address",
        )?;
        let port = parse_or("PORT", lookup("PORT"), DEFAULT_PORT, "must be a valid port number")?;
        let settle_secs = parse_or(
            "SETTLE_DELAY_SECS",
            lookup("SETTLE_DELAY_SECS"),
            DEFAULT_SETTLE_DELAY.as_secs(),
            "must be a whole number of seconds",
        )?;
        let worker_concurrency: usize = parse_or(
            "WORKER_CONCURRENCY",
            lookup("WORKER_CONCURRENCY"),
            1,
            "must be a positive integer",
        )?;
        if worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_CONCURRENCY",
                "must be at least 1".to_string(),
            ));
        }

        // Managed services are reachable by container name only when this
        // process runs inside the platform network.
        let in_network = flags.is_production() && flags.setup_services;
        let service_host = |service: &str| {
            if in_network {
                service.to_string()
            } else {
                "127.0.0.1".to_string()
            }
        };

        let postgres_password =
            non_empty(lookup("POSTGRES_PASSWORD")).unwrap_or_else(|| "shipyard".to_string());
        let database_url = non_empty(lookup("DATABASE_URL")).unwrap_or_else(|| {
            format!(
                "postgres://shipyard:{}@{}:5432/shipyard",
                postgres_password,
                service_host(POSTGRES_SERVICE)
            )
        });
        let redis_url = non_empty(lookup("REDIS_URL"))
            .unwrap_or_else(|| format!("redis://{}:6379", service_host(REDIS_SERVICE)));

        let restart_webhooks = lookup("RESTART_WEBHOOK_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            flags,
            host,
            port,
            settle_delay: Duration::from_secs(settle_secs),
            database_url,
            migrations_dir: non_empty(lookup("MIGRATIONS_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./migrations")),
            redis_url,
            paths: PlatformPaths::new(
                non_empty(lookup("BASE_PATH")).unwrap_or_else(|| DEFAULT_BASE_PATH.to_string()),
            ),
            app_upstream: non_empty(lookup("APP_UPSTREAM")),
            worker_concurrency,
            deploy_script: non_empty(lookup("DEPLOY_SCRIPT")),
            restart_webhooks,
            postgres_password,
            log: LogConfig {
                format,
                dir: non_empty(lookup("LOG_DIR")).map(PathBuf::from),
            },
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
