//! Wires the production collaborators from a [`PlatformConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap::{BootstrapContext, Sequencer};
use crate::config::PlatformConfig;
use crate::cron::tasks::{ContainerHealthTask, DockerCleanupTask};
use crate::cron::{CronScheduler, DAILY_MIDNIGHT, EVERY_MINUTE};
use crate::infra::PlatformProvisioner;
use crate::infra::docker::{ContainerRuntime, DockerRuntime};
use crate::infra::services::ManagedServices;
use crate::migration::PostgresMigrator;
use crate::notify::WebhookNotifier;
use crate::queue::{DEFAULT_MAX_ATTEMPTS, RedisQueue};
use crate::server::ConnectionRouter;
use crate::server::upstream::{NotFoundHandler, RequestHandler, UpstreamHandler};
use crate::worker::script::{ScriptPipeline, UnconfiguredPipeline};
use crate::worker::{DeploymentPipeline, DeploymentWorker, WorkerLifecycle};
use crate::ws;

pub fn request_handler(config: &PlatformConfig) -> Result<Arc<dyn RequestHandler>> {
    let handler: Arc<dyn RequestHandler> = match &config.app_upstream {
        Some(url) => {
            info!(upstream = %url, "Forwarding HTTP requests to dashboard");
            Arc::new(UpstreamHandler::new(url.as_str())?)
        }
        None => Arc::new(NotFoundHandler),
    };
    Ok(handler)
}

pub fn pipeline(config: &PlatformConfig) -> Arc<dyn DeploymentPipeline> {
    match &config.deploy_script {
        Some(script) => Arc::new(ScriptPipeline::new(script.as_str(), config.paths.logs_dir())),
        None => Arc::new(UnconfiguredPipeline),
    }
}

pub fn cron_scheduler(
    runtime: Arc<dyn ContainerRuntime>,
    services: &ManagedServices,
    shutdown: CancellationToken,
) -> Result<CronScheduler> {
    let mut cron = CronScheduler::new(shutdown);
    cron.register(
        EVERY_MINUTE,
        Arc::new(ContainerHealthTask::new(
            runtime.clone(),
            services.container_names(),
        )),
    )?;
    cron.register(DAILY_MIDNIGHT, Arc::new(DockerCleanupTask::new(runtime)))?;
    Ok(cron)
}

/// Build every collaborator the bootstrap sequence drives.
pub fn build_context(
    config: &PlatformConfig,
    shutdown: CancellationToken,
) -> Result<BootstrapContext> {
    let registry = ws::default_registry(&config.flags, &config.paths)?;
    let router = Arc::new(ConnectionRouter::new(
        Arc::new(registry),
        request_handler(config)?,
    ));

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let services = ManagedServices::from_config(config);
    let cron = cron_scheduler(runtime.clone(), &services, shutdown.clone())?;
    let provisioner =
        PlatformProvisioner::new(config.paths.clone(), config.port, runtime, services);

    let queue = RedisQueue::new(&config.redis_url, DEFAULT_MAX_ATTEMPTS)
        .context("Invalid REDIS_URL")?;
    let worker = DeploymentWorker::new(
        Arc::new(queue),
        pipeline(config),
        config.worker_concurrency,
        WorkerLifecycle::new(),
    );

    Ok(BootstrapContext {
        flags: config.flags,
        listen_addr: config.listen_addr(),
        settle_delay: config.settle_delay,
        cors_permissive: !config.flags.is_production(),
        provisioner: Arc::new(provisioner),
        migrator: Arc::new(PostgresMigrator::new(
            config.database_url.as_str(),
            config.migrations_dir.clone(),
        )),
        notifier: Arc::new(WebhookNotifier::new(config.restart_webhooks.clone())),
        cron: Arc::new(cron),
        router,
        worker: Arc::new(worker),
        shutdown,
    })
}

pub fn sequencer(config: &PlatformConfig, shutdown: CancellationToken) -> Result<Sequencer> {
    Ok(Sequencer::new(build_context(config, shutdown)?))
}
