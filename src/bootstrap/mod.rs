//! Bootstrap sequencer.
//!
//! Runs the initialization steps that apply to the current [`StartupFlags`]
//! strictly in declared order. The first failure aborts the sequence, so the
//! process never serves traffic half-initialized.

pub mod steps;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StartupFlags;
use crate::cron::CronScheduler;
use crate::errors::BootstrapError;
use crate::infra::Provisioner;
use crate::migration::SchemaMigrator;
use crate::notify::Notifier;
use crate::server::{BoundServer, ConnectionRouter, build_app};
use crate::worker::{DeploymentWorker, WorkerLifecycle, WorkerReport, WorkerState};
use steps::{InitializationStep, STEPS, StepAction};

/// Everything the sequencer drives, constructed once per process.
pub struct BootstrapContext {
    pub flags: StartupFlags,
    pub listen_addr: SocketAddr,
    pub settle_delay: Duration,
    pub cors_permissive: bool,
    pub provisioner: Arc<dyn Provisioner>,
    pub migrator: Arc<dyn SchemaMigrator>,
    pub notifier: Arc<dyn Notifier>,
    pub cron: Arc<CronScheduler>,
    pub router: Arc<ConnectionRouter>,
    pub worker: Arc<DeploymentWorker>,
    pub shutdown: CancellationToken,
}

/// Names of the steps that started, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepTrace {
    names: Vec<&'static str>,
}

impl StepTrace {
    fn record(&mut self, name: &'static str) {
        self.names.push(name);
    }

    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| *n == name)
    }
}

pub struct Sequencer {
    ctx: BootstrapContext,
    trace: StepTrace,
    migrated: bool,
    notified: bool,
    local_addr: Option<SocketAddr>,
    server: Option<JoinHandle<anyhow::Result<()>>>,
    worker: Option<JoinHandle<WorkerReport>>,
}

impl Sequencer {
    pub fn new(ctx: BootstrapContext) -> Self {
        Self {
            ctx,
            trace: StepTrace::default(),
            migrated: false,
            notified: false,
            local_addr: None,
            server: None,
            worker: None,
        }
    }

    pub fn trace(&self) -> &StepTrace {
        &self.trace
    }

    /// Run the full plan for the configured flags.
    pub async fn run(&mut self) -> Result<Ready, BootstrapError> {
        let plan = steps::plan(&self.ctx.flags);
        info!(
            mode = ?self.ctx.flags.mode,
            build = ?self.ctx.flags.build,
            setup_services = self.ctx.flags.setup_services,
            steps = plan.len(),
            "Starting bootstrap"
        );
        self.run_steps(&plan).await?;
        self.into_ready()
    }

    /// Run only the host provisioning steps, regardless of `SETUP_SERVICES`.
    pub async fn run_provisioning(&mut self) -> Result<(), BootstrapError> {
        if self.ctx.flags.is_hosted() {
            return Err(BootstrapError::Step {
                step: "setup",
                source: anyhow!("hosted deployments do not provision infrastructure"),
            });
        }
        let plan: Vec<&InitializationStep> = STEPS
            .iter()
            .filter(|s| s.action.is_provisioning())
            .collect();
        self.run_steps(&plan).await
    }

    pub(crate) async fn run_steps(
        &mut self,
        steps: &[&InitializationStep],
    ) -> Result<(), BootstrapError> {
        for (index, step) in steps.iter().enumerate() {
            info!(
                step = step.name,
                index = index + 1,
                total = steps.len(),
                "Initialization step"
            );
            self.trace.record(step.name);
            if let Err(e) = self.execute(step).await {
                // Stop whatever already started (server, cron loops).
                self.ctx.shutdown.cancel();
                return Err(e);
            }
        }
        Ok(())
    }

    fn migration_required(&self) -> bool {
        STEPS
            .iter()
            .any(|s| s.action == StepAction::Migration && s.applies(&self.ctx.flags))
    }

    async fn execute(&mut self, step: &InitializationStep) -> Result<(), BootstrapError> {
        let name = step.name;
        let wrap = |source: anyhow::Error| BootstrapError::Step { step: name, source };
        let p = &self.ctx.provisioner;
        match step.action {
            StepAction::Directories => p.setup_directories().await.map_err(wrap),
            StepAction::Middlewares => p.create_default_middlewares().await.map_err(wrap),
            StepAction::Network => p.initialize_network().await.map_err(wrap),
            StepAction::TraefikConfig => p.create_default_traefik_config().await.map_err(wrap),
            StepAction::ServerTraefikConfig => {
                p.create_default_server_traefik_config().await.map_err(wrap)
            }
            StepAction::Postgres => p.initialize_postgres().await.map_err(wrap),
            StepAction::Traefik => p.initialize_traefik().await.map_err(wrap),
            StepAction::Redis => p.initialize_redis().await.map_err(wrap),
            StepAction::Cron => {
                self.ctx.cron.start();
                Ok(())
            }
            StepAction::Settle => {
                info!(
                    delay_secs = self.ctx.settle_delay.as_secs(),
                    "Waiting for services to settle"
                );
                tokio::time::sleep(self.ctx.settle_delay).await;
                Ok(())
            }
            StepAction::Migration => {
                self.ctx.migrator.migrate().await.map_err(wrap)?;
                self.migrated = true;
                Ok(())
            }
            StepAction::RestartNotification => {
                if self.notified {
                    warn!("Restart notification already sent");
                    return Ok(());
                }
                self.notified = true;
                self.ctx.notifier.notify_restart().await.map_err(wrap)
            }
            StepAction::Bind => self.bind().await,
            StepAction::Worker => self.start_worker(),
        }
    }

    async fn bind(&mut self) -> Result<(), BootstrapError> {
        if self.local_addr.is_some() {
            return Err(BootstrapError::AlreadyBound);
        }
        let bound = BoundServer::bind(self.ctx.listen_addr).await?;
        let addr = bound.local_addr();
        let app = build_app(self.ctx.router.clone(), self.ctx.cors_permissive);
        self.server = Some(tokio::spawn(bound.serve(app, self.ctx.shutdown.clone())));
        self.local_addr = Some(addr);
        info!(
            %addr,
            endpoints = ?self.ctx.router.registry().paths(),
            "Server Started"
        );
        Ok(())
    }

    fn start_worker(&mut self) -> Result<(), BootstrapError> {
        if self.migration_required() && !self.migrated {
            return Err(BootstrapError::WorkerBeforeMigration);
        }
        self.ctx.worker.lifecycle().begin_start()?;
        info!("Starting deployment worker");
        let worker = self.ctx.worker.clone();
        let shutdown = self.ctx.shutdown.clone();
        self.worker = Some(tokio::spawn(async move { worker.run(shutdown).await }));
        Ok(())
    }

    fn into_ready(&mut self) -> Result<Ready, BootstrapError> {
        let (Some(local_addr), Some(server)) = (self.local_addr, self.server.take()) else {
            return Err(BootstrapError::Step {
                step: "bind",
                source: anyhow!("bootstrap finished without a bound server"),
            });
        };
        Ok(Ready {
            local_addr,
            trace: self.trace.clone(),
            lifecycle: self.ctx.worker.lifecycle().clone(),
            shutdown: self.ctx.shutdown.clone(),
            server,
            worker: self.worker.take(),
        })
    }
}

/// A fully initialized, serving process.
pub struct Ready {
    local_addr: SocketAddr,
    trace: StepTrace,
    lifecycle: WorkerLifecycle,
    shutdown: CancellationToken,
    server: JoinHandle<anyhow::Result<()>>,
    worker: Option<JoinHandle<WorkerReport>>,
}

impl Ready {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn steps(&self) -> &StepTrace {
        &self.trace
    }

    pub fn worker_state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drive the server and worker until shutdown, then close both.
    pub async fn wait(self) -> anyhow::Result<()> {
        let result = match self.server.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("server task failed: {}", e)),
        };
        // The server can also stop on its own; the worker follows it.
        self.shutdown.cancel();
        if let Some(worker) = self.worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        result
    }
}
