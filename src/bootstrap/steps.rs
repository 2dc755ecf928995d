//! The declared initialization order.

use crate::config::StartupFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepAction {
    Migration,
    Directories,
    Middlewares,
    Network,
    TraefikConfig,
    ServerTraefikConfig,
    Postgres,
    Traefik,
    Redis,
    Cron,
    Settle,
    RestartNotification,
    Bind,
    Worker,
}

impl StepAction {
    /// Host provisioning steps, the ones `shipyard setup` runs.
    pub fn is_provisioning(self) -> bool {
        matches!(
            self,
            StepAction::Directories
                | StepAction::Middlewares
                | StepAction::Network
                | StepAction::TraefikConfig
                | StepAction::ServerTraefikConfig
                | StepAction::Postgres
                | StepAction::Traefik
                | StepAction::Redis
        )
    }
}

pub struct InitializationStep {
    pub name: &'static str,
    pub action: StepAction,
    predicate: fn(&StartupFlags) -> bool,
}

impl InitializationStep {
    const fn new(
        name: &'static str,
        action: StepAction,
        predicate: fn(&StartupFlags) -> bool,
    ) -> Self {
        Self {
            name,
            action,
            predicate,
        }
    }

    pub fn applies(&self, flags: &StartupFlags) -> bool {
        (self.predicate)(flags)
    }
}

impl std::fmt::Debug for InitializationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationStep")
            .field("name", &self.name)
            .field("action", &self.action)
            .finish()
    }
}

fn hosted_production(f: &StartupFlags) -> bool {
    f.is_hosted() && f.is_production()
}

fn provisioning(f: &StartupFlags) -> bool {
    f.provisions_infra()
}

fn provisioning_production(f: &StartupFlags) -> bool {
    f.provisions_infra() && f.is_production()
}

fn always(_: &StartupFlags) -> bool {
    true
}

fn worker(f: &StartupFlags) -> bool {
    f.runs_worker()
}

pub static STEPS: [InitializationStep; 15] = [
    InitializationStep::new("migration", StepAction::Migration, hosted_production),
    InitializationStep::new("directories", StepAction::Directories, provisioning),
    InitializationStep::new("middlewares", StepAction::Middlewares, provisioning),
    InitializationStep::new("network", StepAction::Network, provisioning),
    InitializationStep::new("traefik-config", StepAction::TraefikConfig, provisioning),
    InitializationStep::new(
        "server-traefik-config",
        StepAction::ServerTraefikConfig,
        provisioning,
    ),
    InitializationStep::new("postgres", StepAction::Postgres, provisioning),
    InitializationStep::new("traefik", StepAction::Traefik, provisioning),
    InitializationStep::new("redis", StepAction::Redis, provisioning),
    InitializationStep::new("cron", StepAction::Cron, provisioning),
    InitializationStep::new("settle", StepAction::Settle, provisioning_production),
    InitializationStep::new("migration", StepAction::Migration, provisioning_production),
    InitializationStep::new(
        "restart-notification",
        StepAction::RestartNotification,
        provisioning_production,
    ),
    InitializationStep::new("bind", StepAction::Bind, always),
    InitializationStep::new("worker", StepAction::Worker, worker),
];

/// The steps that apply for `flags`, in declared order.
pub fn plan(flags: &StartupFlags) -> Vec<&'static InitializationStep> {
    STEPS.iter().filter(|s| s.applies(flags)).collect()
}

pub fn plan_names(flags: &StartupFlags) -> Vec<&'static str> {
    plan(flags).into_iter().map(|s| s.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildMode, DeploymentMode};

    fn all_flags() -> Vec<StartupFlags> {
        let mut out = Vec::new();
        for mode in [DeploymentMode::Hosted, DeploymentMode::SelfHosted] {
            for build in [BuildMode::Production, BuildMode::Development] {
                for setup in [true, false] {
                    out.push(StartupFlags::new(mode, build, setup));
                }
            }
        }
        out
    }

    #[test]
    fn test_hosted_production_plan() {
        let flags = StartupFlags::new(DeploymentMode::Hosted, BuildMode::Production, false);
        assert_eq!(plan_names(&flags), vec!["migration", "bind"]);
    }

    #[test]
    fn test_self_hosted_production_setup_plan() {
        let flags = StartupFlags::new(DeploymentMode::SelfHosted, BuildMode::Production, true);
        assert_eq!(
            plan_names(&flags),
            vec![
                "directories",
                "middlewares",
                "network",
                "traefik-config",
                "server-traefik-config",
                "postgres",
                "traefik",
                "redis",
                "cron",
                "settle",
                "migration",
                "restart-notification",
                "bind",
                "worker",
            ]
        );
    }

    #[test]
    fn test_self_hosted_development_without_setup() {
        let flags = StartupFlags::new(DeploymentMode::SelfHosted, BuildMode::Development, false);
        assert_eq!(plan_names(&flags), vec!["bind", "worker"]);
    }

    #[test]
    fn test_hosted_never_provisions_or_runs_worker() {
        for flags in all_flags().into_iter().filter(|f| f.is_hosted()) {
            for step in plan(&flags) {
                assert!(!step.action.is_provisioning(), "{:?} ran {}", flags, step.name);
                assert_ne!(step.action, StepAction::Worker);
                assert_ne!(step.action, StepAction::RestartNotification);
            }
        }
    }

    #[test]
    fn test_bind_always_planned_and_precedes_worker() {
        for flags in all_flags() {
            let names = plan_names(&flags);
            let bind = names.iter().position(|n| *n == "bind").unwrap();
            if let Some(worker) = names.iter().position(|n| *n == "worker") {
                assert!(bind < worker);
            }
        }
    }

    #[test]
    fn test_provisioning_actions_match_setup_command() {
        let count = STEPS.iter().filter(|s| s.action.is_provisioning()).count();
        assert_eq!(count, 8);
    }
}
