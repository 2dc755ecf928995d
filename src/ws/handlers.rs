//! The reserved socket endpoints.
//!
//! Each handler validates its query, builds one child process and lets
//! [`bridge::run_process`] own the connection from there. Stats monitoring
//! is the exception: it polls `docker stats` on an interval and pushes one
//! JSON frame per sample.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::process::Command;
use tracing::{debug, info};

use super::bridge::{self, Input};
use super::{SocketHandler, UpgradeRequest};
use crate::config::PlatformPaths;

const DOCKER: &str = "docker";
const DEFAULT_TAIL: u32 = 100;
const SHELLS: &[&str] = &["sh", "bash", "ash", "zsh"];

/// Container names and ids as Docker accepts them. Rejecting a leading `-`
/// keeps the value from being read as a CLI flag.
pub fn is_valid_container_ref(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// `since` accepts `all` (no filter), a relative duration such as `5m`/`2h`,
/// or a unix timestamp.
fn parse_since(value: Option<&str>) -> Result<Option<String>, String> {
    match value {
        None | Some("all") => Ok(None),
        Some(v) => {
            let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
            let (digits, unit) = v.split_at(split);
            let unit_ok = matches!(unit, "" | "s" | "m" | "h");
            if digits.is_empty() || !unit_ok {
                Err(format!("Invalid since value '{}'", v))
            } else {
                Ok(Some(v.to_string()))
            }
        }
    }
}

// ── Container logs ───────────────────────────────────────────────────

pub struct ContainerLogsHandler;

impl ContainerLogsHandler {
    pub fn command(request: &UpgradeRequest) -> Result<Command, String> {
        let container = request
            .param("containerId")
            .filter(|c| is_valid_container_ref(c))
            .ok_or("containerId is required")?;
        let tail: u32 = match request.param("tail") {
            Some(raw) => raw.parse().map_err(|_| format!("Invalid tail value '{}'", raw))?,
            None => DEFAULT_TAIL,
        };
        let since = parse_since(request.param("since"))?;

        let mut cmd = Command::new(DOCKER);
        cmd.args(["container", "logs", "--timestamps", "--follow", "--tail"])
            .arg(tail.to_string());
        if let Some(since) = since {
            cmd.args(["--since", &since]);
        }
        cmd.arg(container);
        Ok(cmd)
    }
}

#[async_trait]
impl SocketHandler for ContainerLogsHandler {
    fn name(&self) -> &'static str {
        "container-logs"
    }

    async fn handle(&self, socket: WebSocket, request: UpgradeRequest) {
        match Self::command(&request) {
            Ok(cmd) => bridge::run_process(socket, cmd, Input::Ignore, self.name()).await,
            Err(reason) => bridge::reject(socket, &reason).await,
        }
    }
}

// ── Container terminal ───────────────────────────────────────────────

pub struct ContainerTerminalHandler;

impl ContainerTerminalHandler {
    pub fn command(request: &UpgradeRequest) -> Result<Command, String> {
        let container = request
            .param("containerId")
            .filter(|c| is_valid_container_ref(c))
            .ok_or("containerId is required")?;
        let shell = request.param("activeWay").unwrap_or("sh");
        if !SHELLS.contains(&shell) {
            return Err(format!("Unsupported shell '{}'", shell));
        }

        let mut cmd = Command::new(DOCKER);
        cmd.args(["exec", "-i", container, shell]);
        Ok(cmd)
    }
}

#[async_trait]
impl SocketHandler for ContainerTerminalHandler {
    fn name(&self) -> &'static str {
        "container-terminal"
    }

    async fn handle(&self, socket: WebSocket, request: UpgradeRequest) {
        match Self::command(&request) {
            Ok(cmd) => {
                info!(endpoint = self.name(), "Container terminal session opened");
                bridge::run_process(socket, cmd, Input::Forward, self.name()).await;
                info!(endpoint = self.name(), "Container terminal session closed");
            }
            Err(reason) => bridge::reject(socket, &reason).await,
        }
    }
}

// ── Container stats ──────────────────────────────────────────────────

pub struct ContainerStatsHandler {
    pub interval: Duration,
}

impl Default for ContainerStatsHandler {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1300),
        }
    }
}

impl ContainerStatsHandler {
    fn sample_command(app_name: &str) -> Command {
        let mut cmd = Command::new(DOCKER);
        cmd.args([
            "container",
            "stats",
            "--no-stream",
            "--format",
            "{{json .}}",
            app_name,
        ]);
        cmd
    }

    async fn sample(app_name: &str) -> Result<String, String> {
        let output = Self::sample_command(app_name)
            .output()
            .await
            .map_err(|e| format!("Failed to run docker stats: {}", e))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        let line = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value: serde_json::Value =
            serde_json::from_str(&line).map_err(|e| format!("Malformed stats output: {}", e))?;
        Ok(serde_json::json!({
            "appName": app_name,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "stats": value,
        })
        .to_string())
    }
}

#[async_trait]
impl SocketHandler for ContainerStatsHandler {
    fn name(&self) -> &'static str {
        "container-stats"
    }

    async fn handle(&self, socket: WebSocket, request: UpgradeRequest) {
        let Some(app_name) = request
            .param("appName")
            .filter(|c| is_valid_container_ref(c))
            .map(String::from)
        else {
            bridge::reject(socket, "appName is required").await;
            return;
        };

        let (mut sender, mut receiver) = socket.split();
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let frame = match Self::sample(&app_name).await {
                        Ok(json) => json,
                        Err(reason) => serde_json::json!({ "error": reason }).to_string(),
                    };
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
        debug!(endpoint = self.name(), app = %app_name, "Stats stream closed");
        let _ = sender.send(Message::Close(None)).await;
    }
}

// ── Deployment log tail ──────────────────────────────────────────────

pub struct DeploymentLogHandler {
    paths: PlatformPaths,
}

impl DeploymentLogHandler {
    pub fn new(paths: PlatformPaths) -> Self {
        Self { paths }
    }

    pub fn command(&self, request: &UpgradeRequest) -> Result<Command, String> {
        let requested = request.param("logPath").ok_or("logPath is required")?;
        let path = self
            .paths
            .resolve_log_path(requested)
            .ok_or_else(|| format!("Log path '{}' is outside the logs directory", requested))?;

        let mut cmd = Command::new("tail");
        cmd.args(["-n", "+1", "-F"]).arg(path);
        Ok(cmd)
    }
}

#[async_trait]
impl SocketHandler for DeploymentLogHandler {
    fn name(&self) -> &'static str {
        "deployment-logs"
    }

    async fn handle(&self, socket: WebSocket, request: UpgradeRequest) {
        match self.command(&request) {
            Ok(cmd) => bridge::run_process(socket, cmd, Input::Ignore, self.name()).await,
            Err(reason) => bridge::reject(socket, &reason).await,
        }
    }
}

// ── Generic terminal ─────────────────────────────────────────────────

pub struct TerminalHandler {
    shell: String,
}

impl TerminalHandler {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string()))
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-i");
        cmd
    }
}

#[async_trait]
impl SocketHandler for TerminalHandler {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn handle(&self, socket: WebSocket, _request: UpgradeRequest) {
        info!(endpoint = self.name(), shell = %self.shell, "Terminal session opened");
        bridge::run_process(socket, self.command(), Input::Forward, self.name()).await;
        info!(endpoint = self.name(), "Terminal session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn request(path: &str, pairs: &[(&str, &str)]) -> UpgradeRequest {
        UpgradeRequest {
            path: path.to_string(),
            query: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(OsStr::to_string_lossy)
            .map(|s| s.into_owned())
            .collect()
    }

    #[test]
    fn test_container_ref_validation() {
        assert!(is_valid_container_ref("web-app_1.blue"));
        assert!(is_valid_container_ref("3f2a9c"));
        assert!(!is_valid_container_ref(""));
        assert!(!is_valid_container_ref("--privileged"));
        assert!(!is_valid_container_ref("app; rm -rf /"));
    }

    #[test]
    fn test_container_logs_command_defaults() {
        let cmd = ContainerLogsHandler::command(&request("/l", &[("containerId", "web")])).unwrap();
        assert_eq!(cmd.as_std().get_program(), "docker");
        assert_eq!(
            args(&cmd),
            vec!["container", "logs", "--timestamps", "--follow", "--tail", "100", "web"]
        );
    }

    #[test]
    fn test_container_logs_command_with_since() {
        let cmd = ContainerLogsHandler::command(&request(
            "/l",
            &[("containerId", "web"), ("tail", "20"), ("since", "5m")],
        ))
        .unwrap();
        let a = args(&cmd);
        assert!(a.windows(2).any(|w| w == ["--tail", "20"]));
        assert!(a.windows(2).any(|w| w == ["--since", "5m"]));
    }

    #[test]
    fn test_container_logs_rejects_bad_query() {
        assert!(ContainerLogsHandler::command(&request("/l", &[])).is_err());
        assert!(
            ContainerLogsHandler::command(&request("/l", &[("containerId", "x"), ("tail", "lots")]))
                .is_err()
        );
        assert!(
            ContainerLogsHandler::command(&request("/l", &[("containerId", "x"), ("since", "1d")]))
                .is_err()
        );
    }

    #[test]
    fn test_container_terminal_shell_allowlist() {
        let cmd = ContainerTerminalHandler::command(&request(
            "/t",
            &[("containerId", "db"), ("activeWay", "bash")],
        ))
        .unwrap();
        assert_eq!(args(&cmd), vec!["exec", "-i", "db", "bash"]);

        assert!(
            ContainerTerminalHandler::command(&request(
                "/t",
                &[("containerId", "db"), ("activeWay", "python")],
            ))
            .is_err()
        );
    }

    #[test]
    fn test_deployment_log_confined_to_logs_dir() {
        let handler = DeploymentLogHandler::new(PlatformPaths::new("/etc/shipyard"));
        let cmd = handler
            .command(&request("/d", &[("logPath", "app-1/deploy.log")]))
            .unwrap();
        assert_eq!(
            args(&cmd),
            vec!["-n", "+1", "-F", "/etc/shipyard/logs/app-1/deploy.log"]
        );
        assert!(
            handler
                .command(&request("/d", &[("logPath", "../../etc/shadow")]))
                .is_err()
        );
        assert!(handler.command(&request("/d", &[])).is_err());
    }

    #[test]
    fn test_terminal_uses_configured_shell() {
        let handler = TerminalHandler::new("bash");
        let cmd = handler.command();
        assert_eq!(cmd.as_std().get_program(), "bash");
        assert_eq!(args(&cmd), vec!["-i"]);
    }

    #[test]
    fn test_parse_since() {
        assert_eq!(parse_since(None), Ok(None));
        assert_eq!(parse_since(Some("all")), Ok(None));
        assert_eq!(parse_since(Some("90s")), Ok(Some("90s".to_string())));
        assert_eq!(parse_since(Some("1700000000")), Ok(Some("1700000000".to_string())));
        assert!(parse_since(Some("yesterday")).is_err());
    }
}
