//! Deployment pipelines backed by external commands.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

use super::DeploymentPipeline;
use crate::errors::JobError;
use crate::queue::DeploymentJob;

/// Turn an arbitrary deployment id into a safe file name component.
pub fn slugify(id: &str, max_len: usize) -> String {
    let slug: String = id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug = if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    };
    if slug.is_empty() {
        "deployment".to_string()
    } else {
        slug
    }
}

/// Runs `sh -c <script>` once per job.
///
/// The job is exposed as `DEPLOYMENT_ID`, `JOB_ID` and `JOB_PAYLOAD`.
/// Combined output is appended to `<logs_dir>/<deployment>.log`, which the
/// deployment log endpoint tails.
pub struct ScriptPipeline {
    script: String,
    logs_dir: PathBuf,
}

impl ScriptPipeline {
    pub fn new(script: impl Into<String>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn log_path(&self, job: &DeploymentJob) -> PathBuf {
        self.logs_dir
            .join(format!("{}.log", slugify(&job.deployment_id, 80)))
    }
}

#[async_trait]
impl DeploymentPipeline for ScriptPipeline {
    async fn run(&self, job: &DeploymentJob) -> Result<(), JobError> {
        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|e| JobError::Retryable(format!("cannot create log dir: {}", e)))?;
        let log_path = self.log_path(job);
        let open_err = |e: std::io::Error| {
            JobError::Retryable(format!("cannot open {}: {}", log_path.display(), e))
        };
        let stdout = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(open_err)?
            .into_std()
            .await;
        let stderr = stdout.try_clone().map_err(open_err)?;

        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| JobError::Terminal(format!("unencodable payload: {}", e)))?;

        // The script writes straight into the log so the deployment log
        // endpoint can follow it live.
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.script)
            .env("DEPLOYMENT_ID", &job.deployment_id)
            .env("JOB_ID", job.id.to_string())
            .env("JOB_PAYLOAD", payload)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| JobError::Retryable(format!("failed to spawn deploy script: {}", e)))?;

        debug!(
            deployment_id = %job.deployment_id,
            %status,
            "Deploy script finished"
        );
        if status.success() {
            Ok(())
        } else {
            Err(JobError::Terminal(format!(
                "deploy script exited with {}",
                status
            )))
        }
    }
}

/// Used when no deploy script is configured. Every job fails terminally.
pub struct UnconfiguredPipeline;

#[async_trait]
impl DeploymentPipeline for UnconfiguredPipeline {
    async fn run(&self, job: &DeploymentJob) -> Result<(), JobError> {
        Err(JobError::Terminal(format!(
            "no deploy script configured for deployment {}",
            job.deployment_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My App/Prod", 40), "my-app-prod");
        assert_eq!(slugify("../../etc/passwd", 40), "etc-passwd");
        assert_eq!(slugify("app_1", 40), "app_1");
        assert_eq!(slugify("a-very-long-deployment-name", 10), "a-very-lon");
        assert_eq!(slugify("///", 10), "deployment");
    }

    #[tokio::test]
    async fn test_script_success_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ScriptPipeline::new("echo deploying $DEPLOYMENT_ID", dir.path());
        let job = DeploymentJob::new("web-app", json!({"ref": "main"}));
        pipeline.run(&job).await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("web-app.log")).unwrap();
        assert_eq!(log.trim(), "deploying web-app");
    }

    #[tokio::test]
    async fn test_log_is_written_while_script_runs() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = std::sync::Arc::new(ScriptPipeline::new(
            "echo started; sleep 2; echo done",
            dir.path(),
        ));
        let job = DeploymentJob::new("live", json!(null));
        let log_path = pipeline.log_path(&job);

        let running = {
            let pipeline = pipeline.clone();
            let job = job.clone();
            tokio::spawn(async move { pipeline.run(&job).await })
        };
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let mid_run = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(mid_run, "started\n");

        running.await.unwrap().unwrap();
        let finished = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(finished, "started\ndone\n");
    }

    #[tokio::test]
    async fn test_payload_is_exported() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ScriptPipeline::new("printf '%s' \"$JOB_PAYLOAD\"", dir.path());
        let job = DeploymentJob::new("api", json!({"ref": "v2"}));
        pipeline.run(&job).await.unwrap();
        let log = std::fs::read_to_string(pipeline.log_path(&job)).unwrap();
        assert_eq!(log, r#"{"ref":"v2"}"#);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ScriptPipeline::new("echo nope >&2; exit 3", dir.path());
        let err = pipeline
            .run(&DeploymentJob::new("api", json!(null)))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        let log = std::fs::read_to_string(dir.path().join("api.log")).unwrap();
        assert!(log.contains("nope"));
    }

    #[tokio::test]
    async fn test_unconfigured_pipeline_fails_terminally() {
        let err = UnconfiguredPipeline
            .run(&DeploymentJob::new("api", json!(null)))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
