use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::scheduler::Job;

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
}

/// The workflow engine, seen from the robot's job loop.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, job: &Job) -> WorkflowOutcome;
}

/// Runs each job as a child process.
///
/// The job's variables are written to stdin as JSON and its identity is
/// passed through `RPA_*` environment variables. A zero exit is success;
/// stdout becomes the result (parsed as JSON when it is JSON).
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn spawn_and_wait(&self, job: &Job) -> std::io::Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("RPA_JOB_ID", job.id.to_string())
            .env("RPA_WORKFLOW_ID", &job.workflow_id)
            .env("RPA_WORKFLOW_NAME", &job.workflow_name)
            .env("RPA_NODE_ID", job.node_id.as_deref().unwrap_or(""))
            .env("RPA_RETRY_COUNT", job.retry_count.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&job.variables).unwrap_or_default();
            // A program that ignores stdin closes the pipe early.
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(job_id = %job.id, error = %e, "Workflow did not read its variables");
            }
        }

        child.wait_with_output().await
    }
}

#[async_trait]
impl WorkflowRunner for ProcessRunner {
    async fn run(&self, job: &Job) -> WorkflowOutcome {
        tracing::info!(
            job_id = %job.id,
            workflow_id = %job.workflow_id,
            program = %self.program,
            "Running workflow"
        );

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.spawn_and_wait(job)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(job_id = %job.id, timeout_ms = limit.as_millis() as u64, "Workflow timed out");
                    return WorkflowOutcome::Failed(format!(
                        "workflow timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
            None => self.spawn_and_wait(job).await,
        };

        process_output(job, result)
    }
}

fn process_output(job: &Job, result: std::io::Result<std::process::Output>) -> WorkflowOutcome {
    match result {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code();

            if output.status.success() {
                tracing::info!(job_id = %job.id, "Workflow succeeded");
                let result = serde_json::from_str(&stdout)
                    .unwrap_or_else(|_| serde_json::json!({ "stdout": stdout }));
                WorkflowOutcome::Succeeded(result)
            } else {
                tracing::warn!(job_id = %job.id, exit_code = ?exit_code, "Workflow failed");
                WorkflowOutcome::Failed(if stderr.is_empty() {
                    format!("exit code: {:?}", exit_code)
                } else {
                    stderr
                })
            }
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Failed to start workflow");
            WorkflowOutcome::Failed(e.to_string())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::scheduler::JobSpec;

    fn job() -> Job {
        Job::from_spec(
            JobSpec::new("wf-1", "Invoice run").with_variables(serde_json::json!({"n": 3})),
            Utc::now(),
            1,
        )
    }

    #[tokio::test]
    async fn json_stdout_becomes_the_result() {
        let runner = ProcessRunner::new("sh").with_args(["-c", "cat"]);
        assert_eq!(
            runner.run(&job()).await,
            WorkflowOutcome::Succeeded(serde_json::json!({"n": 3}))
        );
    }

    #[tokio::test]
    async fn plain_stdout_is_wrapped() {
        let runner = ProcessRunner::new("sh").with_args(["-c", "echo $RPA_WORKFLOW_ID"]);
        assert_eq!(
            runner.run(&job()).await,
            WorkflowOutcome::Succeeded(serde_json::json!({"stdout": "wf-1"}))
        );
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let runner = ProcessRunner::new("sh").with_args(["-c", "echo boom >&2; exit 3"]);
        assert_eq!(
            runner.run(&job()).await,
            WorkflowOutcome::Failed("boom".to_string())
        );
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let runner = ProcessRunner::new("/nonexistent/robot-workflow");
        assert!(matches!(
            runner.run(&job()).await,
            WorkflowOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn timeout_fails_the_job() {
        let runner = ProcessRunner::new("sh")
            .with_args(["-c", "sleep 5"])
            .with_timeout(Duration::from_millis(100));
        assert_eq!(
            runner.run(&job()).await,
            WorkflowOutcome::Failed("workflow timed out after 100ms".to_string())
        );
    }
}
