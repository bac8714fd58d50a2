use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::types::{FailStatus, RegisterRobotRequest};
use crate::config::AgentConfig;
use crate::error::{OrchestratorError, Result};
use crate::robot::consumer::RobotJobConsumer;
use crate::robot::executor::{WorkflowOutcome, WorkflowRunner};
use crate::scheduler::{CompletionOutcome, Job};

/// A robot's main loop: register, heartbeat, claim, run, report.
pub struct RobotAgent {
    consumer: RobotJobConsumer,
    runner: Arc<dyn WorkflowRunner>,
    config: AgentConfig,
}

impl RobotAgent {
    pub fn new(config: AgentConfig, runner: Arc<dyn WorkflowRunner>) -> Result<Self> {
        config.validate()?;
        let consumer = RobotJobConsumer::new(config.server_url.clone(), config.api_key.clone())?;
        Ok(Self {
            consumer,
            runner,
            config,
        })
    }

    pub fn consumer(&self) -> &RobotJobConsumer {
        &self.consumer
    }

    fn registration(&self) -> RegisterRobotRequest {
        RegisterRobotRequest {
            name: Some(self.config.name.clone()),
            capabilities: self.config.capabilities.clone(),
            environment: Some(self.config.environment.clone()),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            tenant_id: self.config.tenant_id.clone(),
        }
    }

    /// Runs until `shutdown` fires, then waits for in-flight jobs to be
    /// reported before returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let robot = self.consumer.register(&self.registration()).await?;
        tracing::info!(
            robot_id = %robot.id,
            max_concurrent_jobs = robot.max_concurrent_jobs,
            environment = %robot.environment,
            "Robot registered with orchestrator"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let capacity = self.config.max_concurrent_jobs as usize;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Job task panicked");
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.consumer.heartbeat().await {
                        tracing::warn!(error = %e, "Heartbeat failed");
                    }
                }
                _ = poll.tick() => {
                    while in_flight.len() < capacity {
                        match self
                            .consumer
                            .claim_job(Some(&self.config.environment), self.config.visibility_timeout_secs)
                            .await
                        {
                            Ok(Some(job)) => {
                                tracing::info!(job_id = %job.id, workflow_id = %job.workflow_id, "Claimed job");
                                in_flight.spawn(run_job(
                                    self.consumer.clone(),
                                    self.runner.clone(),
                                    job,
                                    self.config.lease_renewal_interval(),
                                    self.config.visibility_timeout_secs,
                                ));
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "Claim failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!(in_flight = in_flight.len(), "Draining in-flight jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job task panicked");
            }
        }
        if let Err(e) = self.consumer.go_offline().await {
            tracing::warn!(error = %e, "Could not report going offline");
        }
        tracing::info!("Robot agent stopped");
        Ok(())
    }
}

/// Runs one job with a lease keeper alongside it, then reports.
async fn run_job(
    consumer: RobotJobConsumer,
    runner: Arc<dyn WorkflowRunner>,
    job: Job,
    renewal: Duration,
    extension_secs: u64,
) {
    let job_id = job.id;
    let stop_renewal = CancellationToken::new();
    let keeper = tokio::spawn(keep_lease(
        consumer.clone(),
        job_id,
        renewal,
        extension_secs,
        stop_renewal.clone(),
    ));

    let outcome = runner.run(&job).await;
    stop_renewal.cancel();
    let _ = keeper.await;

    match outcome {
        WorkflowOutcome::Succeeded(result) => {
            match consumer.report_completion(job_id, result).await {
                Ok(CompletionOutcome::Completed) => {
                    tracing::info!(job_id = %job_id, "Job completed");
                }
                Ok(CompletionOutcome::AlreadyCompleted) => {}
                Err(e) => report_error(job_id, "completion", e),
            }
        }
        WorkflowOutcome::Failed(error) => match consumer.report_failure(job_id, error).await {
            Ok(response) => match response.status {
                FailStatus::Requeued => tracing::warn!(
                    job_id = %job_id,
                    retry_count = response.retry_count,
                    "Job failed, requeued"
                ),
                FailStatus::DeadLetter => tracing::error!(
                    job_id = %job_id,
                    retry_count = response.retry_count,
                    "Job failed, moved to dead letter"
                ),
            },
            Err(e) => report_error(job_id, "failure", e),
        },
    }
}

fn report_error(job_id: Uuid, what: &str, error: OrchestratorError) {
    match error {
        // Lease expired mid-run and the job went to another robot.
        OrchestratorError::Api { status: 409, message } => {
            tracing::warn!(job_id = %job_id, message = %message, "Job no longer ours, {what} dropped");
        }
        other => {
            tracing::error!(job_id = %job_id, error = %other, "Failed to report {what}");
        }
    }
}

/// Extends the lease every `renewal` until stopped or the lease is lost.
async fn keep_lease(
    consumer: RobotJobConsumer,
    job_id: Uuid,
    renewal: Duration,
    extension_secs: u64,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(renewal);
    // First tick fires immediately; the claim itself set a fresh lease.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = interval.tick() => {
                match consumer.extend_lease(job_id, extension_secs).await {
                    Ok(true) => tracing::debug!(job_id = %job_id, "Lease extended"),
                    Ok(false) => {
                        tracing::warn!(job_id = %job_id, "Lease lost, result will be rejected");
                        return;
                    }
                    Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Lease extension failed"),
                }
            }
        }
    }
}
