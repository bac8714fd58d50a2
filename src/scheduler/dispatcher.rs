use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::{OrchestratorError, Result};
use crate::fleet::{
    AffinityTarget, AssignmentStore, Robot, RobotRegistry, RobotSelectionService, RobotStatus,
};
use crate::scheduler::events::{EventBus, JobEvent};
use crate::scheduler::job::Job;
use crate::scheduler::queue::{Claimant, JobQueue};

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub assigned: usize,
    /// Pending jobs looked at but left `PENDING`.
    pub skipped: usize,
}

/// Pushes pending jobs onto robots.
///
/// Each tick takes a fresh fleet snapshot, so the only state carried between
/// ticks is the selection service's round-robin cursor. Assignment goes
/// through [`JobQueue::try_claim`]; a robot pulling the same job at the same
/// moment simply wins and the dispatcher moves on.
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    registry: Arc<RwLock<RobotRegistry>>,
    assignments: Arc<RwLock<AssignmentStore>>,
    selector: RobotSelectionService,
    config: DispatchConfig,
    visibility_timeout: Duration,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<RwLock<RobotRegistry>>,
        assignments: Arc<RwLock<AssignmentStore>>,
        events: EventBus,
        config: DispatchConfig,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            selector: RobotSelectionService::new(config.strategy),
            queue,
            registry,
            assignments,
            config,
            visibility_timeout,
            events,
        }
    }

    /// Runs one dispatch pass.
    pub async fn tick(&mut self) -> Result<DispatchReport> {
        let running = self.queue.running_counts().await?;
        let mut robots = {
            let mut registry = self.registry.write().await;
            registry.sweep_liveness();
            registry.sync_loads(&running);
            registry.snapshot()
        };

        let pending = self.queue.pending(self.config.batch_size).await?;
        let mut report = DispatchReport::default();

        for (index, job) in pending.iter().enumerate() {
            if !robots.iter().any(has_free_slot) {
                report.skipped += pending.len() - index;
                tracing::debug!(
                    waiting = pending.len() - index,
                    "Fleet saturated, leaving remaining jobs pending"
                );
                break;
            }

            let affinity = self.affinity_for(job).await;
            match self.assign(job, &mut robots, affinity.as_ref()).await? {
                Some(robot_id) => {
                    report.assigned += 1;
                    tracing::info!(job_id = %job.id, robot_id = %robot_id, "Job assigned");
                }
                None => report.skipped += 1,
            }
        }

        if report.assigned > 0 {
            tracing::info!(
                assigned = report.assigned,
                skipped = report.skipped,
                "Dispatch pass finished"
            );
        }
        Ok(report)
    }

    async fn affinity_for(&self, job: &Job) -> Option<AffinityTarget> {
        self.assignments
            .read()
            .await
            .affinity_for(job, self.config.affinity_mode)
    }

    /// Tries to place one job. `Ok(None)` leaves it pending.
    async fn assign(
        &mut self,
        job: &Job,
        robots: &mut [Robot],
        affinity: Option<&AffinityTarget>,
    ) -> Result<Option<String>> {
        let mut excluded: HashSet<String> = HashSet::new();

        for attempt in 1..=self.config.max_selection_attempts {
            let candidates: Vec<Robot> = robots
                .iter()
                .filter(|r| !excluded.contains(&r.id))
                .cloned()
                .collect();

            let robot_id = match self.selector.select(&candidates, job, affinity) {
                Ok(robot_id) => robot_id,
                Err(OrchestratorError::NoAvailableRobot) => {
                    tracing::debug!(job_id = %job.id, "No eligible robot");
                    return Ok(None);
                }
                Err(OrchestratorError::RobotUnavailable(robot_id)) => {
                    tracing::debug!(job_id = %job.id, robot_id = %robot_id, "Pinned robot unavailable, job waits");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            let Some(robot) = robots.iter_mut().find(|r| r.id == robot_id) else {
                return Err(OrchestratorError::Internal(format!(
                    "selected robot {robot_id} is not in the fleet snapshot"
                )));
            };
            let claimant = Claimant {
                robot_id: robot_id.clone(),
                max_concurrent_jobs: robot.max_concurrent_jobs,
            };

            match self
                .queue
                .try_claim(job.id, &claimant, self.visibility_timeout)
                .await
            {
                Ok(Some(claimed)) => {
                    let load = robot.current_load + 1;
                    robot.set_load(load);
                    self.events.emit(JobEvent::JobAssigned {
                        job_id: claimed.id,
                        robot_id: robot_id.clone(),
                        at: claimed.claimed_at.unwrap_or_else(chrono::Utc::now),
                    });
                    return Ok(Some(robot_id));
                }
                Ok(None) | Err(OrchestratorError::JobNotFound(_)) => {
                    tracing::debug!(job_id = %job.id, "Job taken before dispatch");
                    return Ok(None);
                }
                Err(OrchestratorError::RobotAtCapacity { .. }) => {
                    tracing::debug!(
                        job_id = %job.id,
                        robot_id = %robot_id,
                        attempt,
                        "Robot filled up before assignment, reselecting"
                    );
                    let full = robot.max_concurrent_jobs;
                    robot.set_load(full);
                    excluded.insert(robot_id);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(job_id = %job.id, "Selection attempts exhausted");
        Ok(None)
    }

    /// Ticks every `interval_ms` until `shutdown` fires. A tick in progress
    /// runs to completion first.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            strategy = ?self.selector.strategy(),
            affinity_mode = ?self.config.affinity_mode,
            interval_ms = self.config.interval_ms,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Dispatch pass failed");
                    }
                }
            }
        }

        tracing::info!("Dispatcher stopped");
    }
}

fn has_free_slot(robot: &Robot) -> bool {
    robot.status == RobotStatus::Online && robot.has_capacity()
}
