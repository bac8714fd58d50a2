use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{OrchestratorError, Result};
use crate::scheduler::events::{EventBus, JobEvent};
use crate::scheduler::job::{FailureOutcome, Job, JobSpec, JobStatus};
use crate::scheduler::queue::{
    ClaimRequest, Claimant, CompletionOutcome, JobQueue, QueueCounts, ReapedJob,
    LEASE_EXPIRED_REASON,
};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    next_sequence: u64,
}

impl QueueState {
    fn running_for(&self, robot_id: &str) -> u32 {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.is_owned_by(robot_id))
            .count() as u32
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    /// Ids of `jobs` matching `filter`, in dispatch order.
    fn ordered_ids(&self, filter: impl Fn(&Job) -> bool) -> Vec<Uuid> {
        let mut matching: Vec<&Job> = self.jobs.values().filter(|j| filter(j)).collect();
        matching.sort_by(|a, b| a.dispatch_order(b));
        matching.into_iter().map(|j| j.id).collect()
    }
}

/// In-process `JobQueue`.
///
/// One mutex guards the whole table, so each trait method is a single
/// critical section: the same all-or-nothing behavior a row-locking SQL
/// store gives.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    max_jobs: usize,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(EventBus::new())
    }
}

impl InMemoryJobQueue {
    pub fn new(events: EventBus) -> Self {
        Self::with_clock(events, Arc::new(SystemClock))
    }

    pub fn with_clock(events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_jobs: DEFAULT_MAX_JOBS,
            clock,
            events,
        }
    }

    pub fn with_capacity(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        spec.validate()?;
        let now = self.clock.now();

        let (job_id, workflow_id) = {
            let mut state = self.state.lock().await;
            if state.jobs.len() >= self.max_jobs {
                return Err(OrchestratorError::QueueFull(self.max_jobs));
            }
            state.next_sequence += 1;
            let job = Job::from_spec(spec, now, state.next_sequence);
            let job_id = job.id;
            tracing::info!(
                job_id = %job_id,
                workflow_id = %job.workflow_id,
                priority = job.priority,
                environment = %job.environment,
                "Job submitted"
            );
            let workflow_id = job.workflow_id.clone();
            state.jobs.insert(job_id, job);
            (job_id, workflow_id)
        };

        self.events.emit(JobEvent::JobSubmitted {
            job_id,
            workflow_id,
            at: now,
        });
        Ok(job_id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.sequence);
        Ok(jobs)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .ordered_ids(|j| j.status.is_claimable())
            .into_iter()
            .take(limit)
            .filter_map(|id| state.jobs.get(&id).cloned())
            .collect())
    }

    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<Job>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let robot_id = request.robot_id.as_str();
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();

        // Dispatcher-assigned jobs this robot has not picked up yet.
        let undelivered = state.ordered_ids(|j| {
            j.status == JobStatus::Running && j.is_owned_by(robot_id) && j.delivered_at.is_none()
        });
        for job_id in undelivered.into_iter().take(request.limit) {
            let job = state.job_mut(job_id)?;
            job.delivered_at = Some(now);
            job.lease_expires_at = Some(now + request.visibility_timeout);
            claimed.push(job.clone());
        }

        let capacity_left = request
            .max_concurrent_jobs
            .saturating_sub(state.running_for(robot_id)) as usize;
        let wanted = (request.limit - claimed.len()).min(capacity_left);
        if wanted > 0 {
            let candidates = state.ordered_ids(|j| {
                j.status.is_claimable()
                    && request.accepts(j)
                    && !request.routing.as_ref().is_some_and(|routing| {
                        routing.reserved_for_other(j, robot_id, |id| state.running_for(id))
                    })
            });
            for job_id in candidates.into_iter().take(wanted) {
                let job = state.job_mut(job_id)?;
                job.claim(robot_id, now, request.visibility_timeout, true)?;
                tracing::info!(job_id = %job_id, robot_id, "Job claimed");
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn try_claim(
        &self,
        job_id: Uuid,
        claimant: &Claimant,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let running = state.running_for(&claimant.robot_id);
        let job = state.job_mut(job_id)?;
        if !job.status.is_claimable() {
            return Ok(None);
        }
        if running >= claimant.max_concurrent_jobs {
            return Err(OrchestratorError::RobotAtCapacity {
                robot_id: claimant.robot_id.clone(),
                max_concurrent_jobs: claimant.max_concurrent_jobs,
            });
        }
        job.claim(&claimant.robot_id, now, visibility_timeout, false)?;
        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        robot_id: &str,
        extension: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;

        let live = job.status == JobStatus::Running
            && job.is_owned_by(robot_id)
            && job.lease_expires_at.is_some_and(|at| at >= now);
        if !live {
            tracing::debug!(job_id = %job_id, robot_id, status = %job.status, "Lease extension refused");
            return Ok(false);
        }
        job.lease_expires_at = Some(now + extension);
        job.delivered_at.get_or_insert(now);
        Ok(true)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        robot_id: &str,
        result: serde_json::Value,
    ) -> Result<CompletionOutcome> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            let job = state.job_mut(job_id)?;

            if !job.is_owned_by(robot_id) {
                return Err(OrchestratorError::DuplicateJobAssignment {
                    job_id,
                    robot_id: robot_id.to_string(),
                    owner: job.robot_id.clone(),
                });
            }
            if job.status == JobStatus::Completed {
                tracing::debug!(job_id = %job_id, robot_id, "Duplicate completion ignored");
                return Ok(CompletionOutcome::AlreadyCompleted);
            }
            job.complete(result, now)?;
            tracing::info!(job_id = %job_id, robot_id, "Job completed");
        }

        self.events.emit(JobEvent::JobCompleted {
            job_id,
            robot_id: robot_id.to_string(),
            at: now,
        });
        Ok(CompletionOutcome::Completed)
    }

    async fn fail(&self, job_id: Uuid, robot_id: &str, error: String) -> Result<FailureOutcome> {
        let now = self.clock.now();
        let outcome = {
            let mut state = self.state.lock().await;
            let job = state.job_mut(job_id)?;

            if !job.is_owned_by(robot_id) {
                return Err(OrchestratorError::DuplicateJobAssignment {
                    job_id,
                    robot_id: robot_id.to_string(),
                    owner: job.robot_id.clone(),
                });
            }
            job.record_failure(error.clone(), now)?
        };

        self.events.emit(JobEvent::for_failure(job_id, outcome, error, now));
        Ok(outcome)
    }

    async fn reap_expired(&self) -> Result<Vec<ReapedJob>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for job_id in expired {
            let job = state.job_mut(job_id)?;
            let robot_id = job.robot_id.clone();
            let outcome = job.record_failure(LEASE_EXPIRED_REASON.to_string(), now)?;
            reaped.push(ReapedJob {
                job_id,
                robot_id,
                outcome,
            });
        }
        Ok(reaped)
    }

    async fn running_counts(&self) -> Result<HashMap<String, u32>> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for job in state.jobs.values() {
            if let (JobStatus::Running, Some(robot_id)) = (job.status, &job.robot_id) {
                *counts.entry(robot_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::DeadLetter => counts.dead_letter += 1,
                // Never at rest.
                JobStatus::Failed => {}
            }
        }
        Ok(counts)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let count = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.is_terminal() && j.completed_at.is_some_and(|at| at < before)));
        Ok(count - state.jobs.len())
    }
}
