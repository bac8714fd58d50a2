use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::fleet::selection::is_eligible;
use crate::fleet::{AffinityMode, AssignmentStore, Robot};
use crate::scheduler::job::{FailureOutcome, Job, JobSpec, JobStatus};

/// Failure reason recorded when a lease runs out.
pub const LEASE_EXPIRED_REASON: &str = "lease expired";

/// A robot asking for work.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub robot_id: String,
    pub capabilities: BTreeSet<String>,
    pub environment: String,
    pub tenant_id: Option<String>,
    pub max_concurrent_jobs: u32,
    pub limit: usize,
    pub visibility_timeout: Duration,
    /// Routing rules to honor. `None` lets the robot take any matching job.
    pub routing: Option<ClaimRouting>,
}

impl ClaimRequest {
    /// Capability superset, same environment, same tenant.
    pub fn accepts(&self, job: &Job) -> bool {
        job.environment == self.environment
            && job.tenant_id == self.tenant_id
            && job.required_capabilities.is_subset(&self.capabilities)
    }
}

/// Workflow and node routing as seen by a pulling robot.
///
/// Mirrors the dispatcher: a hard pin reserves the job for its robot, a soft
/// or session pin only while that robot could take the job right now.
#[derive(Debug, Clone)]
pub struct ClaimRouting {
    mode: AffinityMode,
    assignments: AssignmentStore,
    fleet: HashMap<String, Robot>,
}

impl ClaimRouting {
    pub fn new(mode: AffinityMode, assignments: AssignmentStore, fleet: Vec<Robot>) -> Self {
        Self {
            mode,
            assignments,
            fleet: fleet.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    /// Whether `job` belongs to a robot other than `robot_id`. `running_for`
    /// reports a robot's current number of running jobs.
    pub fn reserved_for_other(
        &self,
        job: &Job,
        robot_id: &str,
        running_for: impl Fn(&str) -> u32,
    ) -> bool {
        let Some(target) = self.assignments.affinity_for(job, self.mode) else {
            return false;
        };
        if target.robot_id == robot_id {
            return false;
        }
        if target.mode == AffinityMode::Hard {
            return true;
        }
        self.fleet.get(&target.robot_id).is_some_and(|pinned| {
            let mut pinned = pinned.clone();
            pinned.set_load(running_for(&pinned.id));
            is_eligible(&pinned, job)
        })
    }
}

/// The robot the dispatcher picked for a job.
#[derive(Debug, Clone)]
pub struct Claimant {
    pub robot_id: String,
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Completed,
    AlreadyCompleted,
}

/// A running job whose lease ran out.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedJob {
    pub job_id: Uuid,
    pub robot_id: Option<String>,
    pub outcome: FailureOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub dead_letter: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.dead_letter
    }
}

/// Durable job store.
///
/// Every method is one atomic read-modify-write against the store. In SQL
/// terms `try_claim` is `UPDATE ... WHERE id = $1 AND status = 'PENDING'`
/// and `claim_batch` is `SELECT ... FOR UPDATE SKIP LOCKED`; the dispatcher
/// and the lease monitor rely on nothing else for cross-robot safety.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Creates a `PENDING` job.
    async fn submit(&self, spec: JobSpec) -> Result<Uuid>;

    async fn get(&self, job_id: Uuid) -> Result<Job>;

    /// All jobs in submission order, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;

    /// Up to `limit` claimable jobs in dispatch order.
    async fn pending(&self, limit: usize) -> Result<Vec<Job>>;

    /// Hands the robot up to `request.limit` jobs.
    ///
    /// Jobs the dispatcher already assigned to this robot come first; the
    /// rest are taken from the eligible `PENDING` jobs that `request.routing`
    /// does not reserve for another robot.
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<Job>>;

    /// Single-job convenience over `claim_batch`.
    async fn claim(&self, request: &ClaimRequest) -> Result<Option<Job>> {
        let mut single = request.clone();
        single.limit = 1;
        Ok(self.claim_batch(&single).await?.into_iter().next())
    }

    /// Assigns one specific job to `claimant` if it is still `PENDING`.
    ///
    /// Returns `Ok(None)` when somebody else got there first and
    /// `RobotAtCapacity` when the claimant is already full.
    async fn try_claim(
        &self,
        job_id: Uuid,
        claimant: &Claimant,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>>;

    /// Pushes the lease out. False unless `robot_id` owns a live lease.
    async fn extend_lease(&self, job_id: Uuid, robot_id: &str, extension: Duration)
        -> Result<bool>;

    async fn complete(
        &self,
        job_id: Uuid,
        robot_id: &str,
        result: serde_json::Value,
    ) -> Result<CompletionOutcome>;

    async fn fail(&self, job_id: Uuid, robot_id: &str, error: String) -> Result<FailureOutcome>;

    /// Fails every `RUNNING` job whose lease has expired.
    async fn reap_expired(&self) -> Result<Vec<ReapedJob>>;

    /// Number of `RUNNING` jobs per owner.
    async fn running_counts(&self) -> Result<HashMap<String, u32>>;

    async fn counts(&self) -> Result<QueueCounts>;

    /// Drops terminal jobs finished before `before`. Returns how many.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{RobotAssignment, RobotRegistration};

    fn request() -> ClaimRequest {
        ClaimRequest {
            robot_id: "robot-1".to_string(),
            capabilities: ["browser".to_string(), "desktop".to_string()]
                .into_iter()
                .collect(),
            environment: "prod".to_string(),
            tenant_id: None,
            max_concurrent_jobs: 1,
            limit: 1,
            visibility_timeout: Duration::seconds(30),
            routing: None,
        }
    }

    #[test]
    fn claim_request_matching() {
        let req = request();
        let now = Utc::now();

        let ok = Job::from_spec(
            JobSpec::new("wf", "n")
                .with_environment("prod")
                .with_capability("browser"),
            now,
            1,
        );
        assert!(req.accepts(&ok));

        let wrong_env = Job::from_spec(JobSpec::new("wf", "n"), now, 2);
        assert!(!req.accepts(&wrong_env));

        let missing_cap = Job::from_spec(
            JobSpec::new("wf", "n")
                .with_environment("prod")
                .with_capability("sap"),
            now,
            3,
        );
        assert!(!req.accepts(&missing_cap));

        let other_tenant = Job::from_spec(
            JobSpec::new("wf", "n")
                .with_environment("prod")
                .with_tenant("acme"),
            now,
            4,
        );
        assert!(!req.accepts(&other_tenant));
    }

    fn pinned_to(robot_id: &str) -> AssignmentStore {
        let mut store = AssignmentStore::new();
        store
            .set_default(RobotAssignment::new("wf", robot_id, true, 0, Utc::now()).unwrap())
            .unwrap();
        store
    }

    fn fleet(ids: &[&str]) -> Vec<Robot> {
        ids.iter()
            .map(|id| Robot::from_registration(RobotRegistration::new(*id, 1), Utc::now()))
            .collect()
    }

    #[test]
    fn hard_pin_reserves_job_even_when_pinned_robot_is_full() {
        let job = Job::from_spec(JobSpec::new("wf", "n"), Utc::now(), 1);
        let routing = ClaimRouting::new(
            AffinityMode::Hard,
            pinned_to("robot-7"),
            fleet(&["robot-3", "robot-7"]),
        );

        assert!(routing.reserved_for_other(&job, "robot-3", |_| 0));
        assert!(routing.reserved_for_other(&job, "robot-3", |_| 1));
        assert!(!routing.reserved_for_other(&job, "robot-7", |_| 0));
    }

    #[test]
    fn soft_pin_releases_job_while_pinned_robot_cannot_take_it() {
        let job = Job::from_spec(JobSpec::new("wf", "n"), Utc::now(), 1);
        let routing = ClaimRouting::new(
            AffinityMode::Soft,
            pinned_to("robot-7"),
            fleet(&["robot-3", "robot-7"]),
        );
        assert!(routing.reserved_for_other(&job, "robot-3", |_| 0));
        let pinned_full = |id: &str| u32::from(id == "robot-7");
        assert!(!routing.reserved_for_other(&job, "robot-3", pinned_full));

        // Pinned to a robot that never registered.
        let routing =
            ClaimRouting::new(AffinityMode::Soft, pinned_to("robot-9"), fleet(&["robot-3"]));
        assert!(!routing.reserved_for_other(&job, "robot-3", |_| 0));

        let unpinned = Job::from_spec(JobSpec::new("wf-other", "n"), Utc::now(), 2);
        assert!(!routing.reserved_for_other(&unpinned, "robot-3", |_| 0));
    }

    #[test]
    fn session_mode_holds_retry_for_previous_robot() {
        let mut job = Job::from_spec(JobSpec::new("wf-other", "n"), Utc::now(), 1);
        job.last_robot_id = Some("robot-2".to_string());
        let robots = fleet(&["robot-1", "robot-2"]);

        let session =
            ClaimRouting::new(AffinityMode::Session, AssignmentStore::new(), robots.clone());
        assert!(session.reserved_for_other(&job, "robot-1", |_| 0));
        assert!(!session.reserved_for_other(&job, "robot-2", |_| 0));

        let soft = ClaimRouting::new(AffinityMode::Soft, AssignmentStore::new(), robots);
        assert!(!soft.reserved_for_other(&job, "robot-1", |_| 0));
    }
}
