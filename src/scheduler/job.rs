use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const MAX_RETRIES_CAP: u32 = 100;
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Job lifecycle.
///
/// `Queued` from older clients is accepted on the wire and collapsed into
/// `Pending`: both mean "claimable". `Failed` is transient; `fail()` always
/// moves the job on to `Pending` or `DeadLetter` in the same operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[serde(alias = "QUEUED")]
    Pending,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }

    pub fn is_claimable(self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed) => true,
            (Running, Failed) => true,
            (Failed, Pending) => true,
            (Failed, DeadLetter) => true,
            (Pending, _) | (Running, _) | (Failed, _) => false,
            (Completed, _) | (DeadLetter, _) => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "queued" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead_letter" | "dlq" => Ok(JobStatus::DeadLetter),
            other => Err(OrchestratorError::Validation(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// What a caller hands to `JobQueue::submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

impl JobSpec {
    pub fn new(workflow_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            node_id: None,
            priority: 0,
            environment: default_environment(),
            tenant_id: None,
            required_capabilities: BTreeSet::new(),
            variables: serde_json::Value::Null,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "workflow_id cannot be empty".to_string(),
            ));
        }
        if self.workflow_name.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "workflow_name cannot be empty".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "environment cannot be empty".to_string(),
            ));
        }
        if !(self.variables.is_object() || self.variables.is_null()) {
            return Err(OrchestratorError::Validation(
                "variables must be a JSON object".to_string(),
            ));
        }
        if let Some(max) = self.max_retries {
            if max == 0 || max > MAX_RETRIES_CAP {
                return Err(OrchestratorError::Validation(format!(
                    "max_retries must be between 1 and {}",
                    MAX_RETRIES_CAP
                )));
            }
        }
        if self
            .required_capabilities
            .iter()
            .any(|c| c.trim().is_empty())
        {
            return Err(OrchestratorError::Validation(
                "capabilities cannot be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a failure was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOutcome {
    Requeued { retry_count: u32 },
    DeadLettered { retry_count: u32 },
}

impl FailureOutcome {
    pub fn retry_count(self) -> u32 {
        match self {
            FailureOutcome::Requeued { retry_count } => retry_count,
            FailureOutcome::DeadLettered { retry_count } => retry_count,
        }
    }

    pub fn status(self) -> JobStatus {
        match self {
            FailureOutcome::Requeued { .. } => JobStatus::Pending,
            FailureOutcome::DeadLettered { .. } => JobStatus::DeadLetter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub node_id: Option<String>,
    pub robot_id: Option<String>,
    pub status: JobStatus,
    pub priority: i32,
    pub environment: String,
    pub tenant_id: Option<String>,
    pub required_capabilities: BTreeSet<String>,
    pub variables: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    /// Robot that held the previous attempt.
    pub last_robot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub sequence: u64,
}

impl Job {
    pub fn from_spec(spec: JobSpec, created_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: spec.workflow_id,
            workflow_name: spec.workflow_name,
            node_id: spec.node_id,
            robot_id: None,
            status: JobStatus::Pending,
            priority: spec.priority,
            environment: spec.environment,
            tenant_id: spec.tenant_id,
            required_capabilities: spec.required_capabilities,
            variables: spec.variables,
            result: None,
            last_error: None,
            last_robot_id: None,
            created_at,
            claimed_at: None,
            delivered_at: None,
            lease_expires_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            sequence,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_owned_by(&self, robot_id: &str) -> bool {
        self.robot_id.as_deref() == Some(robot_id)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| at < now)
    }

    /// Dispatch order: higher priority first, then submission order.
    pub fn dispatch_order(&self, other: &Job) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.sequence.cmp(&other.sequence))
    }

    /// Guarded status change. Leaves the job untouched on an illegal move.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidJobState {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn claim(
        &mut self,
        robot_id: &str,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
        delivered: bool,
    ) -> Result<()> {
        if self.status == JobStatus::Pending && self.lease_expires_at.is_some_and(|at| at >= now) {
            return Err(OrchestratorError::InvalidJobState {
                job_id: self.id,
                from: self.status,
                to: JobStatus::Running,
            });
        }
        self.transition_to(JobStatus::Running)?;
        self.robot_id = Some(robot_id.to_string());
        self.claimed_at = Some(now);
        self.delivered_at = delivered.then_some(now);
        self.lease_expires_at = Some(now + visibility_timeout);
        Ok(())
    }

    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(JobStatus::Completed)?;
        self.result = Some(result);
        self.lease_expires_at = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Records a failed attempt and resolves it to a requeue or dead-letter.
    pub fn record_failure(&mut self, error: String, now: DateTime<Utc>) -> Result<FailureOutcome> {
        self.transition_to(JobStatus::Failed)?;
        self.retry_count += 1;
        self.last_error = Some(error);
        self.last_robot_id = self.robot_id.take();
        self.claimed_at = None;
        self.delivered_at = None;
        self.lease_expires_at = None;

        if self.retry_count >= self.max_retries {
            self.transition_to(JobStatus::DeadLetter)?;
            self.completed_at = Some(now);
            Ok(FailureOutcome::DeadLettered {
                retry_count: self.retry_count,
            })
        } else {
            self.transition_to(JobStatus::Pending)?;
            Ok(FailureOutcome::Requeued {
                retry_count: self.retry_count,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::from_spec(JobSpec::new("wf-1", "Invoice run"), Utc::now(), 1)
    }

    #[test]
    fn new_job_is_pending_with_default_retries() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.retry_count, 0);
        assert!(job.robot_id.is_none());
        assert!(!job.is_terminal());
    }

    #[test]
    fn only_completed_and_dead_letter_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        use JobStatus::*;
        for from in [Completed, DeadLetter] {
            for to in [Pending, Running, Completed, Failed, DeadLetter] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn invalid_transition_does_not_mutate() {
        let mut job = job();
        let before = job.clone();
        let err = job.transition_to(JobStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidJobState {
                from: JobStatus::Pending,
                to: JobStatus::Completed,
                ..
            }
        ));
        assert_eq!(job, before);
    }

    #[test]
    fn claim_stamps_owner_and_lease() {
        let mut job = job();
        let now = Utc::now();
        job.claim("robot-1", now, Duration::seconds(60), true).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.robot_id.as_deref(), Some("robot-1"));
        assert_eq!(job.claimed_at, Some(now));
        assert_eq!(job.delivered_at, Some(now));
        assert_eq!(job.lease_expires_at, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn claim_twice_is_rejected() {
        let mut job = job();
        let now = Utc::now();
        job.claim("robot-1", now, Duration::seconds(60), true).unwrap();
        let err = job
            .claim("robot-2", now, Duration::seconds(60), true)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidJobState { .. }));
        assert_eq!(job.robot_id.as_deref(), Some("robot-1"));
    }

    #[test]
    fn failure_requeues_until_max_retries() {
        let mut job = Job::from_spec(
            JobSpec::new("wf-1", "Invoice run").with_max_retries(2),
            Utc::now(),
            1,
        );
        let now = Utc::now();

        job.claim("robot-1", now, Duration::seconds(60), true).unwrap();
        let outcome = job.record_failure("boom".to_string(), now).unwrap();
        assert_eq!(outcome, FailureOutcome::Requeued { retry_count: 1 });
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.robot_id.is_none());
        assert!(job.lease_expires_at.is_none());
        assert_eq!(job.last_robot_id.as_deref(), Some("robot-1"));

        job.claim("robot-2", now, Duration::seconds(60), true).unwrap();
        let outcome = job.record_failure("boom again".to_string(), now).unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { retry_count: 2 });
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert!(job.is_terminal());
        assert_eq!(job.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn failing_a_pending_job_is_rejected() {
        let mut job = job();
        let err = job.record_failure("boom".to_string(), Utc::now()).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidJobState { .. }));
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn queued_deserializes_as_pending() {
        let status: JobStatus = serde_json::from_str("\"QUEUED\"").unwrap();
        assert_eq!(status, JobStatus::Pending);
        assert_eq!("queued".parse::<JobStatus>().unwrap(), JobStatus::Pending);
        assert_eq!(
            serde_json::to_string(&JobStatus::DeadLetter).unwrap(),
            "\"DEAD_LETTER\""
        );
    }

    #[test]
    fn spec_validation() {
        assert!(JobSpec::new("wf", "name").validate().is_ok());
        assert!(JobSpec::new(" ", "name").validate().is_err());
        assert!(JobSpec::new("wf", "").validate().is_err());
        assert!(JobSpec::new("wf", "name")
            .with_environment("")
            .validate()
            .is_err());
        assert!(JobSpec::new("wf", "name")
            .with_variables(serde_json::json!([1, 2]))
            .validate()
            .is_err());
        assert!(JobSpec::new("wf", "name")
            .with_max_retries(0)
            .validate()
            .is_err());
        assert!(JobSpec::new("wf", "name")
            .with_variables(serde_json::json!({"invoice": 42}))
            .validate()
            .is_ok());
    }

    #[test]
    fn dispatch_order_prefers_priority_then_fifo() {
        let now = Utc::now();
        let low_first = Job::from_spec(JobSpec::new("wf", "a"), now, 1);
        let high = Job::from_spec(JobSpec::new("wf", "b").with_priority(5), now, 2);
        let low_second = Job::from_spec(JobSpec::new("wf", "c"), now, 3);

        let mut jobs = vec![low_second.clone(), high.clone(), low_first.clone()];
        jobs.sort_by(|a, b| a.dispatch_order(b));
        let order: Vec<u64> = jobs.iter().map(|j| j.sequence).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }
}
