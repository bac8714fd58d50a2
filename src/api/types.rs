//! Request and response bodies shared by the server and the robot client.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fleet::Robot;
use crate::scheduler::{CompletionOutcome, FailureOutcome, Job, QueueCounts};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimJobsRequest {
    /// Defaults to the environment the robot registered with.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub visibility_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimJobsResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendLeaseRequest {
    pub extension_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendLeaseResponse {
    pub extended: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteJobRequest {
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteJobResponse {
    pub status: CompletionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailJobRequest {
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStatus {
    Requeued,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailJobResponse {
    pub status: FailStatus,
    pub retry_count: u32,
}

impl From<FailureOutcome> for FailJobResponse {
    fn from(outcome: FailureOutcome) -> Self {
        let status = match outcome {
            FailureOutcome::Requeued { .. } => FailStatus::Requeued,
            FailureOutcome::DeadLettered { .. } => FailStatus::DeadLetter,
        };
        Self {
            status,
            retry_count: outcome.retry_count(),
        }
    }
}

/// Registration body. The robot id comes from the API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRobotRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetCounts {
    pub total: usize,
    pub online: usize,
    pub busy: usize,
    pub offline: usize,
    pub disconnected: usize,
    pub available_slots: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub jobs: QueueCounts,
    pub robots: FleetCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub robot_id: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOverrideRequest {
    pub robot_id: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueKeyRequest {
    pub robot_id: String,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    /// Registers this exact key instead of generating one.
    #[serde(default)]
    pub raw_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Tallies robots by status.
pub fn fleet_counts(robots: &[Robot], available_slots: u32) -> FleetCounts {
    use crate::fleet::RobotStatus;

    let mut counts = FleetCounts {
        total: robots.len(),
        available_slots,
        ..Default::default()
    };
    for robot in robots {
        match robot.status {
            RobotStatus::Online => counts.online += 1,
            RobotStatus::Busy => counts.busy += 1,
            RobotStatus::Offline => counts.offline += 1,
            RobotStatus::Disconnected => counts.disconnected += 1,
        }
    }
    counts
}
