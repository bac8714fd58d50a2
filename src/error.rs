use thiserror::Error;
use uuid::Uuid;

use crate::fleet::RobotStatus;
use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Robot not found: {0}")]
    RobotNotFound(String),

    #[error("Robot {0} is not eligible for new work")]
    RobotUnavailable(String),

    #[error("Robot {robot_id} is at capacity ({max_concurrent_jobs} concurrent jobs)")]
    RobotAtCapacity {
        robot_id: String,
        max_concurrent_jobs: u32,
    },

    #[error("No robot available")]
    NoAvailableRobot,

    #[error("Robot {robot_id} cannot move from {from} to {to}")]
    InvalidRobotState {
        robot_id: String,
        from: RobotStatus,
        to: RobotStatus,
    },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidJobState {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} is owned by {owner:?}, not {robot_id}")]
    DuplicateJobAssignment {
        job_id: Uuid,
        robot_id: String,
        owner: Option<String>,
    },

    #[error("Invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("Duplicate assignment: {0}")]
    DuplicateAssignment(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job queue is at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Orchestrator returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
