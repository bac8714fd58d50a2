use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::scheduler::job::FailureOutcome;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Domain events raised by the queue and the background loops.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    JobSubmitted {
        job_id: Uuid,
        workflow_id: String,
        at: DateTime<Utc>,
    },
    JobAssigned {
        job_id: Uuid,
        robot_id: String,
        at: DateTime<Utc>,
    },
    JobCompleted {
        job_id: Uuid,
        robot_id: String,
        at: DateTime<Utc>,
    },
    JobRequeued {
        job_id: Uuid,
        retry_count: u32,
        reason: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "JobMovedToDLQ")]
    JobMovedToDlq {
        job_id: Uuid,
        retry_count: u32,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// `JobRequeued` or `JobMovedToDLQ`, whichever `outcome` says.
    pub fn for_failure(
        job_id: Uuid,
        outcome: FailureOutcome,
        reason: String,
        at: DateTime<Utc>,
    ) -> Self {
        match outcome {
            FailureOutcome::Requeued { retry_count } => JobEvent::JobRequeued {
                job_id,
                retry_count,
                reason,
                at,
            },
            FailureOutcome::DeadLettered { retry_count } => JobEvent::JobMovedToDlq {
                job_id,
                retry_count,
                reason,
                at,
            },
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::JobSubmitted { job_id, .. }
            | JobEvent::JobAssigned { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobRequeued { job_id, .. }
            | JobEvent::JobMovedToDlq { job_id, .. } => *job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::JobSubmitted { .. } => "JobSubmitted",
            JobEvent::JobAssigned { .. } => "JobAssigned",
            JobEvent::JobCompleted { .. } => "JobCompleted",
            JobEvent::JobRequeued { .. } => "JobRequeued",
            JobEvent::JobMovedToDlq { .. } => "JobMovedToDLQ",
        }
    }
}

/// Fan-out of `JobEvent`s. Emitting never blocks and never fails when
/// nobody is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: JobEvent) {
        match &event {
            JobEvent::JobMovedToDlq {
                job_id,
                retry_count,
                reason,
                ..
            } => {
                tracing::warn!(job_id = %job_id, retry_count, reason = %reason, "Job moved to dead-letter queue");
            }
            JobEvent::JobRequeued {
                job_id,
                retry_count,
                reason,
                ..
            } => {
                tracing::info!(job_id = %job_id, retry_count, reason = %reason, "Job requeued");
            }
            other => {
                tracing::debug!(job_id = %other.job_id(), event = other.name(), "Job event");
            }
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
