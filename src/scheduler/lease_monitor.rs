use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::scheduler::events::{EventBus, JobEvent};
use crate::scheduler::job::FailureOutcome;
use crate::scheduler::queue::{JobQueue, ReapedJob, LEASE_EXPIRED_REASON};

/// Recovers jobs from robots that stopped renewing their leases.
///
/// This is the only crash-recovery path: a robot that dies mid-job is
/// noticed here, never by the registry.
pub struct LeaseTimeoutMonitor {
    queue: Arc<dyn JobQueue>,
    events: EventBus,
    interval: Duration,
    clock: Arc<dyn Clock>,
    /// Finished jobs older than this are dropped on each tick.
    retention: Option<chrono::Duration>,
}

impl LeaseTimeoutMonitor {
    pub fn new(queue: Arc<dyn JobQueue>, events: EventBus, interval: Duration) -> Self {
        Self {
            queue,
            events,
            interval,
            clock: Arc::new(SystemClock),
            retention: None,
        }
    }

    /// Should be the queue's clock so event times line up with job times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Fails every expired lease once. Returns what was reaped.
    pub async fn tick(&self) -> Result<Vec<ReapedJob>> {
        let reaped = self.queue.reap_expired().await?;
        let now = self.clock.now();

        for job in &reaped {
            match job.outcome {
                FailureOutcome::Requeued { retry_count } => tracing::warn!(
                    job_id = %job.job_id,
                    robot_id = ?job.robot_id,
                    retry_count,
                    "Lease expired, job requeued"
                ),
                FailureOutcome::DeadLettered { retry_count } => tracing::error!(
                    job_id = %job.job_id,
                    robot_id = ?job.robot_id,
                    retry_count,
                    "Lease expired, retries exhausted"
                ),
            }
            self.events.emit(JobEvent::for_failure(
                job.job_id,
                job.outcome,
                LEASE_EXPIRED_REASON.to_string(),
                now,
            ));
        }

        if let Some(retention) = self.retention {
            let purged = self.queue.purge_finished(now - retention).await?;
            if purged > 0 {
                tracing::debug!(purged, "Purged finished jobs");
            }
        }
        Ok(reaped)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Lease monitor started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Lease check failed");
                    }
                }
            }
        }

        tracing::info!("Lease monitor stopped");
    }
}
