pub mod dispatcher;
pub mod events;
pub mod job;
pub mod lease_monitor;
pub mod memory;
pub mod queue;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use events::{EventBus, JobEvent};
pub use job::{FailureOutcome, Job, JobSpec, JobStatus};
pub use lease_monitor::LeaseTimeoutMonitor;
pub use memory::InMemoryJobQueue;
pub use queue::{
    ClaimRequest, ClaimRouting, Claimant, CompletionOutcome, JobQueue, QueueCounts, ReapedJob,
};
