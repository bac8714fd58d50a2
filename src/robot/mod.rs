//! Robot side of the protocol.
//!
//! - [`RobotJobConsumer`]: HTTP client for claim, lease, and report calls
//! - [`WorkflowRunner`]: the execution engine a job is handed to
//! - [`RobotAgent`]: the loop tying the two together

pub mod agent;
pub mod consumer;
pub mod executor;

pub use agent::RobotAgent;
pub use consumer::RobotJobConsumer;
pub use executor::{ProcessRunner, WorkflowOutcome, WorkflowRunner};
