//! The robot fleet: who is alive, what they can run, and who gets which job.
//!
//! - [`RobotRegistry`]: registration, heartbeats, liveness sweep, load sync
//! - [`AssignmentStore`]: workflow and node routing rules
//! - [`RobotSelectionService`]: picks one eligible robot per job

pub mod assignment;
pub mod registry;
pub mod robot;
pub mod selection;

pub use assignment::{AssignmentStore, NodeRobotOverride, RobotAssignment, RoutingSource};
pub use registry::RobotRegistry;
pub use robot::{Robot, RobotRegistration, RobotStatus};
pub use selection::{
    AffinityMode, AffinityTarget, LoadBalancingStrategy, RobotSelectionService,
};
