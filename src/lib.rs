pub mod api;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod fleet;
pub mod orchestrator;
pub mod robot;
pub mod scheduler;
pub mod shutdown;

pub use error::{OrchestratorError, Result};
