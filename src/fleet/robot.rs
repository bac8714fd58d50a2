use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::DEFAULT_ENVIRONMENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RobotStatus {
    Online,
    Busy,
    Offline,
    Disconnected,
}

impl RobotStatus {
    pub fn can_transition_to(self, next: RobotStatus) -> bool {
        use RobotStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Online, Busy) | (Busy, Online) => true,
            (Online | Busy, Offline | Disconnected) => true,
            (Offline | Disconnected, Online) => true,
            (Offline, Disconnected) | (Disconnected, Offline) => true,
            // A robot coming back must report Online before it can be busy.
            (Offline | Disconnected, Busy) => false,
            _ => false,
        }
    }
}

impl std::fmt::Display for RobotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RobotStatus::Online => write!(f, "online"),
            RobotStatus::Busy => write!(f, "busy"),
            RobotStatus::Offline => write!(f, "offline"),
            RobotStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// What a robot tells the orchestrator about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotRegistration {
    pub robot_id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

impl RobotRegistration {
    pub fn new(robot_id: impl Into<String>, max_concurrent_jobs: u32) -> Self {
        let robot_id = robot_id.into();
        Self {
            name: robot_id.clone(),
            robot_id,
            capabilities: BTreeSet::new(),
            environment: default_environment(),
            max_concurrent_jobs,
            tenant_id: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
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

    pub fn validate(&self) -> Result<()> {
        if self.robot_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "robot_id cannot be empty".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(OrchestratorError::Validation(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "environment cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub id: String,
    pub name: String,
    pub status: RobotStatus,
    pub capabilities: BTreeSet<String>,
    pub environment: String,
    pub max_concurrent_jobs: u32,
    pub current_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}

impl Robot {
    pub fn from_registration(registration: RobotRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id: registration.robot_id,
            name: registration.name,
            status: RobotStatus::Online,
            capabilities: registration.capabilities,
            environment: registration.environment,
            max_concurrent_jobs: registration.max_concurrent_jobs,
            current_load: 0,
            last_heartbeat: now,
            registered_at: now,
            tenant_id: registration.tenant_id,
        }
    }

    pub fn is_alive(&self, now: DateTime<Utc>, liveness_timeout: Duration) -> bool {
        now - self.last_heartbeat < liveness_timeout
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_jobs
    }

    pub fn available_slots(&self) -> u32 {
        self.max_concurrent_jobs.saturating_sub(self.current_load)
    }

    pub fn transition_to(&mut self, next: RobotStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidRobotState {
                robot_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Sets the load and flips between Online and Busy to match.
    pub fn set_load(&mut self, load: u32) {
        self.current_load = load.min(self.max_concurrent_jobs);
        if load > self.max_concurrent_jobs {
            tracing::warn!(
                robot_id = %self.id,
                load,
                max = self.max_concurrent_jobs,
                "Robot reports more jobs than its capacity"
            );
        }
        self.status = match self.status {
            RobotStatus::Online | RobotStatus::Busy if self.has_capacity() => RobotStatus::Online,
            RobotStatus::Online | RobotStatus::Busy => RobotStatus::Busy,
            other => other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn robot(max: u32) -> Robot {
        Robot::from_registration(RobotRegistration::new("robot-1", max), Utc::now())
    }

    #[test]
    fn registration_starts_online_and_idle() {
        let robot = robot(2);
        assert_eq!(robot.status, RobotStatus::Online);
        assert_eq!(robot.current_load, 0);
        assert!(robot.has_capacity());
        assert_eq!(robot.available_slots(), 2);
    }

    #[test]
    fn load_flips_busy_and_back() {
        let mut robot = robot(2);
        robot.set_load(2);
        assert_eq!(robot.status, RobotStatus::Busy);
        assert!(!robot.has_capacity());

        robot.set_load(1);
        assert_eq!(robot.status, RobotStatus::Online);
    }

    #[test]
    fn load_never_exceeds_capacity() {
        let mut robot = robot(1);
        robot.set_load(3);
        assert_eq!(robot.current_load, 1);
    }

    #[test]
    fn load_does_not_revive_disconnected_robot() {
        let mut robot = robot(2);
        robot.transition_to(RobotStatus::Disconnected).unwrap();
        robot.set_load(0);
        assert_eq!(robot.status, RobotStatus::Disconnected);
    }

    #[test]
    fn disconnected_robot_cannot_go_straight_to_busy() {
        let mut robot = robot(1);
        robot.transition_to(RobotStatus::Disconnected).unwrap();
        let err = robot.transition_to(RobotStatus::Busy).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRobotState { .. }));
        assert_eq!(robot.status, RobotStatus::Disconnected);
    }

    #[test]
    fn liveness_window() {
        let robot = robot(1);
        let timeout = Duration::seconds(90);
        assert!(robot.is_alive(robot.last_heartbeat + Duration::seconds(89), timeout));
        assert!(!robot.is_alive(robot.last_heartbeat + Duration::seconds(90), timeout));
    }

    #[test]
    fn registration_validation() {
        assert!(RobotRegistration::new("robot-1", 1).validate().is_ok());
        assert!(RobotRegistration::new("", 1).validate().is_err());
        assert!(RobotRegistration::new("robot-1", 0).validate().is_err());
    }
}
