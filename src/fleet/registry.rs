use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{OrchestratorError, Result};
use crate::fleet::robot::{Robot, RobotRegistration, RobotStatus};

/// Tracks robot liveness, capacity and capabilities.
///
/// Robots are never removed; a robot that stops heartbeating is marked
/// `Disconnected` and comes back `Online` on its next heartbeat.
#[derive(Debug)]
pub struct RobotRegistry {
    robots: HashMap<String, Robot>,
    liveness_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RobotRegistry {
    pub fn new(liveness_timeout: Duration) -> Self {
        Self::with_clock(liveness_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(liveness_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            robots: HashMap::new(),
            liveness_timeout,
            clock,
        }
    }

    /// Registers a new robot or refreshes an existing one in place.
    pub fn register(&mut self, registration: RobotRegistration) -> Result<Robot> {
        registration.validate()?;
        let now = self.clock.now();

        match self.robots.get_mut(&registration.robot_id) {
            Some(robot) => {
                if registration.max_concurrent_jobs < robot.current_load {
                    return Err(OrchestratorError::Validation(format!(
                        "robot {} holds {} jobs, cannot lower capacity to {}",
                        robot.id, robot.current_load, registration.max_concurrent_jobs
                    )));
                }
                robot.name = registration.name;
                robot.capabilities = registration.capabilities;
                robot.environment = registration.environment;
                robot.tenant_id = registration.tenant_id;
                robot.max_concurrent_jobs = registration.max_concurrent_jobs;
                robot.last_heartbeat = now;
                if matches!(
                    robot.status,
                    RobotStatus::Offline | RobotStatus::Disconnected
                ) {
                    robot.transition_to(RobotStatus::Online)?;
                }
                let load = robot.current_load;
                robot.set_load(load);
                tracing::info!(robot_id = %robot.id, "Robot re-registered");
                Ok(robot.clone())
            }
            None => {
                let robot = Robot::from_registration(registration, now);
                tracing::info!(
                    robot_id = %robot.id,
                    environment = %robot.environment,
                    max_concurrent_jobs = robot.max_concurrent_jobs,
                    "Robot registered"
                );
                self.robots.insert(robot.id.clone(), robot.clone());
                Ok(robot)
            }
        }
    }

    /// Records a heartbeat. Unknown robots must register first.
    pub fn heartbeat(&mut self, robot_id: &str) -> Result<Robot> {
        let now = self.clock.now();
        let robot = self
            .robots
            .get_mut(robot_id)
            .ok_or_else(|| OrchestratorError::RobotNotFound(robot_id.to_string()))?;

        robot.last_heartbeat = now;
        if matches!(
            robot.status,
            RobotStatus::Offline | RobotStatus::Disconnected
        ) {
            robot.transition_to(RobotStatus::Online)?;
            tracing::info!(robot_id, "Robot back online");
        }
        let load = robot.current_load;
        robot.set_load(load);
        Ok(robot.clone())
    }

    /// Graceful stop reported by the robot itself. The robot gets no new
    /// work until its next heartbeat.
    pub fn mark_offline(&mut self, robot_id: &str) -> Result<Robot> {
        let robot = self
            .robots
            .get_mut(robot_id)
            .ok_or_else(|| OrchestratorError::RobotNotFound(robot_id.to_string()))?;
        robot.transition_to(RobotStatus::Offline)?;
        tracing::info!(robot_id, load = robot.current_load, "Robot went offline");
        Ok(robot.clone())
    }

    /// Marks robots with stale heartbeats as disconnected. Returns their ids.
    pub fn sweep_liveness(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let mut lost = Vec::new();
        for robot in self.robots.values_mut() {
            let active = matches!(robot.status, RobotStatus::Online | RobotStatus::Busy);
            if active && !robot.is_alive(now, self.liveness_timeout) {
                robot.status = RobotStatus::Disconnected;
                tracing::warn!(
                    robot_id = %robot.id,
                    last_heartbeat = %robot.last_heartbeat,
                    "Robot missed heartbeats, marked disconnected"
                );
                lost.push(robot.id.clone());
            }
        }
        lost.sort();
        lost
    }

    /// Overwrites every robot's load with the queue's view.
    pub fn sync_loads(&mut self, running: &HashMap<String, u32>) {
        for robot in self.robots.values_mut() {
            robot.set_load(running.get(&robot.id).copied().unwrap_or(0));
        }
    }

    pub fn get(&self, robot_id: &str) -> Option<&Robot> {
        self.robots.get(robot_id)
    }

    /// All robots sorted by id.
    pub fn snapshot(&self) -> Vec<Robot> {
        let mut robots: Vec<Robot> = self.robots.values().cloned().collect();
        robots.sort_by(|a, b| a.id.cmp(&b.id));
        robots
    }

    /// Free job slots across robots that can take work right now.
    pub fn available_slots(&self) -> u32 {
        let now = self.clock.now();
        self.robots
            .values()
            .filter(|r| r.status == RobotStatus::Online && r.is_alive(now, self.liveness_timeout))
            .map(Robot::available_slots)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.robots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.robots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (RobotRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = RobotRegistry::with_clock(Duration::seconds(90), clock.clone());
        (registry, clock)
    }

    #[test]
    fn register_then_heartbeat() {
        let (mut registry, clock) = registry();
        registry
            .register(RobotRegistration::new("robot-1", 2).with_capability("browser"))
            .unwrap();
        assert_eq!(registry.len(), 1);

        clock.advance(Duration::seconds(30));
        let robot = registry.heartbeat("robot-1").unwrap();
        assert_eq!(robot.last_heartbeat, clock.now());
        assert!(robot.capabilities.contains("browser"));
    }

    #[test]
    fn heartbeat_from_unknown_robot_is_rejected() {
        let (mut registry, _) = registry();
        let err = registry.heartbeat("ghost").unwrap_err();
        assert!(matches!(err, OrchestratorError::RobotNotFound(id) if id == "ghost"));
    }

    #[test]
    fn stale_robots_are_disconnected_not_removed() {
        let (mut registry, clock) = registry();
        registry
            .register(RobotRegistration::new("robot-1", 1))
            .unwrap();
        registry
            .register(RobotRegistration::new("robot-2", 1))
            .unwrap();

        clock.advance(Duration::seconds(60));
        registry.heartbeat("robot-2").unwrap();
        clock.advance(Duration::seconds(60));

        assert_eq!(registry.sweep_liveness(), vec!["robot-1".to_string()]);
        assert_eq!(
            registry.get("robot-1").unwrap().status,
            RobotStatus::Disconnected
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.available_slots(), 1);

        let robot = registry.heartbeat("robot-1").unwrap();
        assert_eq!(robot.status, RobotStatus::Online);
    }

    #[test]
    fn sync_loads_sets_busy() {
        let (mut registry, _) = registry();
        registry
            .register(RobotRegistration::new("robot-1", 1))
            .unwrap();
        registry
            .register(RobotRegistration::new("robot-2", 3))
            .unwrap();

        let running: HashMap<String, u32> = [("robot-1".to_string(), 1)].into_iter().collect();
        registry.sync_loads(&running);

        assert_eq!(registry.get("robot-1").unwrap().status, RobotStatus::Busy);
        assert_eq!(registry.get("robot-2").unwrap().current_load, 0);
        assert_eq!(registry.available_slots(), 3);
    }

    #[test]
    fn re_registration_cannot_drop_capacity_below_load() {
        let (mut registry, _) = registry();
        registry
            .register(RobotRegistration::new("robot-1", 3))
            .unwrap();
        let running: HashMap<String, u32> = [("robot-1".to_string(), 2)].into_iter().collect();
        registry.sync_loads(&running);

        assert!(registry
            .register(RobotRegistration::new("robot-1", 1))
            .is_err());
        assert_eq!(registry.get("robot-1").unwrap().max_concurrent_jobs, 3);
    }

    #[test]
    fn offline_robot_comes_back_on_heartbeat() {
        let (mut registry, _) = registry();
        registry
            .register(RobotRegistration::new("robot-1", 1))
            .unwrap();
        registry.mark_offline("robot-1").unwrap();
        assert_eq!(registry.available_slots(), 0);
        assert_eq!(
            registry.heartbeat("robot-1").unwrap().status,
            RobotStatus::Online
        );
    }
}
