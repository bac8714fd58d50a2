//! Robot selection.
//!
//! [`RobotSelectionService`] picks one robot for one job out of a snapshot of
//! the fleet. It never touches the queue or the registry; the only state it
//! keeps is the round-robin cursor.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::fleet::robot::{Robot, RobotStatus};
use crate::scheduler::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    Random,
}

/// How hard a routing preference binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AffinityMode {
    /// Prefer the pinned robot, fall back to load balancing.
    #[default]
    Soft,
    /// Only the pinned robot; the job waits while it is unavailable.
    Hard,
    /// Soft, and additionally prefer the robot of the previous attempt.
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityTarget {
    pub robot_id: String,
    pub mode: AffinityMode,
}

impl AffinityTarget {
    pub fn new(robot_id: impl Into<String>, mode: AffinityMode) -> Self {
        Self {
            robot_id: robot_id.into(),
            mode,
        }
    }
}

/// Can `robot` take `job` right now?
pub fn is_eligible(robot: &Robot, job: &Job) -> bool {
    robot.status == RobotStatus::Online
        && robot.has_capacity()
        && robot.environment == job.environment
        && robot.tenant_id == job.tenant_id
        && job.required_capabilities.is_subset(&robot.capabilities)
}

#[derive(Debug)]
pub struct RobotSelectionService {
    strategy: LoadBalancingStrategy,
    /// Id of the robot round-robin picked last.
    cursor: Option<String>,
    rng: StdRng,
}

impl RobotSelectionService {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            cursor: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(strategy: LoadBalancingStrategy, seed: u64) -> Self {
        Self {
            strategy,
            cursor: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Picks a robot id for `job`.
    ///
    /// With an affinity target the pinned robot wins whenever it is eligible.
    /// Otherwise a hard target fails with `RobotUnavailable` and soft/session
    /// targets fall back to the load-balancing strategy.
    pub fn select(
        &mut self,
        robots: &[Robot],
        job: &Job,
        affinity: Option<&AffinityTarget>,
    ) -> Result<String> {
        if let Some(target) = affinity {
            let pinned = robots
                .iter()
                .find(|r| r.id == target.robot_id)
                .filter(|r| is_eligible(r, job));
            match (pinned, target.mode) {
                (Some(robot), _) => return Ok(robot.id.clone()),
                (None, AffinityMode::Hard) => {
                    return Err(OrchestratorError::RobotUnavailable(target.robot_id.clone()))
                }
                (None, AffinityMode::Soft | AffinityMode::Session) => {
                    tracing::debug!(
                        job_id = %job.id,
                        robot_id = %target.robot_id,
                        "Preferred robot unavailable, falling back to load balancing"
                    );
                }
            }
        }

        let mut eligible: Vec<&Robot> = robots.iter().filter(|r| is_eligible(r, job)).collect();
        if eligible.is_empty() {
            return Err(OrchestratorError::NoAvailableRobot);
        }

        let chosen = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                eligible.sort_by(|a, b| a.id.cmp(&b.id));
                let next = self
                    .cursor
                    .as_deref()
                    .and_then(|last| eligible.iter().find(|r| r.id.as_str() > last))
                    .unwrap_or(&eligible[0]);
                self.cursor = Some(next.id.clone());
                next.id.clone()
            }
            LoadBalancingStrategy::LeastLoaded => eligible
                .iter()
                .min_by(|a, b| {
                    a.current_load
                        .cmp(&b.current_load)
                        .then(a.last_heartbeat.cmp(&b.last_heartbeat))
                        .then(a.id.cmp(&b.id))
                })
                .map(|r| r.id.clone())
                .ok_or(OrchestratorError::NoAvailableRobot)?,
            LoadBalancingStrategy::Random => eligible
                .choose(&mut self.rng)
                .map(|r| r.id.clone())
                .ok_or(OrchestratorError::NoAvailableRobot)?,
        };
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::fleet::robot::RobotRegistration;
    use crate::scheduler::JobSpec;

    fn robot(id: &str, max: u32, load: u32) -> Robot {
        let mut robot = Robot::from_registration(RobotRegistration::new(id, max), Utc::now());
        robot.set_load(load);
        robot
    }

    fn job() -> Job {
        Job::from_spec(JobSpec::new("wf-1", "Invoice run"), Utc::now(), 1)
    }

    #[test]
    fn never_picks_a_robot_at_capacity() {
        let robots = vec![robot("robot-1", 1, 1), robot("robot-2", 2, 2)];
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::LeastLoaded,
            LoadBalancingStrategy::Random,
        ] {
            let mut service = RobotSelectionService::with_seed(strategy, 7);
            let err = service.select(&robots, &job(), None).unwrap_err();
            assert!(matches!(err, OrchestratorError::NoAvailableRobot));
        }
    }

    #[test]
    fn filters_on_capability_environment_and_tenant() {
        let job = Job::from_spec(
            JobSpec::new("wf", "n")
                .with_capability("browser")
                .with_environment("prod")
                .with_tenant("acme"),
            Utc::now(),
            1,
        );
        let mut right = robot("robot-1", 1, 0);
        right.capabilities.insert("browser".to_string());
        right.environment = "prod".to_string();
        right.tenant_id = Some("acme".to_string());
        let mut wrong_tenant = right.clone();
        wrong_tenant.id = "robot-2".to_string();
        wrong_tenant.tenant_id = None;
        let mut no_browser = right.clone();
        no_browser.id = "robot-3".to_string();
        no_browser.capabilities.clear();

        assert!(is_eligible(&right, &job));
        assert!(!is_eligible(&wrong_tenant, &job));
        assert!(!is_eligible(&no_browser, &job));
    }

    #[test]
    fn least_loaded_breaks_ties_by_oldest_heartbeat() {
        let now = Utc::now();
        let mut a = robot("robot-a", 4, 1);
        let mut b = robot("robot-b", 4, 1);
        let c = robot("robot-c", 4, 2);
        a.last_heartbeat = now;
        b.last_heartbeat = now - Duration::seconds(10);

        let mut service = RobotSelectionService::new(LoadBalancingStrategy::LeastLoaded);
        assert_eq!(service.select(&[a, b, c], &job(), None).unwrap(), "robot-b");
    }

    #[test]
    fn round_robin_cycles_in_stable_order() {
        let robots = vec![
            robot("robot-3", 10, 0),
            robot("robot-1", 10, 0),
            robot("robot-2", 10, 0),
        ];
        let mut service = RobotSelectionService::new(LoadBalancingStrategy::RoundRobin);
        let picks: Vec<String> = (0..5)
            .map(|_| service.select(&robots, &job(), None).unwrap())
            .collect();
        assert_eq!(
            picks,
            vec!["robot-1", "robot-2", "robot-3", "robot-1", "robot-2"]
        );
    }

    #[test]
    fn round_robin_skips_robots_that_dropped_out() {
        let mut robots = vec![
            robot("robot-1", 10, 0),
            robot("robot-2", 10, 0),
            robot("robot-3", 10, 0),
        ];
        let mut service = RobotSelectionService::new(LoadBalancingStrategy::RoundRobin);
        assert_eq!(service.select(&robots, &job(), None).unwrap(), "robot-1");
        robots[1].status = RobotStatus::Disconnected;
        assert_eq!(service.select(&robots, &job(), None).unwrap(), "robot-3");
        assert_eq!(service.select(&robots, &job(), None).unwrap(), "robot-1");
    }

    #[test]
    fn random_is_spread_over_eligible_robots() {
        let robots = vec![
            robot("robot-1", 100, 0),
            robot("robot-2", 100, 0),
            robot("robot-full", 1, 1),
        ];
        let mut service = RobotSelectionService::with_seed(LoadBalancingStrategy::Random, 42);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..200 {
            *seen
                .entry(service.select(&robots, &job(), None).unwrap())
                .or_default() += 1;
        }
        assert!(!seen.contains_key("robot-full"));
        assert!(seen["robot-1"] > 50);
        assert!(seen["robot-2"] > 50);
    }

    #[test]
    fn affinity_beats_load_balancing() {
        let robots = vec![robot("robot-3", 4, 0), robot("robot-7", 4, 3)];
        let target = AffinityTarget::new("robot-7", AffinityMode::Soft);
        let mut service = RobotSelectionService::new(LoadBalancingStrategy::LeastLoaded);
        assert_eq!(
            service.select(&robots, &job(), Some(&target)).unwrap(),
            "robot-7"
        );
    }

    #[test]
    fn hard_affinity_fails_when_target_ineligible() {
        let robots = vec![robot("robot-3", 4, 0), robot("robot-7", 1, 1)];
        let target = AffinityTarget::new("robot-7", AffinityMode::Hard);
        let mut service = RobotSelectionService::new(LoadBalancingStrategy::LeastLoaded);
        let err = service.select(&robots, &job(), Some(&target)).unwrap_err();
        assert!(matches!(err, OrchestratorError::RobotUnavailable(id) if id == "robot-7"));
    }

    #[test]
    fn soft_and_session_affinity_fall_back() {
        let robots = vec![robot("robot-3", 4, 0), robot("robot-7", 1, 1)];
        let mut service = RobotSelectionService::new(LoadBalancingStrategy::LeastLoaded);
        for mode in [AffinityMode::Soft, AffinityMode::Session] {
            let target = AffinityTarget::new("robot-7", mode);
            assert_eq!(
                service.select(&robots, &job(), Some(&target)).unwrap(),
                "robot-3"
            );
        }
    }
}
