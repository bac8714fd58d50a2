use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::fleet::{AffinityMode, LoadBalancingStrategy};
use crate::scheduler::job::DEFAULT_ENVIRONMENT;

/// Upper bound for any duration setting, about a century. Keeps every
/// deadline computed from a setting inside `chrono`'s range.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn chrono_millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms.min(MAX_DURATION_SECS * 1_000) as i64)
}

fn check_secs(name: &str, secs: u64) -> Result<()> {
    if secs > MAX_DURATION_SECS {
        return Err(OrchestratorError::Validation(format!(
            "{name} ({secs}s) exceeds the maximum of {MAX_DURATION_SECS}s"
        )));
    }
    Ok(())
}

fn check_millis(name: &str, ms: u64) -> Result<()> {
    check_secs(name, ms / 1_000)
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How often the dispatcher looks for pending jobs.
    pub interval_ms: u64,
    /// Pending jobs considered per tick.
    pub batch_size: usize,
    /// Selection retries for one job when the chosen robot fills up first.
    pub max_selection_attempts: u32,
    pub strategy: LoadBalancingStrategy,
    pub affinity_mode: AffinityMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            batch_size: 100,
            max_selection_attempts: 3,
            strategy: LoadBalancingStrategy::LeastLoaded,
            affinity_mode: AffinityMode::Soft,
        }
    }
}

impl DispatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Lease and crash-detection timing.
///
/// `timeout_check_interval_ms` must stay below the visibility timeout or a
/// dead robot's jobs sit unclaimed for more than one lease.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub visibility_timeout_secs: u64,
    pub timeout_check_interval_ms: u64,
    /// Upper bound on a single lease extension.
    pub max_extension_secs: u64,
    /// How long completed and dead-lettered jobs stay queryable.
    pub finished_retention_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            timeout_check_interval_ms: 30_000,
            max_extension_secs: 3_600,
            finished_retention_secs: 86_400,
        }
    }
}

impl LeaseConfig {
    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono_secs(self.visibility_timeout_secs)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    pub fn finished_retention(&self) -> chrono::Duration {
        chrono_secs(self.finished_retention_secs)
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Heartbeat age after which a robot counts as disconnected.
    pub liveness_timeout_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 90_000,
        }
    }
}

impl FleetConfig {
    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono_millis(self.liveness_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub listen_addr: SocketAddr,
    pub dispatch: DispatchConfig,
    pub lease: LeaseConfig,
    pub fleet: FleetConfig,
    pub max_jobs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            dispatch: DispatchConfig::default(),
            lease: LeaseConfig::default(),
            fleet: FleetConfig::default(),
            max_jobs: 10_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.dispatch.strategy = strategy;
        self
    }

    pub fn with_affinity_mode(mut self, mode: AffinityMode) -> Self {
        self.dispatch.affinity_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_millis("dispatch interval", self.dispatch.interval_ms)?;
        check_secs("visibility timeout", self.lease.visibility_timeout_secs)?;
        check_secs("max lease extension", self.lease.max_extension_secs)?;
        check_secs("finished job retention", self.lease.finished_retention_secs)?;
        check_millis("liveness timeout", self.fleet.liveness_timeout_ms)?;
        if self.dispatch.interval_ms == 0 {
            return Err(OrchestratorError::Validation(
                "dispatch interval must be positive".to_string(),
            ));
        }
        if self.dispatch.batch_size == 0 {
            return Err(OrchestratorError::Validation(
                "dispatch batch size must be positive".to_string(),
            ));
        }
        if self.dispatch.max_selection_attempts == 0 {
            return Err(OrchestratorError::Validation(
                "max selection attempts must be positive".to_string(),
            ));
        }
        if self.lease.visibility_timeout_secs == 0 {
            return Err(OrchestratorError::Validation(
                "visibility timeout must be positive".to_string(),
            ));
        }
        if self.lease.timeout_check_interval_ms == 0
            || self.lease.timeout_check_interval_ms
                >= self.lease.visibility_timeout_secs.saturating_mul(1_000)
        {
            return Err(OrchestratorError::Validation(format!(
                "timeout check interval ({}ms) must be positive and shorter than the visibility timeout ({}s)",
                self.lease.timeout_check_interval_ms, self.lease.visibility_timeout_secs
            )));
        }
        if self.lease.max_extension_secs == 0 {
            return Err(OrchestratorError::Validation(
                "max lease extension must be positive".to_string(),
            ));
        }
        if self.fleet.liveness_timeout_ms == 0 {
            return Err(OrchestratorError::Validation(
                "liveness timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Robot-side settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Orchestrator base URL, e.g. `http://127.0.0.1:8080`.
    pub server_url: String,
    pub api_key: String,
    pub robot_id: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub environment: String,
    pub tenant_id: Option<String>,
    pub max_concurrent_jobs: u32,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub visibility_timeout_secs: u64,
}

impl AgentConfig {
    pub fn new(
        server_url: impl Into<String>,
        api_key: impl Into<String>,
        robot_id: impl Into<String>,
    ) -> Self {
        let robot_id = robot_id.into();
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            name: robot_id.clone(),
            robot_id,
            capabilities: BTreeSet::new(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            tenant_id: None,
            max_concurrent_jobs: 1,
            poll_interval_ms: 2_000,
            heartbeat_interval_ms: 15_000,
            visibility_timeout_secs: 300,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Lease renewal period: a third of the lease, so two renewals can be
    /// lost before the claim expires.
    pub fn lease_renewal_interval(&self) -> Duration {
        Duration::from_millis((self.visibility_timeout_secs.saturating_mul(1_000) / 3).max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(OrchestratorError::Validation(format!(
                "server url must start with http:// or https://, got '{}'",
                self.server_url
            )));
        }
        if self.robot_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "robot id cannot be empty".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(OrchestratorError::Validation(
                "max concurrent jobs must be at least 1".to_string(),
            ));
        }
        if self.visibility_timeout_secs == 0 {
            return Err(OrchestratorError::Validation(
                "visibility timeout must be positive".to_string(),
            ));
        }
        check_secs("visibility timeout", self.visibility_timeout_secs)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_config_default() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(cfg.dispatch.interval_ms, 1_000);
        assert_eq!(cfg.dispatch.batch_size, 100);
        assert_eq!(cfg.dispatch.strategy, LoadBalancingStrategy::LeastLoaded);
        assert_eq!(cfg.dispatch.affinity_mode, AffinityMode::Soft);
        assert_eq!(cfg.lease.visibility_timeout_secs, 300);
        assert_eq!(cfg.fleet.liveness_timeout_ms, 90_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn orchestrator_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = OrchestratorConfig::new(addr)
            .with_strategy(LoadBalancingStrategy::RoundRobin)
            .with_affinity_mode(AffinityMode::Hard);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.dispatch.strategy, LoadBalancingStrategy::RoundRobin);
        assert_eq!(cfg.dispatch.affinity_mode, AffinityMode::Hard);
    }

    #[test]
    fn check_interval_must_be_shorter_than_lease() {
        let mut cfg = OrchestratorConfig::default();
        cfg.lease.visibility_timeout_secs = 30;
        cfg.lease.timeout_check_interval_ms = 30_000;
        assert!(matches!(
            cfg.validate(),
            Err(OrchestratorError::Validation(_))
        ));

        cfg.lease.timeout_check_interval_ms = 10_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.dispatch.batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.dispatch.max_selection_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn agent_config_defaults_and_renewal() {
        let cfg = AgentConfig::new("http://127.0.0.1:8080", "key", "robot-1");
        assert_eq!(cfg.name, "robot-1");
        assert_eq!(cfg.environment, "default");
        assert_eq!(cfg.lease_renewal_interval(), Duration::from_secs(100));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn agent_config_rejects_bad_url() {
        let cfg = AgentConfig::new("127.0.0.1:8080", "key", "robot-1");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.lease.visibility_timeout_secs = u64::MAX;
        assert!(matches!(
            cfg.validate(),
            Err(OrchestratorError::Validation(_))
        ));

        let mut cfg = OrchestratorConfig::default();
        cfg.fleet.liveness_timeout_ms = u64::MAX;
        assert!(matches!(
            cfg.validate(),
            Err(OrchestratorError::Validation(_))
        ));

        let mut cfg = OrchestratorConfig::default();
        cfg.lease.finished_retention_secs = MAX_DURATION_SECS + 1;
        assert!(cfg.validate().is_err());
        cfg.lease.finished_retention_secs = MAX_DURATION_SECS;
        assert!(cfg.validate().is_ok());

        // Conversions clamp instead of panicking on unvalidated input.
        let lease = LeaseConfig {
            visibility_timeout_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            lease.visibility_timeout(),
            chrono::Duration::seconds(MAX_DURATION_SECS as i64)
        );
        let fleet = FleetConfig {
            liveness_timeout_ms: u64::MAX,
        };
        assert!(fleet.liveness_timeout() > chrono::Duration::zero());

        let mut agent = AgentConfig::new("http://localhost:8080", "key", "robot-1");
        agent.visibility_timeout_secs = u64::MAX;
        assert!(agent.validate().is_err());
        assert!(agent.lease_renewal_interval() > Duration::ZERO);
    }
}
