//! Shared fixtures for orchestrator integration tests.
//!
//! Two flavours: an in-process orchestrator driven by a `ManualClock` for
//! lease and liveness scenarios, and a real HTTP server on an ephemeral port
//! for robot-client tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rpa_dispatch::auth::RobotAuthenticator;
use rpa_dispatch::clock::ManualClock;
use rpa_dispatch::config::OrchestratorConfig;
use rpa_dispatch::fleet::{Robot, RobotRegistration, RobotRegistry};
use rpa_dispatch::orchestrator::Orchestrator;
use rpa_dispatch::scheduler::{ClaimRequest, EventBus, JobEvent, JobQueue};

/// Config with short loop intervals so background tasks react quickly.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new("127.0.0.1:0".parse().unwrap());
    config.dispatch.interval_ms = 20;
    config.lease.timeout_check_interval_ms = 50;
    config
}

/// Orchestrator whose queue, registry and authenticator share one manual clock.
pub fn manual_orchestrator(config: OrchestratorConfig) -> (Orchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let orchestrator = Orchestrator::with_clock(config, clock.clone()).unwrap();
    (orchestrator, clock)
}

pub async fn register(orchestrator: &Orchestrator, registration: RobotRegistration) -> Robot {
    orchestrator
        .registry
        .write()
        .await
        .register(registration)
        .unwrap()
}

/// Pull request for a robot in the default environment, limit = capacity.
pub fn claim_request(robot_id: &str, max_concurrent_jobs: u32) -> ClaimRequest {
    ClaimRequest {
        robot_id: robot_id.to_string(),
        capabilities: Default::default(),
        environment: "default".to_string(),
        tenant_id: None,
        max_concurrent_jobs,
        limit: max_concurrent_jobs as usize,
        visibility_timeout: chrono::Duration::seconds(300),
        routing: None,
    }
}

/// Everything already sitting in an event receiver.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A running orchestrator listening on an ephemeral port.
pub struct TestServer {
    pub base_url: String,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<RwLock<RobotRegistry>>,
    pub authenticator: RobotAuthenticator,
    pub events: EventBus,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(config: OrchestratorConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let orchestrator = Orchestrator::new(config).unwrap();

        let queue = orchestrator.queue.clone();
        let registry = orchestrator.registry.clone();
        let authenticator = orchestrator.authenticator.clone();
        let events = orchestrator.events.clone();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            orchestrator.run_with_listener(listener, token).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            queue,
            registry,
            authenticator,
            events,
            shutdown,
            handle,
        }
    }

    /// Issues a fresh API key for `robot_id` and returns the raw key.
    pub async fn issue_key(&self, robot_id: &str) -> String {
        self.authenticator
            .issue_key(robot_id, None)
            .await
            .unwrap()
            .raw_key
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("orchestrator did not stop in time")
            .unwrap();
    }
}
