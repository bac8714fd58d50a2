use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::auth::{InMemoryApiKeyStore, RobotAuthenticator};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::fleet::{AssignmentStore, RobotRegistry};
use crate::scheduler::{Dispatcher, EventBus, InMemoryJobQueue, JobQueue, LeaseTimeoutMonitor};

/// Owns every orchestrator component and runs them together.
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<RwLock<RobotRegistry>>,
    pub assignments: Arc<RwLock<AssignmentStore>>,
    pub authenticator: RobotAuthenticator,
    pub events: EventBus,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: OrchestratorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let queue = InMemoryJobQueue::with_clock(events.clone(), clock.clone())
            .with_capacity(config.max_jobs);
        let registry = RobotRegistry::with_clock(config.fleet.liveness_timeout(), clock.clone());
        let authenticator =
            RobotAuthenticator::with_clock(Arc::new(InMemoryApiKeyStore::new()), clock.clone());

        Ok(Self {
            config,
            queue: Arc::new(queue),
            registry: Arc::new(RwLock::new(registry)),
            assignments: Arc::new(RwLock::new(AssignmentStore::new())),
            authenticator,
            events,
            clock,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            assignments: self.assignments.clone(),
            authenticator: self.authenticator.clone(),
            events: self.events.clone(),
            lease: self.config.lease.clone(),
            affinity_mode: self.config.dispatch.affinity_mode,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.queue.clone(),
            self.registry.clone(),
            self.assignments.clone(),
            self.events.clone(),
            self.config.dispatch.clone(),
            self.config.lease.visibility_timeout(),
        )
    }

    pub fn lease_monitor(&self) -> LeaseTimeoutMonitor {
        LeaseTimeoutMonitor::new(
            self.queue.clone(),
            self.events.clone(),
            self.config.lease.timeout_check_interval(),
        )
        .with_clock(self.clock.clone())
        .with_retention(self.config.lease.finished_retention())
    }

    /// Binds `config.listen_addr` and runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| {
                OrchestratorError::Internal(format!(
                    "failed to bind {}: {e}",
                    self.config.listen_addr
                ))
            })?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Starts the dispatcher and the lease monitor, then serves the API on
    /// `listener`. Returns once all three have stopped.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            listen_addr = ?listener.local_addr().ok(),
            strategy = ?self.config.dispatch.strategy,
            affinity_mode = ?self.config.dispatch.affinity_mode,
            visibility_timeout_secs = self.config.lease.visibility_timeout_secs,
            "Starting orchestrator"
        );

        let dispatcher = tokio::spawn(self.dispatcher().run(shutdown.clone()));
        let monitor = tokio::spawn(self.lease_monitor().run(shutdown.clone()));

        let served = api::serve(listener, self.app_state(), shutdown.clone()).await;
        // The server may have stopped on its own; take the loops down with it.
        shutdown.cancel();

        for (name, handle) in [("dispatcher", dispatcher), ("lease monitor", monitor)] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
            }
        }

        served.map_err(|e| OrchestratorError::Internal(format!("HTTP server failed: {e}")))?;
        tracing::info!("Orchestrator stopped");
        Ok(())
    }
}
