//! Shared gateway state and the shutdown sequence

use crate::config::ConfigStore;
use crate::health::HealthChecker;
use crate::monitor::{ActivityMonitor, MonitorHandle};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::ReadinessGates;
use crate::registry::ServiceRegistry;
use crate::supervisor::SharedSupervisor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Everything a request handler or background loop needs, behind one `Arc`
pub struct Gateway {
    config: Arc<ConfigStore>,
    registry: Arc<ServiceRegistry>,
    supervisor: SharedSupervisor,
    health: Arc<HealthChecker>,
    pool: Arc<ConnectionPool>,
    monitor: Arc<ActivityMonitor>,
    readiness: ReadinessGates,
    started_at: Instant,
}

impl Gateway {
    pub fn new(config: Arc<ConfigStore>, supervisor: SharedSupervisor) -> Arc<Self> {
        let settings = config.settings();
        let health = Arc::new(HealthChecker::new(settings.health_check_timeout()));
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from_settings(&settings)));
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&supervisor),
            Arc::clone(&config),
        ));
        let monitor = Arc::new(ActivityMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&config),
        ));

        Arc::new(Self {
            config,
            registry,
            supervisor,
            health,
            pool,
            monitor,
            readiness: ReadinessGates::default(),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &SharedSupervisor {
        &self.supervisor
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<ActivityMonitor> {
        &self.monitor
    }

    pub(crate) fn readiness(&self) -> &ReadinessGates {
        &self.readiness
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Start the cleanup and health loops
    pub fn start_monitor(&self) -> MonitorHandle {
        self.monitor.start()
    }

    /// Stop the monitor loops, then every running service, then the
    /// supervisor. Failures are logged and never abort the sequence.
    pub async fn shutdown(&self, monitor: MonitorHandle) {
        info!("Shutting down gateway");
        monitor.stop().await;

        let running = self.registry.running().len();
        if running > 0 {
            info!(running, "Stopping running services");
        }
        self.registry.stop_running().await;

        if let Err(e) = self.supervisor.shutdown().await {
            error!(error = %e, "Process supervisor shutdown failed");
        }
        info!("Gateway shutdown complete");
    }
}
