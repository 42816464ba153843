//! Periodic idle eviction and health sweeps

use crate::config::ConfigStore;
use crate::health::{HealthCheckResult, HealthChecker};
use crate::registry::ServiceRegistry;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runs the cleanup and health loops over the registry
pub struct ActivityMonitor {
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthChecker>,
    config: Arc<ConfigStore>,
}

/// Stops the monitor loops
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal both loops and wait for them to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
        debug!("Activity monitor stopped");
    }
}

impl ActivityMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        health: Arc<HealthChecker>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            registry,
            health,
            config,
        }
    }

    /// Stop every service idle past its timeout. Returns how many were stopped.
    pub async fn cleanup_once(&self) -> usize {
        let mut stopped = 0;
        for name in self.registry.inactive_services(None) {
            match self.registry.evict_idle(&name, None).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(service = %name, error = %e, "Failed to stop idle service");
                }
            }
        }
        if stopped > 0 {
            info!(stopped, "Idle cleanup finished");
        }
        stopped
    }

    /// Probe every running service concurrently.
    ///
    /// Failed probes are logged and counted against the service; they never
    /// change its status.
    pub async fn health_once(&self) -> Vec<(String, HealthCheckResult)> {
        let running = self.registry.running();
        if running.is_empty() {
            return Vec::new();
        }

        let probes = running.iter().map(|record| async move {
            (record.name.clone(), self.health.check(record).await)
        });
        let results = join_all(probes).await;

        for (name, result) in &results {
            if !result.is_healthy() {
                warn!(
                    service = %name,
                    status = ?result.status,
                    error = result.error.as_deref().unwrap_or(""),
                    latency_ms = result.latency_ms,
                    "Health check failed"
                );
                self.registry.record_error(name);
            }
        }
        results
    }

    /// Spawn both loops. Intervals are re-read from the active configuration
    /// on every iteration.
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cleanup = {
            let monitor = Arc::clone(self);
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    let interval = monitor.config.settings().cleanup_interval();
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            monitor.cleanup_once().await;
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("Cleanup loop exited");
            })
        };

        let health = {
            let monitor = Arc::clone(self);
            let mut shutdown_rx = shutdown_rx;
            tokio::spawn(async move {
                loop {
                    let interval = monitor.config.settings().health_check_interval();
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            monitor.health_once().await;
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("Health loop exited");
            })
        };

        info!("Activity monitor started");
        MonitorHandle {
            shutdown_tx,
            tasks: vec![cleanup, health],
        }
    }
}
