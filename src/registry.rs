//! Service lifecycle registry.
//!
//! One record per referenced service name, moving through
//! `stopped → starting → running → stopping → stopped`, with `error`
//! reachable from `starting` and `stopping` when the supervisor fails.
//! Start and stop transitions for a name are serialized by a per-name async
//! mutex that is held across the supervisor call, so concurrent requests for
//! a cold service produce exactly one launch. Different names never share a
//! lock.

use crate::config::{ConfigStore, ServiceConfig};
use crate::error::GatewayError;
use crate::supervisor::{SharedSupervisor, StartRequest};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// No process is running
    Stopped,
    /// The supervisor is launching the process
    Starting,
    /// The process was launched and receives traffic
    Running,
    /// The supervisor is stopping the process
    Stopping,
    /// The last start or stop failed; a later start retries
    Error,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of a service's lifecycle record
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub status: ServiceStatus,
    pub port: u16,
    pub pid: Option<u32>,
    pub last_activity: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub error_count: u64,
    pub config: ServiceConfig,
}

impl ServiceRecord {
    /// Summary of a configured service that has never been referenced
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            status: ServiceStatus::Stopped,
            port: config.port,
            pid: None,
            last_activity: None,
            start_time: None,
            request_count: 0,
            error_count: 0,
            config: config.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }
}

/// Aggregate counts across all registered services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub starting: usize,
    pub stopping: usize,
    pub error: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}

struct ServiceState {
    status: ServiceStatus,
    config: ServiceConfig,
    pid: Option<u32>,
    /// Monotonic activity time, used for idle decisions
    last_activity: Option<Instant>,
    last_activity_at: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
}

struct ServiceEntry {
    /// Serializes start/stop transitions for this name
    transition: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<ServiceState>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    /// Bumped when a supervisor start returns, while the transition lock is held
    finished_starts: AtomicU64,
}

impl ServiceEntry {
    fn new(config: ServiceConfig) -> Self {
        Self {
            transition: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(ServiceState {
                status: ServiceStatus::Stopped,
                config,
                pid: None,
                last_activity: None,
                last_activity_at: None,
                start_time: None,
            }),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            finished_starts: AtomicU64::new(0),
        }
    }

    fn status(&self) -> ServiceStatus {
        self.state.lock().status
    }

    fn snapshot(&self) -> ServiceRecord {
        self.snapshot_locked(&self.state.lock())
    }

    fn snapshot_locked(&self, state: &ServiceState) -> ServiceRecord {
        ServiceRecord {
            name: state.config.name.clone(),
            status: state.status,
            port: state.config.port,
            pid: state.pid,
            last_activity: state.last_activity_at,
            start_time: state.start_time,
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            config: state.config.clone(),
        }
    }

    fn touch(state: &mut ServiceState) {
        state.last_activity = Some(Instant::now());
        state.last_activity_at = Some(Utc::now());
    }

    /// Time since last activity, if the service is running
    fn idle_for(&self) -> Option<(Duration, ServiceConfig)> {
        let state = self.state.lock();
        if state.status != ServiceStatus::Running {
            return None;
        }
        let last = state.last_activity?;
        Some((Instant::now().saturating_duration_since(last), state.config.clone()))
    }
}

/// In-memory table of service lifecycle records
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceEntry>>,
    supervisor: SharedSupervisor,
    config: Arc<ConfigStore>,
}

impl ServiceRegistry {
    pub fn new(supervisor: SharedSupervisor, config: Arc<ConfigStore>) -> Self {
        Self {
            services: DashMap::new(),
            supervisor,
            config,
        }
    }

    /// Create a stopped record for `name`. Returns false if one already existed.
    pub fn register_service(&self, name: &str, mut config: ServiceConfig) -> bool {
        config.name = name.to_string();
        match self.services.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(service = name, "Service already registered");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(service = name, port = config.port, "Service registered");
                slot.insert(Arc::new(ServiceEntry::new(config)));
                true
            }
        }
    }

    /// Register `name` from the active configuration if it isn't already
    pub fn register_configured(&self, name: &str) -> Result<ServiceRecord, GatewayError> {
        if let Some(entry) = self.services.get(name) {
            return Ok(entry.snapshot());
        }
        let config = self
            .config
            .service(name)
            .ok_or_else(|| GatewayError::ServiceNotConfigured(name.to_string()))?;
        self.register_service(name, config);
        self.get(name)
            .ok_or_else(|| GatewayError::ServiceNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.services.get(name).map(|entry| entry.snapshot())
    }

    /// All records, sorted by name
    pub fn list(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> =
            self.services.iter().map(|entry| entry.snapshot()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn running(&self) -> Vec<ServiceRecord> {
        self.list().into_iter().filter(|r| r.is_running()).collect()
    }

    fn entry(&self, name: &str) -> Result<Arc<ServiceEntry>, GatewayError> {
        self.services
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::ServiceNotRegistered(name.to_string()))
    }

    /// Bring a service to `running`.
    ///
    /// Returns the current record without calling the supervisor when the
    /// service is already running or starting. Callers arriving while another
    /// start is in flight wait for it and observe its outcome.
    pub async fn start_service(&self, name: &str) -> Result<ServiceRecord, GatewayError> {
        let entry = self.entry(name)?;
        if entry.status() == ServiceStatus::Running {
            return Ok(entry.snapshot());
        }

        let starts_seen = entry.finished_starts.load(Ordering::Acquire);
        let guard = Arc::clone(&entry.transition).lock_owned().await;

        let request = {
            let mut state = entry.state.lock();
            if matches!(state.status, ServiceStatus::Running | ServiceStatus::Starting) {
                return Ok(entry.snapshot_locked(&state));
            }

            // A start that finished while we queued failed; share its
            // outcome instead of launching again
            if state.status == ServiceStatus::Error
                && entry.finished_starts.load(Ordering::Acquire) != starts_seen
            {
                debug!(service = name, "Concurrent start failed, not retrying");
                return Err(GatewayError::ServiceUnavailable(name.to_string()));
            }

            // Pick up config changes made since the last start
            let config = self
                .config
                .service(name)
                .ok_or_else(|| GatewayError::ServiceNotConfigured(name.to_string()))?;
            if config != state.config {
                debug!(service = name, "Using updated service configuration");
                state.config = config;
            }

            info!(service = name, from = %state.status, "Service starting");
            state.status = ServiceStatus::Starting;
            StartRequest::from_config(&state.config)
        };

        // The transition runs on its own task so a dropped caller can't
        // leave the record stuck in `starting`.
        let supervisor = Arc::clone(&self.supervisor);
        let task_entry = Arc::clone(&entry);
        let service = name.to_string();
        let task = tokio::spawn(async move {
            let _guard: OwnedMutexGuard<()> = guard;
            let result = supervisor.start(&request).await;

            let mut state = task_entry.state.lock();
            task_entry.finished_starts.fetch_add(1, Ordering::AcqRel);
            match result {
                Ok(pid) => {
                    state.status = ServiceStatus::Running;
                    state.pid = Some(pid);
                    state.start_time = Some(Utc::now());
                    ServiceEntry::touch(&mut state);
                    info!(service = %service, pid, port = request.port, "Service running");
                    Ok(task_entry.snapshot_locked(&state))
                }
                Err(e) => {
                    state.status = ServiceStatus::Error;
                    state.pid = None;
                    state.start_time = None;
                    task_entry.error_count.fetch_add(1, Ordering::Relaxed);
                    error!(service = %service, error = %e, "Failed to start service");
                    Err(GatewayError::StartFailure { service, source: e })
                }
            }
        });

        task.await.map_err(|e| {
            error!(service = name, error = %e, "Start task failed");
            GatewayError::ServiceUnavailable(name.to_string())
        })?
    }

    /// Bring a service to `stopped`. No-op when already stopped or stopping.
    pub async fn stop_service(&self, name: &str) -> Result<ServiceRecord, GatewayError> {
        let entry = self.entry(name)?;
        if matches!(entry.status(), ServiceStatus::Stopped) {
            return Ok(entry.snapshot());
        }

        let guard = Arc::clone(&entry.transition).lock_owned().await;
        if matches!(entry.status(), ServiceStatus::Stopped | ServiceStatus::Stopping) {
            return Ok(entry.snapshot());
        }
        self.stop_locked(name, entry, guard).await
    }

    /// Stop `name` if it is still idle past its timeout once the transition
    /// lock is held. Returns whether it was stopped.
    pub async fn evict_idle(
        &self,
        name: &str,
        timeout_override: Option<Duration>,
    ) -> Result<bool, GatewayError> {
        let entry = self.entry(name)?;
        let guard = Arc::clone(&entry.transition).lock_owned().await;

        // Activity may have arrived since the scan
        let Some((idle, config)) = entry.idle_for() else {
            return Ok(false);
        };
        let timeout = self.effective_timeout(name, &config, timeout_override);
        if idle <= timeout {
            debug!(service = name, "Service became active again, not evicting");
            return Ok(false);
        }

        info!(
            service = name,
            idle_ms = idle.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "Stopping idle service"
        );
        self.stop_locked(name, entry, guard).await?;
        Ok(true)
    }

    async fn stop_locked(
        &self,
        name: &str,
        entry: Arc<ServiceEntry>,
        guard: OwnedMutexGuard<()>,
    ) -> Result<ServiceRecord, GatewayError> {
        {
            let mut state = entry.state.lock();
            info!(service = name, from = %state.status, "Service stopping");
            state.status = ServiceStatus::Stopping;
        }

        let supervisor = Arc::clone(&self.supervisor);
        let service = name.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = supervisor.stop(&service).await;

            let mut state = entry.state.lock();
            match result {
                Ok(()) => {
                    state.status = ServiceStatus::Stopped;
                    state.pid = None;
                    state.start_time = None;
                    info!(service = %service, "Service stopped");
                    Ok(entry.snapshot_locked(&state))
                }
                Err(e) => {
                    state.status = ServiceStatus::Error;
                    error!(service = %service, error = %e, "Failed to stop service");
                    Err(GatewayError::StopFailure { service, source: e })
                }
            }
        });

        task.await.map_err(|e| {
            error!(service = name, error = %e, "Stop task failed");
            GatewayError::ServiceUnavailable(name.to_string())
        })?
    }

    /// Record a proxied request. Returns false for unknown names.
    pub fn update_activity(&self, name: &str) -> bool {
        let Some(entry) = self.services.get(name) else {
            return false;
        };
        ServiceEntry::touch(&mut entry.state.lock());
        entry.request_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Count a failure against the service (health probe, upstream error)
    pub fn record_error(&self, name: &str) -> bool {
        let Some(entry) = self.services.get(name) else {
            return false;
        };
        entry.error_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Running services idle longer than their effective timeout.
    ///
    /// The timeout is the service's configured value; services without one
    /// fall back to `timeout_override`, then to the gateway default.
    pub fn inactive_services(&self, timeout_override: Option<Duration>) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter_map(|entry| {
                let (idle, config) = entry.idle_for()?;
                let timeout = self.effective_timeout(entry.key(), &config, timeout_override);
                (idle > timeout).then(|| entry.key().clone())
            })
            .collect();
        names.sort();
        names
    }

    fn effective_timeout(
        &self,
        name: &str,
        record_config: &ServiceConfig,
        timeout_override: Option<Duration>,
    ) -> Duration {
        let current = self.config.service(name);
        let configured = current
            .as_ref()
            .map(|c| c.timeout_ms)
            .unwrap_or(record_config.timeout_ms);
        match (configured, timeout_override) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(timeout)) => timeout,
            (None, None) => self.config.settings().default_timeout(),
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.services.iter() {
            stats.total += 1;
            match entry.status() {
                ServiceStatus::Running => stats.running += 1,
                ServiceStatus::Stopped => stats.stopped += 1,
                ServiceStatus::Starting => stats.starting += 1,
                ServiceStatus::Stopping => stats.stopping += 1,
                ServiceStatus::Error => stats.error += 1,
            }
            stats.total_requests += entry.request_count.load(Ordering::Relaxed);
            stats.total_errors += entry.error_count.load(Ordering::Relaxed);
        }
        stats
    }

    /// Stop every running service, logging failures without aborting
    pub async fn stop_running(&self) {
        for record in self.running() {
            if let Err(e) = self.stop_service(&record.name).await {
                warn!(service = %record.name, error = %e, "Failed to stop service during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::supervisor::mock::MockSupervisor;

    fn store_with(services: &[(&str, Option<u64>)]) -> Arc<ConfigStore> {
        let mut config = GatewayConfig::default();
        for (i, (name, timeout)) in services.iter().enumerate() {
            let mut service = ServiceConfig::new(name, "node server.js", 3000 + i as u16);
            service.timeout_ms = *timeout;
            config.services.insert(name.to_string(), service);
        }
        ConfigStore::new(config)
    }

    fn registry(store: Arc<ConfigStore>) -> (Arc<ServiceRegistry>, Arc<MockSupervisor>) {
        let supervisor = MockSupervisor::new();
        let registry = Arc::new(ServiceRegistry::new(supervisor.clone(), store));
        (registry, supervisor)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = store_with(&[("api", None)]);
        let (registry, _) = registry(Arc::clone(&store));
        let config = store.service("api").unwrap();

        assert!(registry.register_service("api", config.clone()));
        assert!(!registry.register_service("api", config));
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_register_configured_rejects_unknown() {
        let (registry, _) = registry(store_with(&[("api", None)]));
        let err = registry.register_configured("nope").unwrap_err();
        assert!(matches!(err, GatewayError::ServiceNotConfigured(_)));
        assert!(!registry.contains("nope"));
    }

    #[tokio::test]
    async fn test_start_unregistered_fails() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        let err = registry.start_service("api").await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceNotRegistered(_)));
        assert_eq!(supervisor.start_count(), 0);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        registry.register_configured("api").unwrap();

        let record = registry.start_service("api").await.unwrap();
        assert_eq!(record.status, ServiceStatus::Running);
        assert!(record.pid.is_some());
        assert!(record.start_time.is_some());
        assert!(record.last_activity.is_some());
        assert_eq!(supervisor.start_count(), 1);

        let request = supervisor.last_request.lock().clone().unwrap();
        assert_eq!(request.name, "api");
        assert_eq!(request.port, 3000);

        let record = registry.stop_service("api").await.unwrap();
        assert_eq!(record.status, ServiceStatus::Stopped);
        assert!(record.pid.is_none());
        assert!(record.start_time.is_none());
        assert_eq!(supervisor.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_start_running_is_noop() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        registry.register_configured("api").unwrap();
        registry.start_service("api").await.unwrap();
        registry.start_service("api").await.unwrap();
        assert_eq!(supervisor.start_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_stopped_is_noop() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        registry.register_configured("api").unwrap();
        registry.stop_service("api").await.unwrap();
        assert_eq!(supervisor.stop_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_launch_once() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        *supervisor.start_delay.lock() = Duration::from_millis(200);
        registry.register_configured("api").unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.start_service("api").await }));
        }
        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            assert_eq!(record.status, ServiceStatus::Running);
        }

        assert_eq!(supervisor.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_share_failure() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        *supervisor.start_delay.lock() = Duration::from_millis(200);
        supervisor.fail_start.lock().insert("api".to_string());
        registry.register_configured("api").unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.start_service("api").await }));
        }
        let mut launch_failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(GatewayError::StartFailure { .. }) => launch_failures += 1,
                Err(GatewayError::ServiceUnavailable(_)) => {}
                other => panic!("unexpected start result: {:?}", other.map(|r| r.status)),
            }
        }

        assert_eq!(launch_failures, 1);
        assert_eq!(supervisor.start_count(), 1);
        let record = registry.get("api").unwrap();
        assert_eq!(record.status, ServiceStatus::Error);
        assert_eq!(record.error_count, 1);

        // A later caller retries
        supervisor.fail_start.lock().clear();
        let record = registry.start_service("api").await.unwrap();
        assert_eq!(record.status, ServiceStatus::Running);
        assert_eq!(supervisor.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_starting_during_launch() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        *supervisor.start_delay.lock() = Duration::from_millis(500);
        registry.register_configured("api").unwrap();

        let starter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.start_service("api").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Starting);
        assert_eq!(registry.stats().starting, 1);

        starter.await.unwrap().unwrap();
        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_strand_start() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        *supervisor.start_delay.lock() = Duration::from_millis(500);
        registry.register_configured("api").unwrap();

        let start = registry.start_service("api");
        let _ = tokio::time::timeout(Duration::from_millis(100), start).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Running);
        assert_eq!(supervisor.start_count(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_sets_error_and_retries() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        supervisor.fail_start.lock().insert("api".to_string());
        registry.register_configured("api").unwrap();

        let err = registry.start_service("api").await.unwrap_err();
        assert!(matches!(err, GatewayError::StartFailure { .. }));
        let record = registry.get("api").unwrap();
        assert_eq!(record.status, ServiceStatus::Error);
        assert_eq!(record.error_count, 1);

        supervisor.fail_start.lock().clear();
        let record = registry.start_service("api").await.unwrap();
        assert_eq!(record.status, ServiceStatus::Running);
        assert_eq!(supervisor.start_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_failure_sets_error() {
        let (registry, supervisor) = registry(store_with(&[("api", None)]));
        supervisor.fail_stop.lock().insert("api".to_string());
        registry.register_configured("api").unwrap();
        registry.start_service("api").await.unwrap();

        let err = registry.stop_service("api").await.unwrap_err();
        assert!(matches!(err, GatewayError::StopFailure { .. }));
        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_start_removed_service_is_not_configured() {
        let store = store_with(&[("api", None)]);
        let (registry, supervisor) = registry(Arc::clone(&store));
        registry.register_configured("api").unwrap();

        store.replace(GatewayConfig::default());
        let err = registry.start_service("api").await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceNotConfigured(_)));
        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Stopped);
        assert_eq!(supervisor.start_count(), 0);
    }

    #[tokio::test]
    async fn test_update_activity_counts_requests() {
        let (registry, _) = registry(store_with(&[("api", None)]));
        assert!(!registry.update_activity("api"));

        registry.register_configured("api").unwrap();
        assert!(registry.update_activity("api"));
        assert!(registry.update_activity("api"));
        assert!(registry.record_error("api"));

        let record = registry.get("api").unwrap();
        assert_eq!(record.request_count, 2);
        assert_eq!(record.error_count, 1);
        assert!(record.last_activity.is_some());

        let stats = registry.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_boundary() {
        let (registry, supervisor) = registry(store_with(&[("api", Some(5_000))]));
        registry.register_configured("api").unwrap();
        registry.start_service("api").await.unwrap();

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(registry.inactive_services(None).is_empty());
        assert!(!registry.evict_idle("api", None).await.unwrap());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(registry.inactive_services(None), vec!["api".to_string()]);
        assert!(registry.evict_idle("api", None).await.unwrap());
        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Stopped);
        assert_eq!(supervisor.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_prevents_eviction() {
        let (registry, _) = registry(store_with(&[("api", Some(5_000))]));
        registry.register_configured("api").unwrap();
        registry.start_service("api").await.unwrap();

        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(4_000)).await;
            registry.update_activity("api");
            assert!(registry.inactive_services(None).is_empty());
        }
        assert!(registry.get("api").unwrap().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_rechecks_activity() {
        let (registry, supervisor) = registry(store_with(&[("api", Some(5_000))]));
        registry.register_configured("api").unwrap();
        registry.start_service("api").await.unwrap();

        tokio::time::advance(Duration::from_millis(6_000)).await;
        assert_eq!(registry.inactive_services(None).len(), 1);

        // A request lands between the scan and the eviction
        registry.update_activity("api");
        assert!(!registry.evict_idle("api", None).await.unwrap());
        assert_eq!(supervisor.stop_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_override_then_default() {
        let (registry, _) = registry(store_with(&[("api", None)]));
        registry.register_configured("api").unwrap();
        registry.start_service("api").await.unwrap();

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert_eq!(registry.inactive_services(Some(Duration::from_secs(1))).len(), 1);
        // Gateway default is five minutes
        assert!(registry.inactive_services(None).is_empty());
    }

    #[tokio::test]
    async fn test_stop_running_stops_all() {
        let (registry, supervisor) = registry(store_with(&[("a", None), ("b", None), ("c", None)]));
        for name in ["a", "b", "c"] {
            registry.register_configured(name).unwrap();
        }
        registry.start_service("a").await.unwrap();
        registry.start_service("b").await.unwrap();
        supervisor.fail_stop.lock().insert("a".to_string());

        registry.stop_running().await;

        assert_eq!(registry.get("a").unwrap().status, ServiceStatus::Error);
        assert_eq!(registry.get("b").unwrap().status, ServiceStatus::Stopped);
        assert_eq!(registry.get("c").unwrap().status, ServiceStatus::Stopped);
        assert_eq!(supervisor.stop_count(), 2);
    }
}
