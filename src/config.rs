//! Gateway configuration: file format, defaults, validation and hot reload.

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Top-level gateway configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct GatewayConfig {
    /// Gateway-wide settings
    #[serde(default)]
    pub settings: GatewaySettings,

    /// Services keyed by the name used as the first path segment
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewaySettings {
    /// Gateway listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Gateway bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Idle timeout for services that don't set their own (milliseconds)
    #[serde(default = "default_timeout")]
    pub default_timeout_ms: u64,

    /// Smallest idle timeout a service may configure (milliseconds)
    #[serde(default = "default_min_timeout")]
    pub min_timeout_ms: u64,

    /// Interval between health sweeps of running services (milliseconds)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    /// Interval between idle-service cleanup sweeps (milliseconds)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Timeout for a single health probe (milliseconds)
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,

    /// Timeout for a proxied request (milliseconds)
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_ms: u64,

    /// Pause after a successful launch before probing readiness (milliseconds)
    #[serde(default = "default_start_settle")]
    pub start_settle_ms: u64,

    /// Upper bound on the readiness poll after a start (milliseconds)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Pause between the stop and start halves of a restart (milliseconds)
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Time between SIGTERM and SIGKILL when stopping a process (milliseconds)
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_ms: u64,

    /// How often the config file is checked for modification (milliseconds)
    #[serde(default = "default_config_watch_interval")]
    pub config_watch_interval_ms: u64,

    /// Maximum idle upstream connections per service port
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Log level ("error", "warn", "info", "debug", "trace" or a filter directive)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// CORS policy applied to every gateway response
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            default_timeout_ms: default_timeout(),
            min_timeout_ms: default_min_timeout(),
            health_check_interval_ms: default_health_check_interval(),
            cleanup_interval_ms: default_cleanup_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
            proxy_timeout_ms: default_proxy_timeout(),
            start_settle_ms: default_start_settle(),
            startup_timeout_ms: default_startup_timeout(),
            restart_delay_ms: default_restart_delay(),
            stop_grace_period_ms: default_stop_grace_period(),
            config_watch_interval_ms: default_config_watch_interval(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            log_level: default_log_level(),
            cors: CorsConfig::default(),
        }
    }
}

impl GatewaySettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn config_watch_interval(&self) -> Duration {
        Duration::from_millis(self.config_watch_interval_ms)
    }

    /// Every invalid setting, one message each
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let positive = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("health_check_timeout_ms", self.health_check_timeout_ms),
            ("proxy_timeout_ms", self.proxy_timeout_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("config_watch_interval_ms", self.config_watch_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(format!("Setting '{}' must be greater than 0", field));
            }
        }

        if self.default_timeout_ms < self.min_timeout_ms {
            errors.push(format!(
                "Setting 'default_timeout_ms' must be at least {}",
                self.min_timeout_ms
            ));
        }

        errors
    }
}

/// Cross-origin policy
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allowed origins; `"*"` allows any origin
    #[serde(default = "default_cors_origins")]
    pub origins: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub methods: Vec<String>,

    #[serde(default = "default_cors_headers")]
    pub headers: Vec<String>,

    /// Preflight cache lifetime in seconds
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: default_cors_origins(),
            methods: default_cors_methods(),
            headers: default_cors_headers(),
            max_age_secs: default_cors_max_age(),
        }
    }
}

/// Configuration for a single service
///
/// # Security Warning
///
/// `command` is executed directly by the gateway. Configuration files must be
/// protected with appropriate file permissions; a malicious file can run
/// arbitrary code with the permissions of the gateway process.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Service name; filled in from the `services` map key on load
    #[serde(default)]
    pub name: String,

    /// Command line used to launch the service (split shell-style)
    pub command: String,

    /// Port the service listens on
    pub port: u16,

    /// Idle timeout in milliseconds (overrides `settings.default_timeout_ms`)
    pub timeout_ms: Option<u64>,

    /// Health endpoint path
    #[serde(default = "default_health_check_path")]
    pub health_check: String,

    /// Environment variables added to the process environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Number of processes to launch for this service. All of them get the
    /// same `PORT`, so more than one needs a server that binds with
    /// `SO_REUSEPORT` or shares a listener cluster-style.
    #[serde(default = "default_instances")]
    pub instances: u32,

    /// Relaunch processes that exit unexpectedly
    #[serde(default)]
    pub auto_restart: bool,

    /// Upper bound on automatic relaunches per process
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl ServiceConfig {
    /// Create a service config with defaults for everything but command and port
    pub fn new(name: &str, command: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            port,
            timeout_ms: None,
            health_check: default_health_check_path(),
            env: HashMap::new(),
            working_dir: None,
            instances: default_instances(),
            auto_restart: false,
            max_restarts: default_max_restarts(),
        }
    }

    /// Set the idle timeout (builder pattern)
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn idle_timeout(&self, settings: &GatewaySettings) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(settings.default_timeout_ms))
    }

    /// Validate the service configuration
    pub fn validate(&self, name: &str, settings: &GatewaySettings) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err(format!("Service '{}': 'command' must not be empty", name));
        }

        match shell_words::split(&self.command) {
            Ok(argv) if argv.is_empty() => {
                return Err(format!("Service '{}': 'command' must not be empty", name));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(format!("Service '{}': 'command' cannot be parsed: {}", name, e));
            }
        }

        if self.port == 0 {
            return Err(format!("Service '{}': 'port' must be greater than 0", name));
        }

        if let Some(timeout) = self.timeout_ms {
            if timeout < settings.min_timeout_ms {
                return Err(format!(
                    "Service '{}': 'timeout_ms' must be at least {}",
                    name, settings.min_timeout_ms
                ));
            }
        }

        if !self.health_check.starts_with('/') {
            return Err(format!(
                "Service '{}': 'health_check' must start with '/'",
                name
            ));
        }

        if self.instances == 0 {
            return Err(format!("Service '{}': 'instances' must be at least 1", name));
        }

        Ok(())
    }
}

// Default value functions
fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_min_timeout() -> u64 {
    1_000
}

fn default_health_check_interval() -> u64 {
    30_000
}

fn default_cleanup_interval() -> u64 {
    60_000
}

fn default_health_check_timeout() -> u64 {
    5_000
}

fn default_proxy_timeout() -> u64 {
    30_000
}

fn default_start_settle() -> u64 {
    2_000
}

fn default_startup_timeout() -> u64 {
    30_000
}

fn default_restart_delay() -> u64 {
    1_000
}

fn default_stop_grace_period() -> u64 {
    10_000
}

fn default_config_watch_interval() -> u64 {
    1_000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    ["Content-Type", "Authorization", "X-Requested-With"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_cors_max_age() -> u64 {
    86_400
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_instances() -> u32 {
    1
}

fn default_max_restarts() -> u32 {
    10
}

/// Longest service name usable as a path segment
pub const MAX_SERVICE_NAME_LEN: usize = 128;

/// Path segment owned by the management API
pub const RESERVED_SERVICE_NAME: &str = "api";

/// Whether `name` can appear as the first path segment of a routed request:
/// 1 to 128 characters from `[A-Za-z0-9._-]`
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// On-disk encoding of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// `.toml` files are TOML, everything else is JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content, ConfigFormat::from_path(path))
    }

    /// Parse, fill in service names and validate
    pub fn parse(content: &str, format: ConfigFormat) -> anyhow::Result<Self> {
        let mut config: GatewayConfig = match format {
            ConfigFormat::Json => serde_json::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
        };
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Copy every map key into its service's `name` field
    pub fn normalize(&mut self) {
        for (name, service) in self.services.iter_mut() {
            service.name = name.clone();
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        errors.extend(self.settings.validate());

        for (name, service) in &self.services {
            if !is_valid_service_name(name) {
                errors.push(format!(
                    "Service name '{}' must be 1-{} characters of letters, digits, '.', '-' or '_'",
                    name, MAX_SERVICE_NAME_LEN
                ));
            } else if name == RESERVED_SERVICE_NAME {
                errors.push(format!(
                    "Service name '{}' is reserved for the management API",
                    name
                ));
            }
            if let Err(e) = service.validate(name, &self.settings) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }
}

/// Callback invoked with the new configuration after every successful reload
pub type ConfigListener = Box<dyn Fn(&GatewayConfig) + Send + Sync>;

/// Holds the active configuration snapshot and notifies subscribers on change.
///
/// Readers always get the latest snapshot; nothing caches a copy across
/// operations. A failed reload keeps the previous snapshot.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<GatewayConfig>>,
    listeners: Mutex<Vec<ConfigListener>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Create a store that is not backed by a file
    pub fn new(mut config: GatewayConfig) -> Arc<Self> {
        config.normalize();
        Arc::new(Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            listeners: Mutex::new(Vec::new()),
            last_modified: Mutex::new(None),
        })
    }

    /// Load a file-backed store
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let config = GatewayConfig::load(&path)?;
        let modified = modified_time(&path);
        Ok(Arc::new(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
            listeners: Mutex::new(Vec::new()),
            last_modified: Mutex::new(modified),
        }))
    }

    /// The active configuration
    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        Arc::clone(&self.current.read())
    }

    pub fn settings(&self) -> GatewaySettings {
        self.current.read().settings.clone()
    }

    pub fn service(&self, name: &str) -> Option<ServiceConfig> {
        self.current.read().services.get(name).cloned()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.current.read().services.contains_key(name)
    }

    /// Register a change listener. Listeners run synchronously on the
    /// reloading task and must not call `subscribe` themselves.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&GatewayConfig) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Swap in a new configuration and notify listeners
    pub fn replace(&self, mut config: GatewayConfig) {
        config.normalize();
        let config = Arc::new(config);
        *self.current.write() = Arc::clone(&config);

        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            listener(&config);
        }
    }

    /// Re-read the backing file unconditionally
    pub fn reload(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_ref() else {
            anyhow::bail!("Configuration is not backed by a file");
        };

        let modified = modified_time(path);
        let config = GatewayConfig::load(path)?;
        *self.last_modified.lock() = modified;

        info!(
            path = %path.display(),
            services = config.services.len(),
            "Configuration reloaded"
        );
        self.replace(config);
        Ok(())
    }

    /// Reload if the backing file's modification time changed.
    /// Returns whether a reload happened.
    pub fn check_for_changes(&self) -> anyhow::Result<bool> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };

        let modified = modified_time(path);
        {
            let mut last = self.last_modified.lock();
            if modified.is_none() || modified == *last {
                return Ok(false);
            }
            // Record the new mtime even if parsing fails so a broken file is
            // reported once rather than on every poll.
            *last = modified;
        }

        debug!(path = %path.display(), "Configuration file modified");
        let config = GatewayConfig::load(path)?;
        info!(
            path = %path.display(),
            services = config.services.len(),
            "Configuration reloaded"
        );
        self.replace(config);
        Ok(true)
    }

    /// Poll the backing file until shutdown is signalled
    pub async fn watch(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        if self.path.is_none() {
            return;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.check_for_changes() {
                        error!(error = %e, "Failed to reload configuration, keeping previous");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Configuration watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
