use lazygate::api::{PKG_NAME, VERSION};
use lazygate::config::{ConfigStore, GatewayConfig};
use lazygate::gateway::Gateway;
use lazygate::logging;
use lazygate::proxy::GatewayServer;
use lazygate::supervisor::LocalSupervisor;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.json"));

    let store = match ConfigStore::load(&config_path) {
        Ok(store) => store,
        Err(e) => {
            let _ = logging::init("info");
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    let settings = store.settings();
    let log_handle = logging::init(&settings.log_level)?;
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&store.snapshot());

    // The log level is the only setting applied on reload; everything else
    // is read from the latest snapshot when it is next needed.
    let current_level = Mutex::new(settings.log_level.clone());
    store.subscribe(move |config| {
        let mut current = current_level.lock();
        if *current == config.settings.log_level {
            return;
        }
        match log_handle.set_level(&config.settings.log_level) {
            Ok(()) => *current = config.settings.log_level.clone(),
            Err(e) => warn!(
                level = %config.settings.log_level,
                error = %e,
                "Invalid log level in configuration"
            ),
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Arc::new(LocalSupervisor::new(settings.stop_grace_period()));
    let gateway = Gateway::new(Arc::clone(&store), supervisor);
    let monitor = gateway.start_monitor();

    let watcher = tokio::spawn(
        Arc::clone(&store).watch(settings.config_watch_interval(), shutdown_rx.clone()),
    );

    let bind_addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .map_err(|e| {
            error!(host = %settings.host, port = settings.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, Arc::clone(&gateway), shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(
                        path = %config_path.display(),
                        "Received SIGHUP, reloading configuration..."
                    );
                    if let Err(e) = store.reload() {
                        error!(error = %e, "Failed to reload configuration, keeping previous");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    gateway.shutdown(monitor).await;

    // Wait for the listener and watcher to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = watcher.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &GatewayConfig) {
    let settings = &config.settings;
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        host = %settings.host,
        port = settings.port,
        log_level = %settings.log_level,
        cors = settings.cors.enabled,
        "Server configuration"
    );
    info!(
        default_timeout_ms = settings.default_timeout_ms,
        proxy_timeout_ms = settings.proxy_timeout_ms,
        start_settle_ms = settings.start_settle_ms,
        startup_timeout_ms = settings.startup_timeout_ms,
        "Request handling defaults"
    );
    info!(
        health_check_interval_ms = settings.health_check_interval_ms,
        health_check_timeout_ms = settings.health_check_timeout_ms,
        cleanup_interval_ms = settings.cleanup_interval_ms,
        "Monitor settings"
    );
    info!(
        pool_max_idle = settings.pool_max_idle_per_host,
        pool_idle_timeout_secs = settings.pool_idle_timeout_secs,
        "Connection pool settings"
    );

    let mut names: Vec<&String> = config.services.keys().collect();
    names.sort();
    info!(service_count = names.len(), services = ?names, "Configured services");
}
