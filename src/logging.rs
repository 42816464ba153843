//! Tracing setup with a log level that can change at runtime

use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle for changing the active log filter after initialization
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    /// `RUST_LOG` was set at startup and wins over the config file
    pinned: bool,
}

impl LogLevelHandle {
    /// Apply a new level from configuration
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        if self.pinned {
            debug!(level, "RUST_LOG is set, ignoring configured log level");
            return Ok(());
        }

        let filter = build_filter(level)?;
        self.handle.reload(filter)?;
        info!(level, "Log level changed");
        Ok(())
    }
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence over `level` when present.
pub fn init(level: &str) -> anyhow::Result<LogLevelHandle> {
    let (filter, pinned) = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => (EnvFilter::try_new(directives)?, true),
        _ => (build_filter(level)?, false),
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .try_init()?;

    Ok(LogLevelHandle { handle, pinned })
}

/// Build a filter from a bare level ("debug") or a full directive string
pub fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = level.trim();
    if level.is_empty() {
        anyhow::bail!("Log level must not be empty");
    }
    // Keep the HTTP stack quiet unless asked for explicitly
    let directives = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("{},hyper=warn,hyper_util=warn", level.to_lowercase())
    };
    Ok(EnvFilter::try_new(directives)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_levels() {
        for level in ["error", "warn", "info", "debug", "trace", "INFO"] {
            assert!(build_filter(level).is_ok(), "level {level} should parse");
        }
    }

    #[test]
    fn test_build_filter_keeps_directives() {
        let filter = build_filter("lazygate=debug,hyper=info").unwrap();
        assert!(filter.to_string().contains("lazygate=debug"));
    }

    #[test]
    fn test_build_filter_rejects_empty() {
        assert!(build_filter("  ").is_err());
    }
}
