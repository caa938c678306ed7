use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Configured level plus quiet defaults for chatty dependencies. `RUST_LOG`, when set,
/// replaces all of it.
fn build_env_filter(level: &str, rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return EnvFilter::try_new(directives)
            .map_err(|e| anyhow::anyhow!("Invalid RUST_LOG '{}': {}", directives, e));
    }

    let mut directives = vec![level.to_string()];
    for (target, lvl) in [
        ("hyper", "warn"),
        ("h2", "warn"),
        ("reqwest", "warn"),
        ("tokio_postgres", "warn"),
        ("tower_http", "info"),
    ] {
        directives.push(format!("{}={}", target, lvl));
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Install the global subscriber. Does nothing when logging is disabled.
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    if !settings.enabled {
        return Ok(());
    }

    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_env_filter(&settings.level, rust_log.as_deref())?;

    let console_layer = match LogFormat::parse(&settings.format) {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    tracing::debug!(level = %settings.level, format = %settings.format, "logging initialized");
    Ok(())
}
