//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry from a [`LoggingConfig`]: an `EnvFilter`
//! (overridable through `RUST_LOG`), a console layer and an optional file layer, either
//! human readable or JSON.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Filter used when `RUST_LOG` is not set
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let level = config.log_level.to_string().to_lowercase();
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber
///
/// # Errors
/// `ConfigError` when the log file cannot be opened or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let console = config.log_to_console.then(|| {
        let layer = fmt::layer().with_target(true).with_level(true);
        if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    });

    let file = match (&config.log_file_path, config.log_to_file) {
        (Some(path), true) => {
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
            let layer = fmt::layer().with_writer(Mutex::new(log_file)).with_ansi(false);
            Some(if config.json_format {
                layer.json().boxed()
            } else {
                layer.boxed()
            })
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn test_filter_follows_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            log_level: Level::DEBUG,
            ..LoggingConfig::default()
        };
        assert!(env_filter(&config).to_string().contains("debug"));
    }

    #[test]
    fn test_missing_log_directory_fails() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: Some("/nonexistent-dir/query/query.log".into()),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
