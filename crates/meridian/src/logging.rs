//! Logging system setup.
//!
//! Initializes tracing-subscriber with either human-readable or JSON output.
//! `RUST_LOG` wins over the configured level when set.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSettings;

/// Initializes the logging system with the configured settings.
///
/// # Arguments
///
/// * `config` - Logging configuration from the config file
/// * `json_format` - Whether to force JSON output (CLI override)
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(fmt::layer().json().with_thread_ids(true).with_thread_names(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_thread_ids(true).with_thread_names(true))
            .init();
    }

    info!("logging initialized with level: {}", config.level);
    Ok(())
}

/// Shows the startup banner through the logging system.
pub fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║              MERIDIAN  v{}            ║", version);
    info!("║                                          ║");
    info!("║  Distributed Entity Server Framework     ║");
    info!("║  dispatcher · server · gate              ║");
    info!("╚══════════════════════════════════════════╝");
}
