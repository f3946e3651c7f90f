use anyhow::{anyhow, Result};
use baton_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing::Level;

/// Installs the global subscriber from the loaded configuration. Output goes to stderr so
/// command reports on stdout stay machine-readable.
pub fn init_logging(config: &AppConfig) -> Result<()> {
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let installed = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|error| anyhow!(error))
}

/// Like [`init_logging`], loading configuration first. Commands report their own config errors.
pub fn init_from_env() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config)
}
