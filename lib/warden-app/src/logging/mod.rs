//! Logging.

use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer, Registry,
};
use warden_config::GenericConfiguration;
use warden_error::{ErrorContext as _, GenericError};

mod config;
use self::config::LoggingConfiguration;

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `WARDEN_LOG_LEVEL` environment variable to determine the log level to use. If the
/// environment variable is not set, `default_level` is used, or `INFO` if that isn't set either. Additionally, it reads
/// the `WARDEN_LOG_FORMAT_JSON` environment variable to determine which output format to use. If it is set to `true` or
/// `1`, the logs will be formatted as JSON. If it is set to any other value, or not set at all, the logs will default
/// to a compact, colored, human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    let is_json = std::env::var("WARDEN_LOG_FORMAT_JSON")
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var("WARDEN_LOG_LEVEL")
        .from_env_lossy();

    install(level_filter, is_json)
}

/// Initializes the logging subsystem for `tracing` from the given configuration.
///
/// The log level is read from `log_level`, which accepts any `EnvFilter` directives (defaults to `info`), and the
/// output format from `log_format_json` (defaults to `false`).
///
/// # Errors
///
/// If the logging configuration is invalid, or if the logging subsystem was already initialized, an error will be
/// returned.
pub fn initialize_logging_from_configuration(config: &GenericConfiguration) -> Result<(), GenericError> {
    let logging_config = LoggingConfiguration::from_configuration(config)?;
    install(
        logging_config.log_level.into_env_filter(),
        logging_config.log_format_json,
    )
}

fn install(level_filter: EnvFilter, is_json: bool) -> Result<(), GenericError> {
    let formatting_layer: Box<dyn Layer<Registry> + Send + Sync> = if is_json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_ansi(true).compact().boxed()
    };

    tracing_subscriber::registry()
        .with(formatting_layer.with_filter(level_filter))
        .try_init()
        .error_context("Failed to install logging subscriber.")
}
