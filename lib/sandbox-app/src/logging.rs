//! Logging.

use sandbox_error::{generic_error, GenericError};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

const LOG_LEVEL_ENV_VAR: &str = "SANDBOX_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "SANDBOX_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// The `SANDBOX_LOG_LEVEL` environment variable holds the filtering directives to use (for example,
/// `info,sandbox_core=debug`). When it is not set, `default_level` is used, falling back to `INFO`.
///
/// When `SANDBOX_LOG_FORMAT_JSON` is set to `true` or `1`, events are emitted as flattened JSON objects, one per line.
/// Otherwise, a compact human-readable format is used.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(level_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if is_json_requested() {
        builder
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
    } else {
        builder.compact().with_ansi(true).try_init()
    };

    result.map_err(|e| generic_error!("Failed to install global logging subscriber: {}", e))
}

fn is_json_requested() -> bool {
    std::env::var(LOG_FORMAT_JSON_ENV_VAR)
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false)
}
