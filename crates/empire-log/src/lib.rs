//! Structured logging for the empire binaries.
//!
//! Console output with uptime timestamps and module paths, plus optional JSON
//! file logging for post-mortem analysis of connection problems. The level
//! comes from `RUST_LOG` when set, otherwise from the config's `debug.log_level`.

use std::fs::File;
use std::path::Path;

use empire_config::Config;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names a level.
pub const DEFAULT_FILTER: &str = "info,ureq=warn";

/// Name of the JSON log file written under `log_dir`.
pub const LOG_FILE_NAME: &str = "empire.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file, if file logging is wanted
/// * `file_logging` - write `empire.log` to `log_dir` in addition to the console
/// * `config` - optional configuration to take the log level from
///
/// ```no_run
/// use empire_config::Config;
/// use empire_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, file_logging: bool, config: Option<&Config>) {
    let filter_str = filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // tokio workers and the login thread are named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if file_logging
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = File::create(log_dir.join(LOG_FILE_NAME))
    {
        subscriber.with(json_file_layer(log_file)).init();
        return;
    }

    subscriber.init();
}

/// The filter string `init_logging` falls back to when `RUST_LOG` is unset.
pub fn filter_directives(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

/// JSON lines layer writing to `file`, without ANSI codes.
fn json_file_layer<S>(file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json()
}
