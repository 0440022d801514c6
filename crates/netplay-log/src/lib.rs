//! Structured logging for netplay peers.
//!
//! Console output with uptime timestamps and module paths, plus a JSON log file
//! in debug builds for reading back after a desync or a drop. `RUST_LOG` wins
//! over the configured level.

use std::fs::File;
use std::path::Path;

use netplay_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config says otherwise.
const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE: &str = "netplay.log";

/// Install the global tracing subscriber.
///
/// * `log_dir` - where [`LOG_FILE`] goes (debug builds only)
/// * `debug_build` - enables the JSON file layer
/// * `config` - supplies `debug.log_level`
///
/// ```no_run
/// use netplay_config::Config;
///
/// let config = Config::default();
/// netplay_log::init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let log_file = if debug_build {
        log_dir.and_then(open_log_file)
    } else {
        None
    };
    match log_file {
        Some(file) => {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::uptime())
                .json();
            subscriber.with(file_layer).init();
        }
        None => subscriber.init(),
    }
}

/// An `EnvFilter` with the default directive.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn filter_directive(config: Option<&Config>) -> String {
    config
        .map(|c| c.debug.log_level.trim())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

fn open_log_file(dir: &Path) -> Option<File> {
    std::fs::create_dir_all(dir).ok()?;
    File::create(dir.join(LOG_FILE)).ok()
}
