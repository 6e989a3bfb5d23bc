//! Structured logging for debugging conductor runs.
//!
//! Log levels:
//! - ERROR: Runs that could not start (invalid graph)
//! - WARN: Task failures, breakers opening, run deadlines
//! - INFO: Run and task lifecycle (start, completion, retry, skip)
//! - DEBUG: Breaker rejections, backoff decisions, config loading
//! - TRACE: Throttled progress emissions, ignored progress updates
//!
//! Output goes to `~/.conductor/conductor.log`, truncated at start-up.
//! Debug mode can be enabled with the `--debug` flag or `CONDUCTOR_DEBUG=1`;
//! `CONDUCTOR_LOG` takes a full filter directive such as `conductor=trace`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";
const FILTER_ENV: &str = "CONDUCTOR_LOG";

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_flag(DEBUG_ENV);
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = std::env::var(FILTER_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(debug_enabled)));

    let Some(file) = open_log_file() else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Where log output is written, once logging is initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn open_log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".conductor");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("conductor.log");
    // File::create truncates on startup
    let file = File::create(&path).ok()?;
    let _ = LOG_PATH.set(path);
    Some(file)
}
