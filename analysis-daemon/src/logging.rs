//! Log setup for the supervisor, the driver and worker processes.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Log to stderr. Used by the interactive CLI.
pub fn init_stderr(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Append logs to `path`. Used by detached worker and driver processes,
/// whose stdout/stderr go nowhere.
pub fn init_file(level: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {parent:?}"))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {path:?}"))?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

/// Write panics to `<log_dir>/crashes.log` (and stderr) before the default
/// unwinding continues. Returns the crash log path.
pub fn install_crash_hook(log_dir: &Path, process: &str) -> PathBuf {
    let crash_log_path = log_dir.join("crashes.log");
    let _ = fs::create_dir_all(log_dir);

    let log_path_for_hook = crash_log_path.clone();
    let process = process.to_string();
    std::panic::set_hook(Box::new(move |panic_info| {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let backtrace = std::backtrace::Backtrace::force_capture();
        let crash_message = format!(
            "\n=== {} CRASH (PID {}) ===\nTimestamp: {}\nPanic: {}\nBacktrace:\n{}\n======================\n\n",
            process,
            std::process::id(),
            timestamp,
            panic_info,
            backtrace
        );

        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path_for_hook)
        {
            let _ = file.write_all(crash_message.as_bytes());
            let _ = file.flush();
        }

        eprintln!("{}", crash_message);
    }));

    crash_log_path
}
