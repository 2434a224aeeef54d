//! Logging setup
//!
//! stdout carries the command output, so every log line goes to a daily
//! rolling file instead. The file lives in the platform data directory unless
//! `RDBG_LOG_DIR` points elsewhere, and the filter comes from `RDBG_LOG`.
//!
//! ```bash
//! RDBG_LOG=debug rdbg apps
//! RDBG_LOG=rdbg_rpc=trace rdbg eval --page 1 'document.title'
//! RDBG_LOG_DIR=/tmp/rdbg-logs rdbg watch
//! ```

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Result, ResultExt};

pub const LOG_FILTER_ENV: &str = "RDBG_LOG";
pub const LOG_DIR_ENV: &str = "RDBG_LOG_DIR";
const LOG_FILE_PREFIX: &str = "rdbg.log";

/// Info for every rdbg crate, warn for dependencies.
const DEFAULT_FILTER: &str = "warn,rdbg=info,rdbg_core=info,rdbg_rpc=info,rdbg_device=info";

/// Install the file logger. Call once, before any other work.
pub fn init() -> Result<()> {
    let log_dir = log_directory(std::env::var_os(LOG_DIR_ENV).map(PathBuf::from));
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);

    tracing_subscriber::registry()
        .with(env_filter(std::env::var(LOG_FILTER_ENV).ok().as_deref()))
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!(
        "rdbg {} starting, logging to {}",
        env!("CARGO_PKG_VERSION"),
        log_dir.display()
    );
    Ok(())
}

/// `override_dir` when given, else `<data dir>/rdbg/logs`.
fn log_directory(override_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("rdbg").join("logs")
}

/// Parse `directives`, falling back to the default when absent or invalid.
fn env_filter(directives: Option<&str>) -> EnvFilter {
    match directives.filter(|d| !d.trim().is_empty()) {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("Ignoring invalid {LOG_FILTER_ENV} ({e}), using defaults");
            EnvFilter::new(DEFAULT_FILTER)
        }),
        None => EnvFilter::new(DEFAULT_FILTER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_override() {
        let dir = log_directory(Some(PathBuf::from("/tmp/rdbg-logs")));
        assert_eq!(dir, PathBuf::from("/tmp/rdbg-logs"));
    }

    #[test]
    fn test_empty_override_uses_data_dir() {
        let dir = log_directory(Some(PathBuf::new()));
        assert!(dir.ends_with("rdbg/logs"));
        assert_eq!(dir, log_directory(None));
    }

    #[test]
    fn test_default_filter_covers_library_crates() {
        let filter = env_filter(None).to_string();
        for target in ["rdbg_core", "rdbg_rpc", "rdbg_device"] {
            assert!(filter.contains(&format!("{target}=info")), "{filter}");
        }
    }

    #[test]
    fn test_custom_filter_is_used() {
        let filter = env_filter(Some("rdbg_rpc=trace")).to_string();
        assert!(filter.contains("rdbg_rpc=trace"));
    }

    #[test]
    fn test_invalid_filter_falls_back_to_default() {
        let filter = env_filter(Some("rdbg_rpc=notalevel")).to_string();
        assert!(filter.contains("rdbg_device=info"));
    }
}
