//! Tracing setup.
//!
//! Text and JSON runs log to stderr. The TUI owns the terminal, so it logs to a file.

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "emby-ffmpeg-fixer.log";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Where the TUI writes its log when `--log-file` is not given.
pub(crate) fn default_log_file() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("emby-ffmpeg-fixer")
        .join(LOG_FILE_NAME)
}

pub(crate) fn init_stderr() {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(stderr_layer)
        .try_init();
}

/// The returned guard flushes the file on drop; keep it alive for the whole run.
pub(crate) fn init_file(path: &Path) -> Result<WorkerGuard> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| LOG_FILE_NAME.into());

    let file_appender = tracing_appender::rolling::never(dir, name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter())
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_file_has_our_name() {
        let p = default_log_file();
        assert_eq!(p.file_name().and_then(|n| n.to_str()), Some(LOG_FILE_NAME));
    }
}
