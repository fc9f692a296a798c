//! provides logging helpers

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// When set, logs go to a daily rolling file at this path instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

const MAX_LOG_FILES: usize = 7;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init() -> Option<WorkerGuard> {
    match env::var(LOG_PATH_ENV_VAR).ok().filter(|p| !p.is_empty()) {
        Some(log_path) => match file_appender(Path::new(&log_path)) {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let fmt_layer = layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(env_filter());
                registry().with(fmt_layer).init();
                Some(guard)
            }
            Err(err) => {
                init_stderr();
                tracing::warn!("failed to open log file {log_path}, logging to stderr: {err}");
                None
            }
        },
        None => {
            init_stderr();
            None
        }
    }
}

fn init_stderr() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

fn file_appender(
    log_path: &Path,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    let directory = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("udev-manager.log");

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_appender_creates_files_under_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("manager.log");

        let appender = file_appender(&path);
        assert!(appender.is_ok(), "appender should build: {:?}", appender.err());
        assert!(dir.path().join("logs").is_dir());
    }
}
