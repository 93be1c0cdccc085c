//! Subscriber setup shared by the binaries.
//!
//! `SSES_LOG_MODE=file` appends to `SSES_LOG_FILE` (or the binary's default
//! path); anything else logs to stdout. `RUST_LOG` overrides the `info`
//! default. Every line goes through [`SanitizingMakeWriter`].

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::adapters::sanitize::SanitizingMakeWriter;

/// Install the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
///
/// # Errors
/// Returns an I/O error if the log file cannot be opened.
pub fn init(default_file: &str) -> std::io::Result<WorkerGuard> {
    let use_file = std::env::var("SSES_LOG_MODE").is_ok_and(|mode| mode == "file");

    let (writer, guard) = if use_file {
        let log_file =
            std::env::var("SSES_LOG_FILE").unwrap_or_else(|_| default_file.to_string());
        if let Some(parent) = Path::new(&log_file).parent() {
            // Opening the file below reports the real problem.
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        tracing_appender::non_blocking(file)
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(SanitizingMakeWriter::new(writer)))
        .init();
    Ok(guard)
}
