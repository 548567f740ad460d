//! Structured Logging for the Aid downloader
//!
//! Sets up the global `tracing` subscriber:
//! 1. Human-readable output on the terminal
//! 2. A daily rotating log file, as plain lines or JSON
//! 3. Level taken from `RUST_LOG` when set, otherwise from the config

use std::env::consts::{ARCH, FAMILY, OS};
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{info, trace};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::config::Logging;

/// Name prefix of the rotating log files.
pub const LOG_FILE_NAME: &str = "aid_downloader.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped and must be kept alive
/// until the program exits.
pub fn init_logger(log_dir: &Path, logging: &Logging) -> LoggerResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.log_level))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if logging.log_to_terminal {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        );
    }

    if logging.log_to_file {
        if !log_dir.exists() {
            fs::create_dir_all(log_dir)?;
        }

        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let layer = match logging.log_format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            _ => fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        };
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = logging.log_format.as_str(),
        log_level = logging.log_level.as_str(),
        "Logger initialized"
    );

    Ok(guard)
}

/// Logs information about the system being used.
pub fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
