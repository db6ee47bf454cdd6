//! Human-readable log for conversion_app.
//!
//! The structured NDJSON streams are written by the engine's `LogSink`;
//! this only sets up the `log` facade behind the `engine_*` macros.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use thiserror::Error;

/// Overrides the default `info` level, e.g. `CONVERSION_LOG=debug`.
pub const LEVEL_ENV: &str = "CONVERSION_LOG";

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("no log destination selected")]
    NoDestination,
    #[error("cannot open log file {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    AlreadySet(#[from] log::SetLoggerError),
}

/// Where the operational log goes.
#[derive(Debug, Clone, PartialEq)]
pub struct LogTarget {
    pub terminal: bool,
    /// Appended to across runs; the parent directory is created.
    pub file: Option<PathBuf>,
    pub level: LevelFilter,
}

impl LogTarget {
    /// Terminal plus `path`, at the level named by `CONVERSION_LOG`.
    pub fn terminal_and_file(path: impl Into<PathBuf>) -> Self {
        Self {
            terminal: true,
            file: Some(path.into()),
            level: level_from(std::env::var(LEVEL_ENV).ok().as_deref()),
        }
    }
}

fn level_from(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| LevelFilter::from_str(v.trim()).ok())
        .unwrap_or(LevelFilter::Info)
}

/// Install the global logger. A file that cannot be opened fails the whole
/// call so the caller can decide whether terminal output alone is enough.
pub fn initialize(target: &LogTarget) -> Result<(), LogInitError> {
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    if target.terminal {
        loggers.push(TermLogger::new(
            target.level,
            config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    if let Some(path) = &target.file {
        let file = open_log_file(path).map_err(|source| LogInitError::File {
            path: path.clone(),
            source,
        })?;
        loggers.push(WriteLogger::new(target.level, config, file));
    }
    if loggers.is_empty() {
        return Err(LogInitError::NoDestination);
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
