use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conversion_core::{ErrorContext, ErrorInfo};
use engine_logging::{engine_warn, LogSink, LogStream};
use serde::{Deserialize, Serialize};

use crate::probe::{ResourceProbe, ResourceUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDetails {
    pub pid: u32,
    pub platform: String,
    pub arch: String,
    pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingDirectory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filesystem facts about a path named in the failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathProbe {
    pub field: String,
    pub path: PathBuf,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dir: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub timestamp: DateTime<Utc>,
    pub process: ProcessDetails,
    pub memory: ResourceUsage,
    pub working_directory: WorkingDirectory,
    pub context: ErrorContext,
    pub error: ErrorInfo,
    pub paths: Vec<PathProbe>,
}

/// Captures process, environment and filesystem state at failure time.
/// Collection never fails; individual probes degrade to an `error` field.
pub struct DiagnosticsCollector {
    sink: Arc<LogSink>,
    probe: Arc<dyn ResourceProbe>,
}

impl DiagnosticsCollector {
    pub fn new(sink: Arc<LogSink>, probe: Arc<dyn ResourceProbe>) -> Self {
        Self { sink, probe }
    }

    pub fn collect(&self, error: &ErrorInfo, context: &ErrorContext) -> DiagnosticSnapshot {
        let working_directory = match std::env::current_dir() {
            Ok(path) => WorkingDirectory {
                path: Some(path),
                error: None,
            },
            Err(err) => WorkingDirectory {
                path: None,
                error: Some(err.to_string()),
            },
        };

        let mut paths = Vec::new();
        if let Some(path) = &context.path {
            paths.push(probe_path("path", path));
        }
        if let Some(path) = &context.output_path {
            paths.push(probe_path("output_path", path));
        }

        let snapshot = DiagnosticSnapshot {
            timestamp: Utc::now(),
            process: ProcessDetails {
                pid: std::process::id(),
                platform: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
                executable: std::env::current_exe().ok(),
            },
            memory: self.probe.sample(),
            working_directory,
            context: context.clone(),
            error: error.clone(),
            paths,
        };

        match serde_json::to_value(&snapshot) {
            Ok(value) => self.sink.write(
                LogStream::Diagnostics,
                log::Level::Info,
                "diagnostics_collected",
                value,
            ),
            Err(err) => engine_warn!("Could not serialize diagnostics: {}", err),
        }
        snapshot
    }
}

fn probe_path(field: &str, path: &Path) -> PathProbe {
    let mut probe = PathProbe {
        field: field.to_string(),
        path: path.to_path_buf(),
        exists: false,
        is_dir: None,
        readable: None,
        size: None,
        modified: None,
        error: None,
    };

    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return probe,
        Err(err) => {
            probe.error = Some(err.to_string());
            return probe;
        }
    };

    probe.exists = true;
    probe.is_dir = Some(meta.is_dir());
    probe.size = Some(meta.len());
    match meta.modified() {
        Ok(time) => probe.modified = Some(DateTime::<Utc>::from(time)),
        Err(err) => probe.error = Some(err.to_string()),
    }
    let readable = if meta.is_dir() {
        fs::read_dir(path).map(|_| ())
    } else {
        fs::File::open(path).map(|_| ())
    };
    match readable {
        Ok(()) => probe.readable = Some(true),
        Err(err) => {
            probe.readable = Some(false);
            probe.error = Some(err.to_string());
        }
    }
    probe
}
