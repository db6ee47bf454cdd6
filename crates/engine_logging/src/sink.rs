use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// One of the four independent telemetry streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    /// Session and conversion lifecycle events.
    Conversion,
    /// Resource samples and threshold breaches.
    Performance,
    /// Classified errors and recovery outcomes.
    Error,
    /// Diagnostic snapshots taken at failure time.
    Diagnostics,
}

impl LogStream {
    /// Every stream, in on-disk order.
    pub const ALL: [LogStream; 4] = [
        LogStream::Conversion,
        LogStream::Performance,
        LogStream::Error,
        LogStream::Diagnostics,
    ];

    /// File name of the active log for this stream.
    pub fn file_name(self) -> &'static str {
        match self {
            LogStream::Conversion => "conversion.log",
            LogStream::Performance => "performance.log",
            LogStream::Error => "errors.log",
            LogStream::Diagnostics => "diagnostics.log",
        }
    }

    fn index(self) -> usize {
        match self {
            LogStream::Conversion => 0,
            LogStream::Performance => 1,
            LogStream::Error => 2,
            LogStream::Diagnostics => 3,
        }
    }
}

/// Size-based rotation settings shared by all streams of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the active file is larger than this many bytes.
    pub max_size_bytes: u64,
    /// Number of numbered backups (`.1` ..= `.N`) to keep.
    pub max_files: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

struct StreamWriter {
    path: PathBuf,
    // Guards the size-check, rotate and append sequence for this stream only.
    lock: Mutex<()>,
    error_reported: AtomicBool,
}

/// Append-only NDJSON writer for the conversion, performance, error and
/// diagnostics streams.
///
/// Every record carries an RFC 3339 `timestamp`, a lowercase `level` and an
/// `event` name. Write failures are reported once per stream through
/// `engine_error!` and silently dropped afterwards.
pub struct LogSink {
    dir: PathBuf,
    policy: RotationPolicy,
    streams: [StreamWriter; 4],
}

impl LogSink {
    /// Create a sink writing into `dir`. The directory is created if missing.
    pub fn new(dir: impl Into<PathBuf>, policy: RotationPolicy) -> Self {
        let dir = dir.into();
        if let Err(err) = fs::create_dir_all(&dir) {
            crate::engine_warn!("Could not create log directory {:?}: {}", dir, err);
        }
        let streams = LogStream::ALL.map(|stream| StreamWriter {
            path: dir.join(stream.file_name()),
            lock: Mutex::new(()),
            error_reported: AtomicBool::new(false),
        });
        Self {
            dir,
            policy,
            streams,
        }
    }

    /// Directory holding the stream files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the active file for `stream`.
    pub fn path(&self, stream: LogStream) -> PathBuf {
        self.streams[stream.index()].path.clone()
    }

    /// Existing numbered backups for `stream`, lowest suffix first.
    pub fn backups(&self, stream: LogStream) -> Vec<PathBuf> {
        let active = &self.streams[stream.index()].path;
        (1..=self.policy.max_files)
            .map(|n| backup_path(active, n))
            .filter(|p| p.exists())
            .collect()
    }

    /// True once a write failure on `stream` has been reported.
    pub fn write_error_reported(&self, stream: LogStream) -> bool {
        self.streams[stream.index()]
            .error_reported
            .load(Ordering::Relaxed)
    }

    /// Append one record. Object `fields` are merged into the record,
    /// anything else is stored under `data`.
    pub fn write(&self, stream: LogStream, level: log::Level, event: &str, fields: Value) {
        let line = match render_record(level, event, fields) {
            Ok(line) => line,
            Err(err) => {
                self.report_failure(stream, &io::Error::other(err));
                return;
            }
        };

        let writer = &self.streams[stream.index()];
        let _guard = match writer.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = self.append(&writer.path, &line) {
            self.report_failure(stream, &err);
        }
    }

    fn append(&self, path: &Path, line: &str) -> io::Result<()> {
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > self.policy.max_size_bytes {
                rotate(path, self.policy.max_files)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())
    }

    fn report_failure(&self, stream: LogStream, err: &io::Error) {
        let writer = &self.streams[stream.index()];
        if !writer.error_reported.swap(true, Ordering::SeqCst) {
            crate::engine_error!(
                "Failed to write {} (further errors suppressed): {}",
                stream.file_name(),
                err
            );
        }
    }
}

fn render_record(level: log::Level, event: &str, fields: Value) -> serde_json::Result<String> {
    let mut record = Map::new();
    record.insert(
        "timestamp".into(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    record.insert(
        "level".into(),
        Value::String(level.as_str().to_ascii_lowercase()),
    );
    record.insert("event".into(), Value::String(event.to_string()));
    match fields {
        Value::Object(map) => {
            for (key, value) in map {
                record.entry(key).or_insert(value);
            }
        }
        Value::Null => {}
        other => {
            record.insert("data".into(), other);
        }
    }
    let mut line = serde_json::to_string(&Value::Object(record))?;
    line.push('\n');
    Ok(line)
}

fn backup_path(active: &Path, n: usize) -> PathBuf {
    let mut name = active.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `.1..N-1` up by one, drop `.N`, move the active file to `.1` and
/// start a fresh empty file.
fn rotate(active: &Path, max_files: usize) -> io::Result<()> {
    if max_files == 0 {
        File::create(active)?;
        return Ok(());
    }
    let oldest = backup_path(active, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let from = backup_path(active, n);
        if from.exists() {
            fs::rename(&from, backup_path(active, n + 1))?;
        }
    }
    fs::rename(active, backup_path(active, 1))?;
    File::create(active)?;
    Ok(())
}
