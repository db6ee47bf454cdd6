use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conversion_core::{
    Conversion, ConversionId, ConversionSummary, ErrorRecord, ItemMetadata, Session, SessionId,
    SessionInfo, SessionSummary, Step, StepError, TransitionError,
};
use dashmap::DashMap;
use engine_logging::{engine_debug, engine_warn, LogSink, LogStream};
use serde::Serialize;
use serde_json::{json, Value};

use crate::probe::ResourceProbe;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unknown or inactive session {0}")]
    UnknownSession(SessionId),
    #[error("unknown or inactive conversion {0}")]
    UnknownConversion(ConversionId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Produced once per session, when it completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub summary: SessionSummary,
    pub conversions: Vec<ConversionSummary>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// An active conversion nobody has completed for a while.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleConversion {
    pub conversion_id: ConversionId,
    pub session_id: SessionId,
    pub artifact_id: String,
    pub started_at: DateTime<Utc>,
    pub age_ms: u64,
}

/// Live sessions and conversions plus bounded history.
///
/// The maps are sharded; each record is only mutated by the task that owns
/// the conversion, so no guard is held across calls into another map.
pub struct ConversionTracker {
    sink: Arc<LogSink>,
    probe: Arc<dyn ResourceProbe>,
    history_limit: usize,
    sessions: DashMap<SessionId, Session>,
    conversions: DashMap<ConversionId, Conversion>,
    history: Mutex<VecDeque<Conversion>>,
    session_history: Mutex<VecDeque<SessionReport>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConversionTracker {
    pub fn new(sink: Arc<LogSink>, probe: Arc<dyn ResourceProbe>, history_limit: usize) -> Self {
        Self {
            sink,
            probe,
            history_limit,
            sessions: DashMap::new(),
            conversions: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            session_history: Mutex::new(VecDeque::new()),
        }
    }

    fn memory(&self) -> u64 {
        self.probe.sample().process_memory_bytes
    }

    fn log(&self, level: log::Level, event: &str, fields: Value) {
        self.sink.write(LogStream::Conversion, level, event, fields);
    }

    pub fn start_session(&self, info: SessionInfo) -> SessionId {
        let session = Session::start(info, self.memory(), Utc::now());
        let id = session.id;
        self.log(
            log::Level::Info,
            "session_started",
            json!({
                "session_id": id,
                "type": session.info.kind,
                "source": session.info.source,
                "expected_items": session.info.expected_items,
            }),
        );
        self.sessions.insert(id, session);
        id
    }

    pub fn start_conversion(
        &self,
        session_id: SessionId,
        item: ItemMetadata,
    ) -> Result<ConversionId, TrackerError> {
        let conversion = Conversion::start(session_id, item, self.memory(), Utc::now());
        {
            let mut session = self
                .sessions
                .get_mut(&session_id)
                .ok_or(TrackerError::UnknownSession(session_id))?;
            session.register_conversion(conversion.id)?;
        }
        let id = conversion.id;
        self.log(
            log::Level::Info,
            "conversion_started",
            json!({
                "conversion_id": id,
                "session_id": session_id,
                "artifact_id": conversion.item.artifact_id,
                "type": conversion.item.declared_type,
                "source": conversion.item.source,
                "grouping": conversion.item.grouping,
            }),
        );
        self.conversions.insert(id, conversion);
        Ok(id)
    }

    fn with_conversion<R>(
        &self,
        id: ConversionId,
        f: impl FnOnce(&mut Conversion) -> Result<R, TransitionError>,
    ) -> Result<R, TrackerError> {
        let mut conversion = self
            .conversions
            .get_mut(&id)
            .ok_or(TrackerError::UnknownConversion(id))?;
        Ok(f(&mut conversion)?)
    }

    pub fn check_step_active(&self, id: ConversionId, name: &str) -> Result<(), TrackerError> {
        let conversion = self
            .conversions
            .get(&id)
            .ok_or(TrackerError::UnknownConversion(id))?;
        Ok(conversion.check_step_active(name)?)
    }

    pub fn start_step(&self, id: ConversionId, name: &str) -> Result<(), TrackerError> {
        self.with_conversion(id, |c| c.start_step(name, Utc::now()))?;
        engine_debug!("Conversion {} started step {}", id, name);
        Ok(())
    }

    pub fn complete_step(
        &self,
        id: ConversionId,
        name: &str,
        result: Option<Value>,
    ) -> Result<Step, TrackerError> {
        let memory = self.memory();
        let step = self.with_conversion(id, |c| {
            c.complete_step(name, result, Some(memory), Utc::now())
                .cloned()
        })?;
        self.log_step_event("step_completed", id, &step);
        Ok(step)
    }

    pub fn fail_step(
        &self,
        id: ConversionId,
        name: &str,
        error: StepError,
    ) -> Result<Step, TrackerError> {
        let memory = self.memory();
        let step = self.with_conversion(id, |c| {
            c.fail_step(name, error, Some(memory), Utc::now()).cloned()
        })?;
        self.log_step_event("step_failed", id, &step);
        Ok(step)
    }

    /// Record a step that has already run to completion.
    pub fn log_step(
        &self,
        id: ConversionId,
        name: &str,
        result: Option<Value>,
    ) -> Result<Step, TrackerError> {
        let memory = self.memory();
        let step = self.with_conversion(id, |c| {
            c.log_step(name, result, Some(memory), Utc::now()).cloned()
        })?;
        self.log_step_event("step_completed", id, &step);
        Ok(step)
    }

    fn log_step_event(&self, event: &str, id: ConversionId, step: &Step) {
        let level = if step.error.is_some() {
            log::Level::Warn
        } else {
            log::Level::Info
        };
        self.log(
            level,
            event,
            json!({
                "conversion_id": id,
                "step": step.name,
                "duration_ms": step.duration_ms,
                "memory_bytes": step.memory_bytes,
                "result": step.result,
                "error": step.error,
            }),
        );
    }

    pub fn attach_error(&self, id: ConversionId, record: ErrorRecord) -> Result<(), TrackerError> {
        self.with_conversion(id, |c| {
            c.attach_error(record);
            Ok(())
        })
    }

    /// Finalize a conversion, move it out of the active map into its
    /// session and the history.
    pub fn complete_conversion(
        &self,
        id: ConversionId,
        success: bool,
        result: Option<Value>,
    ) -> Result<ConversionSummary, TrackerError> {
        let memory = self.memory();
        self.with_conversion(id, |c| c.finish(success, result, memory, Utc::now()))?;
        let (_, conversion) = self
            .conversions
            .remove(&id)
            .ok_or(TrackerError::UnknownConversion(id))?;
        let summary = conversion.summary();

        self.log(
            if success {
                log::Level::Info
            } else {
                log::Level::Warn
            },
            "conversion_completed",
            json!({
                "conversion_id": id,
                "session_id": summary.session_id,
                "artifact_id": summary.artifact_id,
                "status": conversion.status,
                "duration_ms": summary.duration_ms,
                "peak_memory_bytes": summary.peak_memory_bytes,
                "steps": conversion.steps.len(),
                "errors": conversion.errors.len(),
            }),
        );

        {
            let mut history = lock(&self.history);
            history.push_back(conversion.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        match self.sessions.get_mut(&summary.session_id) {
            Some(mut session) => session.absorb_conversion(conversion)?,
            None => engine_warn!(
                "Conversion {} completed after its session {} was discarded",
                id,
                summary.session_id
            ),
        }
        Ok(summary)
    }

    pub fn record_session_error(
        &self,
        id: SessionId,
        message: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(TrackerError::UnknownSession(id))?;
        session.errors.push(message.into());
        Ok(())
    }

    pub fn record_session_warning(
        &self,
        id: SessionId,
        message: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(TrackerError::UnknownSession(id))?;
        session.warnings.push(message.into());
        Ok(())
    }

    /// Aggregate and close a session. Refused while any of its conversions
    /// is still active; on success the session leaves the live map.
    pub fn complete_session(&self, id: SessionId) -> Result<SessionReport, TrackerError> {
        let memory = self.memory();
        let report = {
            let mut session = self
                .sessions
                .get_mut(&id)
                .ok_or(TrackerError::UnknownSession(id))?;
            let summary = session.complete(memory, Utc::now())?;
            SessionReport {
                summary,
                conversions: session.conversions.values().map(Conversion::summary).collect(),
                errors: session.errors.clone(),
                warnings: session.warnings.clone(),
            }
        };
        self.sessions.remove(&id);

        self.log(
            log::Level::Info,
            "session_completed",
            serde_json::to_value(&report.summary).unwrap_or(Value::Null),
        );
        let mut history = lock(&self.session_history);
        history.push_back(report.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(report)
    }

    pub fn conversion(&self, id: ConversionId) -> Option<Conversion> {
        self.conversions.get(&id).map(|c| c.clone())
    }

    pub fn session(&self, id: SessionId) -> Option<SessionSummary> {
        self.sessions.get(&id).map(|s| s.summary())
    }

    pub fn active_conversions(&self) -> Vec<Conversion> {
        let mut active: Vec<Conversion> = self.conversions.iter().map(|c| c.clone()).collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn active_sessions(&self) -> Vec<SessionSummary> {
        let mut active: Vec<SessionSummary> = self.sessions.iter().map(|s| s.summary()).collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// `(active conversions, active sessions)`.
    pub fn active_counts(&self) -> (usize, usize) {
        (self.conversions.len(), self.sessions.len())
    }

    /// Up to `limit` finished conversions, newest first.
    pub fn history(&self, limit: usize) -> Vec<Conversion> {
        lock(&self.history)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn session_history(&self) -> Vec<SessionReport> {
        lock(&self.session_history).iter().cloned().collect()
    }

    /// Active conversions started more than `older_than` ago. Nothing is
    /// expired; abandoned conversions stay active until completed or cleared.
    pub fn stale_conversions(&self, older_than: Duration) -> Vec<StaleConversion> {
        let now = Utc::now();
        let threshold = older_than.as_millis() as u64;
        let mut stale: Vec<StaleConversion> = self
            .conversions
            .iter()
            .filter_map(|c| {
                let age_ms = (now - c.started_at).num_milliseconds().max(0) as u64;
                (age_ms > threshold).then(|| StaleConversion {
                    conversion_id: c.id,
                    session_id: c.session_id,
                    artifact_id: c.item.artifact_id.clone(),
                    started_at: c.started_at,
                    age_ms,
                })
            })
            .collect();
        stale.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        stale
    }

    /// Forget every session, conversion and history entry.
    pub fn clear(&self) {
        self.conversions.clear();
        self.sessions.clear();
        lock(&self.history).clear();
        lock(&self.session_history).clear();
    }
}
