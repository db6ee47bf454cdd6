use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::ErrorRecord;
use crate::statistics::ConversionSummary;
use crate::{ConversionId, ErrorId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("conversion {0} is already {1:?}")]
    ConversionFinished(ConversionId, Status),
    #[error("session {0} is already {1:?}")]
    SessionFinished(SessionId, Status),
    #[error("step '{0}' is already active")]
    StepAlreadyActive(String),
    #[error("no active step named '{0}'")]
    NoActiveStep(String),
    #[error("session {session} still has {active} active conversion(s)")]
    ConversionsStillActive { session: SessionId, active: usize },
    #[error("conversion {conversion} does not belong to session {session}")]
    ForeignConversion {
        session: SessionId,
        conversion: ConversionId,
    },
}

/// Caller-declared metadata for the artifact being converted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub artifact_id: String,
    pub declared_type: String,
    pub source: String,
    /// Optional grouping such as an expansion namespace.
    pub grouping: Option<String>,
}

impl ItemMetadata {
    pub fn new(
        artifact_id: impl Into<String>,
        declared_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            declared_type: declared_type.into(),
            source: source.into(),
            grouping: None,
        }
    }

    pub fn with_grouping(mut self, grouping: impl Into<String>) -> Self {
        self.grouping = Some(grouping.into());
        self
    }
}

/// Memory figures observed over the lifetime of a record, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub start: u64,
    pub peak: u64,
    pub end: Option<u64>,
}

impl ResourceSnapshot {
    pub fn starting_at(memory: u64) -> Self {
        Self {
            start: memory,
            peak: memory,
            end: None,
        }
    }

    pub fn observe(&mut self, memory: u64) {
        self.peak = self.peak.max(memory);
    }

    pub fn finish(&mut self, memory: u64) {
        self.observe(memory);
        self.end = Some(memory);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub error_id: Option<ErrorId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub memory_bytes: Option<u64>,
    pub error: Option<StepError>,
}

impl Step {
    fn start(name: String, now: DateTime<Utc>) -> Self {
        Self {
            name,
            status: Status::Active,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            result: None,
            memory_bytes: None,
            error: None,
        }
    }

    fn close(&mut self, status: Status, memory: Option<u64>, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some(elapsed_ms(self.started_at, now));
        self.memory_bytes = memory;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub id: ConversionId,
    pub session_id: SessionId,
    pub item: ItemMetadata,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub steps: Vec<Step>,
    pub resources: ResourceSnapshot,
    pub errors: Vec<ErrorRecord>,
    pub result: Option<serde_json::Value>,
}

impl Conversion {
    pub fn start(session_id: SessionId, item: ItemMetadata, memory: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            item,
            status: Status::Active,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            steps: Vec::new(),
            resources: ResourceSnapshot::starting_at(memory),
            errors: Vec::new(),
            result: None,
        }
    }

    fn ensure_active(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::ConversionFinished(self.id, self.status));
        }
        Ok(())
    }

    fn active_step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps
            .iter_mut()
            .rev()
            .find(|s| s.name == name && s.status == Status::Active)
    }

    /// `Ok` when `name` is an open step that `fail_step` or `complete_step`
    /// would accept.
    pub fn check_step_active(&self, name: &str) -> Result<(), TransitionError> {
        self.ensure_active()?;
        if self.active_steps().any(|s| s.name == name) {
            Ok(())
        } else {
            Err(TransitionError::NoActiveStep(name.to_string()))
        }
    }

    pub fn active_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.status == Status::Active)
    }

    /// Open a named step. Only one step of a given name may be active.
    pub fn start_step(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_active()?;
        if self.active_step_mut(name).is_some() {
            return Err(TransitionError::StepAlreadyActive(name.to_string()));
        }
        self.steps.push(Step::start(name.to_string(), now));
        Ok(())
    }

    pub fn complete_step(
        &mut self,
        name: &str,
        result: Option<serde_json::Value>,
        memory: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<&Step, TransitionError> {
        self.ensure_active()?;
        if let Some(m) = memory {
            self.resources.observe(m);
        }
        let step = self
            .active_step_mut(name)
            .ok_or_else(|| TransitionError::NoActiveStep(name.to_string()))?;
        step.result = result;
        step.close(Status::Completed, memory, now);
        Ok(step)
    }

    pub fn fail_step(
        &mut self,
        name: &str,
        error: StepError,
        memory: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<&Step, TransitionError> {
        self.ensure_active()?;
        if let Some(m) = memory {
            self.resources.observe(m);
        }
        let step = self
            .active_step_mut(name)
            .ok_or_else(|| TransitionError::NoActiveStep(name.to_string()))?;
        step.error = Some(error);
        step.close(Status::Failed, memory, now);
        Ok(step)
    }

    /// Record a step that started and finished in one call.
    pub fn log_step(
        &mut self,
        name: &str,
        result: Option<serde_json::Value>,
        memory: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<&Step, TransitionError> {
        self.start_step(name, now)?;
        self.complete_step(name, result, memory, now)
    }

    pub fn observe_memory(&mut self, memory: u64) {
        self.resources.observe(memory);
    }

    pub fn attach_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    /// Move to `Completed` or `Failed`. Steps still open are closed as failed.
    pub fn finish(
        &mut self,
        success: bool,
        result: Option<serde_json::Value>,
        memory: u64,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_active()?;
        for step in self.steps.iter_mut().filter(|s| s.status == Status::Active) {
            step.error = Some(StepError {
                error_id: None,
                message: "conversion finished while step was active".to_string(),
            });
            step.close(Status::Failed, None, now);
        }
        self.status = if success {
            Status::Completed
        } else {
            Status::Failed
        };
        self.result = result;
        self.ended_at = Some(now);
        self.duration_ms = Some(elapsed_ms(self.started_at, now));
        self.resources.finish(memory);
        Ok(())
    }

    pub fn summary(&self) -> ConversionSummary {
        ConversionSummary {
            conversion_id: self.id,
            session_id: self.session_id,
            artifact_id: self.item.artifact_id.clone(),
            declared_type: self.item.declared_type.clone(),
            source: self.item.source.clone(),
            success: self.status == Status::Completed,
            duration_ms: self.duration_ms.unwrap_or(0),
            peak_memory_bytes: self.resources.peak,
            error_categories: self.errors.iter().map(|e| e.category).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub expected_items: Option<usize>,
}

impl SessionInfo {
    pub fn new(kind: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            expected_items: None,
        }
    }

    pub fn expecting(mut self, items: usize) -> Self {
        self.expected_items = Some(items);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub info: SessionInfo,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub resources: ResourceSnapshot,
    active: BTreeSet<ConversionId>,
    pub conversions: BTreeMap<ConversionId, Conversion>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Session {
    pub fn start(info: SessionInfo, memory: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            info,
            status: Status::Active,
            started_at: now,
            ended_at: None,
            resources: ResourceSnapshot::starting_at(memory),
            active: BTreeSet::new(),
            conversions: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn ensure_active(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::SessionFinished(self.id, self.status));
        }
        Ok(())
    }

    pub fn active_conversions(&self) -> usize {
        self.active.len()
    }

    pub fn register_conversion(&mut self, id: ConversionId) -> Result<(), TransitionError> {
        self.ensure_active()?;
        self.active.insert(id);
        Ok(())
    }

    /// Take ownership of a finished conversion and roll its peak memory forward.
    pub fn absorb_conversion(&mut self, conversion: Conversion) -> Result<(), TransitionError> {
        if !self.active.remove(&conversion.id) {
            return Err(TransitionError::ForeignConversion {
                session: self.id,
                conversion: conversion.id,
            });
        }
        self.resources.observe(conversion.resources.peak);
        self.conversions.insert(conversion.id, conversion);
        Ok(())
    }

    /// Finalize the session. Refused while any child conversion is active.
    pub fn complete(
        &mut self,
        memory: u64,
        now: DateTime<Utc>,
    ) -> Result<SessionSummary, TransitionError> {
        self.ensure_active()?;
        if !self.active.is_empty() {
            return Err(TransitionError::ConversionsStillActive {
                session: self.id,
                active: self.active.len(),
            });
        }
        self.status = if !self.conversions.is_empty() && self.all_failed() {
            Status::Failed
        } else {
            Status::Completed
        };
        self.ended_at = Some(now);
        self.resources.finish(memory);
        Ok(self.summary())
    }

    fn all_failed(&self) -> bool {
        self.conversions.values().all(|c| c.status == Status::Failed)
    }

    pub fn summary(&self) -> SessionSummary {
        let total = self.conversions.len() as u64;
        let successful = self
            .conversions
            .values()
            .filter(|c| c.status == Status::Completed)
            .count() as u64;
        let total_duration_ms: u64 = self
            .conversions
            .values()
            .filter_map(|c| c.duration_ms)
            .sum();
        let mut errors_by_category: BTreeMap<String, u64> = BTreeMap::new();
        for record in self.conversions.values().flat_map(|c| c.errors.iter()) {
            *errors_by_category
                .entry(record.category.as_str().to_string())
                .or_default() += 1;
        }
        SessionSummary {
            session_id: self.id,
            kind: self.info.kind.clone(),
            source: self.info.source.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.ended_at.map(|end| elapsed_ms(self.started_at, end)),
            expected_items: self.info.expected_items,
            total_conversions: total,
            successful_conversions: successful,
            failed_conversions: total - successful,
            total_duration_ms,
            average_duration_ms: if total == 0 {
                0.0
            } else {
                total_duration_ms as f64 / total as f64
            },
            peak_memory_bytes: self.resources.peak,
            errors_by_category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub expected_items: Option<usize>,
    pub total_conversions: u64,
    pub successful_conversions: u64,
    pub failed_conversions: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub peak_memory_bytes: u64,
    pub errors_by_category: BTreeMap<String, u64>,
}

pub(crate) fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}
