use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use conversion_core::{
    categorize, BackoffPolicy, ErrorCategory, ErrorContext, ErrorId, ErrorInfo, ErrorRecord,
    Severity,
};
use dashmap::DashMap;
use engine_logging::{engine_error, engine_info, engine_warn, LogSink, LogStream};
use serde::Serialize;
use serde_json::json;

use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticSnapshot, DiagnosticsCollector};
use crate::events::{EngineEvent, EventBus};
use crate::recovery::{RecoveryOutcome, RecoveryRegistry};

const ATTEMPTS_EXHAUSTED: &str = "Maximum recovery attempts reached";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerSettings {
    pub enable_recovery: bool,
    pub enable_diagnostics: bool,
    pub max_retry_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Records kept for queries; the oldest are dropped first.
    pub history_limit: usize,
}

impl From<&EngineConfig> for HandlerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            enable_recovery: config.enable_recovery,
            enable_diagnostics: config.enable_diagnostics,
            max_retry_attempts: config.max_retry_attempts,
            backoff: config.backoff,
            history_limit: config.history_limit,
        }
    }
}

/// What `handle_error` tells the caller. The original error is never
/// re-raised; `recovered == false` is for the caller to judge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandledError {
    pub error_id: ErrorId,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub recovered: bool,
    /// Recovery attempts spent on this record so far.
    pub attempts: u32,
    pub recovery: Option<RecoveryOutcome>,
    pub diagnostics: Option<DiagnosticSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub recovered_errors: u64,
    pub unrecovered_errors: u64,
    pub recovery_attempts: u64,
    pub errors_by_category: BTreeMap<String, u64>,
    pub errors_by_severity: BTreeMap<String, u64>,
}

/// Classifies failures, stores them, and drives the bound recovery strategy
/// with exponential backoff.
pub struct ConversionErrorHandler {
    settings: HandlerSettings,
    registry: RecoveryRegistry,
    diagnostics: DiagnosticsCollector,
    sink: Arc<LogSink>,
    events: Arc<EventBus>,
    records: DashMap<ErrorId, ErrorRecord>,
    /// Insertion order of `records`, oldest first.
    order: Mutex<VecDeque<ErrorId>>,
    stats: Mutex<ErrorStatistics>,
}

impl ConversionErrorHandler {
    pub fn new(
        settings: HandlerSettings,
        registry: RecoveryRegistry,
        diagnostics: DiagnosticsCollector,
        sink: Arc<LogSink>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            registry,
            diagnostics,
            sink,
            events,
            records: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ErrorStatistics::default()),
        }
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    fn stats(&self) -> MutexGuard<'_, ErrorStatistics> {
        lock(&self.stats)
    }

    fn store_new(&self, record: ErrorRecord) {
        let id = record.id;
        self.records.insert(id, record);
        let mut order = lock(&self.order);
        order.push_back(id);
        while order.len() > self.settings.history_limit {
            let Some(oldest) = order.pop_front() else {
                break;
            };
            self.records.remove(&oldest);
        }
    }

    /// Write back a record that may have been evicted meanwhile.
    fn store_update(&self, record: ErrorRecord) {
        if let Some(mut slot) = self.records.get_mut(&record.id) {
            *slot = record;
        }
    }

    /// Classify `error`, record it, and try to recover. On success `context`
    /// holds the adjusted state the caller should retry with.
    ///
    /// Callers must not handle the same logical failure twice concurrently.
    pub async fn handle_error(&self, error: ErrorInfo, context: &mut ErrorContext) -> HandledError {
        let classification = categorize(&error, context);
        let mut record = ErrorRecord::new(error.clone(), classification, context.clone());

        let diagnostics = if self.settings.enable_diagnostics {
            let snapshot = self.diagnostics.collect(&error, context);
            record.diagnostics = serde_json::to_value(&snapshot).ok();
            Some(snapshot)
        } else {
            None
        };

        self.sink.write(
            LogStream::Error,
            log::Level::Error,
            "conversion_error",
            json!({
                "error_id": record.id,
                "category": record.category,
                "severity": record.severity,
                "recoverable": record.recoverable,
                "name": error.name,
                "message": error.message,
                "stack": error.stack,
                "operation": context.operation,
                "phase": context.phase,
                "step": record.step,
                "conversion_id": record.conversion_id,
                "artifact_id": context.artifact_id,
            }),
        );

        {
            let mut stats = self.stats();
            stats.total_errors += 1;
            *stats
                .errors_by_category
                .entry(record.category.as_str().to_string())
                .or_default() += 1;
            *stats
                .errors_by_severity
                .entry(record.severity.as_str().to_string())
                .or_default() += 1;
        }
        self.store_new(record.clone());

        let recovery = if self.settings.enable_recovery && record.recoverable {
            Some(self.run_recovery(&mut record, context).await)
        } else {
            None
        };

        {
            let mut stats = self.stats();
            if record.recovered {
                stats.recovered_errors += 1;
            } else {
                stats.unrecovered_errors += 1;
            }
        }
        let handled = HandledError {
            error_id: record.id,
            category: record.category,
            severity: record.severity,
            recoverable: record.recoverable,
            recovered: record.recovered,
            attempts: record.recovery_attempts(),
            recovery,
            diagnostics,
        };
        self.store_update(record);
        handled
    }

    /// Re-enter recovery for a stored record, for a caller whose retry with
    /// the recovered context failed again. Returns `None` for an unknown id.
    /// Once the record's attempt budget is spent the result is terminal.
    pub async fn retry_recovery(
        &self,
        error_id: ErrorId,
        context: &mut ErrorContext,
    ) -> Option<HandledError> {
        let mut record = self.records.get(&error_id).map(|r| r.clone())?;
        let was_recovered = record.recovered;

        let recovery = if self.settings.enable_recovery && record.recoverable {
            Some(self.run_recovery(&mut record, context).await)
        } else {
            None
        };

        if was_recovered != record.recovered {
            let mut stats = self.stats();
            if record.recovered {
                stats.recovered_errors += 1;
                stats.unrecovered_errors = stats.unrecovered_errors.saturating_sub(1);
            } else {
                stats.unrecovered_errors += 1;
                stats.recovered_errors = stats.recovered_errors.saturating_sub(1);
            }
        }
        let handled = HandledError {
            error_id: record.id,
            category: record.category,
            severity: record.severity,
            recoverable: record.recoverable,
            recovered: record.recovered,
            attempts: record.recovery_attempts(),
            recovery,
            diagnostics: None,
        };
        self.store_update(record);
        Some(handled)
    }

    /// Attempt recovery until one attempt succeeds or the budget is spent.
    /// The backoff sleep only suspends the task handling this error.
    async fn run_recovery(
        &self,
        record: &mut ErrorRecord,
        context: &mut ErrorContext,
    ) -> RecoveryOutcome {
        let max = self.settings.max_retry_attempts;
        let mut last: Option<RecoveryOutcome> = None;

        while let Some(attempt) = record.begin_attempt(max) {
            self.stats().recovery_attempts += 1;
            let delay = self.settings.backoff.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome = match self.registry.recover(record.category, record, context).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    engine_error!(
                        "Recovery strategy for {} failed on error {}: {}",
                        record.category,
                        record.id,
                        err
                    );
                    RecoveryOutcome::strategy_failed(&err)
                }
            };

            self.sink.write(
                LogStream::Error,
                if outcome.success {
                    log::Level::Info
                } else {
                    log::Level::Warn
                },
                "recovery_attempt",
                json!({
                    "error_id": record.id,
                    "category": record.category,
                    "attempt": attempt,
                    "max_attempts": max,
                    "delay_ms": delay.as_millis() as u64,
                    "success": outcome.success,
                    "partial": outcome.partial,
                    "reason": outcome.reason,
                    "error": outcome.error,
                }),
            );

            if outcome.success {
                record.recovered = true;
                engine_info!(
                    "Recovered {} error {} on attempt {}: {}",
                    record.category,
                    record.id,
                    attempt,
                    outcome.reason
                );
                self.events.publish(EngineEvent::Recovered {
                    error_id: record.id,
                    category: record.category,
                    attempts: attempt,
                    reason: outcome.reason.clone(),
                });
                return RecoveryOutcome {
                    context: Some(context.clone()),
                    ..outcome
                };
            }
            last = Some(outcome);
        }

        record.recovered = false;
        let outcome = last.unwrap_or_else(|| RecoveryOutcome::failed(ATTEMPTS_EXHAUSTED));
        engine_warn!(
            "Recovery of {} error {} failed after {} attempt(s): {}",
            record.category,
            record.id,
            record.recovery_attempts(),
            outcome.reason
        );
        self.events.publish(EngineEvent::RecoveryFailed {
            error_id: record.id,
            category: record.category,
            attempts: record.recovery_attempts(),
            reason: outcome.reason.clone(),
        });
        outcome
    }

    pub fn get_error(&self, error_id: ErrorId) -> Option<ErrorRecord> {
        self.records.get(&error_id).map(|r| r.clone())
    }

    /// The `limit` most recent records, newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let order = lock(&self.order);
        order
            .iter()
            .rev()
            .filter_map(|id| self.get_error(*id))
            .take(limit)
            .collect()
    }

    /// Every stored record, oldest first.
    pub fn all_errors(&self) -> Vec<ErrorRecord> {
        let order = lock(&self.order);
        order.iter().filter_map(|id| self.get_error(*id)).collect()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        self.stats().clone()
    }

    /// Drop every stored record and reset the counters in one step.
    pub fn clear(&self) {
        let mut stats = self.stats();
        let mut order = lock(&self.order);
        self.records.clear();
        order.clear();
        *stats = ErrorStatistics::default();
    }
}
