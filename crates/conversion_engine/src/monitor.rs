use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use conversion_core::{
    Conversion, ConversionId, ConversionSummary, ErrorRecord, ItemMetadata, PerformanceIssue,
    SessionId, SessionInfo, SessionSummary, StatisticsSnapshot, Step,
};
use engine_logging::{engine_info, LogSink, LogStream};
use serde_json::{json, Value};

use crate::config::{EngineConfig, ReportSettings};
use crate::events::{EngineEvent, EventBus};
use crate::handler::ConversionErrorHandler;
use crate::performance::{spawn_sampler, PerformanceMonitor, PerformanceSample, SamplerHandle};
use crate::probe::{ResourceProbe, SystemInfo};
use crate::report::{analyze_errors, export_report, DiagnosticReport, ReportError};
use crate::tracker::{ConversionTracker, SessionReport, StaleConversion, TrackerError};

/// Outcome of closing a conversion: its summary and any advisory breaches.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedConversion {
    pub summary: ConversionSummary,
    pub performance_issues: Vec<PerformanceIssue>,
}

/// Run-level façade: tracking, cumulative statistics, sampling and reports.
pub struct ConversionMonitor {
    tracker: Arc<ConversionTracker>,
    performance: Arc<PerformanceMonitor>,
    statistics: Mutex<StatisticsSnapshot>,
    events: Arc<EventBus>,
    sink: Arc<LogSink>,
    probe: Arc<dyn ResourceProbe>,
    report: ReportSettings,
    sample_interval: Duration,
    sampler: Mutex<Option<SamplerHandle>>,
    started: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConversionMonitor {
    pub fn new(
        config: &EngineConfig,
        sink: Arc<LogSink>,
        probe: Arc<dyn ResourceProbe>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            tracker: Arc::new(ConversionTracker::new(
                sink.clone(),
                probe.clone(),
                config.history_limit,
            )),
            performance: Arc::new(PerformanceMonitor::new(
                &config.performance,
                probe.clone(),
                sink.clone(),
            )),
            statistics: Mutex::new(StatisticsSnapshot::default()),
            events,
            sink,
            probe,
            report: config.report.clone(),
            sample_interval: config.performance.sample_interval(),
            sampler: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn tracker(&self) -> &ConversionTracker {
        &self.tracker
    }

    pub fn performance(&self) -> &PerformanceMonitor {
        &self.performance
    }

    pub fn start_session(&self, info: SessionInfo) -> SessionId {
        self.tracker.start_session(info)
    }

    pub fn start_conversion(
        &self,
        session_id: SessionId,
        item: ItemMetadata,
    ) -> Result<ConversionId, TrackerError> {
        self.tracker.start_conversion(session_id, item)
    }

    pub fn start_step(&self, id: ConversionId, name: &str) -> Result<(), TrackerError> {
        self.tracker.start_step(id, name)
    }

    pub fn complete_step(
        &self,
        id: ConversionId,
        name: &str,
        result: Option<Value>,
    ) -> Result<Step, TrackerError> {
        self.tracker.complete_step(id, name, result)
    }

    pub fn log_step(
        &self,
        id: ConversionId,
        name: &str,
        result: Option<Value>,
    ) -> Result<Step, TrackerError> {
        self.tracker.log_step(id, name, result)
    }

    /// Close a conversion, then fold it into the statistics and check it
    /// against the performance thresholds.
    pub fn complete_conversion(
        &self,
        id: ConversionId,
        success: bool,
        result: Option<Value>,
    ) -> Result<CompletedConversion, TrackerError> {
        let summary = self.tracker.complete_conversion(id, success, result)?;
        let issues = self.performance.check_conversion(&summary);
        {
            let mut statistics = lock(&self.statistics);
            statistics.record_conversion(&summary);
            statistics.record_performance_issues(issues.len() as u64);
        }
        for issue in &issues {
            self.events.publish(EngineEvent::PerformanceIssue(issue.clone()));
        }
        self.events
            .publish(EngineEvent::ConversionCompleted(summary.clone()));
        Ok(CompletedConversion {
            summary,
            performance_issues: issues,
        })
    }

    pub fn complete_session(&self, id: SessionId) -> Result<SessionReport, TrackerError> {
        let report = self.tracker.complete_session(id)?;
        engine_info!(
            "Session {} finished: {}/{} conversions succeeded",
            id,
            report.summary.successful_conversions,
            report.summary.total_conversions
        );
        self.events
            .publish(EngineEvent::SessionCompleted(report.summary.clone()));
        Ok(report)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        lock(&self.statistics).clone()
    }

    pub fn active_conversions(&self) -> Vec<Conversion> {
        self.tracker.active_conversions()
    }

    pub fn active_sessions(&self) -> Vec<SessionSummary> {
        self.tracker.active_sessions()
    }

    pub fn history(&self, limit: usize) -> Vec<Conversion> {
        self.tracker.history(limit)
    }

    pub fn stale_conversions(&self, older_than: Duration) -> Vec<StaleConversion> {
        self.tracker.stale_conversions(older_than)
    }

    /// Take one resource sample now, outside the periodic schedule.
    pub fn record_sample(&self) -> PerformanceSample {
        let (conversions, sessions) = self.tracker.active_counts();
        self.performance.record_sample(conversions, sessions)
    }

    /// Start periodic sampling on the current runtime. Returns whether a
    /// sampler is running afterwards.
    pub fn start_sampling(&self) -> bool {
        let mut slot = lock(&self.sampler);
        if slot.as_ref().is_some_and(SamplerHandle::is_running) {
            return true;
        }
        let tracker = self.tracker.clone();
        *slot = spawn_sampler(self.performance.clone(), self.sample_interval, move || {
            tracker.active_counts()
        });
        slot.is_some()
    }

    pub async fn stop_sampling(&self) {
        let handle = lock(&self.sampler).take();
        if let Some(mut handle) = handle {
            handle.stop().await;
        }
    }

    /// Build a report. With a handler, its stored records feed the error
    /// analysis; otherwise the errors attached to tracked conversions do.
    pub fn generate_report(&self, handler: Option<&ConversionErrorHandler>) -> DiagnosticReport {
        let statistics = self.statistics();
        let (active_conversions, active_sessions) = self.tracker.active_counts();

        let error_analysis = self.report.include_error_analysis.then(|| {
            let records: Vec<ErrorRecord> = match handler {
                Some(handler) => handler.all_errors(),
                None => self
                    .tracker
                    .history(usize::MAX)
                    .into_iter()
                    .chain(self.tracker.active_conversions())
                    .flat_map(|c| c.errors)
                    .collect(),
            };
            analyze_errors(&records, statistics.performance_issues)
        });
        let performance_samples = (self.report.performance_samples > 0)
            .then(|| self.performance.samples(self.report.performance_samples));

        DiagnosticReport {
            generated_at: Utc::now(),
            success_rate: statistics.success_rate(),
            statistics,
            error_statistics: handler.map(ConversionErrorHandler::statistics),
            active_sessions,
            active_conversions,
            stale_conversions: self.tracker.stale_conversions(self.report.stale_after()),
            recent_conversions: self.tracker.history(self.report.recent_conversions),
            system: SystemInfo::collect(self.probe.as_ref(), self.started),
            performance_samples,
            error_analysis,
        }
    }

    pub fn export_report(
        &self,
        path: &Path,
        handler: Option<&ConversionErrorHandler>,
    ) -> Result<PathBuf, ReportError> {
        let report = self.generate_report(handler);
        let written = export_report(&report, path)?;
        self.sink.write(
            LogStream::Diagnostics,
            log::Level::Info,
            "report_exported",
            json!({
                "path": written.display().to_string(),
                "total_conversions": report.statistics.total_conversions,
            }),
        );
        engine_info!("Exported diagnostic report to {:?}", written);
        Ok(written)
    }

    /// Reset statistics, tracking state and samples together.
    pub fn clear(&self) {
        let mut statistics = lock(&self.statistics);
        self.tracker.clear();
        self.performance.clear();
        *statistics = StatisticsSnapshot::default();
    }
}
