use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conversion_core::{
    ErrorCategory, ErrorContext, ErrorInfo, ItemMetadata, PerformanceIssueKind, SessionInfo, Status,
    TransitionError,
};
use conversion_engine::{
    Engine, EngineConfig, EngineEvent, RecoveryRegistry, ResourceProbe, ResourceUsage,
    TrackerError, YamlValidator,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

/// Memory figure the test can move between calls.
struct DialProbe(AtomicU64);

impl DialProbe {
    fn new(bytes: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(bytes)))
    }

    fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl ResourceProbe for DialProbe {
    fn sample(&self) -> ResourceUsage {
        let bytes = self.0.load(Ordering::SeqCst);
        ResourceUsage {
            process_memory_bytes: bytes,
            total_memory_bytes: 16 * 1024 * MIB,
            used_memory_bytes: 2 * bytes,
        }
    }
}

fn engine(temp: &TempDir, probe: Arc<DialProbe>, tweak: impl FnOnce(&mut EngineConfig)) -> Engine {
    let mut config = EngineConfig::default_with_log_dir(temp.path().join("logs"));
    config.backoff.base_delay_ms = 1;
    config.backoff.max_delay_ms = 2;
    tweak(&mut config);
    let registry = RecoveryRegistry::with_defaults(&config.recovery, Arc::new(YamlValidator));
    Engine::with_parts(config, probe, registry).unwrap()
}

fn item(id: &str) -> ItemMetadata {
    ItemMetadata::new(id, "match-file", "espanso")
}

#[test]
fn statistics_follow_completed_conversions() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(100 * MIB), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso").expecting(3));
    let ids: Vec<_> = ["a.yml", "b.yml", "c.yml"]
        .into_iter()
        .map(|name| monitor.start_conversion(session, item(name)).unwrap())
        .collect();

    monitor.start_step(ids[0], "read").unwrap();
    monitor
        .complete_step(ids[0], "read", Some(json!({"bytes": 12})))
        .unwrap();
    monitor.log_step(ids[1], "read", None).unwrap();

    monitor.complete_conversion(ids[0], true, None).unwrap();
    monitor.complete_conversion(ids[1], true, None).unwrap();
    monitor.complete_conversion(ids[2], false, None).unwrap();

    let stats = monitor.statistics();
    assert_eq!(stats.total_conversions, 3);
    assert_eq!(stats.successful_conversions, 2);
    assert_eq!(stats.failed_conversions, 1);
    assert_eq!(
        stats.average_duration_ms,
        stats.total_duration_ms as f64 / 3.0
    );
    assert_eq!(stats.conversions_by_type.get("match-file"), Some(&3));
    assert_eq!(stats.conversions_by_source.get("espanso"), Some(&3));
    assert_eq!(stats.peak_memory_bytes, 100 * MIB);
    assert_eq!(stats.performance_issues, 0);

    let report = monitor.complete_session(session).unwrap();
    assert_eq!(report.summary.status, Status::Completed);
    assert_eq!(report.summary.total_conversions, 3);
    assert_eq!(report.summary.successful_conversions, 2);
    assert_eq!(report.summary.expected_items, Some(3));
    assert_eq!(report.conversions.len(), 3);
    assert!(monitor.active_sessions().is_empty());
    assert_eq!(monitor.history(10).len(), 3);
    assert_eq!(monitor.tracker().session_history().len(), 1);
}

#[test]
fn session_cannot_complete_with_active_conversions() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("a.yml")).unwrap();

    let err = monitor.complete_session(session).unwrap_err();
    assert_eq!(
        err,
        TrackerError::Transition(TransitionError::ConversionsStillActive { session, active: 1 })
    );
    assert_eq!(monitor.active_sessions().len(), 1);

    monitor.complete_conversion(id, false, None).unwrap();
    let report = monitor.complete_session(session).unwrap();
    assert_eq!(report.summary.status, Status::Failed);
}

#[test]
fn finished_conversions_accept_no_further_events() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("a.yml")).unwrap();
    monitor.start_step(id, "parse").unwrap();
    assert_eq!(
        monitor.start_step(id, "parse"),
        Err(TrackerError::Transition(TransitionError::StepAlreadyActive(
            "parse".into()
        )))
    );
    monitor.complete_conversion(id, true, None).unwrap();

    assert_eq!(
        monitor.complete_conversion(id, false, None).unwrap_err(),
        TrackerError::UnknownConversion(id)
    );
    assert_eq!(
        monitor.start_step(id, "write"),
        Err(TrackerError::UnknownConversion(id))
    );
    assert_eq!(monitor.statistics().total_conversions, 1);

    // The step still open at completion was closed as failed.
    let finished = &monitor.history(1)[0];
    assert_eq!(finished.status, Status::Completed);
    assert_eq!(finished.steps[0].status, Status::Failed);
}

#[test]
fn high_memory_conversion_raises_one_advisory_issue() {
    let temp = TempDir::new().unwrap();
    let probe = DialProbe::new(100 * MIB);
    let engine = engine(&temp, probe.clone(), |_| {});
    let events = engine.event_channel();
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("huge.yml")).unwrap();
    probe.set(600 * MIB);
    monitor.log_step(id, "parse", None).unwrap();
    probe.set(100 * MIB);

    let completed = monitor.complete_conversion(id, true, None).unwrap();
    assert!(completed.summary.success);
    assert_eq!(completed.performance_issues.len(), 1);
    let issue = &completed.performance_issues[0];
    assert_eq!(issue.kind, PerformanceIssueKind::HighMemoryUsage);
    assert_eq!(issue.observed, 600 * MIB);
    assert_eq!(issue.threshold, 512 * MIB);

    assert_eq!(monitor.statistics().performance_issues, 1);
    assert_eq!(monitor.history(1)[0].status, Status::Completed);

    let issues: Vec<_> = events
        .try_iter()
        .filter(|e| matches!(e, EngineEvent::PerformanceIssue(_)))
        .collect();
    assert_eq!(issues.len(), 1);

    let performance_log =
        fs::read_to_string(engine.sink().path(engine_logging::LogStream::Performance)).unwrap();
    assert!(performance_log.contains("\"type\":\"high_memory_usage\""));
    assert!(performance_log.contains("\"severity\":\"warning\""));
}

#[tokio::test]
async fn failed_steps_feed_error_statistics() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("a.yml")).unwrap();
    monitor.start_step(id, "transform").unwrap();

    let mut ctx = ErrorContext::new("misc", "render").with_artifact("a.yml");
    let handled = engine
        .fail_step(id, "transform", ErrorInfo::new("kaboom"), &mut ctx)
        .await
        .unwrap();
    assert_eq!(ctx.conversion_id, Some(id));

    let conversion = monitor.tracker().conversion(id).unwrap();
    assert_eq!(conversion.steps[0].status, Status::Failed);
    assert_eq!(
        conversion.steps[0].error.as_ref().unwrap().error_id,
        Some(handled.error_id)
    );
    assert_eq!(conversion.errors.len(), 1);

    monitor.complete_conversion(id, false, None).unwrap();
    let stats = monitor.statistics();
    assert_eq!(stats.errors_by_category.get("unknown"), Some(&1));
    assert_eq!(stats.failed_conversions, 1);
}

#[tokio::test]
async fn exported_report_carries_statistics_and_analysis() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(10 * MIB), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    for name in ["a.yml", "b.yml"] {
        let id = monitor.start_conversion(session, item(name)).unwrap();
        let mut ctx = ErrorContext::new("misc", "render")
            .with_conversion(id)
            .with_artifact(name)
            .with_step("render");
        for _ in 0..2 {
            engine
                .handle_conversion_error(ErrorInfo::new("kaboom"), &mut ctx)
                .await;
        }
        monitor.complete_conversion(id, false, None).unwrap();
    }
    monitor.record_sample();

    let path = temp.path().join("reports").join("report.json");
    let written = engine.export_diagnostic_report(Some(path.as_path())).unwrap();
    assert_eq!(written, path);

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(report["statistics"]["total_conversions"], 2);
    assert_eq!(report["statistics"]["errors_by_category"]["unknown"], 4);
    assert_eq!(report["error_statistics"]["total_errors"], 4);
    assert_eq!(report["recent_conversions"].as_array().unwrap().len(), 2);
    assert_eq!(report["performance_samples"].as_array().unwrap().len(), 1);
    assert_eq!(report["system"]["memory"]["process_memory_bytes"], 10 * MIB);
    assert_eq!(report["error_analysis"]["by_artifact"]["a.yml"], 2);
    assert_eq!(report["error_analysis"]["by_step"]["render"], 4);

    let recommendations: Vec<String> =
        serde_json::from_value(report["error_analysis"]["recommendations"].clone()).unwrap();
    assert!(recommendations.iter().any(|r| r.starts_with("unknown occurred 4 times")));
    assert!(recommendations.iter().any(|r| r.starts_with("artifact b.yml failed 2 times")));
    assert!(recommendations.iter().any(|r| r.starts_with("step render failed 4 times")));
}

#[test]
fn orphaned_conversions_are_reported_as_stale() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("abandoned.yml")).unwrap();
    std::thread::sleep(Duration::from_millis(5));

    let stale = monitor.stale_conversions(Duration::from_millis(1));
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].conversion_id, id);
    assert_eq!(stale[0].artifact_id, "abandoned.yml");
    assert!(monitor.stale_conversions(Duration::from_secs(3600)).is_empty());
    // Still active: nothing expires on its own.
    assert_eq!(monitor.active_conversions().len(), 1);
}

#[test]
fn sample_buffer_evicts_oldest() {
    let temp = TempDir::new().unwrap();
    let probe = DialProbe::new(0);
    let engine = engine(&temp, probe.clone(), |c| c.performance.max_samples = 3);
    let monitor = engine.monitor();

    for mib in 1..=5 {
        probe.set(mib * MIB);
        monitor.record_sample();
    }
    let samples = monitor.performance().samples(10);
    let memory: Vec<u64> = samples
        .iter()
        .map(|s| s.memory.process_memory_bytes / MIB)
        .collect();
    assert_eq!(memory, vec![3, 4, 5]);
    assert_eq!(monitor.performance().samples(1).len(), 1);
}

#[tokio::test]
async fn periodic_sampler_runs_until_stopped() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(MIB), |c| {
        c.performance.sample_interval_ms = 5
    });
    let monitor = engine.monitor();

    assert!(monitor.start_sampling());
    tokio::time::sleep(Duration::from_millis(40)).await;
    monitor.stop_sampling().await;

    let taken = monitor.performance().samples(usize::MAX).len();
    assert!(taken >= 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(monitor.performance().samples(usize::MAX).len(), taken);
}

#[test]
fn sampling_needs_a_runtime() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    assert!(!engine.monitor().start_sampling());
}

#[tokio::test]
async fn clear_resets_everything() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("a.yml")).unwrap();
    let mut ctx = ErrorContext::new("misc", "misc").with_conversion(id);
    engine
        .handle_conversion_error(ErrorInfo::new("boom"), &mut ctx)
        .await;
    monitor.complete_conversion(id, true, None).unwrap();
    monitor.start_conversion(session, item("b.yml")).unwrap();
    monitor.record_sample();

    engine.clear();

    assert_eq!(monitor.statistics(), Default::default());
    assert_eq!(engine.handler().statistics().total_errors, 0);
    assert!(monitor.history(10).is_empty());
    assert!(monitor.active_conversions().is_empty());
    assert!(monitor.active_sessions().is_empty());
    assert!(monitor.performance().samples(10).is_empty());
}

#[tokio::test]
async fn failing_an_unopened_step_records_nothing() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("a.yml")).unwrap();

    let mut ctx = ErrorContext::new("misc", "parse");
    let result = engine
        .fail_step(id, "parse", ErrorInfo::new("kaboom"), &mut ctx)
        .await;
    assert_eq!(
        result.unwrap_err(),
        TrackerError::Transition(TransitionError::NoActiveStep("parse".into()))
    );

    assert_eq!(engine.handler().statistics().total_errors, 0);
    assert!(monitor.tracker().conversion(id).unwrap().errors.is_empty());
    monitor.complete_conversion(id, false, None).unwrap();
    assert!(monitor.statistics().errors_by_category.is_empty());
}

#[tokio::test]
async fn repeated_step_failure_resumes_the_same_record() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, DialProbe::new(0), |_| {});
    let monitor = engine.monitor();

    let session = monitor.start_session(SessionInfo::new("batch", "espanso"));
    let id = monitor.start_conversion(session, item("a.yml")).unwrap();
    let mut ctx = ErrorContext::new("transform", "render");

    monitor.start_step(id, "render").unwrap();
    let first = engine
        .fail_step(id, "render", ErrorInfo::new("conversion failed"), &mut ctx)
        .await
        .unwrap();
    assert!(first.recovered);
    assert_eq!(first.attempts, 1);

    monitor.start_step(id, "render").unwrap();
    let second = engine
        .fail_step_again(
            id,
            "render",
            first.error_id,
            ErrorInfo::new("conversion failed"),
            &mut ctx,
        )
        .await
        .unwrap();
    assert_eq!(second.error_id, first.error_id);
    assert!(second.recovered);
    assert_eq!(second.attempts, 2);
    assert!(!ctx.enhancements_enabled);

    monitor.start_step(id, "render").unwrap();
    let third = engine
        .fail_step_again(
            id,
            "render",
            first.error_id,
            ErrorInfo::new("conversion failed"),
            &mut ctx,
        )
        .await
        .unwrap();
    assert!(!third.recovered);
    assert_eq!(third.attempts, 3);

    // A different failure on the same step opens a fresh record.
    monitor.start_step(id, "render").unwrap();
    let other = engine
        .fail_step_again(
            id,
            "render",
            first.error_id,
            ErrorInfo::new("syntax error"),
            &mut ctx,
        )
        .await
        .unwrap();
    assert_ne!(other.error_id, first.error_id);
    assert_eq!(other.category, ErrorCategory::InvalidSyntax);

    let stats = engine.handler().statistics();
    assert_eq!(stats.total_errors, 2);
    assert_eq!(stats.recovery_attempts, 6);
    assert_eq!(stats.unrecovered_errors, 2);
    assert_eq!(stats.recovered_errors, 0);

    let conversion = monitor.tracker().conversion(id).unwrap();
    assert_eq!(conversion.errors.len(), 2);
    assert_eq!(conversion.steps.len(), 4);
    assert!(conversion.steps.iter().all(|s| s.status == Status::Failed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_conversions_keep_exact_totals() {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(engine(&temp, DialProbe::new(MIB), |_| {}));
    let session = engine
        .monitor()
        .start_session(SessionInfo::new("batch", "espanso").expecting(200));

    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let monitor = engine.monitor();
                let id = monitor
                    .start_conversion(session, item(&format!("{i}.yml")))
                    .unwrap();
                monitor.start_step(id, "render").unwrap();
                let success = i % 2 == 0;
                if success {
                    monitor.complete_step(id, "render", None).unwrap();
                } else {
                    let mut ctx = ErrorContext::new("misc", "render");
                    engine
                        .fail_step(id, "render", ErrorInfo::new("kaboom"), &mut ctx)
                        .await
                        .unwrap();
                }
                monitor.complete_conversion(id, success, None).unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let stats = engine.monitor().statistics();
    assert_eq!(stats.total_conversions, 200);
    assert_eq!(stats.successful_conversions, 100);
    assert_eq!(stats.failed_conversions, 100);
    assert_eq!(stats.errors_by_category.get("unknown"), Some(&100));
    assert_eq!(engine.handler().statistics().total_errors, 100);
    assert!(engine.monitor().active_conversions().is_empty());

    let report = engine.monitor().complete_session(session).unwrap();
    assert_eq!(report.summary.total_conversions, 200);
    assert_eq!(report.summary.failed_conversions, 100);
}
