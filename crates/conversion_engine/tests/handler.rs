use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use conversion_core::{BackoffPolicy, ErrorCategory, ErrorContext, ErrorInfo, ErrorRecord};
use conversion_engine::{
    Engine, EngineConfig, EngineEvent, RecoveryError, RecoveryOutcome, RecoveryRegistry,
    RecoveryStrategy, ResourceProbe, ResourceUsage, YamlValidator,
};
use engine_logging::LogStream;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct FixedProbe(u64);

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceUsage {
        ResourceUsage {
            process_memory_bytes: self.0,
            total_memory_bytes: 8 * self.0,
            used_memory_bytes: 4 * self.0,
        }
    }
}

/// Always fails, counting how often it ran.
struct StubbornStrategy {
    calls: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl RecoveryStrategy for StubbornStrategy {
    fn name(&self) -> &'static str {
        "stubborn"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        _context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RecoveryOutcome::failed("still broken"))
    }
}

struct ExplodingStrategy;

#[async_trait::async_trait]
impl RecoveryStrategy for ExplodingStrategy {
    fn name(&self) -> &'static str {
        "exploding"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        _context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        Err(RecoveryError::Io(std::io::Error::other("strategy blew up")))
    }
}

fn config(temp: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default_with_log_dir(temp.path().join("logs"));
    config.backoff = BackoffPolicy {
        base_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 4,
    };
    config.recovery.fallback_output_dir = Some(temp.path().join("fallback"));
    config
}

fn engine_with(config: EngineConfig, registry: RecoveryRegistry) -> Engine {
    Engine::with_parts(config, Arc::new(FixedProbe(1024)), registry).unwrap()
}

fn default_registry(config: &EngineConfig) -> RecoveryRegistry {
    RecoveryRegistry::with_defaults(&config.recovery, Arc::new(YamlValidator))
}

#[tokio::test]
async fn recovered_error_updates_context_and_emits_event() {
    engine_logging::initialize_for_tests();
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let engine = engine_with(config.clone(), default_registry(&config));
    let events = engine.event_channel();

    let wanted = temp.path().join("input").join("base.yml");
    fs::create_dir_all(wanted.parent().unwrap()).unwrap();
    fs::write(wanted.with_extension("json"), "{}").unwrap();

    let mut ctx = ErrorContext::new("file-access", "read").with_path(&wanted);
    let handled = engine
        .handler()
        .handle_error(ErrorInfo::new("ENOENT: no such file or directory"), &mut ctx)
        .await;

    assert_eq!(handled.category, ErrorCategory::FileNotFound);
    assert!(handled.recoverable);
    assert!(handled.recovered);
    assert_eq!(handled.attempts, 1);
    assert_eq!(ctx.path, Some(wanted.with_extension("json")));
    let recovery = handled.recovery.unwrap();
    assert_eq!(recovery.context.unwrap().path, ctx.path);

    match events.try_recv().unwrap() {
        EngineEvent::Recovered {
            error_id, attempts, ..
        } => {
            assert_eq!(error_id, handled.error_id);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let stats = engine.handler().statistics();
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.recovered_errors, 1);
    assert_eq!(stats.unrecovered_errors, 0);
    assert_eq!(stats.errors_by_category.get("file-not-found"), Some(&1));
    assert_eq!(stats.errors_by_severity.get("medium"), Some(&1));

    let stored = engine.handler().get_error(handled.error_id).unwrap();
    assert!(stored.recovered);
    assert_eq!(stored.recovery_attempts(), 1);
}

#[tokio::test]
async fn attempts_are_capped_and_retry_is_terminal() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = default_registry(&config);
    registry.register(
        ErrorCategory::FileNotFound,
        Arc::new(StubbornStrategy {
            calls: calls.clone(),
        }),
    );
    let engine = engine_with(config, registry);
    let events = engine.event_channel();

    let mut ctx = ErrorContext::new("file-access", "read");
    let handled = engine
        .handler()
        .handle_error(ErrorInfo::new("ENOENT"), &mut ctx)
        .await;

    assert!(handled.recoverable);
    assert!(!handled.recovered);
    assert_eq!(handled.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(handled.recovery.unwrap().reason, "still broken");

    let retried = engine
        .handler()
        .retry_recovery(handled.error_id, &mut ctx)
        .await
        .unwrap();
    assert!(!retried.recovered);
    assert_eq!(retried.attempts, 3);
    assert_eq!(
        retried.recovery.unwrap().reason,
        "Maximum recovery attempts reached"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let failures: Vec<EngineEvent> = events.try_iter().collect();
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .all(|e| matches!(e, EngineEvent::RecoveryFailed { attempts: 3, .. })));

    let stats = engine.handler().statistics();
    assert_eq!(stats.recovery_attempts, 3);
    assert_eq!(stats.unrecovered_errors, 1);
}

#[tokio::test]
async fn strategy_failure_is_contained() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.max_retry_attempts = 1;
    let mut registry = default_registry(&config);
    registry.register(ErrorCategory::NetworkError, Arc::new(ExplodingStrategy));
    let engine = engine_with(config, registry);

    let mut ctx = ErrorContext::new("fetch", "download");
    let handled = engine
        .handler()
        .handle_error(ErrorInfo::new("ECONNRESET"), &mut ctx)
        .await;

    assert_eq!(handled.category, ErrorCategory::NetworkError);
    assert!(!handled.recovered);
    let recovery = handled.recovery.unwrap();
    assert!(!recovery.success);
    assert_eq!(recovery.reason, "Recovery strategy failed");
    assert_eq!(recovery.error.as_deref(), Some("io error: strategy blew up"));
}

#[tokio::test]
async fn unknown_errors_are_not_recovered() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let engine = engine_with(config.clone(), default_registry(&config));

    let mut ctx = ErrorContext::new("misc", "misc");
    let handled = engine
        .handler()
        .handle_error(ErrorInfo::named("Panic", "something odd happened"), &mut ctx)
        .await;

    assert_eq!(handled.category, ErrorCategory::Unknown);
    assert!(!handled.recoverable);
    assert!(!handled.recovered);
    assert_eq!(handled.attempts, 0);
    assert!(handled.recovery.is_none());
}

#[tokio::test]
async fn disabled_recovery_and_diagnostics_only_classify() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.enable_recovery = false;
    config.enable_diagnostics = false;
    let engine = engine_with(config.clone(), default_registry(&config));

    let mut ctx = ErrorContext::new("file-access", "read");
    let handled = engine
        .handler()
        .handle_error(ErrorInfo::new("ENOENT"), &mut ctx)
        .await;

    assert!(handled.recoverable);
    assert!(handled.recovery.is_none());
    assert!(handled.diagnostics.is_none());
    assert_eq!(handled.attempts, 0);
}

#[tokio::test]
async fn errors_and_diagnostics_reach_their_streams() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let engine = engine_with(config.clone(), default_registry(&config));

    let missing = temp.path().join("in").join("absent.yml");
    fs::create_dir_all(missing.parent().unwrap()).unwrap();
    let mut ctx = ErrorContext::new("file-access", "read")
        .with_path(&missing)
        .with_artifact("absent.yml");
    let handled = engine
        .handler()
        .handle_error(ErrorInfo::new("ENOENT"), &mut ctx)
        .await;

    let diagnostics = handled.diagnostics.unwrap();
    assert_eq!(diagnostics.memory.process_memory_bytes, 1024);
    assert_eq!(diagnostics.paths.len(), 1);
    assert_eq!(diagnostics.paths[0].field, "path");
    assert!(!diagnostics.paths[0].exists);
    assert_eq!(diagnostics.error.message, "ENOENT");

    let error_log = fs::read_to_string(engine.sink().path(LogStream::Error)).unwrap();
    let first: serde_json::Value =
        serde_json::from_str(error_log.lines().next().unwrap()).unwrap();
    assert_eq!(first["event"], "conversion_error");
    assert_eq!(first["level"], "error");
    assert_eq!(first["category"], "file-not-found");
    assert_eq!(first["artifact_id"], "absent.yml");
    assert!(error_log.contains("recovery_attempt"));

    let diagnostics_log =
        fs::read_to_string(engine.sink().path(LogStream::Diagnostics)).unwrap();
    assert!(diagnostics_log.contains("diagnostics_collected"));
}

#[tokio::test]
async fn clear_resets_records_and_counters() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let engine = engine_with(config.clone(), default_registry(&config));

    let mut ctx = ErrorContext::new("misc", "misc");
    let handled = engine
        .handler()
        .handle_error(ErrorInfo::new("boom"), &mut ctx)
        .await;
    assert_eq!(engine.handler().recent_errors(10).len(), 1);

    engine.clear();
    assert!(engine.handler().get_error(handled.error_id).is_none());
    assert_eq!(engine.handler().statistics(), Default::default());
    assert!(engine
        .handler()
        .retry_recovery(handled.error_id, &mut ctx)
        .await
        .is_none());
}

#[tokio::test]
async fn stored_records_are_bounded_by_history_limit() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.history_limit = 2;
    let engine = engine_with(config.clone(), default_registry(&config));

    let mut ctx = ErrorContext::new("misc", "misc");
    let mut ids = Vec::new();
    for message in ["first", "second", "third"] {
        let handled = engine
            .handler()
            .handle_error(ErrorInfo::new(message), &mut ctx)
            .await;
        ids.push(handled.error_id);
    }

    assert!(engine.handler().get_error(ids[0]).is_none());
    let kept: Vec<_> = engine
        .handler()
        .all_errors()
        .into_iter()
        .map(|r| r.error.message)
        .collect();
    assert_eq!(kept, vec!["second", "third"]);
    // Counters are not trimmed with the records.
    assert_eq!(engine.handler().statistics().total_errors, 3);
    assert!(engine
        .handler()
        .retry_recovery(ids[0], &mut ctx)
        .await
        .is_none());
}
