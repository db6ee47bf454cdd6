use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conversion_core::{ConversionSummary, PerformanceIssue, PerformanceThresholds};
use engine_logging::{engine_debug, engine_warn, LogSink, LogStream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PerformanceSettings;
use crate::probe::{ResourceProbe, ResourceUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub memory: ResourceUsage,
    pub active_conversions: usize,
    pub active_sessions: usize,
}

/// Ring buffer of resource samples plus the per-conversion threshold check.
pub struct PerformanceMonitor {
    thresholds: PerformanceThresholds,
    capacity: usize,
    probe: Arc<dyn ResourceProbe>,
    sink: Arc<LogSink>,
    samples: Mutex<VecDeque<PerformanceSample>>,
}

impl PerformanceMonitor {
    pub fn new(
        settings: &PerformanceSettings,
        probe: Arc<dyn ResourceProbe>,
        sink: Arc<LogSink>,
    ) -> Self {
        let capacity = settings.max_samples.max(1);
        Self {
            thresholds: settings.thresholds(),
            capacity,
            probe,
            sink,
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn thresholds(&self) -> PerformanceThresholds {
        self.thresholds
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<PerformanceSample>> {
        match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take one sample. The probe runs before the buffer lock is taken.
    pub fn record_sample(&self, active_conversions: usize, active_sessions: usize) -> PerformanceSample {
        let sample = PerformanceSample {
            timestamp: Utc::now(),
            memory: self.probe.sample(),
            active_conversions,
            active_sessions,
        };
        {
            let mut buffer = self.buffer();
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(sample.clone());
        }
        if let Ok(fields) = serde_json::to_value(&sample) {
            self.sink
                .write(LogStream::Performance, log::Level::Debug, "performance_sample", fields);
        }
        sample
    }

    /// Compare a finished conversion against the thresholds. Breaches are
    /// logged as warnings and returned; the conversion's outcome is untouched.
    pub fn check_conversion(&self, summary: &ConversionSummary) -> Vec<PerformanceIssue> {
        let issues = self.thresholds.check(summary);
        for issue in &issues {
            engine_warn!(
                "Performance issue on {} ({}): {:?} observed {} > {}",
                issue.artifact_id,
                issue.conversion_id,
                issue.kind,
                issue.observed,
                issue.threshold
            );
            self.sink.write(
                LogStream::Performance,
                log::Level::Warn,
                "performance_issue",
                json!({
                    "severity": "warning",
                    "type": issue.kind,
                    "conversion_id": issue.conversion_id,
                    "artifact_id": issue.artifact_id,
                    "observed": issue.observed,
                    "threshold": issue.threshold,
                }),
            );
        }
        issues
    }

    /// The newest `last` samples, oldest first.
    pub fn samples(&self, last: usize) -> Vec<PerformanceSample> {
        let buffer = self.buffer();
        let skip = buffer.len().saturating_sub(last);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }
}

/// Running periodic sampler. Dropping the handle cancels it.
pub struct SamplerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel and wait for the sampling task to exit.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Sample every `interval` on the current tokio runtime. `counts` returns
/// `(active conversions, active sessions)` and must not block. Returns
/// `None` outside a runtime.
pub fn spawn_sampler<F>(
    monitor: Arc<PerformanceMonitor>,
    interval: Duration,
    counts: F,
) -> Option<SamplerHandle>
where
    F: Fn() -> (usize, usize) + Send + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        engine_warn!("No tokio runtime; periodic performance sampling disabled");
        return None;
    };
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let task = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let (conversions, sessions) = counts();
                    monitor.record_sample(conversions, sessions);
                }
            }
        }
        engine_debug!("Performance sampler stopped");
    });
    Some(SamplerHandle {
        token,
        task: Some(task),
    })
}
