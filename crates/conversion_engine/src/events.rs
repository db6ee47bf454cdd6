use std::sync::{mpsc, Arc, RwLock};

use conversion_core::{
    ConversionSummary, ErrorCategory, ErrorId, PerformanceIssue, SessionSummary,
};

/// Cross-cutting notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Recovered {
        error_id: ErrorId,
        category: ErrorCategory,
        attempts: u32,
        reason: String,
    },
    RecoveryFailed {
        error_id: ErrorId,
        category: ErrorCategory,
        attempts: u32,
        reason: String,
    },
    PerformanceIssue(PerformanceIssue),
    ConversionCompleted(ConversionSummary),
    SessionCompleted(SessionSummary),
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

pub struct ChannelEventSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Fan-out to every subscribed sink. Publishing never blocks on a slow
/// consumer beyond the sink's own `emit`.
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    /// Subscribe a fresh channel and hand back its receiving end.
    pub fn channel(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribe(Arc::new(ChannelEventSink::new(tx)));
        rx
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        let sinks = match self.sinks.read() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sink in sinks.iter() {
            sink.emit(event.clone());
        }
    }
}
