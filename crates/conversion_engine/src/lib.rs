//! Conversion engine: recovery, diagnostics, tracking and reporting.
mod config;
mod diagnostics;
mod engine;
mod events;
mod handler;
mod monitor;
mod performance;
mod persist;
mod probe;
mod recovery;
mod report;
mod tracker;

pub use config::{
    ConfigError, EngineConfig, PerformanceSettings, RecoverySettings, ReportSettings,
};
pub use diagnostics::{
    DiagnosticSnapshot, DiagnosticsCollector, PathProbe, ProcessDetails, WorkingDirectory,
};
pub use engine::{Engine, EngineError};
pub use events::{ChannelEventSink, EngineEvent, EventBus, EventSink};
pub use handler::{ConversionErrorHandler, ErrorStatistics, HandledError, HandlerSettings};
pub use monitor::{CompletedConversion, ConversionMonitor};
pub use performance::{spawn_sampler, PerformanceMonitor, PerformanceSample, SamplerHandle};
pub use persist::{ensure_writable_dir, replace_with_backup, AtomicFileWriter, PersistError};
pub use probe::{ResourceProbe, ResourceUsage, SysinfoProbe, SystemInfo};
pub use recovery::{
    repair_text, AlternatePathStrategy, DependencySearchStrategy, LenientValidationStrategy,
    OutputRedirectStrategy, RecoveryError, RecoveryOutcome, RecoveryRegistry, RecoveryStrategy,
    RegistryError, SyntaxRepairStrategy, SyntaxValidator, TransformationFallbackStrategy,
    TransientNetworkStrategy, YamlValidator,
};
pub use report::{analyze_errors, export_report, DiagnosticReport, ErrorAnalysis, ReportError};
pub use tracker::{ConversionTracker, SessionReport, StaleConversion, TrackerError};
