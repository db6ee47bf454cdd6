//! Conversion core: failure taxonomy, tracking state machine and statistics.
//!
//! Everything here is pure; file and process access lives in `conversion_engine`.
mod backoff;
mod context;
mod record;
mod statistics;
mod taxonomy;
mod thresholds;
mod tracking;

pub use backoff::BackoffPolicy;
pub use context::{ErrorContext, ErrorInfo, TransformMode, ValidationMode};
pub use record::ErrorRecord;
pub use statistics::{ConversionSummary, StatisticsSnapshot};
pub use taxonomy::{categorize, Classification, ErrorCategory, Severity};
pub use thresholds::{PerformanceIssue, PerformanceIssueKind, PerformanceThresholds};
pub use tracking::{
    Conversion, ItemMetadata, ResourceSnapshot, Session, SessionInfo, SessionSummary, Status, Step,
    StepError, TransitionError,
};

pub type SessionId = uuid::Uuid;
pub type ConversionId = uuid::Uuid;
pub type ErrorId = uuid::Uuid;
