use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{ErrorContext, ErrorInfo};
use crate::taxonomy::{Classification, ErrorCategory, Severity};
use crate::{ConversionId, ErrorId};

/// A classified, tracked occurrence of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: ErrorId,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorInfo,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub step: Option<String>,
    pub conversion_id: Option<ConversionId>,
    pub context: ErrorContext,
    recovery_attempts: u32,
    pub recovered: bool,
    pub diagnostics: Option<serde_json::Value>,
}

impl ErrorRecord {
    pub fn new(error: ErrorInfo, classification: Classification, context: ErrorContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            error,
            category: classification.category,
            severity: classification.severity,
            recoverable: classification.recoverable,
            step: context.step.clone(),
            conversion_id: context.conversion_id,
            context,
            recovery_attempts: 0,
            recovered: false,
            diagnostics: None,
        }
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    pub fn attempts_remaining(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.recovery_attempts)
    }

    /// Reserve the next recovery attempt. Returns the 1-based attempt number,
    /// or `None` once `max_attempts` have been used.
    pub fn begin_attempt(&mut self, max_attempts: u32) -> Option<u32> {
        if self.recovery_attempts >= max_attempts {
            return None;
        }
        self.recovery_attempts += 1;
        Some(self.recovery_attempts)
    }
}
