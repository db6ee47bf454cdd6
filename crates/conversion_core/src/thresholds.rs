use serde::{Deserialize, Serialize};

use crate::statistics::ConversionSummary;
use crate::ConversionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceIssueKind {
    SlowConversion,
    HighMemoryUsage,
}

/// Advisory breach; never changes a conversion's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceIssue {
    pub conversion_id: ConversionId,
    pub artifact_id: String,
    pub kind: PerformanceIssueKind,
    pub observed: u64,
    pub threshold: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    pub time_threshold_ms: u64,
    pub memory_threshold_bytes: u64,
}

impl PerformanceThresholds {
    pub fn check(&self, summary: &ConversionSummary) -> Vec<PerformanceIssue> {
        let mut issues = Vec::new();
        if summary.duration_ms > self.time_threshold_ms {
            issues.push(PerformanceIssue {
                conversion_id: summary.conversion_id,
                artifact_id: summary.artifact_id.clone(),
                kind: PerformanceIssueKind::SlowConversion,
                observed: summary.duration_ms,
                threshold: self.time_threshold_ms,
            });
        }
        if summary.peak_memory_bytes > self.memory_threshold_bytes {
            issues.push(PerformanceIssue {
                conversion_id: summary.conversion_id,
                artifact_id: summary.artifact_id.clone(),
                kind: PerformanceIssueKind::HighMemoryUsage,
                observed: summary.peak_memory_bytes,
                threshold: self.memory_threshold_bytes,
            });
        }
        issues
    }
}
