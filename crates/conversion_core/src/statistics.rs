use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::taxonomy::ErrorCategory;
use crate::{ConversionId, SessionId};

/// What the aggregator needs to know about one finished conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSummary {
    pub conversion_id: ConversionId,
    pub session_id: SessionId,
    pub artifact_id: String,
    pub declared_type: String,
    pub source: String,
    pub success: bool,
    pub duration_ms: u64,
    pub peak_memory_bytes: u64,
    pub error_categories: Vec<ErrorCategory>,
}

/// Cumulative run counters. Only ever grows until replaced wholesale by
/// `Default` on an administrative clear.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_conversions: u64,
    pub successful_conversions: u64,
    pub failed_conversions: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub peak_memory_bytes: u64,
    pub conversions_by_type: BTreeMap<String, u64>,
    pub conversions_by_source: BTreeMap<String, u64>,
    pub errors_by_category: BTreeMap<String, u64>,
    pub performance_issues: u64,
}

impl StatisticsSnapshot {
    pub fn record_conversion(&mut self, summary: &ConversionSummary) {
        self.total_conversions += 1;
        if summary.success {
            self.successful_conversions += 1;
        } else {
            self.failed_conversions += 1;
        }

        self.total_duration_ms += summary.duration_ms;
        self.average_duration_ms = self.total_duration_ms as f64 / self.total_conversions as f64;
        self.peak_memory_bytes = self.peak_memory_bytes.max(summary.peak_memory_bytes);

        *self
            .conversions_by_type
            .entry(summary.declared_type.clone())
            .or_default() += 1;
        *self
            .conversions_by_source
            .entry(summary.source.clone())
            .or_default() += 1;
        for category in &summary.error_categories {
            *self
                .errors_by_category
                .entry(category.as_str().to_string())
                .or_default() += 1;
        }
    }

    pub fn record_performance_issues(&mut self, count: u64) {
        self.performance_issues += count;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_conversions == 0 {
            return 0.0;
        }
        self.successful_conversions as f64 / self.total_conversions as f64
    }
}
