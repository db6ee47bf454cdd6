use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use conversion_core::{Conversion, ErrorRecord, StatisticsSnapshot};
use serde::Serialize;
use thiserror::Error;

use crate::handler::ErrorStatistics;
use crate::performance::PerformanceSample;
use crate::persist::{AtomicFileWriter, PersistError};
use crate::probe::SystemInfo;
use crate::tracker::StaleConversion;

const CATEGORY_THRESHOLD: u64 = 2;
const ARTIFACT_THRESHOLD: u64 = 1;
const STEP_THRESHOLD: u64 = 2;
const SOURCE_THRESHOLD: u64 = 3;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report: {0}")]
    Persist(#[from] PersistError),
}

/// Error counts grouped by where they came from, plus advice derived from
/// counts that cross small fixed thresholds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorAnalysis {
    pub total_errors: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_artifact: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
    pub by_step: BTreeMap<String, u64>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    pub statistics: StatisticsSnapshot,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_statistics: Option<ErrorStatistics>,
    pub active_sessions: usize,
    pub active_conversions: usize,
    pub stale_conversions: Vec<StaleConversion>,
    pub recent_conversions: Vec<Conversion>,
    pub system: SystemInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_samples: Option<Vec<PerformanceSample>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_analysis: Option<ErrorAnalysis>,
}

fn bump(map: &mut BTreeMap<String, u64>, key: &str) {
    *map.entry(key.to_string()).or_default() += 1;
}

pub fn analyze_errors(records: &[ErrorRecord], performance_issues: u64) -> ErrorAnalysis {
    let mut analysis = ErrorAnalysis {
        total_errors: records.len() as u64,
        ..ErrorAnalysis::default()
    };
    for record in records {
        bump(&mut analysis.by_category, record.category.as_str());
        if let Some(artifact) = &record.context.artifact_id {
            bump(&mut analysis.by_artifact, artifact);
        }
        if let Some(source) = &record.context.source {
            bump(&mut analysis.by_source, source);
        }
        if let Some(step) = &record.step {
            bump(&mut analysis.by_step, step);
        }
    }

    let mut advice = Vec::new();
    for (category, count) in &analysis.by_category {
        if *count > CATEGORY_THRESHOLD {
            advice.push(format!(
                "{category} occurred {count} times; check the inputs for a common cause"
            ));
        }
    }
    for (artifact, count) in &analysis.by_artifact {
        if *count > ARTIFACT_THRESHOLD {
            advice.push(format!(
                "artifact {artifact} failed {count} times; inspect it individually"
            ));
        }
    }
    for (step, count) in &analysis.by_step {
        if *count > STEP_THRESHOLD {
            advice.push(format!(
                "step {step} failed {count} times; review that stage of the pipeline"
            ));
        }
    }
    for (source, count) in &analysis.by_source {
        if *count > SOURCE_THRESHOLD {
            advice.push(format!(
                "source {source} produced {count} errors; verify its configuration"
            ));
        }
    }
    if performance_issues > 0 {
        advice.push(format!(
            "{performance_issues} performance threshold breach(es); consider splitting large artifacts or raising the limits"
        ));
    }
    analysis.recommendations = advice;
    analysis
}

/// Write `report` as pretty JSON to `path`, replacing any previous file
/// atomically.
pub fn export_report(report: &DiagnosticReport, path: &Path) -> Result<PathBuf, ReportError> {
    let json = serde_json::to_string_pretty(report)?;
    let (writer, name) = AtomicFileWriter::for_path(path)?;
    Ok(writer.write(&name, &json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conversion_core::{categorize, ErrorContext, ErrorInfo};

    fn record(message: &str, artifact: &str, step: &str) -> ErrorRecord {
        let info = ErrorInfo::new(message);
        let ctx = ErrorContext::new("file-access", "read")
            .with_artifact(artifact)
            .with_source("espanso")
            .with_step(step);
        ErrorRecord::new(info.clone(), categorize(&info, &ctx), ctx)
    }

    #[test]
    fn recommendations_follow_thresholds() {
        let records = vec![
            record("ENOENT: no such file", "a.yml", "read"),
            record("ENOENT: no such file", "a.yml", "read"),
            record("ENOENT: no such file", "b.yml", "read"),
        ];
        let analysis = analyze_errors(&records, 0);
        assert_eq!(analysis.by_category.get("file-not-found"), Some(&3));
        assert_eq!(analysis.by_artifact.get("a.yml"), Some(&2));
        assert_eq!(analysis.recommendations.len(), 3);
        assert!(analysis.recommendations[0].starts_with("file-not-found occurred 3 times"));
        assert!(analysis.recommendations[1].starts_with("artifact a.yml failed 2 times"));
        assert!(analysis.recommendations[2].starts_with("step read failed 3 times"));
    }

    #[test]
    fn quiet_runs_get_no_advice() {
        let analysis = analyze_errors(&[record("ENOENT", "a.yml", "read")], 0);
        assert!(analysis.recommendations.is_empty());
        let analysis = analyze_errors(&[], 1);
        assert_eq!(analysis.recommendations.len(), 1);
    }
}
