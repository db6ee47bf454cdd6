use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ConversionId;

/// Owned description of a failure, detached from the original error type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    /// Messages of the `source()` chain, outermost cause first.
    pub stack: Vec<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        let mut stack = Vec::new();
        let mut cause = error.source();
        while let Some(inner) = cause {
            stack.push(inner.to_string());
            cause = inner.source();
        }
        let name = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        Self {
            name,
            message: error.to_string(),
            stack,
        }
    }
}

impl From<std::io::Error> for ErrorInfo {
    fn from(error: std::io::Error) -> Self {
        let mut info = ErrorInfo::from_error(&error);
        info.name = format!("io::{:?}", error.kind());
        info
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    #[default]
    Full,
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    Strict,
    Lenient,
}

/// What the caller was doing when the failure happened.
///
/// Recovery strategies read and mutate the category-specific fields
/// (`path`, `output_path`, `missing_dependencies`, the mode switches) so the
/// caller can retry the failed step with the adjusted context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorContext {
    pub operation: String,
    pub phase: String,
    pub conversion_id: Option<ConversionId>,
    pub artifact_id: Option<String>,
    pub source: Option<String>,
    pub step: Option<String>,
    pub path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub missing_dependencies: Vec<String>,
    pub resolved_dependencies: BTreeMap<String, PathBuf>,
    pub search_roots: Vec<PathBuf>,
    pub transform_mode: TransformMode,
    pub enhancements_enabled: bool,
    pub validation_mode: ValidationMode,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            operation: String::new(),
            phase: String::new(),
            conversion_id: None,
            artifact_id: None,
            source: None,
            step: None,
            path: None,
            output_path: None,
            missing_dependencies: Vec::new(),
            resolved_dependencies: BTreeMap::new(),
            search_roots: Vec::new(),
            transform_mode: TransformMode::Full,
            enhancements_enabled: true,
            validation_mode: ValidationMode::Strict,
            extra: BTreeMap::new(),
        }
    }
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            phase: phase.into(),
            ..Default::default()
        }
    }

    pub fn with_conversion(mut self, id: ConversionId) -> Self {
        self.conversion_id = Some(id);
        self
    }

    pub fn with_artifact(mut self, artifact_id: impl Into<String>) -> Self {
        self.artifact_id = Some(artifact_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_missing_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.missing_dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_roots.push(root.into());
        self
    }
}
