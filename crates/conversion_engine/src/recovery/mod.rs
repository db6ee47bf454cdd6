//! Category-specific remediation routines and the table binding them.
mod degrade;
mod dependency;
mod missing_file;
mod output;
mod syntax;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use conversion_core::{ErrorCategory, ErrorContext, ErrorRecord};
use serde::Serialize;

use crate::config::RecoverySettings;
use crate::persist::PersistError;

pub use degrade::{LenientValidationStrategy, TransformationFallbackStrategy, TransientNetworkStrategy};
pub use dependency::DependencySearchStrategy;
pub use missing_file::AlternatePathStrategy;
pub use output::OutputRedirectStrategy;
pub use syntax::{repair_text, SyntaxRepairStrategy, SyntaxValidator, YamlValidator};

/// Result of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub reason: String,
    /// Success that only removes part of the cause (e.g. directory created,
    /// file still absent).
    pub partial: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_dependencies: BTreeMap<String, PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Context after the strategy ran, set on success so the caller can retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,
}

impl RecoveryOutcome {
    pub fn recovered(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
            partial: false,
            resolved_dependencies: BTreeMap::new(),
            error: None,
            context: None,
        }
    }

    pub fn partially_recovered(reason: impl Into<String>) -> Self {
        Self {
            partial: true,
            ..Self::recovered(reason)
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::recovered(reason)
        }
    }

    pub fn strategy_failed(error: &RecoveryError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::failed("Recovery strategy failed")
        }
    }
}

/// Internal failure of a strategy, as opposed to a strategy that ran and
/// found nothing to fix.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
}

#[async_trait::async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Try to remove the cause of `record`, mutating `context` toward a
    /// state in which the failed step can be retried.
    async fn recover(
        &self,
        record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("recoverable category {0} has no recovery strategy")]
    Unbound(ErrorCategory),
}

/// Category to strategy table. Every recoverable category must be bound.
#[derive(Default, Clone)]
pub struct RecoveryRegistry {
    strategies: HashMap<ErrorCategory, Arc<dyn RecoveryStrategy>>,
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard binding for every recoverable category.
    pub fn with_defaults(settings: &RecoverySettings, validator: Arc<dyn SyntaxValidator>) -> Self {
        let mut registry = Self::new();
        let redirect: Arc<dyn RecoveryStrategy> =
            Arc::new(OutputRedirectStrategy::new(settings.fallback_dir()));

        registry.register(
            ErrorCategory::FileNotFound,
            Arc::new(AlternatePathStrategy::new(
                settings.alternate_extensions.clone(),
                settings.alternate_dirs.clone(),
            )),
        );
        registry.register(
            ErrorCategory::InvalidSyntax,
            Arc::new(SyntaxRepairStrategy::new(
                validator,
                settings.backup_suffix.clone(),
            )),
        );
        registry.register(
            ErrorCategory::MissingDependency,
            Arc::new(DependencySearchStrategy::new(
                settings.dependency_roots.clone(),
                settings.alternate_extensions.clone(),
            )),
        );
        registry.register(ErrorCategory::PermissionDenied, redirect.clone());
        registry.register(ErrorCategory::WriteFailed, redirect);
        registry.register(
            ErrorCategory::ValidationFailed,
            Arc::new(LenientValidationStrategy),
        );
        registry.register(
            ErrorCategory::TransformationFailed,
            Arc::new(TransformationFallbackStrategy),
        );
        registry.register(ErrorCategory::NetworkError, Arc::new(TransientNetworkStrategy));
        registry
    }

    /// Bind `strategy` to `category`, returning the strategy it replaced.
    pub fn register(
        &mut self,
        category: ErrorCategory,
        strategy: Arc<dyn RecoveryStrategy>,
    ) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies.insert(category, strategy)
    }

    pub fn strategy(&self, category: ErrorCategory) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies.get(&category).cloned()
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        for category in ErrorCategory::ALL {
            if category.is_recoverable() && !self.strategies.contains_key(&category) {
                return Err(RegistryError::Unbound(category));
            }
        }
        Ok(())
    }

    /// Run the strategy bound to `category`.
    ///
    /// # Panics
    ///
    /// Panics if no strategy is bound: asking to recover an unbound category
    /// is a programming error, not a conversion failure.
    pub async fn recover(
        &self,
        category: ErrorCategory,
        record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let Some(strategy) = self.strategy(category) else {
            panic!("no recovery strategy bound for category {category}");
        };
        strategy.recover(record, context).await
    }
}
