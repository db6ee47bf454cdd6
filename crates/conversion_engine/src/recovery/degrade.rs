use conversion_core::{ErrorContext, ErrorRecord, TransformMode, ValidationMode};

use super::{RecoveryError, RecoveryOutcome, RecoveryStrategy};

/// `transformation-failed`: full mode, then minimal mode, then minimal mode
/// without optional enhancements.
pub struct TransformationFallbackStrategy;

#[async_trait::async_trait]
impl RecoveryStrategy for TransformationFallbackStrategy {
    fn name(&self) -> &'static str {
        "transformation-fallback"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        if context.transform_mode == TransformMode::Full {
            context.transform_mode = TransformMode::Minimal;
            return Ok(RecoveryOutcome::recovered("switched to minimal transformation"));
        }
        if context.enhancements_enabled {
            context.enhancements_enabled = false;
            return Ok(RecoveryOutcome::recovered("disabled optional enhancements"));
        }
        Ok(RecoveryOutcome::failed(
            "transformation already minimal with enhancements disabled",
        ))
    }
}

/// `validation-failed`: relax to lenient validation once.
pub struct LenientValidationStrategy;

#[async_trait::async_trait]
impl RecoveryStrategy for LenientValidationStrategy {
    fn name(&self) -> &'static str {
        "lenient-validation"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        match context.validation_mode {
            ValidationMode::Strict => {
                context.validation_mode = ValidationMode::Lenient;
                Ok(RecoveryOutcome::recovered("relaxed to lenient validation"))
            }
            ValidationMode::Lenient => Ok(RecoveryOutcome::failed(
                "validation already lenient; no further degradation available",
            )),
        }
    }
}

/// `network-error`: nothing to change locally. Reports success so the
/// caller retries once the handler's backoff delay has elapsed.
pub struct TransientNetworkStrategy;

#[async_trait::async_trait]
impl RecoveryStrategy for TransientNetworkStrategy {
    fn name(&self) -> &'static str {
        "transient-network"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        _context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        Ok(RecoveryOutcome::recovered(
            "treated as transient; retry the operation",
        ))
    }
}
