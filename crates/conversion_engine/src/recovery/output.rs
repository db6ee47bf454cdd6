use std::ffi::OsString;
use std::path::PathBuf;

use conversion_core::{ErrorContext, ErrorRecord};

use super::{RecoveryError, RecoveryOutcome, RecoveryStrategy};
use crate::persist::ensure_writable_dir;

/// `write-failed` and `permission-denied`: point the output at a writable
/// fallback directory.
pub struct OutputRedirectStrategy {
    fallback_dir: PathBuf,
}

impl OutputRedirectStrategy {
    pub fn new(fallback_dir: PathBuf) -> Self {
        Self { fallback_dir }
    }
}

#[async_trait::async_trait]
impl RecoveryStrategy for OutputRedirectStrategy {
    fn name(&self) -> &'static str {
        "output-redirect"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let original = context.output_path.clone().or_else(|| context.path.clone());
        let file_name = original
            .as_deref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("output"));

        if original
            .as_deref()
            .is_some_and(|p| p.starts_with(&self.fallback_dir))
        {
            return Ok(RecoveryOutcome::failed(format!(
                "output already redirected to {}",
                self.fallback_dir.display()
            )));
        }

        if let Err(err) = ensure_writable_dir(&self.fallback_dir) {
            return Ok(RecoveryOutcome::failed(format!(
                "alternate location {} is not writable: {err}",
                self.fallback_dir.display()
            )));
        }

        let redirected = self.fallback_dir.join(file_name);
        context.output_path = Some(redirected.clone());
        Ok(RecoveryOutcome::recovered(format!(
            "output redirected to {}",
            redirected.display()
        )))
    }
}
