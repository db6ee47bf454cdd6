use std::path::{Path, PathBuf};

use conversion_core::{ErrorContext, ErrorRecord};

use super::{RecoveryError, RecoveryOutcome, RecoveryStrategy};

/// `file-not-found`: look for the file under another extension or in a
/// sibling directory; failing that, create a missing parent directory.
pub struct AlternatePathStrategy {
    extensions: Vec<String>,
    sibling_dirs: Vec<String>,
}

impl AlternatePathStrategy {
    pub fn new(extensions: Vec<String>, sibling_dirs: Vec<String>) -> Self {
        Self {
            extensions,
            sibling_dirs,
        }
    }

    /// Ordered candidates: extension substitutions in place, then the same
    /// file name in configured sibling directories, then in every other
    /// sibling directory (sorted).
    async fn candidates(&self, path: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        let current_ext = path.extension().and_then(|e| e.to_str());
        for ext in &self.extensions {
            if Some(ext.as_str()) != current_ext {
                out.push(path.with_extension(ext));
            }
        }

        let (Some(file_name), Some(dir)) = (path.file_name(), path.parent()) else {
            return out;
        };
        let Some(grandparent) = dir.parent() else {
            return out;
        };

        for name in &self.sibling_dirs {
            out.push(grandparent.join(name).join(file_name));
        }

        if let Ok(mut entries) = tokio::fs::read_dir(grandparent).await {
            let mut siblings = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && entry.path() != dir {
                    siblings.push(entry.path().join(file_name));
                }
            }
            siblings.sort();
            out.extend(siblings);
        }

        let mut seen = std::collections::HashSet::new();
        out.retain(|p| p != path && seen.insert(p.clone()));
        out
    }
}

#[async_trait::async_trait]
impl RecoveryStrategy for AlternatePathStrategy {
    fn name(&self) -> &'static str {
        "alternate-path"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let Some(path) = context.path.clone() else {
            return Ok(RecoveryOutcome::failed("context carries no path"));
        };

        for candidate in self.candidates(&path).await {
            let is_file = tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if is_file {
                context.path = Some(candidate.clone());
                return Ok(RecoveryOutcome::recovered(format!(
                    "using alternate file {}",
                    candidate.display()
                )));
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                tokio::fs::create_dir_all(parent).await?;
                return Ok(RecoveryOutcome::partially_recovered(format!(
                    "created missing directory {}; file is still absent",
                    parent.display()
                )));
            }
        }

        Ok(RecoveryOutcome::failed(format!(
            "no alternate for {} exists",
            path.display()
        )))
    }
}
