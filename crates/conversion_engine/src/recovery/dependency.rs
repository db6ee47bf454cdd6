use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use conversion_core::{ErrorContext, ErrorRecord};

use super::{RecoveryError, RecoveryOutcome, RecoveryStrategy};

const SHARED_ROOT_NAMES: &[&str] = &["common", "shared"];

/// `missing-dependency`: search alternate roots for each missing reference.
/// Partial resolution counts as success; unresolved names stay in
/// `context.missing_dependencies` for the caller to judge.
pub struct DependencySearchStrategy {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl DependencySearchStrategy {
    pub fn new(roots: Vec<PathBuf>, extensions: Vec<String>) -> Self {
        Self { roots, extensions }
    }

    async fn search_roots(&self, context: &ErrorContext) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = context.search_roots.clone();
        roots.extend(self.roots.iter().cloned());

        if let Some(dir) = context.path.as_deref().and_then(Path::parent) {
            let mut bases = vec![dir.to_path_buf()];
            if let Some(grandparent) = dir.parent() {
                bases.push(grandparent.to_path_buf());
            }
            for base in &bases {
                for name in SHARED_ROOT_NAMES {
                    roots.push(base.join(name));
                }
            }
            // Sibling namespace roots.
            if let Some(grandparent) = dir.parent() {
                if let Ok(mut entries) = tokio::fs::read_dir(grandparent).await {
                    let mut siblings = Vec::new();
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                        if is_dir && entry.path() != dir {
                            siblings.push(entry.path());
                        }
                    }
                    siblings.sort();
                    roots.extend(siblings);
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        roots.retain(|r| seen.insert(r.clone()));
        roots
    }

    async fn locate(&self, dependency: &str, roots: &[PathBuf]) -> Option<PathBuf> {
        let has_ext = Path::new(dependency).extension().is_some();
        for root in roots {
            let direct = root.join(dependency);
            if tokio::fs::try_exists(&direct).await.unwrap_or(false) {
                return Some(direct);
            }
            if has_ext {
                continue;
            }
            for ext in &self.extensions {
                let candidate = direct.with_extension(ext);
                if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl RecoveryStrategy for DependencySearchStrategy {
    fn name(&self) -> &'static str {
        "dependency-search"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        if context.missing_dependencies.is_empty() {
            return Ok(RecoveryOutcome::failed("context lists no missing dependencies"));
        }
        let roots = self.search_roots(context).await;

        let mut resolved = BTreeMap::new();
        for dependency in &context.missing_dependencies {
            if let Some(found) = self.locate(dependency, &roots).await {
                resolved.insert(dependency.clone(), found);
            }
        }

        let wanted = context.missing_dependencies.len();
        if resolved.is_empty() {
            return Ok(RecoveryOutcome::failed(format!(
                "none of {wanted} missing dependencies found in {} search roots",
                roots.len()
            )));
        }

        context
            .missing_dependencies
            .retain(|d| !resolved.contains_key(d));
        context
            .resolved_dependencies
            .extend(resolved.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut outcome = RecoveryOutcome::recovered(format!(
            "resolved {} of {wanted} missing dependencies",
            resolved.len()
        ));
        outcome.resolved_dependencies = resolved;
        Ok(outcome)
    }
}
