use std::path::PathBuf;
use std::sync::Arc;

use conversion_core::{ErrorContext, ErrorRecord};

use super::{RecoveryError, RecoveryOutcome, RecoveryStrategy};
use crate::persist::replace_with_backup;

/// The parser the downstream conversion uses; repairs only count when it
/// accepts the result.
pub trait SyntaxValidator: Send + Sync {
    fn validate(&self, text: &str) -> Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YamlValidator;

impl SyntaxValidator for YamlValidator {
    fn validate(&self, text: &str) -> Result<(), String> {
        serde_yaml::from_str::<serde_yaml::Value>(text)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// `invalid-syntax`: apply idempotent textual repairs and keep them only if
/// the validator then accepts the file. The original is kept as a backup.
pub struct SyntaxRepairStrategy {
    validator: Arc<dyn SyntaxValidator>,
    backup_suffix: String,
}

impl SyntaxRepairStrategy {
    pub fn new(validator: Arc<dyn SyntaxValidator>, backup_suffix: String) -> Self {
        Self {
            validator,
            backup_suffix,
        }
    }
}

#[async_trait::async_trait]
impl RecoveryStrategy for SyntaxRepairStrategy {
    fn name(&self) -> &'static str {
        "syntax-repair"
    }

    async fn recover(
        &self,
        _record: &ErrorRecord,
        context: &mut ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let Some(path) = context.path.clone() else {
            return Ok(RecoveryOutcome::failed("context carries no path"));
        };
        let original = tokio::fs::read_to_string(&path).await?;

        let repaired = repair_text(&original);
        if repaired == original {
            return Ok(RecoveryOutcome::failed("no applicable repairs"));
        }
        if let Err(message) = self.validator.validate(&repaired) {
            return Ok(RecoveryOutcome::failed(format!(
                "still invalid after repair: {message}"
            )));
        }

        let backup = replace_with_backup(&path, &repaired, &self.backup_suffix)?;
        if let Some(backup) = &backup {
            context.extra.insert(
                "backup_path".into(),
                serde_json::Value::String(backup.display().to_string()),
            );
        }
        Ok(RecoveryOutcome::recovered(format!(
            "repaired {}{}",
            path.display(),
            backup
                .map(|b: PathBuf| format!(" (original saved to {})", b.display()))
                .unwrap_or_default()
        )))
    }
}

/// Idempotent line-level repairs for YAML-like text:
/// leading tabs become two spaces, trailing whitespace and trailing `,`/`;`
/// separators are dropped, and bare scalar values containing `: ` or ` #`
/// are double-quoted.
pub fn repair_text(input: &str) -> String {
    let mut out: Vec<String> = input.lines().map(repair_line).collect();
    if input.ends_with('\n') {
        out.push(String::new());
    }
    out.join("\n")
}

fn repair_line(line: &str) -> String {
    let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
    let indent: String = line[..indent_len]
        .chars()
        .map(|c| if c == '\t' { "  " } else { " " })
        .collect();
    let body = line[indent_len..].trim_end();

    if body.is_empty() {
        return String::new();
    }
    if body.starts_with('#') {
        return format!("{indent}{body}");
    }

    let body = body.trim_end_matches([',', ';']).trim_end();
    if body.is_empty() {
        return String::new();
    }
    format!("{indent}{}", quote_bare_value(body))
}

fn quote_bare_value(body: &str) -> String {
    let (prefix, entry) = match body.strip_prefix("- ") {
        Some(rest) => ("- ", rest),
        None => ("", body),
    };
    let Some((key, value)) = entry.split_once(": ") else {
        return body.to_string();
    };
    if key.contains(['"', '\'']) || key.trim().is_empty() {
        return body.to_string();
    }
    let value = value.trim();
    if !needs_quoting(value) {
        return body.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("{prefix}{key}: \"{escaped}\"")
}

fn needs_quoting(value: &str) -> bool {
    if value.is_empty() || value.starts_with(['"', '\'', '[', '{', '|', '>', '&', '*', '!']) {
        return false;
    }
    value.contains(": ")
        || value.contains(" #")
        || value.ends_with(':')
        || value.starts_with(['@', '`', '%'])
}
