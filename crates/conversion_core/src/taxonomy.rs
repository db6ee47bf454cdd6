use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::{ErrorContext, ErrorInfo};

/// Closed set of failure buckets. `Unknown` is the only category that is
/// not recoverable by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    FileNotFound,
    InvalidSyntax,
    MissingDependency,
    PermissionDenied,
    WriteFailed,
    ValidationFailed,
    TransformationFailed,
    NetworkError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::FileNotFound,
        ErrorCategory::InvalidSyntax,
        ErrorCategory::MissingDependency,
        ErrorCategory::PermissionDenied,
        ErrorCategory::WriteFailed,
        ErrorCategory::ValidationFailed,
        ErrorCategory::TransformationFailed,
        ErrorCategory::NetworkError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::FileNotFound => "file-not-found",
            ErrorCategory::InvalidSyntax => "invalid-syntax",
            ErrorCategory::MissingDependency => "missing-dependency",
            ErrorCategory::PermissionDenied => "permission-denied",
            ErrorCategory::WriteFailed => "write-failed",
            ErrorCategory::ValidationFailed => "validation-failed",
            ErrorCategory::TransformationFailed => "transformation-failed",
            ErrorCategory::NetworkError => "network-error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Default recoverability of the category, independent of any message.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorCategory::Unknown)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
}

/// Lowercased view of the inputs a rule may inspect.
struct Probe {
    message: String,
    operation: String,
}

impl Probe {
    /// Needles must start at a word boundary; short ones must also end at one.
    fn message_has(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| has_word(&self.message, n))
    }

    /// The whole operation, or one of its `-`/`_` separated tokens, starts
    /// with a needle: `read` matches `read-input` but not `thread`.
    fn operation_has(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| {
            self.operation == *n
                || self
                    .operation
                    .split(|c: char| !c.is_alphanumeric())
                    .any(|token| token.starts_with(n))
        })
    }
}

const SHORT_NEEDLE: usize = 4;

fn has_word(haystack: &str, needle: &str) -> bool {
    let whole = needle.len() <= SHORT_NEEDLE;
    haystack.match_indices(needle).any(|(at, _)| {
        let starts = haystack[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let ends = !whole
            || haystack[at + needle.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_alphanumeric());
        starts && ends
    })
}

struct Rule {
    category: ErrorCategory,
    severity: Severity,
    matches: fn(&Probe) -> bool,
}

// Evaluated top to bottom; the first match wins.
const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::FileNotFound,
        severity: Severity::Medium,
        matches: |p| {
            p.message_has(&[
                "enoent",
                "no such file",
                "file not found",
                "cannot find file",
                "cannot find the file",
                "does not exist",
            ]) || (p.operation_has(&["file-access", "read"]) && p.message_has(&["not found"]))
        },
    },
    Rule {
        category: ErrorCategory::InvalidSyntax,
        severity: Severity::Medium,
        matches: |p| {
            p.message_has(&[
                "syntax error",
                "invalid syntax",
                "parse error",
                "failed to parse",
                "unexpected token",
                "unexpected end of",
                "malformed",
                "bad indentation",
                "yamlexception",
                "invalid yaml",
                "invalid json",
                "mapping values are not allowed",
                "did not find expected",
                "expected value at line",
            ])
        },
    },
    Rule {
        category: ErrorCategory::MissingDependency,
        severity: Severity::Medium,
        matches: |p| {
            p.message_has(&[
                "missing dependency",
                "dependency not found",
                "cannot find module",
                "module not found",
                "unresolved reference",
                "unresolved import",
                "missing reference",
                "referenced resource",
                "could not resolve",
            ])
        },
    },
    Rule {
        category: ErrorCategory::PermissionDenied,
        severity: Severity::High,
        matches: |p| {
            p.message_has(&[
                "eacces",
                "eperm",
                "permission denied",
                "access denied",
                "access is denied",
                "operation not permitted",
            ])
        },
    },
    Rule {
        category: ErrorCategory::WriteFailed,
        severity: Severity::High,
        matches: |p| {
            p.message_has(&[
                "enospc",
                "no space left",
                "disk full",
                "erofs",
                "read-only file system",
                "write failed",
                "failed to write",
                "cannot write",
            ]) || (p.operation_has(&["write"]) && p.message_has(&["disk", "write"]))
        },
    },
    Rule {
        category: ErrorCategory::ValidationFailed,
        severity: Severity::Medium,
        matches: |p| {
            p.operation_has(&["validat"]) || p.message_has(&["validation failed", "schema violation"])
        },
    },
    Rule {
        category: ErrorCategory::TransformationFailed,
        severity: Severity::Medium,
        matches: |p| {
            p.operation_has(&["transform", "convert"])
                || p.message_has(&["transformation failed", "conversion failed"])
        },
    },
    Rule {
        category: ErrorCategory::NetworkError,
        severity: Severity::Low,
        matches: |p| {
            p.message_has(&[
                "econnrefused",
                "econnreset",
                "etimedout",
                "enotfound",
                "network",
                "socket hang up",
                "timed out",
                "timeout",
                "dns",
            ])
        },
    },
];

/// Classify a failure from its message text and the declared operation.
///
/// Pure and deterministic: identical `(message, operation)` pairs always
/// yield the same classification.
pub fn categorize(error: &ErrorInfo, context: &ErrorContext) -> Classification {
    let probe = Probe {
        message: error.message.to_lowercase(),
        operation: context.operation.to_lowercase(),
    };
    RULES
        .iter()
        .find(|rule| (rule.matches)(&probe))
        .map(|rule| Classification {
            category: rule.category,
            severity: rule.severity,
            recoverable: rule.category.is_recoverable(),
        })
        .unwrap_or(Classification {
            category: ErrorCategory::Unknown,
            severity: Severity::High,
            recoverable: false,
        })
}
