//! Downstream validation interface.
//!
//! The engine never validates its own output; callers run a
//! [`DocumentValidator`] over the produced document as a separate pass.

use serde::Serialize;
use serde_json::Value;

use crate::diagnostics::Severity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// JSON pointer into the validated document.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// A document is valid when no issue has error severity.
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let valid = issues.iter().all(|i| i.severity != Severity::Error);
        ValidationReport { valid, issues }
    }
}

/// Checks a produced target document against some schema or ontology.
pub trait DocumentValidator {
    fn validate(&self, document: &Value) -> ValidationReport;
}
