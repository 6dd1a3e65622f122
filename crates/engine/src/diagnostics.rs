//! Per-run diagnostics collected alongside the target document.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A required path resolved to nothing, or an iterated source was not a list.
    ResolutionMiss,
    /// A calculation, lookup or interpolation failed; the field is absent.
    CalculationError,
    /// An aggregate could not be computed and wrote nothing.
    AggregationError,
    /// An average over zero contributing values; `null` was written.
    AggregationUndefined,
}

impl DiagnosticKind {
    pub fn severity(self) -> Severity {
        match self {
            DiagnosticKind::ResolutionMiss | DiagnosticKind::AggregationUndefined => {
                Severity::Warning
            }
            DiagnosticKind::CalculationError | DiagnosticKind::AggregationError => Severity::Error,
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticKind::ResolutionMiss => "resolution_miss",
            DiagnosticKind::CalculationError => "calculation_error",
            DiagnosticKind::AggregationError => "aggregation_error",
            DiagnosticKind::AggregationUndefined => "aggregation_undefined",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    /// Rule location, e.g. `transformation_steps[emissions][0].co2_amount`.
    pub location: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.severity, self.kind, self.location, self.message
        )
    }
}

/// Append-only diagnostics sink threaded through one transform.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: DiagnosticKind, location: &str, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            severity: kind.severity(),
            kind,
            location: location.to_string(),
            message: message.into(),
        };
        tracing::warn!(
            kind = %diagnostic.kind,
            location = %diagnostic.location,
            "{}",
            diagnostic.message
        );
        self.entries.push(diagnostic);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}
