//! carbonmap engine: applies a validated rule document to a source
//! JSON-LD document and produces the target document plus diagnostics.
//!
//! Pipeline for one run:
//! 1. Root mapping (`@context`, `@type`)
//! 2. Field mappings against the source root
//! 3. Transformation steps, strictly in document order
//! 4. Document-level aggregations
//!
//! The core performs no I/O and reads no clock; the report date is
//! injected through [`TransformOptions`].

pub mod aggregate;
pub mod calculation;
pub mod constants;
pub mod diagnostics;
mod mapping;
pub mod numeric;
pub mod path;
mod step;
pub mod validate;

use std::fmt;

use serde_json::{Map, Value};

use carbonmap_rules::{FieldMapping, FieldValue, RuleDocument};

pub use calculation::{CalcError, CalcOutcome};
pub use constants::{ConstantsStore, LookupError};
pub use diagnostics::{Diagnostic, DiagnosticKind, Severity};
pub use mapping::apply_format;
pub use validate::{DocumentValidator, ValidationIssue, ValidationReport};

use diagnostics::Diagnostics;

/// Caller-supplied values the engine must not compute itself.
#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    /// Report date as `YYYY-MM-DD`, used by `current_date` directives.
    pub current_date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub document: Value,
    pub diagnostics: Vec<Diagnostic>,
}

impl TransformOutput {
    /// True when the run recorded no diagnostics at all.
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

/// Fatal failures that abort the whole transform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error at {location}: {message}")]
    Configuration { location: String, message: String },
}

impl EngineError {
    pub(crate) fn configuration(location: &str, message: impl fmt::Display) -> Self {
        EngineError::Configuration {
            location: location.to_string(),
            message: message.to_string(),
        }
    }
}

/// Shared read-only state for one run.
pub(crate) struct Env<'r> {
    pub rules: &'r RuleDocument,
    pub constants: ConstantsStore<'r>,
    pub current_date: Option<&'r str>,
}

/// Transform `source` according to `rules`.
#[tracing::instrument(skip_all, fields(rules = rules.name().unwrap_or("unnamed")))]
pub fn transform(
    rules: &RuleDocument,
    source: &Value,
    options: &TransformOptions,
) -> Result<TransformOutput, EngineError> {
    tracing::info!(
        steps = rules.transformation_steps.len(),
        aggregations = rules.aggregations.len(),
        "transform started"
    );

    let env = Env {
        rules,
        constants: ConstantsStore::new(&rules.constants),
        current_date: options.current_date.as_deref(),
    };
    let mut diags = Diagnostics::new();
    let mut target = Value::Object(Map::new());

    if let Some(root) = &rules.root_mapping {
        if let Some(context) = &root.target_context {
            path::write(&mut target, "@context", Value::Object(context.clone()))
                .map_err(|e| EngineError::configuration("root_mapping", e))?;
        }
        if let Some(ty) = &root.target_type {
            path::write(&mut target, "@type", Value::String(ty.clone()))
                .map_err(|e| EngineError::configuration("root_mapping", e))?;
        }
    }

    for (i, mapping) in rules.field_mappings.iter().enumerate() {
        let location = format!("field_mappings[{}]", i);
        apply_field_mapping(mapping, source, &mut target, &env, &location, &mut diags)?;
    }

    for step in &rules.transformation_steps {
        step::execute_step(step, source, &mut target, &env, &mut diags)?;
    }

    aggregate::run_aggregations(&rules.aggregations, &mut target, None, "aggregations", &mut diags)?;

    tracing::info!(diagnostics = diags.len(), "transform finished");
    Ok(TransformOutput {
        document: target,
        diagnostics: diags.into_vec(),
    })
}

/// Copy one value from the source root into the target root.
fn apply_field_mapping(
    mapping: &FieldMapping,
    source: &Value,
    target: &mut Value,
    env: &Env<'_>,
    location: &str,
    diags: &mut Diagnostics,
) -> Result<(), EngineError> {
    let literal = |v: &Value| env.constants.interpolate(v);
    let resolved = match &mapping.value {
        FieldValue::Source(p) => match path::resolve(source, p) {
            Some(v) => Some(Ok(v.clone())),
            None => mapping.default.as_ref().map(literal),
        },
        FieldValue::Fixed(v) => Some(literal(v)),
    };

    let value = match resolved {
        Some(Ok(v)) => mapping.transform.apply_value(v),
        Some(Err(e)) => {
            diags.push(DiagnosticKind::CalculationError, location, e.to_string());
            Value::Null
        }
        None => {
            if mapping.required {
                diags.push(
                    DiagnosticKind::ResolutionMiss,
                    location,
                    format!("required field '{}' resolved to nothing", mapping.target_path),
                );
            }
            if env.rules.options.omit_absent {
                return Ok(());
            }
            Value::Null
        }
    };

    path::write(target, &mapping.target_path, value)
        .map_err(|e| EngineError::configuration(location, e))
}
