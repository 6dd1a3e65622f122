//! Transformation step execution.
//!
//! A step resolves its source, iterates it (or treats it as one
//! element), produces records through its mapping or substeps and writes
//! them into the target document. Aggregation steps summarize a region
//! of the target document instead.

use std::borrow::Cow;

use serde_json::Value;

use carbonmap_rules::{DocumentRef, Step, StepBody, Substep};

use crate::aggregate;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::mapping::apply_mapping;
use crate::path::{self, Scope};
use crate::{EngineError, Env};

/// Run one top-level step against the source and the target built so far.
pub(crate) fn execute_step(
    step: &Step,
    source: &Value,
    target: &mut Value,
    env: &Env<'_>,
    diags: &mut Diagnostics,
) -> Result<(), EngineError> {
    let location = format!("transformation_steps[{}]", step.name);
    tracing::debug!(step = %step.name, "executing step");

    if let StepBody::Aggregations(directives) = &step.body {
        return aggregate::run_aggregations(
            directives,
            target,
            step.target.as_deref(),
            &format!("{}.aggregations", location),
            diags,
        );
    }

    let source_path = step.source.as_deref().unwrap_or("$");
    let input: Option<Cow<'_, Value>> = match step.from {
        DocumentRef::Source => path::resolve(source, source_path).map(Cow::Borrowed),
        DocumentRef::Target => path::resolve(target, source_path).cloned().map(Cow::Owned),
    };

    let elements: Vec<&Value> = if step.iteration {
        match input.as_deref() {
            None => {
                diags.push(
                    DiagnosticKind::ResolutionMiss,
                    &location,
                    format!("source '{}' resolved to nothing; nothing was iterated", source_path),
                );
                Vec::new()
            }
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => {
                diags.push(
                    DiagnosticKind::ResolutionMiss,
                    &location,
                    format!(
                        "source '{}' is a {}, not a list; nothing was iterated",
                        source_path,
                        type_name(other)
                    ),
                );
                Vec::new()
            }
        }
    } else {
        match input.as_deref() {
            Some(single) => vec![single],
            None => {
                tracing::debug!(step = %step.name, source = source_path, "source absent, step skipped");
                return Ok(());
            }
        }
    };

    match &step.body {
        StepBody::Mapping(directives) => {
            let mut records = Vec::with_capacity(elements.len());
            for (i, element) in elements.iter().enumerate() {
                let element_location = element_location(&location, step.iteration, i);
                records.push(apply_mapping(
                    directives,
                    &Scope::top(element),
                    env,
                    &element_location,
                    diags,
                )?);
            }
            if step.iteration {
                write_records(target, step.target.as_deref(), records, &location)
            } else {
                write_single(target, step.target.as_deref(), records, &location)
            }
        }
        StepBody::Substeps(substeps) => {
            let mut records = Vec::new();
            for (i, element) in elements.iter().enumerate() {
                let element_location = element_location(&location, step.iteration, i);
                records.extend(run_substeps(substeps, element, env, &element_location, diags)?);
            }
            write_records(target, step.target.as_deref(), records, &location)
        }
        StepBody::Aggregations(_) => Ok(()),
    }
}

/// Produce the records one outer element contributes. Non-iterating
/// substeps merge into a single element record, emitted first; iterating
/// substeps emit one record per inner element, in substep order.
fn run_substeps(
    substeps: &[Substep],
    element: &Value,
    env: &Env<'_>,
    location: &str,
    diags: &mut Diagnostics,
) -> Result<Vec<Value>, EngineError> {
    let mut element_record: Option<serde_json::Map<String, Value>> = None;
    let mut inner_records = Vec::new();

    for substep in substeps {
        let sub_location = format!("{}.substeps[{}]", location, substep.name);
        let resolved = match substep.source.as_deref() {
            Some(p) => path::resolve(element, p),
            None => Some(element),
        };

        if substep.iteration {
            let items = match resolved {
                None => continue,
                Some(Value::Array(items)) => items,
                Some(other) => {
                    diags.push(
                        DiagnosticKind::ResolutionMiss,
                        &sub_location,
                        format!(
                            "source '{}' is a {}, not a list; nothing was iterated",
                            substep.source.as_deref().unwrap_or("$"),
                            type_name(other)
                        ),
                    );
                    continue;
                }
            };
            for (j, inner) in items.iter().enumerate() {
                let inner_location = format!("{}[{}]", sub_location, j);
                inner_records.push(apply_mapping(
                    &substep.mapping,
                    &Scope::nested(inner, element),
                    env,
                    &inner_location,
                    diags,
                )?);
            }
        } else {
            let Some(context) = resolved else {
                tracing::debug!(substep = %substep.name, "substep source absent, skipped");
                continue;
            };
            let built = apply_mapping(
                &substep.mapping,
                &Scope::nested(context, element),
                env,
                &sub_location,
                diags,
            )?;
            if let Value::Object(fields) = built {
                element_record.get_or_insert_with(Default::default).extend(fields);
            }
        }
    }

    let mut records = Vec::with_capacity(inner_records.len() + 1);
    if let Some(fields) = element_record {
        records.push(Value::Object(fields));
    }
    records.extend(inner_records);
    Ok(records)
}

fn write_records(
    target: &mut Value,
    at: Option<&str>,
    records: Vec<Value>,
    location: &str,
) -> Result<(), EngineError> {
    let at = at.ok_or_else(|| EngineError::configuration(location, "step has no target"))?;
    path::append(target, at, records).map_err(|e| EngineError::configuration(location, e))
}

fn write_single(
    target: &mut Value,
    at: Option<&str>,
    records: Vec<Value>,
    location: &str,
) -> Result<(), EngineError> {
    let Some(record) = records.into_iter().next() else {
        return Ok(());
    };
    let result = match (at, record) {
        (Some(at), record) => path::write(target, at, record),
        (None, Value::Object(fields)) => path::merge(target, fields),
        (None, _) => return Ok(()),
    };
    result.map_err(|e| EngineError::configuration(location, e))
}

fn element_location(location: &str, iteration: bool, index: usize) -> String {
    if iteration {
        format!("{}[{}]", location, index)
    } else {
        location.to_string()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
