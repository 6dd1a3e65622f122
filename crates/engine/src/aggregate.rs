//! Aggregates over collections already written to the target document.
//!
//! Policies:
//! - `sum` counts absent and `null` fields as zero; other non-numeric
//!   values also count as zero but are reported.
//! - `average` divides by the number of numeric fields only. With no
//!   numeric field it writes `null` and reports the result as undefined.
//! - `count` is the number of elements left after filtering.

use rust_decimal::Decimal;
use serde_json::Value;

use carbonmap_rules::{AggregateDirective, AggregateFunction, AggregateKind, Filter, Formula, Operand};

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::numeric;
use crate::path;
use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    #[error("'{path}' is not a list in the target document")]
    NotAList { path: String },
    #[error("formula variable '{variable}' did not resolve in the target document")]
    UnresolvedVariable { variable: String },
    #[error("formula variable '{variable}' is not a number (got {value})")]
    NotANumber { variable: String, value: String },
    #[error("arithmetic overflow")]
    Overflow,
}

/// Something worth reporting about an aggregate that still produced a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    /// Average over zero numeric values.
    Undefined,
    /// Element `index` carried a non-numeric value in the aggregated field.
    NonNumeric { index: usize, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated {
    pub value: Value,
    pub notes: Vec<Note>,
}

impl Aggregated {
    fn clean(value: Value) -> Self {
        Aggregated {
            value,
            notes: Vec::new(),
        }
    }
}

/// Compute one aggregate. Collection sources resolve against the target
/// `document`; formula variables resolve against `base`.
pub fn aggregate(
    directive: &AggregateDirective,
    document: &Value,
    base: &Value,
) -> Result<Aggregated, AggregationError> {
    let result = match &directive.kind {
        AggregateKind::Collection {
            source,
            function,
            field,
            filter,
        } => {
            let list = path::resolve(document, source)
                .and_then(Value::as_array)
                .ok_or_else(|| AggregationError::NotAList {
                    path: source.clone(),
                })?;
            let selected: Vec<&Value> = list
                .iter()
                .filter(|element| matches_filter(element, filter.as_ref()))
                .collect();
            match function {
                AggregateFunction::Count => Aggregated::clean(Value::from(selected.len())),
                AggregateFunction::Sum => sum(&selected, field.as_deref().unwrap_or("$"))?,
                AggregateFunction::Average => average(&selected, field.as_deref().unwrap_or("$"))?,
            }
        }
        AggregateKind::Formula(formula) => Aggregated::clean(eval_formula(formula, base)?),
    };

    Ok(match directive.rounding {
        Some(dp) => round_value(result, dp),
        None => result,
    })
}

fn matches_filter(element: &Value, filter: Option<&Filter>) -> bool {
    match filter {
        None => true,
        Some(f) => path::resolve(element, &f.field).is_some_and(|v| numeric::json_eq(v, &f.equals)),
    }
}

/// Numeric field values of `elements`, with notes for the non-numeric ones.
fn field_values(elements: &[&Value], field: &str) -> (Vec<Decimal>, Vec<Note>) {
    let mut values = Vec::new();
    let mut notes = Vec::new();
    for (index, element) in elements.iter().enumerate() {
        match path::resolve(element, field) {
            None => {}
            Some(v) => match numeric::to_decimal(v) {
                Some(d) => values.push(d),
                None => notes.push(Note::NonNumeric {
                    index,
                    value: v.to_string(),
                }),
            },
        }
    }
    (values, notes)
}

fn total(values: &[Decimal]) -> Result<Decimal, AggregationError> {
    values.iter().try_fold(Decimal::ZERO, |acc, v| {
        acc.checked_add(*v).ok_or(AggregationError::Overflow)
    })
}

fn sum(elements: &[&Value], field: &str) -> Result<Aggregated, AggregationError> {
    let (values, notes) = field_values(elements, field);
    Ok(Aggregated {
        value: numeric::to_json_float(total(&values)?),
        notes,
    })
}

fn average(elements: &[&Value], field: &str) -> Result<Aggregated, AggregationError> {
    let (values, mut notes) = field_values(elements, field);
    if values.is_empty() {
        notes.push(Note::Undefined);
        return Ok(Aggregated {
            value: Value::Null,
            notes,
        });
    }
    let mean = total(&values)?
        .checked_div(Decimal::from(values.len()))
        .ok_or(AggregationError::Overflow)?;
    Ok(Aggregated {
        value: numeric::to_json_float(mean),
        notes,
    })
}

fn eval_formula(formula: &Formula, base: &Value) -> Result<Value, AggregationError> {
    let operand = |op: &Operand| -> Result<Decimal, AggregationError> {
        match op {
            Operand::Number(n) => Ok(*n),
            Operand::Variable(name) => {
                let v = path::resolve(base, name).ok_or_else(|| {
                    AggregationError::UnresolvedVariable {
                        variable: name.clone(),
                    }
                })?;
                numeric::to_decimal(v).ok_or_else(|| AggregationError::NotANumber {
                    variable: name.clone(),
                    value: v.to_string(),
                })
            }
        }
    };

    let mut acc = operand(&formula.first)?;
    for (op, rhs) in &formula.rest {
        acc = numeric::apply(*op, acc, operand(rhs)?).ok_or(AggregationError::Overflow)?;
    }
    Ok(numeric::to_json_float(acc))
}

/// Integers (counts) and `null` pass through unrounded.
fn round_value(mut result: Aggregated, dp: u32) -> Aggregated {
    if result.value.is_f64() {
        if let Some(d) = numeric::to_decimal(&result.value) {
            result.value = numeric::to_json_float(numeric::round(d, dp));
        }
    }
    result
}

/// Run a list of aggregates in order, writing each result into `target`.
/// With a `prefix`, results are written under it and formula variables
/// resolve against it. A failing aggregate is reported and skipped.
pub(crate) fn run_aggregations(
    directives: &[AggregateDirective],
    target: &mut Value,
    prefix: Option<&str>,
    location: &str,
    diags: &mut Diagnostics,
) -> Result<(), EngineError> {
    static EMPTY: Value = Value::Null;

    for directive in directives {
        let entry_location = format!("{}[{}]", location, directive.name);
        let outcome = {
            let base = match prefix {
                Some(p) => path::resolve(target, p).unwrap_or(&EMPTY),
                None => &*target,
            };
            aggregate(directive, target, base)
        };

        let aggregated = match outcome {
            Ok(a) => a,
            Err(e) => {
                diags.push(DiagnosticKind::AggregationError, &entry_location, e.to_string());
                continue;
            }
        };

        for note in &aggregated.notes {
            match note {
                Note::Undefined => diags.push(
                    DiagnosticKind::AggregationUndefined,
                    &entry_location,
                    "average over zero numeric values is undefined; wrote null",
                ),
                Note::NonNumeric { index, value } => diags.push(
                    DiagnosticKind::ResolutionMiss,
                    &entry_location,
                    format!("element {} has non-numeric value {}; ignored", index, value),
                ),
            }
        }

        let dest = match prefix {
            Some(p) => format!("{}.{}", p, directive.target),
            None => directive.target.clone(),
        };
        tracing::debug!(aggregate = %directive.name, target = %dest, "aggregate written");
        path::write(target, &dest, aggregated.value)
            .map_err(|e| EngineError::configuration(&entry_location, e))?;
    }

    Ok(())
}
