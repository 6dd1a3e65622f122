//! Calculation rule evaluation.
//!
//! Inputs are resolved against the scope, lookup variables are replaced
//! by constants-table values, then either the formula chain is folded
//! left to right in decimal arithmetic or the logic branches are tested
//! in order.

use std::collections::BTreeMap;

use serde_json::Value;

use carbonmap_rules::{CalculationBody, CalculationRule, Condition, ConditionTest, Operand};

use crate::constants::{key_text, ConstantsStore, LookupError};
use crate::numeric;
use crate::path::Scope;

/// Result of one calculation: the primary output plus the post-lookup
/// value of every lookup variable.
#[derive(Debug, Clone, PartialEq)]
pub struct CalcOutcome {
    pub output: Value,
    pub aux: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalcError {
    #[error("calculation '{rule}': input '{input}' did not resolve at '{path}'")]
    UnresolvedInput {
        rule: String,
        input: String,
        path: String,
    },
    #[error("calculation '{rule}': lookup for '{input}' failed: {source}")]
    Lookup {
        rule: String,
        input: String,
        #[source]
        source: LookupError,
    },
    #[error("calculation '{rule}': '{variable}' is not a number (got {value})")]
    NotANumber {
        rule: String,
        variable: String,
        value: String,
    },
    #[error("calculation '{rule}': arithmetic overflow")]
    Overflow { rule: String },
    #[error("calculation '{rule}': no logic branch matched and no default is declared")]
    NoBranchMatched { rule: String },
}

/// Evaluate `rule` in `scope`.
pub fn evaluate(
    rule: &CalculationRule,
    scope: &Scope<'_>,
    constants: &ConstantsStore<'_>,
) -> Result<CalcOutcome, CalcError> {
    let vars = bind_inputs(rule, scope, constants)?;

    let aux: BTreeMap<String, Value> = rule
        .lookups
        .keys()
        .filter_map(|name| vars.get(name).map(|v| (name.clone(), v.clone())))
        .collect();

    let output = match &rule.body {
        CalculationBody::Formula(formula) => {
            let mut acc = operand_value(rule, &formula.first, &vars)?;
            for (op, operand) in &formula.rest {
                let rhs = operand_value(rule, operand, &vars)?;
                acc = numeric::apply(*op, acc, rhs).ok_or_else(|| CalcError::Overflow {
                    rule: rule.name.clone(),
                })?;
            }
            if let Some(dp) = rule.rounding {
                acc = numeric::round(acc, dp);
            }
            numeric::to_json_float(acc)
        }
        CalculationBody::Logic { branches, default } => {
            let matched = branches
                .iter()
                .find(|b| condition_holds(&b.condition, &vars, constants))
                .map(|b| b.output.clone());
            match (matched, default) {
                (Some(out), _) => out,
                (None, Some(d)) => d.clone(),
                (None, None) => {
                    return Err(CalcError::NoBranchMatched {
                        rule: rule.name.clone(),
                    })
                }
            }
        }
    };

    Ok(CalcOutcome { output, aux })
}

/// Resolve every input, then substitute lookup variables.
fn bind_inputs(
    rule: &CalculationRule,
    scope: &Scope<'_>,
    constants: &ConstantsStore<'_>,
) -> Result<BTreeMap<String, Value>, CalcError> {
    let mut vars = BTreeMap::new();

    for input in &rule.inputs {
        let lookup = rule.lookups.get(&input.name);

        // A lookup with its own key path takes its key from there.
        let raw = match lookup.and_then(|l| l.key.as_deref().map(|k| (k, l.context))) {
            Some((key_path, ctx)) => scope.resolve(ctx, key_path),
            None => scope.resolve(input.context, &input.path),
        };
        let raw = match (raw, &input.default) {
            (Some(v), _) => v.clone(),
            (None, Some(d)) => d.clone(),
            (None, None) => {
                return Err(CalcError::UnresolvedInput {
                    rule: rule.name.clone(),
                    input: input.name.clone(),
                    path: lookup
                        .and_then(|l| l.key.clone())
                        .unwrap_or_else(|| input.path.clone()),
                })
            }
        };

        let bound = match lookup {
            Some(l) => constants
                .lookup(&l.table, &raw, l.key_transform, l.default.as_ref())
                .map_err(|source| CalcError::Lookup {
                    rule: rule.name.clone(),
                    input: input.name.clone(),
                    source,
                })?,
            None => raw,
        };
        vars.insert(input.name.clone(), bound);
    }

    Ok(vars)
}

fn operand_value(
    rule: &CalculationRule,
    operand: &Operand,
    vars: &BTreeMap<String, Value>,
) -> Result<rust_decimal::Decimal, CalcError> {
    match operand {
        Operand::Number(n) => Ok(*n),
        Operand::Variable(name) => {
            let value = vars.get(name).unwrap_or(&Value::Null);
            numeric::to_decimal(value).ok_or_else(|| CalcError::NotANumber {
                rule: rule.name.clone(),
                variable: name.clone(),
                value: value.to_string(),
            })
        }
    }
}

fn condition_holds(
    condition: &Condition,
    vars: &BTreeMap<String, Value>,
    constants: &ConstantsStore<'_>,
) -> bool {
    let Some(value) = vars.get(&condition.input) else {
        return false;
    };
    let value = condition.key_transform.apply_value(value.clone());
    match &condition.test {
        ConditionTest::Equals(expected) => numeric::json_eq(&value, expected),
        ConditionTest::OneOf(options) => options.iter().any(|o| numeric::json_eq(&value, o)),
        ConditionTest::InCategory { table, category } => key_text(&value)
            .ok()
            .and_then(|key| constants.classify(table, &key))
            .is_some_and(|found| found == category),
    }
}
