//! Mapping application: one directive list plus one scope produce one
//! target object.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use carbonmap_rules::{CalculationRule, Directive, DirectiveKind, FunctionCall};

use crate::calculation::{self, CalcOutcome};
use crate::constants::display;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::path::{self, Scope};
use crate::{EngineError, Env};

/// What a single directive produced.
enum Produced {
    Value(Value),
    /// Nothing to write; no error was recorded.
    Absent,
    /// Nothing to write; a diagnostic has already been recorded.
    Failed,
}

/// Calculation results for one mapping application. Failures are cached
/// as `None` so each error is reported once.
#[derive(Default)]
struct CalcMemo {
    results: BTreeMap<String, Option<CalcOutcome>>,
}

impl CalcMemo {
    fn get_or_eval(
        &mut self,
        rule: &CalculationRule,
        scope: &Scope<'_>,
        env: &Env<'_>,
        location: &str,
        diags: &mut Diagnostics,
    ) -> Option<&CalcOutcome> {
        self.results
            .entry(rule.name.clone())
            .or_insert_with(|| match calculation::evaluate(rule, scope, &env.constants) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    diags.push(DiagnosticKind::CalculationError, location, e.to_string());
                    None
                }
            })
            .as_ref()
    }
}

/// Apply `directives` in order against `scope` and return the built
/// object. Directive failures become diagnostics and absent fields;
/// only target-path collisions are fatal.
pub(crate) fn apply_mapping(
    directives: &[Directive],
    scope: &Scope<'_>,
    env: &Env<'_>,
    location: &str,
    diags: &mut Diagnostics,
) -> Result<Value, EngineError> {
    let mut memo = CalcMemo::default();
    build_object(directives, scope, env, location, &mut memo, diags)
}

fn build_object(
    directives: &[Directive],
    scope: &Scope<'_>,
    env: &Env<'_>,
    location: &str,
    memo: &mut CalcMemo,
    diags: &mut Diagnostics,
) -> Result<Value, EngineError> {
    let mut object = Value::Object(Map::new());

    for directive in directives {
        let field_location = format!("{}.{}", location, directive.target);
        let produced = produce(directive, scope, env, &object, &field_location, memo, diags)?;
        let value = match produced {
            Produced::Value(v) => Some(v),
            Produced::Absent => {
                if directive.required {
                    diags.push(
                        DiagnosticKind::ResolutionMiss,
                        &field_location,
                        format!("required field '{}' resolved to nothing", directive.target),
                    );
                }
                None
            }
            Produced::Failed => None,
        };
        let value = match value {
            Some(v) => v,
            None if env.rules.options.omit_absent => continue,
            None => Value::Null,
        };
        path::write(&mut object, &directive.target, value)
            .map_err(|e| EngineError::configuration(&field_location, e))?;
    }

    Ok(object)
}

fn produce(
    directive: &Directive,
    scope: &Scope<'_>,
    env: &Env<'_>,
    siblings: &Value,
    location: &str,
    memo: &mut CalcMemo,
    diags: &mut Diagnostics,
) -> Result<Produced, EngineError> {
    let mut output_name = None;

    let value = match &directive.kind {
        DirectiveKind::Source {
            path,
            context,
            default,
            transform,
        } => {
            let found = match (scope.resolve(*context, path), default) {
                (Some(v), _) => v.clone(),
                (None, Some(d)) => match env.constants.interpolate(d) {
                    Ok(v) => v,
                    Err(e) => return Ok(failed(diags, location, e)),
                },
                (None, None) => return Ok(Produced::Absent),
            };
            transform.apply_value(found)
        }

        DirectiveKind::Calculation { name, select } => {
            let rule = env.rules.calculation(name).ok_or_else(|| {
                EngineError::configuration(location, format!("unknown calculation '{}'", name))
            })?;
            output_name = Some(rule.output.as_str());
            let Some(outcome) = memo.get_or_eval(rule, scope, env, location, diags) else {
                return Ok(Produced::Failed);
            };
            match select {
                Some(field) => match outcome.aux.get(field) {
                    Some(v) => v.clone(),
                    None => return Ok(Produced::Absent),
                },
                None => outcome.output.clone(),
            }
        }

        DirectiveKind::Fixed(literal) => match env.constants.interpolate(literal) {
            Ok(v) => v,
            Err(e) => return Ok(failed(diags, location, e)),
        },

        DirectiveKind::Lookup {
            table,
            key,
            context,
            key_transform,
            default,
        } => {
            let Some(key_value) = scope.resolve(*context, key) else {
                return Ok(match default {
                    Some(d) => match env.constants.interpolate(d) {
                        Ok(v) => Produced::Value(v),
                        Err(e) => failed(diags, location, e),
                    },
                    None => Produced::Absent,
                });
            };
            match env
                .constants
                .lookup(table, key_value, *key_transform, default.as_ref())
            {
                Ok(v) => v,
                Err(e) => return Ok(failed(diags, location, e)),
            }
        }

        DirectiveKind::Nested(nested) => {
            return build_object(nested, scope, env, location, memo, diags).map(Produced::Value)
        }

        DirectiveKind::Function(call) => {
            let date = match call {
                FunctionCall::CurrentDate => env.current_date.map(str::to_string),
                FunctionCall::EarliestDate { collection, fields } => {
                    earliest_date(scope, collection, fields, location, diags)
                        .or_else(|| env.current_date.map(str::to_string))
                }
            };
            let Some(date) = date else {
                diags.push(
                    DiagnosticKind::ResolutionMiss,
                    location,
                    "no date found and no report date was supplied",
                );
                return Ok(Produced::Failed);
            };
            let layout = directive.format.as_deref().unwrap_or("YYYY-MM-DD");
            return Ok(Produced::Value(Value::String(date_layout(&date, layout))));
        }
    };

    Ok(Produced::Value(match &directive.format {
        Some(template) => {
            let text = apply_format(template, &value, output_name);
            Value::String(fill_siblings(&text, siblings))
        }
        None => value,
    }))
}

/// Smallest date string under `fields` across the elements of the list
/// at `collection`. ISO dates order lexically.
fn earliest_date(
    scope: &Scope<'_>,
    collection: &str,
    fields: &[String],
    location: &str,
    diags: &mut Diagnostics,
) -> Option<String> {
    let items = match path::resolve(scope.current, collection)? {
        Value::Array(items) => items,
        _ => {
            diags.push(
                DiagnosticKind::ResolutionMiss,
                location,
                format!("collection '{}' is not a list", collection),
            );
            return None;
        }
    };
    items
        .iter()
        .flat_map(|item| fields.iter().filter_map(move |f| path::resolve(item, f)))
        .filter_map(Value::as_str)
        .filter(|d| !d.is_empty())
        .min()
        .map(str::to_string)
}

/// Replace `{name}` with the scalar field `name` already written to the
/// record being built.
fn fill_siblings(text: &str, siblings: &Value) -> String {
    let Some(fields) = siblings.as_object() else {
        return text.to_string();
    };
    let mut out = text.to_string();
    for (name, value) in fields {
        if value.is_null() || value.is_object() || value.is_array() {
            continue;
        }
        let token = format!("{{{}}}", name);
        if out.contains(&token) {
            out = out.replace(&token, &display(value));
        }
    }
    out
}

fn failed(diags: &mut Diagnostics, location: &str, error: impl std::fmt::Display) -> Produced {
    diags.push(DiagnosticKind::CalculationError, location, error.to_string());
    Produced::Failed
}

/// Substitute `{value}` (and `{<output>}` for calculations) in a template.
pub fn apply_format(template: &str, value: &Value, output_name: Option<&str>) -> String {
    let text = display(value);
    let mut out = template.replace("{value}", &text);
    if let Some(name) = output_name {
        out = out.replace(&format!("{{{}}}", name), &text);
    }
    out
}

/// Cut a `YYYY-MM-DD` date down to the requested layout.
fn date_layout(date: &str, layout: &str) -> String {
    let len = match layout {
        "YYYY" => 4,
        "YYYY-MM" => 7,
        _ => date.len(),
    };
    date.get(..len).unwrap_or(date).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ConstantsStore;
    use carbonmap_rules::{RuleDocument, StepBody};
    use serde_json::json;

    fn rules(mapping: Value, omit_absent: bool) -> RuleDocument {
        RuleDocument::from_json_value(&json!({
            "options": { "omit_absent": omit_absent },
            "constants": {
                "emission_factors": { "electricity": 0.5 },
                "defaults": { "unknown_facility": "Unknown Facility" },
                "units": { "electricity": "kWh" }
            },
            "calculation_rules": [
                {
                    "name": "calculate_co2_emission",
                    "input": { "amount": "amount", "emission_factor": "energy_type" },
                    "lookup": { "emission_factor": { "source": "constants.emission_factors" } },
                    "formula": "amount * emission_factor",
                    "output": "co2_amount"
                },
                {
                    "name": "determine_scope",
                    "input": { "energy_type": "energy_type" },
                    "logic": [
                        { "condition": { "equals": "electricity" }, "output": 2 },
                        { "default": 1 }
                    ],
                    "output": "scope"
                }
            ],
            "transformation_steps": [{
                "name": "s",
                "source": "groups",
                "target": "out",
                "iteration": true,
                "substeps": [
                    { "name": "item", "source": "$.items", "iteration": true, "mapping": mapping }
                ]
            }]
        }))
        .unwrap()
    }

    fn substep_mapping(doc: &RuleDocument) -> &[Directive] {
        let StepBody::Substeps(substeps) = &doc.transformation_steps[0].body else {
            panic!("expected substeps body");
        };
        &substeps[0].mapping
    }

    fn run(
        doc: &RuleDocument,
        current: &Value,
        parent: Option<&Value>,
        date: Option<&str>,
    ) -> (Value, Diagnostics) {
        let env = Env {
            rules: doc,
            constants: ConstantsStore::new(&doc.constants),
            current_date: date,
        };
        let directives = substep_mapping(doc);
        let mut diags = Diagnostics::new();
        let scope = Scope { current, parent };
        let out = apply_mapping(directives, &scope, &env, "s[0]", &mut diags).unwrap();
        (out, diags)
    }

    #[test]
    fn all_directive_kinds() {
        let doc = rules(
            json!([
                { "target": "@type", "calculation": "determine_scope", "format": "ghg:Scope{scope}Emission" },
                { "target": "co2_amount", "calculation": "calculate_co2_emission" },
                { "target": "emission_factor", "calculation": "calculate_co2_emission", "select": "emission_factor" },
                { "target": "energy_type", "source": "energy_type", "transform": "uppercase" },
                { "target": "facility", "source": "facility", "context": "parent",
                  "default": "${constants.defaults.unknown_facility}" },
                { "target": "unit", "lookup": { "source": "constants.units", "key": "energy_type" } },
                { "target": "meta.kind", "fixed_value": "ghg:Emission" },
                { "target": "meta.reported", "function": "current_date", "format": "YYYY-MM" },
                { "target": "label", "source": "amount", "format": "{value} units" }
            ]),
            false,
        );
        let record = json!({ "energy_type": "electricity", "amount": 12500 });
        let parent = json!({ "facility": "Plant A" });
        let (out, diags) = run(&doc, &record, Some(&parent), Some("2024-03-15"));
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(
            out,
            json!({
                "@type": "ghg:Scope2Emission",
                "co2_amount": 6250.0,
                "emission_factor": 0.5,
                "energy_type": "ELECTRICITY",
                "facility": "Plant A",
                "unit": "kWh",
                "meta": { "kind": "ghg:Emission", "reported": "2024-03" },
                "label": "12500 units"
            })
        );
    }

    #[test]
    fn parent_default_applies_without_parent_value() {
        let doc = rules(
            json!([{ "target": "facility", "source": "facility", "context": "parent",
                     "default": "${constants.defaults.unknown_facility}" }]),
            false,
        );
        let (out, diags) = run(&doc, &json!({ "facility": "inner" }), Some(&json!({})), None);
        assert!(diags.is_empty());
        assert_eq!(out["facility"], json!("Unknown Facility"));
    }

    #[test]
    fn calculation_error_reported_once_and_field_null() {
        let doc = rules(
            json!([
                { "target": "co2_amount", "calculation": "calculate_co2_emission" },
                { "target": "emission_factor", "calculation": "calculate_co2_emission", "select": "emission_factor" }
            ]),
            false,
        );
        let record = json!({ "energy_type": "hydrogen", "amount": 10 });
        let (out, diags) = run(&doc, &record, None, None);
        assert_eq!(out, json!({ "co2_amount": null, "emission_factor": null }));
        let entries = diags.into_vec();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, DiagnosticKind::CalculationError);
        assert!(entries[0].message.contains("hydrogen"));
        assert_eq!(entries[0].location, "s[0].co2_amount");
    }

    #[test]
    fn omit_absent_drops_fields() {
        let doc = rules(json!([{ "target": "missing", "source": "nope" }]), true);
        let (out, diags) = run(&doc, &json!({}), None, None);
        assert_eq!(out, json!({}));
        assert!(diags.is_empty());
    }

    #[test]
    fn required_absent_field_is_reported() {
        let doc = rules(
            json!([{ "target": "amount", "source": "quantity", "required": true }]),
            false,
        );
        let (out, diags) = run(&doc, &json!({ "amount": 1 }), None, None);
        assert_eq!(out, json!({ "amount": null }));
        let entries = diags.into_vec();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, DiagnosticKind::ResolutionMiss);
    }

    #[test]
    fn nested_mapping_builds_object() {
        let doc = rules(
            json!([{
                "target": "source",
                "mapping": [
                    { "target": "facility", "source": "facility", "context": "parent" },
                    { "target": "energy", "source": "energy_type" }
                ]
            }]),
            false,
        );
        let (out, _) = run(
            &doc,
            &json!({ "energy_type": "electricity" }),
            Some(&json!({ "facility": "Plant A" })),
            None,
        );
        assert_eq!(
            out,
            json!({ "source": { "facility": "Plant A", "energy": "electricity" } })
        );
    }

    #[test]
    fn missing_report_date_is_reported() {
        let doc = rules(json!([{ "target": "d", "function": "current_date" }]), false);
        let (out, diags) = run(&doc, &json!({}), None, None);
        assert_eq!(out["d"], Value::Null);
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn colliding_target_paths_are_fatal() {
        let doc = rules(
            json!([
                { "target": "a", "fixed_value": 1 },
                { "target": "a.b", "fixed_value": 2 }
            ]),
            false,
        );
        let env = Env {
            rules: &doc,
            constants: ConstantsStore::new(&doc.constants),
            current_date: None,
        };
        let directives = substep_mapping(&doc);
        let mut diags = Diagnostics::new();
        let current = json!({});
        let err = apply_mapping(directives, &Scope::top(&current), &env, "s[0]", &mut diags)
            .unwrap_err();
        assert!(err.to_string().contains("s[0].a.b"), "{}", err);
    }

    #[test]
    fn earliest_date_scans_collection_fields() {
        let doc = rules(
            json!([
                { "target": "period", "function": "earliest_date", "collection": "activities",
                  "fields": ["start_date", "end_date"], "format": "YYYY-MM" },
                { "target": "id", "source": "org", "transform": "initials",
                  "format": "GHG-{value}-{period}" }
            ]),
            false,
        );
        let record = json!({
            "org": "Small Factory Co.",
            "activities": [
                { "start_date": "2024-03-01", "end_date": "2024-03-31" },
                { "end_date": "2024-02-28" },
                { "start_date": null }
            ]
        });
        let (out, diags) = run(&doc, &record, None, Some("2025-06-01"));
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(out, json!({ "period": "2024-02", "id": "GHG-SFC-2024-02" }));
    }

    #[test]
    fn earliest_date_falls_back_to_report_date() {
        let doc = rules(
            json!([{ "target": "period", "function": "earliest_date", "collection": "activities",
                     "fields": ["start_date"], "format": "YYYY-MM" }]),
            false,
        );
        let (out, diags) = run(&doc, &json!({ "activities": [] }), None, Some("2025-06-01"));
        assert!(diags.is_empty());
        assert_eq!(out["period"], json!("2025-06"));

        let (out, diags) = run(&doc, &json!({}), None, None);
        assert_eq!(out["period"], Value::Null);
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn format_substitutes_output_name() {
        assert_eq!(
            apply_format("Scope{scope}Emission", &json!(2), Some("scope")),
            "Scope2Emission"
        );
        assert_eq!(apply_format("{value}-x", &json!("a"), None), "a-x");
    }
}
