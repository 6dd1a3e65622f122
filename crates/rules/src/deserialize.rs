//! Deserialization of rule documents and load-time validation.
//!
//! The main entry points are [`from_yaml_str`] and [`from_json_value`].
//! Both first deserialize into loosely-shaped `Raw*` structs mirroring
//! the file format, then convert them into the typed model in
//! [`crate::types`], rejecting malformed directives, unknown references
//! and unparseable formulas as [`RuleError`]s.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::formula::{Formula, FormulaError};
use crate::text::{placeholders, TextTransform};
use crate::types::*;

/// Errors raised while loading a rule document. All of them are fatal
/// configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule document is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("rule document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{location}: {message}")]
    Invalid { location: String, message: String },
    #[error("{location}: unknown calculation rule '{name}'")]
    UnknownCalculation { location: String, name: String },
    #[error("{location}: unknown constants table '{table}'")]
    UnknownTable { location: String, table: String },
    #[error("{location}: duplicate calculation rule '{name}'")]
    DuplicateCalculation { location: String, name: String },
    #[error("{location}: invalid formula: {error}")]
    Formula {
        location: String,
        #[source]
        error: FormulaError,
    },
}

impl RuleError {
    fn invalid(location: &str, message: impl Into<String>) -> Self {
        RuleError::Invalid {
            location: location.to_string(),
            message: message.into(),
        }
    }
}

/// Parse and validate a YAML rule document.
pub fn from_yaml_str(text: &str) -> Result<RuleDocument, RuleError> {
    let raw: RawDocument = serde_yaml::from_str(text)?;
    build_document(raw)
}

/// Parse and validate a rule document already held as JSON.
pub fn from_json_value(value: &Value) -> Result<RuleDocument, RuleError> {
    let raw: RawDocument = serde_json::from_value(value.clone())?;
    build_document(raw)
}

impl RuleDocument {
    pub fn from_yaml_str(text: &str) -> Result<RuleDocument, RuleError> {
        from_yaml_str(text)
    }

    pub fn from_json_value(value: &Value) -> Result<RuleDocument, RuleError> {
        from_json_value(value)
    }
}

// ── Raw file shapes ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    options: Option<Options>,
    #[serde(default)]
    root_mapping: Option<RootMapping>,
    #[serde(default)]
    constants: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    field_mappings: Vec<RawFieldMapping>,
    #[serde(default)]
    calculation_rules: Vec<RawCalculation>,
    transformation_steps: Vec<RawStep>,
    #[serde(default)]
    aggregations: Vec<RawAggregate>,
}

#[derive(Debug, Deserialize)]
struct RawFieldMapping {
    #[serde(default)]
    source_path: Option<String>,
    target_path: String,
    #[serde(default)]
    fixed_value: Option<Value>,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    transform: TextTransform,
    #[serde(default)]
    required: bool,
}

#[derive(Debug, Deserialize)]
struct RawCalculation {
    name: String,
    #[serde(default)]
    input: BTreeMap<String, RawInput>,
    #[serde(default)]
    formula: Option<String>,
    #[serde(default)]
    logic: Option<Vec<RawLogicItem>>,
    #[serde(default)]
    lookup: BTreeMap<String, RawLookup>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    rounding: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInput {
    Path(String),
    Detailed(RawInputDetail),
}

#[derive(Debug, Deserialize)]
struct RawInputDetail {
    path: String,
    #[serde(default)]
    context: ContextRef,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawLookup {
    source: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    context: ContextRef,
    #[serde(default)]
    key_transform: TextTransform,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawLogicItem {
    #[serde(default)]
    condition: Option<RawCondition>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    key_transform: TextTransform,
    #[serde(default)]
    equals: Option<Value>,
    #[serde(default, rename = "in")]
    in_set: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    from: DocumentRef,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    iteration: bool,
    #[serde(default)]
    substeps: Option<Vec<RawStep>>,
    #[serde(default, alias = "mappings")]
    mapping: Option<Vec<RawDirective>>,
    #[serde(default)]
    aggregations: Option<Vec<RawAggregate>>,
}

#[derive(Debug, Deserialize)]
struct RawDirective {
    target: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    context: ContextRef,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    transform: Option<TextTransform>,
    #[serde(default)]
    calculation: Option<String>,
    #[serde(default)]
    select: Option<String>,
    #[serde(default)]
    fixed_value: Option<Value>,
    #[serde(default)]
    lookup: Option<RawLookup>,
    #[serde(default)]
    mapping: Option<Vec<RawDirective>>,
    #[serde(default)]
    function: Option<BuiltinFunction>,
    /// List path scanned by `earliest_date`.
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    required: bool,
}

#[derive(Debug, Deserialize)]
struct RawAggregate {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    source: Option<String>,
    target: String,
    #[serde(default)]
    aggregate: Option<RawAggregateFn>,
    #[serde(default)]
    filter: Option<Filter>,
    #[serde(default)]
    formula: Option<String>,
    #[serde(default)]
    rounding: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawAggregateFn {
    function: AggregateFunction,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    filter: Option<Filter>,
}

// ── Conversion ──────────────────────────────────────────────────────

/// Shared state while converting one document.
struct Builder<'a> {
    constants: &'a BTreeMap<String, Value>,
    calculations: BTreeMap<String, CalculationRule>,
}

fn build_document(raw: RawDocument) -> Result<RuleDocument, RuleError> {
    let constants = raw.constants.unwrap_or_default();
    let mut builder = Builder {
        constants: &constants,
        calculations: BTreeMap::new(),
    };

    for (i, calc) in raw.calculation_rules.into_iter().enumerate() {
        let location = format!("calculation_rules[{}]", i);
        if builder.calculations.contains_key(&calc.name) {
            return Err(RuleError::DuplicateCalculation {
                location,
                name: calc.name,
            });
        }
        let rule = builder.calculation(calc, &location)?;
        builder.calculations.insert(rule.name.clone(), rule);
    }

    let field_mappings = raw
        .field_mappings
        .into_iter()
        .enumerate()
        .map(|(i, fm)| builder.field_mapping(fm, &format!("field_mappings[{}]", i)))
        .collect::<Result<Vec<_>, _>>()?;

    let transformation_steps = raw
        .transformation_steps
        .into_iter()
        .map(|step| {
            let location = format!("transformation_steps[{}]", step.name);
            builder.step(step, &location)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let aggregations = raw
        .aggregations
        .into_iter()
        .enumerate()
        .map(|(i, agg)| builder.aggregate(agg, &format!("aggregations[{}]", i)))
        .collect::<Result<Vec<_>, _>>()?;

    let calculation_rules = builder.calculations;

    Ok(RuleDocument {
        metadata: raw.metadata.unwrap_or_default(),
        options: raw.options.unwrap_or_default(),
        root_mapping: raw.root_mapping,
        constants,
        field_mappings,
        calculation_rules,
        transformation_steps,
        aggregations,
    })
}

impl Builder<'_> {
    fn field_mapping(&self, raw: RawFieldMapping, location: &str) -> Result<FieldMapping, RuleError> {
        let value = match (raw.source_path, raw.fixed_value) {
            (Some(path), None) => FieldValue::Source(non_empty(path, location, "source_path")?),
            (None, Some(v)) => {
                self.check_placeholders(&v, location)?;
                FieldValue::Fixed(v)
            }
            (Some(_), Some(_)) => {
                return Err(RuleError::invalid(
                    location,
                    "declares both 'source_path' and 'fixed_value'",
                ))
            }
            (None, None) => {
                return Err(RuleError::invalid(
                    location,
                    "needs either 'source_path' or 'fixed_value'",
                ))
            }
        };
        if let Some(ref d) = raw.default {
            self.check_placeholders(d, location)?;
        }
        Ok(FieldMapping {
            target_path: non_empty(raw.target_path, location, "target_path")?,
            value,
            default: raw.default,
            transform: raw.transform,
            required: raw.required,
        })
    }

    fn calculation(&self, raw: RawCalculation, location: &str) -> Result<CalculationRule, RuleError> {
        let location = format!("{}({})", location, raw.name);
        let location = location.as_str();

        let inputs: Vec<Input> = raw
            .input
            .into_iter()
            .map(|(name, input)| match input {
                RawInput::Path(path) => Input {
                    name,
                    path,
                    context: ContextRef::Current,
                    default: None,
                },
                RawInput::Detailed(detail) => Input {
                    name,
                    path: detail.path,
                    context: detail.context,
                    default: detail.default,
                },
            })
            .collect();

        let mut lookups = BTreeMap::new();
        for (var, raw_lookup) in raw.lookup {
            if !inputs.iter().any(|i| i.name == var) {
                return Err(RuleError::invalid(
                    location,
                    format!("lookup for undeclared input '{}'", var),
                ));
            }
            let lookup = self.lookup(raw_lookup, &format!("{}.lookup.{}", location, var))?;
            lookups.insert(var, lookup);
        }

        let body = match (raw.formula, raw.logic) {
            (Some(text), None) => {
                let formula = Formula::parse(&text).map_err(|error| RuleError::Formula {
                    location: location.to_string(),
                    error,
                })?;
                for var in formula.variables() {
                    if !inputs.iter().any(|i| i.name == var) {
                        return Err(RuleError::invalid(
                            location,
                            format!("formula references undeclared input '{}'", var),
                        ));
                    }
                }
                CalculationBody::Formula(formula)
            }
            (None, Some(items)) => self.logic(items, &inputs, location)?,
            (Some(_), Some(_)) => {
                return Err(RuleError::invalid(
                    location,
                    "declares both 'formula' and 'logic'",
                ))
            }
            (None, None) => {
                return Err(RuleError::invalid(
                    location,
                    "needs either 'formula' or 'logic'",
                ))
            }
        };

        let output = raw.output.unwrap_or_else(|| raw.name.clone());

        Ok(CalculationRule {
            name: raw.name,
            inputs,
            lookups,
            body,
            output,
            rounding: raw.rounding,
        })
    }

    fn logic(
        &self,
        items: Vec<RawLogicItem>,
        inputs: &[Input],
        location: &str,
    ) -> Result<CalculationBody, RuleError> {
        let mut branches = Vec::new();
        let mut default = None;

        for (i, item) in items.into_iter().enumerate() {
            let item_location = format!("{}.logic[{}]", location, i);
            match (item.condition, item.output, item.default) {
                (Some(cond), Some(output), None) => {
                    let condition = self.condition(cond, inputs, &item_location)?;
                    branches.push(LogicBranch { condition, output });
                }
                (None, None, Some(d)) => {
                    if default.is_some() {
                        return Err(RuleError::invalid(&item_location, "second default branch"));
                    }
                    default = Some(d);
                }
                _ => {
                    return Err(RuleError::invalid(
                        &item_location,
                        "a logic branch is either {condition, output} or {default}",
                    ))
                }
            }
        }

        Ok(CalculationBody::Logic { branches, default })
    }

    fn condition(
        &self,
        raw: RawCondition,
        inputs: &[Input],
        location: &str,
    ) -> Result<Condition, RuleError> {
        let input = match raw.input {
            Some(name) => name,
            None if inputs.len() == 1 => inputs[0].name.clone(),
            None => {
                return Err(RuleError::invalid(
                    location,
                    "condition must name its 'input' when the rule has several inputs",
                ))
            }
        };
        if !inputs.iter().any(|i| i.name == input) {
            return Err(RuleError::invalid(
                location,
                format!("condition tests undeclared input '{}'", input),
            ));
        }

        let test = match (raw.equals, raw.in_set) {
            (Some(v), None) => ConditionTest::Equals(v),
            (None, Some(Value::Array(items))) => ConditionTest::OneOf(items),
            (None, Some(Value::String(path))) => self.category_ref(&path, location)?,
            (None, Some(_)) => {
                return Err(RuleError::invalid(
                    location,
                    "'in' must be a list or a 'constants.<table>.<category>' reference",
                ))
            }
            _ => {
                return Err(RuleError::invalid(
                    location,
                    "condition needs exactly one of 'equals' or 'in'",
                ))
            }
        };

        Ok(Condition {
            input,
            key_transform: raw.key_transform,
            test,
        })
    }

    fn category_ref(&self, path: &str, location: &str) -> Result<ConditionTest, RuleError> {
        let trimmed = strip_constants_prefix(path);
        let (table, category) = trimmed.split_once('.').ok_or_else(|| {
            RuleError::invalid(location, format!("'{}' is not a <table>.<category> reference", path))
        })?;
        let table_value = self.table(table, location)?;
        if !is_category_table(table_value) {
            return Err(RuleError::invalid(
                location,
                format!("constants table '{}' is not a category table", table),
            ));
        }
        if table_value.get(category).is_none() {
            return Err(RuleError::invalid(
                location,
                format!("constants table '{}' has no category '{}'", table, category),
            ));
        }
        Ok(ConditionTest::InCategory {
            table: table.to_string(),
            category: category.to_string(),
        })
    }

    fn lookup(&self, raw: RawLookup, location: &str) -> Result<Lookup, RuleError> {
        let table = strip_constants_prefix(&raw.source).to_string();
        self.table(&table, location)?;
        if let Some(ref d) = raw.default {
            self.check_placeholders(d, location)?;
        }
        Ok(Lookup {
            table,
            key: raw.key,
            context: raw.context,
            key_transform: raw.key_transform,
            default: raw.default,
        })
    }

    fn table(&self, name: &str, location: &str) -> Result<&Value, RuleError> {
        match self.constants.get(name) {
            Some(v) if v.is_object() => Ok(v),
            Some(_) => Err(RuleError::invalid(
                location,
                format!("constants entry '{}' is not a table", name),
            )),
            None => Err(RuleError::UnknownTable {
                location: location.to_string(),
                table: name.to_string(),
            }),
        }
    }

    fn step(&self, raw: RawStep, location: &str) -> Result<Step, RuleError> {
        let body = match (raw.mapping, raw.substeps, raw.aggregations) {
            (Some(mapping), None, None) => {
                StepBody::Mapping(self.directives(mapping, location, false)?)
            }
            (None, Some(substeps), None) => StepBody::Substeps(
                substeps
                    .into_iter()
                    .map(|s| {
                        let sub_location = format!("{}.substeps[{}]", location, s.name);
                        self.substep(s, &sub_location)
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (None, None, Some(aggs)) => StepBody::Aggregations(
                aggs.into_iter()
                    .enumerate()
                    .map(|(i, a)| self.aggregate(a, &format!("{}.aggregations[{}]", location, i)))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (None, None, None) => {
                return Err(RuleError::invalid(
                    location,
                    "step needs one of 'mapping', 'substeps' or 'aggregations'",
                ))
            }
            _ => {
                return Err(RuleError::invalid(
                    location,
                    "'mapping', 'substeps' and 'aggregations' are mutually exclusive",
                ))
            }
        };

        if raw.iteration && matches!(body, StepBody::Aggregations(_)) {
            return Err(RuleError::invalid(
                location,
                "aggregation steps summarize a collection and cannot iterate",
            ));
        }
        let produces_list = raw.iteration || matches!(body, StepBody::Substeps(_));
        if produces_list && raw.target.is_none() {
            return Err(RuleError::invalid(
                location,
                "a step that produces a list of records needs a 'target'",
            ));
        }

        Ok(Step {
            name: raw.name,
            source: raw.source,
            from: raw.from,
            target: raw.target,
            iteration: raw.iteration,
            body,
        })
    }

    fn substep(&self, raw: RawStep, location: &str) -> Result<Substep, RuleError> {
        if raw.substeps.is_some() {
            return Err(RuleError::invalid(
                location,
                "substeps support one level of nesting only",
            ));
        }
        if raw.aggregations.is_some() {
            return Err(RuleError::invalid(location, "substeps cannot aggregate"));
        }
        if raw.target.is_some() {
            return Err(RuleError::invalid(
                location,
                "substeps write into the enclosing step's target and take no 'target'",
            ));
        }
        if raw.from != DocumentRef::Source {
            return Err(RuleError::invalid(
                location,
                "substep sources are relative to the enclosing element",
            ));
        }
        let mapping = raw
            .mapping
            .ok_or_else(|| RuleError::invalid(location, "substep needs a 'mapping'"))?;
        Ok(Substep {
            name: raw.name,
            source: raw.source,
            iteration: raw.iteration,
            mapping: self.directives(mapping, location, true)?,
        })
    }

    /// `has_parent` is false for top-level step mappings, where no
    /// enclosing element exists for `context: parent` to resolve against.
    fn directives(
        &self,
        raw: Vec<RawDirective>,
        location: &str,
        has_parent: bool,
    ) -> Result<Vec<Directive>, RuleError> {
        raw.into_iter()
            .enumerate()
            .map(|(i, d)| self.directive(d, &format!("{}.mapping[{}]", location, i), has_parent))
            .collect()
    }

    fn directive(
        &self,
        raw: RawDirective,
        location: &str,
        has_parent: bool,
    ) -> Result<Directive, RuleError> {
        let kinds = [
            raw.source.is_some(),
            raw.calculation.is_some(),
            raw.fixed_value.is_some(),
            raw.lookup.is_some(),
            raw.mapping.is_some(),
            raw.function.is_some(),
        ];
        let count = kinds.iter().filter(|k| **k).count();
        if count != 1 {
            return Err(RuleError::invalid(
                location,
                format!(
                    "directive for '{}' needs exactly one of source, calculation, fixed_value, \
                     lookup, mapping, function (found {})",
                    raw.target, count
                ),
            ));
        }
        if raw.default.is_some() && raw.source.is_none() {
            return Err(RuleError::invalid(
                location,
                "'default' applies to source directives only",
            ));
        }
        if raw.select.is_some() && raw.calculation.is_none() {
            return Err(RuleError::invalid(
                location,
                "'select' applies to calculation directives only",
            ));
        }
        if raw.transform.is_some() && raw.source.is_none() {
            return Err(RuleError::invalid(
                location,
                "'transform' applies to source directives only",
            ));
        }
        let takes_collection = raw.function == Some(BuiltinFunction::EarliestDate);
        if !takes_collection && (raw.collection.is_some() || !raw.fields.is_empty()) {
            return Err(RuleError::invalid(
                location,
                "'collection' and 'fields' apply to earliest_date directives only",
            ));
        }
        let wants_parent = raw.context == ContextRef::Parent
            || raw
                .lookup
                .as_ref()
                .is_some_and(|l| l.context == ContextRef::Parent);
        if wants_parent && !has_parent {
            return Err(RuleError::invalid(
                location,
                "'context: parent' needs an enclosing element; use it inside substeps",
            ));
        }

        let kind = if let Some(path) = raw.source {
            if let Some(ref d) = raw.default {
                self.check_placeholders(d, location)?;
            }
            DirectiveKind::Source {
                path,
                context: raw.context,
                default: raw.default,
                transform: raw.transform.unwrap_or_default(),
            }
        } else if let Some(name) = raw.calculation {
            let rule = self.calculations.get(&name).ok_or_else(|| {
                RuleError::UnknownCalculation {
                    location: location.to_string(),
                    name: name.clone(),
                }
            })?;
            if !has_parent && reads_parent(rule) {
                return Err(RuleError::invalid(
                    location,
                    format!(
                        "calculation '{}' reads the parent context, which a top-level step does not have",
                        name
                    ),
                ));
            }
            if let Some(ref field) = raw.select {
                if !rule.lookups.contains_key(field) {
                    return Err(RuleError::invalid(
                        location,
                        format!(
                            "calculation '{}' exposes no auxiliary field '{}'",
                            name, field
                        ),
                    ));
                }
            }
            DirectiveKind::Calculation {
                name,
                select: raw.select,
            }
        } else if let Some(value) = raw.fixed_value {
            self.check_placeholders(&value, location)?;
            DirectiveKind::Fixed(value)
        } else if let Some(raw_lookup) = raw.lookup {
            let key = raw_lookup
                .key
                .clone()
                .ok_or_else(|| RuleError::invalid(location, "inline lookup needs a 'key' path"))?;
            let context = if raw.context == ContextRef::Parent {
                ContextRef::Parent
            } else {
                raw_lookup.context
            };
            let lookup = self.lookup(raw_lookup, location)?;
            DirectiveKind::Lookup {
                table: lookup.table,
                key,
                context,
                key_transform: lookup.key_transform,
                default: lookup.default,
            }
        } else if let Some(nested) = raw.mapping {
            DirectiveKind::Nested(
                nested
                    .into_iter()
                    .enumerate()
                    .map(|(i, d)| {
                        self.directive(d, &format!("{}.mapping[{}]", location, i), has_parent)
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )
        } else if let Some(function) = raw.function {
            if let Some(ref layout) = raw.format {
                if !DATE_LAYOUTS.contains(&layout.as_str()) {
                    return Err(RuleError::invalid(
                        location,
                        format!(
                            "unsupported date format '{}' (expected one of {})",
                            layout,
                            DATE_LAYOUTS.join(", ")
                        ),
                    ));
                }
            }
            DirectiveKind::Function(match function {
                BuiltinFunction::CurrentDate => FunctionCall::CurrentDate,
                BuiltinFunction::EarliestDate => {
                    let collection = raw.collection.ok_or_else(|| {
                        RuleError::invalid(location, "earliest_date needs a 'collection' path")
                    })?;
                    if raw.fields.is_empty() {
                        return Err(RuleError::invalid(
                            location,
                            "earliest_date needs at least one entry in 'fields'",
                        ));
                    }
                    FunctionCall::EarliestDate {
                        collection,
                        fields: raw.fields,
                    }
                }
            })
        } else {
            return Err(RuleError::invalid(location, "directive has no kind"));
        };

        Ok(Directive {
            target: non_empty(raw.target, location, "target")?,
            kind,
            format: raw.format,
            required: raw.required,
        })
    }

    fn aggregate(&self, raw: RawAggregate, location: &str) -> Result<AggregateDirective, RuleError> {
        let name = raw.name.unwrap_or_else(|| raw.target.clone());
        let location = format!("{}({})", location, name);
        let location = location.as_str();

        let kind = match (raw.aggregate, raw.formula) {
            (Some(agg), None) => {
                let source = raw.source.ok_or_else(|| {
                    RuleError::invalid(location, "collection aggregate needs a 'source'")
                })?;
                if agg.field.is_none() && agg.function != AggregateFunction::Count {
                    return Err(RuleError::invalid(
                        location,
                        format!("'{:?}' aggregate needs a 'field'", agg.function).to_lowercase(),
                    ));
                }
                let filter = match (raw.filter, agg.filter) {
                    (Some(_), Some(_)) => {
                        return Err(RuleError::invalid(location, "filter declared twice"))
                    }
                    (outer, inner) => outer.or(inner),
                };
                AggregateKind::Collection {
                    source,
                    function: agg.function,
                    field: agg.field,
                    filter,
                }
            }
            (None, Some(text)) => AggregateKind::Formula(Formula::parse(&text).map_err(
                |error| RuleError::Formula {
                    location: location.to_string(),
                    error,
                },
            )?),
            (Some(_), Some(_)) => {
                return Err(RuleError::invalid(
                    location,
                    "declares both 'aggregate' and 'formula'",
                ))
            }
            (None, None) => {
                return Err(RuleError::invalid(
                    location,
                    "needs either 'aggregate' or 'formula'",
                ))
            }
        };

        Ok(AggregateDirective {
            name,
            target: non_empty(raw.target, location, "target")?,
            rounding: raw.rounding,
            kind,
        })
    }

    /// Every `${...}` placeholder inside a literal must name a constant.
    fn check_placeholders(&self, value: &Value, location: &str) -> Result<(), RuleError> {
        match value {
            Value::String(text) => {
                for ph in placeholders(text) {
                    let resolved = ph
                        .path
                        .strip_prefix("constants.")
                        .and_then(|path| constant_at(self.constants, path));
                    if resolved.is_none() {
                        return Err(RuleError::invalid(
                            location,
                            format!("placeholder '${{{}}}' does not name a constant", ph.path),
                        ));
                    }
                }
                Ok(())
            }
            Value::Array(items) => items
                .iter()
                .try_for_each(|v| self.check_placeholders(v, location)),
            Value::Object(map) => map
                .values()
                .try_for_each(|v| self.check_placeholders(v, location)),
            _ => Ok(()),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Layouts accepted in the `format` of a `current_date` directive.
pub const DATE_LAYOUTS: [&str; 3] = ["YYYY-MM-DD", "YYYY-MM", "YYYY"];

fn non_empty(s: String, location: &str, field: &str) -> Result<String, RuleError> {
    if s.trim().is_empty() {
        Err(RuleError::invalid(location, format!("'{}' is empty", field)))
    } else {
        Ok(s)
    }
}

fn reads_parent(rule: &CalculationRule) -> bool {
    rule.inputs.iter().any(|i| i.context == ContextRef::Parent)
        || rule
            .lookups
            .values()
            .any(|l| l.key.is_some() && l.context == ContextRef::Parent)
}

/// `constants.emission_factors` and `emission_factors` name the same table.
pub fn strip_constants_prefix(path: &str) -> &str {
    path.strip_prefix("constants.").unwrap_or(path)
}

/// A table whose every value is a list of strings maps categories to keys.
pub fn is_category_table(table: &Value) -> bool {
    match table.as_object() {
        Some(map) if !map.is_empty() => map.values().all(|v| {
            v.as_array()
                .is_some_and(|items| items.iter().all(Value::is_string))
        }),
        _ => false,
    }
}

fn constant_at<'a>(constants: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = constants.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}
