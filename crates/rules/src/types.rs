//! Validated rule document model.
//!
//! Everything here has passed load-time validation: directive kinds are
//! exclusive, formulas are parsed, calculation and constants-table
//! references resolve. The engine consumes these types read-only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::formula::Formula;
use crate::text::TextTransform;

/// Root of a parsed transformation rule document.
#[derive(Debug, Clone)]
pub struct RuleDocument {
    /// Free-form description block, never interpreted.
    pub metadata: serde_json::Map<String, Value>,
    pub options: Options,
    pub root_mapping: Option<RootMapping>,
    /// Constants tables keyed by table name.
    pub constants: BTreeMap<String, Value>,
    pub field_mappings: Vec<FieldMapping>,
    /// Calculation rules keyed by their unique name.
    pub calculation_rules: BTreeMap<String, CalculationRule>,
    pub transformation_steps: Vec<Step>,
    /// Aggregates run after every transformation step.
    pub aggregations: Vec<AggregateDirective>,
}

impl RuleDocument {
    pub fn calculation(&self, name: &str) -> Option<&CalculationRule> {
        self.calculation_rules.get(name)
    }

    /// Human-readable name from `metadata.name`, if any.
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(Value::as_str)
    }
}

/// Document-wide switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Drop absent directive results instead of rendering them as `null`.
    #[serde(default)]
    pub omit_absent: bool,
}

/// Initial `@type` / `@context` of the target document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMapping {
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_context: Option<serde_json::Map<String, Value>>,
}

/// Which element of the context stack a path resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRef {
    #[default]
    Current,
    Parent,
}

/// Which document a step's `source` is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentRef {
    #[default]
    Source,
    Target,
}

// ── Field mappings ──────────────────────────────────────────────────

/// Top-level copy from the source root into the target root.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub target_path: String,
    pub value: FieldValue,
    pub default: Option<Value>,
    pub transform: TextTransform,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Source(String),
    Fixed(Value),
}

// ── Calculations ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CalculationRule {
    pub name: String,
    pub inputs: Vec<Input>,
    /// Lookup substitutions keyed by input variable name.
    pub lookups: BTreeMap<String, Lookup>,
    pub body: CalculationBody,
    /// Name of the produced field.
    pub output: String,
    pub rounding: Option<u32>,
}

impl CalculationRule {
    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

/// A named input variable resolved against the context stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub name: String,
    pub path: String,
    pub context: ContextRef,
    pub default: Option<Value>,
}

/// Table lookup against the constants store.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub table: String,
    /// Key path; `None` means "use the variable's own resolved value".
    pub key: Option<String>,
    pub context: ContextRef,
    pub key_transform: TextTransform,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalculationBody {
    Formula(Formula),
    Logic {
        branches: Vec<LogicBranch>,
        default: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicBranch {
    pub condition: Condition,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Input variable the condition tests.
    pub input: String,
    pub key_transform: TextTransform,
    pub test: ConditionTest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionTest {
    Equals(Value),
    OneOf(Vec<Value>),
    /// Membership in one category of a category table.
    InCategory { table: String, category: String },
}

// ── Transformation steps ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub source: Option<String>,
    pub from: DocumentRef,
    pub target: Option<String>,
    pub iteration: bool,
    pub body: StepBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepBody {
    Mapping(Vec<Directive>),
    Substeps(Vec<Substep>),
    Aggregations(Vec<AggregateDirective>),
}

/// A nested step, run once per element of the enclosing step.
#[derive(Debug, Clone, PartialEq)]
pub struct Substep {
    pub name: String,
    /// Path relative to the enclosing element.
    pub source: Option<String>,
    pub iteration: bool,
    pub mapping: Vec<Directive>,
}

// ── Directives ──────────────────────────────────────────────────────

/// One target-field production instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub target: String,
    pub kind: DirectiveKind,
    /// Template with a `{value}` placeholder.
    pub format: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveKind {
    Source {
        path: String,
        context: ContextRef,
        default: Option<Value>,
        transform: TextTransform,
    },
    Calculation {
        name: String,
        /// Auxiliary field to write instead of the primary output.
        select: Option<String>,
    },
    Fixed(Value),
    Lookup {
        table: String,
        key: String,
        context: ContextRef,
        key_transform: TextTransform,
        default: Option<Value>,
    },
    /// Nested object built from its own directive list.
    Nested(Vec<Directive>),
    Function(FunctionCall),
}

/// Name of a built-in function as written in a rule file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinFunction {
    CurrentDate,
    EarliestDate,
}

/// A built-in function directive with its arguments. The `format` of a
/// function directive is one of the date layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionCall {
    /// The report date injected by the caller.
    CurrentDate,
    /// Earliest date under any of `fields` across the elements of
    /// `collection`, or the report date when there is none.
    EarliestDate {
        collection: String,
        fields: Vec<String>,
    },
}

// ── Aggregates ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDirective {
    pub name: String,
    pub target: String,
    pub rounding: Option<u32>,
    pub kind: AggregateKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateKind {
    Collection {
        source: String,
        function: AggregateFunction,
        field: Option<String>,
        filter: Option<Filter>,
    },
    /// Formula over scalars already present in the target document.
    Formula(Formula),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    #[serde(alias = "avg")]
    Average,
}

/// Equality predicate on one field of each element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub equals: Value,
}
