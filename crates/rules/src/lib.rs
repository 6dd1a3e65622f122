//! carbonmap-rules: rule document model and loader.
//!
//! A rule document declares how a source activity document becomes a
//! target emission report: constants tables, named calculation rules,
//! ordered transformation steps and document-level aggregates. This
//! crate parses YAML or JSON rule files into the typed model in
//! [`types`] and rejects malformed documents up front, so the engine
//! never sees an unknown calculation, table or formula variable.

pub mod deserialize;
pub mod formula;
pub mod text;
pub mod types;

pub use deserialize::{from_json_value, from_yaml_str, is_category_table, RuleError};
pub use formula::{Formula, FormulaError, Operand, Operator};
pub use text::TextTransform;
pub use types::*;
