//! Read-only view over the rule document's `constants` section.

use std::collections::BTreeMap;

use serde_json::Value;

use carbonmap_rules::deserialize::strip_constants_prefix;
use carbonmap_rules::text::placeholders;
use carbonmap_rules::{is_category_table, TextTransform};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("unknown constants table '{table}'")]
    UnknownTable { table: String },
    #[error("no key '{key}' in constants table '{table}'")]
    MissingKey { table: String, key: String },
    #[error("lookup key must be a string or number, got {value}")]
    InvalidKey { value: String },
    #[error("placeholder '${{{token}}}' does not name a constant")]
    UnresolvedPlaceholder { token: String },
}

/// Constants tables, shared by reference across one transform run.
#[derive(Debug, Clone, Copy)]
pub struct ConstantsStore<'r> {
    tables: &'r BTreeMap<String, Value>,
}

impl<'r> ConstantsStore<'r> {
    pub fn new(tables: &'r BTreeMap<String, Value>) -> Self {
        ConstantsStore { tables }
    }

    pub fn table(&self, name: &str) -> Option<&'r Value> {
        self.tables.get(strip_constants_prefix(name))
    }

    /// Look `key` up in `table` after applying `transform`. A missing key
    /// falls back to `default` (itself interpolated); without a default it
    /// is an error, never a silent zero.
    pub fn lookup(
        &self,
        table: &str,
        key: &Value,
        transform: TextTransform,
        default: Option<&Value>,
    ) -> Result<Value, LookupError> {
        let entries = self
            .table(table)
            .and_then(Value::as_object)
            .ok_or_else(|| LookupError::UnknownTable {
                table: table.to_string(),
            })?;
        let key = transform.apply(&key_text(key)?);
        match entries.get(&key) {
            Some(found) if !found.is_null() => Ok(found.clone()),
            _ => match default {
                Some(d) => self.interpolate(d),
                None => Err(LookupError::MissingKey {
                    table: strip_constants_prefix(table).to_string(),
                    key,
                }),
            },
        }
    }

    /// The category of a category table whose list contains `key`.
    pub fn classify(&self, table: &str, key: &str) -> Option<&'r str> {
        let value = self.table(table)?;
        if !is_category_table(value) {
            return None;
        }
        value.as_object()?.iter().find_map(|(category, members)| {
            members
                .as_array()?
                .iter()
                .any(|m| m.as_str() == Some(key))
                .then_some(category.as_str())
        })
    }

    /// Resolve `constants.a.b` (or `a.b`) to the value it names.
    pub fn resolve_path(&self, path: &str) -> Option<&'r Value> {
        let mut parts = strip_constants_prefix(path.trim()).split('.');
        let mut current = self.tables.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Replace `${constants...}` tokens inside a literal. A string that is
    /// exactly one token takes the referenced value with its JSON type;
    /// embedded tokens are substituted as text. Arrays and objects are
    /// interpolated element-wise.
    pub fn interpolate(&self, value: &Value) -> Result<Value, LookupError> {
        match value {
            Value::String(text) => self.interpolate_str(text),
            Value::Array(items) => items
                .iter()
                .map(|v| self.interpolate(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.interpolate(v)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn interpolate_str(&self, text: &str) -> Result<Value, LookupError> {
        let tokens = placeholders(text);
        if tokens.is_empty() {
            return Ok(Value::String(text.to_string()));
        }

        let resolve = |token: &str| {
            token
                .strip_prefix("constants.")
                .and_then(|_| self.resolve_path(token))
                .ok_or_else(|| LookupError::UnresolvedPlaceholder {
                    token: token.to_string(),
                })
        };

        if tokens.len() == 1 && tokens[0].start == 0 && tokens[0].end == text.len() {
            return resolve(tokens[0].path).cloned();
        }

        let mut out = String::with_capacity(text.len());
        let mut offset = 0;
        for token in &tokens {
            out.push_str(&text[offset..token.start]);
            out.push_str(&display(resolve(token.path)?));
            offset = token.end;
        }
        out.push_str(&text[offset..]);
        Ok(Value::String(out))
    }
}

/// Text form of a lookup key.
pub fn key_text(key: &Value) -> Result<String, LookupError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(LookupError::InvalidKey {
            value: other.to_string(),
        }),
    }
}

/// Render a value for textual substitution: strings without quotes,
/// everything else as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
