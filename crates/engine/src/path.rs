//! Dotted path resolution and writing over JSON trees.
//!
//! Paths are dot-separated field names. A leading `$.` addresses the
//! current context explicitly and `$` alone (or an empty path) is the
//! context itself. Arrays are never indexed; they are only walked by
//! iterating steps.

use serde_json::{Map, Value};

use carbonmap_rules::ContextRef;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("cannot write '{path}': '{at}' is not an object")]
    NotAContainer { path: String, at: String },
    #[error("cannot append to '{path}': existing value is not a list")]
    NotAList { path: String },
    #[error("cannot write to an empty path")]
    Empty,
}

/// Split a path into its field names, dropping the `$` prefix.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim();
    let body = match trimmed.strip_prefix('$') {
        Some(rest) => rest.strip_prefix('.').unwrap_or(rest),
        None => trimmed,
    };
    body.split('.').filter(|s| !s.is_empty())
}

/// Resolve `path` against `context`. Missing keys, non-object
/// intermediates and explicit `null` all resolve to `None`.
pub fn resolve<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for key in segments(path) {
        current = current.as_object()?.get(key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Write `value` at `path`, creating intermediate objects. A `null`
/// intermediate is replaced by an object; any other non-object is an error.
pub fn write(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let keys: Vec<&str> = segments(path).collect();
    let (leaf, parents) = keys.split_last().ok_or(PathError::Empty)?;
    let parent = container_at(root, path, parents)?;
    parent.insert((*leaf).to_string(), value);
    Ok(())
}

/// Extend the list at `path` with `items`, creating it when absent.
pub fn append(root: &mut Value, path: &str, items: Vec<Value>) -> Result<(), PathError> {
    let keys: Vec<&str> = segments(path).collect();
    let (leaf, parents) = keys.split_last().ok_or(PathError::Empty)?;
    let parent = container_at(root, path, parents)?;
    let slot = parent
        .entry((*leaf).to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(list) => {
            list.extend(items);
            Ok(())
        }
        _ => Err(PathError::NotAList {
            path: path.to_string(),
        }),
    }
}

/// Shallow-merge the fields of `object` into the root object.
pub fn merge(root: &mut Value, object: Map<String, Value>) -> Result<(), PathError> {
    let map = as_container(root, "$", "$")?;
    map.extend(object);
    Ok(())
}

fn container_at<'a>(
    root: &'a mut Value,
    path: &str,
    keys: &[&str],
) -> Result<&'a mut Map<String, Value>, PathError> {
    let mut current = as_container(root, path, "$")?;
    for (i, key) in keys.iter().enumerate() {
        let slot = current
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = as_container(slot, path, &keys[..=i].join("."))?;
    }
    Ok(current)
}

fn as_container<'a>(
    value: &'a mut Value,
    path: &str,
    at: &str,
) -> Result<&'a mut Map<String, Value>, PathError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(PathError::NotAContainer {
            path: path.to_string(),
            at: at.to_string(),
        }),
    }
}

// ──────────────────────────────────────────────
// Context stack
// ──────────────────────────────────────────────

/// The iteration context a directive resolves against: the current
/// element and, inside a substep, the enclosing element.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub current: &'a Value,
    pub parent: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn top(current: &'a Value) -> Self {
        Scope {
            current,
            parent: None,
        }
    }

    pub fn nested(current: &'a Value, parent: &'a Value) -> Self {
        Scope {
            current,
            parent: Some(parent),
        }
    }

    pub fn context(&self, which: ContextRef) -> Option<&'a Value> {
        match which {
            ContextRef::Current => Some(self.current),
            ContextRef::Parent => self.parent,
        }
    }

    /// Resolve `path` against the selected context.
    pub fn resolve(&self, which: ContextRef, path: &str) -> Option<&'a Value> {
        self.context(which).and_then(|ctx| resolve(ctx, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_dotted_and_dollar_paths() {
        let doc = json!({ "energy_type": { "name": "Electricity" }, "amount": 12500 });
        assert_eq!(resolve(&doc, "amount"), Some(&json!(12500)));
        assert_eq!(resolve(&doc, "$.energy_type.name"), Some(&json!("Electricity")));
        assert_eq!(resolve(&doc, "$"), Some(&doc));
        assert_eq!(resolve(&doc, ""), Some(&doc));
    }

    #[test]
    fn resolve_missing_is_absent() {
        let doc = json!({ "a": { "b": 1 }, "n": null, "list": [1, 2] });
        assert_eq!(resolve(&doc, "a.c"), None);
        assert_eq!(resolve(&doc, "a.b.c"), None);
        assert_eq!(resolve(&doc, "n"), None);
        assert_eq!(resolve(&doc, "list.0"), None);
    }

    #[test]
    fn write_creates_intermediates() {
        let mut doc = json!({});
        write(&mut doc, "report.totals.scope1", json!(1.5)).unwrap();
        assert_eq!(doc, json!({ "report": { "totals": { "scope1": 1.5 } } }));

        write(&mut doc, "report.totals.scope1", json!(2.5)).unwrap();
        assert_eq!(doc["report"]["totals"]["scope1"], json!(2.5));
    }

    #[test]
    fn write_through_scalar_is_error() {
        let mut doc = json!({ "report": "done" });
        let err = write(&mut doc, "report.total", json!(1)).unwrap_err();
        assert_eq!(
            err,
            PathError::NotAContainer {
                path: "report.total".to_string(),
                at: "report".to_string()
            }
        );
    }

    #[test]
    fn write_empty_path_is_error() {
        let mut doc = json!({});
        assert_eq!(write(&mut doc, "$", json!(1)), Err(PathError::Empty));
    }

    #[test]
    fn append_creates_and_extends() {
        let mut doc = json!({});
        append(&mut doc, "emissions", vec![]).unwrap();
        assert_eq!(doc, json!({ "emissions": [] }));

        append(&mut doc, "emissions", vec![json!({ "a": 1 })]).unwrap();
        append(&mut doc, "emissions", vec![json!({ "a": 2 })]).unwrap();
        assert_eq!(doc["emissions"], json!([{ "a": 1 }, { "a": 2 }]));
    }

    #[test]
    fn append_to_non_list_is_error() {
        let mut doc = json!({ "emissions": { "a": 1 } });
        assert!(matches!(
            append(&mut doc, "emissions", vec![json!(1)]),
            Err(PathError::NotAList { .. })
        ));
    }

    #[test]
    fn merge_into_root() {
        let mut doc = json!({ "@type": "ghg:Report" });
        let mut fields = Map::new();
        fields.insert("report_date".to_string(), json!("2024-03-01"));
        merge(&mut doc, fields).unwrap();
        assert_eq!(doc, json!({ "@type": "ghg:Report", "report_date": "2024-03-01" }));
    }

    #[test]
    fn scope_parent_resolution() {
        let outer = json!({ "facility": "Plant A" });
        let inner = json!({ "amount": 10 });
        let scope = Scope::nested(&inner, &outer);
        assert_eq!(scope.resolve(ContextRef::Parent, "facility"), Some(&json!("Plant A")));
        assert_eq!(scope.resolve(ContextRef::Current, "facility"), None);

        let top = Scope::top(&inner);
        assert_eq!(top.resolve(ContextRef::Parent, "facility"), None);
    }
}
