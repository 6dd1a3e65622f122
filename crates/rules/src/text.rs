//! Text transforms applied to lookup keys and copied string values, and
//! the `${...}` placeholder syntax used in literal values.

use serde::{Deserialize, Serialize};

/// Normalization applied to a string before it is used as a lookup key
/// or written to the target document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextTransform {
    /// Exact match, value left untouched.
    #[default]
    None,
    /// `"Natural Gas"` -> `natural_gas`, `"naturalGas"` -> `natural_gas`.
    LowercaseUnderscore,
    Lowercase,
    Uppercase,
    /// First letter of each of the first three words, uppercased:
    /// `"Small Factory Co."` -> `SFC`.
    Initials,
}

impl TextTransform {
    pub fn apply(self, text: &str) -> String {
        match self {
            TextTransform::None => text.to_string(),
            TextTransform::LowercaseUnderscore => lowercase_underscore(text),
            TextTransform::Lowercase => text.to_lowercase(),
            TextTransform::Uppercase => text.to_uppercase(),
            TextTransform::Initials => initials(text),
        }
    }

    /// Apply the transform to a JSON value. Non-string values pass through.
    pub fn apply_value(self, value: serde_json::Value) -> serde_json::Value {
        match (self, value) {
            (TextTransform::None, v) => v,
            (t, serde_json::Value::String(s)) => serde_json::Value::String(t.apply(&s)),
            (_, v) => v,
        }
    }
}

/// Lowercase a key, turning whitespace runs, underscore runs and camelCase
/// boundaries into a single underscore.
///
/// A boundary sits before an uppercase letter that follows a lowercase
/// letter or digit, and before the last uppercase letter of an acronym
/// that is followed by a lowercase letter (`PDFFile` -> `pdf_file`).
/// The output contains no uppercase letters and no whitespace, so
/// applying the transform twice is the same as applying it once.
pub fn lowercase_underscore(text: &str) -> String {
    let chars: Vec<char> = text.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_whitespace() || c == '_' {
            if !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() && i > 0 && !out.ends_with('_') {
            let prev = chars[i - 1];
            let next = chars.get(i + 1).copied();
            let after_lower = prev.is_lowercase() || prev.is_ascii_digit();
            let acronym_end = prev.is_uppercase() && next.is_some_and(|n| n.is_lowercase());
            if after_lower || acronym_end {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }

    out
}

/// Abbreviate a name to the initials of its first three words.
pub fn initials(text: &str) -> String {
    text.split_whitespace()
        .take(3)
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .collect()
}

// ── Placeholders ────────────────────────────────────────────────────

/// A `${path}` reference found inside a literal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder<'a> {
    /// Byte offset of the `$`.
    pub start: usize,
    /// Byte offset one past the closing `}`.
    pub end: usize,
    /// The text between the braces, trimmed.
    pub path: &'a str,
}

/// Find every `${...}` placeholder in `text`, in order. An unterminated
/// `${` is literal text.
pub fn placeholders(text: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let mut offset = 0;

    while let Some(rel) = text[offset..].find("${") {
        let start = offset + rel;
        let Some(close) = text[start + 2..].find('}') else {
            break;
        };
        let end = start + 2 + close + 1;
        found.push(Placeholder {
            start,
            end,
            path: text[start + 2..end - 1].trim(),
        });
        offset = end;
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spaces_become_underscores() {
        assert_eq!(lowercase_underscore("Natural Gas"), "natural_gas");
        assert_eq!(lowercase_underscore("  Fuel   Oil "), "fuel_oil");
    }

    #[test]
    fn camel_case_boundaries() {
        assert_eq!(lowercase_underscore("naturalGas"), "natural_gas");
        assert_eq!(lowercase_underscore("NaturalGas"), "natural_gas");
        assert_eq!(lowercase_underscore("PDFFile"), "pdf_file");
        assert_eq!(lowercase_underscore("scope2Electricity"), "scope2_electricity");
    }

    #[test]
    fn all_caps_is_one_word() {
        assert_eq!(lowercase_underscore("ELECTRICITY"), "electricity");
        assert_eq!(lowercase_underscore("LPG"), "lpg");
    }

    #[test]
    fn idempotent_on_normalized_input() {
        for key in ["Natural Gas", "naturalGas", "ELECTRICITY", "fuel_oil", "A B  C"] {
            let once = lowercase_underscore(key);
            assert_eq!(lowercase_underscore(&once), once, "not idempotent for {key:?}");
        }
    }

    #[test]
    fn existing_underscore_not_doubled() {
        assert_eq!(lowercase_underscore("natural_Gas"), "natural_gas");
        assert_eq!(lowercase_underscore("natural _gas"), "natural_gas");
    }

    #[test]
    fn initials_take_first_three_words() {
        assert_eq!(initials("Small Factory Co."), "SFC");
        assert_eq!(initials("acme manufacturing ltd holdings"), "AML");
        assert_eq!(initials("  Solo "), "S");
        assert_eq!(initials(""), "");
        let t: TextTransform = serde_json::from_value(json!("initials")).unwrap();
        assert_eq!(t.apply_value(json!("Empty Org")), json!("EO"));
    }

    #[test]
    fn apply_value_leaves_numbers_alone() {
        let t = TextTransform::Uppercase;
        assert_eq!(t.apply_value(json!("kwh")), json!("KWH"));
        assert_eq!(t.apply_value(json!(12)), json!(12));
    }

    #[test]
    fn deserializes_from_snake_case() {
        let t: TextTransform = serde_json::from_value(json!("lowercase_underscore")).unwrap();
        assert_eq!(t, TextTransform::LowercaseUnderscore);
        let t: TextTransform = serde_json::from_value(json!("none")).unwrap();
        assert_eq!(t, TextTransform::None);
    }

    #[test]
    fn finds_placeholders_in_order() {
        let text = "${constants.a} and ${ constants.b.c }";
        let found = placeholders(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].path, "constants.a");
        assert_eq!(found[0].start, 0);
        assert_eq!(found[0].end, 14);
        assert_eq!(found[1].path, "constants.b.c");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert!(placeholders("cost ${constants.a").is_empty());
        assert!(placeholders("no tokens here").is_empty());
    }
}
