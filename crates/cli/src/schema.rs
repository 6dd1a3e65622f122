use std::path::Path;
use std::process;

use serde_json::Value;

use carbonmap_engine::{DocumentValidator, Severity, ValidationIssue, ValidationReport};

use crate::{read_json, report_error, OutputFormat};

/// [`DocumentValidator`] backed by a compiled JSON Schema.
pub(crate) struct SchemaValidator {
    validator: jsonschema::Validator,
}

impl SchemaValidator {
    pub(crate) fn new(schema: &Value) -> Result<Self, String> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| format!("invalid schema: {}", e))?;
        Ok(SchemaValidator { validator })
    }
}

impl DocumentValidator for SchemaValidator {
    fn validate(&self, document: &Value) -> ValidationReport {
        let issues = self
            .validator
            .iter_errors(document)
            .map(|e| ValidationIssue {
                severity: Severity::Error,
                path: e.instance_path().as_str().to_string(),
                message: format!("{}", e),
            })
            .collect();
        ValidationReport::from_issues(issues)
    }
}

pub(crate) fn cmd_validate(document_path: &Path, schema_path: &Path, output: OutputFormat, quiet: bool) {
    let schema = read_json(schema_path, output, quiet);
    let validator = match SchemaValidator::new(&schema) {
        Ok(v) => v,
        Err(msg) => {
            let msg = format!("{} ('{}')", msg, schema_path.display());
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    let document = read_json(document_path, output, quiet);

    let report = validator.validate(&document);
    tracing::debug!(issues = report.issues.len(), "schema validation finished");

    if report.valid {
        if !quiet {
            match output {
                OutputFormat::Text => println!("valid"),
                OutputFormat::Json => println!("{{\"valid\": true}}"),
            }
        }
        return;
    }

    if !quiet {
        match output {
            OutputFormat::Text => {
                eprintln!("invalid: {}", document_path.display());
                for issue in &report.issues {
                    if issue.path.is_empty() {
                        eprintln!("  - {}", issue.message);
                    } else {
                        eprintln!("  - {}: {}", issue.path, issue.message);
                    }
                }
            }
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!(report));
            }
        }
    }
    process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SchemaValidator {
        SchemaValidator::new(&json!({
            "type": "object",
            "required": ["total_emissions"],
            "properties": { "total_emissions": { "type": "number", "minimum": 0 } }
        }))
        .unwrap()
    }

    #[test]
    fn conforming_document_is_valid() {
        let report = validator().validate(&json!({ "total_emissions": 12175.5 }));
        assert!(report.valid);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn each_violation_becomes_an_error_issue() {
        let report = validator().validate(&json!({ "total_emissions": -1 }));
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, Severity::Error);

        let report = validator().validate(&json!({}));
        assert!(!report.valid);
    }

    #[test]
    fn issues_carry_instance_pointers() {
        let validator = SchemaValidator::new(&json!({
            "type": "object",
            "properties": {
                "emissions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "co2_amount": { "type": "number" } }
                    }
                }
            }
        }))
        .unwrap();
        let report = validator.validate(&json!({ "emissions": [{ "co2_amount": "x" }] }));
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].path, "/emissions/0/co2_amount");
        assert!(report.issues[0].message.contains("number"), "{}", report.issues[0].message);
    }

    #[test]
    fn malformed_schema_is_rejected() {
        assert!(SchemaValidator::new(&json!({ "type": 12 })).is_err());
    }
}
