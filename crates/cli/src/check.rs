use std::path::Path;

use serde::Serialize;

use carbonmap_rules::RuleDocument;

use crate::{load_rules, OutputFormat};

/// Counts reported by `carbonmap check`.
#[derive(Debug, Serialize)]
struct RuleSummary<'a> {
    valid: bool,
    name: Option<&'a str>,
    version: Option<&'a str>,
    constants_tables: usize,
    field_mappings: usize,
    calculation_rules: usize,
    transformation_steps: usize,
    aggregations: usize,
}

impl<'a> RuleSummary<'a> {
    fn of(rules: &'a RuleDocument) -> Self {
        RuleSummary {
            valid: true,
            name: rules.name(),
            version: rules.metadata.get("version").and_then(|v| v.as_str()),
            constants_tables: rules.constants.len(),
            field_mappings: rules.field_mappings.len(),
            calculation_rules: rules.calculation_rules.len(),
            transformation_steps: rules.transformation_steps.len(),
            aggregations: rules.aggregations.len(),
        }
    }
}

pub(crate) fn cmd_check(rules_path: &Path, output: OutputFormat, quiet: bool) {
    // Exits with status 1 on any load or validation error.
    let rules = load_rules(rules_path, output, quiet);
    let summary = RuleSummary::of(&rules);

    match output {
        OutputFormat::Text => {
            if quiet {
                return;
            }
            println!("valid: {}", summary.name.unwrap_or("(unnamed rule document)"));
            if let Some(version) = summary.version {
                println!("  version:              {}", version);
            }
            println!("  constants tables:     {}", summary.constants_tables);
            println!("  field mappings:       {}", summary.field_mappings);
            println!("  calculation rules:    {}", summary.calculation_rules);
            println!("  transformation steps: {}", summary.transformation_steps);
            println!("  aggregations:         {}", summary.aggregations);
        }
        OutputFormat::Json => match serde_json::to_string_pretty(&summary) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("error serializing summary: {}", e),
        },
    }
}
