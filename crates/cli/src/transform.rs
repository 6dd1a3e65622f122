use std::path::Path;
use std::process;

use time::macros::format_description;
use time::{Date, OffsetDateTime};

use carbonmap_engine::{transform, Diagnostic, TransformOptions};

use crate::{load_rules, read_json, report_error, OutputFormat};

/// Exit status when `--strict` is set and the run recorded diagnostics.
const STRICT_FAILURE: i32 = 2;

pub(crate) struct TransformArgs<'a> {
    pub rules: &'a Path,
    pub source: &'a Path,
    pub out: Option<&'a Path>,
    pub report_date: Option<&'a str>,
    pub strict: bool,
    pub output: OutputFormat,
    pub quiet: bool,
}

pub(crate) fn cmd_transform(args: TransformArgs<'_>) {
    let (output, quiet) = (args.output, args.quiet);

    let rules = load_rules(args.rules, output, quiet);
    let source = read_json(args.source, output, quiet);

    let current_date = match report_date(args.report_date) {
        Ok(d) => d,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };

    let options = TransformOptions {
        current_date: Some(current_date),
    };
    let result = match transform(&rules, &source, &options) {
        Ok(r) => r,
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(1);
        }
    };

    let pretty = match serde_json::to_string_pretty(&result.document) {
        Ok(s) => s,
        Err(e) => {
            report_error(&format!("error serializing target document: {}", e), output, quiet);
            process::exit(1);
        }
    };

    match args.out {
        Some(path) => {
            if let Err(e) = std::fs::write(path, format!("{}\n", pretty)) {
                let msg = format!("error writing '{}': {}", path.display(), e);
                report_error(&msg, output, quiet);
                process::exit(1);
            }
            tracing::info!(path = %path.display(), "target document written");
        }
        None => println!("{}", pretty),
    }

    if !quiet {
        print_diagnostics(&result.diagnostics, output);
    }

    if args.strict && !result.diagnostics.is_empty() {
        process::exit(STRICT_FAILURE);
    }
}

/// Validate an explicit report date, or take today's date in UTC.
fn report_date(explicit: Option<&str>) -> Result<String, String> {
    let format = format_description!("[year]-[month]-[day]");
    let date = match explicit {
        Some(s) => Date::parse(s, format)
            .map_err(|e| format!("invalid --report-date '{}': {}", s, e))?,
        None => OffsetDateTime::now_utc().date(),
    };
    date.format(format)
        .map_err(|e| format!("error formatting report date: {}", e))
}

fn print_diagnostics(diagnostics: &[Diagnostic], output: OutputFormat) {
    if diagnostics.is_empty() {
        return;
    }
    match output {
        OutputFormat::Text => {
            for d in diagnostics {
                eprintln!("{}", d);
            }
        }
        OutputFormat::Json => {
            let value = serde_json::json!({ "diagnostics": diagnostics });
            eprintln!("{}", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_report_date_is_checked() {
        assert_eq!(report_date(Some("2024-02-15")).unwrap(), "2024-02-15");
        assert!(report_date(Some("2024-02-30")).is_err());
        assert!(report_date(Some("15/02/2024")).is_err());
    }

    #[test]
    fn default_report_date_is_iso_formatted() {
        let today = report_date(None).unwrap();
        assert_eq!(today.len(), 10);
        assert_eq!(&today[4..5], "-");
        assert_eq!(&today[7..8], "-");
    }
}
