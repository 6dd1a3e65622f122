mod check;
mod schema;
mod transform;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use carbonmap_rules::RuleDocument;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Rule-driven transformation of manufacturing activity data into GHG
/// emission reports.
#[derive(Parser)]
#[command(
    name = "carbonmap",
    version,
    about = "Transform manufacturing activity data into GHG emission reports"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a rule document to a source JSON-LD document
    Transform {
        /// Path to the rule document (YAML, or JSON with a .json extension)
        rules: PathBuf,
        /// Path to the source JSON-LD document
        source: PathBuf,
        /// Write the target document here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// Report date (YYYY-MM-DD); defaults to today in UTC
        #[arg(long)]
        report_date: Option<String>,
        /// Exit with status 2 when any diagnostic was recorded
        #[arg(long)]
        strict: bool,
    },

    /// Load and validate a rule document
    Check {
        /// Path to the rule document
        rules: PathBuf,
    },

    /// Validate a target document against a JSON Schema
    Validate {
        /// Path to the JSON document to validate
        document: PathBuf,
        /// Path to the JSON Schema
        #[arg(long)]
        schema: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Transform {
            rules,
            source,
            out,
            report_date,
            strict,
        } => {
            transform::cmd_transform(transform::TransformArgs {
                rules: &rules,
                source: &source,
                out: out.as_deref(),
                report_date: report_date.as_deref(),
                strict,
                output: cli.output,
                quiet: cli.quiet,
            });
        }
        Commands::Check { rules } => {
            check::cmd_check(&rules, cli.output, cli.quiet);
        }
        Commands::Validate { document, schema } => {
            schema::cmd_validate(&document, &schema, cli.output, cli.quiet);
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Read a file or exit with status 1.
pub(crate) fn read_file(path: &Path, output: OutputFormat, quiet: bool) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error reading file '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

/// Read and parse a JSON file or exit with status 1.
pub(crate) fn read_json(path: &Path, output: OutputFormat, quiet: bool) -> serde_json::Value {
    let text = read_file(path, output, quiet);
    match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            let msg = format!("error parsing JSON in '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

/// Load a rule document, choosing the parser from the file extension.
pub(crate) fn load_rules(path: &Path, output: OutputFormat, quiet: bool) -> RuleDocument {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let parsed = if is_json {
        let value = read_json(path, output, quiet);
        RuleDocument::from_json_value(&value)
    } else {
        let text = read_file(path, output, quiet);
        RuleDocument::from_yaml_str(&text)
    };

    match parsed {
        Ok(rules) => rules,
        Err(e) => {
            let msg = format!("invalid rule document '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{{\"error\": \"{}\"}}", msg.replace('"', "\\\""));
        }
    }
}
