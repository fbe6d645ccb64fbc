//! gpa driver
//!
//! Command-line entry point for the GPU kernel performance advisor.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use gpa::{
    compare_reports, Advisor, AdvisorConfig, BatchOutcome, Priority, Report, SampleBatch, SampleDocument, TextRole,
};

/// GPU kernel performance advisor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze counter samples and print recommendations
    Analyze(AnalyzeArgs),
    /// Analyze several sample files and compare kernels side by side
    Compare(CompareArgs),
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Sample batch JSON (one object or an array)
    #[arg(value_name = "SAMPLES")]
    input: PathBuf,

    /// Advisor configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Reject batches with missing counters
    #[arg(long)]
    strict: bool,

    /// Keep at most N recommendations per kernel
    #[arg(long, value_name = "N")]
    max_recommendations: Option<usize>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Write the output to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// Sample batch JSON files
    #[arg(value_name = "SAMPLES", required = true)]
    inputs: Vec<PathBuf>,

    /// Advisor configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Text,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Compare(args) => run_compare(args),
    }
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AdvisorConfig> {
    match path {
        Some(path) => AdvisorConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(AdvisorConfig::default()),
    }
}

fn load_document(path: &Path) -> Result<SampleDocument> {
    SampleDocument::load(path).with_context(|| format!("Failed to read samples from {}", path.display()))
}

fn load_batches(path: &Path) -> Result<Vec<SampleBatch>> {
    Ok(load_document(path)?.into_batches())
}

/// An array input always yields an array; a single object yields an object
fn render_json(reports: &[Report], as_array: bool) -> Result<String> {
    match reports {
        [report] if !as_array => Ok(report.to_json_pretty()?),
        [] if !as_array => Ok(String::new()),
        _ => serde_json::to_string_pretty(reports).context("Failed to serialize reports"),
    }
}

/// Split outcomes into reports, printing failures as they are found
fn collect_reports(outcomes: Vec<BatchOutcome>) -> (Vec<Report>, usize) {
    let mut reports = Vec::with_capacity(outcomes.len());
    let mut failed = 0;
    for outcome in outcomes {
        match outcome.result {
            Ok(report) => reports.push(report),
            Err(e) => {
                failed += 1;
                eprintln!("{} {}: {}", "error:".red().bold(), outcome.kernel_id, e);
            }
        }
    }
    (reports, failed)
}

fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if args.strict {
        config.strict_mode = true;
    }
    if args.max_recommendations.is_some() {
        config.max_recommendations = args.max_recommendations;
    }

    let advisor = Advisor::new(config).context("Invalid advisor configuration")?;
    let document = load_document(&args.input)?;
    let batches = document.batches();
    tracing::info!("Analyzing {} kernel(s) from {:?}", batches.len(), args.input);

    let (reports, failed) = collect_reports(advisor.analyze_batch(batches));

    let rendered = match args.format {
        OutputFormat::Json => render_json(&reports, document.is_many())?,
        OutputFormat::Text if args.output.is_some() => reports
            .iter()
            .map(Report::render_text)
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Text => {
            for report in &reports {
                print_report(report);
            }
            String::new()
        }
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Report written to {:?}", path);
        }
        None if !rendered.is_empty() => println!("{}", rendered),
        None => {}
    }

    if failed > 0 {
        bail!("{} of {} kernel(s) could not be analyzed", failed, batches.len());
    }
    Ok(())
}

fn run_compare(args: CompareArgs) -> Result<()> {
    let advisor = Advisor::new(load_config(args.config.as_deref())?).context("Invalid advisor configuration")?;

    let mut batches = Vec::new();
    for input in &args.inputs {
        batches.extend(load_batches(input)?);
    }

    let (reports, failed) = collect_reports(advisor.analyze_batch(&batches));
    let comparison = compare_reports(&reports);

    println!("{}", "Kernel comparison".bold());
    print!("{}", comparison.render_table());

    if failed > 0 {
        bail!("{} of {} kernel(s) could not be analyzed", failed, batches.len());
    }
    Ok(())
}

fn priority_label(priority: Priority, label: &str) -> ColoredString {
    match priority {
        Priority::Critical => label.red().bold(),
        Priority::High => label.yellow().bold(),
        Priority::Medium => label.cyan(),
        Priority::Low => label.normal(),
    }
}

fn print_report(report: &Report) {
    let rendered = report.render_styled(|role, text| {
        let styled = match role {
            TextRole::Heading => text.bold().cyan(),
            TextRole::Section => text.green(),
            TextRole::Warning => text.yellow(),
            TextRole::Priority(priority) => priority_label(priority, text),
            TextRole::Note => text.dimmed(),
        };
        styled.to_string()
    });
    println!("\n{}", rendered.trim_end());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape_follows_input() {
        let report = Advisor::new(AdvisorConfig::default())
            .unwrap()
            .analyze(&SampleBatch::new("idle", Vec::new()))
            .unwrap();
        let reports = vec![report];

        let object: serde_json::Value = serde_json::from_str(&render_json(&reports, false).unwrap()).unwrap();
        assert!(object.is_object());

        let array: serde_json::Value = serde_json::from_str(&render_json(&reports, true).unwrap()).unwrap();
        assert_eq!(array.as_array().map(Vec::len), Some(1));

        assert_eq!(render_json(&[], true).unwrap().trim(), "[]");
    }
}
