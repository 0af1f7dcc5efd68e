use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty (expected e.g. 1s, 250ms, 1m)".to_string());
    }

    humantime::parse_duration(s)
        .map_err(|err| format!("invalid duration '{s}': {err} (expected e.g. 1s, 250ms, 1m)"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Progress bar and a text summary.
    HumanReadable,
    /// Emit JSON progress lines (NDJSON) and a final summary line to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "surge",
    author,
    version,
    about = "Staged HTTP load generator",
    long_about = "surge ramps a population of virtual users (VUs) through a list of stages.\n\nEach VU repeatedly sends the plan's target request, records its latency and status, and optionally sleeps for the plan's think time. At the end of the run every threshold is evaluated against the aggregated metrics.",
    after_help = "Examples:\n  surge run plan.yaml\n  surge run plan.yaml --url http://localhost:8080/ --think-time 500ms\n  surge run plan.yaml --output json --summary-out summary.json\n  surge validate plan.yaml"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test plan
    #[command(
        long_about = "Run the stages of a YAML plan against its target.\n\nCLI flags override values from the plan file."
    )]
    Run(RunArgs),

    /// Check a plan file without running it
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the plan (.yaml)
    pub plan: PathBuf,

    /// Override the target URL
    #[arg(long)]
    pub url: Option<String>,

    /// Override the pause after every iteration (e.g. 1s, 250ms)
    #[arg(long, value_parser = parse_duration)]
    pub think_time: Option<Duration>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,

    /// Write the final summary as pretty JSON to this path
    #[arg(long, value_name = "PATH")]
    pub summary_out: Option<PathBuf>,

    /// Log filter (e.g. debug, surge_core=trace). Overrides SURGE_LOG.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to the plan (.yaml)
    pub plan: PathBuf,
}
