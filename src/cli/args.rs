//! CLI argument definitions using clap derive

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::cli::commands::{
    check::CheckArgs,
    completions::CompletionsArgs,
    config::ConfigCommands,
    dev::DevCommands,
    job::JobCommands,
    lookup::LookupCommands,
    run::RunArgs,
    standard::StandardCommands,
};

#[derive(Parser)]
#[command(name = "caliber")]
#[command(author, version, about = "Torque calibration metrology engine")]
#[command(long_about = "Turns raw torque-wrench readings into a traceable uncertainty budget, \
checks the result against the procedure's tolerances and tracks the deviations that gate certificate issuance.")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalOpts,
}

#[derive(clap::Args, Clone, Debug)]
pub struct GlobalOpts {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "auto")]
    pub format: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Enable verbose output (engine logs at debug level)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Database file (default: caliber.db in the user data directory)
    #[arg(long, global = true, env = "CALIBER_DB")]
    pub db: Option<PathBuf>,

    /// Extra configuration file merged over the global config
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Calibration job management
    #[command(subcommand)]
    Job(JobCommands),

    /// Reference standard management
    #[command(subcommand)]
    Standard(StandardCommands),

    /// Run the three calculation stages and the tolerance checks for a job
    Run(RunArgs),

    /// Re-check a job's stored results against its tolerances
    Check(CheckArgs),

    /// Reference table lookups
    #[command(subcommand)]
    Lookup(LookupCommands),

    /// Deviation report workflow
    #[command(subcommand)]
    Dev(DevCommands),

    /// Show configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Tables for lists and summaries, YAML for single records
    #[default]
    Auto,
    /// Boxed table
    Table,
    /// YAML format (full fidelity)
    Yaml,
    /// JSON format (for programming)
    Json,
    /// Markdown tables
    Md,
    /// Just IDs, one per line
    Id,
}

impl OutputFormat {
    /// Resolve `Auto` to a concrete format
    pub fn resolve(self, auto: OutputFormat) -> OutputFormat {
        if self == OutputFormat::Auto {
            auto
        } else {
            self
        }
    }
}
