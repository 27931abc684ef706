//! `caliber config` command - Configuration inspection
//!
//! Settings are layered: built-in defaults, the global user config, an
//! explicit `--config` file, then `CALIBER_CONFIG_NAME` / `CALIBER_DB`.

use clap::Subcommand;
use console::style;
use miette::Result;

use crate::cli::helpers::{load_settings, print_serialized};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::config::Settings;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective merged settings
    Show,

    /// Show a resolved engine config (procedure) with defaults filled in
    Engine(EngineArgs),

    /// Show paths to configuration and data files
    Path,
}

#[derive(clap::Args, Debug)]
pub struct EngineArgs {
    /// Config name (default: the selected config)
    pub name: Option<String>,
}

pub fn run(cmd: ConfigCommands, global: &GlobalOpts) -> Result<()> {
    match cmd {
        ConfigCommands::Show => run_show(global),
        ConfigCommands::Engine(args) => run_engine(args, global),
        ConfigCommands::Path => run_path(global),
    }
}

fn run_show(global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    print_serialized(&settings, global.format.resolve(OutputFormat::Yaml))
}

fn run_engine(args: EngineArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let config = settings.engine_config(args.name.as_deref())?;
    print_serialized(&config, global.format.resolve(OutputFormat::Yaml))
}

fn run_path(global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;

    match Settings::global_config_path() {
        Some(path) => {
            let state = if path.exists() {
                style("(exists)").green()
            } else {
                style("(not created)").dim()
            };
            println!("{} {} {}", style("Global config:").bold(), path.display(), state);
        }
        None => println!("{} unavailable", style("Global config:").bold()),
    }
    if let Some(path) = &global.config {
        println!("{} {}", style("Explicit config:").bold(), path.display());
    }
    println!("{} {}", style("Database:").bold(), settings.database_path().display());
    if let Some(dir) = &settings.tables_dir {
        println!("{} {}", style("Tables:").bold(), dir.display());
    }
    Ok(())
}
