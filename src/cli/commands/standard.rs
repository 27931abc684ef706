//! `caliber standard` command - Reference standard management

use chrono::{NaiveDate, Utc};
use clap::Subcommand;
use console::style;
use miette::Result;
use tabled::builder::Builder;

use crate::cli::helpers::{load_settings, open_store, print_serialized, render_table, truncate_str};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::store::JobStore;
use crate::entities::standard::ReferenceStandard;

#[derive(Subcommand, Debug)]
pub enum StandardCommands {
    /// Register or update a reference standard
    Add(AddArgs),

    /// List reference standards with their validity today
    List,
}

#[derive(clap::Args, Debug)]
pub struct AddArgs {
    /// Standard identifier
    pub id: String,

    /// Descriptive name (e.g. "Master transducer 10 kNm")
    #[arg(long, short = 'n')]
    pub name: String,

    /// Last day of validity (YYYY-MM-DD)
    #[arg(long)]
    pub valid_until: String,

    #[arg(long)]
    pub serial: Option<String>,

    /// Calibration certificate number
    #[arg(long)]
    pub certificate: Option<String>,

    /// Register the standard as withdrawn from service
    #[arg(long)]
    pub inactive: bool,
}

pub fn run(cmd: StandardCommands, global: &GlobalOpts) -> Result<()> {
    match cmd {
        StandardCommands::Add(args) => run_add(args, global),
        StandardCommands::List => run_list(global),
    }
}

fn run_add(args: AddArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let mut store = open_store(&settings)?;

    let valid_until = NaiveDate::parse_from_str(&args.valid_until, "%Y-%m-%d")
        .map_err(|e| miette::miette!("Invalid date '{}': {}", args.valid_until, e))?;

    let mut standard = ReferenceStandard::new(args.id, args.name, valid_until);
    standard.serial_number = args.serial;
    standard.certificate = args.certificate;
    standard.is_active = !args.inactive;
    store.save_standard(&standard)?;

    if !global.quiet {
        println!(
            "{} Registered standard {} valid until {}",
            style("✓").green(),
            style(&standard.id).cyan(),
            standard.valid_until
        );
    }
    Ok(())
}

fn run_list(global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;
    let standards = store.list_standards()?;
    let today = Utc::now().date_naive();

    match global.format.resolve(OutputFormat::Table) {
        OutputFormat::Id => {
            for standard in &standards {
                println!("{}", standard.id);
            }
        }
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&standards, format)?,
        format => {
            if standards.is_empty() {
                println!("No reference standards registered.");
                return Ok(());
            }
            let mut builder = Builder::default();
            builder.push_record(["ID", "Name", "Serial", "Valid until", "State"]);
            for standard in &standards {
                let state = if !standard.is_active {
                    "inactive"
                } else if standard.is_expired(today) {
                    "expired"
                } else {
                    "valid"
                };
                builder.push_record([
                    standard.id.clone(),
                    truncate_str(&standard.name, 30),
                    standard.serial_number.clone().unwrap_or_default(),
                    standard.valid_until.to_string(),
                    state.to_string(),
                ]);
            }
            println!("{}", render_table(builder, format));
        }
    }
    Ok(())
}
