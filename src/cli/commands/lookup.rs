//! `caliber lookup` command - Reference table evaluation and import

use clap::Subcommand;
use console::style;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::PathBuf;
use tabled::builder::Builder;

use crate::cli::helpers::{load_settings, open_store, print_serialized, render_table, table_source};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::lookup::{Confidence, CsvTables, LookupCategory, LookupSource, LookupStore, LookupTable};

#[derive(Subcommand, Debug)]
pub enum LookupCommands {
    /// Evaluate a table at a value
    Eval(EvalArgs),

    /// Print a table's rows
    Show(ShowArgs),

    /// Copy CSV tables into the database
    Import(ImportArgs),
}

#[derive(clap::Args, Debug)]
pub struct EvalArgs {
    /// Table category (torque_error, master_standard_uncertainty, cmc_band, device_error_band)
    pub category: LookupCategory,

    /// Input value (torque in Nm)
    #[arg(allow_negative_numbers = true)]
    pub x: f64,

    /// Read tables from this CSV directory
    #[arg(long)]
    pub tables: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    pub category: LookupCategory,

    /// Read tables from this CSV directory
    #[arg(long)]
    pub tables: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ImportArgs {
    /// Directory of `<category>.csv` files
    pub dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct Evaluation {
    category: LookupCategory,
    x: f64,
    value: f64,
    confidence: Confidence,
}

pub fn run(cmd: LookupCommands, global: &GlobalOpts) -> Result<()> {
    match cmd {
        LookupCommands::Eval(args) => run_eval(args, global),
        LookupCommands::Show(args) => run_show(args, global),
        LookupCommands::Import(args) => run_import(args, global),
    }
}

fn run_eval(args: EvalArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;
    let tables = table_source(&settings, &store, args.tables.as_deref())?;

    let category = args.category;
    let mut lookups = LookupStore::new(&tables);
    let lookup = lookups.interpolate(category, args.x);
    let evaluation = Evaluation {
        category,
        x: args.x,
        value: lookup.value,
        confidence: lookup.confidence,
    };

    match global.format.resolve(OutputFormat::Id) {
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&evaluation, format)?,
        OutputFormat::Id => println!("{}", evaluation.value),
        _ => {
            println!("{} at {} = {}", category, evaluation.x, style(evaluation.value).cyan());
            if evaluation.confidence == Confidence::Fallback {
                println!("{} no table available, fallback constant used", style("!").yellow());
            }
        }
    }
    Ok(())
}

fn run_show(args: ShowArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;
    let tables = table_source(&settings, &store, args.tables.as_deref())?;

    let category = args.category;
    let table = tables
        .get_table(category.lookup_type(), category.category())
        .ok_or_else(|| miette::miette!("No {} table is available", category))?;

    match global.format.resolve(OutputFormat::Table) {
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&table, format)?,
        format => {
            let mut builder = Builder::default();
            match &table {
                LookupTable::Points(rows) => {
                    builder.push_record(["x", "y"]);
                    for row in rows {
                        builder.push_record([row.x.to_string(), row.y.to_string()]);
                    }
                }
                LookupTable::Bands(rows) => {
                    builder.push_record(["lower", "upper", "value"]);
                    for row in rows {
                        builder.push_record([
                            row.lower.to_string(),
                            row.upper.to_string(),
                            row.value.to_string(),
                        ]);
                    }
                }
            }
            println!("{}", render_table(builder, format));
        }
    }
    Ok(())
}

fn run_import(args: ImportArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let mut store = open_store(&settings)?;
    let csv = CsvTables::load(&args.dir).into_diagnostic()?;

    let categories = csv.categories();
    if categories.is_empty() {
        return Err(miette::miette!(
            help = "files must be named after their category, e.g. torque_error.csv",
            "No lookup tables found in {}",
            args.dir.display()
        ));
    }

    for category in &categories {
        if let Some(table) = csv.get_table(category.lookup_type(), category.category()) {
            store.save_lookup_table(*category, &table)?;
            if !global.quiet {
                println!(
                    "{} Imported {} ({} rows)",
                    style("✓").green(),
                    style(category).cyan(),
                    table.len()
                );
            }
        }
    }
    Ok(())
}
