//! `caliber job` command - Calibration job management

use clap::Subcommand;
use console::style;
use miette::{IntoDiagnostic, Result};
use std::fs;
use std::path::PathBuf;
use tabled::builder::Builder;

use crate::cli::helpers::{
    format_opt, load_settings, open_store, parse_job_id, print_serialized, render_table,
    truncate_str,
};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::store::{JobStore, StoreError};
use crate::entities::job::{CalculationStatus, CalibrationJob};

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Register a new calibration job
    New(NewArgs),

    /// Show a job's details
    Show(ShowArgs),

    /// List jobs
    List(ListArgs),
}

#[derive(clap::Args, Debug)]
pub struct NewArgs {
    /// Job identifier (e.g. 25060-13)
    #[arg(required_unless_present = "from")]
    pub id: Option<String>,

    /// Read the full job record from a YAML file
    #[arg(long, conflicts_with = "id")]
    pub from: Option<PathBuf>,

    /// Work order reference
    #[arg(long)]
    pub work_id: Option<String>,

    #[arg(long)]
    pub customer: Option<String>,

    /// Engine config (procedure) name
    #[arg(long = "procedure")]
    pub config_name: Option<String>,

    /// Laboratory temperature before calibration (°C)
    #[arg(long)]
    pub temp_before: Option<f64>,

    /// Laboratory temperature after calibration (°C)
    #[arg(long)]
    pub temp_after: Option<f64>,

    /// Relative humidity before calibration (% or fraction)
    #[arg(long)]
    pub humidity_before: Option<f64>,

    /// Relative humidity after calibration (% or fraction)
    #[arg(long)]
    pub humidity_after: Option<f64>,

    /// Reference standard id (repeatable)
    #[arg(long = "standard", short = 's')]
    pub standards: Vec<String>,

    /// Override the job's repeatability limit (%)
    #[arg(long)]
    pub max_deviation_percent: Option<f64>,

    /// Replace an existing job with the same id
    #[arg(long)]
    pub force: bool,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Job identifier
    pub id: String,
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Filter by calculation status
    #[arg(long)]
    pub status: Option<String>,

    /// Show only count
    #[arg(long)]
    pub count: bool,
}

pub fn run(cmd: JobCommands, global: &GlobalOpts) -> Result<()> {
    match cmd {
        JobCommands::New(args) => run_new(args, global),
        JobCommands::Show(args) => run_show(args, global),
        JobCommands::List(args) => run_list(args, global),
    }
}

fn run_new(args: NewArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let mut store = open_store(&settings)?;

    let job = match &args.from {
        Some(path) => {
            let content = fs::read_to_string(path).into_diagnostic()?;
            serde_yml::from_str::<CalibrationJob>(&content)
                .map_err(|e| miette::miette!("Invalid job file {}: {}", path.display(), e))?
        }
        None => {
            let id = args
                .id
                .as_deref()
                .ok_or_else(|| miette::miette!("Job id is required"))?;
            let mut job = CalibrationJob::new(parse_job_id(id)?);
            job.work_id = args.work_id.clone();
            job.customer = args.customer.clone();
            if let Some(name) = &args.config_name {
                job.config_name = name.clone();
            } else {
                job.config_name = settings.config_name.clone();
            }
            job.environment.temp_before = args.temp_before;
            job.environment.temp_after = args.temp_after;
            job.environment.humidity_before = args.humidity_before;
            job.environment.humidity_after = args.humidity_after;
            job.standards = args.standards.clone();
            job.tolerance_limits.max_deviation_percent = args.max_deviation_percent;
            job
        }
    };

    if !args.force && store.load_job(&job.id)?.is_some() {
        return Err(StoreError::JobExists(job.id.to_string()).into());
    }
    // Referenced standards must exist before the job can run
    store.standards(&job.standards)?;
    if job.environment.is_empty() {
        tracing::warn!(job = %job.id, "job has no environmental readings");
    }
    store.save_job(&job)?;

    match global.format {
        OutputFormat::Json | OutputFormat::Yaml => print_serialized(&job, global.format)?,
        OutputFormat::Id => println!("{}", job.id),
        _ => {
            if !global.quiet {
                println!(
                    "{} Registered job {} ({})",
                    style("✓").green(),
                    style(&job.id).cyan(),
                    job.config_name
                );
            }
        }
    }
    Ok(())
}

fn run_show(args: ShowArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;
    let id = parse_job_id(&args.id)?;
    let job = store
        .load_job(&id)?
        .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;

    match global.format.resolve(OutputFormat::Yaml) {
        OutputFormat::Table | OutputFormat::Md => {
            let env = &job.environment;
            let rows = [
                ("Job", job.id.to_string()),
                ("Work ID", job.work_id.clone().unwrap_or_default()),
                ("Customer", job.customer.clone().unwrap_or_default()),
                ("Procedure", job.config_name.clone()),
                ("Status", job.calculation_status.to_string()),
                (
                    "Temperature °C",
                    format!("{} / {}", format_opt(env.temp_before, 1), format_opt(env.temp_after, 1)),
                ),
                (
                    "Humidity %RH",
                    format!(
                        "{} / {}",
                        format_opt(env.humidity_before_percent(), 1),
                        format_opt(env.humidity_after_percent(), 1)
                    ),
                ),
                ("Standards", job.standards.join(", ")),
                ("Certificate", certificate_label(job.can_generate_certificate).to_string()),
                ("Error", job.calculation_error.clone().unwrap_or_default()),
            ];
            let mut builder = Builder::default();
            builder.push_record(["Field", "Value"]);
            for (field, value) in rows {
                builder.push_record([field.to_string(), value]);
            }
            println!("{}", render_table(builder, global.format));
        }
        OutputFormat::Id => println!("{}", job.id),
        format => print_serialized(&job, format)?,
    }
    Ok(())
}

fn run_list(args: ListArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;

    let status: Option<CalculationStatus> = args
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: String| miette::miette!("{}", e))?;

    let jobs: Vec<CalibrationJob> = store
        .list_jobs()?
        .into_iter()
        .filter(|j| status.map_or(true, |s| j.calculation_status == s))
        .collect();

    if args.count {
        println!("{}", jobs.len());
        return Ok(());
    }

    match global.format.resolve(OutputFormat::Table) {
        OutputFormat::Id => {
            for job in &jobs {
                println!("{}", job.id);
            }
        }
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&jobs, format)?,
        format => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            let mut builder = Builder::default();
            builder.push_record(["ID", "Work ID", "Customer", "Status", "Certificate", "Created"]);
            for job in &jobs {
                builder.push_record([
                    job.id.to_string(),
                    job.work_id.clone().unwrap_or_default(),
                    truncate_str(job.customer.as_deref().unwrap_or(""), 24),
                    job.calculation_status.to_string(),
                    certificate_label(job.can_generate_certificate).to_string(),
                    job.created.format("%Y-%m-%d").to_string(),
                ]);
            }
            println!("{}", render_table(builder, format));
            if !global.quiet {
                println!("{} job(s) found.", style(jobs.len()).cyan());
            }
        }
    }
    Ok(())
}

pub(crate) fn certificate_label(open: bool) -> &'static str {
    if open {
        "ready"
    } else {
        "blocked"
    }
}
