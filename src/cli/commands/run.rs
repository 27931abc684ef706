//! `caliber run` command - Execute the calculation workflow for a job

use console::style;
use miette::Result;
use std::path::PathBuf;
use tabled::builder::Builder;

use crate::cli::commands::check::print_tolerance_report;
use crate::cli::commands::job::certificate_label;
use crate::cli::helpers::{
    load_settings, open_store, parse_job_id, print_serialized, render_table, table_source,
};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::measurement::MeasurementData;
use crate::core::orchestrator::{Engine, RunStatus, WorkflowResult};
use crate::core::store::{JobStore, StoreError};
use crate::entities::results::StageResult;

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Job identifier
    pub job: String,

    /// Measurement payload (JSON)
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    /// Directory of CSV lookup tables for this run
    #[arg(long)]
    pub tables: Option<PathBuf>,

    /// Replace the results of an earlier run
    #[arg(long)]
    pub recalculate: bool,

    /// Name recorded on created deviation reports
    #[arg(long)]
    pub actor: Option<String>,
}

pub fn run(args: RunArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let mut store = open_store(&settings)?;
    let job_id = parse_job_id(&args.job)?;

    let job = store
        .load_job(&job_id)?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
    if job.calculation_status.has_results() && !args.recalculate {
        return Err(miette::miette!(
            help = "pass --recalculate to replace them",
            "Job {} already has calculation results ({})",
            job_id,
            job.calculation_status
        ));
    }

    let data = MeasurementData::from_file(&args.input)?;
    let tables = table_source(&settings, &store, args.tables.as_deref())?;

    let mut engine = Engine::new(&settings, &tables);
    if let Some(actor) = &args.actor {
        engine = engine.with_actor(actor.clone());
    }
    let result = engine.run_job(&mut store, &job_id, &data)?;

    match global.format.resolve(OutputFormat::Table) {
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&result, format)?,
        OutputFormat::Id => println!("{}", result.run_id),
        format => {
            let certificate = store
                .load_job(&job_id)?
                .map(|j| j.can_generate_certificate)
                .unwrap_or(false);
            print_summary(&result, certificate, format, global.quiet);
        }
    }

    match &result.error {
        Some(error) if !result.success => Err(miette::miette!("Calculation failed: {}", error)),
        _ => Ok(()),
    }
}

fn print_summary(result: &WorkflowResult, certificate: bool, format: OutputFormat, quiet: bool) {
    if !quiet {
        println!(
            "{} {} for job {} ({}, engine {})",
            style("Run").bold(),
            style(&result.run_id).cyan(),
            style(&result.job_id).cyan(),
            result.config_name,
            result.engine_version
        );
        if !result.low_confidence.is_empty() {
            let names: Vec<String> = result.low_confidence.iter().map(|c| c.to_string()).collect();
            println!(
                "{} fallback values used for: {}",
                style("!").yellow(),
                names.join(", ")
            );
        }
        println!();
    }

    if !result.stage_results.is_empty() {
        let mut builder = Builder::default();
        builder.push_record(["Stage", "Calculation", "Value", "Status"]);
        for stage_result in &result.stage_results {
            builder.push_record([
                stage_result.stage().to_string(),
                stage_result.calculation_type().to_string(),
                headline(stage_result),
                stage_result.validation_status().to_string(),
            ]);
        }
        println!("{}", render_table(builder, format));
    }

    if let Some(report) = &result.tolerance {
        println!();
        print_tolerance_report(report, format);
    }

    if !result.deviation_reports.is_empty() {
        println!();
        for record in &result.deviation_reports {
            println!(
                "{} {} [{}] {}",
                style("→").yellow(),
                style(&record.number).cyan(),
                record.severity,
                record.description
            );
        }
    }

    println!();
    let status = match result.summary.overall_status {
        RunStatus::Passed => style(result.summary.overall_status.to_string()).green().bold(),
        RunStatus::PassedWithDeviations => {
            style(result.summary.overall_status.to_string()).yellow().bold()
        }
        RunStatus::Failed => style(result.summary.overall_status.to_string()).red().bold(),
    };
    println!(
        "{} {}/{} stages, {} deviation(s), certificate {} ({:.2}s)",
        status,
        result.summary.stages_completed,
        result.summary.total_stages,
        result.summary.deviation_count,
        certificate_label(certificate),
        result.summary.execution_seconds
    );
}

/// Headline value of a stage result
fn headline(result: &StageResult) -> String {
    match result {
        StageResult::Repeatability(r) => format!("{:.3} %", r.max_deviation_percent),
        StageResult::Reproducibility(r)
        | StageResult::OutputDrive(r)
        | StageResult::Interface(r) => format!("{:.3} Nm", r.error_nm),
        StageResult::LoadingPoint(r) => format!("{:.3} Nm", r.error_nm),
        StageResult::ResolutionAnalysis(r) => format!("{:.3} %", r.max_abs_relative_error()),
        StageResult::UncertaintyBudget(b) => {
            format!("U = {:.3} % @ {} Nm", b.expanded_uncertainty_percent, b.set_torque)
        }
    }
}
