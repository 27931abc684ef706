//! `caliber check` command - Re-run the tolerance checks on stored results
//!
//! Read-only: no deviation reports are created.

use console::style;
use miette::Result;
use tabled::builder::Builder;

use crate::cli::helpers::{load_settings, open_store, parse_job_id, print_serialized, render_table};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::lookup::InMemoryTables;
use crate::core::orchestrator::Engine;
use crate::core::tolerance::{JobToleranceReport, OverallStatus};
use crate::entities::deviation::Severity;

#[derive(clap::Args, Debug)]
pub struct CheckArgs {
    /// Job identifier
    pub job: String,

    /// Exit with an error when any check fails
    #[arg(long)]
    pub strict: bool,
}

pub fn run(args: CheckArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;
    let job_id = parse_job_id(&args.job)?;

    // Stored results carry every lookup value already
    let tables = InMemoryTables::new();
    let engine = Engine::new(&settings, &tables);
    let report = engine.check_job(&store, &job_id)?;

    match global.format.resolve(OutputFormat::Table) {
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&report, format)?,
        OutputFormat::Id => println!("{}", report.overall_status),
        format => print_tolerance_report(&report, format),
    }

    if args.strict && report.overall_status == OverallStatus::Fail {
        return Err(miette::miette!(
            "{} of {} checks failed for job {}",
            report.summary.failed_checks,
            report.summary.total_checks,
            job_id
        ));
    }
    Ok(())
}

/// Print the per-check table followed by a one-line verdict
pub(crate) fn print_tolerance_report(report: &JobToleranceReport, format: OutputFormat) {
    let mut builder = Builder::default();
    builder.push_record(["Check", "Result", "Severity", "Details"]);
    for check in &report.checks_performed {
        let result = if check.passed {
            "PASS"
        } else if report.warnings.iter().any(|w| w.check_type == check.check_type) {
            "WARN"
        } else {
            "FAIL"
        };
        let details = if check.details.is_empty() {
            check.recommendation.clone()
        } else {
            check.details.join("\n")
        };
        builder.push_record([
            check.check_type.label().to_string(),
            result.to_string(),
            if check.passed { "-".to_string() } else { check.severity.to_string() },
            details,
        ]);
    }
    println!("{}", render_table(builder, format));

    let verdict = match report.overall_status {
        OverallStatus::Pass => style(report.overall_status.to_string()).green().bold(),
        OverallStatus::Fail => style(report.overall_status.to_string()).red().bold(),
    };
    println!(
        "{} {}/{} checks passed ({:.0}%)",
        verdict,
        report.summary.passed_checks,
        report.summary.total_checks,
        report.summary.pass_rate
    );
    if report.deviation_required {
        let severity = match report.severity {
            Severity::High => style(report.severity.to_string()).red(),
            Severity::Medium => style(report.severity.to_string()).yellow(),
            Severity::Low => style(report.severity.to_string()).dim(),
        };
        println!("Deviation report required (severity {})", severity);
    }
}
