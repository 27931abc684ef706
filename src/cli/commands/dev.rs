//! `caliber dev` command - Deviation report workflow
//!
//! ```text
//! OPEN → IN_REVIEW → CUSTOMER_NOTIFIED → CUSTOMER_ACCEPTED ─┐
//!                                      → CONDITIONAL ───────┼→ RESOLVED → CLOSED
//!                                      → CUSTOMER_REJECTED  ┘ (terminal)
//! ```

use clap::Subcommand;
use console::style;
use miette::Result;
use tabled::builder::Builder;

use crate::cli::helpers::{
    load_settings, open_store, parse_deviation_number, parse_job_id, print_serialized,
    render_table, truncate_str,
};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::orchestrator::{advance_deviation, apply_customer_decision, resolve_deviation};
use crate::core::store::{JobStore, StoreError};
use crate::core::workflow::{CertificateGate, DeviationWorkflow};
use crate::entities::deviation::{CustomerDecision, DeviationRecord, DeviationStatus, Severity};

#[derive(Subcommand, Debug)]
pub enum DevCommands {
    /// List a job's deviation reports and its certificate gate
    List(ListArgs),

    /// Show a deviation report with its action log
    Show(ShowArgs),

    /// Start internal review (OPEN → IN_REVIEW)
    Review(TransitionArgs),

    /// Record that the customer was notified (IN_REVIEW → CUSTOMER_NOTIFIED)
    Notify(TransitionArgs),

    /// Record the customer's decision
    Decide(DecideArgs),

    /// Resolve an accepted deviation
    Resolve(ResolveArgs),

    /// Close a resolved deviation
    Close(TransitionArgs),
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Job identifier
    pub job: String,

    /// Filter by status (e.g. open, customer_notified)
    #[arg(long)]
    pub status: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Deviation number (DEV-<job>-<seq>)
    pub number: String,
}

#[derive(clap::Args, Debug)]
pub struct TransitionArgs {
    /// Deviation number (DEV-<job>-<seq>)
    pub number: String,

    /// Comment recorded in the action log
    #[arg(long, short = 'm')]
    pub comment: Option<String>,

    /// Person performing the action
    #[arg(long, env = "CALIBER_ACTOR")]
    pub actor: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct DecideArgs {
    /// Deviation number (DEV-<job>-<seq>)
    pub number: String,

    /// accept, reject or conditional
    pub decision: CustomerDecision,

    /// Customer comments
    #[arg(long, short = 'm')]
    pub comments: Option<String>,

    /// Conditions carried onto the certificate (required for conditional)
    #[arg(long)]
    pub conditions: Option<String>,

    /// Person recording the decision
    #[arg(long, env = "CALIBER_ACTOR")]
    pub actor: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct ResolveArgs {
    /// Deviation number (DEV-<job>-<seq>)
    pub number: String,

    /// Actions taken to resolve the deviation
    #[arg(long, short = 'a')]
    pub actions: String,

    /// Person resolving the deviation
    #[arg(long, env = "CALIBER_ACTOR")]
    pub actor: Option<String>,
}

pub fn run(cmd: DevCommands, global: &GlobalOpts) -> Result<()> {
    match cmd {
        DevCommands::List(args) => run_list(args, global),
        DevCommands::Show(args) => run_show(args, global),
        DevCommands::Review(args) => run_transition(args, DeviationStatus::InReview, global),
        DevCommands::Notify(args) => {
            run_transition(args, DeviationStatus::CustomerNotified, global)
        }
        DevCommands::Decide(args) => run_decide(args, global),
        DevCommands::Resolve(args) => run_resolve(args, global),
        DevCommands::Close(args) => run_transition(args, DeviationStatus::Closed, global),
    }
}

/// Actor name: explicit flag, then the login name
fn actor_name(actor: Option<String>) -> String {
    actor
        .or_else(|| std::env::var("USER").ok())
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn run_list(args: ListArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;
    let job_id = parse_job_id(&args.job)?;
    store
        .load_job(&job_id)?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

    let status: Option<DeviationStatus> = args
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: String| miette::miette!("{}", e))?;

    let all = store.load_deviations(&job_id)?;
    let gate = CertificateGate::evaluate(&all);
    let records: Vec<&DeviationRecord> = all
        .iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect();

    match global.format.resolve(OutputFormat::Table) {
        OutputFormat::Id => {
            for record in &records {
                println!("{}", record.number);
            }
        }
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&records, format)?,
        format => {
            if records.is_empty() {
                println!("No deviation reports for job {}.", job_id);
            } else {
                let mut builder = Builder::default();
                builder.push_record(["Number", "Type", "Severity", "Status", "Description"]);
                for record in &records {
                    builder.push_record([
                        record.number.to_string(),
                        record.deviation_type.to_string(),
                        record.severity.to_string(),
                        record.status.to_string(),
                        truncate_str(&record.description, 50),
                    ]);
                }
                println!("{}", render_table(builder, format));
            }
            print_gate(&gate);
        }
    }
    Ok(())
}

fn run_show(args: ShowArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let store = open_store(&settings)?;
    let number = parse_deviation_number(&args.number)?;
    let record = store
        .load_deviation(&number)?
        .ok_or_else(|| StoreError::DeviationNotFound(number.to_string()))?;

    match global.format.resolve(OutputFormat::Table) {
        format @ (OutputFormat::Json | OutputFormat::Yaml) => print_serialized(&record, format)?,
        OutputFormat::Id => println!("{}", record.number),
        format => {
            let severity = match record.severity {
                Severity::High => style(record.severity.to_string()).red().bold(),
                Severity::Medium => style(record.severity.to_string()).yellow(),
                Severity::Low => style(record.severity.to_string()).dim(),
            };
            println!(
                "{} {} [{}] {}",
                style(&record.number).cyan().bold(),
                record.deviation_type,
                severity,
                record.status
            );
            println!("{}", record.description);
            println!();
            println!("{} {}", style("Technical impact:").bold(), record.technical_impact);
            println!("{} {}", style("Customer impact:").bold(), record.customer_impact);
            for recommendation in &record.recommendations {
                println!("  - {}", recommendation);
            }
            if let Some(conditions) = record.certificate_conditions() {
                println!("{} {}", style("Certificate conditions:").bold(), conditions);
            }

            let allowed = DeviationWorkflow::new().allowed_transitions(record.status);
            if !allowed.is_empty() {
                let names: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
                println!("{} {}", style("Next:").dim(), names.join(", "));
            }

            println!();
            let mut builder = Builder::default();
            builder.push_record(["When", "Action", "By", "Status", "Comment"]);
            for action in &record.actions {
                let status = match action.old_status {
                    Some(old) => format!("{} → {}", old, action.new_status),
                    None => action.new_status.to_string(),
                };
                builder.push_record([
                    action.timestamp.format("%Y-%m-%d %H:%M").to_string(),
                    action.action_type.to_string(),
                    action.actor.clone(),
                    status,
                    action.comment.clone().unwrap_or_default(),
                ]);
            }
            println!("{}", render_table(builder, format));
        }
    }
    Ok(())
}

fn run_transition(args: TransitionArgs, to: DeviationStatus, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let mut store = open_store(&settings)?;
    let number = parse_deviation_number(&args.number)?;
    let actor = actor_name(args.actor);

    let record = advance_deviation(&mut store, &number, to, &actor, args.comment.as_deref())?;
    report_change(&record, global)
}

fn run_decide(args: DecideArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let mut store = open_store(&settings)?;
    let number = parse_deviation_number(&args.number)?;
    let actor = actor_name(args.actor);

    let (record, gate) = apply_customer_decision(
        &mut store,
        &number,
        args.decision,
        &actor,
        args.comments.as_deref(),
        args.conditions.as_deref(),
    )?;
    report_change(&record, global)?;
    if !global.quiet && matches!(global.format, OutputFormat::Auto | OutputFormat::Table) {
        print_gate(&gate);
    }
    Ok(())
}

fn run_resolve(args: ResolveArgs, global: &GlobalOpts) -> Result<()> {
    let settings = load_settings(global)?;
    let mut store = open_store(&settings)?;
    let number = parse_deviation_number(&args.number)?;
    let actor = actor_name(args.actor);

    let record = resolve_deviation(&mut store, &number, &args.actions, &actor)?;
    report_change(&record, global)
}

fn report_change(record: &DeviationRecord, global: &GlobalOpts) -> Result<()> {
    match global.format {
        OutputFormat::Json | OutputFormat::Yaml => print_serialized(record, global.format)?,
        OutputFormat::Id => println!("{}", record.number),
        _ => {
            if !global.quiet {
                println!(
                    "{} {} is now {}",
                    style("✓").green(),
                    style(&record.number).cyan(),
                    style(record.status).bold()
                );
            }
        }
    }
    Ok(())
}

fn print_gate(gate: &CertificateGate) {
    println!();
    if gate.can_generate_certificate {
        println!("{} Certificate can be generated", style("✓").green());
    } else {
        println!("{} Certificate blocked", style("✗").red());
    }
    if !gate.pending.is_empty() {
        let pending: Vec<String> = gate.pending.iter().map(|n| n.to_string()).collect();
        println!("  pending: {}", pending.join(", "));
    }
    if !gate.rejected.is_empty() {
        let rejected: Vec<String> = gate.rejected.iter().map(|n| n.to_string()).collect();
        println!("  rejected by customer: {}", rejected.join(", "));
    }
    for condition in &gate.conditions {
        println!("  condition: {}", condition);
    }
}
