//! Workflow orchestrator
//!
//! Runs Stage 1 -> 2 -> 3 for a job, persists the results, runs the
//! tolerance engine and raises deviations. Any error after the job is
//! claimed marks it `failed` and clears its stored results, so a failed run
//! never leaves an earlier run's results looking current.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::config::{ConfigError, EngineConfig, Settings};
use crate::core::identity::{DeviationNumber, JobId, RunId};
use crate::core::lookup::{LookupCategory, LookupSource, LookupStore};
use crate::core::measurement::{InputError, MeasurementData};
use crate::core::stage1::{self, Stage1Result};
use crate::core::stage2::{self, ResolutionAnalysis};
use crate::core::stage3::{self, Stage3Result};
use crate::core::store::{JobStore, StoreError, StoredResult};
use crate::core::tolerance::{self, JobToleranceReport, ToleranceInput};
use crate::core::workflow::{CertificateGate, DeviationWorkflow, TransitionError};
use crate::entities::deviation::{CustomerDecision, DeviationRecord, DeviationStatus};
use crate::entities::job::{CalculationStatus, CalibrationJob};
use crate::entities::results::{StageResult, ValidationStatus};

/// Engine version recorded on every run
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Actor recorded on engine-created deviations
pub const ENGINE_ACTOR: &str = "calculation_engine";

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(code(caliber::workflow::transition))]
    Transition(#[from] TransitionError),

    #[error("Job '{0}' has no stored calculation results")]
    #[diagnostic(code(caliber::engine::no_results), help("Run the calculation first with `caliber run`"))]
    NoResults(String),

    #[error("Stored result for job '{job}' could not be read: {message}")]
    #[diagnostic(code(caliber::engine::stored_result))]
    StoredResult { job: String, message: String },
}

/// All three stages of one calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub stage1: Stage1Result,
    pub stage2: ResolutionAnalysis,
    pub stage3: Stage3Result,
    /// Categories answered from fallback constants
    pub low_confidence: Vec<LookupCategory>,
}

impl Calculation {
    /// Tagged stage results in stage order
    pub fn stage_results(&self) -> Vec<StageResult> {
        let mut results = self.stage1.stage_results();
        results.push(StageResult::ResolutionAnalysis(self.stage2.clone()));
        results.extend(self.stage3.stage_results());
        results
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatabilitySummary {
    pub max_deviation_percent: f64,
    pub overall_deviation_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResults {
    pub repeatability: RepeatabilitySummary,
    pub reproducibility_error_nm: f64,
    pub output_drive_error_nm: f64,
    pub interface_error_nm: f64,
    pub loading_point_error_nm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyResults {
    pub max_expanded_uncertainty_percent: f64,
    pub min_expanded_uncertainty_percent: f64,
    pub average_expanded_uncertainty_percent: f64,
    pub uncertainty_points: usize,
    /// Every point below the expanded-uncertainty ceiling
    pub within_iso_limits: bool,
    /// Every point below the typical lab limit
    pub within_typical_lab_limits: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub stage1_validation: ValidationStatus,
    pub failed_components: Vec<String>,
    pub requires_deviation_report: bool,
}

/// Headline numbers of a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResults {
    pub measurement_results: MeasurementResults,
    pub uncertainty_results: UncertaintyResults,
    pub validation_summary: ValidationSummary,
}

impl FinalResults {
    pub fn compile(calc: &Calculation, report: &JobToleranceReport, config: &EngineConfig) -> Self {
        let s1 = &calc.stage1;
        let summary = &calc.stage3.summary;
        let ceiling = config.tolerance_config.uncertainty.max_expanded_percent;
        let failed_components: Vec<String> =
            s1.failed_components().into_iter().map(String::from).collect();

        Self {
            measurement_results: MeasurementResults {
                repeatability: RepeatabilitySummary {
                    max_deviation_percent: s1.repeatability.max_deviation_percent,
                    overall_deviation_percent: s1.repeatability.overall_deviation,
                },
                reproducibility_error_nm: s1.reproducibility.error_nm,
                output_drive_error_nm: s1.output_drive.error_nm,
                interface_error_nm: s1.interface.error_nm,
                loading_point_error_nm: s1.loading_point.error_nm,
            },
            uncertainty_results: UncertaintyResults {
                max_expanded_uncertainty_percent: summary.max_expanded_uncertainty,
                min_expanded_uncertainty_percent: summary.min_expanded_uncertainty,
                average_expanded_uncertainty_percent: summary.average_expanded_uncertainty,
                uncertainty_points: summary.total_points,
                within_iso_limits: calc
                    .stage3
                    .budgets
                    .iter()
                    .all(|b| b.expanded_uncertainty_percent < ceiling),
                within_typical_lab_limits: summary.within_typical_limits,
            },
            validation_summary: ValidationSummary {
                stage1_validation: if failed_components.is_empty() {
                    ValidationStatus::Passed
                } else {
                    ValidationStatus::Failed
                },
                failed_components,
                requires_deviation_report: report.deviation_required,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    PassedWithDeviations,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Passed => write!(f, "passed"),
            RunStatus::PassedWithDeviations => write!(f, "passed_with_deviations"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_expanded_uncertainty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_repeatability_deviation: Option<f64>,
    pub uncertainty_points_calculated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub stages_completed: usize,
    pub total_stages: usize,
    pub deviation_count: usize,
    pub overall_status: RunStatus,
    pub execution_seconds: f64,
    pub key_metrics: KeyMetrics,
}

/// Outcome of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub job_id: JobId,
    pub run_id: RunId,
    /// SHA-256 of the canonical measurement payload
    pub input_fingerprint: String,
    pub engine_version: String,
    pub config_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub low_confidence: Vec<LookupCategory>,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<JobToleranceReport>,
    #[serde(default)]
    pub deviation_reports: Vec<DeviationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_results: Option<FinalResults>,
    pub summary: RunSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Fingerprint of a measurement payload
pub fn input_fingerprint(data: &MeasurementData) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.canonical_json().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Run all three stages on a payload without touching storage
///
/// Each call owns a fresh lookup store, so runs never share cached tables.
pub fn calculate(
    data: &MeasurementData,
    config: &EngineConfig,
    tables: &dyn LookupSource,
) -> Result<Calculation, InputError> {
    let mut lookups = LookupStore::new(tables);
    let stage1 = stage1::run(data, &config.stage1_methods, &mut lookups)?;
    let stage2 = stage2::run(&stage1, &config.stage2_methods)?;
    let stage3 = stage3::run(&stage1, &stage2, &config.stage3_methods, &mut lookups)?;
    let low_confidence: Vec<LookupCategory> = lookups.fallbacks().iter().copied().collect();
    if !low_confidence.is_empty() {
        tracing::warn!(?low_confidence, "calculation used fallback lookup values");
    }
    Ok(Calculation {
        stage1,
        stage2,
        stage3,
        low_confidence,
    })
}

/// Calculation engine bound to settings and a table source
pub struct Engine<'a> {
    settings: &'a Settings,
    tables: &'a dyn LookupSource,
    actor: String,
}

impl<'a> Engine<'a> {
    pub fn new(settings: &'a Settings, tables: &'a dyn LookupSource) -> Self {
        Self {
            settings,
            tables,
            actor: ENGINE_ACTOR.to_string(),
        }
    }

    /// Name recorded as `identified_by` on created deviations
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Engine config for a job with its tolerance override applied
    pub fn config_for(&self, job: &CalibrationJob) -> Result<EngineConfig, ConfigError> {
        Ok(self
            .settings
            .engine_config(Some(&job.config_name))?
            .with_override(&job.tolerance_limits))
    }

    /// Execute the complete workflow for a job
    ///
    /// Input and stage errors come back as an unsuccessful [`WorkflowResult`]
    /// with the job marked `failed`. Storage errors are returned as `Err`,
    /// also after marking the job `failed`. A failed run leaves no stored
    /// results behind.
    pub fn run_job(
        &self,
        store: &mut dyn JobStore,
        job_id: &JobId,
        data: &MeasurementData,
    ) -> Result<WorkflowResult, EngineError> {
        let started_at = Utc::now();
        let run_id = RunId::new();
        let fingerprint = input_fingerprint(data);
        let job = store.begin_run(job_id, started_at)?;

        tracing::info!(job = %job_id, run = %run_id, fingerprint = %fingerprint, "calculation started");

        let mut result = WorkflowResult {
            success: false,
            job_id: job_id.clone(),
            run_id,
            input_fingerprint: fingerprint,
            engine_version: ENGINE_VERSION.to_string(),
            config_name: job.config_name.clone(),
            low_confidence: Vec::new(),
            stage_results: Vec::new(),
            tolerance: None,
            deviation_reports: Vec::new(),
            final_results: None,
            summary: summarize(&[], 0, None, None, started_at, started_at),
            error: None,
            started_at,
            completed_at: started_at,
        };

        match self.execute(store, &job, data, &mut result) {
            Ok(gate) => {
                let result = self.finish(result, Ok(()));
                tracing::info!(
                    job = %job_id,
                    run = %result.run_id,
                    status = %result.summary.overall_status,
                    deviations = result.deviation_reports.len(),
                    certificate = gate.can_generate_certificate,
                    "calculation finished"
                );
                Ok(result)
            }
            Err(RunFailure::Reported(message)) => {
                tracing::warn!(job = %job_id, error = %message, "calculation failed");
                abandon_run(store, job_id, &message)?;
                Ok(self.finish(result, Err(message)))
            }
            Err(RunFailure::Aborted(e)) => {
                tracing::error!(job = %job_id, error = %e, "calculation aborted");
                if let Err(status_err) = abandon_run(store, job_id, &e.to_string()) {
                    tracing::error!(job = %job_id, error = %status_err, "job could not be marked failed");
                }
                Err(e)
            }
        }
    }

    /// Everything after the job is claimed; the caller handles failure
    fn execute(
        &self,
        store: &mut dyn JobStore,
        job: &CalibrationJob,
        data: &MeasurementData,
        result: &mut WorkflowResult,
    ) -> Result<CertificateGate, RunFailure> {
        let job_id = &job.id;
        let config = self.config_for(job).map_err(EngineError::from)?;
        let standards = store.standards(&job.standards)?;

        let calc = calculate(data, &config, self.tables)
            .map_err(|e| RunFailure::Reported(e.to_string()))?;
        result.low_confidence = calc.low_confidence.clone();
        result.stage_results = calc.stage_results();

        persist(store, job_id, &result.run_id, &result.stage_results)?;

        let report = tolerance::check_job(
            &ToleranceInput {
                job,
                stage1: &calc.stage1,
                stage2: &calc.stage2,
                stage3: &calc.stage3,
                standards: &standards,
                check_date: result.started_at.date_naive(),
            },
            &config,
        );

        if report.deviation_required {
            let requests = tolerance::deviation_requests(&report);
            let saved = store.save_deviations(job_id, Some(&result.run_id), requests, &self.actor);
            match saved {
                Ok(records) => result.deviation_reports = records,
                Err(e) => {
                    result.tolerance = Some(report);
                    return Err(RunFailure::Reported(format!("Deviation creation failed: {}", e)));
                }
            }
        }

        let gate = CertificateGate::evaluate(&store.load_deviations(job_id)?);
        store.set_certificate_gate(job_id, gate.can_generate_certificate)?;

        let status = if result.deviation_reports.is_empty() {
            CalculationStatus::Completed
        } else {
            CalculationStatus::CompletedWithDeviations
        };
        store.update_job_status(job_id, status, None)?;

        result.final_results = Some(FinalResults::compile(&calc, &report, &config));
        result.tolerance = Some(report);
        Ok(gate)
    }

    /// Re-run the tolerance engine on a job's stored results
    ///
    /// Read-only: no deviations are created.
    pub fn check_job(
        &self,
        store: &dyn JobStore,
        job_id: &JobId,
    ) -> Result<JobToleranceReport, EngineError> {
        let job = store
            .load_job(job_id)?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if !job.calculation_status.has_results() {
            return Err(EngineError::NoResults(job_id.to_string()));
        }
        let config = self.config_for(&job)?;
        let calc = load_calculation(store, job_id, &config)?;
        let standards = store.standards(&job.standards)?;

        Ok(tolerance::check_job(
            &ToleranceInput {
                job: &job,
                stage1: &calc.stage1,
                stage2: &calc.stage2,
                stage3: &calc.stage3,
                standards: &standards,
                check_date: Utc::now().date_naive(),
            },
            &config,
        ))
    }

    fn finish(&self, mut result: WorkflowResult, outcome: Result<(), String>) -> WorkflowResult {
        result.completed_at = Utc::now();
        match outcome {
            Ok(()) => result.success = true,
            Err(message) => {
                result.success = false;
                result.error = Some(message);
                result.final_results = None;
            }
        }
        let stages = stages_completed(&result.stage_results);
        result.summary = summarize(
            &result.stage_results,
            stages,
            result.final_results.as_ref(),
            Some(result.deviation_reports.len()).filter(|_| result.success),
            result.started_at,
            result.completed_at,
        );
        result
    }
}

fn stages_completed(results: &[StageResult]) -> usize {
    let mut stages: Vec<_> = results.iter().map(StageResult::stage).collect();
    stages.sort();
    stages.dedup();
    stages.len()
}

fn summarize(
    results: &[StageResult],
    stages_completed: usize,
    final_results: Option<&FinalResults>,
    deviations: Option<usize>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> RunSummary {
    let overall_status = match deviations {
        Some(0) => RunStatus::Passed,
        Some(_) => RunStatus::PassedWithDeviations,
        None => RunStatus::Failed,
    };
    let points = results
        .iter()
        .filter(|r| matches!(r, StageResult::UncertaintyBudget(_)))
        .count();
    RunSummary {
        stages_completed,
        total_stages: 3,
        deviation_count: deviations.unwrap_or(0),
        overall_status,
        execution_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
        key_metrics: KeyMetrics {
            max_expanded_uncertainty: final_results
                .map(|f| f.uncertainty_results.max_expanded_uncertainty_percent),
            max_repeatability_deviation: final_results
                .map(|f| f.measurement_results.repeatability.max_deviation_percent),
            uncertainty_points_calculated: points,
        },
    }
}

/// Why a run stopped short
enum RunFailure {
    /// Reported through an unsuccessful [`WorkflowResult`]
    Reported(String),
    /// Returned to the caller
    Aborted(EngineError),
}

impl From<EngineError> for RunFailure {
    fn from(e: EngineError) -> Self {
        RunFailure::Aborted(e)
    }
}

impl From<StoreError> for RunFailure {
    fn from(e: StoreError) -> Self {
        RunFailure::Aborted(e.into())
    }
}

/// Mark a run failed and drop any results stored for the job
///
/// Only the status update is reported; the other steps are logged.
fn abandon_run(store: &mut dyn JobStore, job_id: &JobId, message: &str) -> Result<(), StoreError> {
    if let Err(e) = store.clear_results(job_id) {
        tracing::error!(job = %job_id, error = %e, "stale results could not be cleared");
    }
    if let Err(e) = store.set_certificate_gate(job_id, false) {
        tracing::error!(job = %job_id, error = %e, "certificate gate could not be closed");
    }
    store.update_job_status(job_id, CalculationStatus::Failed, Some(message))
}

/// Replace a job's stored results with the ones from this run
fn persist(
    store: &mut dyn JobStore,
    job_id: &JobId,
    run_id: &RunId,
    results: &[StageResult],
) -> Result<(), StoreError> {
    let created = Utc::now();
    let stored: Vec<_> = results
        .iter()
        .map(|result| StoredResult {
            run_id: *run_id,
            stage: result.stage(),
            calculation_type: result.calculation_type().to_string(),
            payload: result.to_payload(),
            created,
        })
        .collect();
    store.replace_results(job_id, &stored)
}

/// Rebuild a calculation from stored stage payloads
pub fn load_calculation(
    store: &dyn JobStore,
    job_id: &JobId,
    config: &EngineConfig,
) -> Result<Calculation, EngineError> {
    let stored = store.load_results(job_id)?;
    if stored.is_empty() {
        return Err(EngineError::NoResults(job_id.to_string()));
    }

    let mut repeatability = None;
    let mut reproducibility = None;
    let mut output_drive = None;
    let mut interface = None;
    let mut loading_point = None;
    let mut stage2 = None;
    let mut budgets = Vec::new();

    for record in stored {
        let result = StageResult::from_payload(record.payload).map_err(|e| {
            EngineError::StoredResult {
                job: job_id.to_string(),
                message: format!("{}: {}", record.calculation_type, e),
            }
        })?;
        match result {
            StageResult::Repeatability(r) => repeatability = Some(r),
            StageResult::Reproducibility(r) => reproducibility = Some(r),
            StageResult::OutputDrive(r) => output_drive = Some(r),
            StageResult::Interface(r) => interface = Some(r),
            StageResult::LoadingPoint(r) => loading_point = Some(r),
            StageResult::ResolutionAnalysis(r) => stage2 = Some(r),
            StageResult::UncertaintyBudget(b) => budgets.push(b),
        }
    }

    let missing = |name: &str| EngineError::StoredResult {
        job: job_id.to_string(),
        message: format!("missing {} result", name),
    };
    let stage1 = Stage1Result {
        repeatability: repeatability.ok_or_else(|| missing("repeatability"))?,
        reproducibility: reproducibility.ok_or_else(|| missing("reproducibility"))?,
        output_drive: output_drive.ok_or_else(|| missing("output_drive"))?,
        interface: interface.ok_or_else(|| missing("interface"))?,
        loading_point: loading_point.ok_or_else(|| missing("loading_point"))?,
    };
    let stage2 = stage2.ok_or_else(|| missing("resolution_analysis"))?;
    if budgets.is_empty() {
        return Err(missing("uncertainty_budget"));
    }
    let summary = stage3::summarize(&budgets, config.stage3_methods.typical_limit_percent);

    Ok(Calculation {
        stage1,
        stage2,
        stage3: Stage3Result { budgets, summary },
        low_confidence: Vec::new(),
    })
}

/// Apply a workflow transition to a stored deviation and refresh the gate
pub fn advance_deviation(
    store: &mut dyn JobStore,
    number: &DeviationNumber,
    to: DeviationStatus,
    actor: &str,
    comment: Option<&str>,
) -> Result<DeviationRecord, EngineError> {
    let mut record = require_deviation(store, number)?;
    DeviationWorkflow::new().transition(&mut record, to, actor, comment)?;
    store.update_deviation(&record)?;
    refresh_gate(store, &record.job_id)?;
    Ok(record)
}

/// Resolve a stored deviation and refresh the gate
pub fn resolve_deviation(
    store: &mut dyn JobStore,
    number: &DeviationNumber,
    actions: &str,
    actor: &str,
) -> Result<DeviationRecord, EngineError> {
    let mut record = require_deviation(store, number)?;
    DeviationWorkflow::new().resolve(&mut record, actions, actor)?;
    store.update_deviation(&record)?;
    refresh_gate(store, &record.job_id)?;
    Ok(record)
}

/// Record a customer decision, refresh the gate and update the job status
pub fn apply_customer_decision(
    store: &mut dyn JobStore,
    number: &DeviationNumber,
    decision: CustomerDecision,
    actor: &str,
    comments: Option<&str>,
    conditions: Option<&str>,
) -> Result<(DeviationRecord, CertificateGate), EngineError> {
    let mut record = require_deviation(store, number)?;
    DeviationWorkflow::new().decide(&mut record, decision, actor, comments, conditions)?;
    store.update_deviation(&record)?;

    let gate = refresh_gate(store, &record.job_id)?;
    if let Some(status) = gate.job_status() {
        store.update_job_status(&record.job_id, status, None)?;
    }
    tracing::info!(
        deviation = %record.number,
        decision = %decision,
        certificate = gate.can_generate_certificate,
        "customer decision recorded"
    );
    Ok((record, gate))
}

fn require_deviation(
    store: &dyn JobStore,
    number: &DeviationNumber,
) -> Result<DeviationRecord, EngineError> {
    Ok(store
        .load_deviation(number)?
        .ok_or_else(|| StoreError::DeviationNotFound(number.to_string()))?)
}

fn refresh_gate(store: &mut dyn JobStore, job_id: &JobId) -> Result<CertificateGate, EngineError> {
    let gate = CertificateGate::evaluate(&store.load_deviations(job_id)?);
    store.set_certificate_gate(job_id, gate.can_generate_certificate)?;
    Ok(gate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lookup::InMemoryTables;
    use crate::core::store::MemoryStore;

    fn data() -> MeasurementData {
        let five = vec![1349.0; 5];
        let ten = vec![1349.0; 10];
        MeasurementData::from_value(serde_json::json!({
            "repeatability_points": [
                {"set_torque": 1349.0, "readings": [1349.0, 1350.0, 1348.0, 1349.0, 1349.0]},
                {"set_torque": 4269.0, "readings": [4269.0, 4270.0, 4268.0, 4269.0, 4269.0]}
            ],
            "reproducibility": {"sequences": {
                "I": five, "II": five, "III": five, "IV": five
            }},
            "output_drive": {"positions": {
                "0°": ten, "90°": ten, "180°": ten, "270°": ten
            }},
            "interface": {"positions": {
                "0°": ten, "90°": ten, "180°": ten, "270°": ten
            }},
            "loading_point": {"-10mm": five, "+10mm": vec![1349.5; 5]}
        }))
        .unwrap()
    }

    fn setup() -> (MemoryStore, JobId) {
        let mut store = MemoryStore::new();
        let id: JobId = "JOB-42".parse().unwrap();
        let mut job = CalibrationJob::new(id.clone());
        job.environment.temp_before = Some(22.0);
        job.environment.temp_after = Some(22.0);
        job.environment.humidity_before = Some(50.0);
        job.environment.humidity_after = Some(50.0);
        store.save_job(&job).unwrap();
        (store, id)
    }

    fn zero_tables() -> InMemoryTables {
        use crate::core::lookup::{Band, LookupTable, TablePoint};
        let mut tables = InMemoryTables::with_defaults();
        tables.insert(
            LookupCategory::TorqueError,
            LookupTable::points(vec![TablePoint { x: 0.0, y: 0.0 }, TablePoint { x: 10000.0, y: 0.0 }]),
        );
        tables.insert(
            LookupCategory::CmcBand,
            LookupTable::bands(vec![Band { lower: 0.0, upper: 10000.0, value: 0.5 }]),
        );
        tables
    }

    /// Delegates to a memory store, failing the chosen writes
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_gate: bool,
        fail_deviations: bool,
    }

    fn disk_full() -> StoreError {
        StoreError::Corrupt("disk full".to_string())
    }

    impl JobStore for FlakyStore {
        fn load_job(&self, id: &JobId) -> Result<Option<CalibrationJob>, StoreError> {
            self.inner.load_job(id)
        }
        fn save_job(&mut self, job: &CalibrationJob) -> Result<(), StoreError> {
            self.inner.save_job(job)
        }
        fn list_jobs(&self) -> Result<Vec<CalibrationJob>, StoreError> {
            self.inner.list_jobs()
        }
        fn begin_run(&mut self, id: &JobId, started: DateTime<Utc>) -> Result<CalibrationJob, StoreError> {
            self.inner.begin_run(id, started)
        }
        fn update_job_status(
            &mut self,
            id: &JobId,
            status: CalculationStatus,
            error: Option<&str>,
        ) -> Result<(), StoreError> {
            self.inner.update_job_status(id, status, error)
        }
        fn clear_results(&mut self, id: &JobId) -> Result<(), StoreError> {
            self.inner.clear_results(id)
        }
        fn save_stage_result(&mut self, id: &JobId, result: &StoredResult) -> Result<(), StoreError> {
            self.inner.save_stage_result(id, result)
        }
        fn save_uncertainty_budget(&mut self, id: &JobId, result: &StoredResult) -> Result<(), StoreError> {
            self.inner.save_uncertainty_budget(id, result)
        }
        fn replace_results(&mut self, id: &JobId, results: &[StoredResult]) -> Result<(), StoreError> {
            self.inner.replace_results(id, results)
        }
        fn load_results(&self, id: &JobId) -> Result<Vec<StoredResult>, StoreError> {
            self.inner.load_results(id)
        }
        fn save_deviations(
            &mut self,
            id: &JobId,
            run_id: Option<&RunId>,
            requests: Vec<crate::entities::deviation::DeviationRequest>,
            identified_by: &str,
        ) -> Result<Vec<DeviationRecord>, StoreError> {
            if self.fail_deviations {
                return Err(disk_full());
            }
            self.inner.save_deviations(id, run_id, requests, identified_by)
        }
        fn load_deviations(&self, id: &JobId) -> Result<Vec<DeviationRecord>, StoreError> {
            self.inner.load_deviations(id)
        }
        fn load_deviation(&self, number: &DeviationNumber) -> Result<Option<DeviationRecord>, StoreError> {
            self.inner.load_deviation(number)
        }
        fn update_deviation(&mut self, record: &DeviationRecord) -> Result<(), StoreError> {
            self.inner.update_deviation(record)
        }
        fn set_certificate_gate(&mut self, id: &JobId, open: bool) -> Result<(), StoreError> {
            if self.fail_gate {
                return Err(disk_full());
            }
            self.inner.set_certificate_gate(id, open)
        }
        fn save_standard(
            &mut self,
            standard: &crate::entities::standard::ReferenceStandard,
        ) -> Result<(), StoreError> {
            self.inner.save_standard(standard)
        }
        fn list_standards(&self) -> Result<Vec<crate::entities::standard::ReferenceStandard>, StoreError> {
            self.inner.list_standards()
        }
    }

    fn flaky_setup() -> (FlakyStore, JobId) {
        let (inner, id) = setup();
        (FlakyStore { inner, ..Default::default() }, id)
    }

    #[test]
    fn test_clean_run_completes_without_deviations() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = setup();

        let result = engine.run_job(&mut store, &id, &data()).unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.summary.overall_status, RunStatus::Passed);
        assert_eq!(result.summary.stages_completed, 3);
        assert!(result.deviation_reports.is_empty());
        assert_eq!(result.input_fingerprint.len(), 64);

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.calculation_status, CalculationStatus::Completed);
        assert!(job.can_generate_certificate);
        // 5 stage-1 results, 1 stage-2 analysis, 2 budget points
        assert_eq!(store.load_results(&id).unwrap().len(), 8);
    }

    #[test]
    fn test_recalculation_replaces_results() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = setup();

        engine.run_job(&mut store, &id, &data()).unwrap();
        engine.run_job(&mut store, &id, &data()).unwrap();
        assert_eq!(store.load_results(&id).unwrap().len(), 8);
    }

    #[test]
    fn test_stage_error_marks_job_failed() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = setup();

        let mut bad = data();
        bad.repeatability_points[0].readings.pop();
        let result = engine.run_job(&mut store, &id, &bad).unwrap();

        assert!(!result.success);
        assert!(result.final_results.is_none());
        assert_eq!(result.summary.overall_status, RunStatus::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("expected 5"), "{}", error);

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.calculation_status, CalculationStatus::Failed);
        assert!(store.load_results(&id).unwrap().is_empty());
    }

    #[test]
    fn test_processing_job_is_refused() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = setup();
        store.begin_run(&id, Utc::now()).unwrap();

        let err = engine.run_job(&mut store, &id, &data()).unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::AlreadyProcessing(_))));
    }

    #[test]
    fn test_check_job_reads_stored_results() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = setup();

        assert!(matches!(
            engine.check_job(&store, &id),
            Err(EngineError::NoResults(_))
        ));
        let result = engine.run_job(&mut store, &id, &data()).unwrap();
        let report = engine.check_job(&store, &id).unwrap();
        assert_eq!(
            Some(report.overall_status),
            result.tolerance.map(|t| t.overall_status)
        );
    }

    #[test]
    fn test_failed_recalculation_clears_results() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = setup();

        assert!(engine.run_job(&mut store, &id, &data()).unwrap().success);
        assert_eq!(store.load_results(&id).unwrap().len(), 8);

        let mut bad = data();
        bad.repeatability_points[1].readings.pop();
        let result = engine.run_job(&mut store, &id, &bad).unwrap();
        assert!(!result.success);

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.calculation_status, CalculationStatus::Failed);
        assert!(!job.can_generate_certificate);
        assert!(store.load_results(&id).unwrap().is_empty());
        assert!(matches!(
            engine.check_job(&store, &id),
            Err(EngineError::NoResults(_))
        ));
    }

    #[test]
    fn test_check_job_refuses_failed_status() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = setup();
        engine.run_job(&mut store, &id, &data()).unwrap();

        // Results still on disk, but the job says the last run failed
        store
            .update_job_status(&id, CalculationStatus::Failed, Some("interrupted"))
            .unwrap();
        assert_eq!(store.load_results(&id).unwrap().len(), 8);
        assert!(matches!(
            engine.check_job(&store, &id),
            Err(EngineError::NoResults(_))
        ));
    }

    #[test]
    fn test_store_error_after_claim_marks_job_failed() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = flaky_setup();
        store.fail_gate = true;

        let err = engine.run_job(&mut store, &id, &data()).unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Corrupt(_))));

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.calculation_status, CalculationStatus::Failed);
        let message = job.calculation_error.unwrap();
        assert!(message.contains("disk full"), "{}", message);
        assert!(store.load_results(&id).unwrap().is_empty());

        // The job is not left claimed
        store.fail_gate = false;
        let retry = engine.run_job(&mut store, &id, &data()).unwrap();
        assert!(retry.success, "{:?}", retry.error);
        assert_eq!(
            store.load_job(&id).unwrap().unwrap().calculation_status,
            CalculationStatus::Completed
        );
    }

    #[test]
    fn test_deviation_save_failure_fails_run() {
        let settings = Settings::builtin().unwrap();
        let tables = zero_tables();
        let engine = Engine::new(&settings, &tables);
        let (mut store, id) = flaky_setup();
        let mut job = store.load_job(&id).unwrap().unwrap();
        job.environment.temp_before = Some(32.0);
        store.save_job(&job).unwrap();
        store.fail_deviations = true;

        let result = engine.run_job(&mut store, &id, &data()).unwrap();
        assert!(!result.success);
        assert!(result.final_results.is_none());
        let error = result.error.unwrap();
        assert!(error.starts_with("Deviation creation failed:"), "{}", error);
        assert!(error.contains("disk full"), "{}", error);
        assert!(result.tolerance.unwrap().deviation_required);

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.calculation_status, CalculationStatus::Failed);
        assert_eq!(job.calculation_error.as_deref(), Some(error.as_str()));
        assert!(store.load_deviations(&id).unwrap().is_empty());
        assert!(store.load_results(&id).unwrap().is_empty());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(input_fingerprint(&data()), input_fingerprint(&data()));
    }
}
