//! Persistence collaborator for jobs, results and deviations
//!
//! The engine talks to storage only through [`JobStore`]. Stage payloads
//! cross the boundary as `serde_json::Value`; deviation numbering
//! (`DEV-<job>-<seq>`) is the store's responsibility.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! embedding, and [`SqliteStore`] for the command-line tool.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::identity::{DeviationNumber, JobId, RunId};
use crate::entities::deviation::{DeviationRecord, DeviationRequest};
use crate::entities::job::{CalculationStatus, CalibrationJob};
use crate::entities::results::CalculationStage;
use crate::entities::standard::ReferenceStandard;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("Job '{0}' not found")]
    #[diagnostic(code(caliber::store::job_not_found), help("Register it with `caliber job new`"))]
    JobNotFound(String),

    #[error("Job '{0}' already exists")]
    #[diagnostic(code(caliber::store::job_exists))]
    JobExists(String),

    #[error("Job '{0}' is already processing")]
    #[diagnostic(
        code(caliber::store::already_processing),
        help("Wait for the running calculation to finish")
    )]
    AlreadyProcessing(String),

    #[error("Deviation '{0}' not found")]
    #[diagnostic(code(caliber::store::deviation_not_found))]
    DeviationNotFound(String),

    #[error("Reference standard '{0}' not found")]
    #[diagnostic(
        code(caliber::store::standard_not_found),
        help("Register it with `caliber standard add`")
    )]
    StandardNotFound(String),

    #[error("Stored data is corrupt: {0}")]
    #[diagnostic(code(caliber::store::corrupt))]
    Corrupt(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(caliber::store::sqlite))]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(caliber::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(caliber::store::io))]
    Io(#[from] std::io::Error),
}

/// A persisted stage or budget payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub run_id: RunId,
    pub stage: CalculationStage,
    pub calculation_type: String,
    pub payload: serde_json::Value,
    pub created: DateTime<Utc>,
}

/// Persistence operations the engine needs
pub trait JobStore {
    fn load_job(&self, id: &JobId) -> Result<Option<CalibrationJob>, StoreError>;

    /// Insert or replace a job
    fn save_job(&mut self, job: &CalibrationJob) -> Result<(), StoreError>;

    fn list_jobs(&self) -> Result<Vec<CalibrationJob>, StoreError>;

    /// Check-and-set the job to `processing`
    ///
    /// Fails with [`StoreError::AlreadyProcessing`] when another run holds it.
    fn begin_run(&mut self, id: &JobId, started: DateTime<Utc>) -> Result<CalibrationJob, StoreError>;

    /// Set the calculation status, recording or clearing the error message
    fn update_job_status(
        &mut self,
        id: &JobId,
        status: CalculationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Discard stage and budget records from earlier runs
    fn clear_results(&mut self, id: &JobId) -> Result<(), StoreError>;

    fn save_stage_result(&mut self, id: &JobId, result: &StoredResult) -> Result<(), StoreError>;

    fn save_uncertainty_budget(
        &mut self,
        id: &JobId,
        result: &StoredResult,
    ) -> Result<(), StoreError>;

    /// Swap every stage and budget record for `results` in one step
    ///
    /// Either the whole new set is stored or the earlier records remain.
    fn replace_results(&mut self, id: &JobId, results: &[StoredResult]) -> Result<(), StoreError>;

    /// All persisted stage and budget records, stage order
    fn load_results(&self, id: &JobId) -> Result<Vec<StoredResult>, StoreError>;

    /// Number and persist deviation requests as OPEN records
    fn save_deviations(
        &mut self,
        id: &JobId,
        run_id: Option<&RunId>,
        requests: Vec<DeviationRequest>,
        identified_by: &str,
    ) -> Result<Vec<DeviationRecord>, StoreError>;

    fn load_deviations(&self, id: &JobId) -> Result<Vec<DeviationRecord>, StoreError>;

    fn load_deviation(&self, number: &DeviationNumber) -> Result<Option<DeviationRecord>, StoreError>;

    /// Replace a deviation record (status, response, resolution, action log)
    fn update_deviation(&mut self, record: &DeviationRecord) -> Result<(), StoreError>;

    fn set_certificate_gate(&mut self, id: &JobId, open: bool) -> Result<(), StoreError>;

    /// Insert or replace a reference standard
    fn save_standard(&mut self, standard: &ReferenceStandard) -> Result<(), StoreError>;

    fn list_standards(&self) -> Result<Vec<ReferenceStandard>, StoreError>;

    /// Resolve standard ids; an unknown id is an error
    fn standards(&self, ids: &[String]) -> Result<Vec<ReferenceStandard>, StoreError> {
        let all = self.list_standards()?;
        ids.iter()
            .map(|id| {
                all.iter()
                    .find(|s| &s.id == id)
                    .cloned()
                    .ok_or_else(|| StoreError::StandardNotFound(id.clone()))
            })
            .collect()
    }
}

/// Next deviation number for a job given its existing records
pub(crate) fn next_number(job: &JobId, existing: &[DeviationRecord]) -> DeviationNumber {
    let last = existing
        .iter()
        .map(|r| r.number.sequence())
        .max()
        .unwrap_or(0);
    DeviationNumber::new(job.clone(), last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::deviation::{DeviationType, Severity};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    pub(super) fn request(severity: Severity) -> DeviationRequest {
        DeviationRequest {
            deviation_type: DeviationType::OutOfTolerance,
            severity,
            check_type: Some("calculation_tolerances".to_string()),
            description: "Repeatability deviation (-9.300%) exceeds ±4% limit".to_string(),
            technical_impact: "CRITICAL".to_string(),
            customer_impact: "Certificate may require conditional acceptance".to_string(),
            recommendations: vec!["Review measurement procedure".to_string()],
            affected_measurements: BTreeMap::from([(
                "repeatability_max_deviation_percent".to_string(),
                -9.3,
            )]),
        }
    }

    /// Behaviour every store must share
    pub(super) fn exercise_store(store: &mut dyn JobStore) {
        let id: JobId = "25060-13".parse().unwrap();
        assert!(store.load_job(&id).unwrap().is_none());

        let mut job = CalibrationJob::new(id.clone());
        job.standards = vec!["STD-1".to_string()];
        store.save_job(&job).unwrap();
        assert_eq!(store.list_jobs().unwrap().len(), 1);

        // Check-and-set
        let running = store.begin_run(&id, Utc::now()).unwrap();
        assert_eq!(running.calculation_status, CalculationStatus::Processing);
        assert!(matches!(
            store.begin_run(&id, Utc::now()),
            Err(StoreError::AlreadyProcessing(_))
        ));
        store
            .update_job_status(&id, CalculationStatus::Failed, Some("boom"))
            .unwrap();
        let failed = store.load_job(&id).unwrap().unwrap();
        assert_eq!(failed.calculation_error.as_deref(), Some("boom"));

        // Results are replaced, not appended
        let run = RunId::new();
        let stored = StoredResult {
            run_id: run,
            stage: CalculationStage::Stage1,
            calculation_type: "reproducibility".to_string(),
            payload: serde_json::json!({"error_nm": 0.4}),
            created: Utc::now(),
        };
        store.save_stage_result(&id, &stored).unwrap();
        let budget = StoredResult {
            stage: CalculationStage::Stage3,
            calculation_type: "uncertainty_budget".to_string(),
            ..stored.clone()
        };
        store.save_uncertainty_budget(&id, &budget).unwrap();
        assert_eq!(store.load_results(&id).unwrap().len(), 2);
        store.clear_results(&id).unwrap();
        assert!(store.load_results(&id).unwrap().is_empty());

        store
            .replace_results(&id, &[stored.clone(), budget.clone()])
            .unwrap();
        let rerun = StoredResult {
            run_id: RunId::new(),
            ..stored.clone()
        };
        store.replace_results(&id, &[rerun.clone()]).unwrap();
        let loaded = store.load_results(&id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_id, rerun.run_id);
        assert!(matches!(
            store.replace_results(&"NOPE".parse::<JobId>().unwrap(), &[rerun]),
            Err(StoreError::JobNotFound(_))
        ));
        store.clear_results(&id).unwrap();

        // Numbering continues from the existing records
        let first = store
            .save_deviations(&id, Some(&run), vec![request(Severity::High)], "engine")
            .unwrap();
        assert_eq!(first[0].number.to_string(), "DEV-25060-13-001");
        let more = store
            .save_deviations(
                &id,
                Some(&run),
                vec![request(Severity::Medium), request(Severity::High)],
                "engine",
            )
            .unwrap();
        assert_eq!(more[0].number.to_string(), "DEV-25060-13-002");
        assert_eq!(more[1].number.to_string(), "DEV-25060-13-003");

        let mut record = store.load_deviation(&more[1].number).unwrap().unwrap();
        record.severity = Severity::Low;
        store.update_deviation(&record).unwrap();
        let all = store.load_deviations(&id).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].severity, Severity::Low);

        store.set_certificate_gate(&id, true).unwrap();
        assert!(store.load_job(&id).unwrap().unwrap().can_generate_certificate);

        // Standards
        assert!(matches!(
            store.standards(&job.standards),
            Err(StoreError::StandardNotFound(_))
        ));
        store
            .save_standard(&ReferenceStandard::new(
                "STD-1",
                "Master transducer",
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            ))
            .unwrap();
        assert_eq!(store.standards(&job.standards).unwrap().len(), 1);

        let missing = DeviationNumber::new(id, 99);
        assert!(store.load_deviation(&missing).unwrap().is_none());
    }

    #[test]
    fn test_next_number_starts_at_one() {
        let id: JobId = "JOB-1".parse().unwrap();
        assert_eq!(next_number(&id, &[]).to_string(), "DEV-JOB-1-001");
    }
}
