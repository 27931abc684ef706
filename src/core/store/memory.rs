//! In-memory job store

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{next_number, JobStore, StoreError, StoredResult};
use crate::core::identity::{DeviationNumber, JobId, RunId};
use crate::entities::deviation::{DeviationRecord, DeviationRequest};
use crate::entities::job::{CalculationStatus, CalibrationJob};
use crate::entities::standard::ReferenceStandard;

#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: BTreeMap<JobId, CalibrationJob>,
    results: BTreeMap<JobId, Vec<StoredResult>>,
    deviations: BTreeMap<JobId, Vec<DeviationRecord>>,
    standards: BTreeMap<String, ReferenceStandard>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut CalibrationJob, StoreError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))
    }
}

impl JobStore for MemoryStore {
    fn load_job(&self, id: &JobId) -> Result<Option<CalibrationJob>, StoreError> {
        Ok(self.jobs.get(id).cloned())
    }

    fn save_job(&mut self, job: &CalibrationJob) -> Result<(), StoreError> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn list_jobs(&self) -> Result<Vec<CalibrationJob>, StoreError> {
        Ok(self.jobs.values().cloned().collect())
    }

    fn begin_run(&mut self, id: &JobId, started: DateTime<Utc>) -> Result<CalibrationJob, StoreError> {
        let job = self.job_mut(id)?;
        if !job.calculation_status.can_start_run() {
            return Err(StoreError::AlreadyProcessing(id.to_string()));
        }
        job.calculation_status = CalculationStatus::Processing;
        job.calculation_error = None;
        job.calculation_started_at = Some(started);
        job.calculation_completed_at = None;
        Ok(job.clone())
    }

    fn update_job_status(
        &mut self,
        id: &JobId,
        status: CalculationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let job = self.job_mut(id)?;
        job.calculation_status = status;
        job.calculation_error = error.map(str::to_string);
        if status != CalculationStatus::Processing {
            job.calculation_completed_at = Some(Utc::now());
        }
        Ok(())
    }

    fn clear_results(&mut self, id: &JobId) -> Result<(), StoreError> {
        self.results.remove(id);
        Ok(())
    }

    fn save_stage_result(&mut self, id: &JobId, result: &StoredResult) -> Result<(), StoreError> {
        self.job_mut(id)?;
        self.results.entry(id.clone()).or_default().push(result.clone());
        Ok(())
    }

    fn save_uncertainty_budget(
        &mut self,
        id: &JobId,
        result: &StoredResult,
    ) -> Result<(), StoreError> {
        self.save_stage_result(id, result)
    }

    fn replace_results(&mut self, id: &JobId, results: &[StoredResult]) -> Result<(), StoreError> {
        self.job_mut(id)?;
        self.results.insert(id.clone(), results.to_vec());
        Ok(())
    }

    fn load_results(&self, id: &JobId) -> Result<Vec<StoredResult>, StoreError> {
        let mut results = self.results.get(id).cloned().unwrap_or_default();
        results.sort_by_key(|r| r.stage.number());
        Ok(results)
    }

    fn save_deviations(
        &mut self,
        id: &JobId,
        run_id: Option<&RunId>,
        requests: Vec<DeviationRequest>,
        identified_by: &str,
    ) -> Result<Vec<DeviationRecord>, StoreError> {
        self.job_mut(id)?;
        let existing = self.deviations.entry(id.clone()).or_default();
        let mut created = Vec::with_capacity(requests.len());
        for request in requests {
            let number = next_number(id, existing.as_slice());
            let record = DeviationRecord::from_request(
                number,
                id.clone(),
                run_id.cloned(),
                request,
                identified_by,
            );
            existing.push(record.clone());
            created.push(record);
        }
        Ok(created)
    }

    fn load_deviations(&self, id: &JobId) -> Result<Vec<DeviationRecord>, StoreError> {
        Ok(self.deviations.get(id).cloned().unwrap_or_default())
    }

    fn load_deviation(&self, number: &DeviationNumber) -> Result<Option<DeviationRecord>, StoreError> {
        Ok(self
            .deviations
            .get(number.job())
            .and_then(|records| records.iter().find(|r| &r.number == number))
            .cloned())
    }

    fn update_deviation(&mut self, record: &DeviationRecord) -> Result<(), StoreError> {
        let slot = self
            .deviations
            .get_mut(&record.job_id)
            .and_then(|records| records.iter_mut().find(|r| r.number == record.number))
            .ok_or_else(|| StoreError::DeviationNotFound(record.number.to_string()))?;
        *slot = record.clone();
        Ok(())
    }

    fn set_certificate_gate(&mut self, id: &JobId, open: bool) -> Result<(), StoreError> {
        self.job_mut(id)?.can_generate_certificate = open;
        Ok(())
    }

    fn save_standard(&mut self, standard: &ReferenceStandard) -> Result<(), StoreError> {
        self.standards.insert(standard.id.clone(), standard.clone());
        Ok(())
    }

    fn list_standards(&self) -> Result<Vec<ReferenceStandard>, StoreError> {
        Ok(self.standards.values().cloned().collect())
    }
}
