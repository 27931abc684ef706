//! SQLite-backed job store
//!
//! One database file per laboratory. Records are kept as JSON alongside the
//! indexed columns the queries filter on. The store also serves reference
//! tables to the lookup store.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::schema::{init_schema, stored_version, SCHEMA_VERSION};
use super::{next_number, JobStore, StoreError, StoredResult};
use crate::core::identity::{DeviationNumber, JobId, RunId};
use crate::core::lookup::{LookupCategory, LookupSource, LookupTable};
use crate::entities::deviation::{DeviationRecord, DeviationRequest};
use crate::entities::job::{CalculationStatus, CalibrationJob};
use crate::entities::results::CalculationStage;
use crate::entities::standard::ReferenceStandard;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Throwaway store for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        match stored_version(&conn) {
            0 => init_schema(&conn)?,
            SCHEMA_VERSION => {}
            other => {
                return Err(StoreError::Corrupt(format!(
                    "database schema version {} is not supported (expected {})",
                    other, SCHEMA_VERSION
                )))
            }
        }
        Ok(Self { conn })
    }

    /// Store a reference table, replacing any existing rows
    pub fn save_lookup_table(
        &mut self,
        category: LookupCategory,
        table: &LookupTable,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO lookup_tables (lookup_type, category, data) VALUES (?1, ?2, ?3)",
            params![
                category.lookup_type(),
                category.category(),
                serde_json::to_string(table)?
            ],
        )?;
        Ok(())
    }

    fn require_job(&self, id: &JobId) -> Result<CalibrationJob, StoreError> {
        self.load_job(id)?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))
    }
}

fn insert_result(
    conn: &Connection,
    table: &str,
    id: &JobId,
    result: &StoredResult,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(&result.payload)?;
    if table == "uncertainty_budgets" {
        conn.execute(
            "INSERT INTO uncertainty_budgets (job_id, run_id, payload, created) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_str(),
                result.run_id.to_string(),
                payload,
                result.created.to_rfc3339()
            ],
        )?;
    } else {
        conn.execute(
            "INSERT INTO stage_results (job_id, run_id, stage, calculation_type, payload, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                result.run_id.to_string(),
                result.stage.number(),
                result.calculation_type,
                payload,
                result.created.to_rfc3339()
            ],
        )?;
    }
    Ok(())
}

fn delete_results(conn: &Connection, id: &JobId) -> Result<(), StoreError> {
    conn.execute("DELETE FROM stage_results WHERE job_id = ?1", params![id.as_str()])?;
    conn.execute(
        "DELETE FROM uncertainty_budgets WHERE job_id = ?1",
        params![id.as_str()],
    )?;
    Ok(())
}

fn from_json<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(data)?)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {}", s, e)))
}

fn write_actions(conn: &Connection, record: &DeviationRecord) -> Result<(), StoreError> {
    let number = record.number.to_string();
    conn.execute(
        "DELETE FROM deviation_actions WHERE number = ?1",
        params![number],
    )?;
    for action in &record.actions {
        conn.execute(
            "INSERT INTO deviation_actions (number, action_type, actor, timestamp, old_status, new_status, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                number,
                action.action_type.to_string(),
                action.actor,
                action.timestamp.to_rfc3339(),
                action.old_status.map(|s| s.to_string()),
                action.new_status.to_string(),
                action.comment
            ],
        )?;
    }
    Ok(())
}

impl JobStore for SqliteStore {
    fn load_job(&self, id: &JobId) -> Result<Option<CalibrationJob>, StoreError> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM jobs WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        data.as_deref().map(from_json::<CalibrationJob>).transpose()
    }

    fn save_job(&mut self, job: &CalibrationJob) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (id, calculation_status, can_generate_certificate, created, data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                calculation_status = excluded.calculation_status,
                can_generate_certificate = excluded.can_generate_certificate,
                data = excluded.data",
            params![
                job.id.as_str(),
                job.calculation_status.to_string(),
                job.can_generate_certificate,
                job.created.to_rfc3339(),
                serde_json::to_string(job)?
            ],
        )?;
        tx.execute(
            "DELETE FROM job_standards WHERE job_id = ?1",
            params![job.id.as_str()],
        )?;
        for standard in &job.standards {
            tx.execute(
                "INSERT OR IGNORE INTO job_standards (job_id, standard_id) VALUES (?1, ?2)",
                params![job.id.as_str(), standard],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_jobs(&self) -> Result<Vec<CalibrationJob>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT data FROM jobs ORDER BY created, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut jobs = Vec::new();
        for data in rows {
            jobs.push(from_json(&data?)?);
        }
        Ok(jobs)
    }

    fn begin_run(&mut self, id: &JobId, started: DateTime<Utc>) -> Result<CalibrationJob, StoreError> {
        let mut job = self.require_job(id)?;
        if !job.calculation_status.can_start_run() {
            return Err(StoreError::AlreadyProcessing(id.to_string()));
        }
        job.calculation_status = CalculationStatus::Processing;
        job.calculation_error = None;
        job.calculation_started_at = Some(started);
        job.calculation_completed_at = None;

        // The status guard makes the update a check-and-set
        let updated = self.conn.execute(
            "UPDATE jobs SET calculation_status = ?2, data = ?3
             WHERE id = ?1 AND calculation_status != 'processing'",
            params![
                id.as_str(),
                job.calculation_status.to_string(),
                serde_json::to_string(&job)?
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::AlreadyProcessing(id.to_string()));
        }
        Ok(job)
    }

    fn update_job_status(
        &mut self,
        id: &JobId,
        status: CalculationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut job = self.require_job(id)?;
        job.calculation_status = status;
        job.calculation_error = error.map(str::to_string);
        if status != CalculationStatus::Processing {
            job.calculation_completed_at = Some(Utc::now());
        }
        self.save_job(&job)
    }

    fn clear_results(&mut self, id: &JobId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        delete_results(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    fn save_stage_result(&mut self, id: &JobId, result: &StoredResult) -> Result<(), StoreError> {
        self.require_job(id)?;
        insert_result(&self.conn, "stage_results", id, result)
    }

    fn save_uncertainty_budget(
        &mut self,
        id: &JobId,
        result: &StoredResult,
    ) -> Result<(), StoreError> {
        self.require_job(id)?;
        insert_result(&self.conn, "uncertainty_budgets", id, result)
    }

    fn replace_results(&mut self, id: &JobId, results: &[StoredResult]) -> Result<(), StoreError> {
        self.require_job(id)?;

        // Rolls back to the previous run's records if any insert fails
        let tx = self.conn.transaction()?;
        delete_results(&tx, id)?;
        for result in results {
            let table = match result.stage {
                CalculationStage::Stage3 => "uncertainty_budgets",
                _ => "stage_results",
            };
            insert_result(&tx, table, id, result)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_results(&self, id: &JobId) -> Result<Vec<StoredResult>, StoreError> {
        let mut results = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT run_id, stage, calculation_type, payload, created FROM stage_results
             WHERE job_id = ?1 ORDER BY stage, id",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u8>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        for row in rows {
            let (run_id, stage, calculation_type, payload, created) = row?;
            results.push(StoredResult {
                run_id: run_id
                    .parse::<RunId>()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                stage: CalculationStage::from_number(stage)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown stage {}", stage)))?,
                calculation_type,
                payload: from_json(&payload)?,
                created: parse_datetime(&created)?,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT run_id, payload, created FROM uncertainty_budgets WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (run_id, payload, created) = row?;
            results.push(StoredResult {
                run_id: run_id
                    .parse::<RunId>()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                stage: CalculationStage::Stage3,
                calculation_type: "uncertainty_budget".to_string(),
                payload: from_json(&payload)?,
                created: parse_datetime(&created)?,
            });
        }
        Ok(results)
    }

    fn save_deviations(
        &mut self,
        id: &JobId,
        run_id: Option<&RunId>,
        requests: Vec<DeviationRequest>,
        identified_by: &str,
    ) -> Result<Vec<DeviationRecord>, StoreError> {
        self.require_job(id)?;
        let mut existing = self.load_deviations(id)?;

        let tx = self.conn.transaction()?;
        let mut created = Vec::with_capacity(requests.len());
        for request in requests {
            let number = next_number(id, &existing);
            let record =
                DeviationRecord::from_request(number, id.clone(), run_id.copied(), request, identified_by);
            tx.execute(
                "INSERT INTO deviations (number, job_id, sequence, status, severity, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.number.to_string(),
                    id.as_str(),
                    record.number.sequence(),
                    record.status.to_string(),
                    record.severity.to_string(),
                    serde_json::to_string(&record)?
                ],
            )?;
            write_actions(&tx, &record)?;
            existing.push(record.clone());
            created.push(record);
        }
        tx.commit()?;
        Ok(created)
    }

    fn load_deviations(&self, id: &JobId) -> Result<Vec<DeviationRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM deviations WHERE job_id = ?1 ORDER BY sequence")?;
        let rows = stmt.query_map(params![id.as_str()], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for data in rows {
            records.push(from_json(&data?)?);
        }
        Ok(records)
    }

    fn load_deviation(&self, number: &DeviationNumber) -> Result<Option<DeviationRecord>, StoreError> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM deviations WHERE number = ?1",
                params![number.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        data.as_deref().map(from_json::<DeviationRecord>).transpose()
    }

    fn update_deviation(&mut self, record: &DeviationRecord) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE deviations SET status = ?2, severity = ?3, data = ?4 WHERE number = ?1",
            params![
                record.number.to_string(),
                record.status.to_string(),
                record.severity.to_string(),
                serde_json::to_string(record)?
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::DeviationNotFound(record.number.to_string()));
        }
        write_actions(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn set_certificate_gate(&mut self, id: &JobId, open: bool) -> Result<(), StoreError> {
        let mut job = self.require_job(id)?;
        job.can_generate_certificate = open;
        self.save_job(&job)
    }

    fn save_standard(&mut self, standard: &ReferenceStandard) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO standards (id, name, valid_until, is_active, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                standard.id,
                standard.name,
                standard.valid_until.to_string(),
                standard.is_active,
                serde_json::to_string(standard)?
            ],
        )?;
        Ok(())
    }

    fn list_standards(&self) -> Result<Vec<ReferenceStandard>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT data FROM standards ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut standards = Vec::new();
        for data in rows {
            standards.push(from_json(&data?)?);
        }
        Ok(standards)
    }
}

impl LookupSource for SqliteStore {
    fn get_table(&self, lookup_type: &str, category: &str) -> Option<LookupTable> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM lookup_tables WHERE lookup_type = ?1 AND category = ?2",
                params![lookup_type, category],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten();
        match serde_json::from_str(data.as_deref()?) {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::warn!(lookup_type, category, error = %e, "unreadable lookup table ignored");
                None
            }
        }
    }
}
