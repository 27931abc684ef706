//! Database schema initialization

use rusqlite::{params, Connection};

use super::StoreError;

/// Current schema version; stores created with another version are rejected
pub(super) const SCHEMA_VERSION: i32 = 1;

/// Create all tables for a fresh database
pub(super) fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Calibration jobs; the full record is kept as JSON
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            calculation_status TEXT NOT NULL,
            can_generate_certificate INTEGER NOT NULL DEFAULT 0,
            created TEXT NOT NULL,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(calculation_status);

        -- Reference standards
        CREATE TABLE IF NOT EXISTS standards (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            valid_until TEXT NOT NULL,
            is_active INTEGER NOT NULL,
            data TEXT NOT NULL
        );

        -- Standards used by a job
        CREATE TABLE IF NOT EXISTS job_standards (
            job_id TEXT NOT NULL,
            standard_id TEXT NOT NULL,
            PRIMARY KEY (job_id, standard_id),
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        -- Stage 1 and 2 results
        CREATE TABLE IF NOT EXISTS stage_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            stage INTEGER NOT NULL,
            calculation_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_stage_results_job ON stage_results(job_id);

        -- Stage 3 budgets, one row per calibration point
        CREATE TABLE IF NOT EXISTS uncertainty_budgets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_budgets_job ON uncertainty_budgets(job_id);

        -- Deviation reports
        CREATE TABLE IF NOT EXISTS deviations (
            number TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            status TEXT NOT NULL,
            severity TEXT NOT NULL,
            data TEXT NOT NULL,
            UNIQUE (job_id, sequence),
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_deviations_job ON deviations(job_id);

        -- Deviation audit trail
        CREATE TABLE IF NOT EXISTS deviation_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            number TEXT NOT NULL,
            action_type TEXT NOT NULL,
            actor TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            old_status TEXT,
            new_status TEXT NOT NULL,
            comment TEXT,
            FOREIGN KEY (number) REFERENCES deviations(number) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_actions_number ON deviation_actions(number);

        -- Reference tables (lookup_type, category) -> rows
        CREATE TABLE IF NOT EXISTS lookup_tables (
            lookup_type TEXT NOT NULL,
            category TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (lookup_type, category)
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Stored schema version, 0 when the table is missing
pub(super) fn stored_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
        row.get(0)
    })
    .unwrap_or(0)
}
