//! Shared helper functions for CLI commands
//!
//! Settings, store and table-source setup used by every command, plus the
//! output helpers that turn records into YAML, JSON or `tabled` tables.

use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::Path;
use tabled::{builder::Builder, settings::Style};

use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::config::Settings;
use crate::core::identity::{DeviationNumber, JobId};
use crate::core::lookup::{CsvTables, InMemoryTables, LookupCategory, LookupSource};
use crate::core::store::SqliteStore;

/// Load settings from every layer, honouring `--config` and `--db`
pub fn load_settings(global: &GlobalOpts) -> Result<Settings> {
    let mut settings = Settings::load(global.config.as_deref())?;
    if let Some(db) = &global.db {
        settings.database = Some(db.clone());
    }
    Ok(settings)
}

/// Open (or create) the job database
pub fn open_store(settings: &Settings) -> Result<SqliteStore> {
    let path = settings.database_path();
    tracing::debug!(path = %path.display(), "opening store");
    Ok(SqliteStore::open(&path)?)
}

/// Reference tables for a run
///
/// Built-in tables are overridden by tables imported into the database,
/// which in turn are overridden by a CSV directory (`--tables` or the
/// configured `tables_dir`).
pub fn table_source(
    settings: &Settings,
    store: &SqliteStore,
    dir: Option<&Path>,
) -> Result<InMemoryTables> {
    let mut tables = InMemoryTables::with_defaults();

    for category in LookupCategory::ALL {
        if let Some(table) = store.get_table(category.lookup_type(), category.category()) {
            tables.insert(category, table);
        }
    }

    if let Some(dir) = dir.or(settings.tables_dir.as_deref()) {
        let csv = CsvTables::load(dir).into_diagnostic()?;
        for category in csv.categories() {
            if let Some(table) = csv.get_table(category.lookup_type(), category.category()) {
                tables.insert(category, table);
            }
        }
    }

    Ok(tables)
}

pub fn parse_job_id(s: &str) -> Result<JobId> {
    s.parse().into_diagnostic()
}

pub fn parse_deviation_number(s: &str) -> Result<DeviationNumber> {
    s.parse().into_diagnostic()
}

/// Print a record as YAML or JSON
pub fn print_serialized<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value).into_diagnostic()?;
            println!("{}", json);
        }
        _ => {
            let yaml = serde_yml::to_string(value).into_diagnostic()?;
            print!("{}", yaml);
        }
    }
    Ok(())
}

/// Render a table in the requested style
pub fn render_table(builder: Builder, format: OutputFormat) -> String {
    let mut table = builder.build();
    match format {
        OutputFormat::Md => table.with(Style::markdown()),
        _ => table.with(Style::rounded()),
    };
    table.to_string()
}

/// Truncate a string to max_len, adding "..." if truncated
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format an optional number, `-` when absent
pub fn format_opt(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}
