//! Reference tables and interpolation
//!
//! Four certified tables back the calculation stages: instrument error vs.
//! torque, master-standard uncertainty, CMC bands and device-error bands.
//!
//! Boundary policy: inputs outside a table's range clamp to the nearest
//! boundary value. No category ever extrapolates.
//!
//! A missing or empty table never raises. The store returns the category's
//! fallback constant, tagged [`Confidence::Fallback`], and records the
//! category so the workflow can report the run as low-confidence.

use csv::ReaderBuilder;
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

/// Inputs closer than this to a stored x-value return the stored y-value
pub const EXACT_MATCH_EPSILON: f64 = 0.1;

#[derive(Embed)]
#[folder = "defaults/tables/"]
struct DefaultTables;

/// Errors raised while loading a table from CSV
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Failed to read table '{name}': {source}")]
    Csv {
        name: String,
        #[source]
        source: csv::Error,
    },

    #[error("Table '{name}' row {row}: lower bound {lower} is above upper bound {upper}")]
    InvertedBand {
        name: String,
        row: usize,
        lower: f64,
        upper: f64,
    },

    #[error("Table '{name}' contains a non-finite value")]
    NonFinite { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named lookup categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupCategory {
    /// Torque transducer error against indicated torque
    TorqueError,
    /// Master-standard certificate uncertainty against torque
    MasterStandardUncertainty,
    /// Calibration and measurement capability bands
    CmcBand,
    /// Maximum device error bands
    DeviceErrorBand,
}

impl LookupCategory {
    pub const ALL: [LookupCategory; 4] = [
        LookupCategory::TorqueError,
        LookupCategory::MasterStandardUncertainty,
        LookupCategory::CmcBand,
        LookupCategory::DeviceErrorBand,
    ];

    /// Table type key used by lookup sources
    pub fn lookup_type(&self) -> &'static str {
        match self {
            LookupCategory::TorqueError => "interpolation",
            LookupCategory::MasterStandardUncertainty => "uncertainty",
            LookupCategory::CmcBand => "cmc",
            LookupCategory::DeviceErrorBand => "measurement_error",
        }
    }

    /// Category key used by lookup sources
    pub fn category(&self) -> &'static str {
        match self {
            LookupCategory::TorqueError => "torque_transducer",
            LookupCategory::MasterStandardUncertainty => "master_standard",
            LookupCategory::CmcBand => "calibration_capability",
            LookupCategory::DeviceErrorBand => "device_error",
        }
    }

    /// Resolve a `(lookup_type, category)` pair back to a category
    pub fn from_keys(lookup_type: &str, category: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.lookup_type() == lookup_type && c.category() == category)
    }

    /// Value returned when the table is missing or empty
    pub fn fallback(&self) -> f64 {
        match self {
            LookupCategory::TorqueError => 0.0,
            LookupCategory::MasterStandardUncertainty => 0.5,
            LookupCategory::CmcBand => 2.0,
            LookupCategory::DeviceErrorBand => 0.1,
        }
    }

    pub fn is_banded(&self) -> bool {
        matches!(self, LookupCategory::CmcBand | LookupCategory::DeviceErrorBand)
    }

    /// File name used by CSV-backed sources
    pub fn file_name(&self) -> String {
        format!("{}.csv", self)
    }
}

impl fmt::Display for LookupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupCategory::TorqueError => write!(f, "torque_error"),
            LookupCategory::MasterStandardUncertainty => write!(f, "master_standard_uncertainty"),
            LookupCategory::CmcBand => write!(f, "cmc_band"),
            LookupCategory::DeviceErrorBand => write!(f, "device_error_band"),
        }
    }
}

impl std::str::FromStr for LookupCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "torque_error" | "torque" => Ok(LookupCategory::TorqueError),
            "master_standard_uncertainty" | "master_standard" | "master" => {
                Ok(LookupCategory::MasterStandardUncertainty)
            }
            "cmc_band" | "cmc" => Ok(LookupCategory::CmcBand),
            "device_error_band" | "device_error" => Ok(LookupCategory::DeviceErrorBand),
            _ => Err(format!(
                "Invalid lookup category: {}. Use torque_error, master_standard_uncertainty, cmc_band, or device_error_band",
                s
            )),
        }
    }
}

/// One row of a point table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TablePoint {
    pub x: f64,
    pub y: f64,
}

/// One row of a band table (`lower <= x <= upper`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub lower: f64,
    pub upper: f64,
    pub value: f64,
}

/// Sorted reference table rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum LookupTable {
    Points(Vec<TablePoint>),
    Bands(Vec<Band>),
}

impl LookupTable {
    /// Build a point table, sorting rows by x
    pub fn points(mut rows: Vec<TablePoint>) -> Self {
        rows.sort_by(|a, b| a.x.total_cmp(&b.x));
        LookupTable::Points(rows)
    }

    /// Build a band table, sorting rows by lower bound
    pub fn bands(mut rows: Vec<Band>) -> Self {
        rows.sort_by(|a, b| a.lower.total_cmp(&b.lower));
        LookupTable::Bands(rows)
    }

    pub fn len(&self) -> usize {
        match self {
            LookupTable::Points(rows) => rows.len(),
            LookupTable::Bands(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate the table at `x`, or `None` when it has no rows
    pub fn lookup(&self, x: f64) -> Option<f64> {
        match self {
            LookupTable::Points(rows) => interpolate_points(rows, x),
            LookupTable::Bands(rows) => lookup_band(rows, x),
        }
    }

    /// Parse a table from CSV (`x,y` for points, `lower,upper,value` for bands)
    pub fn from_csv<R: Read>(name: &str, banded: bool, reader: R) -> Result<Self, LookupError> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let csv_err = |source| LookupError::Csv {
            name: name.to_string(),
            source,
        };

        let table = if banded {
            let rows = rdr
                .deserialize::<Band>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(csv_err)?;
            for (i, band) in rows.iter().enumerate() {
                if band.lower > band.upper {
                    return Err(LookupError::InvertedBand {
                        name: name.to_string(),
                        row: i + 1,
                        lower: band.lower,
                        upper: band.upper,
                    });
                }
            }
            LookupTable::bands(rows)
        } else {
            let rows = rdr
                .deserialize::<TablePoint>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(csv_err)?;
            LookupTable::points(rows)
        };

        if !table.is_finite() {
            return Err(LookupError::NonFinite {
                name: name.to_string(),
            });
        }
        Ok(table)
    }

    fn is_finite(&self) -> bool {
        match self {
            LookupTable::Points(rows) => rows.iter().all(|r| r.x.is_finite() && r.y.is_finite()),
            LookupTable::Bands(rows) => rows
                .iter()
                .all(|r| r.lower.is_finite() && r.upper.is_finite() && r.value.is_finite()),
        }
    }
}

fn interpolate_points(rows: &[TablePoint], x: f64) -> Option<f64> {
    let first = rows.first()?;
    let last = rows.last()?;

    if let Some(hit) = rows.iter().find(|r| (x - r.x).abs() < EXACT_MATCH_EPSILON) {
        return Some(hit.y);
    }
    if x <= first.x {
        return Some(first.y);
    }
    if x >= last.x {
        return Some(last.y);
    }

    rows.windows(2).find_map(|pair| {
        let (lo, hi) = (pair[0], pair[1]);
        if lo.x <= x && x <= hi.x {
            if hi.x == lo.x {
                return Some(lo.y);
            }
            Some(lo.y + (hi.y - lo.y) * (x - lo.x) / (hi.x - lo.x))
        } else {
            None
        }
    })
}

fn lookup_band(rows: &[Band], x: f64) -> Option<f64> {
    let first = rows.first()?;
    let last = rows.last()?;

    if let Some(band) = rows.iter().find(|b| b.lower <= x && x <= b.upper) {
        return Some(band.value);
    }
    if x < first.lower {
        return Some(first.value);
    }
    if x > last.upper {
        return Some(last.value);
    }
    // Inside a gap between two bands: the next band up applies
    rows.iter()
        .find(|b| b.lower > x)
        .map(|b| b.value)
        .or(Some(last.value))
}

/// Provider of reference tables
pub trait LookupSource {
    /// Fetch the sorted rows for a table, or `None` if it does not exist
    fn get_table(&self, lookup_type: &str, category: &str) -> Option<LookupTable>;
}

/// Whether a lookup value came from a table or a fallback constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Table,
    Fallback,
}

/// Result of a single lookup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub value: f64,
    pub confidence: Confidence,
}

/// Run-scoped lookup store
///
/// Each workflow run owns one store. Tables are fetched from the source at
/// most once per category and cached for the rest of the run.
pub struct LookupStore<'a> {
    source: &'a dyn LookupSource,
    cache: HashMap<LookupCategory, Option<LookupTable>>,
    fallbacks: BTreeSet<LookupCategory>,
}

impl<'a> LookupStore<'a> {
    pub fn new(source: &'a dyn LookupSource) -> Self {
        Self {
            source,
            cache: HashMap::new(),
            fallbacks: BTreeSet::new(),
        }
    }

    /// Evaluate `category` at `x`
    pub fn interpolate(&mut self, category: LookupCategory, x: f64) -> Lookup {
        let source = self.source;
        let table = self.cache.entry(category).or_insert_with(|| {
            source
                .get_table(category.lookup_type(), category.category())
                .filter(|t| !t.is_empty())
        });

        match table.as_ref().and_then(|t| t.lookup(x)) {
            Some(value) => Lookup {
                value,
                confidence: Confidence::Table,
            },
            None => {
                if self.fallbacks.insert(category) {
                    tracing::warn!(
                        category = %category,
                        fallback = category.fallback(),
                        "lookup table missing, using fallback constant"
                    );
                }
                Lookup {
                    value: category.fallback(),
                    confidence: Confidence::Fallback,
                }
            }
        }
    }

    /// Convenience wrapper returning only the value
    pub fn value(&mut self, category: LookupCategory, x: f64) -> f64 {
        self.interpolate(category, x).value
    }

    /// Categories that fell back to a constant during this run
    pub fn fallbacks(&self) -> &BTreeSet<LookupCategory> {
        &self.fallbacks
    }
}

/// Tables compiled into the binary from `defaults/tables/`
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedTables;

impl EmbeddedTables {
    pub fn table(category: LookupCategory) -> Option<LookupTable> {
        let name = category.file_name();
        let file = DefaultTables::get(&name)?;
        match LookupTable::from_csv(&name, category.is_banded(), &file.data[..]) {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::error!(table = %name, error = %e, "embedded table is malformed");
                None
            }
        }
    }
}

impl LookupSource for EmbeddedTables {
    fn get_table(&self, lookup_type: &str, category: &str) -> Option<LookupTable> {
        LookupCategory::from_keys(lookup_type, category).and_then(Self::table)
    }
}

/// Tables read from a directory of CSV files named after their category
#[derive(Debug, Clone)]
pub struct CsvTables {
    tables: HashMap<LookupCategory, LookupTable>,
}

impl CsvTables {
    /// Load every recognised `*.csv` file under `dir`
    pub fn load(dir: &Path) -> Result<Self, LookupError> {
        let mut tables = HashMap::new();

        for entry in WalkDir::new(dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let Some(category) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<LookupCategory>().ok())
            else {
                tracing::debug!(path = %path.display(), "skipping unrecognised table file");
                continue;
            };

            let file = std::fs::File::open(path)?;
            let table = LookupTable::from_csv(
                &path.display().to_string(),
                category.is_banded(),
                std::io::BufReader::new(file),
            )?;
            tracing::debug!(category = %category, rows = table.len(), "loaded table");
            tables.insert(category, table);
        }

        Ok(Self { tables })
    }

    pub fn categories(&self) -> Vec<LookupCategory> {
        let mut cats: Vec<_> = self.tables.keys().copied().collect();
        cats.sort();
        cats
    }
}

impl LookupSource for CsvTables {
    fn get_table(&self, lookup_type: &str, category: &str) -> Option<LookupTable> {
        LookupCategory::from_keys(lookup_type, category).and_then(|c| self.tables.get(&c).cloned())
    }
}

/// Tables held in memory, mainly for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct InMemoryTables {
    tables: HashMap<LookupCategory, LookupTable>,
}

impl InMemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source seeded with the embedded default tables
    pub fn with_defaults() -> Self {
        let tables = LookupCategory::ALL
            .into_iter()
            .filter_map(|c| EmbeddedTables::table(c).map(|t| (c, t)))
            .collect();
        Self { tables }
    }

    pub fn insert(&mut self, category: LookupCategory, table: LookupTable) -> &mut Self {
        self.tables.insert(category, table);
        self
    }

    pub fn remove(&mut self, category: LookupCategory) -> Option<LookupTable> {
        self.tables.remove(&category)
    }
}

impl LookupSource for InMemoryTables {
    fn get_table(&self, lookup_type: &str, category: &str) -> Option<LookupTable> {
        LookupCategory::from_keys(lookup_type, category).and_then(|c| self.tables.get(&c).cloned())
    }
}
