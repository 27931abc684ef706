//! Raw measurement payload and reading-count validation
//!
//! The payload is the JSON document produced by the bench operator:
//!
//! ```json
//! {
//!   "repeatability_points": [{"set_torque": 1349, "readings": [..5], "pressure": 138}],
//!   "reproducibility": {"sequences": {"I": [..5], "II": [..5], "III": [..5], "IV": [..5]}},
//!   "output_drive": {"positions": {"0°": [..10], "90°": [..10], "180°": [..10], "270°": [..10]}},
//!   "interface": {"positions": {"0°": [..10], "90°": [..10], "180°": [..10], "270°": [..10]}},
//!   "loading_point": {"-10mm": [..N], "+10mm": [..N]}
//! }
//! ```
//!
//! Counts are never padded or truncated. A wrong count is an [`InputError`]
//! naming the component and the expected and actual count.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Readings per repeatability point
pub const REPEATABILITY_READINGS: usize = 5;
/// Reproducibility sequence names, in sheet order
pub const SEQUENCES: [&str; 4] = ["I", "II", "III", "IV"];
/// Readings per reproducibility sequence
pub const SEQUENCE_READINGS: usize = 5;
/// Rotational positions for output-drive and interface effects
pub const POSITIONS: [&str; 4] = ["0°", "90°", "180°", "270°"];
/// Readings per rotational position
pub const POSITION_READINGS: usize = 10;
/// Loading-point offsets
pub const LOADING_OFFSETS: [&str; 2] = ["-10mm", "+10mm"];
/// Default readings per loading-point offset
pub const DEFAULT_LOADING_READINGS: usize = 5;

/// Input validation failures
#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum InputError {
    #[error("{component}: missing required section")]
    #[diagnostic(code(caliber::input::missing_section))]
    MissingSection { component: String },

    #[error("{component}: expected {expected} readings, got {actual}")]
    #[diagnostic(
        code(caliber::input::count),
        help("readings are never padded or truncated; re-enter the full set")
    )]
    WrongCount {
        component: String,
        expected: usize,
        actual: usize,
    },

    #[error("{component}: unexpected key '{key}'")]
    #[diagnostic(code(caliber::input::unexpected_key))]
    UnexpectedKey { component: String, key: String },

    #[error("{component}: set torque must be positive, got {value}")]
    #[diagnostic(code(caliber::input::set_torque))]
    NonPositiveSetTorque { component: String, value: f64 },

    #[error("{component}: reading {index} is not a finite number")]
    #[diagnostic(code(caliber::input::non_finite))]
    NonFinite { component: String, index: usize },

    #[error("{component}: reading {index} is zero, relative error is undefined")]
    #[diagnostic(code(caliber::input::zero_reading))]
    ZeroReading { component: String, index: usize },

    #[error("{component}: {stage} result is missing")]
    #[diagnostic(code(caliber::input::missing_stage))]
    MissingStageResult { component: String, stage: String },

    #[error("Malformed measurement payload: {0}")]
    #[diagnostic(code(caliber::input::malformed))]
    Malformed(String),
}

/// A calibration point: set torque plus its fixed-length reading set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatabilityPoint {
    pub set_torque: f64,
    pub readings: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproducibilityData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_torque: Option<f64>,
    pub sequences: BTreeMap<String, Vec<f64>>,
}

/// Readings keyed by rotational position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_torque: Option<f64>,
    pub positions: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingPointData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_torque: Option<f64>,
    #[serde(rename = "-10mm", default)]
    pub minus_10mm: Vec<f64>,
    #[serde(rename = "+10mm", default)]
    pub plus_10mm: Vec<f64>,
}

/// Complete raw measurement payload for one job run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeasurementData {
    #[serde(default)]
    pub repeatability_points: Vec<RepeatabilityPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reproducibility: Option<ReproducibilityData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_drive: Option<PositionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<PositionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loading_point: Option<LoadingPointData>,
}

impl MeasurementData {
    pub fn from_json(s: &str) -> Result<Self, InputError> {
        serde_json::from_str(s).map_err(|e| InputError::Malformed(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, InputError> {
        serde_json::from_value(value).map_err(|e| InputError::Malformed(e.to_string()))
    }

    /// Read a payload from a `.json` or `.yaml` file
    pub fn from_file(path: &Path) -> Result<Self, InputError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| InputError::Malformed(format!("{}: {}", path.display(), e)))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            serde_yml::from_str(&contents).map_err(|e| InputError::Malformed(e.to_string()))
        } else {
            Self::from_json(&contents)
        }
    }

    /// Canonical JSON used for fingerprinting (map keys are sorted)
    pub fn canonical_json(&self) -> String {
        serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    pub fn reproducibility(&self) -> Result<&ReproducibilityData, InputError> {
        self.reproducibility
            .as_ref()
            .ok_or_else(|| missing("reproducibility"))
    }

    pub fn output_drive(&self) -> Result<&PositionData, InputError> {
        self.output_drive.as_ref().ok_or_else(|| missing("output_drive"))
    }

    pub fn interface(&self) -> Result<&PositionData, InputError> {
        self.interface.as_ref().ok_or_else(|| missing("interface"))
    }

    pub fn loading_point(&self) -> Result<&LoadingPointData, InputError> {
        self.loading_point
            .as_ref()
            .ok_or_else(|| missing("loading_point"))
    }
}

fn missing(component: &str) -> InputError {
    InputError::MissingSection {
        component: component.to_string(),
    }
}

/// Check a reading set has exactly `expected` finite values
pub fn check_readings(component: &str, readings: &[f64], expected: usize) -> Result<(), InputError> {
    if readings.len() != expected {
        return Err(InputError::WrongCount {
            component: component.to_string(),
            expected,
            actual: readings.len(),
        });
    }
    if let Some(index) = readings.iter().position(|r| !r.is_finite()) {
        return Err(InputError::NonFinite {
            component: component.to_string(),
            index,
        });
    }
    Ok(())
}

/// Check a keyed reading group has exactly the named keys, each with `expected` readings
///
/// Returns the reading sets in the order of `keys`.
pub fn check_keyed<'a>(
    component: &str,
    groups: &'a BTreeMap<String, Vec<f64>>,
    keys: &[&str],
    expected: usize,
) -> Result<Vec<(&'a str, &'a [f64])>, InputError> {
    if let Some(extra) = groups.keys().find(|k| !keys.contains(&k.as_str())) {
        return Err(InputError::UnexpectedKey {
            component: component.to_string(),
            key: extra.clone(),
        });
    }
    if groups.len() != keys.len() {
        return Err(InputError::WrongCount {
            component: format!("{} groups", component),
            expected: keys.len(),
            actual: groups.len(),
        });
    }

    keys.iter()
        .map(|key| {
            let (name, readings) = groups
                .get_key_value(*key)
                .ok_or_else(|| missing(&format!("{} {}", component, key)))?;
            check_readings(&format!("{} {}", component, key), readings, expected)?;
            Ok((name.as_str(), readings.as_slice()))
        })
        .collect()
}

/// Arithmetic mean; callers guarantee a non-empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divisor n)
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Sample standard deviation (divisor n-1), zero for a single value
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64).sqrt()
}
