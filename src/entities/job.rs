//! Calibration job - the unit of work the engine calculates for

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::{ToleranceOverride, DEFAULT_CONFIG_NAME};
use crate::core::identity::JobId;

/// Calculation status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum CalculationStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    CompletedWithDeviations,
    Failed,
    /// All deviations accepted by the customer
    Approved,
    /// The customer rejected a deviation
    Rejected,
}

impl CalculationStatus {
    /// Whether a new run may start from this status
    pub fn can_start_run(&self) -> bool {
        !matches!(self, CalculationStatus::Processing)
    }

    /// Whether persisted stage results exist for this status
    pub fn has_results(&self) -> bool {
        matches!(
            self,
            CalculationStatus::Completed
                | CalculationStatus::CompletedWithDeviations
                | CalculationStatus::Approved
                | CalculationStatus::Rejected
        )
    }
}

impl std::fmt::Display for CalculationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalculationStatus::Pending => write!(f, "pending"),
            CalculationStatus::Processing => write!(f, "processing"),
            CalculationStatus::Completed => write!(f, "completed"),
            CalculationStatus::CompletedWithDeviations => write!(f, "completed_with_deviations"),
            CalculationStatus::Failed => write!(f, "failed"),
            CalculationStatus::Approved => write!(f, "approved"),
            CalculationStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for CalculationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(CalculationStatus::Pending),
            "processing" => Ok(CalculationStatus::Processing),
            "completed" => Ok(CalculationStatus::Completed),
            "completed_with_deviations" => Ok(CalculationStatus::CompletedWithDeviations),
            "failed" => Ok(CalculationStatus::Failed),
            "approved" => Ok(CalculationStatus::Approved),
            "rejected" => Ok(CalculationStatus::Rejected),
            _ => Err(format!(
                "Invalid calculation status: {}. Use pending, processing, completed, completed_with_deviations, failed, approved, or rejected",
                s
            )),
        }
    }
}

/// Lab conditions recorded before and after the calibration
///
/// Humidity is in %RH. Values at or below 1.0 are read as fractions
/// (0.55 means 55 %RH), the way older job records stored them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentalReadings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_after: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_after: Option<f64>,
}

impl EnvironmentalReadings {
    pub fn humidity_before_percent(&self) -> Option<f64> {
        self.humidity_before.map(as_percent)
    }

    pub fn humidity_after_percent(&self) -> Option<f64> {
        self.humidity_after.map(as_percent)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn as_percent(value: f64) -> f64 {
    if value <= 1.0 {
        value * 100.0
    } else {
        value
    }
}

/// A calibration job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationJob {
    pub id: JobId,

    /// Work order reference printed on the certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,

    /// Engine config (procedure) used for this job
    #[serde(default = "default_config_name")]
    pub config_name: String,

    #[serde(default)]
    pub environment: EnvironmentalReadings,

    /// Reference standards used, by standard id
    #[serde(default)]
    pub standards: Vec<String>,

    #[serde(default)]
    pub calculation_status: CalculationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation_started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation_completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "ToleranceOverride::is_empty")]
    pub tolerance_limits: ToleranceOverride,

    /// Certificate gate; closed while any deviation is pending
    #[serde(default)]
    pub can_generate_certificate: bool,

    pub created: DateTime<Utc>,
}

fn default_config_name() -> String {
    DEFAULT_CONFIG_NAME.to_string()
}

impl CalibrationJob {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            work_id: None,
            customer: None,
            config_name: default_config_name(),
            environment: EnvironmentalReadings::default(),
            standards: Vec::new(),
            calculation_status: CalculationStatus::Pending,
            calculation_error: None,
            calculation_started_at: None,
            calculation_completed_at: None,
            tolerance_limits: ToleranceOverride::default(),
            can_generate_certificate: false,
            created: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_humidity_fraction_is_scaled() {
        let env = EnvironmentalReadings {
            humidity_before: Some(0.55),
            humidity_after: Some(62.0),
            ..Default::default()
        };
        assert!((env.humidity_before_percent().unwrap() - 55.0).abs() < 1e-10);
        assert_eq!(env.humidity_after_percent(), Some(62.0));
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            "pending",
            "processing",
            "completed",
            "completed_with_deviations",
            "failed",
            "approved",
            "rejected",
        ] {
            let status: CalculationStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("done".parse::<CalculationStatus>().is_err());
    }

    #[test]
    fn test_processing_blocks_new_run() {
        assert!(!CalculationStatus::Processing.can_start_run());
        assert!(CalculationStatus::Failed.can_start_run());
        assert!(CalculationStatus::Completed.has_results());
        assert!(!CalculationStatus::Pending.has_results());
    }

    #[test]
    fn test_job_defaults_from_yaml() {
        let yaml = "id: JOB-1\ncreated: 2025-06-01T08:00:00Z\nenvironment:\n  temp_before: 22.5\n";
        let job: CalibrationJob = serde_yml::from_str(yaml).unwrap();
        assert_eq!(job.id.as_str(), "JOB-1");
        assert_eq!(job.config_name, DEFAULT_CONFIG_NAME);
        assert_eq!(job.calculation_status, CalculationStatus::Pending);
        assert_eq!(job.environment.temp_before, Some(22.5));
        assert!(job.tolerance_limits.is_empty());
        assert!(!job.can_generate_certificate);
    }
}
