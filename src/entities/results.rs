//! Calculation results produced by the three engine stages
//!
//! Results are immutable once built. A recalculation replaces them with a
//! new set; nothing in the engine edits a stored result.

use serde::{Deserialize, Serialize};

use crate::core::stage1::{EffectResult, LoadingPointResult, RepeatabilityResult};
use crate::core::stage2::ResolutionAnalysis;
use crate::core::stage3::UncertaintyBudgetResult;

/// Outcome of validating a computed value against its tolerance limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Passed,
    Failed,
}

impl ValidationStatus {
    /// `Failed` when `value` exceeds `limit`
    pub fn against(value: f64, limit: f64) -> Self {
        if value > limit {
            ValidationStatus::Failed
        } else {
            ValidationStatus::Passed
        }
    }

    pub fn is_failed(&self) -> bool {
        *self == ValidationStatus::Failed
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationStatus::Passed => write!(f, "passed"),
            ValidationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "passed" | "pass" => Ok(ValidationStatus::Passed),
            "failed" | "fail" => Ok(ValidationStatus::Failed),
            _ => Err(format!("Invalid validation status: {}. Use passed or failed", s)),
        }
    }
}

/// Engine stage that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStage {
    /// Raw data reduction
    Stage1,
    /// Resolution and error analysis
    Stage2,
    /// Uncertainty budget
    Stage3,
}

impl CalculationStage {
    pub fn number(&self) -> u8 {
        match self {
            CalculationStage::Stage1 => 1,
            CalculationStage::Stage2 => 2,
            CalculationStage::Stage3 => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CalculationStage::Stage1 => "raw data reduction",
            CalculationStage::Stage2 => "resolution and error analysis",
            CalculationStage::Stage3 => "uncertainty budget",
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(CalculationStage::Stage1),
            2 => Some(CalculationStage::Stage2),
            3 => Some(CalculationStage::Stage3),
            _ => None,
        }
    }
}

impl std::fmt::Display for CalculationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage{}", self.number())
    }
}

impl std::str::FromStr for CalculationStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stage1" | "1" => Ok(CalculationStage::Stage1),
            "stage2" | "2" => Ok(CalculationStage::Stage2),
            "stage3" | "3" => Ok(CalculationStage::Stage3),
            _ => Err(format!("Invalid stage: {}. Use stage1, stage2, or stage3", s)),
        }
    }
}

/// A single stage result, tagged by calculation type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "calculation_type", rename_all = "snake_case")]
pub enum StageResult {
    Repeatability(RepeatabilityResult),
    Reproducibility(EffectResult),
    OutputDrive(EffectResult),
    Interface(EffectResult),
    LoadingPoint(LoadingPointResult),
    ResolutionAnalysis(ResolutionAnalysis),
    UncertaintyBudget(UncertaintyBudgetResult),
}

impl StageResult {
    pub fn stage(&self) -> CalculationStage {
        match self {
            StageResult::Repeatability(_)
            | StageResult::Reproducibility(_)
            | StageResult::OutputDrive(_)
            | StageResult::Interface(_)
            | StageResult::LoadingPoint(_) => CalculationStage::Stage1,
            StageResult::ResolutionAnalysis(_) => CalculationStage::Stage2,
            StageResult::UncertaintyBudget(_) => CalculationStage::Stage3,
        }
    }

    /// Persistence key for the result type
    pub fn calculation_type(&self) -> &'static str {
        match self {
            StageResult::Repeatability(_) => "repeatability",
            StageResult::Reproducibility(_) => "reproducibility",
            StageResult::OutputDrive(_) => "output_drive",
            StageResult::Interface(_) => "interface",
            StageResult::LoadingPoint(_) => "loading_point",
            StageResult::ResolutionAnalysis(_) => "resolution_analysis",
            StageResult::UncertaintyBudget(_) => "uncertainty_budget",
        }
    }

    pub fn validation_status(&self) -> ValidationStatus {
        match self {
            StageResult::Repeatability(r) => r.validation_status,
            StageResult::Reproducibility(r)
            | StageResult::OutputDrive(r)
            | StageResult::Interface(r) => r.validation_status,
            StageResult::LoadingPoint(r) => r.validation_status,
            StageResult::ResolutionAnalysis(r) => r.validation_status,
            StageResult::UncertaintyBudget(r) => r.validation_status,
        }
    }

    /// JSON payload crossing the persistence boundary
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_payload(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_status_against_limit() {
        assert_eq!(ValidationStatus::against(1.0, 1.0), ValidationStatus::Passed);
        assert_eq!(ValidationStatus::against(1.01, 1.0), ValidationStatus::Failed);
        assert!(ValidationStatus::Failed.is_failed());
    }

    #[test]
    fn test_validation_status_parsing() {
        assert_eq!("PASSED".parse::<ValidationStatus>().unwrap(), ValidationStatus::Passed);
        assert_eq!("fail".parse::<ValidationStatus>().unwrap(), ValidationStatus::Failed);
        assert!("maybe".parse::<ValidationStatus>().is_err());
    }

    #[test]
    fn test_stage_display_and_parse() {
        assert_eq!(CalculationStage::Stage2.to_string(), "stage2");
        assert_eq!("3".parse::<CalculationStage>().unwrap(), CalculationStage::Stage3);
        assert_eq!(CalculationStage::from_number(1), Some(CalculationStage::Stage1));
        assert_eq!(CalculationStage::from_number(4), None);
    }

    #[test]
    fn test_stage_result_tagging() {
        let result = StageResult::Reproducibility(EffectResult {
            group_means: vec![("I".to_string(), 10.0), ("II".to_string(), 10.5)],
            error_nm: 0.5,
            max_group: "II".to_string(),
            min_group: "I".to_string(),
            tolerance_limit: 1.0,
            validation_status: ValidationStatus::Passed,
        });
        assert_eq!(result.stage(), CalculationStage::Stage1);
        assert_eq!(result.calculation_type(), "reproducibility");

        let payload = result.to_payload();
        assert_eq!(payload["calculation_type"], "reproducibility");
        assert_eq!(payload["validation_status"], "passed");
        assert_eq!(StageResult::from_payload(payload).unwrap(), result);
    }
}
