//! Stage 2: resolution and error analysis
//!
//! Per calibration point and per reading:
//! - measurement error = set torque - reading
//! - relative error % = measurement error * 100 / reading
//! - deviation = reading - corrected mean (from Stage 1)
//!
//! The repeatability variation is the sample standard deviation (n - 1) of
//! the deviations and feeds the Type A term of the uncertainty budget.

use serde::{Deserialize, Serialize};

use crate::core::config::Stage2Methods;
use crate::core::measurement::{mean, sample_std_dev, InputError};
use crate::core::stage1::{RepeatabilityPointResult, Stage1Result};
use crate::entities::results::ValidationStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointErrorAnalysis {
    /// Target value (Xa)
    pub set_torque: f64,
    pub readings: Vec<f64>,
    pub measurement_errors: Vec<f64>,
    pub relative_errors_percent: Vec<f64>,
    pub deviations_from_corrected_mean: Vec<f64>,
    pub mean_xr: f64,
    pub corrected_standard: f64,
    pub corrected_mean: f64,
    pub average_relative_error: f64,
    pub repeatability_variation: f64,
}

/// Stage 2 result for all calibration points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAnalysis {
    pub points: Vec<PointErrorAnalysis>,
    pub total_repeatability_variation: f64,
    pub average_repeatability_variation: f64,
    /// Stage 2 computes evidence only; limits are applied by the tolerance engine
    pub validation_status: ValidationStatus,
}

impl ResolutionAnalysis {
    /// Mean of the per-point average relative errors
    pub fn mean_relative_error(&self) -> f64 {
        let values: Vec<f64> = self.points.iter().map(|p| p.average_relative_error).collect();
        mean(&values)
    }

    /// Largest |average relative error| over all points
    pub fn max_abs_relative_error(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.average_relative_error.abs())
            .fold(0.0, f64::max)
    }
}

/// Run the error analysis over Stage 1 repeatability points
pub fn run(stage1: &Stage1Result, methods: &Stage2Methods) -> Result<ResolutionAnalysis, InputError> {
    let source = &stage1.repeatability.points;
    if source.is_empty() {
        return Err(InputError::MissingStageResult {
            component: "resolution analysis".to_string(),
            stage: "repeatability".to_string(),
        });
    }

    let points = source
        .iter()
        .map(|p| analyse_point(p, methods))
        .collect::<Result<Vec<_>, _>>()?;

    let total_repeatability_variation: f64 = points.iter().map(|p| p.repeatability_variation).sum();
    let average_repeatability_variation = total_repeatability_variation / points.len() as f64;

    tracing::info!(
        stage = 2,
        points = points.len(),
        total_variation = total_repeatability_variation,
        "stage 2 complete"
    );

    Ok(ResolutionAnalysis {
        points,
        total_repeatability_variation,
        average_repeatability_variation,
        validation_status: ValidationStatus::Passed,
    })
}

/// Analyse a single repeatability point
pub fn analyse_point(
    point: &RepeatabilityPointResult,
    methods: &Stage2Methods,
) -> Result<PointErrorAnalysis, InputError> {
    let target = point.set_torque;

    if let Some(index) = point.readings.iter().position(|r| *r == 0.0) {
        return Err(InputError::ZeroReading {
            component: format!("resolution analysis point {}", target),
            index,
        });
    }

    let measurement_errors: Vec<f64> = point.readings.iter().map(|r| target - r).collect();
    let relative_errors_percent: Vec<f64> = point
        .readings
        .iter()
        .zip(&measurement_errors)
        .map(|(reading, error)| error * 100.0 / reading)
        .collect();
    let deviations_from_corrected_mean: Vec<f64> = point
        .readings
        .iter()
        .map(|r| r - point.corrected_mean)
        .collect();

    let repeatability_variation = if methods.type_a_analysis {
        sample_std_dev(&deviations_from_corrected_mean)
    } else {
        0.0
    };

    Ok(PointErrorAnalysis {
        set_torque: target,
        readings: point.readings.clone(),
        average_relative_error: mean(&relative_errors_percent),
        measurement_errors,
        relative_errors_percent,
        deviations_from_corrected_mean,
        mean_xr: point.mean_xr,
        corrected_standard: point.corrected_standard,
        corrected_mean: point.corrected_mean,
        repeatability_variation,
    })
}
