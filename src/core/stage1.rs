//! Stage 1: raw data reduction
//!
//! Five independent reductions of the bench readings: repeatability,
//! reproducibility, output-drive effect, interface effect and loading-point
//! effect. Each validates its reading counts before computing anything.

use serde::{Deserialize, Serialize};

use crate::core::config::{EffectMethod, LoadingPointMethod, RepeatabilityMethod, Stage1Methods};
use crate::core::lookup::{LookupCategory, LookupStore};
use crate::core::measurement::{
    check_keyed, check_readings, mean, population_std_dev, InputError, LoadingPointData,
    MeasurementData, PositionData, ReproducibilityData, LOADING_OFFSETS, POSITIONS,
    POSITION_READINGS, REPEATABILITY_READINGS, SEQUENCES, SEQUENCE_READINGS,
};
use crate::entities::results::{StageResult, ValidationStatus};

/// One repeatability calibration point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatabilityPointResult {
    pub set_torque: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    pub readings: Vec<f64>,
    /// Mean of the readings (Xr)
    pub mean_xr: f64,
    /// Transducer error interpolated at the mean
    pub corrected_standard: f64,
    pub corrected_mean: f64,
    pub deviation_percent: f64,
    /// Population standard deviation of the readings
    pub standard_deviation: f64,
    /// Each reading minus the mean
    pub reading_deviations: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatabilityResult {
    pub points: Vec<RepeatabilityPointResult>,
    /// Mean of the per-point deviations
    pub overall_deviation: f64,
    /// Signed deviation with the largest magnitude
    pub max_deviation_percent: f64,
    /// Set torque of the point holding the largest deviation
    pub max_deviation_point: Option<f64>,
    pub tolerance_limit: f64,
    pub validation_status: ValidationStatus,
}

/// Max-minus-min effect over named reading groups
///
/// Shared by reproducibility (sequences I..IV), output drive and interface
/// (positions 0°..270°).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectResult {
    /// Group means in sheet order
    pub group_means: Vec<(String, f64)>,
    pub error_nm: f64,
    pub max_group: String,
    pub min_group: String,
    pub tolerance_limit: f64,
    pub validation_status: ValidationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingPointResult {
    pub mean_minus_10mm: f64,
    pub mean_plus_10mm: f64,
    pub readings_per_position: usize,
    pub error_nm: f64,
    pub tolerance_limit: f64,
    pub validation_status: ValidationStatus,
}

/// All Stage 1 results for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Result {
    pub repeatability: RepeatabilityResult,
    pub reproducibility: EffectResult,
    pub output_drive: EffectResult,
    pub interface: EffectResult,
    pub loading_point: LoadingPointResult,
}

impl Stage1Result {
    /// The five results as tagged stage results, in sheet order
    pub fn stage_results(&self) -> Vec<StageResult> {
        vec![
            StageResult::Repeatability(self.repeatability.clone()),
            StageResult::Reproducibility(self.reproducibility.clone()),
            StageResult::OutputDrive(self.output_drive.clone()),
            StageResult::Interface(self.interface.clone()),
            StageResult::LoadingPoint(self.loading_point.clone()),
        ]
    }

    /// Names of the components that failed their limit
    pub fn failed_components(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if self.repeatability.validation_status.is_failed() {
            failed.push("repeatability");
        }
        if self.reproducibility.validation_status.is_failed() {
            failed.push("reproducibility");
        }
        if self.output_drive.validation_status.is_failed() {
            failed.push("output_drive");
        }
        if self.interface.validation_status.is_failed() {
            failed.push("interface");
        }
        if self.loading_point.validation_status.is_failed() {
            failed.push("loading_point");
        }
        failed
    }
}

/// Run every Stage 1 reduction
pub fn run(
    data: &MeasurementData,
    methods: &Stage1Methods,
    lookups: &mut LookupStore<'_>,
) -> Result<Stage1Result, InputError> {
    let result = Stage1Result {
        repeatability: repeatability(data, &methods.repeatability, lookups)?,
        reproducibility: reproducibility(data.reproducibility()?, &methods.reproducibility)?,
        output_drive: position_effect("output_drive", data.output_drive()?, &methods.output_drive)?,
        interface: position_effect("interface", data.interface()?, &methods.interface)?,
        loading_point: loading_point(data.loading_point()?, &methods.loading_point)?,
    };

    tracing::info!(
        stage = 1,
        points = result.repeatability.points.len(),
        max_deviation = result.repeatability.max_deviation_percent,
        reproducibility_nm = result.reproducibility.error_nm,
        output_drive_nm = result.output_drive.error_nm,
        interface_nm = result.interface.error_nm,
        loading_point_nm = result.loading_point.error_nm,
        "stage 1 complete"
    );
    Ok(result)
}

/// Repeatability: corrected mean and deviation per calibration point
pub fn repeatability(
    data: &MeasurementData,
    method: &RepeatabilityMethod,
    lookups: &mut LookupStore<'_>,
) -> Result<RepeatabilityResult, InputError> {
    if data.repeatability_points.is_empty() {
        return Err(InputError::MissingSection {
            component: "repeatability_points".to_string(),
        });
    }

    let mut points = Vec::with_capacity(data.repeatability_points.len());
    let mut max_deviation_percent = 0.0_f64;
    let mut max_deviation_point = None;

    for point in &data.repeatability_points {
        let component = format!("repeatability point {}", point.set_torque);
        if point.set_torque <= 0.0 || !point.set_torque.is_finite() {
            return Err(InputError::NonPositiveSetTorque {
                component,
                value: point.set_torque,
            });
        }
        check_readings(&component, &point.readings, REPEATABILITY_READINGS)?;

        let mean_xr = mean(&point.readings);
        let corrected_standard = lookups.value(LookupCategory::TorqueError, mean_xr);
        let corrected_mean = mean_xr - corrected_standard;
        let deviation_percent = (corrected_mean - point.set_torque) * 100.0 / point.set_torque;

        if deviation_percent.abs() > max_deviation_percent.abs() {
            max_deviation_percent = deviation_percent;
            max_deviation_point = Some(point.set_torque);
        }

        tracing::debug!(
            component = "repeatability",
            set_torque = point.set_torque,
            mean_xr,
            corrected_standard,
            deviation_percent,
            "repeatability point"
        );

        points.push(RepeatabilityPointResult {
            set_torque: point.set_torque,
            pressure: point.pressure,
            readings: point.readings.clone(),
            mean_xr,
            corrected_standard,
            corrected_mean,
            deviation_percent,
            standard_deviation: population_std_dev(&point.readings),
            reading_deviations: point.readings.iter().map(|r| r - mean_xr).collect(),
        });
    }

    let overall_deviation =
        points.iter().map(|p| p.deviation_percent).sum::<f64>() / points.len() as f64;

    Ok(RepeatabilityResult {
        points,
        overall_deviation,
        max_deviation_percent,
        max_deviation_point,
        tolerance_limit: method.max_deviation_percent,
        validation_status: ValidationStatus::against(
            max_deviation_percent.abs(),
            method.max_deviation_percent,
        ),
    })
}

/// Reproducibility: spread of the four sequence means
pub fn reproducibility(
    data: &ReproducibilityData,
    method: &EffectMethod,
) -> Result<EffectResult, InputError> {
    let groups = check_keyed("reproducibility", &data.sequences, &SEQUENCES, SEQUENCE_READINGS)?;
    Ok(spread(&groups, method.max_error_nm))
}

/// Output-drive or interface effect: spread of the four position means
pub fn position_effect(
    component: &str,
    data: &PositionData,
    method: &EffectMethod,
) -> Result<EffectResult, InputError> {
    let groups = check_keyed(component, &data.positions, &POSITIONS, POSITION_READINGS)?;
    Ok(spread(&groups, method.max_error_nm))
}

/// Loading-point effect: |mean(-10mm) - mean(+10mm)|
pub fn loading_point(
    data: &LoadingPointData,
    method: &LoadingPointMethod,
) -> Result<LoadingPointResult, InputError> {
    let n = method.readings_per_position;
    check_readings(&format!("loading_point {}", LOADING_OFFSETS[0]), &data.minus_10mm, n)?;
    check_readings(&format!("loading_point {}", LOADING_OFFSETS[1]), &data.plus_10mm, n)?;

    let mean_minus_10mm = mean(&data.minus_10mm);
    let mean_plus_10mm = mean(&data.plus_10mm);
    let error_nm = (mean_minus_10mm - mean_plus_10mm).abs();

    Ok(LoadingPointResult {
        mean_minus_10mm,
        mean_plus_10mm,
        readings_per_position: n,
        error_nm,
        tolerance_limit: method.max_error_nm,
        validation_status: ValidationStatus::against(error_nm, method.max_error_nm),
    })
}

fn spread(groups: &[(&str, &[f64])], limit: f64) -> EffectResult {
    let group_means: Vec<(String, f64)> = groups
        .iter()
        .map(|(name, readings)| (name.to_string(), mean(readings)))
        .collect();

    // First group wins ties, matching sheet order
    let mut max = &group_means[0];
    let mut min = &group_means[0];
    for g in &group_means[1..] {
        if g.1 > max.1 {
            max = g;
        }
        if g.1 < min.1 {
            min = g;
        }
    }

    let error_nm = max.1 - min.1;
    EffectResult {
        max_group: max.0.clone(),
        min_group: min.0.clone(),
        error_nm,
        tolerance_limit: limit,
        validation_status: ValidationStatus::against(error_nm, limit),
        group_means,
    }
}
