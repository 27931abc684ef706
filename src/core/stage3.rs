//! Stage 3: uncertainty budget
//!
//! Nine relative (%) components per calibration point, each with its
//! distribution already folded into the divisor:
//!
//! | symbol | component                 | formula                                       |
//! |--------|---------------------------|-----------------------------------------------|
//! | δS     | pressure gauge            | (cert / 2) · (Tmax / Pmax) / set              |
//! | δP     | input pressure resolution | (res_p / (10·√3)) · (Tmax / Pmax) · (100/set) |
//! | Wmd    | standard                  | master uncertainty at mean / 2                |
//! | Wr     | device resolution         | (res_d · 0.5 / √3) · (100 / X̄)               |
//! | Wrep   | reproducibility           | b_rep · 0.5 / √3 · (100 / X̄)                 |
//! | Wod    | output drive              | b_od · 0.5 / √3 · (100 / X̄)                  |
//! | Wint   | interface                 | b_int · 0.5 / √3 · (100 / X̄)                 |
//! | Wl     | loading point             | b_l · 0.5 / √3 · (100 / X̄)                   |
//! | brep   | repeatability (Type A)    | b_re / √5 · (100 / X̄)                        |
//!
//! X̄ is the Stage 1 corrected mean. The combination double-weights the
//! device-resolution term as the governing procedure requires:
//!
//! `w = √(brep² + 2·Wr² + Wod² + δS² + δP² + Wint² + Wrep² + Wmd² + Wl²)`

use serde::{Deserialize, Serialize};

use crate::core::config::Stage3Methods;
use crate::core::lookup::{LookupCategory, LookupStore};
use crate::core::measurement::{mean, InputError, REPEATABILITY_READINGS};
use crate::core::stage1::Stage1Result;
use crate::core::stage2::ResolutionAnalysis;
use crate::entities::results::{StageResult, ValidationStatus};

/// Coverage factor for ~95 % confidence; fixed by the procedure
pub const COVERAGE_FACTOR: f64 = 2.0;

/// The nine budget components, all in percent
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UncertaintyComponents {
    pub pressure_gauge: f64,
    pub input_pressure_resolution: f64,
    pub standard: f64,
    pub device_resolution: f64,
    pub reproducibility: f64,
    pub output_drive: f64,
    pub interface: f64,
    pub loading_point: f64,
    pub repeatability: f64,
}

impl UncertaintyComponents {
    /// Root-sum-of-squares with the doubled device-resolution term
    pub fn combined(&self) -> f64 {
        (self.repeatability.powi(2)
            + 2.0 * self.device_resolution.powi(2)
            + self.output_drive.powi(2)
            + self.pressure_gauge.powi(2)
            + self.input_pressure_resolution.powi(2)
            + self.interface.powi(2)
            + self.reproducibility.powi(2)
            + self.standard.powi(2)
            + self.loading_point.powi(2))
        .sqrt()
    }

    /// Components paired with their names, in budget-sheet order
    pub fn named(&self) -> [(&'static str, f64); 9] {
        [
            ("pressure_gauge", self.pressure_gauge),
            ("input_pressure_resolution", self.input_pressure_resolution),
            ("standard", self.standard),
            ("device_resolution", self.device_resolution),
            ("reproducibility", self.reproducibility),
            ("output_drive", self.output_drive),
            ("interface", self.interface),
            ("loading_point", self.loading_point),
            ("repeatability", self.repeatability),
        ]
    }
}

/// Uncertainty budget for one calibration point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyBudgetResult {
    pub set_torque: f64,
    pub mean_xr: f64,
    pub corrected_mean: f64,
    pub components: UncertaintyComponents,
    pub combined_uncertainty: f64,
    pub coverage_factor: f64,
    pub expanded_uncertainty_percent: f64,
    pub expanded_uncertainty_absolute: f64,
    pub cmc_percent: f64,
    pub cmc_absolute: f64,
    pub cmc_of_reading: f64,
    pub max_cmc_of_reading: f64,
    /// |average relative error| from Stage 2
    pub mean_measurement_error_percent: f64,
    pub max_device_error_percent: f64,
    /// Expanded uncertainty ceiling the point was compared with
    pub tolerance_limit: f64,
    pub validation_status: ValidationStatus,
}

/// Summary over all budget points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub total_points: usize,
    pub max_expanded_uncertainty: f64,
    pub min_expanded_uncertainty: f64,
    pub average_expanded_uncertainty: f64,
    pub within_typical_limits: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage3Result {
    pub budgets: Vec<UncertaintyBudgetResult>,
    pub summary: BudgetSummary,
}

impl Stage3Result {
    pub fn stage_results(&self) -> Vec<StageResult> {
        self.budgets
            .iter()
            .cloned()
            .map(StageResult::UncertaintyBudget)
            .collect()
    }
}

/// Build the budget for every calibration point
pub fn run(
    stage1: &Stage1Result,
    stage2: &ResolutionAnalysis,
    methods: &Stage3Methods,
    lookups: &mut LookupStore<'_>,
) -> Result<Stage3Result, InputError> {
    let points = &stage1.repeatability.points;
    if stage2.points.len() != points.len() {
        return Err(InputError::MissingStageResult {
            component: format!(
                "uncertainty budget ({} points, {} analysed)",
                points.len(),
                stage2.points.len()
            ),
            stage: "resolution analysis".to_string(),
        });
    }
    let mut budgets = Vec::with_capacity(points.len());

    // Point i of the analysis belongs to repeatability point i
    for (point, analysis) in points.iter().zip(&stage2.points) {
        if point.corrected_mean == 0.0 {
            return Err(InputError::ZeroReading {
                component: format!("uncertainty budget point {}", point.set_torque),
                index: 0,
            });
        }

        let effects = Effects {
            reproducibility: stage1.reproducibility.error_nm,
            output_drive: stage1.output_drive.error_nm,
            interface: stage1.interface.error_nm,
            loading_point: stage1.loading_point.error_nm,
            repeatability_variation: analysis.repeatability_variation,
        };
        let master = lookups.value(LookupCategory::MasterStandardUncertainty, point.mean_xr);
        let components = components(methods, point.set_torque, point.corrected_mean, master, &effects);

        let budget = budget_point(
            methods,
            point.set_torque,
            point.mean_xr,
            point.corrected_mean,
            components,
            analysis.average_relative_error.abs(),
            lookups,
        );

        tracing::debug!(
            stage = 3,
            set_torque = budget.set_torque,
            combined = budget.combined_uncertainty,
            expanded = budget.expanded_uncertainty_percent,
            "budget point"
        );
        budgets.push(budget);
    }

    let summary = summarize(&budgets, methods.typical_limit_percent);
    tracing::info!(
        stage = 3,
        points = summary.total_points,
        max_expanded = summary.max_expanded_uncertainty,
        "stage 3 complete"
    );
    Ok(Stage3Result { budgets, summary })
}

/// Stage 1/2 effects feeding the budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Effects {
    pub reproducibility: f64,
    pub output_drive: f64,
    pub interface: f64,
    pub loading_point: f64,
    pub repeatability_variation: f64,
}

/// Compute the nine components for one point
pub fn components(
    methods: &Stage3Methods,
    set_torque: f64,
    corrected_mean: f64,
    master_uncertainty: f64,
    effects: &Effects,
) -> UncertaintyComponents {
    let sqrt3 = 3.0_f64.sqrt();
    let ratio = methods.max_torque_nm / methods.max_pressure_bar;
    let per_mean = 100.0 / corrected_mean;
    let rectangular = |error: f64| error * 0.5 / sqrt3 * per_mean;

    UncertaintyComponents {
        pressure_gauge: (methods.certificate_uncertainty_percent / 2.0) * ratio / set_torque,
        input_pressure_resolution: (methods.pressure_resolution / (10.0 * sqrt3))
            * ratio
            * (100.0 / set_torque),
        standard: master_uncertainty / 2.0,
        device_resolution: (methods.device_resolution * 0.5 / sqrt3) * per_mean,
        reproducibility: rectangular(effects.reproducibility),
        output_drive: rectangular(effects.output_drive),
        interface: rectangular(effects.interface),
        loading_point: rectangular(effects.loading_point),
        repeatability: effects.repeatability_variation
            / (REPEATABILITY_READINGS as f64).sqrt()
            * per_mean,
    }
}

fn budget_point(
    methods: &Stage3Methods,
    set_torque: f64,
    mean_xr: f64,
    corrected_mean: f64,
    components: UncertaintyComponents,
    mean_measurement_error_percent: f64,
    lookups: &mut LookupStore<'_>,
) -> UncertaintyBudgetResult {
    let combined_uncertainty = components.combined();
    let expanded_uncertainty_percent = combined_uncertainty * COVERAGE_FACTOR;
    let expanded_uncertainty_absolute = expanded_uncertainty_percent * set_torque / 100.0;

    let cmc_percent = lookups.value(LookupCategory::CmcBand, set_torque);
    let max_device_error_percent = lookups.value(LookupCategory::DeviceErrorBand, set_torque);

    UncertaintyBudgetResult {
        set_torque,
        mean_xr,
        corrected_mean,
        components,
        combined_uncertainty,
        coverage_factor: COVERAGE_FACTOR,
        expanded_uncertainty_percent,
        expanded_uncertainty_absolute,
        cmc_percent,
        cmc_absolute: cmc_percent / 100.0 * set_torque,
        cmc_of_reading: expanded_uncertainty_absolute / set_torque * 100.0,
        max_cmc_of_reading: expanded_uncertainty_percent.max(cmc_percent),
        mean_measurement_error_percent,
        max_device_error_percent,
        tolerance_limit: methods.typical_limit_percent,
        validation_status: ValidationStatus::against(
            expanded_uncertainty_percent,
            methods.typical_limit_percent,
        ),
    }
}

/// Max/min/average expanded uncertainty over the budget
pub fn summarize(budgets: &[UncertaintyBudgetResult], typical_limit: f64) -> BudgetSummary {
    let expanded: Vec<f64> = budgets.iter().map(|b| b.expanded_uncertainty_percent).collect();
    BudgetSummary {
        total_points: budgets.len(),
        max_expanded_uncertainty: expanded.iter().copied().fold(0.0, f64::max),
        min_expanded_uncertainty: expanded
            .iter()
            .copied()
            .reduce(f64::min)
            .unwrap_or(0.0),
        average_expanded_uncertainty: mean(&expanded),
        within_typical_limits: expanded.iter().all(|u| *u < typical_limit),
    }
}
