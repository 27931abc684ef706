//! Tolerance engine
//!
//! Runs five checks over a completed calculation and decides whether the job
//! needs deviation reports. A failing check is a business outcome, never an
//! error: the report says what failed and how badly, and
//! [`deviation_requests`] turns it into records for the store to number.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::config::EngineConfig;
use crate::core::identity::JobId;
use crate::core::stage1::Stage1Result;
use crate::core::stage2::ResolutionAnalysis;
use crate::core::stage3::Stage3Result;
use crate::entities::deviation::{DeviationRequest, DeviationType, Severity};
use crate::entities::job::CalibrationJob;
use crate::entities::standard::ReferenceStandard;

/// The five tolerance checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    EnvironmentalConditions,
    CalculationTolerances,
    UncertaintyLimits,
    MeasurementErrors,
    StandardsValidity,
}

impl CheckType {
    pub const ALL: [CheckType; 5] = [
        CheckType::EnvironmentalConditions,
        CheckType::CalculationTolerances,
        CheckType::UncertaintyLimits,
        CheckType::MeasurementErrors,
        CheckType::StandardsValidity,
    ];

    /// Human-readable check name
    pub fn label(&self) -> &'static str {
        match self {
            CheckType::EnvironmentalConditions => "Environmental Conditions",
            CheckType::CalculationTolerances => "Calculation Tolerances",
            CheckType::UncertaintyLimits => "Uncertainty Limits",
            CheckType::MeasurementErrors => "Measurement Errors",
            CheckType::StandardsValidity => "Standards Validity",
        }
    }

    /// Deviation type raised when this check fails
    pub fn deviation_type(&self) -> DeviationType {
        match self {
            CheckType::EnvironmentalConditions => DeviationType::Environmental,
            CheckType::CalculationTolerances | CheckType::UncertaintyLimits => {
                DeviationType::OutOfTolerance
            }
            CheckType::MeasurementErrors => DeviationType::MeasurementError,
            CheckType::StandardsValidity => DeviationType::StandardsExpired,
        }
    }

    /// Critical checks escalate measurement-error findings
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            CheckType::CalculationTolerances | CheckType::StandardsValidity
        )
    }

    fn impact(&self) -> &'static str {
        match self {
            CheckType::EnvironmentalConditions => {
                "Environmental conditions outside acceptable limits affect measurement validity and traceability"
            }
            CheckType::CalculationTolerances => {
                "Calculation results exceed tolerance limits affecting measurement accuracy"
            }
            CheckType::UncertaintyLimits => {
                "Measurement uncertainty exceeds acceptable limits affecting result reliability"
            }
            CheckType::MeasurementErrors => {
                "Systematic measurement errors detected affecting calibration accuracy"
            }
            CheckType::StandardsValidity => {
                "Reference standards expired or invalid affecting traceability"
            }
        }
    }

    fn pass_recommendation(&self) -> &'static str {
        match self {
            CheckType::EnvironmentalConditions => "Environmental conditions acceptable",
            CheckType::CalculationTolerances => "Calculation results within acceptable limits",
            CheckType::UncertaintyLimits => "Uncertainty within acceptable limits",
            CheckType::MeasurementErrors => "Measurement errors within acceptable range",
            CheckType::StandardsValidity => "All reference standards are valid",
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckType::EnvironmentalConditions => write!(f, "environmental_conditions"),
            CheckType::CalculationTolerances => write!(f, "calculation_tolerances"),
            CheckType::UncertaintyLimits => write!(f, "uncertainty_limits"),
            CheckType::MeasurementErrors => write!(f, "measurement_errors"),
            CheckType::StandardsValidity => write!(f, "standards_validity"),
        }
    }
}

impl std::str::FromStr for CheckType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "environmental_conditions" | "environmental" => Ok(CheckType::EnvironmentalConditions),
            "calculation_tolerances" | "calculation" => Ok(CheckType::CalculationTolerances),
            "uncertainty_limits" | "uncertainty" => Ok(CheckType::UncertaintyLimits),
            "measurement_errors" | "measurement" => Ok(CheckType::MeasurementErrors),
            "standards_validity" | "standards" => Ok(CheckType::StandardsValidity),
            _ => Err(format!(
                "Invalid check type: {}. Use environmental, calculation, uncertainty, measurement, or standards",
                s
            )),
        }
    }
}

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceCheckResult {
    pub check_type: CheckType,
    pub passed: bool,
    pub severity: Severity,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
    pub recommendation: String,
}

impl ToleranceCheckResult {
    fn pass(check_type: CheckType) -> Self {
        Self {
            check_type,
            passed: true,
            severity: Severity::Low,
            details: Vec::new(),
            measurements: BTreeMap::new(),
            recommendation: check_type.pass_recommendation().to_string(),
        }
    }

    fn fail(&mut self, severity: Severity, detail: String, recommendation: &str) {
        self.passed = false;
        self.severity = self.severity.max(severity);
        self.details.push(detail);
        self.recommendation = recommendation.to_string();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Pass,
    Fail,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverallStatus::Pass => write!(f, "PASS"),
            OverallStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,
    pub warning_checks: usize,
    pub pass_rate: f64,
}

/// Aggregated tolerance report for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobToleranceReport {
    pub job_id: JobId,
    pub checked_at: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub checks_performed: Vec<ToleranceCheckResult>,
    /// Deviation-triggering findings
    pub failures: Vec<ToleranceCheckResult>,
    /// Findings that are recorded but raise no deviation
    pub warnings: Vec<ToleranceCheckResult>,
    pub deviation_required: bool,
    /// Worst severity among failures (LOW when nothing failed)
    pub severity: Severity,
    pub summary: CheckSummary,
}

impl JobToleranceReport {
    pub fn check(&self, check_type: CheckType) -> Option<&ToleranceCheckResult> {
        self.checks_performed
            .iter()
            .find(|c| c.check_type == check_type)
    }
}

/// Everything the checks read
pub struct ToleranceInput<'a> {
    pub job: &'a CalibrationJob,
    pub stage1: &'a Stage1Result,
    pub stage2: &'a ResolutionAnalysis,
    pub stage3: &'a Stage3Result,
    pub standards: &'a [ReferenceStandard],
    /// Date standards validity is judged against
    pub check_date: NaiveDate,
}

/// Run all five checks and aggregate them
///
/// `config` must already carry the job's tolerance override.
pub fn check_job(input: &ToleranceInput<'_>, config: &EngineConfig) -> JobToleranceReport {
    let environmental = environmental_check(input.job, config);
    let calculation = calculation_check(input.stage1, config);
    let uncertainty = uncertainty_check(input.stage3, config);
    let mut measurement = measurement_error_check(input.stage2, config);
    let standards = standards_check(input.standards, input.check_date);

    let critical_failed = !calculation.passed || !standards.passed;
    let mut failures = Vec::new();
    let mut warnings = Vec::new();

    if !measurement.passed {
        if critical_failed {
            measurement.severity = Severity::High;
        } else {
            measurement.severity = Severity::Medium;
        }
    }

    let checks = vec![environmental, calculation, uncertainty, measurement, standards];
    for check in &checks {
        if check.passed {
            continue;
        }
        if check.check_type == CheckType::MeasurementErrors && !critical_failed {
            warnings.push(check.clone());
        } else {
            failures.push(check.clone());
        }
    }

    let total = checks.len();
    let failed = failures.len();
    let warned = warnings.len();
    let passed = total - failed - warned;
    let severity = failures
        .iter()
        .map(|c| c.severity)
        .max()
        .unwrap_or(Severity::Low);
    let overall_status = if failed > 0 {
        OverallStatus::Fail
    } else {
        OverallStatus::Pass
    };

    tracing::info!(
        job = %input.job.id,
        status = %overall_status,
        failed,
        warnings = warned,
        severity = %severity,
        "tolerance check complete"
    );

    JobToleranceReport {
        job_id: input.job.id.clone(),
        checked_at: Utc::now(),
        overall_status,
        checks_performed: checks,
        deviation_required: failed > 0,
        severity,
        summary: CheckSummary {
            total_checks: total,
            passed_checks: passed,
            failed_checks: failed,
            warning_checks: warned,
            pass_rate: passed as f64 * 100.0 / total as f64,
        },
        failures,
        warnings,
    }
}

const ENVIRONMENT_ACTION: &str = "Repeat calibration under proper environmental conditions";

/// Temperature and humidity before/after against the lab band
///
/// Readings that were not recorded are skipped.
pub fn environmental_check(job: &CalibrationJob, config: &EngineConfig) -> ToleranceCheckResult {
    let limits = &config.tolerance_config.environmental;
    let env = &job.environment;
    let mut result = ToleranceCheckResult::pass(CheckType::EnvironmentalConditions);

    let readings = [
        ("temp_before", "Temperature before", "°C", env.temp_before, limits.temperature_min, limits.temperature_max),
        ("temp_after", "Temperature after", "°C", env.temp_after, limits.temperature_min, limits.temperature_max),
        ("humidity_before", "Humidity before", "%", env.humidity_before_percent(), limits.humidity_min, limits.humidity_max),
        ("humidity_after", "Humidity after", "%", env.humidity_after_percent(), limits.humidity_min, limits.humidity_max),
    ];

    for (key, label, unit, value, min, max) in readings {
        let Some(value) = value else { continue };
        result.measurements.insert(key.to_string(), value);
        if value < min {
            result.fail(
                Severity::High,
                format!("{} ({}{}) below minimum limit ({}{})", label, value, unit, min, unit),
                ENVIRONMENT_ACTION,
            );
        } else if value > max {
            result.fail(
                Severity::High,
                format!("{} ({}{}) above maximum limit ({}{})", label, value, unit, max, unit),
                ENVIRONMENT_ACTION,
            );
        }
    }
    result
}

const CALCULATION_ACTION: &str = "Review measurement procedure and equipment stability";

/// Stage 1 metrics against the (possibly overridden) procedure limits
pub fn calculation_check(stage1: &Stage1Result, config: &EngineConfig) -> ToleranceCheckResult {
    let methods = &config.stage1_methods;
    let mut result = ToleranceCheckResult::pass(CheckType::CalculationTolerances);

    let deviation = stage1.repeatability.max_deviation_percent;
    let limit = methods.repeatability.max_deviation_percent;
    result
        .measurements
        .insert("repeatability_max_deviation_percent".to_string(), deviation);
    if deviation.abs() > limit {
        result.fail(
            Severity::High,
            format!("Repeatability deviation ({:.3}%) exceeds ±{}% limit", deviation, limit),
            CALCULATION_ACTION,
        );
    }

    let effects = [
        ("reproducibility", "Reproducibility", stage1.reproducibility.error_nm, methods.reproducibility.max_error_nm, Severity::High),
        ("output_drive", "Output drive", stage1.output_drive.error_nm, methods.output_drive.max_error_nm, Severity::Medium),
        ("interface", "Interface", stage1.interface.error_nm, methods.interface.max_error_nm, Severity::Medium),
        ("loading_point", "Loading point", stage1.loading_point.error_nm, methods.loading_point.max_error_nm, Severity::Medium),
    ];
    for (key, label, error, limit, severity) in effects {
        result.measurements.insert(format!("{}_error_nm", key), error);
        if error > limit {
            result.fail(
                severity,
                format!("{} error ({:.3} Nm) exceeds {} Nm limit", label, error, limit),
                CALCULATION_ACTION,
            );
        }
    }
    result
}

/// Per-point expanded and combined uncertainty against the ceilings
pub fn uncertainty_check(stage3: &Stage3Result, config: &EngineConfig) -> ToleranceCheckResult {
    let limits = &config.tolerance_config.uncertainty;
    let mut result = ToleranceCheckResult::pass(CheckType::UncertaintyLimits);

    for budget in &stage3.budgets {
        let expanded = budget.expanded_uncertainty_percent;
        let combined = budget.combined_uncertainty;
        result
            .measurements
            .insert(format!("expanded_uncertainty_{}", budget.set_torque), expanded);
        result
            .measurements
            .insert(format!("combined_uncertainty_{}", budget.set_torque), combined);

        if expanded > limits.max_expanded_percent {
            result.fail(
                Severity::High,
                format!(
                    "Expanded uncertainty ({:.3}%) exceeds {}% limit for {} Nm",
                    expanded, limits.max_expanded_percent, budget.set_torque
                ),
                "Review measurement procedure and uncertainty sources",
            );
        }
        if combined > limits.max_combined_percent {
            result.fail(
                Severity::Medium,
                format!(
                    "Combined uncertainty ({:.3}%) exceeds {}% limit for {} Nm",
                    combined, limits.max_combined_percent, budget.set_torque
                ),
                "Review measurement procedure and uncertainty sources",
            );
        }
    }
    result
}

/// Stage 2 average relative error per point against the limit
///
/// Severity is settled by [`check_job`] once the critical checks are known.
pub fn measurement_error_check(
    stage2: &ResolutionAnalysis,
    config: &EngineConfig,
) -> ToleranceCheckResult {
    let limit = config.tolerance_config.measurement_error.max_relative_error_percent;
    let mut result = ToleranceCheckResult::pass(CheckType::MeasurementErrors);

    for point in &stage2.points {
        let avg_error = point.average_relative_error.abs();
        result
            .measurements
            .insert(format!("average_error_{}", point.set_torque), avg_error);
        if avg_error > limit {
            result.fail(
                Severity::Medium,
                format!(
                    "Average measurement error ({:.3}%) exceeds {}% limit at {} Nm",
                    avg_error, limit, point.set_torque
                ),
                "Review calibration procedure and reference standards",
            );
        }
    }
    result
}

const STANDARDS_ACTION: &str = "Replace expired standards before proceeding";

/// Every standard used must be active and in date on `on`
pub fn standards_check(standards: &[ReferenceStandard], on: NaiveDate) -> ToleranceCheckResult {
    let mut result = ToleranceCheckResult::pass(CheckType::StandardsValidity);
    result
        .measurements
        .insert("standards_checked".to_string(), standards.len() as f64);

    for standard in standards {
        if standard.is_expired(on) {
            result.fail(
                Severity::High,
                format!("Standard '{}' expired on {}", standard.name, standard.valid_until),
                STANDARDS_ACTION,
            );
        }
        if !standard.is_active {
            result.fail(
                Severity::High,
                format!("Standard '{}' is marked as inactive", standard.name),
                STANDARDS_ACTION,
            );
        }
    }
    result
}

/// Deviation requests for a report: one per failure, plus a summary
/// record when two or more checks failed
pub fn deviation_requests(report: &JobToleranceReport) -> Vec<DeviationRequest> {
    let mut requests: Vec<DeviationRequest> =
        report.failures.iter().map(request_for_failure).collect();

    if report.failures.len() >= 2 {
        requests.push(summary_request(report));
    }
    requests
}

fn request_for_failure(failure: &ToleranceCheckResult) -> DeviationRequest {
    let severity = failure.severity;
    let details: Vec<String> = failure.details.iter().map(|d| format!("• {}", d)).collect();
    let measurements: Vec<String> = failure
        .measurements
        .iter()
        .map(|(k, v)| format!("• {}: {}", k, v))
        .collect();

    let description = format!(
        "AUTOMATED DEVIATION REPORT\n\nCheck Type: {}\nSeverity: {}\n\nDetails:\n{}\n\nMeasurements:\n{}\n\nRecommendation: {}",
        failure.check_type.label(),
        severity,
        details.join("\n"),
        measurements.join("\n"),
        failure.recommendation,
    );

    DeviationRequest {
        deviation_type: failure.check_type.deviation_type(),
        severity,
        check_type: Some(failure.check_type.to_string()),
        description,
        technical_impact: technical_impact(failure.check_type, severity),
        customer_impact: customer_impact(severity).to_string(),
        recommendations: vec![failure.recommendation.clone()],
        affected_measurements: failure.measurements.clone(),
    }
}

fn summary_request(report: &JobToleranceReport) -> DeviationRequest {
    let failed: Vec<String> = report
        .failures
        .iter()
        .map(|f| format!("• {}: {}", f.check_type.label(), f.details.join(", ")))
        .collect();
    let s = &report.summary;
    let description = format!(
        "COMPREHENSIVE CALIBRATION DEVIATION REPORT\n\nMultiple tolerance violations detected during calibration process.\n\nSummary:\n• Total Checks: {}\n• Failed Checks: {}\n• Warning Checks: {}\n• Pass Rate: {:.1}%\n\nFailed Checks:\n{}\n\nOverall Assessment: REQUIRES CUSTOMER APPROVAL for certificate issuance.",
        s.total_checks,
        s.failed_checks,
        s.warning_checks,
        s.pass_rate,
        failed.join("\n"),
    );

    DeviationRequest {
        deviation_type: DeviationType::OutOfTolerance,
        severity: report.severity,
        check_type: None,
        description,
        technical_impact: "Multiple calibration parameters outside acceptable limits".to_string(),
        customer_impact: "Certificate may require special conditions or re-calibration".to_string(),
        recommendations: vec![
            "Review all failed tolerance checks".to_string(),
            "Consider re-calibration".to_string(),
            "Consult with customer".to_string(),
        ],
        affected_measurements: BTreeMap::from([(
            "multiple_failures".to_string(),
            report.failures.len() as f64,
        )]),
    }
}

fn technical_impact(check_type: CheckType, severity: Severity) -> String {
    let base = check_type.impact();
    match severity {
        Severity::High => format!("CRITICAL: {}. Immediate corrective action required.", base),
        Severity::Medium => format!("MODERATE: {}. Review and corrective action recommended.", base),
        Severity::Low => format!("MINOR: {}. Monitoring and documentation required.", base),
    }
}

fn customer_impact(severity: Severity) -> &'static str {
    match severity {
        Severity::High => {
            "Certificate may require conditional acceptance, re-calibration, or special customer approval"
        }
        Severity::Medium => "Certificate can be issued with noted limitations and customer notification",
        Severity::Low => "Minimal customer impact - certificate can be issued with documentation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage1::{EffectResult, LoadingPointResult, RepeatabilityResult};
    use crate::core::stage2::PointErrorAnalysis;
    use crate::core::stage3::{BudgetSummary, UncertaintyBudgetResult, UncertaintyComponents};
    use crate::entities::results::ValidationStatus;

    fn effect(error_nm: f64) -> EffectResult {
        EffectResult {
            group_means: Vec::new(),
            error_nm,
            max_group: "I".to_string(),
            min_group: "II".to_string(),
            tolerance_limit: 1.0,
            validation_status: ValidationStatus::against(error_nm, 1.0),
        }
    }

    fn stage1(max_deviation: f64, reproducibility: f64) -> Stage1Result {
        Stage1Result {
            repeatability: RepeatabilityResult {
                points: Vec::new(),
                overall_deviation: max_deviation,
                max_deviation_percent: max_deviation,
                max_deviation_point: Some(1349.0),
                tolerance_limit: 4.0,
                validation_status: ValidationStatus::against(max_deviation.abs(), 4.0),
            },
            reproducibility: effect(reproducibility),
            output_drive: effect(0.5),
            interface: effect(0.5),
            loading_point: LoadingPointResult {
                mean_minus_10mm: 1000.0,
                mean_plus_10mm: 1000.5,
                readings_per_position: 5,
                error_nm: 0.5,
                tolerance_limit: 2.0,
                validation_status: ValidationStatus::Passed,
            },
        }
    }

    fn stage2(avg_error: f64) -> ResolutionAnalysis {
        ResolutionAnalysis {
            points: vec![PointErrorAnalysis {
                set_torque: 1349.0,
                readings: vec![1349.0; 5],
                measurement_errors: vec![0.0; 5],
                relative_errors_percent: vec![avg_error; 5],
                deviations_from_corrected_mean: vec![0.0; 5],
                mean_xr: 1349.0,
                corrected_standard: 0.0,
                corrected_mean: 1349.0,
                average_relative_error: avg_error,
                repeatability_variation: 0.0,
            }],
            total_repeatability_variation: 0.0,
            average_repeatability_variation: 0.0,
            validation_status: ValidationStatus::Passed,
        }
    }

    fn stage3(expanded: f64) -> Stage3Result {
        let budget = UncertaintyBudgetResult {
            set_torque: 1349.0,
            mean_xr: 1349.0,
            corrected_mean: 1349.0,
            components: UncertaintyComponents::default(),
            combined_uncertainty: expanded / 2.0,
            coverage_factor: 2.0,
            expanded_uncertainty_percent: expanded,
            expanded_uncertainty_absolute: expanded * 13.49,
            cmc_percent: 0.58,
            cmc_absolute: 7.8242,
            cmc_of_reading: expanded,
            max_cmc_of_reading: expanded.max(0.58),
            mean_measurement_error_percent: 0.0,
            max_device_error_percent: 0.15,
            tolerance_limit: 3.0,
            validation_status: ValidationStatus::against(expanded, 3.0),
        };
        Stage3Result {
            summary: BudgetSummary {
                total_points: 1,
                max_expanded_uncertainty: expanded,
                min_expanded_uncertainty: expanded,
                average_expanded_uncertainty: expanded,
                within_typical_limits: expanded < 3.0,
            },
            budgets: vec![budget],
        }
    }

    fn job() -> CalibrationJob {
        let mut job = CalibrationJob::new("JOB-1".parse().unwrap());
        job.environment.temp_before = Some(22.0);
        job.environment.temp_after = Some(22.5);
        job.environment.humidity_before = Some(55.0);
        job.environment.humidity_after = Some(56.0);
        job
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn run(
        job: &CalibrationJob,
        s1: &Stage1Result,
        s2: &ResolutionAnalysis,
        s3: &Stage3Result,
        standards: &[ReferenceStandard],
    ) -> JobToleranceReport {
        let input = ToleranceInput {
            job,
            stage1: s1,
            stage2: s2,
            stage3: s3,
            standards,
            check_date: today(),
        };
        check_job(&input, &EngineConfig::default())
    }

    #[test]
    fn test_all_checks_pass() {
        let report = run(&job(), &stage1(0.5, 0.2), &stage2(0.1), &stage3(1.0), &[]);
        assert_eq!(report.overall_status, OverallStatus::Pass);
        assert!(!report.deviation_required);
        assert_eq!(report.summary.passed_checks, 5);
        assert!((report.summary.pass_rate - 100.0).abs() < 1e-10);
        assert!(deviation_requests(&report).is_empty());
    }

    #[test]
    fn test_hot_lab_is_high_environmental_failure() {
        let mut job = job();
        job.environment.temp_before = Some(32.0);
        let report = run(&job, &stage1(0.5, 0.2), &stage2(0.1), &stage3(1.0), &[]);

        assert!(report.deviation_required);
        assert_eq!(report.severity, Severity::High);
        let env = report.check(CheckType::EnvironmentalConditions).unwrap();
        assert!(!env.passed);
        assert_eq!(env.details[0], "Temperature before (32°C) above maximum limit (30°C)");

        let requests = deviation_requests(&report);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].deviation_type, DeviationType::Environmental);
        assert!(requests[0].technical_impact.starts_with("CRITICAL: "));
    }

    #[test]
    fn test_humidity_fraction_checked_as_percent() {
        let mut job = job();
        job.environment.humidity_before = Some(0.40);
        let report = run(&job, &stage1(0.5, 0.2), &stage2(0.1), &stage3(1.0), &[]);
        let env = report.check(CheckType::EnvironmentalConditions).unwrap();
        assert!(!env.passed);
        assert_eq!(env.measurements["humidity_before"], 40.0);
    }

    #[test]
    fn test_calculation_severity() {
        let report = run(&job(), &stage1(-9.3, 0.2), &stage2(0.1), &stage3(1.0), &[]);
        let calc = report.check(CheckType::CalculationTolerances).unwrap();
        assert!(!calc.passed);
        assert_eq!(calc.severity, Severity::High);

        let mut s1 = stage1(0.5, 0.2);
        s1.output_drive = effect(4.5);
        let report = run(&job(), &s1, &stage2(0.1), &stage3(1.0), &[]);
        let calc = report.check(CheckType::CalculationTolerances).unwrap();
        assert_eq!(calc.severity, Severity::Medium);
    }

    #[test]
    fn test_uncertainty_ceilings() {
        let report = run(&job(), &stage1(0.5, 0.2), &stage2(0.1), &stage3(6.2), &[]);
        let unc = report.check(CheckType::UncertaintyLimits).unwrap();
        assert_eq!(unc.severity, Severity::High);
        assert_eq!(unc.details.len(), 2);

        // Combined 1.6 % passes, expanded 3.2 % passes the 5 % ceiling
        let report = run(&job(), &stage1(0.5, 0.2), &stage2(0.1), &stage3(3.2), &[]);
        assert!(report.check(CheckType::UncertaintyLimits).unwrap().passed);
    }

    #[test]
    fn test_measurement_error_alone_is_a_warning() {
        let report = run(&job(), &stage1(0.5, 0.2), &stage2(25.0), &stage3(1.0), &[]);
        assert_eq!(report.overall_status, OverallStatus::Pass);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].severity, Severity::Medium);
        assert!(report.failures.is_empty());
        assert_eq!(report.summary.warning_checks, 1);
    }

    #[test]
    fn test_measurement_error_escalates_with_critical_failure() {
        let report = run(&job(), &stage1(-9.3, 0.2), &stage2(25.0), &stage3(1.0), &[]);
        assert_eq!(report.failures.len(), 2);
        let meas = report
            .failures
            .iter()
            .find(|f| f.check_type == CheckType::MeasurementErrors)
            .unwrap();
        assert_eq!(meas.severity, Severity::High);

        let requests = deviation_requests(&report);
        assert_eq!(requests.len(), 3);
        let summary = requests.last().unwrap();
        assert!(summary.check_type.is_none());
        assert_eq!(summary.severity, Severity::High);
        assert_eq!(summary.affected_measurements["multiple_failures"], 2.0);
        assert_eq!(summary.recommendations.len(), 3);
    }

    #[test]
    fn test_expired_and_inactive_standards() {
        let expired = ReferenceStandard::new(
            "STD-1",
            "Master transducer",
            NaiveDate::from_ymd_opt(2025, 5, 31).unwrap(),
        );
        let mut inactive = ReferenceStandard::new(
            "STD-2",
            "Gauge",
            NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
        );
        inactive.is_active = false;

        let report = run(
            &job(),
            &stage1(0.5, 0.2),
            &stage2(0.1),
            &stage3(1.0),
            &[expired, inactive],
        );
        let std = report.check(CheckType::StandardsValidity).unwrap();
        assert!(!std.passed);
        assert_eq!(std.severity, Severity::High);
        assert_eq!(std.details.len(), 2);
        assert_eq!(std.details[0], "Standard 'Master transducer' expired on 2025-05-31");
        assert!(report.deviation_required);
    }

    #[test]
    fn test_override_relaxes_limit() {
        let mut job = job();
        job.tolerance_limits.max_deviation_percent = Some(10.0);
        let config = EngineConfig::default().with_override(&job.tolerance_limits);
        let s1 = stage1(-9.3, 0.2);
        let calc = calculation_check(&s1, &config);
        assert!(calc.passed);
    }

    #[test]
    fn test_description_layout() {
        let mut job = job();
        job.environment.temp_after = Some(18.0);
        let report = run(&job, &stage1(0.5, 0.2), &stage2(0.1), &stage3(1.0), &[]);
        let request = &deviation_requests(&report)[0];
        assert!(request
            .description
            .starts_with("AUTOMATED DEVIATION REPORT\n\nCheck Type: Environmental Conditions\nSeverity: HIGH"));
        assert!(request
            .description
            .contains("• Temperature after (18°C) below minimum limit (20°C)"));
        assert!(request
            .description
            .ends_with("Recommendation: Repeat calibration under proper environmental conditions"));
    }
}
