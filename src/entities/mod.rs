//! Entity type definitions
//!
//! - [`CalibrationJob`] - a job with its environment readings and status
//! - [`ReferenceStandard`] - traceable master instruments
//! - [`DeviationRecord`] - out-of-tolerance reports and their workflow
//! - [`StageResult`] - tagged results of the three calculation stages

pub mod deviation;
pub mod job;
pub mod results;
pub mod standard;

pub use deviation::{DeviationRecord, DeviationRequest, DeviationStatus, DeviationType, Severity};
pub use job::{CalculationStatus, CalibrationJob, EnvironmentalReadings};
pub use results::{CalculationStage, StageResult, ValidationStatus};
pub use standard::ReferenceStandard;
