//! Core module - the metrology engine and its collaborators

pub mod config;
pub mod identity;
pub mod lookup;
pub mod measurement;
pub mod orchestrator;
pub mod stage1;
pub mod stage2;
pub mod stage3;
pub mod store;
pub mod tolerance;
pub mod workflow;

pub use config::{ConfigError, EngineConfig, Settings, ToleranceOverride};
pub use identity::{DeviationNumber, IdParseError, JobId, RunId};
pub use lookup::{
    CsvTables, EmbeddedTables, InMemoryTables, Lookup, LookupCategory, LookupSource, LookupStore,
    LookupTable,
};
pub use measurement::{InputError, MeasurementData};
pub use orchestrator::{Calculation, Engine, EngineError, FinalResults, WorkflowResult};
pub use store::{JobStore, MemoryStore, SqliteStore, StoreError};
pub use tolerance::{CheckType, JobToleranceReport, ToleranceCheckResult};
pub use workflow::{CertificateGate, DeviationWorkflow, TransitionError};
