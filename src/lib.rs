//! Caliber: metrology calculation engine for torque calibration laboratories
//!
//! Turns raw torque-wrench readings into a traceable uncertainty budget,
//! checks the result against the procedure's tolerances and drives the
//! deviation workflow that gates certificate issuance.

pub mod cli;
pub mod core;
pub mod entities;
