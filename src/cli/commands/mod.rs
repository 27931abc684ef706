//! CLI command implementations

pub mod check;
pub mod completions;
pub mod config;
pub mod dev;
pub mod job;
pub mod lookup;
pub mod run;
pub mod standard;
