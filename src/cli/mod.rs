//! CLI-specific functionality for the wrangle binary
//!
//! This module contains all CLI-related code including argument parsing,
//! dataset and step file loading, and configuration discovery.

pub mod args;
pub mod config;
pub mod steps;

pub use args::{Args, ExecutionMode, ExportFormat, RunConfig};
pub use config::{ConfigDiscovery, ConfigError, WrangleConfig};
pub use steps::{FileError, Step, StepLoader};
