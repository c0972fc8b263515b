//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `run`: Open a session over a dataset file and apply a list of steps
//! - `inspect`: Summarize an exported session document
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write a default user configuration file

use crate::session::ExportMode;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    Inspect(PathBuf),
    ShowConfig,
    InitConfig,
}

#[derive(Debug)]
pub struct RunConfig {
    pub dataset: PathBuf,
    pub steps: PathBuf,
    pub config_override: Option<PathBuf>,
    pub export: Option<PathBuf>,
    pub export_mode: ExportMode,
    pub owner: String,
    pub verbose: bool,
}

/// Document layout for `--export`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExportFormat {
    #[default]
    Log,
    Snapshot,
}

impl From<ExportFormat> for ExportMode {
    fn from(format: ExportFormat) -> Self {
        match format {
            ExportFormat::Log => ExportMode::OperationLog,
            ExportFormat::Snapshot => ExportMode::SnapshotOnly,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "wrangle")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Apply undoable transformations to a tabular dataset inside an expiring session")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Open a session over a dataset and apply steps to it
    Run {
        /// JSON file holding an array of row objects
        dataset: PathBuf,
        /// JSON file holding an array of steps
        steps: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Write the final session document to this file
        #[arg(long = "export", value_name = "FILE")]
        export: Option<PathBuf>,
        /// Export layout
        #[arg(long = "mode", value_enum, default_value_t = ExportFormat::Log)]
        mode: ExportFormat,
        /// Owner the session is opened for
        #[arg(long = "owner", default_value = "cli")]
        owner: String,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Summarize an exported session document
    Inspect {
        /// Path to the document
        document: PathBuf,
    },
    /// Show configuration discovery information
    ShowConfig,
    /// Write a default configuration to ~/.wrangle/config.toml
    InitConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                dataset,
                steps,
                config,
                export,
                mode,
                owner,
                verbose,
            }) => {
                if owner.trim().is_empty() {
                    return Err("--owner must not be empty".to_string());
                }
                Ok(ExecutionMode::Run(RunConfig {
                    dataset: dataset.clone(),
                    steps: steps.clone(),
                    config_override: config.clone(),
                    export: export.clone(),
                    export_mode: (*mode).into(),
                    owner: owner.clone(),
                    verbose: *verbose,
                }))
            }
            Some(Commands::Inspect { document }) => Ok(ExecutionMode::Inspect(document.clone())),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            Some(Commands::InitConfig) => Ok(ExecutionMode::InitConfig),
            None => Err(
                "No command specified. Use 'wrangle --help' to see available commands.".to_string(),
            ),
        }
    }
}
