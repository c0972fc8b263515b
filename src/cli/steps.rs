//! Input files for the `run` command
//!
//! - Dataset files: a JSON array of row objects, loaded into a [`Table`]
//! - Step files: a JSON array of steps, each `{"apply": <operation>}`,
//!   `"undo"`, `"redo"`, `{"extend": <seconds>}` or `{"save": <name>}`

use crate::engine::Operation;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },
}

/// One scripted session action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Apply(Operation),
    Undo,
    Redo,
    Extend(u64),
    Save(String),
}

pub struct StepLoader;

impl StepLoader {
    fn read<P: AsRef<Path>>(path: P) -> Result<(PathBuf, Vec<u8>), FileError> {
        let path = path.as_ref().to_path_buf();
        debug!("Loading file: {:?}", path);

        match fs::read(&path) {
            Ok(content) => Ok((path, content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FileError::NotFound { path }),
            Err(e) => Err(FileError::IoError { path, source: e }),
        }
    }

    /// Load a dataset from JSON records
    pub fn load_dataset<P: AsRef<Path>>(path: P) -> Result<Table, FileError> {
        let (path, content) = Self::read(path)?;
        let records: Vec<serde_json::Value> =
            serde_json::from_slice(&content).map_err(|e| FileError::ParseError {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        let table = Table::from_records(&records).map_err(|e| FileError::ParseError {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!(
            "Loaded dataset {:?}: {} columns, {} rows",
            path,
            table.column_count(),
            table.row_count()
        );
        Ok(table)
    }

    /// Load a list of steps
    pub fn load_steps<P: AsRef<Path>>(path: P) -> Result<Vec<Step>, FileError> {
        let (path, content) = Self::read(path)?;
        let steps: Vec<Step> = serde_json::from_slice(&content).map_err(|e| FileError::ParseError {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!("Parsed {} steps from {:?}", steps.len(), path);
        Ok(steps)
    }
}
