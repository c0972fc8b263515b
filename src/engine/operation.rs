use crate::table::ColumnType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Statistic or rule used to fill missing values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStrategy {
    Mean,
    Median,
    Mode,
    #[serde(alias = "ffill")]
    ForwardFill,
    #[serde(alias = "bfill")]
    BackwardFill,
    Constant,
}

/// Numeric scaling method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMethod {
    #[serde(alias = "minmax")]
    MinMax,
    #[serde(alias = "zscore", alias = "standardize")]
    Standard,
    Robust,
    #[serde(alias = "maxabs")]
    MaxAbs,
}

/// Categorical encoding method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeMethod {
    Label,
    #[serde(alias = "onehot", alias = "dummies")]
    OneHot,
}

/// A literal supplied as an operation parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Boolean(v) => write!(f, "{}", v),
            Scalar::Integer(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(v) => write!(f, "{:?}", v),
        }
    }
}

/// A transformation request. Each variant carries exactly the parameters it
/// needs; there is no string-keyed dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    RenameColumn {
        #[serde(alias = "old")]
        from: String,
        #[serde(alias = "new")]
        to: String,
    },
    ChangeType {
        column: String,
        #[serde(alias = "target_type")]
        target: ColumnType,
    },
    FillMissing {
        columns: Vec<String>,
        strategy: FillStrategy,
        #[serde(default, alias = "constant_value", skip_serializing_if = "Option::is_none")]
        value: Option<Scalar>,
    },
    DeleteColumns {
        columns: Vec<String>,
    },
    NanCleanup {
        #[serde(default)]
        remove_rows: bool,
        #[serde(default)]
        remove_columns: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },
    Scale {
        columns: Vec<String>,
        method: ScaleMethod,
    },
    Encode {
        columns: Vec<String>,
        method: EncodeMethod,
    },
    DropDuplicates {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
    },
}

/// Discriminant of [`Operation`], used in logs and operation records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    RenameColumn,
    ChangeType,
    FillMissing,
    DeleteColumns,
    NanCleanup,
    Scale,
    Encode,
    DropDuplicates,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::RenameColumn => "rename_column",
            OperationType::ChangeType => "change_type",
            OperationType::FillMissing => "fill_missing",
            OperationType::DeleteColumns => "delete_columns",
            OperationType::NanCleanup => "nan_cleanup",
            OperationType::Scale => "scale",
            OperationType::Encode => "encode",
            OperationType::DropDuplicates => "drop_duplicates",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn operation_type(&self) -> OperationType {
        match self {
            Operation::RenameColumn { .. } => OperationType::RenameColumn,
            Operation::ChangeType { .. } => OperationType::ChangeType,
            Operation::FillMissing { .. } => OperationType::FillMissing,
            Operation::DeleteColumns { .. } => OperationType::DeleteColumns,
            Operation::NanCleanup { .. } => OperationType::NanCleanup,
            Operation::Scale { .. } => OperationType::Scale,
            Operation::Encode { .. } => OperationType::Encode,
            Operation::DropDuplicates { .. } => OperationType::DropDuplicates,
        }
    }
}
