use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[serde(alias = "int", alias = "int64")]
    Integer,
    #[serde(alias = "double", alias = "float64", alias = "number")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "string", alias = "str")]
    Text,
    #[serde(alias = "timestamp", alias = "date")]
    Datetime,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "text",
            ColumnType::Datetime => "datetime",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" | "int64" => Ok(ColumnType::Integer),
            "float" | "double" | "float64" | "number" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "text" | "string" | "str" => Ok(ColumnType::Text),
            "datetime" | "timestamp" | "date" => Ok(ColumnType::Datetime),
            other => Err(format!("unknown column type '{}'", other)),
        }
    }
}

/// A single non-missing value of any column type
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
    Datetime(DateTime<Utc>),
}

impl Cell {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Cell::Integer(_) => ColumnType::Integer,
            Cell::Float(_) => ColumnType::Float,
            Cell::Boolean(_) => ColumnType::Boolean,
            Cell::Text(_) => ColumnType::Text,
            Cell::Datetime(_) => ColumnType::Datetime,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to a plain JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Integer(v) => serde_json::Value::from(*v),
            Cell::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Cell::Boolean(v) => serde_json::Value::Bool(*v),
            Cell::Text(v) => serde_json::Value::String(v.clone()),
            Cell::Datetime(v) => {
                serde_json::Value::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Integer(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Boolean(v) => write!(f, "{}", v),
            Cell::Text(v) => f.write_str(v),
            Cell::Datetime(v) => f.write_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

/// Typed columnar storage; `None` marks a missing value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
    Text(Vec<Option<String>>),
    Datetime(Vec<Option<DateTime<Utc>>>),
}

/// Apply a type-generic expression to the values of any column variant,
/// rebuilding a column of the same variant.
macro_rules! map_values {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            ColumnData::Integer($values) => ColumnData::Integer($body),
            ColumnData::Float($values) => ColumnData::Float($body),
            ColumnData::Boolean($values) => ColumnData::Boolean($body),
            ColumnData::Text($values) => ColumnData::Text($body),
            ColumnData::Datetime($values) => ColumnData::Datetime($body),
        }
    };
}
pub(crate) use map_values;

impl ColumnData {
    /// An all-missing column of the given type
    pub fn missing(column_type: ColumnType, len: usize) -> Self {
        match column_type {
            ColumnType::Integer => ColumnData::Integer(vec![None; len]),
            ColumnType::Float => ColumnData::Float(vec![None; len]),
            ColumnType::Boolean => ColumnData::Boolean(vec![None; len]),
            ColumnType::Text => ColumnData::Text(vec![None; len]),
            ColumnType::Datetime => ColumnData::Datetime(vec![None; len]),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Integer(_) => ColumnType::Integer,
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Boolean(_) => ColumnType::Boolean,
            ColumnData::Text(_) => ColumnType::Text,
            ColumnData::Datetime(_) => ColumnType::Datetime,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Integer(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Boolean(v) => v.len(),
            ColumnData::Text(v) => v.len(),
            ColumnData::Datetime(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, row: usize) -> bool {
        self.cell(row).is_none()
    }

    pub fn missing_count(&self) -> usize {
        (0..self.len()).filter(|&row| self.is_missing(row)).count()
    }

    /// Read one row; `None` for missing values or out-of-range rows
    pub fn cell(&self, row: usize) -> Option<Cell> {
        match self {
            ColumnData::Integer(v) => v.get(row).copied().flatten().map(Cell::Integer),
            ColumnData::Float(v) => v.get(row).copied().flatten().map(Cell::Float),
            ColumnData::Boolean(v) => v.get(row).copied().flatten().map(Cell::Boolean),
            ColumnData::Text(v) => v.get(row).cloned().flatten().map(Cell::Text),
            ColumnData::Datetime(v) => v.get(row).copied().flatten().map(Cell::Datetime),
        }
    }

    pub fn cells(&self) -> Vec<Option<Cell>> {
        (0..self.len()).map(|row| self.cell(row)).collect()
    }

    /// Non-missing values as floats; `None` for non-numeric columns
    pub fn numeric_values(&self) -> Option<Vec<Option<f64>>> {
        match self {
            ColumnData::Integer(v) => Some(v.iter().map(|x| x.map(|x| x as f64)).collect()),
            ColumnData::Float(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Build a column of `column_type` from cells that already match it.
    /// Cells of another type become missing.
    pub fn from_cells(column_type: ColumnType, cells: Vec<Option<Cell>>) -> Self {
        match column_type {
            ColumnType::Integer => ColumnData::Integer(
                cells
                    .into_iter()
                    .map(|c| match c {
                        Some(Cell::Integer(v)) => Some(v),
                        _ => None,
                    })
                    .collect(),
            ),
            ColumnType::Float => ColumnData::Float(
                cells
                    .into_iter()
                    .map(|c| match c {
                        Some(Cell::Float(v)) if v.is_finite() => Some(v),
                        _ => None,
                    })
                    .collect(),
            ),
            ColumnType::Boolean => ColumnData::Boolean(
                cells
                    .into_iter()
                    .map(|c| match c {
                        Some(Cell::Boolean(v)) => Some(v),
                        _ => None,
                    })
                    .collect(),
            ),
            ColumnType::Text => ColumnData::Text(
                cells
                    .into_iter()
                    .map(|c| match c {
                        Some(Cell::Text(v)) => Some(v),
                        _ => None,
                    })
                    .collect(),
            ),
            ColumnType::Datetime => ColumnData::Datetime(
                cells
                    .into_iter()
                    .map(|c| match c {
                        Some(Cell::Datetime(v)) => Some(v),
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }

    /// Keep only the given rows, in the given order
    pub fn take(&self, rows: &[usize]) -> Self {
        map_values!(self, values => {
            rows.iter().map(|&row| values.get(row).cloned().flatten()).collect()
        })
    }

    /// Replace non-finite floats with missing values
    pub(crate) fn normalized(self) -> Self {
        match self {
            ColumnData::Float(values) => ColumnData::Float(
                values
                    .into_iter()
                    .map(|v| v.filter(|x| x.is_finite()))
                    .collect(),
            ),
            other => other,
        }
    }
}

/// A named column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        self.data.column_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
