//! Working-table representation shared by the codec, the operation engine
//! and the export document.

pub mod column;

#[cfg(test)]
mod tests;

pub use column::{Cell, Column, ColumnData, ColumnType};

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A rectangular table of typed columns.
///
/// Column names are unique and every column has the same number of rows.
/// Both invariants are checked on construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Column>", into = "Vec<Column>")]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, ValidationError> {
        let mut seen = HashSet::new();
        let expected = columns.first().map(Column::len).unwrap_or(0);

        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ValidationError::DuplicateColumn(column.name.clone()));
            }
            if column.len() != expected {
                return Err(ValidationError::RaggedColumn {
                    column: column.name.clone(),
                    length: column.len(),
                    expected,
                });
            }
        }

        let columns = columns
            .into_iter()
            .map(|c| Column::new(c.name, c.data.normalized()))
            .collect();

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Keep only the given rows, in the given order
    pub fn take_rows(&self, rows: &[usize]) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data.take(rows)))
                .collect(),
        }
    }

    /// Build a table from JSON objects, inferring one type per column.
    ///
    /// Columns appear in first-seen key order. A column whose values are all
    /// integers becomes `Integer`, all numbers `Float`, all booleans
    /// `Boolean`; anything else is stored as `Text`. Missing keys and `null`
    /// are missing values.
    pub fn from_records(records: &[serde_json::Value]) -> Result<Self, ValidationError> {
        let mut names: Vec<String> = Vec::new();
        for (row, record) in records.iter().enumerate() {
            let object = record.as_object().ok_or_else(|| {
                ValidationError::parameter("records", format!("row {} is not an object", row))
            })?;
            for key in object.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }

        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let raw: Vec<&serde_json::Value> = records
                .iter()
                .map(|r| r.get(&name).unwrap_or(&serde_json::Value::Null))
                .collect();
            columns.push(Column::new(name.clone(), infer_column(&name, &raw)?));
        }

        Table::new(columns)
    }

    /// Render rows as JSON objects
    pub fn to_records(&self) -> Vec<serde_json::Value> {
        (0..self.row_count())
            .map(|row| {
                let mut object = serde_json::Map::new();
                for column in &self.columns {
                    let value = column
                        .data
                        .cell(row)
                        .map(|c| c.to_json())
                        .unwrap_or(serde_json::Value::Null);
                    object.insert(column.name.clone(), value);
                }
                serde_json::Value::Object(object)
            })
            .collect()
    }
}

impl TryFrom<Vec<Column>> for Table {
    type Error = ValidationError;

    fn try_from(columns: Vec<Column>) -> Result<Self, Self::Error> {
        Table::new(columns)
    }
}

impl From<Table> for Vec<Column> {
    fn from(table: Table) -> Self {
        table.columns
    }
}

fn infer_column(name: &str, raw: &[&serde_json::Value]) -> Result<ColumnData, ValidationError> {
    use serde_json::Value;

    let present: Vec<&Value> = raw.iter().copied().filter(|v| !v.is_null()).collect();
    if let Some(bad) = present.iter().find(|v| v.is_object() || v.is_array()) {
        return Err(ValidationError::parameter(
            "records",
            format!("column '{}' holds a nested value: {}", name, bad),
        ));
    }

    let data = if !present.is_empty() && present.iter().all(|v| v.is_boolean()) {
        ColumnData::Boolean(raw.iter().map(|v| v.as_bool()).collect())
    } else if !present.is_empty() && present.iter().all(|v| v.is_i64()) {
        ColumnData::Integer(raw.iter().map(|v| v.as_i64()).collect())
    } else if !present.is_empty() && present.iter().all(|v| v.is_number()) {
        ColumnData::Float(raw.iter().map(|v| v.as_f64()).collect())
    } else {
        ColumnData::Text(
            raw.iter()
                .map(|v| match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect(),
        )
    };

    Ok(data)
}
