//! Pure table transformations. Every function validates all of its inputs
//! before building the output, so a failure never yields a partial table.

use crate::engine::coerce::{convert_column, scalar_to_cell};
use crate::engine::operation::{EncodeMethod, FillStrategy, Scalar, ScaleMethod};
use crate::error::ValidationError;
use crate::table::column::map_values;
use crate::table::{Cell, Column, ColumnData, ColumnType, Table};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Printable, 1 to 256 characters, no leading or trailing whitespace
static COLUMN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s\p{Cc}](?:[^\p{Cc}]{0,254}[^\s\p{Cc}])?$").expect("valid column name pattern")
});

pub fn is_valid_column_name(name: &str) -> bool {
    COLUMN_NAME.is_match(name)
}

/// Resolve a non-empty, duplicate-free list of existing columns to indices
fn resolve_columns(table: &Table, columns: &[String]) -> Result<Vec<usize>, ValidationError> {
    if columns.is_empty() {
        return Err(ValidationError::parameter("columns", "at least one column is required"));
    }
    let mut seen = HashSet::new();
    columns
        .iter()
        .map(|name| {
            if !seen.insert(name.as_str()) {
                return Err(ValidationError::parameter(
                    "columns",
                    format!("column '{}' is listed twice", name),
                ));
            }
            table
                .column_index(name)
                .ok_or_else(|| ValidationError::UnknownColumn(name.clone()))
        })
        .collect()
}

fn require_numeric(column: &Column) -> Result<(), ValidationError> {
    if column.column_type().is_numeric() {
        Ok(())
    } else {
        Err(ValidationError::WrongColumnType {
            column: column.name.clone(),
            actual: column.column_type(),
            expected: "numeric",
        })
    }
}

fn replace_columns(
    table: &Table,
    replaced: Vec<(usize, Vec<Column>)>,
) -> Result<Table, ValidationError> {
    let mut columns: Vec<Vec<Column>> = table.columns().iter().cloned().map(|c| vec![c]).collect();
    for (index, with) in replaced {
        columns[index] = with;
    }
    Table::new(columns.into_iter().flatten().collect())
}

pub fn rename_column(table: &Table, from: &str, to: &str) -> Result<Table, ValidationError> {
    let index = table
        .column_index(from)
        .ok_or_else(|| ValidationError::UnknownColumn(from.to_string()))?;
    if from == to {
        return Ok(table.clone());
    }
    if !is_valid_column_name(to) {
        return Err(ValidationError::InvalidColumnName(to.to_string()));
    }
    if table.has_column(to) {
        return Err(ValidationError::DuplicateColumn(to.to_string()));
    }

    let column = &table.columns()[index];
    replace_columns(table, vec![(index, vec![Column::new(to, column.data.clone())])])
}

pub fn change_type(
    table: &Table,
    column: &str,
    target: ColumnType,
) -> Result<Table, ValidationError> {
    let index = table
        .column_index(column)
        .ok_or_else(|| ValidationError::UnknownColumn(column.to_string()))?;
    let source = &table.columns()[index];

    let data = convert_column(&source.data, target).map_err(|rows| ValidationError::TypeCoercion {
        column: column.to_string(),
        target,
        rows,
    })?;

    replace_columns(table, vec![(index, vec![Column::new(column, data)])])
}

pub fn fill_missing(
    table: &Table,
    columns: &[String],
    strategy: FillStrategy,
    value: Option<&Scalar>,
) -> Result<Table, ValidationError> {
    let indices = resolve_columns(table, columns)?;

    match (strategy, value) {
        (FillStrategy::Constant, None) => {
            return Err(ValidationError::parameter(
                "value",
                "the constant strategy needs a value",
            ));
        }
        (FillStrategy::Constant, Some(_)) => {}
        (_, Some(_)) => {
            return Err(ValidationError::parameter(
                "value",
                "a value is only accepted by the constant strategy",
            ));
        }
        (_, None) => {}
    }

    let mut replaced = Vec::with_capacity(indices.len());
    for index in indices {
        let column = &table.columns()[index];
        let data = match strategy {
            FillStrategy::Mean | FillStrategy::Median => {
                require_numeric(column)?;
                let present = present_numbers(&column.data);
                let stat = if strategy == FillStrategy::Mean {
                    mean(&present)
                } else {
                    median(&present)
                };
                fill_with_number(&column.data, stat)
            }
            FillStrategy::Mode => {
                let cells = column.data.cells();
                match mode(&cells) {
                    Some(fill) => fill_with_cell(&column.data, &fill),
                    None => column.data.clone(),
                }
            }
            FillStrategy::ForwardFill => map_values!(&column.data, values => forward_fill(values)),
            FillStrategy::BackwardFill => {
                map_values!(&column.data, values => backward_fill(values))
            }
            FillStrategy::Constant => {
                let scalar = value.ok_or_else(|| ValidationError::parameter("value", "missing"))?;
                let fill = scalar_to_cell(scalar, column.column_type()).ok_or_else(|| {
                    ValidationError::parameter(
                        "value",
                        format!(
                            "{} cannot be stored in column '{}' of type {}",
                            scalar,
                            column.name,
                            column.column_type()
                        ),
                    )
                })?;
                fill_with_cell(&column.data, &fill)
            }
        };
        replaced.push((index, vec![Column::new(column.name.clone(), data)]));
    }

    replace_columns(table, replaced)
}

pub fn delete_columns(table: &Table, columns: &[String]) -> Result<Table, ValidationError> {
    let indices: HashSet<usize> = resolve_columns(table, columns)?.into_iter().collect();
    let kept = table
        .columns()
        .iter()
        .enumerate()
        .filter(|(index, _)| !indices.contains(index))
        .map(|(_, column)| column.clone())
        .collect();
    Table::new(kept)
}

/// Drop columns, then rows, whose missing fraction exceeds `threshold`
pub fn nan_cleanup(
    table: &Table,
    remove_rows: bool,
    remove_columns: bool,
    threshold: Option<f64>,
) -> Result<Table, ValidationError> {
    if !remove_rows && !remove_columns {
        return Err(ValidationError::parameter(
            "remove_rows",
            "at least one of remove_rows or remove_columns must be set",
        ));
    }
    let threshold = threshold.unwrap_or(0.0);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ValidationError::parameter(
            "threshold",
            format!("{} is outside [0, 1]", threshold),
        ));
    }

    let rows = table.row_count();
    let mut working = table.clone();

    if remove_columns && rows > 0 {
        let kept = working
            .columns()
            .iter()
            .filter(|c| (c.data.missing_count() as f64 / rows as f64) <= threshold)
            .cloned()
            .collect();
        working = Table::new(kept)?;
    }

    let columns = working.column_count();
    if remove_rows && columns > 0 {
        let kept: Vec<usize> = (0..working.row_count())
            .filter(|&row| {
                let missing = working
                    .columns()
                    .iter()
                    .filter(|c| c.data.is_missing(row))
                    .count();
                (missing as f64 / columns as f64) <= threshold
            })
            .collect();
        working = working.take_rows(&kept);
    }

    Ok(working)
}

pub fn scale(
    table: &Table,
    columns: &[String],
    method: ScaleMethod,
) -> Result<Table, ValidationError> {
    let indices = resolve_columns(table, columns)?;
    for &index in &indices {
        require_numeric(&table.columns()[index])?;
    }

    let mut replaced = Vec::with_capacity(indices.len());
    for index in indices {
        let column = &table.columns()[index];
        let values = column.data.numeric_values().unwrap_or_default();
        let present = present_numbers(&column.data);

        let (center, spread) = match method {
            ScaleMethod::MinMax => {
                let min = present.iter().copied().fold(f64::INFINITY, f64::min);
                let max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (min, max - min)
            }
            ScaleMethod::Standard => {
                let mean = mean(&present).unwrap_or(0.0);
                let variance = if present.is_empty() {
                    0.0
                } else {
                    present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / present.len() as f64
                };
                (mean, variance.sqrt())
            }
            ScaleMethod::Robust => {
                let mut sorted = present.clone();
                sorted.sort_by(f64::total_cmp);
                let median = quantile(&sorted, 0.5).unwrap_or(0.0);
                let iqr = quantile(&sorted, 0.75).unwrap_or(0.0)
                    - quantile(&sorted, 0.25).unwrap_or(0.0);
                (median, iqr)
            }
            ScaleMethod::MaxAbs => {
                let max_abs = present.iter().map(|v| v.abs()).fold(0.0, f64::max);
                (0.0, max_abs)
            }
        };

        let scaled = values
            .into_iter()
            .map(|v| {
                v.map(|v| {
                    if spread == 0.0 || !spread.is_finite() {
                        0.0
                    } else {
                        (v - center) / spread
                    }
                })
            })
            .collect();
        replaced.push((index, vec![Column::new(column.name.clone(), ColumnData::Float(scaled))]));
    }

    replace_columns(table, replaced)
}

pub fn encode(
    table: &Table,
    columns: &[String],
    method: EncodeMethod,
    max_categories: usize,
) -> Result<Table, ValidationError> {
    let indices = resolve_columns(table, columns)?;
    for &index in &indices {
        let column = &table.columns()[index];
        if !matches!(column.column_type(), ColumnType::Text | ColumnType::Boolean) {
            return Err(ValidationError::WrongColumnType {
                column: column.name.clone(),
                actual: column.column_type(),
                expected: "text or boolean",
            });
        }
    }

    let encoded_names: HashSet<&str> = indices
        .iter()
        .map(|&i| table.columns()[i].name.as_str())
        .collect();
    let mut reserved: HashSet<String> = table
        .column_names()
        .into_iter()
        .filter(|name| !encoded_names.contains(name))
        .map(str::to_string)
        .collect();

    let mut replaced = Vec::with_capacity(indices.len());
    for index in indices {
        let column = &table.columns()[index];
        let labels: Vec<Option<String>> = column
            .data
            .cells()
            .into_iter()
            .map(|c| c.map(|c| c.to_string()))
            .collect();
        let mut categories: Vec<String> = labels.iter().flatten().cloned().collect();
        categories.sort();
        categories.dedup();

        let with = match method {
            EncodeMethod::Label => {
                reserved.insert(column.name.clone());
                let codes = labels
                    .iter()
                    .map(|label| {
                        label.as_ref().and_then(|l| {
                            categories.binary_search(l).ok().map(|code| code as i64)
                        })
                    })
                    .collect();
                vec![Column::new(column.name.clone(), ColumnData::Integer(codes))]
            }
            EncodeMethod::OneHot => {
                if categories.len() > max_categories {
                    return Err(ValidationError::parameter(
                        "columns",
                        format!(
                            "column '{}' has {} categories, more than the limit of {}",
                            column.name,
                            categories.len(),
                            max_categories
                        ),
                    ));
                }
                let mut generated = Vec::with_capacity(categories.len());
                for category in &categories {
                    let name = format!("{}_{}", column.name, category);
                    if !is_valid_column_name(&name) {
                        return Err(ValidationError::InvalidColumnName(name));
                    }
                    if !reserved.insert(name.clone()) {
                        return Err(ValidationError::DuplicateColumn(name));
                    }
                    let flags = labels
                        .iter()
                        .map(|label| Some(i64::from(label.as_deref() == Some(category.as_str()))))
                        .collect();
                    generated.push(Column::new(name, ColumnData::Integer(flags)));
                }
                generated
            }
        };
        replaced.push((index, with));
    }

    replace_columns(table, replaced)
}

/// Keep the first row of every distinct key over `columns` (all columns when `None`)
pub fn drop_duplicates(
    table: &Table,
    columns: Option<&[String]>,
) -> Result<Table, ValidationError> {
    let indices = match columns {
        Some(columns) => resolve_columns(table, columns)?,
        None => (0..table.column_count()).collect(),
    };

    let mut seen = HashSet::new();
    let kept: Vec<usize> = (0..table.row_count())
        .filter(|&row| {
            let key: Vec<String> = indices
                .iter()
                .map(|&i| format!("{:?}", table.columns()[i].data.cell(row)))
                .collect();
            seen.insert(key)
        })
        .collect();

    Ok(table.take_rows(&kept))
}

fn present_numbers(data: &ColumnData) -> Vec<f64> {
    data.numeric_values()
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    quantile(&sorted, 0.5)
}

/// Linear-interpolated quantile of sorted values
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Most frequent value; ties go to the value seen first
fn mode(cells: &[Option<Cell>]) -> Option<Cell> {
    let mut counts: Vec<(Cell, usize)> = Vec::new();
    for cell in cells.iter().flatten() {
        match counts.iter_mut().find(|(c, _)| c == cell) {
            Some((_, count)) => *count += 1,
            None => counts.push((cell.clone(), 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max()?;
    counts.into_iter().find(|(_, n)| *n == best).map(|(c, _)| c)
}

fn fill_with_number(data: &ColumnData, stat: Option<f64>) -> ColumnData {
    let Some(stat) = stat else {
        return data.clone();
    };
    match data {
        ColumnData::Integer(values) => ColumnData::Integer(
            values
                .iter()
                .map(|v| v.or(Some(stat.round() as i64)))
                .collect(),
        ),
        ColumnData::Float(values) => {
            ColumnData::Float(values.iter().map(|v| v.or(Some(stat))).collect())
        }
        other => other.clone(),
    }
}

fn fill_with_cell(data: &ColumnData, fill: &Cell) -> ColumnData {
    let cells = data
        .cells()
        .into_iter()
        .map(|c| c.or_else(|| Some(fill.clone())))
        .collect();
    ColumnData::from_cells(data.column_type(), cells)
}

fn forward_fill<T: Clone>(values: &[Option<T>]) -> Vec<Option<T>> {
    let mut last = None;
    values
        .iter()
        .map(|v| {
            if v.is_some() {
                last = v.clone();
            }
            last.clone()
        })
        .collect()
}

fn backward_fill<T: Clone>(values: &[Option<T>]) -> Vec<Option<T>> {
    let mut next = None;
    let mut filled: Vec<Option<T>> = values
        .iter()
        .rev()
        .map(|v| {
            if v.is_some() {
                next = v.clone();
            }
            next.clone()
        })
        .collect();
    filled.reverse();
    filled
}
