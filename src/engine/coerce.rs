//! Value conversion between column types.

use crate::engine::operation::Scalar;
use crate::table::{Cell, ColumnData, ColumnType};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Convert a whole column, or return every row index that cannot be converted.
/// Missing values stay missing.
pub fn convert_column(data: &ColumnData, target: ColumnType) -> Result<ColumnData, Vec<usize>> {
    if data.column_type() == target {
        return Ok(data.clone());
    }

    let mut failed = Vec::new();
    let converted: Vec<Option<Cell>> = data
        .cells()
        .into_iter()
        .enumerate()
        .map(|(row, cell)| {
            cell.and_then(|cell| {
                let out = coerce_cell(&cell, target);
                if out.is_none() {
                    failed.push(row);
                }
                out
            })
        })
        .collect();

    if failed.is_empty() {
        Ok(ColumnData::from_cells(target, converted))
    } else {
        Err(failed)
    }
}

/// Convert one value, `None` when no lossless conversion exists
pub fn coerce_cell(cell: &Cell, target: ColumnType) -> Option<Cell> {
    if cell.column_type() == target {
        return Some(cell.clone());
    }

    match (cell, target) {
        (_, ColumnType::Text) => Some(Cell::Text(cell.to_string())),

        (Cell::Text(s), ColumnType::Integer) => parse_integer(s).map(Cell::Integer),
        (Cell::Text(s), ColumnType::Float) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Cell::Float),
        (Cell::Text(s), ColumnType::Boolean) => parse_boolean(s).map(Cell::Boolean),
        (Cell::Text(s), ColumnType::Datetime) => parse_datetime(s).map(Cell::Datetime),

        (Cell::Integer(v), ColumnType::Float) => Some(Cell::Float(*v as f64)),
        (Cell::Integer(v), ColumnType::Boolean) => match v {
            0 => Some(Cell::Boolean(false)),
            1 => Some(Cell::Boolean(true)),
            _ => None,
        },

        (Cell::Float(v), ColumnType::Integer) => float_to_integer(*v).map(Cell::Integer),
        (Cell::Float(v), ColumnType::Boolean) => {
            if *v == 0.0 {
                Some(Cell::Boolean(false))
            } else if *v == 1.0 {
                Some(Cell::Boolean(true))
            } else {
                None
            }
        }

        (Cell::Boolean(v), ColumnType::Integer) => Some(Cell::Integer(i64::from(*v))),
        (Cell::Boolean(v), ColumnType::Float) => Some(Cell::Float(if *v { 1.0 } else { 0.0 })),

        (Cell::Datetime(v), ColumnType::Integer) => Some(Cell::Integer(v.timestamp())),
        (Cell::Datetime(v), ColumnType::Float) => Some(Cell::Float(
            v.timestamp() as f64 + f64::from(v.timestamp_subsec_nanos()) / 1e9,
        )),

        // Numbers are not read as epoch timestamps; only text parses to datetime.
        _ => None,
    }
}

/// Turn a literal parameter into a cell of `target`
pub fn scalar_to_cell(scalar: &Scalar, target: ColumnType) -> Option<Cell> {
    let cell = match scalar {
        Scalar::Boolean(v) => Cell::Boolean(*v),
        Scalar::Integer(v) => Cell::Integer(*v),
        Scalar::Float(v) if v.is_finite() => Cell::Float(*v),
        Scalar::Float(_) => return None,
        Scalar::Text(v) => Cell::Text(v.clone()),
    };
    coerce_cell(&cell, target)
}

fn parse_integer(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().and_then(float_to_integer))
}

fn float_to_integer(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn parse_boolean(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
