//! Row extraction.
//!
//! Copies the current row's values out of a cursor, laid out by the resolved
//! column list rather than by the cursor's physical column order.

use super::Column;
use crate::db::{DataRecord, Row, Value};
use crate::error::Result;
use std::collections::HashMap;

/// A row keyed by column name.
pub type RowMap = HashMap<String, Value>;

/// Reads one value per resolved column from the current row.
///
/// The cursor must be positioned on a row. An empty column list yields an
/// empty row without touching the cursor.
pub fn extract<R: DataRecord + ?Sized>(record: &R, columns: &[Column]) -> Result<Row> {
    if columns.is_empty() {
        return Ok(Vec::new());
    }

    let mut row = Vec::with_capacity(columns.len());
    for column in columns {
        row.push(record.value(column.ordinal)?);
    }
    Ok(row)
}

/// Reads the current row into a map keyed by resolved column name.
pub fn extract_map<R: DataRecord + ?Sized>(record: &R, columns: &[Column]) -> Result<RowMap> {
    let mut map = HashMap::with_capacity(columns.len());
    for column in columns {
        map.insert(column.name.clone(), record.value(column.ordinal)?);
    }
    Ok(map)
}

/// Pairs a positional row with its column names.
pub fn to_map(columns: &[Column], row: Row) -> RowMap {
    columns
        .iter()
        .map(|c| c.name.clone())
        .zip(row)
        .collect()
}
