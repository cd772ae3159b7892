use rusqlite::types::Value;

use crate::error::SqlSchedulerError;
use crate::results::{CustomDbRow, RowColumns};
use crate::types::RowValues;

/// Extract a `RowValues` from a `SQLite` row.
///
/// # Errors
///
/// Returns `SqlSchedulerError` if the value cannot be read.
pub fn sqlite_extract_value_sync(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> Result<RowValues, SqlSchedulerError> {
    let value: Value = row.get(idx)?;
    Ok(match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    })
}

pub(crate) fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect()
}

/// Step the statement from its first row, handing each row to `visit` until it returns
/// `false` or rows run out.
///
/// rusqlite resets the statement when the row cursor is dropped.
pub(crate) fn step_rows(
    stmt: &mut rusqlite::Statement<'_>,
    columns: &RowColumns,
    mut visit: impl FnMut(CustomDbRow) -> bool,
) -> Result<usize, SqlSchedulerError> {
    let mut rows = stmt.raw_query();
    let mut seen = 0;
    while let Some(row) = rows.next()? {
        seen += 1;
        if !visit(extract_row(row, columns)?) {
            break;
        }
    }
    Ok(seen)
}

/// Row `n` (0-based) of a fresh execution, stepping over the ones before it.
pub(crate) fn nth_row(
    stmt: &mut rusqlite::Statement<'_>,
    columns: &RowColumns,
    n: usize,
) -> Result<Option<CustomDbRow>, SqlSchedulerError> {
    let mut rows = stmt.raw_query();
    for _ in 0..n {
        if rows.next()?.is_none() {
            return Ok(None);
        }
    }
    match rows.next()? {
        Some(row) => extract_row(row, columns).map(Some),
        None => Ok(None),
    }
}

fn extract_row(
    row: &rusqlite::Row<'_>,
    columns: &RowColumns,
) -> Result<CustomDbRow, SqlSchedulerError> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        values.push(sqlite_extract_value_sync(row, idx)?);
    }
    Ok(CustomDbRow::with_shared(columns, values))
}
