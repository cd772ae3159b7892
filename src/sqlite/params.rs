use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::{Null, Value};

use crate::error::{ErrorCode, SqlSchedulerError};
use crate::types::{Params, RowValues};

lazy_static! {
    static ref PARAMETER_NAME: Regex =
        Regex::new(r"^[:@$]?[A-Za-z_][A-Za-z0-9_]*$").expect("parameter name pattern is valid");
}

const PREFIXES: [char; 3] = [':', '@', '$'];

/// Convert a single `RowValues` to a rusqlite `Value`.
#[must_use]
pub fn row_value_to_sqlite_value(value: &RowValues) -> Value {
    match value {
        RowValues::Int(i) => Value::Integer(*i),
        RowValues::Float(f) => Value::Real(*f),
        RowValues::Text(s) => Value::Text(s.clone()),
        RowValues::Bool(b) => Value::Integer(i64::from(*b)),
        RowValues::Timestamp(dt) => Value::Text(dt.format("%F %T%.f").to_string()),
        RowValues::Null => Value::Null,
        RowValues::JSON(jval) => Value::Text(jval.to_string()),
        RowValues::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

/// Replace the statement's bindings with `params`.
///
/// Every slot is cleared to NULL first so values from an earlier bind never leak into the
/// next execution. Empty `params` leave the current bindings alone.
///
/// # Errors
///
/// Returns `SQLITE_RANGE` for an index outside `1..=parameter_count` or an unknown name, and
/// `ParameterError` for a malformed name.
pub fn bind_params(
    stmt: &mut rusqlite::Statement<'_>,
    params: &Params,
) -> Result<(), SqlSchedulerError> {
    if params.is_empty() {
        return Ok(());
    }
    let count = stmt.parameter_count();
    for idx in 1..=count {
        stmt.raw_bind_parameter(idx, Null)?;
    }
    match params {
        Params::None => {}
        Params::Positional(values) => {
            for (offset, value) in values.iter().enumerate() {
                bind_at(stmt, count, offset + 1, value)?;
            }
        }
        Params::Indexed(values) => {
            for (idx, value) in values {
                bind_at(stmt, count, *idx, value)?;
            }
        }
        Params::Named(values) => {
            for (name, value) in values {
                let idx = resolve_name(stmt, name)?;
                bind_at(stmt, count, idx, value)?;
            }
        }
    }
    Ok(())
}

fn bind_at(
    stmt: &mut rusqlite::Statement<'_>,
    count: usize,
    idx: usize,
    value: &RowValues,
) -> Result<(), SqlSchedulerError> {
    if idx == 0 || idx > count {
        return Err(SqlSchedulerError::engine(
            ErrorCode::Range,
            "column index out of range",
        ));
    }
    stmt.raw_bind_parameter(idx, row_value_to_sqlite_value(value))?;
    Ok(())
}

fn resolve_name(stmt: &rusqlite::Statement<'_>, name: &str) -> Result<usize, SqlSchedulerError> {
    validate_name(name)?;
    if name.starts_with(PREFIXES) {
        return lookup(stmt, name)?.ok_or_else(|| unknown_name(name));
    }
    for prefix in PREFIXES {
        if let Some(idx) = lookup(stmt, &format!("{prefix}{name}"))? {
            return Ok(idx);
        }
    }
    Err(unknown_name(name))
}

fn lookup(stmt: &rusqlite::Statement<'_>, name: &str) -> Result<Option<usize>, SqlSchedulerError> {
    Ok(stmt.parameter_index(name)?)
}

fn unknown_name(name: &str) -> SqlSchedulerError {
    SqlSchedulerError::engine(ErrorCode::Range, format!("unknown parameter name {name}"))
}

pub(crate) fn validate_name(name: &str) -> Result<(), SqlSchedulerError> {
    if PARAMETER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(SqlSchedulerError::ParameterError(format!(
            "invalid parameter name {name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rusqlite::Connection;

    use super::*;

    #[test]
    fn names_accept_all_prefixes() {
        for name in ["id", ":id", "@id", "$id", "_x1"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
        for name in ["", "1x", "a b", "::a", "id;"] {
            assert!(validate_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn values_map_to_storage_classes() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .and_then(|d| d.and_hms_opt(3, 4, 5))
            .expect("valid timestamp");
        assert_eq!(row_value_to_sqlite_value(&RowValues::Bool(true)), Value::Integer(1));
        assert_eq!(
            row_value_to_sqlite_value(&RowValues::Timestamp(ts)),
            Value::Text("2024-01-02 03:04:05".into())
        );
        assert_eq!(
            row_value_to_sqlite_value(&RowValues::JSON(serde_json::json!({"a": 1}))),
            Value::Text(r#"{"a":1}"#.into())
        );
    }

    #[test]
    fn bind_clears_previous_values_and_checks_range() -> Result<(), Box<dyn std::error::Error>> {
        let conn = Connection::open_in_memory()?;
        let mut stmt = conn.prepare("SELECT ?1, ?2")?;

        bind_params(&mut stmt, &Params::Positional(vec![1.into(), 2.into()]))?;
        bind_params(&mut stmt, &Params::Indexed(vec![(2, "b".into())]))?;
        let mut rows = stmt.raw_query();
        let row = rows.next()?.ok_or("expected a row")?;
        let first: Option<i64> = row.get(0)?;
        let second: String = row.get(1)?;
        assert_eq!(first, None);
        assert_eq!(second, "b");
        drop(rows);

        let err = bind_params(&mut stmt, &Params::Positional(vec![1.into(), 2.into(), 3.into()]))
            .expect_err("third slot does not exist");
        assert_eq!(err.code(), Some(ErrorCode::Range));
        Ok(())
    }

    #[test]
    fn bare_names_resolve_against_any_prefix() -> Result<(), Box<dyn std::error::Error>> {
        let conn = Connection::open_in_memory()?;
        let mut stmt = conn.prepare("SELECT @a, $b, :c")?;
        bind_params(
            &mut stmt,
            &Params::named([("a", 1_i64), ("$b", 2), ("c", 3)]),
        )?;
        let mut rows = stmt.raw_query();
        let row = rows.next()?.ok_or("expected a row")?;
        let values: (i64, i64, i64) = (row.get(0)?, row.get(1)?, row.get(2)?);
        assert_eq!(values, (1, 2, 3));
        drop(rows);

        let err = bind_params(&mut stmt, &Params::named([("missing", 1_i64)]))
            .expect_err("unknown name");
        assert_eq!(err.code(), Some(ErrorCode::Range));
        Ok(())
    }
}
