use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::types::RowValues;

/// A row produced by stepping a statement.
///
/// Column names and the name lookup table are shared by every row of one execution.
#[derive(Debug, Clone)]
pub struct CustomDbRow {
    /// The column names for this row (shared across all rows in a result set)
    pub column_names: Arc<Vec<String>>,
    /// The values for this row
    pub rows: Vec<RowValues>,
    #[doc(hidden)]
    pub(crate) column_index_cache: Arc<HashMap<String, usize>>,
}

impl CustomDbRow {
    /// Create a new database row, building its own column lookup table.
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, rows: Vec<RowValues>) -> Self {
        let cache = Arc::new(index_columns(&column_names));
        Self {
            column_names,
            rows,
            column_index_cache: cache,
        }
    }

    pub(crate) fn with_shared(columns: &RowColumns, rows: Vec<RowValues>) -> Self {
        Self {
            column_names: Arc::clone(&columns.names),
            rows,
            column_index_cache: Arc::clone(&columns.index),
        }
    }

    /// Get the index of a column by name
    #[must_use]
    pub fn get_column_index(&self, column_name: &str) -> Option<usize> {
        if let Some(&idx) = self.column_index_cache.get(column_name) {
            return Some(idx);
        }
        self.column_names.iter().position(|col| col == column_name)
    }

    /// Get a value from the row by column name
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.get_column_index(column_name)
            .and_then(|idx| self.rows.get(idx))
    }

    /// Get a value from the row by column index
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.rows.get(index)
    }
}

/// Column metadata shared by all rows of one execution.
#[derive(Debug, Clone)]
pub(crate) struct RowColumns {
    names: Arc<Vec<String>>,
    index: Arc<HashMap<String, usize>>,
}

impl RowColumns {
    pub(crate) fn new(names: Vec<String>) -> Self {
        let index = Arc::new(index_columns(&names));
        Self {
            names: Arc::new(names),
            index,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn names(&self) -> &Arc<Vec<String>> {
        &self.names
    }
}

fn index_columns(names: &[String]) -> HashMap<String, usize> {
    // First occurrence wins for duplicated column names.
    let mut map = HashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        map.entry(name.clone()).or_insert(i);
    }
    map
}

/// Rows collected by `all`.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// The rows returned by the query
    pub results: Vec<CustomDbRow>,
    /// Column names shared by all rows
    column_names: Option<Arc<Vec<String>>>,
}

impl ResultSet {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            column_names: None,
        }
    }

    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_names = Some(column_names);
    }

    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    pub fn add_row(&mut self, row: CustomDbRow) {
        if self.column_names.is_none() {
            self.column_names = Some(Arc::clone(&row.column_names));
        }
        self.results.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl IntoIterator for ResultSet {
    type Item = CustomDbRow;
    type IntoIter = std::vec::IntoIter<CustomDbRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// Value side of a [`RowMap`] entry.
#[derive(Debug, Clone)]
pub enum MappedRow {
    /// The second column of a two-column result; `Null` when there is only one column.
    Value(RowValues),
    /// The whole row, for results wider than two columns.
    Row(CustomDbRow),
}

/// Rows keyed by the text of their first column. A later row replaces an earlier one with
/// the same key.
pub type RowMap = BTreeMap<String, MappedRow>;

impl ResultSet {
    /// Key every row by its first column.
    #[must_use]
    pub fn into_map(self) -> RowMap {
        let width = self.column_names.as_ref().map_or(0, |names| names.len());
        let mut map = RowMap::new();
        for row in self.results {
            let Some(key) = row.get_by_index(0).map(map_key) else {
                continue;
            };
            let value = match width {
                0 | 1 => MappedRow::Value(RowValues::Null),
                2 => MappedRow::Value(row.get_by_index(1).cloned().unwrap_or(RowValues::Null)),
                _ => MappedRow::Row(row),
            };
            map.insert(key, value);
        }
        map
    }
}

fn map_key(value: &RowValues) -> String {
    match value {
        RowValues::Int(i) => i.to_string(),
        RowValues::Float(f) => f.to_string(),
        RowValues::Text(s) => s.clone(),
        RowValues::Bool(b) => b.to_string(),
        RowValues::Timestamp(ts) => ts.format("%F %T%.f").to_string(),
        RowValues::Null => "null".to_owned(),
        RowValues::JSON(json) => json.to_string(),
        RowValues::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Outcome of `run`: the last inserted rowid and the number of rows changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    pub last_id: i64,
    pub changes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_columns_resolve_by_name() {
        let columns = RowColumns::new(vec!["id".into(), "txt".into(), "id".into()]);
        let row = CustomDbRow::with_shared(
            &columns,
            vec![RowValues::Int(1), RowValues::Text("a".into()), RowValues::Int(9)],
        );
        assert_eq!(row.get("id"), Some(&RowValues::Int(1)));
        assert_eq!(row.get("txt").and_then(RowValues::as_text), Some("a"));
        assert_eq!(row.get_by_index(2), Some(&RowValues::Int(9)));
        assert!(row.get("missing").is_none());
    }

    fn result_set(columns: &[&str], rows: Vec<Vec<RowValues>>) -> ResultSet {
        let columns = RowColumns::new(columns.iter().map(|c| (*c).to_owned()).collect());
        let mut set = ResultSet::with_capacity(rows.len());
        set.set_column_names(Arc::clone(columns.names()));
        for values in rows {
            set.add_row(CustomDbRow::with_shared(&columns, values));
        }
        set
    }

    #[test]
    fn two_columns_map_key_to_value() {
        let map = result_set(
            &["id", "txt"],
            vec![
                vec![RowValues::Int(1), RowValues::Text("a".into())],
                vec![RowValues::Int(2), RowValues::Text("b".into())],
                vec![RowValues::Int(1), RowValues::Text("c".into())],
            ],
        )
        .into_map();
        assert_eq!(map.len(), 2);
        assert!(matches!(map.get("1"), Some(MappedRow::Value(RowValues::Text(t))) if t == "c"));
        assert!(matches!(map.get("2"), Some(MappedRow::Value(RowValues::Text(t))) if t == "b"));
    }

    #[test]
    fn wide_and_narrow_rows() {
        let wide = result_set(
            &["name", "a", "b"],
            vec![vec![RowValues::Text("x".into()), RowValues::Int(1), RowValues::Int(2)]],
        )
        .into_map();
        match wide.get("x") {
            Some(MappedRow::Row(row)) => assert_eq!(row.get("b"), Some(&RowValues::Int(2))),
            other => panic!("expected whole row, got {other:?}"),
        }

        let narrow = result_set(&["name"], vec![vec![RowValues::Text("y".into())]]).into_map();
        assert!(matches!(narrow.get("y"), Some(MappedRow::Value(RowValues::Null))));
    }
}
