//! Query results and rows.

use std::collections::HashMap;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use smallvec::SmallVec;

use super::error::{Notice, PgError, PgResult};
use super::protocol::ColumnDescription;
use super::types::PgValue;

/// Column descriptions shared by every row of one result.
pub type SharedColumns = Arc<Vec<ColumnDescription>>;

/// One decoded DataRow.
///
/// Values are stored inline for rows of up to 16 columns.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[PgValue; 16]>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: SmallVec<[PgValue; 16]>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    /// Value of the first column called `name`.
    pub fn get(&self, name: &str) -> Option<&PgValue> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&PgValue> {
        self.values.get(index)
    }

    /// Like [`Row::get`], but a missing column is an error.
    pub fn try_get(&self, name: &str) -> PgResult<&PgValue> {
        self.get(name)
            .ok_or_else(|| PgError::Decode(format!("no column named \"{}\"", name)))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `(column name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PgValue)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }
}

/// Serializes as a name → value map with one key per column. A repeated
/// column name (`SELECT 1, 2` gives two `?column?`) gets a `_<n>` suffix
/// from its second occurrence on.
impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (name, value) in self.iter() {
            let count = seen.entry(name).or_insert(0);
            *count += 1;
            if *count == 1 {
                map.serialize_entry(name, value)?;
            } else {
                map.serialize_entry(&format!("{}_{}", name, count), value)?;
            }
        }
        map.end()
    }
}

/// Conversion from a decoded row into a caller-defined record type.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> PgResult<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> PgResult<Self> {
        Ok(row.clone())
    }
}

/// Result of one simple query.
#[derive(Debug, Clone)]
pub struct QueryResult<R = Row> {
    pub rows: Vec<R>,
    /// Always `rows.len()`.
    pub row_count: usize,
    /// Empty unless the statement produced a RowDescription.
    pub columns: SharedColumns,
    /// CommandComplete tag, e.g. `INSERT 0 5`. `None` for an empty query.
    pub command_tag: Option<String>,
    /// NoticeResponses received while the query ran.
    pub notices: Vec<Notice>,
}

impl<R> QueryResult<R> {
    pub(crate) fn new() -> Self {
        Self {
            rows: Vec::new(),
            row_count: 0,
            columns: Arc::new(Vec::new()),
            command_tag: None,
            notices: Vec::new(),
        }
    }

    /// Rows affected, parsed from the command tag.
    pub fn rows_affected(&self) -> u64 {
        self.command_tag
            .as_deref()
            .map(parse_rows_affected)
            .unwrap_or(0)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

impl QueryResult<Row> {
    /// Convert every row with `T::from_row`, keeping the metadata.
    pub fn into_typed<T: FromRow>(self) -> PgResult<QueryResult<T>> {
        let rows = self
            .rows
            .iter()
            .map(T::from_row)
            .collect::<PgResult<Vec<T>>>()?;

        Ok(QueryResult {
            row_count: rows.len(),
            rows,
            columns: self.columns,
            command_tag: self.command_tag,
            notices: self.notices,
        })
    }
}

/// Parse rows affected from a PostgreSQL command tag.
fn parse_rows_affected(tag: &str) -> u64 {
    // Common formats:
    // - "INSERT 0 5" -> 5 rows
    // - "UPDATE 3" -> 3 rows
    // - "COPY 7", "MOVE 1", "FETCH 2", "MERGE 4"
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["COPY", n]
        | ["MOVE", n]
        | ["FETCH", n]
        | ["MERGE", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}
