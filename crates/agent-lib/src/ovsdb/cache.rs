//! In-memory replica of the monitored switch database tables

use super::value::Datum;
use super::OvsdbError;
use serde_json::Value;
use std::collections::BTreeMap;

/// A database row: column name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: BTreeMap<String, Datum>,
}

impl Row {
    /// Decode a row object (`{"column": <value>, ..}`)
    pub fn from_json(value: &Value) -> Result<Self, OvsdbError> {
        let object = value
            .as_object()
            .ok_or_else(|| OvsdbError::InvalidNotation(format!("row {}", value)))?;

        let mut columns = BTreeMap::new();
        for (name, raw) in object {
            columns.insert(name.clone(), Datum::from_json(raw)?);
        }
        Ok(Self { columns })
    }

    /// Build a row from already decoded columns
    pub fn from_columns(columns: impl IntoIterator<Item = (String, Datum)>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.columns.get(column)
    }

    /// Required string column
    pub fn string(&self, table: &str, column: &str) -> Result<&str, OvsdbError> {
        let datum = self.get(column).ok_or_else(|| OvsdbError::MissingColumn {
            table: table.to_string(),
            column: column.to_string(),
        })?;
        datum.as_str().ok_or_else(|| OvsdbError::InvalidColumn {
            table: table.to_string(),
            column: column.to_string(),
            expected: "string",
        })
    }

    /// Optional string column; unset or ill-typed reads as `None`
    pub fn optional_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Datum::as_str)
    }

    /// Optional integer column; unset or ill-typed reads as `None`
    pub fn optional_integer(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Datum::as_integer)
    }

    /// Integer members of a set column
    pub fn integers(&self, column: &str) -> Vec<i64> {
        self.get(column)
            .map(|datum| datum.atoms().into_iter().filter_map(|a| a.as_integer()).collect())
            .unwrap_or_default()
    }

    /// String map column. An absent column is an empty map.
    pub fn string_map(
        &self,
        table: &str,
        column: &str,
    ) -> Result<BTreeMap<String, String>, OvsdbError> {
        match self.get(column) {
            None => Ok(BTreeMap::new()),
            Some(datum) => datum.to_string_map().ok_or_else(|| OvsdbError::InvalidColumn {
                table: table.to_string(),
                column: column.to_string(),
                expected: "map",
            }),
        }
    }

    /// Row references held by a reference column
    pub fn refs(&self, column: &str) -> Vec<&str> {
        self.get(column)
            .map(|datum| datum.refs().flatten())
            .unwrap_or_default()
    }
}

/// Rows of one table keyed by row uuid
pub type Table = BTreeMap<String, Row>;

/// Change to one row: the row before and after
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    pub old: Option<Row>,
    pub new: Option<Row>,
}

/// A change notification covering any number of tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableUpdates {
    pub tables: BTreeMap<String, BTreeMap<String, RowUpdate>>,
}

impl TableUpdates {
    /// Decode `{"<table>": {"<uuid>": {"old": <row>, "new": <row>}}}`
    pub fn from_json(value: &Value) -> Result<Self, OvsdbError> {
        let tables_json = value
            .as_object()
            .ok_or_else(|| OvsdbError::InvalidNotation(format!("table-updates {}", value)))?;

        let mut tables = BTreeMap::new();
        for (table, rows_json) in tables_json {
            let rows_json = rows_json.as_object().ok_or_else(|| {
                OvsdbError::InvalidNotation(format!("table-update for {}", table))
            })?;

            let mut rows = BTreeMap::new();
            for (uuid, update) in rows_json {
                let old = match update.get("old") {
                    Some(row) => Some(Row::from_json(row)?),
                    None => None,
                };
                let new = match update.get("new") {
                    Some(row) => Some(Row::from_json(row)?),
                    None => None,
                };
                rows.insert(uuid.clone(), RowUpdate { old, new });
            }
            tables.insert(table.clone(), rows);
        }

        Ok(Self { tables })
    }

    /// Record an inserted or modified row
    pub fn upsert(&mut self, table: &str, uuid: &str, row: Row) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(uuid.to_string(), RowUpdate { old: None, new: Some(row) });
    }

    /// Record a deleted row
    pub fn delete(&mut self, table: &str, uuid: &str) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(uuid.to_string(), RowUpdate::default());
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|rows| rows.is_empty())
    }

    /// Whether any row of the given table changed
    pub fn touches(&self, table: &str) -> bool {
        self.tables.get(table).map(|rows| !rows.is_empty()).unwrap_or(false)
    }
}

impl TryFrom<&Value> for TableUpdates {
    type Error = OvsdbError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Self::from_json(value)
    }
}

/// Locally replicated tables
#[derive(Debug, Clone, Default)]
pub struct OvsdbCache {
    tables: BTreeMap<String, Table>,
}

impl OvsdbCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of a table, if any were ever replicated
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Look up a single row
    pub fn row(&self, table: &str, uuid: &str) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(uuid))
    }

    /// Like `row`, but a missing row is an error
    pub fn require_row(&self, table: &str, uuid: &str) -> Result<&Row, OvsdbError> {
        self.row(table, uuid).ok_or_else(|| OvsdbError::RowNotFound {
            table: table.to_string(),
            uuid: uuid.to_string(),
        })
    }

    /// Apply a change notification. A row with a `new` value replaces the
    /// cached row; a row without one is removed.
    pub fn apply(&mut self, updates: &TableUpdates) {
        for (table, rows) in &updates.tables {
            let cached = self.tables.entry(table.clone()).or_default();
            for (uuid, update) in rows {
                match &update.new {
                    Some(row) => {
                        cached.insert(uuid.clone(), row.clone());
                    }
                    None => {
                        cached.remove(uuid);
                    }
                }
            }
        }
    }

    /// Total number of cached rows
    pub fn row_count(&self) -> usize {
        self.tables.values().map(|rows| rows.len()).sum()
    }
}
