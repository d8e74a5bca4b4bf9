//! Statically declared schemas and bulk insert requests.

use crate::error::{TetherError, TetherResult};
use crate::models::values::Value;

use std::collections::HashSet;

/// Expected kind of a column, used to reject obviously wrong values early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnKind {
    /// Anything; conversion is left to the server
    #[default]
    Any,
    /// Text-like column; every value is accepted
    Text,
    /// Integer column
    Integer,
    /// Floating point or numeric column
    Float,
    /// Boolean column
    Boolean,
    /// UUID column
    Uuid,
    /// Timestamp column
    Timestamp,
}

impl ColumnKind {
    /// Check whether a value can be sent to a column of this kind.
    ///
    /// Text and NULL are always accepted; the server has the final say.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any | Self::Text, _) => true,
            (_, Value::Null | Value::Text(_)) => true,
            (Self::Integer, Value::Int(_)) => true,
            (Self::Float, Value::Int(_) | Value::Float(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Uuid, Value::Uuid(_)) => true,
            (Self::Timestamp, Value::Timestamp(_)) => true,
            _ => false,
        }
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Expected kind
    pub kind: ColumnKind,
}

impl ColumnDef {
    /// Create a typed column.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self { name: name.into(), kind }
    }

    /// Create a column with no declared kind.
    pub fn untyped(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Any)
    }
}

/// Target table and its ordered columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name, optionally schema-qualified (`schema.table`)
    pub table: String,
    /// Ordered columns
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Create a schema.
    pub fn new(table: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self { table: table.into(), columns }
    }

    /// Create a schema from bare column names.
    pub fn untyped<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(table, columns.into_iter().map(ColumnDef::untyped).collect())
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Validate names: non-empty table, at least one column, no duplicates.
    pub fn validate(&self) -> TetherResult<()> {
        if self.table.trim().is_empty() || self.table.split('.').any(str::is_empty) {
            return Err(TetherError::validation(format!("Invalid table name '{}'", self.table)));
        }
        if self.columns.is_empty() {
            return Err(TetherError::validation("At least one column is required"));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(TetherError::validation("Column names must not be empty"));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(TetherError::validation(format!(
                    "Duplicate column '{}'",
                    column.name
                )));
            }
        }
        Ok(())
    }

    /// `COPY ... FROM STDIN` statement for this schema.
    pub fn copy_statement(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        format!("COPY {} ({}) FROM STDIN", quote_qualified(&self.table), columns)
    }
}

/// Quote a single identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name part by part.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_identifier).collect::<Vec<_>>().join(".")
}

/// A type that knows its own column layout.
///
/// ```
/// use tether_core::models::{ColumnDef, ColumnKind, Record, Value};
///
/// struct Contact {
///     id: i64,
///     name: String,
/// }
///
/// impl Record for Contact {
///     fn columns() -> Vec<ColumnDef> {
///         vec![
///             ColumnDef::new("id", ColumnKind::Integer),
///             ColumnDef::new("name", ColumnKind::Text),
///         ]
///     }
///
///     fn values(&self) -> Vec<Value> {
///         vec![self.id.into(), self.name.clone().into()]
///     }
/// }
/// ```
pub trait Record {
    /// Ordered column descriptors.
    fn columns() -> Vec<ColumnDef>;
    /// Values in column order.
    fn values(&self) -> Vec<Value>;
}

/// Rows to load into one table in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkInsertRequest {
    /// Target table and columns
    pub schema: TableSchema,
    /// Rows in load order, each aligned to the schema's columns
    pub rows: Vec<Vec<Value>>,
}

impl BulkInsertRequest {
    /// Create a request from a schema and rows.
    pub fn new(schema: TableSchema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    /// Create a request of text values over bare column names.
    pub fn from_text_rows<I, S>(
        table: impl Into<String>,
        columns: I,
        rows: Vec<Vec<String>>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(Value::Text).collect())
            .collect();
        Self::new(TableSchema::untyped(table, columns), rows)
    }

    /// Create a request from typed records.
    pub fn from_records<R: Record>(table: impl Into<String>, records: &[R]) -> Self {
        Self::new(
            TableSchema::new(table, R::columns()),
            records.iter().map(Record::values).collect(),
        )
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Validate the schema, every row's width and every value's kind.
    pub fn validate(&self) -> TetherResult<()> {
        self.schema.validate()?;
        let width = self.schema.columns.len();
        for (index, row) in self.rows.iter().enumerate() {
            if row.len() != width {
                return Err(TetherError::validation(format!(
                    "Row {index} has {} values but {width} columns were given",
                    row.len()
                )));
            }
            for (column, value) in self.schema.columns.iter().zip(row) {
                if !column.kind.accepts(value) {
                    return Err(TetherError::validation(format!(
                        "Row {index}: value {value:?} does not fit column '{}' ({:?})",
                        column.name, column.kind
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a committed bulk load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    /// Target table
    pub table: String,
    /// Rows written
    pub rows: u64,
    /// Wall-clock time of the load in milliseconds
    pub elapsed_ms: u64,
}
