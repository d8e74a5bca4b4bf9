//! Positional comparison of expected rows against a query result.
//!
//! Result cells are decoded into [`Cell`]s, rendered to strings with a
//! [`Render`] implementation and compared literally with the source rows at
//! the same index. Ordering comes from the query's `ORDER BY`.

use crate::error::{Operation, TetherError, TetherResult};
use crate::models::{Cell, ComparisonResult, MismatchKind, RowMismatch};
use crate::services::connection::ConnectionHandle;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::fmt::Write;
use std::pin::Pin;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, RowStream};
use uuid::Uuid;

/// Forward-only source of decoded result rows.
#[async_trait]
pub trait RowCursor: Send {
    /// Next row, or `None` when exhausted.
    async fn next_row(&mut self) -> TetherResult<Option<Vec<Cell>>>;
}

/// Cursor over rows already in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursor {
    rows: VecDeque<Vec<Cell>>,
}

impl MemoryCursor {
    /// Create a cursor over the given rows.
    pub fn new(rows: Vec<Vec<Cell>>) -> Self {
        Self { rows: rows.into() }
    }

    /// Create a cursor of text cells.
    pub fn from_text<S: AsRef<str>>(rows: &[Vec<S>]) -> Self {
        Self::new(
            rows.iter()
                .map(|row| row.iter().map(|v| Cell::from(v.as_ref())).collect())
                .collect(),
        )
    }
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn next_row(&mut self) -> TetherResult<Option<Vec<Cell>>> {
        Ok(self.rows.pop_front())
    }
}

/// Cursor over a tokio-postgres row stream.
pub struct PgRowCursor {
    stream: Pin<Box<RowStream>>,
    row: usize,
}

impl PgRowCursor {
    /// Wrap a row stream.
    pub fn new(stream: RowStream) -> Self {
        Self { stream: Box::pin(stream), row: 0 }
    }
}

#[async_trait]
impl RowCursor for PgRowCursor {
    async fn next_row(&mut self) -> TetherResult<Option<Vec<Cell>>> {
        let row = match self.stream.next().await {
            None => return Ok(None),
            Some(Err(e)) => {
                return Err(TetherError::scan_with_source(
                    self.row,
                    format!("Failed to read row: {e}"),
                    e,
                ))
            }
            Some(Ok(row)) => row,
        };
        let cells = (0..row.len())
            .map(|column| decode_cell(&row, column, self.row))
            .collect::<TetherResult<Vec<_>>>()?;
        self.row += 1;
        Ok(Some(cells))
    }
}

/// Decode one column by its PostgreSQL type name.
fn decode_cell(row: &Row, column: usize, row_index: usize) -> TetherResult<Cell> {
    fn get<'a, T>(row: &'a Row, column: usize, row_index: usize) -> TetherResult<Option<T>>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(column).map_err(|e| {
            TetherError::scan_with_source(
                row_index,
                format!("Failed to decode column {column}: {e}"),
                e,
            )
        })
    }

    let type_name = row.columns()[column].type_().name();
    let cell = match type_name {
        "bool" => get::<bool>(row, column, row_index)?.map(Cell::Bool),
        "int2" => get::<i16>(row, column, row_index)?.map(|v| Cell::Int(v.into())),
        "int4" => get::<i32>(row, column, row_index)?.map(|v| Cell::Int(v.into())),
        "int8" => get::<i64>(row, column, row_index)?.map(Cell::Int),
        "oid" => get::<u32>(row, column, row_index)?.map(|v| Cell::Int(v.into())),
        "float4" => get::<f32>(row, column, row_index)?.map(Cell::Real),
        "float8" => get::<f64>(row, column, row_index)?.map(Cell::Float),
        "text" | "varchar" | "bpchar" | "name" => {
            get::<String>(row, column, row_index)?.map(Cell::Text)
        }
        "uuid" => get::<Uuid>(row, column, row_index)?.map(Cell::Uuid),
        "timestamp" => get::<NaiveDateTime>(row, column, row_index)?.map(Cell::Timestamp),
        "timestamptz" => get::<DateTime<Utc>>(row, column, row_index)?.map(Cell::TimestampTz),
        "date" => get::<NaiveDate>(row, column, row_index)?.map(Cell::Date),
        "time" => get::<NaiveTime>(row, column, row_index)?.map(Cell::Time),
        "json" | "jsonb" => get::<serde_json::Value>(row, column, row_index)?.map(Cell::Json),
        "bytea" => get::<Vec<u8>>(row, column, row_index)?.map(Cell::Bytes),
        other => {
            let name = row.columns()[column].name();
            return Err(TetherError::scan(
                row_index,
                format!(
                    "Unsupported type '{other}' in column '{name}'; cast it to ::text in the query"
                ),
            ));
        }
    };
    Ok(cell.unwrap_or(Cell::Null))
}

/// Converts a cell to the string compared against the source.
pub trait Render {
    /// Render one cell.
    fn render(&self, cell: &Cell) -> String;
}

impl<F> Render for F
where
    F: Fn(&Cell) -> String,
{
    fn render(&self, cell: &Cell) -> String {
        self(cell)
    }
}

/// How [`DefaultRenderer`] renders NULL.
///
/// Distinct from the empty string, so `""` in a source row never matches NULL.
/// A custom [`Render`] can map NULL to `""` where that is wanted.
pub const NULL_TEXT: &str = "<nil>";

/// Literal rendering with no normalization.
///
/// NULL renders as [`NULL_TEXT`], bytes as `\x`-prefixed hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRenderer;

impl Render for DefaultRenderer {
    fn render(&self, cell: &Cell) -> String {
        match cell {
            Cell::Null => NULL_TEXT.to_string(),
            Cell::Bool(v) => v.to_string(),
            Cell::Int(v) => v.to_string(),
            Cell::Real(v) => v.to_string(),
            Cell::Float(v) => v.to_string(),
            Cell::Text(v) => v.clone(),
            Cell::Uuid(v) => v.hyphenated().to_string(),
            Cell::Timestamp(v) => v.to_string(),
            Cell::TimestampTz(v) => v.to_string(),
            Cell::Date(v) => v.to_string(),
            Cell::Time(v) => v.to_string(),
            Cell::Json(v) => v.to_string(),
            Cell::Bytes(v) => {
                let mut out = String::with_capacity(2 + v.len() * 2);
                out.push_str("\\x");
                for byte in v {
                    let _ = write!(out, "{byte:02x}");
                }
                out
            }
        }
    }
}

/// How many discrepancies a comparison collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Stop at the first discrepancy
    #[default]
    FailFast,
    /// Read everything and report every discrepancy
    Aggregate,
}

/// Compares source rows with result rows by position.
#[derive(Debug, Clone, Default)]
pub struct Verifier<R = DefaultRenderer> {
    renderer: R,
    policy: MismatchPolicy,
}

impl Verifier {
    /// Create a fail-fast verifier with default rendering.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: Render> Verifier<R> {
    /// Create a fail-fast verifier with custom rendering.
    pub fn with_renderer(renderer: R) -> Self {
        Self { renderer, policy: MismatchPolicy::FailFast }
    }

    /// Set the mismatch policy.
    pub fn with_policy(mut self, policy: MismatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Get the mismatch policy.
    pub fn policy(&self) -> MismatchPolicy {
        self.policy
    }

    /// Compare source rows with everything the cursor yields.
    pub async fn compare<C>(
        &self,
        source: &[Vec<String>],
        cursor: &mut C,
    ) -> TetherResult<ComparisonResult>
    where
        C: RowCursor + ?Sized,
    {
        let mut mismatches = Vec::new();
        let mut index = 0;

        loop {
            let next = cursor.next_row().await?;
            match (source.get(index), next) {
                (None, None) => break,
                (Some(expected), Some(cells)) => {
                    let rendered: Vec<String> =
                        cells.iter().map(|cell| self.renderer.render(cell)).collect();
                    let columns = differing_columns(expected, &rendered);
                    if !columns.is_empty() {
                        mismatches.push(RowMismatch {
                            index,
                            kind: MismatchKind::Values {
                                source: expected.clone(),
                                result: rendered,
                                columns,
                            },
                        });
                    }
                }
                (Some(_), None) => {
                    let remaining = match self.policy {
                        MismatchPolicy::FailFast => &source[index..=index],
                        MismatchPolicy::Aggregate => &source[index..],
                    };
                    mismatches.extend(remaining.iter().enumerate().map(|(offset, row)| {
                        RowMismatch {
                            index: index + offset,
                            kind: MismatchKind::MissingResultRow { source: row.clone() },
                        }
                    }));
                    break;
                }
                (None, Some(cells)) => {
                    mismatches.push(RowMismatch {
                        index,
                        kind: MismatchKind::UnexpectedResultRow {
                            result: cells.iter().map(|cell| self.renderer.render(cell)).collect(),
                        },
                    });
                }
            }

            if self.policy == MismatchPolicy::FailFast && !mismatches.is_empty() {
                break;
            }
            index += 1;
        }

        if mismatches.is_empty() {
            tracing::debug!(rows = source.len(), "Rows match");
            Ok(ComparisonResult::Match { rows: source.len() })
        } else {
            tracing::debug!(
                mismatches = mismatches.len(),
                first_index = mismatches[0].index,
                "Rows differ"
            );
            Ok(ComparisonResult::Mismatch(mismatches))
        }
    }

    /// Run a query on the handle's connection and compare its rows.
    ///
    /// Waiting for the connection, running the query and reading every row
    /// share the handle's statement deadline.
    pub async fn compare_query(
        &self,
        handle: &ConnectionHandle,
        source: &[Vec<String>],
        sql: &str,
    ) -> TetherResult<ComparisonResult> {
        let deadline = handle.deadline();
        let client = deadline.bound(Operation::Scan, handle.lock()).await??;
        let query = client.query_raw(sql, std::iter::empty::<&(dyn ToSql + Sync)>());
        let stream = deadline.bound(Operation::Scan, query).await?.map_err(TetherError::from)?;
        let mut cursor = PgRowCursor::new(stream);
        let result = deadline.bound(Operation::Scan, self.compare(source, &mut cursor)).await?;
        drop(client);
        result
    }
}

/// Indices where the rendered row differs, including columns only one side has.
fn differing_columns(expected: &[String], actual: &[String]) -> Vec<usize> {
    (0..expected.len().max(actual.len()))
        .filter(|&i| expected.get(i) != actual.get(i))
        .collect()
}
