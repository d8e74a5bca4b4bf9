//! Result cells and comparison outcomes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::fmt;
use uuid::Uuid;

/// A decoded value from a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// SQL NULL
    Null,
    /// bool
    Bool(bool),
    /// int2, int4, int8, oid
    Int(i64),
    /// float4
    Real(f32),
    /// float8
    Float(f64),
    /// text, varchar, bpchar, name
    Text(String),
    /// uuid
    Uuid(Uuid),
    /// timestamp
    Timestamp(NaiveDateTime),
    /// timestamptz
    TimestampTz(DateTime<Utc>),
    /// date
    Date(NaiveDate),
    /// time
    Time(NaiveTime),
    /// json, jsonb
    Json(serde_json::Value),
    /// bytea
    Bytes(Vec<u8>),
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// What went wrong at one row index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchKind {
    /// Both sides have the row but some values differ
    Values {
        /// Source values
        source: Vec<String>,
        /// Rendered result values
        result: Vec<String>,
        /// Indices of the differing columns
        columns: Vec<usize>,
    },
    /// The source has a row the result set lacks
    MissingResultRow {
        /// Source values
        source: Vec<String>,
    },
    /// The result set has a row the source lacks
    UnexpectedResultRow {
        /// Rendered result values
        result: Vec<String>,
    },
}

/// A discrepancy at a positional row index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMismatch {
    /// Zero-based row index shared by source and result ordering
    pub index: usize,
    /// Discrepancy details
    pub kind: MismatchKind,
}

impl RowMismatch {
    /// Source values at this index, if the source has the row.
    pub fn source(&self) -> Option<&[String]> {
        match &self.kind {
            MismatchKind::Values { source, .. } | MismatchKind::MissingResultRow { source } => {
                Some(source)
            }
            MismatchKind::UnexpectedResultRow { .. } => None,
        }
    }

    /// Rendered result values at this index, if the result set has the row.
    pub fn result(&self) -> Option<&[String]> {
        match &self.kind {
            MismatchKind::Values { result, .. } | MismatchKind::UnexpectedResultRow { result } => {
                Some(result)
            }
            MismatchKind::MissingResultRow { .. } => None,
        }
    }
}

impl fmt::Display for RowMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::Values { source, result, columns } => write!(
                f,
                "rows are not equal at index {}: source {:?} vs result {:?} (columns {:?})",
                self.index, source, result, columns
            ),
            MismatchKind::MissingResultRow { source } => write!(
                f,
                "result set ends before index {}: source {:?} has no counterpart",
                self.index, source
            ),
            MismatchKind::UnexpectedResultRow { result } => write!(
                f,
                "result set has extra row at index {}: {:?}",
                self.index, result
            ),
        }
    }
}

/// Outcome of a positional comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonResult {
    /// Same length and identical rendering at every index
    Match {
        /// Number of rows compared
        rows: usize,
    },
    /// At least one discrepancy, in index order
    Mismatch(Vec<RowMismatch>),
}

impl ComparisonResult {
    /// Check if the sequences matched.
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }

    /// All discrepancies (empty on a match).
    pub fn mismatches(&self) -> &[RowMismatch] {
        match self {
            Self::Match { .. } => &[],
            Self::Mismatch(mismatches) => mismatches,
        }
    }

    /// The first discrepancy.
    pub fn first_mismatch(&self) -> Option<&RowMismatch> {
        self.mismatches().first()
    }
}

impl fmt::Display for ComparisonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match { rows } => write!(f, "{rows} rows match"),
            Self::Mismatch(mismatches) => {
                write!(f, "{} mismatch(es)", mismatches.len())?;
                for mismatch in mismatches {
                    write!(f, "\n  {mismatch}")?;
                }
                Ok(())
            }
        }
    }
}
