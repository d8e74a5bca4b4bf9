//! Untyped scalar values for bulk loading, plus UUID string helpers.

use crate::error::{TetherError, TetherResult};

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A scalar destined for a table column.
///
/// The server converts each value to the column type, so text is always a
/// valid choice.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Integer of any width
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text, converted by the server
    Text(String),
    /// UUID
    Uuid(Uuid),
    /// Timestamp with time zone
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Append this value in COPY text format.
    pub(crate) fn write_copy_text(&self, buf: &mut BytesMut) {
        match self {
            Self::Null => buf.put_slice(b"\\N"),
            Self::Bool(v) => buf.put_slice(if *v { &b"true"[..] } else { &b"false"[..] }),
            Self::Int(v) => buf.put_slice(v.to_string().as_bytes()),
            Self::Float(v) => {
                if v.is_nan() {
                    buf.put_slice(b"NaN");
                } else if v.is_infinite() {
                    buf.put_slice(if *v > 0.0 { &b"Infinity"[..] } else { &b"-Infinity"[..] });
                } else {
                    buf.put_slice(v.to_string().as_bytes());
                }
            }
            Self::Text(v) => escape_copy_text(v, buf),
            Self::Uuid(v) => buf.put_slice(v.hyphenated().to_string().as_bytes()),
            Self::Timestamp(v) => buf.put_slice(v.to_rfc3339().as_bytes()),
        }
    }
}

/// Escape text for a COPY text-format field.
fn escape_copy_text(text: &str, buf: &mut BytesMut) {
    for byte in text.bytes() {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\t' => buf.put_slice(b"\\t"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            other => buf.put_u8(other),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

// ========== UUID helpers ==========

/// Parse a UUID from a string.
pub fn parse_uuid(s: &str) -> TetherResult<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| TetherError::validation(format!("Failed to parse UUID '{s}': {e}")))
}

/// Parse every string into a UUID, failing on the first invalid one.
pub fn parse_uuids<S: AsRef<str>>(strings: &[S]) -> TetherResult<Vec<Uuid>> {
    strings.iter().map(|s| parse_uuid(s.as_ref())).collect()
}

/// Render a UUID, rejecting the nil UUID.
pub fn uuid_to_string(id: &Uuid) -> TetherResult<String> {
    if id.is_nil() {
        return Err(TetherError::validation("UUID is nil"));
    }
    Ok(id.to_string())
}

/// Render every UUID, rejecting the nil UUID.
pub fn uuids_to_strings(ids: &[Uuid]) -> TetherResult<Vec<String>> {
    ids.iter().map(uuid_to_string).collect()
}
