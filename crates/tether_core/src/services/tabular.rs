//! CSV file helpers.
//!
//! Every record in a file must have the same number of fields.

use crate::error::{TetherError, TetherResult};

use std::path::Path;

/// Read all records from a CSV file.
///
/// When `include_header` is false the first record is dropped.
pub fn read_records(
    path: impl AsRef<Path>,
    include_header: bool,
) -> TetherResult<Vec<Vec<String>>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_path(path)
        .map_err(|e| TetherError::Csv {
            message: format!("Failed to open {}: {e}", path.display()),
            source: e,
        })?;

    let mut records = reader
        .records()
        .map(|record| -> TetherResult<Vec<String>> {
            Ok(record?.iter().map(String::from).collect())
        })
        .collect::<TetherResult<Vec<_>>>()?;

    if !include_header && !records.is_empty() {
        records.remove(0);
    }

    tracing::debug!(path = %path.display(), records = records.len(), "Read CSV records");
    Ok(records)
}

/// Values of the named column for every record after the header.
pub fn column_values(path: impl AsRef<Path>, column: &str) -> TetherResult<Vec<String>> {
    let path = path.as_ref();
    let records = read_records(path, true)?;

    let Some((header, rows)) = records.split_first() else {
        return Err(TetherError::validation(format!("File {} has no records", path.display())));
    };
    let index = header
        .iter()
        .position(|name| name == column)
        .ok_or_else(|| TetherError::validation(format!("Column {column} not found")))?;

    Ok(rows.iter().map(|row| row[index].clone()).collect())
}
