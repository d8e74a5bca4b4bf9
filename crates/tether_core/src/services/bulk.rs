//! Transactional bulk loading through `COPY ... FROM STDIN`.
//!
//! A load is all or nothing. Rows are streamed in input order inside one
//! transaction, and any failure drops the transaction uncommitted so the
//! server rolls it back.

use crate::error::{Operation, TetherError, TetherResult};
use crate::models::{BulkInsertRequest, LoadSummary, Record, Value};
use crate::services::connection::ConnectionHandle;
use crate::services::tabular;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::SinkExt;
use std::path::Path;
use std::pin::pin;
use std::time::Instant;

/// Service for atomic bulk inserts.
pub struct BulkLoader;

impl BulkLoader {
    /// Load every row of the request, or none of them.
    pub async fn load(
        handle: &ConnectionHandle,
        request: &BulkInsertRequest,
    ) -> TetherResult<LoadSummary> {
        request.validate()?;
        let start = Instant::now();
        let table = request.schema.table.as_str();
        let generation = handle.generation();

        tracing::debug!(table, rows = request.len(), generation, "Starting bulk load");

        // One deadline covers every step; on expiry the transaction is dropped
        let deadline = handle.deadline();

        // Held until commit so nothing else runs on this connection mid-load
        let mut client = deadline.bound(Operation::Begin, handle.lock()).await??;
        let txn = deadline
            .bound(Operation::Begin, client.transaction())
            .await?
            .map_err(|e| TetherError::transaction(Operation::Begin, e))?;

        let copied = {
            let statement = request.schema.copy_statement();
            let sink = deadline
                .bound(Operation::Prepare, txn.copy_in::<_, Bytes>(statement.as_str()))
                .await?
                .map_err(|e| TetherError::transaction(Operation::Prepare, e))?;
            let mut sink = pin!(sink);

            let mut buf = BytesMut::new();
            for (row, values) in request.rows.iter().enumerate() {
                encode_row(values, &mut buf);
                deadline
                    .bound(Operation::Exec { row }, sink.feed(buf.split().freeze()))
                    .await?
                    .map_err(|e| TetherError::transaction(Operation::Exec { row }, e))?;
            }

            deadline
                .bound(Operation::Close, sink.as_mut().finish())
                .await?
                .map_err(|e| TetherError::transaction(Operation::Close, e))?
        };

        if copied != request.len() as u64 {
            return Err(TetherError::transaction_aborted(
                Operation::Close,
                format!("Copied {copied} rows but {} were sent", request.len()),
            ));
        }

        if handle.is_retired() {
            return Err(TetherError::transaction_aborted(
                Operation::Commit,
                "Connection was replaced during the load",
            ));
        }

        deadline
            .bound(Operation::Commit, txn.commit())
            .await?
            .map_err(|e| TetherError::transaction(Operation::Commit, e))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(table, rows = copied, elapsed_ms, generation, "Bulk load committed");

        Ok(LoadSummary { table: table.to_string(), rows: copied, elapsed_ms })
    }

    /// Load typed records using their declared columns.
    pub async fn load_records<R: Record>(
        handle: &ConnectionHandle,
        table: &str,
        records: &[R],
    ) -> TetherResult<LoadSummary> {
        Self::load(handle, &BulkInsertRequest::from_records(table, records)).await
    }

    /// Load a CSV file, skipping its header row.
    pub async fn load_csv<S: AsRef<str>>(
        handle: &ConnectionHandle,
        path: impl AsRef<Path>,
        table: &str,
        columns: &[S],
    ) -> TetherResult<LoadSummary> {
        let rows = tabular::read_records(path, false)?;
        let request = BulkInsertRequest::from_text_rows(
            table,
            columns.iter().map(|c| c.as_ref().to_string()),
            rows,
        );
        Self::load(handle, &request).await
    }
}

/// Append one row in COPY text format.
fn encode_row(values: &[Value], buf: &mut BytesMut) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        value.write_copy_text(buf);
    }
    buf.put_u8(b'\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection::ConnectionManager;
    use crate::services::stalling_server::StallingServer;
    use std::time::Duration;

    fn encoded(values: &[Value]) -> String {
        let mut buf = BytesMut::new();
        encode_row(values, &mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_encode_row_is_tab_separated() {
        let row = vec![Value::from("1"), Value::from("Alice"), Value::from("555-0100")];
        assert_eq!(encoded(&row), "1\tAlice\t555-0100\n");
    }

    #[test]
    fn test_encode_row_escapes_separators() {
        let row = vec![Value::from(2), Value::from("Bob\tthe\nbuilder"), Value::Null];
        assert_eq!(encoded(&row), "2\tBob\\tthe\\nbuilder\t\\N\n");
    }

    #[test]
    fn test_encode_rows_are_appended_in_order() {
        let mut buf = BytesMut::new();
        encode_row(&[Value::from(1)], &mut buf);
        let first = buf.split().freeze();
        encode_row(&[Value::from(2)], &mut buf);
        let second = buf.split().freeze();
        assert_eq!(&first[..], b"1\n");
        assert_eq!(&second[..], b"2\n");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_load_on_stalled_server_times_out() {
        // Answers the handshake and the connect-time ping, then goes quiet
        let server = StallingServer::start(1).await;
        let mut config = server.config();
        config.options.statement_timeout_secs = 1;
        let manager = ConnectionManager::new(config).unwrap();
        let handle = manager.connect().await.unwrap();

        let request = BulkInsertRequest::from_text_rows(
            "contacts",
            ["id", "name"],
            vec![vec!["1".to_string(), "Alice".to_string()]],
        );
        let started = Instant::now();
        let err = BulkLoader::load(&handle, &request).await.unwrap_err();

        assert!(matches!(err, TetherError::Timeout { .. }), "{err}");
        assert_eq!(err.operation(), Some(Operation::Begin));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
