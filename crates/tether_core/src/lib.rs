//! Core library for tether, a managed PostgreSQL connection toolkit.
//!
//! This crate provides:
//!
//! - **error**: Error handling with the failing phase of every database call
//! - **models**: Configuration, load requests, result cells and comparison outcomes
//! - **services**: Connection manager and monitor, SSH tunnel, bulk loader, verifier
//! - **config**: Loading configuration from the environment or JSON
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;


pub use error::{Operation, TetherError, TetherResult};
pub use models::{
    BulkInsertRequest, Cell, ColumnDef, ColumnKind, ComparisonResult, ConnectionConfig,
    ConnectionState, Driver, LoadSummary, MismatchKind, MonitorConfig, ReconnectPolicy, Record,
    RowMismatch, TableSchema, TunnelConfig, Value,
};
pub use services::{
    BulkLoader, ClientGuard, ConnectionHandle, ConnectionManager, MemoryCursor, MismatchPolicy,
    MonitorState, Render, RowCursor, SshTunnel, Tunnel, Verifier, NULL_TEXT,
};
