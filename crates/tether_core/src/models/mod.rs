//! Data models for tether.
//!
//! This module contains all core data structures:
//! - `connection` - ConnectionConfig, TunnelConfig, MonitorConfig, Driver
//! - `values` - Value scalars for loading, UUID helpers
//! - `record` - TableSchema, Record, BulkInsertRequest
//! - `comparison` - Cell, ComparisonResult, RowMismatch

pub mod comparison;
pub mod connection;
pub mod record;
pub mod values;

pub use comparison::{Cell, ComparisonResult, MismatchKind, RowMismatch};
pub use connection::{
    ConnectionConfig, ConnectionOptions, ConnectionState, Driver, MonitorConfig, ReconnectPolicy,
    TunnelConfig, TunnelCredential, TUNNEL_PORT_PLACEHOLDER,
};
pub use record::{BulkInsertRequest, ColumnDef, ColumnKind, LoadSummary, Record, TableSchema};
pub use values::Value;
