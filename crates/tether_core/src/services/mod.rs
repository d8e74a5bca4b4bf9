//! Backend services for tether.
//!
//! This module contains all service layer abstractions:
//! - `connection` - Managed connection, handle snapshots, reconnects
//! - `monitor` - Background polling and reconnect loop
//! - `tunnel` - SSH tunnel with direct-tcpip forwarding
//! - `bulk` - Atomic bulk loads through COPY
//! - `verify` - Positional comparison of source rows and query results
//! - `tabular` - CSV file reading

pub mod bulk;
pub mod connection;
pub mod monitor;
pub mod tabular;
pub mod tunnel;
pub mod verify;

#[cfg(test)]
pub(crate) mod stalling_server;

pub use bulk::BulkLoader;
pub use connection::{ClientGuard, ConnectionHandle, ConnectionManager};
pub use monitor::MonitorState;
pub use tunnel::{SshTunnel, Tunnel};
pub use verify::{
    DefaultRenderer, MemoryCursor, MismatchPolicy, PgRowCursor, Render, RowCursor, Verifier,
    NULL_TEXT,
};
