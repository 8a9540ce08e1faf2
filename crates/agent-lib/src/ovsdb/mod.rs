//! Switch database cache mirror
//!
//! This module provides:
//! - Decoding of the database's JSON value notation
//! - A locked in-memory replica of the Open_vSwitch, Bridge, Port and
//!   Interface tables, kept current from table-update notifications
//! - Endpoint add/update/delete events derived from interface rows

mod cache;
mod endpoint;
mod monitor;
mod value;

#[cfg(test)]
mod tests;

pub use cache::{OvsdbCache, Row, RowUpdate, Table, TableUpdates};
pub use endpoint::{
    collect_endpoints, diff_endpoints, Endpoint, EndpointEvent, EndpointEventHandler,
};
pub use monitor::OvsdbMonitor;
pub use value::{Atom, Datum, Refs};

use thiserror::Error;

pub const OPEN_VSWITCH_TABLE: &str = "Open_vSwitch";
pub const BRIDGE_TABLE: &str = "Bridge";
pub const PORT_TABLE: &str = "Port";
pub const INTERFACE_TABLE: &str = "Interface";

/// External id carrying the workload-declared mac of an interface
pub const LOCAL_ENDPOINT_IDENTITY: &str = "attached-mac";
/// External id carrying the workload-declared ipv4 of an interface
pub const LOCAL_ENDPOINT_IPV4: &str = "attached-ipv4";

/// Errors reading the replicated tables
#[derive(Debug, Error)]
pub enum OvsdbError {
    #[error("invalid database notation: {0}")]
    InvalidNotation(String),

    #[error("{table} {uuid} not found in cache")]
    RowNotFound { table: String, uuid: String },

    #[error("{table} row has no column {column}")]
    MissingColumn { table: String, column: String },

    #[error("{table} column {column} is not a {expected}")]
    InvalidColumn {
        table: String,
        column: String,
        expected: &'static str,
    },

    #[error("table {0} is empty")]
    EmptyTable(String),
}

/// Render trunk vlan ids the way AgentInfo stores them: `"10,20,30"`
pub fn join_trunks(trunks: &[i64]) -> String {
    trunks
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
