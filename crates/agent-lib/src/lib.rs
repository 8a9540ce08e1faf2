//! Agent library for publishing per-node virtual switch state
//!
//! This crate provides the core functionality for:
//! - Mirroring the switch database tables and deriving endpoint events
//! - Learning port addresses into the IP cache
//! - Building AgentInfo snapshots and syncing them with the control plane
//! - Health checks and observability

pub mod builder;
pub mod health;
pub mod ipcache;
pub mod models;
pub mod observability;
pub mod ovsdb;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ipcache::{IpCache, LearnedAddresses};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
