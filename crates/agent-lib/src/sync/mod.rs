//! Synchronization with the control plane
//!
//! This module provides:
//! - A de-duplicating, rate-limiting work queue
//! - The AgentInfo store contract, with in-memory and Kubernetes backends
//! - Merging of fresh snapshots with the persisted AgentInfo
//! - The monitor running the learning, periodic and worker loops

mod agent_monitor;
mod kube_store;
mod merge;
mod queue;
mod store;


pub use agent_monitor::{
    AgentMonitor, AgentMonitorBuilder, MonitorConfig, SyncError, SyncOutcome,
};
pub use kube_store::{
    agentinfo_api_resource, from_dynamic, to_dynamic, KubeAgentInfoIndex, KubeAgentInfoStore,
};
pub use merge::{merge_agent_info, should_sync_on_learn};
pub use queue::RateLimitingQueue;
pub use store::{AgentInfoIndex, AgentInfoStore, MemoryAgentInfoStore, StoreError, StoreOp};
