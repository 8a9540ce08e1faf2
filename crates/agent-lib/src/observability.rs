//! Observability infrastructure for the OVS agent
//!
//! Provides:
//! - Prometheus metrics (sync latency and outcomes, address learning, snapshot size, endpoint events)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for AgentInfo sync latency (in seconds)
const SYNC_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    sync_latency_seconds: Histogram,
    sync_success: IntCounter,
    sync_failures: IntCounter,
    sync_expected_races: IntCounter,
    addresses_learned: IntCounter,
    addresses_discarded: IntCounter,
    ip_cache_ports: IntGauge,
    bridges: IntGauge,
    interfaces: IntGauge,
    endpoint_events: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            sync_latency_seconds: register_histogram!(
                "ovs_agent_sync_latency_seconds",
                "Time spent building, merging and persisting AgentInfo",
                SYNC_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sync_latency_seconds"),

            sync_success: register_int_counter!(
                "ovs_agent_sync_success_total",
                "Total number of successful AgentInfo syncs"
            )
            .expect("Failed to register sync_success"),

            sync_failures: register_int_counter!(
                "ovs_agent_sync_failures_total",
                "Total number of failed AgentInfo syncs"
            )
            .expect("Failed to register sync_failures"),

            sync_expected_races: register_int_counter!(
                "ovs_agent_sync_expected_races_total",
                "Total number of failed AgentInfo syncs caused by an update conflict or a create racing another writer"
            )
            .expect("Failed to register sync_expected_races"),

            addresses_learned: register_int_counter!(
                "ovs_agent_addresses_learned_total",
                "Total number of learned addresses admitted to the IP cache"
            )
            .expect("Failed to register addresses_learned"),

            addresses_discarded: register_int_counter!(
                "ovs_agent_addresses_discarded_total",
                "Total number of learned addresses rejected as non global unicast"
            )
            .expect("Failed to register addresses_discarded"),

            ip_cache_ports: register_int_gauge!(
                "ovs_agent_ip_cache_ports",
                "Number of ports with addresses waiting to be persisted"
            )
            .expect("Failed to register ip_cache_ports"),

            bridges: register_int_gauge!(
                "ovs_agent_bridges",
                "Number of bridges in the last AgentInfo snapshot"
            )
            .expect("Failed to register bridges"),

            interfaces: register_int_gauge!(
                "ovs_agent_interfaces",
                "Number of interfaces in the last AgentInfo snapshot"
            )
            .expect("Failed to register interfaces"),

            endpoint_events: register_int_counter_vec!(
                "ovs_agent_endpoint_events_total",
                "Total number of dispatched endpoint events",
                &["kind"]
            )
            .expect("Failed to register endpoint_events"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_sync_latency(&self, duration_secs: f64) {
        self.inner().sync_latency_seconds.observe(duration_secs);
    }

    pub fn inc_sync_success(&self) {
        self.inner().sync_success.inc();
    }

    /// Record a failed sync; expected races are also counted separately
    pub fn inc_sync_failure(&self, expected_race: bool) {
        self.inner().sync_failures.inc();
        if expected_race {
            self.inner().sync_expected_races.inc();
        }
    }

    pub fn add_addresses_learned(&self, accepted: usize, discarded: usize) {
        self.inner().addresses_learned.inc_by(accepted as u64);
        self.inner().addresses_discarded.inc_by(discarded as u64);
    }

    pub fn set_ip_cache_ports(&self, ports: usize) {
        self.inner().ip_cache_ports.set(ports as i64);
    }

    /// Size of the last built snapshot
    pub fn set_snapshot_size(&self, bridges: usize, interfaces: usize) {
        self.inner().bridges.set(bridges as i64);
        self.inner().interfaces.set(interfaces as i64);
    }

    pub fn inc_endpoint_events(&self, kind: &str) {
        self.inner().endpoint_events.with_label_values(&[kind]).inc();
    }
}

/// Structured logger for agent events
///
/// Emits event-tagged records for significant lifecycle changes.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, agent_name: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            agent = %agent_name,
            "OVS agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "OVS agent shutting down"
        );
    }

    /// Log a persisted AgentInfo
    pub fn log_agentinfo_synced(
        &self,
        agent_name: &str,
        created: bool,
        bridges: usize,
        interfaces: usize,
        resource_version: Option<&str>,
    ) {
        info!(
            event = "agentinfo_synced",
            node = %self.node_name,
            agent = %agent_name,
            created = created,
            bridges = bridges,
            interfaces = interfaces,
            resource_version = ?resource_version,
            "AgentInfo persisted"
        );
    }

    /// Log a failed sync attempt. Races with other writers are expected and
    /// logged at debug.
    pub fn log_sync_failure(&self, agent_name: &str, error: &dyn std::error::Error, expected: bool) {
        if expected {
            debug!(
                event = "agentinfo_sync_failed",
                node = %self.node_name,
                agent = %agent_name,
                error = %error,
                "Conflict syncing AgentInfo, retrying"
            );
        } else {
            warn!(
                event = "agentinfo_sync_failed",
                node = %self.node_name,
                agent = %agent_name,
                error = %error,
                "Failed to sync AgentInfo, retrying"
            );
        }
    }

    /// Log an endpoint lifecycle change
    pub fn log_endpoint_event(&self, kind: &str, interface: &str, bridge: &str, mac: &str) {
        let event = format!("endpoint_{}", kind);
        info!(
            event = %event,
            node = %self.node_name,
            interface = %interface,
            bridge = %bridge,
            mac = %mac,
            "Local endpoint {}",
            kind
        );
    }
}
