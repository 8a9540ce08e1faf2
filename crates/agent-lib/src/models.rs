//! Core data models for the OVS agent
//!
//! `AgentInfo` is the per-node control-plane record. Its JSON shape matches the
//! `agent.everoute.io/v1alpha1` `AgentInfo` resource read by the policy and
//! group controllers.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// API group of the AgentInfo resource
pub const AGENTINFO_GROUP: &str = "agent.everoute.io";
/// API version of the AgentInfo resource
pub const AGENTINFO_VERSION: &str = "v1alpha1";
/// Kind of the AgentInfo resource
pub const AGENTINFO_KIND: &str = "AgentInfo";

/// Learned addresses of one interface and the time each was discovered
pub type IpMap = BTreeMap<IpAddr, DateTime<Utc>>;

/// Key identifying an interface's data-plane port within this agent.
///
/// Used both for IP cache entries and for matching interfaces across
/// snapshots.
pub fn ip_cache_key(bridge_name: &str, ofport: i32) -> String {
    format!("{}-{}", bridge_name, ofport)
}

/// Per-node switch topology and health record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, rename = "ovsInfo")]
    pub ovs_info: OvsInfo,
    #[serde(default)]
    pub conditions: Vec<AgentCondition>,
}

impl AgentInfo {
    /// Create an empty AgentInfo for the given agent name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Name of the agent this record belongs to
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Find a bridge by name
    pub fn bridge(&self, name: &str) -> Option<&OvsBridge> {
        self.ovs_info.bridges.iter().find(|b| b.name == name)
    }

    /// Iterate over every interface together with its bridge name
    pub fn interfaces(&self) -> impl Iterator<Item = (&str, &OvsInterface)> {
        self.ovs_info.bridges.iter().flat_map(|bridge| {
            bridge
                .ports
                .iter()
                .flat_map(|port| port.interfaces.iter())
                .map(move |iface| (bridge.name.as_str(), iface))
        })
    }

    /// Total number of interfaces across all bridges
    pub fn interface_count(&self) -> usize {
        self.interfaces().count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OvsInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub bridges: Vec<OvsBridge>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OvsBridge {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<OvsPort>,
}

impl OvsBridge {
    /// Find the first interface in this bridge using the given ofport
    pub fn interface_by_ofport(&self, ofport: i32) -> Option<&OvsInterface> {
        self.ports
            .iter()
            .flat_map(|port| port.interfaces.iter())
            .find(|iface| iface.ofport == ofport)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvsPort {
    pub name: String,
    #[serde(default, rename = "externalIDs")]
    pub external_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub vlan_config: VlanConfig,
    #[serde(default)]
    pub bond_config: BondConfig,
    #[serde(default)]
    pub interfaces: Vec<OvsInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VlanConfig {
    #[serde(default)]
    pub vlan_mode: VlanMode,
    #[serde(default)]
    pub tag: i32,
    /// Comma separated trunk vlan ids, e.g. `"10,20,30"`
    #[serde(default)]
    pub trunk: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondConfig {
    #[serde(default)]
    pub bond_mode: BondMode,
}

/// Port vlan mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VlanMode {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    #[serde(rename = "trunk")]
    Trunk,
    #[serde(rename = "access")]
    Access,
    #[serde(rename = "native-tagged")]
    NativeTagged,
    #[serde(rename = "native-untagged")]
    NativeUntagged,
}

impl VlanMode {
    /// Map the switch database `vlan_mode` column value. Unknown values map to
    /// `Unspecified`.
    pub fn from_ovs(value: &str) -> Self {
        match value {
            "trunk" => VlanMode::Trunk,
            "access" => VlanMode::Access,
            "native-tagged" => VlanMode::NativeTagged,
            "native-untagged" => VlanMode::NativeUntagged,
            _ => VlanMode::Unspecified,
        }
    }
}

/// Port bond mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondMode {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    #[serde(rename = "active-backup")]
    ActiveBackup,
    #[serde(rename = "balance-slb")]
    BalanceSlb,
    #[serde(rename = "balance-tcp")]
    BalanceTcp,
}

impl BondMode {
    pub fn from_ovs(value: &str) -> Self {
        match value {
            "active-backup" => BondMode::ActiveBackup,
            "balance-slb" => BondMode::BalanceSlb,
            "balance-tcp" => BondMode::BalanceTcp,
            _ => BondMode::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvsInterface {
    pub name: String,
    #[serde(default, rename = "type")]
    pub iface_type: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ofport: i32,
    #[serde(default, rename = "externalIDs")]
    pub external_ids: BTreeMap<String, String>,
    #[serde(default, rename = "ipmap", skip_serializing_if = "Option::is_none")]
    pub ip_map: Option<IpMap>,
}

/// Health condition type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentConditionType {
    AgentHealthy,
}

/// Condition status, following the Kubernetes True/False/Unknown convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCondition {
    #[serde(rename = "type")]
    pub condition_type: AgentConditionType,
    pub status: ConditionStatus,
    pub last_heartbeat_time: DateTime<Utc>,
}

impl AgentCondition {
    /// A healthy condition stamped with the given heartbeat time
    pub fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            condition_type: AgentConditionType::AgentHealthy,
            status: ConditionStatus::True,
            last_heartbeat_time: now,
        }
    }
}
