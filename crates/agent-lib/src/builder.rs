//! AgentInfo snapshot building
//!
//! Walks the replicated Bridge, Port and Interface tables under the mirror's
//! lock and attaches learned addresses from the IP cache. The caller owns
//! the IP cache lock, so the snapshot and any later cache clear are atomic
//! with respect to address learning.

use crate::ipcache::IpEntries;
use crate::models::{
    ip_cache_key, AgentCondition, AgentInfo, BondConfig, BondMode, OvsBridge, OvsInfo,
    OvsInterface, OvsPort, VlanConfig, VlanMode,
};
use crate::ovsdb::{
    join_trunks, OvsdbCache, OvsdbError, OvsdbMonitor, BRIDGE_TABLE, INTERFACE_TABLE,
    LOCAL_ENDPOINT_IDENTITY, OPEN_VSWITCH_TABLE, PORT_TABLE,
};
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

/// Snapshot build failure. Nothing is persisted when a build fails.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unable to fetch bridge {uuid}: {source}")]
    Bridge {
        uuid: String,
        #[source]
        source: OvsdbError,
    },
}

/// Build a complete AgentInfo for this node
pub fn build_agent_info(
    name: &str,
    ovsdb: &OvsdbMonitor,
    ip_entries: &IpEntries,
) -> Result<AgentInfo, BuildError> {
    let mut info = AgentInfo::new(name);
    info.hostname = local_hostname();
    info.ovs_info = ovsdb.locked_access(|cache| build_ovs_info(cache, ip_entries))?;
    info.conditions = vec![AgentCondition::healthy(Utc::now())];
    Ok(info)
}

/// Build the switch section of AgentInfo from the replicated tables.
///
/// Bridges are ordered by name. Ports and interfaces keep the order of the
/// reference columns that name them.
pub fn build_ovs_info(cache: &OvsdbCache, ip_entries: &IpEntries) -> Result<OvsInfo, BuildError> {
    let version = match fetch_ovs_version(cache) {
        Ok(version) => version,
        Err(e) => {
            debug!(error = %e, "Switch version unavailable");
            String::new()
        }
    };

    let mut bridges = Vec::new();
    if let Some(table) = cache.table(BRIDGE_TABLE) {
        for uuid in table.keys() {
            let bridge = fetch_bridge(cache, uuid, ip_entries).map_err(|source| {
                BuildError::Bridge {
                    uuid: uuid.clone(),
                    source,
                }
            })?;
            bridges.push(bridge);
        }
    }
    bridges.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(OvsInfo { version, bridges })
}

/// Switch software version from the root table
pub fn fetch_ovs_version(cache: &OvsdbCache) -> Result<String, OvsdbError> {
    let root = cache
        .table(OPEN_VSWITCH_TABLE)
        .and_then(|table| table.values().next())
        .ok_or_else(|| OvsdbError::EmptyTable(OPEN_VSWITCH_TABLE.to_string()))?;

    root.string(OPEN_VSWITCH_TABLE, "ovs_version")
        .map(str::to_string)
}

fn fetch_bridge(
    cache: &OvsdbCache,
    uuid: &str,
    ip_entries: &IpEntries,
) -> Result<OvsBridge, OvsdbError> {
    let row = cache.require_row(BRIDGE_TABLE, uuid)?;
    let name = row.string(BRIDGE_TABLE, "name")?.to_string();

    let ports = row
        .refs("ports")
        .into_iter()
        .map(|port_uuid| fetch_port(cache, port_uuid, &name, ip_entries))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OvsBridge { name, ports })
}

fn fetch_port(
    cache: &OvsdbCache,
    uuid: &str,
    bridge_name: &str,
    ip_entries: &IpEntries,
) -> Result<OvsPort, OvsdbError> {
    let row = cache.require_row(PORT_TABLE, uuid)?;

    // Unset optional columns decode as empty sets and read as zero values
    let tag = row
        .optional_integer("tag")
        .and_then(|tag| i32::try_from(tag).ok())
        .unwrap_or(0);

    Ok(OvsPort {
        name: row.string(PORT_TABLE, "name")?.to_string(),
        external_ids: row.string_map(PORT_TABLE, "external_ids")?,
        vlan_config: VlanConfig {
            vlan_mode: VlanMode::from_ovs(row.optional_str("vlan_mode").unwrap_or_default()),
            tag,
            trunk: join_trunks(&row.integers("trunks")),
        },
        bond_config: BondConfig {
            bond_mode: BondMode::from_ovs(row.optional_str("bond_mode").unwrap_or_default()),
        },
        interfaces: row
            .refs("interfaces")
            .into_iter()
            .filter_map(|iface_uuid| fetch_interface(cache, iface_uuid, bridge_name, ip_entries))
            .collect(),
    })
}

/// Interfaces that are missing, unreadable or reporting an error are left
/// out of the snapshot.
fn fetch_interface(
    cache: &OvsdbCache,
    uuid: &str,
    bridge_name: &str,
    ip_entries: &IpEntries,
) -> Option<OvsInterface> {
    let Some(row) = cache.row(INTERFACE_TABLE, uuid) else {
        debug!(interface = %uuid, "Interface not found in cache");
        return None;
    };

    if let Some(error) = row.optional_str("error").filter(|e| !e.is_empty()) {
        debug!(interface = %uuid, error = %error, "Skipping interface with error");
        return None;
    }

    let parsed = row
        .string(INTERFACE_TABLE, "name")
        .and_then(|name| Ok((name, row.string_map(INTERFACE_TABLE, "external_ids")?)));
    let (name, external_ids) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(interface = %uuid, error = %e, "Skipping unreadable interface");
            return None;
        }
    };

    let mac = match external_ids.get(LOCAL_ENDPOINT_IDENTITY) {
        Some(mac) => mac.clone(),
        None => row.optional_str("mac_in_use").unwrap_or_default().to_string(),
    };

    let mut iface = OvsInterface {
        name: name.to_string(),
        iface_type: row.optional_str("type").unwrap_or_default().to_string(),
        mac,
        external_ids,
        ..Default::default()
    };

    if let Some(ofport) = row
        .optional_integer("ofport")
        .filter(|ofport| *ofport >= 0)
        .and_then(|ofport| i32::try_from(ofport).ok())
    {
        iface.ofport = ofport;
        iface.ip_map = ip_entries
            .get(&ip_cache_key(bridge_name, ofport))
            .cloned();
    }

    Some(iface)
}

/// Local hostname, if it can be determined
pub fn local_hostname() -> Option<String> {
    gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipcache::LearnedAddresses;
    use crate::models::ConditionStatus;
    use crate::ovsdb::TableUpdates;
    use crate::testutil::{self, interface_row, row, INTERFACE_UUID, PORT_UUID};
    use serde_json::json;

    fn build(cache: &OvsdbCache) -> OvsInfo {
        build_ovs_info(cache, &IpEntries::new()).unwrap()
    }

    fn topology_cache() -> OvsdbCache {
        let mut cache = OvsdbCache::new();
        cache.apply(&testutil::topology_updates());
        cache
    }

    #[test]
    fn test_build_topology() {
        let info = build(&topology_cache());

        assert_eq!(info.version, "2.17.0");
        assert_eq!(info.bridges.len(), 1);
        let bridge = &info.bridges[0];
        assert_eq!(bridge.name, "br0");

        let port = &bridge.ports[0];
        assert_eq!(port.name, "p0");
        assert_eq!(port.external_ids.get("owner").map(String::as_str), Some("test"));
        assert_eq!(port.vlan_config.vlan_mode, VlanMode::Trunk);
        assert_eq!(port.vlan_config.tag, 0);
        assert_eq!(port.vlan_config.trunk, "10,20");
        assert_eq!(port.bond_config.bond_mode, BondMode::Unspecified);

        let iface = &port.interfaces[0];
        assert_eq!(iface.name, "eth0");
        assert_eq!(iface.ofport, 5);
        assert_eq!(iface.mac, "00:11:22:33:44:55");
        assert!(iface.ip_map.is_none());
    }

    #[test]
    fn test_attached_mac_takes_precedence() {
        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.upsert(
            "Interface",
            INTERFACE_UUID,
            interface_row(
                "eth0",
                json!(5),
                json!(["set", []]),
                json!(["map", [["attached-mac", "aa:bb:cc:dd:ee:ff"]]]),
            ),
        );
        cache.apply(&updates);

        let info = build(&cache);
        assert_eq!(info.bridges[0].ports[0].interfaces[0].mac, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_interface_with_error_is_dropped() {
        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.upsert(
            "Interface",
            INTERFACE_UUID,
            interface_row(
                "eth0",
                json!(5),
                json!("could not open network device eth0"),
                json!(["map", []]),
            ),
        );
        cache.apply(&updates);

        let info = build(&cache);
        assert_eq!(info.bridges[0].name, "br0");
        assert_eq!(info.bridges[0].ports[0].name, "p0");
        assert!(info.bridges[0].ports[0].interfaces.is_empty());
    }

    #[test]
    fn test_missing_interface_is_skipped() {
        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.delete("Interface", INTERFACE_UUID);
        cache.apply(&updates);

        let info = build(&cache);
        assert!(info.bridges[0].ports[0].interfaces.is_empty());
    }

    #[test]
    fn test_missing_port_fails_build() {
        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.delete("Port", PORT_UUID);
        cache.apply(&updates);

        let err = build_ovs_info(&cache, &IpEntries::new()).unwrap_err();
        let BuildError::Bridge { source, .. } = err;
        assert!(matches!(source, OvsdbError::RowNotFound { .. }));
    }

    #[test]
    fn test_ip_map_attached_only_for_valid_ofport() {
        let mut entries = IpEntries::new();
        entries.learn(
            &LearnedAddresses::from([("br0-5".to_string(), "10.0.0.7".parse().unwrap())]),
            Utc::now(),
        );

        let info = build_ovs_info(&topology_cache(), &entries).unwrap();
        let iface = &info.bridges[0].ports[0].interfaces[0];
        assert_eq!(iface.ip_map.as_ref().map(|m| m.len()), Some(1));

        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.upsert(
            "Interface",
            INTERFACE_UUID,
            interface_row("eth0", json!(["set", []]), json!(["set", []]), json!(["map", []])),
        );
        cache.apply(&updates);

        let info = build_ovs_info(&cache, &entries).unwrap();
        let iface = &info.bridges[0].ports[0].interfaces[0];
        assert_eq!(iface.ofport, 0);
        assert!(iface.ip_map.is_none());
    }

    #[test]
    fn test_real_valued_numbers_are_truncated() {
        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.upsert(
            "Port",
            PORT_UUID,
            row(json!({
                "name": "p0",
                "tag": 100.0,
                "vlan_mode": "access",
                "trunks": ["set", []],
                "interfaces": ["uuid", INTERFACE_UUID]
            })),
        );
        updates.upsert(
            "Interface",
            INTERFACE_UUID,
            interface_row("eth0", json!(7.0), json!(["set", []]), json!(["map", []])),
        );
        cache.apply(&updates);

        let info = build(&cache);
        let port = &info.bridges[0].ports[0];
        assert_eq!(port.vlan_config.tag, 100);
        assert_eq!(port.vlan_config.vlan_mode, VlanMode::Access);
        assert_eq!(port.vlan_config.trunk, "");
        assert_eq!(port.interfaces[0].ofport, 7);
    }

    #[test]
    fn test_missing_root_table_leaves_version_empty() {
        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.delete("Open_vSwitch", "root");
        cache.apply(&updates);

        assert!(fetch_ovs_version(&cache).is_err());
        let info = build(&cache);
        assert!(info.version.is_empty());
        assert_eq!(info.bridges.len(), 1);
    }

    #[test]
    fn test_bridges_sorted_by_name() {
        let mut cache = topology_cache();
        let mut updates = TableUpdates::default();
        updates.upsert("Bridge", "a-bridge", row(json!({"name": "br-z", "ports": ["set", []]})));
        updates.upsert("Bridge", "z-bridge", row(json!({"name": "br-a", "ports": ["set", []]})));
        cache.apply(&updates);

        let names: Vec<_> = build(&cache).bridges.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["br-a", "br-z", "br0"]);
    }

    #[test]
    fn test_build_agent_info_adds_healthy_condition() {
        let monitor = testutil::topology_monitor();
        let info = build_agent_info("agent-a", &monitor, &IpEntries::new()).unwrap();

        assert_eq!(info.name(), "agent-a");
        assert_eq!(info.conditions.len(), 1);
        assert_eq!(info.conditions[0].status, ConditionStatus::True);
        assert_eq!(info.interface_count(), 1);
    }
}
