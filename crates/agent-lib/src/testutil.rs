//! Shared fixtures for unit tests

use crate::ovsdb::{OvsdbMonitor, Row, TableUpdates};
use serde_json::{json, Value};

pub const BRIDGE_UUID: &str = "bridge-0";
pub const PORT_UUID: &str = "port-0";
pub const INTERFACE_UUID: &str = "iface-0";

pub fn row(value: Value) -> Row {
    Row::from_json(&value).unwrap()
}

/// Interface row with the given ofport and error column
pub fn interface_row(name: &str, ofport: Value, error: Value, external_ids: Value) -> Row {
    row(json!({
        "name": name,
        "type": "",
        "mac_in_use": "00:11:22:33:44:55",
        "ofport": ofport,
        "error": error,
        "external_ids": external_ids,
    }))
}

/// `br0` / `p0` / `eth0` with ofport 5, trunks 10,20 and no attached mac
pub fn topology_updates() -> TableUpdates {
    TableUpdates::from_json(&json!({
        "Open_vSwitch": {
            "root": {"new": {"ovs_version": "2.17.0", "bridges": ["uuid", BRIDGE_UUID]}}
        },
        "Bridge": {
            BRIDGE_UUID: {"new": {"name": "br0", "ports": ["uuid", PORT_UUID]}}
        },
        "Port": {
            PORT_UUID: {"new": {
                "name": "p0",
                "external_ids": ["map", [["owner", "test"]]],
                "vlan_mode": "trunk",
                "tag": ["set", []],
                "trunks": ["set", [10, 20]],
                "bond_mode": ["set", []],
                "interfaces": ["set", [["uuid", INTERFACE_UUID]]]
            }}
        },
        "Interface": {
            INTERFACE_UUID: {"new": {
                "name": "eth0",
                "type": "",
                "mac_in_use": "00:11:22:33:44:55",
                "ofport": 5,
                "error": ["set", []],
                "external_ids": ["map", []]
            }}
        }
    }))
    .unwrap()
}

/// Mirror preloaded with `topology_updates`
pub fn topology_monitor() -> OvsdbMonitor {
    let monitor = OvsdbMonitor::new();
    monitor.apply_table_updates(&topology_updates());
    monitor
}
