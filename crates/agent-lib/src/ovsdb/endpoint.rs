//! Local endpoints derived from interface rows

use super::cache::{OvsdbCache, Row};
use super::{
    join_trunks, BRIDGE_TABLE, INTERFACE_TABLE, LOCAL_ENDPOINT_IDENTITY, LOCAL_ENDPOINT_IPV4,
    PORT_TABLE,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// A workload attached to a local bridge port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub interface_uuid: String,
    pub interface_name: String,
    pub bridge_name: String,
    pub mac: String,
    pub port_no: u32,
    pub vlan_id: u16,
    pub trunk: String,
    pub ipv4: Option<Ipv4Addr>,
}

/// Endpoint lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Added(Endpoint),
    Updated { old: Endpoint, new: Endpoint },
    Deleted(Endpoint),
}

impl EndpointEvent {
    /// Interface uuid this event is about
    pub fn key(&self) -> &str {
        match self {
            EndpointEvent::Added(ep) | EndpointEvent::Deleted(ep) => &ep.interface_uuid,
            EndpointEvent::Updated { new, .. } => &new.interface_uuid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EndpointEvent::Added(_) => "added",
            EndpointEvent::Updated { .. } => "updated",
            EndpointEvent::Deleted(_) => "deleted",
        }
    }
}

/// Receives endpoint notifications from the cache mirror.
///
/// Events for the same interface are delivered in order, from a single task.
pub trait EndpointEventHandler: Send + Sync {
    fn handle(&self, event: &EndpointEvent);
}

impl<F> EndpointEventHandler for F
where
    F: Fn(&EndpointEvent) + Send + Sync,
{
    fn handle(&self, event: &EndpointEvent) {
        self(event)
    }
}

/// Collect every local endpoint reachable from the bridge table, keyed by
/// interface uuid. Rows that are missing or malformed are skipped.
pub fn collect_endpoints(cache: &OvsdbCache) -> BTreeMap<String, Endpoint> {
    let mut endpoints = BTreeMap::new();

    let Some(bridges) = cache.table(BRIDGE_TABLE) else {
        return endpoints;
    };

    for bridge in bridges.values() {
        let Ok(bridge_name) = bridge.string(BRIDGE_TABLE, "name") else {
            continue;
        };

        for port_uuid in bridge.refs("ports") {
            let Some(port) = cache.row(PORT_TABLE, port_uuid) else {
                continue;
            };
            let vlan_id = port
                .optional_integer("tag")
                .and_then(|tag| u16::try_from(tag).ok())
                .unwrap_or(0);
            let trunk = join_trunks(&port.integers("trunks"));

            for iface_uuid in port.refs("interfaces") {
                let Some(iface) = cache.row(INTERFACE_TABLE, iface_uuid) else {
                    continue;
                };
                if let Some(endpoint) =
                    endpoint_from_interface(iface_uuid, iface, bridge_name, vlan_id, &trunk)
                {
                    endpoints.insert(iface_uuid.to_string(), endpoint);
                }
            }
        }
    }

    endpoints
}

fn endpoint_from_interface(
    uuid: &str,
    iface: &Row,
    bridge_name: &str,
    vlan_id: u16,
    trunk: &str,
) -> Option<Endpoint> {
    if iface.optional_str("error").is_some_and(|e| !e.is_empty()) {
        return None;
    }

    let port_no = iface
        .optional_integer("ofport")
        .and_then(|ofport| u32::try_from(ofport).ok())?;
    let external_ids = iface.string_map(INTERFACE_TABLE, "external_ids").ok()?;
    let mac = external_ids.get(LOCAL_ENDPOINT_IDENTITY)?.clone();

    Some(Endpoint {
        interface_uuid: uuid.to_string(),
        interface_name: iface.string(INTERFACE_TABLE, "name").ok()?.to_string(),
        bridge_name: bridge_name.to_string(),
        mac,
        port_no,
        vlan_id,
        trunk: trunk.to_string(),
        ipv4: external_ids
            .get(LOCAL_ENDPOINT_IPV4)
            .and_then(|ip| ip.parse().ok()),
    })
}

/// Compute the events that turn `before` into `after`, in interface uuid
/// order.
pub fn diff_endpoints(
    before: &BTreeMap<String, Endpoint>,
    after: &BTreeMap<String, Endpoint>,
) -> Vec<EndpointEvent> {
    let mut events = Vec::new();

    for (uuid, old) in before {
        match after.get(uuid) {
            None => events.push(EndpointEvent::Deleted(old.clone())),
            Some(new) if new != old => events.push(EndpointEvent::Updated {
                old: old.clone(),
                new: new.clone(),
            }),
            Some(_) => {}
        }
    }

    for (uuid, new) in after {
        if !before.contains_key(uuid) {
            events.push(EndpointEvent::Added(new.clone()));
        }
    }

    events.sort_by(|a, b| a.key().cmp(b.key()));
    events
}
