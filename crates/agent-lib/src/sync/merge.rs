//! Merging a fresh snapshot with the persisted AgentInfo

use crate::ipcache::IpEntries;
use crate::models::{ip_cache_key, AgentInfo, OvsInterface};
use std::collections::HashMap;

/// Carry learned addresses of the persisted object forward into a fresh
/// snapshot.
///
/// Interfaces are matched by bridge name and ofport. Addresses already in the
/// fresh snapshot keep their fresh timestamp. Interfaces that only exist in
/// the persisted object are not carried over.
pub fn merge_agent_info(local: &mut AgentInfo, remote: &AgentInfo) {
    for bridge in &mut local.ovs_info.bridges {
        let Some(remote_bridge) = remote.bridge(&bridge.name) else {
            continue;
        };

        for iface in bridge.ports.iter_mut().flat_map(|p| p.interfaces.iter_mut()) {
            let Some(remote_map) = remote_bridge
                .interface_by_ofport(iface.ofport)
                .and_then(|remote_iface| remote_iface.ip_map.as_ref())
            else {
                continue;
            };

            if remote_map.is_empty() {
                continue;
            }

            let local_map = iface.ip_map.get_or_insert_with(Default::default);
            for (ip, discovered) in remote_map {
                local_map.entry(*ip).or_insert(*discovered);
            }
        }
    }
}

/// Whether freshly learned addresses are not yet reflected in the persisted
/// object.
///
/// Every cached address must appear in the persisted interface with the same
/// key. More cached ports than persisted interfaces is answered without
/// looking at contents.
pub fn should_sync_on_learn(cache: &IpEntries, remote: &AgentInfo) -> bool {
    let mut persisted: HashMap<String, &OvsInterface> = HashMap::new();
    for (bridge_name, iface) in remote.interfaces() {
        persisted
            .entry(ip_cache_key(bridge_name, iface.ofport))
            .or_insert(iface);
    }

    if cache.len() > persisted.len() {
        return true;
    }

    cache.iter().any(|(key, cached)| match persisted.get(key) {
        None => true,
        Some(iface) => match &iface.ip_map {
            None => !cached.is_empty(),
            Some(persisted_map) => cached.keys().any(|ip| !persisted_map.contains_key(ip)),
        },
    })
}
