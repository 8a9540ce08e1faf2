//! Learned address cache
//!
//! Holds addresses observed on local bridge ports between two AgentInfo
//! persists. Each learning event for a port replaces that port's entry; the
//! whole cache is cleared once its content has been persisted.

use crate::models::IpMap;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One batch from the address learning channel: `"<bridge>-<ofport>"` to the
/// address observed on that port.
pub type LearnedAddresses = HashMap<String, IpAddr>;

/// Whether an address is a global unicast address.
///
/// Rejects unspecified, loopback, link-local, multicast and the IPv4 limited
/// broadcast address. Private ranges are accepted. IPv4-mapped IPv6
/// addresses are judged as IPv4.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_unicast_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_global_unicast_v4(&v4),
            None => is_global_unicast_v6(v6),
        },
    }
}

fn is_global_unicast_v4(ip: &Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast())
}

fn is_global_unicast_v6(ip: &Ipv6Addr) -> bool {
    // fe80::/10
    let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || link_local)
}

/// Outcome of folding one batch into the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LearnStats {
    pub accepted: usize,
    pub discarded: usize,
}

/// Cached addresses keyed by `"<bridge>-<ofport>"`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpEntries {
    ports: BTreeMap<String, IpMap>,
}

impl IpEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a learning batch in. Admitted addresses replace the port's
    /// previous entry with `{address: now}`.
    pub fn learn(&mut self, batch: &LearnedAddresses, now: DateTime<Utc>) -> LearnStats {
        let mut stats = LearnStats::default();
        for (port_key, ip) in batch {
            if !is_global_unicast(ip) {
                stats.discarded += 1;
                continue;
            }
            self.ports
                .insert(port_key.clone(), IpMap::from([(*ip, now)]));
            stats.accepted += 1;
        }
        stats
    }

    pub fn get(&self, port_key: &str) -> Option<&IpMap> {
        self.ports.get(port_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IpMap)> {
        self.ports.iter()
    }

    /// Number of ports with cached addresses
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn clear(&mut self) {
        self.ports.clear();
    }
}

/// Reader/writer locked IP cache shared by the learning consumer and the
/// synchronizer
#[derive(Debug, Default)]
pub struct IpCache {
    entries: RwLock<IpEntries>,
}

impl IpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access. The synchronizer holds this across
    /// build, merge, persist and clear.
    pub async fn lock(&self) -> RwLockWriteGuard<'_, IpEntries> {
        self.entries.write().await
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, IpEntries> {
        self.entries.read().await
    }

    /// Copy of the current entries
    pub async fn snapshot(&self) -> IpEntries {
        self.entries.read().await.clone()
    }
}
