//! Registry of known peers.
//!
//! A single mutex guards the whole map; discovery, heartbeat and update
//! handlers all go through it. Entries not refreshed within the TTL are
//! swept out by the cleanup loop. The node's own addresses are rejected at
//! the door so a node can never "discover" itself and sync in a loop.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::types::{DbVersion, PeerInfo};

/// Peers unseen for this long are evicted.
pub const PEER_TTL: Duration = Duration::from_secs(15);

pub struct PeerDirectory {
    local_addrs: HashSet<IpAddr>,
    peers: Mutex<HashMap<IpAddr, PeerInfo>>,
}

impl PeerDirectory {
    pub fn new(local_addrs: HashSet<IpAddr>) -> Self {
        Self {
            local_addrs,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Addresses of this host's own interfaces, loopback included.
    pub fn local_addresses() -> HashSet<IpAddr> {
        let mut addrs: HashSet<IpAddr> = HashSet::new();
        addrs.insert(IpAddr::from([127, 0, 0, 1]));
        match local_ip_address::list_afinet_netifas() {
            Ok(interfaces) => {
                for (_name, addr) in interfaces {
                    addrs.insert(addr);
                }
            }
            Err(e) => warn!("failed to enumerate local interfaces: {e}"),
        }
        addrs
    }

    pub fn is_local(&self, addr: IpAddr) -> bool {
        self.local_addrs.contains(&addr)
    }

    /// Insert or refresh a peer. Local addresses are ignored with a warning.
    pub fn add_or_update(&self, addr: IpAddr, version: DbVersion, sync_port: u16) {
        if self.is_local(addr) {
            warn!("ignoring peer entry for own address {addr}");
            return;
        }
        let mut peers = self.peers.lock().expect("peer lock poisoned");
        peers.insert(
            addr,
            PeerInfo {
                addr,
                version,
                sync_port,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn get(&self, addr: IpAddr) -> Option<PeerInfo> {
        self.peers
            .lock()
            .expect("peer lock poisoned")
            .get(&addr)
            .cloned()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .lock()
            .expect("peer lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop peers not seen within `ttl`. Returns how many were removed.
    pub fn evict_stale(&self, ttl: Duration) -> usize {
        let mut peers = self.peers.lock().expect("peer lock poisoned");
        let before = peers.len();
        peers.retain(|addr, info| {
            let fresh = info.last_seen.elapsed() < ttl;
            if !fresh {
                debug!("evicting stale peer {addr}");
            }
            fresh
        });
        before - peers.len()
    }

    /// The peer most worth pulling from: among peers whose declared version
    /// is newer than `local`, the one with the latest timestamp.
    pub fn best_candidate(&self, local: &DbVersion) -> Option<PeerInfo> {
        let peers = self.peers.lock().expect("peer lock poisoned");
        peers
            .values()
            .filter(|info| info.version.is_newer_than(local))
            .max_by_key(|info| info.version.parsed_timestamp())
            .cloned()
    }
}
