//! Synchronization configuration and the recent-peer allow-list.
//!
//! Everything that used to be ambient (port ranges, instance name, the
//! recently-seen peer list) is carried in [`SyncConfig`] and injected into
//! the manager. The allow-list is a shared state object whose load/save
//! lifecycle belongs to the embedding shell; the manager only records
//! sightings into it and the remote-control manager consults it when
//! answering permission requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Default port range scanned for sibling instances on the same host.
pub const LOCAL_TCP_PORT_START: u16 = 49200;
pub const LOCAL_TCP_PORT_END: u16 = 49210;

/// Default UDP port range for LAN beacon exchange.
pub const LAN_UDP_PORT_START: u16 = 23806;
pub const LAN_UDP_PORT_END: u16 = 23815;

/// Fixed UDP port for remote-control discovery, kept apart from plain LAN
/// sync so the two kinds of sessions cannot interfere.
pub const RC_UDP_PORT: u16 = 23821;

/// Shared handle to the allow-list; the shell keeps one and persists it.
pub type RecentPeersHandle = Arc<Mutex<RecentPeers>>;

/// Names of instances we synchronized with before, with last-seen times.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecentPeers {
    entries: HashMap<String, SystemTime>,
}

impl RecentPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> RecentPeersHandle {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Record a sighting of `name` at the current time.
    pub fn record(&mut self, name: &str) {
        self.entries.insert(name.to_string(), SystemTime::now());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn last_seen(&self, name: &str) -> Option<SystemTime> {
        self.entries.get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Configuration for one synchronization session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub local_port_start: u16,
    pub local_port_end: u16,
    pub lan_udp_port_start: u16,
    pub lan_udp_port_end: u16,
    pub rc_udp_port: u16,
    /// Name this instance hands out in greetings (defaults to the hostname).
    pub client_name: String,
    /// Bounded wait for outbound connect attempts. A timeout is not an
    /// error; the candidate is simply unreachable.
    pub probe_timeout_ms: u64,
    /// Allow-list shared with the shell.
    pub recent: RecentPeersHandle,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let client_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "vantage".to_string());
        Self {
            local_port_start: LOCAL_TCP_PORT_START,
            local_port_end: LOCAL_TCP_PORT_END,
            lan_udp_port_start: LAN_UDP_PORT_START,
            lan_udp_port_end: LAN_UDP_PORT_END,
            rc_udp_port: RC_UDP_PORT,
            client_name,
            probe_timeout_ms: 20,
            recent: RecentPeers::shared(),
        }
    }
}
