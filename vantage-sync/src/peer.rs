//! Peer records and the manager-owned registry.
//!
//! The registry is deliberately a plain single-writer collection: every
//! mutation and every query happens on the manager's worker task, so no
//! interior locking is needed. That discipline is load-bearing: nothing
//! outside the worker may hold a reference into it.

use std::net::IpAddr;
use std::time::Duration;

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::connection::ConnectionId;

/// How long a peer counts as "active" after its synchronized state toggles.
pub const ACTIVE_DEBOUNCE: Duration = Duration::from_secs(4);

/// One remote instance known to this manager.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Per-manager monotonically increasing id, never reused.
    pub id: u16,
    pub address: IpAddr,
    /// Remote port of the underlying socket. For peers we dialed this equals
    /// the port we dialed, which makes it the key for connection
    /// de-duplication.
    pub local_port: u16,
    /// Port the peer advertises for inbound synchronization (0 if none).
    pub server_port: u16,
    pub title: String,
    /// Instance name exchanged in the LAN greeting; empty for same-host sync.
    pub client_name: String,
    /// Whether the peer should be user-visible, independent of connectivity.
    pub show_in_menu: bool,
    /// Connection this peer lives on. The manager owns the handle; a peer
    /// whose connection is gone is simply not actionable.
    pub conn: ConnectionId,
    synchronized: bool,
    active_until: Option<Instant>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u16,
        address: IpAddr,
        local_port: u16,
        server_port: u16,
        title: String,
        client_name: String,
        show_in_menu: bool,
        conn: ConnectionId,
    ) -> Self {
        Self {
            id,
            address,
            local_port,
            server_port,
            title,
            client_name,
            show_in_menu,
            conn,
            synchronized: false,
            active_until: None,
        }
    }

    /// Toggle the synchronized flag. Every toggle re-arms the 4 second
    /// activity window, so rapid changes keep the peer continuously active.
    pub fn set_synchronized(&mut self, flag: bool) {
        self.synchronized = flag;
        self.active_until = Some(Instant::now() + ACTIVE_DEBOUNCE);
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Whether the synchronized state changed within the debounce window.
    /// Used for transient UI attention only.
    pub fn is_active(&self) -> bool {
        self.active_until.map_or(false, |t| Instant::now() < t)
    }
}

/// The exclusively-owned collection of all known peers for one manager.
///
/// Ids are handed out by the manager and are unique for its lifetime; a
/// peer is present at most once.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<u16, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer. Rejects duplicate ids.
    pub fn add(&mut self, peer: Peer) -> bool {
        if self.peers.contains_key(&peer.id) {
            log::warn!("peer id {} already registered", peer.id);
            return false;
        }
        self.peers.insert(peer.id, peer);
        true
    }

    pub fn remove(&mut self, peer_id: u16) -> Option<Peer> {
        self.peers.remove(&peer_id)
    }

    pub fn get(&self, peer_id: u16) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All peers, in id (= arrival) order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn set_synchronized(&mut self, peer_id: u16, flag: bool) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.set_synchronized(flag);
                true
            }
            None => false,
        }
    }

    pub fn set_title(&mut self, peer_id: u16, title: &str) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.title = title.to_string();
                true
            }
            None => false,
        }
    }

    pub fn set_show_in_menu(&mut self, peer_id: u16, flag: bool) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.show_in_menu = flag;
                true
            }
            None => false,
        }
    }

    /// Peers currently in the outgoing-broadcast set.
    pub fn synchronized(&self) -> Vec<&Peer> {
        self.peers.values().filter(|p| p.is_synchronized()).collect()
    }

    pub fn synchronized_ids(&self) -> Vec<u16> {
        self.peers
            .values()
            .filter(|p| p.is_synchronized())
            .map(|p| p.id)
            .collect()
    }

    /// Advertised server ports of all synchronized peers: the payload a
    /// joining instance receives to learn the rest of the group.
    pub fn synchronized_server_ports(&self) -> Vec<u16> {
        self.peers
            .values()
            .filter(|p| p.is_synchronized())
            .map(|p| p.server_port)
            .collect()
    }

    /// Peers whose synchronized state changed within the debounce window.
    pub fn active(&self) -> Vec<&Peer> {
        self.peers.values().filter(|p| p.is_active()).collect()
    }

    pub fn by_server_port(&self, port: u16) -> Option<&Peer> {
        self.peers.values().find(|p| p.server_port == port)
    }

    /// Lookup by the socket endpoint, used to de-duplicate outbound
    /// connection attempts.
    pub fn by_endpoint(&self, address: IpAddr, local_port: u16) -> Option<&Peer> {
        self.peers
            .values()
            .find(|p| p.address == address && p.local_port == local_port)
    }

    pub fn is_connected_to(&self, address: IpAddr, local_port: u16) -> bool {
        self.by_endpoint(address, local_port).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(id: u16, local_port: u16, server_port: u16) -> Peer {
        Peer::new(
            id,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port,
            server_port,
            format!("peer-{id}"),
            String::new(),
            false,
            id as ConnectionId,
        )
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let mut reg = PeerRegistry::new();
        assert!(reg.add(peer(1, 1000, 2000)));
        assert!(!reg.add(peer(1, 1001, 2001)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_lookup_by_server_port_and_endpoint() {
        let mut reg = PeerRegistry::new();
        reg.add(peer(1, 1000, 2000));
        reg.add(peer(2, 1001, 2001));

        assert_eq!(reg.by_server_port(2001).map(|p| p.id), Some(2));
        assert_eq!(
            reg.by_endpoint(IpAddr::V4(Ipv4Addr::LOCALHOST), 1000).map(|p| p.id),
            Some(1)
        );
        assert!(reg.by_server_port(9999).is_none());
        assert!(!reg.is_connected_to(IpAddr::V4(Ipv4Addr::LOCALHOST), 42));
    }

    #[test]
    fn test_synchronized_subset_and_ports() {
        let mut reg = PeerRegistry::new();
        reg.add(peer(1, 1000, 2000));
        reg.add(peer(2, 1001, 2001));
        reg.add(peer(3, 1002, 2002));

        reg.set_synchronized(1, true);
        reg.set_synchronized(3, true);

        assert_eq!(reg.synchronized_ids(), vec![1, 3]);
        assert_eq!(reg.synchronized_server_ports(), vec![2000, 2002]);

        reg.set_synchronized(3, false);
        assert_eq!(reg.synchronized_ids(), vec![1]);
    }

    #[test]
    fn test_unknown_peer_operations_are_noops() {
        let mut reg = PeerRegistry::new();
        assert!(!reg.set_synchronized(99, true));
        assert!(!reg.set_title(99, "x"));
        assert!(!reg.set_show_in_menu(99, true));
        assert!(reg.remove(99).is_none());
    }

    #[test]
    fn test_ids_survive_removal() {
        let mut reg = PeerRegistry::new();
        reg.add(peer(1, 1000, 2000));
        reg.add(peer(2, 1001, 2001));
        reg.remove(1);
        reg.add(peer(3, 1002, 2002));

        let ids: Vec<u16> = reg.peers().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_flag_debounce() {
        let mut reg = PeerRegistry::new();
        reg.add(peer(1, 1000, 2000));

        reg.set_synchronized(1, true);
        assert_eq!(reg.active().len(), 1);

        // Second toggle inside the window re-arms it.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(reg.active().len(), 1);
        reg.set_synchronized(1, false);

        // 3.9s after the last change: still active.
        tokio::time::advance(Duration::from_millis(3900)).await;
        assert_eq!(reg.active().len(), 1);

        // Past the 4s window: no longer active, sync flag untouched.
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(reg.active().is_empty());
        assert!(!reg.get(1).unwrap().is_synchronized());
    }
}
