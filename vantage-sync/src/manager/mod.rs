//! Client managers: turn raw sockets into tracked peers and route messages.
//!
//! ```text
//! discovery ──► sockets/addresses ──► ClientManager ──► Connection + greeting
//!                                         │                    │
//!                                         ▼                    ▼
//!                                    PeerRegistry ◄── typed messages ──► other peers
//!                                         │
//!                                         ▼
//!                                    SyncEvent (shell/renderer)
//! ```
//!
//! Three variants share one `SyncCore`:
//!
//! - `local::LocalManager` — same-host full mesh, port-scan discovery
//! - `lan::LanManager` — LAN star topology with a single elected hub
//! - `rc::RcManager` — permissioned remote control on top of the LAN manager
//!
//! Every manager lives inside one dedicated worker task for the lifetime of
//! its session; all registry access happens there.

pub(crate) mod lan;
pub(crate) mod local;
pub(crate) mod rc;

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::connection::{ConnectionHandle, ConnectionId, NetEvent};
use crate::peer::{Peer, PeerRegistry};
use crate::protocol::{FileOp, Transform, WindowRect};

/// Inward requests from the shell/renderer.
#[derive(Debug)]
pub enum Command {
    /// Include the peer in the broadcast set (LAN: triggers hub handover if
    /// this instance is currently hosting).
    SynchronizeWith(u16),
    /// Like [`Command::SynchronizeWith`], addressed by advertised server port.
    SynchronizeWithServerPort(u16),
    /// Remove a peer from the broadcast set;
    /// [`crate::protocol::SYNC_WILDCARD_PEER_ID`] means all of them.
    StopSynchronizeWith(u16),
    SendTitle(String),
    SendTransform {
        transform: Transform,
        img_transform: Transform,
        canvas_size: (f64, f64),
    },
    SendPosition { rect: WindowRect, overlaid: bool },
    SendFile { op: FileOp, filename: String },
    /// LAN only: push image content to the group.
    SendImage { title: String, data: Vec<u8> },
    /// Tile this instance plus all synchronized peers across `screen`.
    ArrangeInstances { screen: WindowRect, overlaid: bool },
    /// Re-run discovery (local: port scan; LAN: newClient beacon).
    SearchForClients,
    /// LAN/RC: assume (true) or relinquish (false) the hub role.
    StartServer(bool),
    /// LAN/RC: connect to a known endpoint, bypassing beacon discovery
    /// (external discovery sources and rendezvous feed this).
    ConnectToHost {
        address: IpAddr,
        port: u16,
        name: String,
    },
    /// RC only: broadcast the interaction mode.
    SendMode(i32),
    /// Local only: ask all sibling instances to quit.
    QuitPeers,
    /// Snapshot of the externally visible peer list.
    GetPeerList(oneshot::Sender<Vec<PeerSnapshot>>),
    Shutdown,
}

/// Outward events consumed by the shell/renderer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Advertised server ports of the synchronized set, in peer order.
    SynchronizedPeersChanged(Vec<u16>),
    /// Snapshots of the recently-changed peers, for transient UI attention.
    ConnectionListChanged(Vec<PeerSnapshot>),
    Transform {
        transform: Transform,
        img_transform: Transform,
        canvas_size: (f64, f64),
    },
    Position {
        rect: WindowRect,
        opacity: bool,
        overlaid: bool,
    },
    File { op: FileOp, filename: String },
    Image { title: String, data: Vec<u8> },
    /// Human-readable status with a suggested display duration.
    Info { message: String, duration_ms: u64 },
    /// RC interaction mode changed (reset to 0 on goodbye).
    ModeChanged(i32),
    /// Hub listener opened (port) or closed (0).
    ServerPortChanged(u16),
    /// A sibling instance asked us to quit.
    Quit,
}

/// Copy of one peer's state for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: u16,
    pub title: String,
    pub address: IpAddr,
    pub local_port: u16,
    pub server_port: u16,
    pub client_name: String,
    pub synchronized: bool,
    pub show_in_menu: bool,
}

/// State and behavior shared by all manager variants.
pub(crate) struct SyncCore {
    pub title: String,
    pub client_name: String,
    /// Port advertised in our greetings: the loopback listener for local
    /// sync, the hub listener while hosting, 0 otherwise.
    pub server_port: u16,
    pub registry: PeerRegistry,
    pub connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Connections whose greeting handshake has not completed yet.
    pub pending: Vec<ConnectionId>,
    pub net_tx: mpsc::Sender<NetEvent>,
    next_peer_id: u16,
    next_conn_id: ConnectionId,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncCore {
    pub fn new(
        title: String,
        client_name: String,
        events: mpsc::UnboundedSender<SyncEvent>,
        net_tx: mpsc::Sender<NetEvent>,
    ) -> Self {
        Self {
            title,
            client_name,
            server_port: 0,
            registry: PeerRegistry::new(),
            connections: HashMap::new(),
            pending: Vec::new(),
            net_tx,
            next_peer_id: 0,
            next_conn_id: 0,
            events,
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        // The receiver may be gone during teardown; that is fine.
        let _ = self.events.send(event);
    }

    /// Raise both peer-list events after any membership or sync change.
    pub fn emit_peer_lists(&self) {
        self.emit(SyncEvent::SynchronizedPeersChanged(
            self.registry.synchronized_server_ports(),
        ));
        self.emit(SyncEvent::ConnectionListChanged(
            self.registry.active().into_iter().map(snapshot).collect(),
        ));
    }

    /// Wrap a freshly connected stream into a tracked, handshaking
    /// connection.
    pub fn adopt_stream(&mut self, stream: TcpStream, initiated: bool) -> Option<ConnectionId> {
        self.next_conn_id += 1;
        let id = self.next_conn_id;
        match ConnectionHandle::spawn(id, stream, initiated, self.net_tx.clone()) {
            Ok(handle) => {
                self.connections.insert(id, handle);
                self.pending.push(id);
                Some(id)
            }
            Err(e) => {
                log::debug!("could not adopt stream: {e}");
                None
            }
        }
    }

    /// Whether an outbound attempt to this endpoint is already in flight.
    pub fn pending_to(&self, address: IpAddr, port: u16) -> bool {
        self.pending.iter().any(|id| {
            self.connections
                .get(id)
                .map_or(false, |c| c.remote_addr.ip() == address && c.remote_addr.port() == port)
        })
    }

    /// Send our greeting on a connection we initiated.
    pub fn send_initial_greeting(&mut self, conn: ConnectionId) {
        let title = self.title.clone();
        let name = self.client_name.clone();
        let port = self.server_port;
        if let Some(handle) = self.connections.get_mut(&conn) {
            handle.send_greeting(&title, port, &name);
            handle.greeting_sent = true;
        }
    }

    /// A greeting arrived: reply if we have not greeted yet, then promote
    /// the connection to a registered peer. Returns the new peer id.
    pub fn on_greeting(
        &mut self,
        conn: ConnectionId,
        server_port: u16,
        title: String,
        client_name: String,
    ) -> Option<u16> {
        if self.connections.get(&conn).map_or(true, |h| h.peer_id.is_some()) {
            log::debug!("duplicate greeting on connection {conn}");
            return None;
        }
        self.send_initial_greeting_if_needed(conn);
        self.pending.retain(|id| *id != conn);

        self.next_peer_id += 1;
        let peer_id = self.next_peer_id;
        let handle = self.connections.get_mut(&conn)?;
        handle.peer_id = Some(peer_id);
        if !client_name.is_empty() {
            handle.client_name = client_name;
        }
        let peer = Peer::new(
            peer_id,
            handle.remote_addr.ip(),
            handle.remote_addr.port(),
            server_port,
            title,
            handle.client_name.clone(),
            handle.show_in_menu,
            conn,
        );
        log::info!(
            "peer {peer_id} ready ({}, server port {server_port})",
            handle.remote_addr
        );
        if !self.registry.add(peer) {
            return None;
        }
        Some(peer_id)
    }

    fn send_initial_greeting_if_needed(&mut self, conn: ConnectionId) {
        let already = self.connections.get(&conn).map_or(true, |h| h.greeting_sent);
        if !already {
            self.send_initial_greeting(conn);
        }
    }

    pub fn conn_peer_id(&self, conn: ConnectionId) -> Option<u16> {
        self.connections.get(&conn).and_then(|c| c.peer_id)
    }

    pub fn conn_of(&self, peer_id: u16) -> Option<&ConnectionHandle> {
        self.registry
            .get(peer_id)
            .and_then(|p| self.connections.get(&p.conn))
    }

    /// The socket died underneath us: clear the sync flag first (so the
    /// outward events see the transition), then forget the peer.
    pub fn on_closed(&mut self, conn: ConnectionId) {
        self.pending.retain(|id| *id != conn);
        let Some(handle) = self.connections.remove(&conn) else { return };
        if let Some(peer_id) = handle.peer_id {
            if self.registry.get(peer_id).is_some() {
                self.registry.set_synchronized(peer_id, false);
                self.emit_peer_lists();
                self.registry.remove(peer_id);
                log::debug!("connection for peer {peer_id} closed");
            }
        }
    }

    /// Explicit goodbye: drop the peer and its connection.
    pub fn on_goodbye(&mut self, conn: ConnectionId) {
        if let Some(peer_id) = self.conn_peer_id(conn) {
            self.registry.remove(peer_id);
            self.connections.remove(&conn);
            log::debug!("goodbye received from peer {peer_id}");
            self.emit_peer_lists();
        }
    }

    pub fn on_title(&mut self, conn: ConnectionId, title: &str) {
        match self.conn_peer_id(conn) {
            Some(peer_id) => {
                self.registry.set_title(peer_id, title);
            }
            None => log::debug!("title from unknown connection {conn}"),
        }
    }

    /// StartSynchronize semantics shared by all variants: mark the sender
    /// synchronized and, if it was not already, acknowledge with our own
    /// StartSynchronize (carrying the synchronized server ports). Re-requests
    /// are idempotent and not re-acknowledged, which keeps the exchange from
    /// ping-ponging.
    ///
    /// Returns `(peer_id, newly_synchronized)`.
    pub fn on_start_synchronize(&mut self, conn: ConnectionId) -> Option<(u16, bool)> {
        let Some(peer_id) = self.conn_peer_id(conn) else {
            log::debug!("start-synchronize from unknown connection {conn}");
            return None;
        };
        let was = self
            .registry
            .get(peer_id)
            .map_or(false, |p| p.is_synchronized());
        self.registry.set_synchronized(peer_id, true);
        if !was {
            let ports = self.registry.synchronized_server_ports();
            if let Some(handle) = self.connections.get(&conn) {
                handle.send_start_synchronize(ports);
            }
        }
        Some((peer_id, !was))
    }

    /// Returns the peer id whose sync flag was cleared.
    pub fn on_stop_synchronize(&mut self, conn: ConnectionId) -> Option<u16> {
        let Some(peer_id) = self.conn_peer_id(conn) else {
            log::debug!("stop-synchronize from unknown connection {conn}");
            return None;
        };
        self.registry.set_synchronized(peer_id, false);
        Some(peer_id)
    }

    /// Title goes to every known peer, synchronized or not.
    pub fn send_title_to_all(&self) {
        for peer in self.registry.peers() {
            if let Some(handle) = self.connections.get(&peer.conn) {
                handle.send_title(&self.title);
            }
        }
    }

    /// Run `f` for every synchronized peer's live connection, optionally
    /// excluding one peer (the originator, to prevent echo).
    pub fn for_each_synchronized<F: FnMut(&ConnectionHandle)>(
        &self,
        exclude: Option<u16>,
        mut f: F,
    ) {
        for peer in self.registry.synchronized() {
            if Some(peer.id) == exclude {
                continue;
            }
            match self.connections.get(&peer.conn) {
                Some(handle) => f(handle),
                None => log::debug!("peer {} has no live connection", peer.id),
            }
        }
    }

    /// Best-effort goodbye broadcast; nobody waits for an acknowledgment.
    pub fn goodbye_to_all(&self) {
        for peer in self.registry.peers() {
            if let Some(handle) = self.connections.get(&peer.conn) {
                handle.send_goodbye();
            }
        }
    }
}

pub(crate) fn snapshot(peer: &Peer) -> PeerSnapshot {
    PeerSnapshot {
        id: peer.id,
        title: peer.title.clone(),
        address: peer.address,
        local_port: peer.local_port,
        server_port: peer.server_port,
        client_name: peer.client_name.clone(),
        synchronized: peer.is_synchronized(),
        show_in_menu: peer.show_in_menu,
    }
}
