//! LAN manager: star topology around a single elected hub.
//!
//! Direct connection enumeration is impossible across a network, so
//! instances find each other through UDP beacons: a hosting instance
//! answers `newClient` beacons with its identity, and every identity beacon
//! that is not already connected or in flight becomes an outbound connect.
//!
//! Only the hub forwards view-state messages, always excluding the
//! originator, which keeps propagation loop-free with one hop regardless of group
//! size. When a hosting instance starts synchronizing with another peer it
//! must hand the hub role over first, so at most one hub is active per
//! group at any time.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::connection::{ConnectionId, NetEvent};
use crate::discovery;
use crate::discovery::lan::{Discovered, LanDiscovery};
use crate::protocol::{Message, SYNC_WILDCARD_PEER_ID};

use super::{snapshot, Command, PeerSnapshot, SyncCore, SyncEvent};

pub(crate) struct LanManager {
    pub(crate) core: SyncCore,
    pub(crate) config: SyncConfig,
    discovery: LanDiscovery,
    hosting: bool,
    listener: Option<JoinHandle<()>>,
    accepted_tx: mpsc::Sender<TcpStream>,
    /// Endpoints to synchronize with as soon as their handshake completes
    /// (SwitchServer targets we were not yet connected to).
    sync_pending: Vec<(IpAddr, u16)>,
}

impl LanManager {
    pub async fn new(
        config: SyncConfig,
        title: String,
        events: mpsc::UnboundedSender<SyncEvent>,
        net_tx: mpsc::Sender<NetEvent>,
        accepted_tx: mpsc::Sender<TcpStream>,
        discovered_tx: mpsc::Sender<Discovered>,
        udp_start: u16,
        udp_end: u16,
    ) -> Self {
        let discovery = LanDiscovery::spawn(udp_start, udp_end, discovered_tx).await;
        // Announce ourselves once so an existing hub can answer.
        discovery.client_beacon().await;
        let core = SyncCore::new(title, config.client_name.clone(), events, net_tx);
        Self {
            core,
            config,
            discovery,
            hosting: false,
            listener: None,
            accepted_tx,
            sync_pending: Vec::new(),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut net: mpsc::Receiver<NetEvent>,
        mut accepted: mpsc::Receiver<TcpStream>,
        mut discovered: mpsc::Receiver<Discovered>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(ev) = net.recv() => self.handle_net(ev).await,
                Some(stream) = accepted.recv() => {
                    self.core.adopt_stream(stream, false);
                }
                Some(d) = discovered.recv() => {
                    self.start_connection(d.address, d.port, d.name).await;
                }
            }
        }
        self.core.goodbye_to_all();
    }

    /// Returns true when the session should shut down.
    pub(crate) async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SynchronizeWith(peer_id) => self.synchronize_with(peer_id).await,
            Command::SynchronizeWithServerPort(port) => {
                match self.core.registry.by_server_port(port).map(|p| p.id) {
                    Some(peer_id) => self.synchronize_with(peer_id).await,
                    None => log::debug!("no peer advertising server port {port}"),
                }
            }
            Command::StopSynchronizeWith(peer_id) => self.stop_synchronize_with(peer_id),
            Command::SendTitle(title) => {
                self.core.title = title;
                // Only the hub pushes its title to the group.
                if self.hosting {
                    self.core.send_title_to_all();
                }
            }
            Command::SendTransform { transform, img_transform, canvas_size } => {
                self.core.for_each_synchronized(None, |h| {
                    h.send_transform(transform, img_transform, canvas_size);
                });
            }
            Command::SendPosition { rect, overlaid } => {
                self.core.for_each_synchronized(None, |h| {
                    h.send_position(rect, true, overlaid);
                });
            }
            Command::SendFile { op, filename } => {
                self.core.for_each_synchronized(None, |h| {
                    h.send_file(op, &filename);
                });
            }
            Command::SendImage { title, data } => {
                self.core.for_each_synchronized(None, |h| {
                    h.send_upcoming_image(&title);
                    h.send_image(&title, &data);
                });
            }
            Command::SearchForClients => self.discovery.client_beacon().await,
            Command::StartServer(flag) => self.start_server(flag).await,
            Command::ConnectToHost { address, port, name } => {
                self.start_connection(address, port, name).await;
            }
            Command::GetPeerList(reply) => {
                let _ = reply.send(self.visible_peers());
            }
            Command::Shutdown => return true,
            other => log::debug!("command not available for LAN sync: {other:?}"),
        }
        false
    }

    pub(crate) async fn handle_net(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Closed { conn } => self.core.on_closed(conn),
            NetEvent::Inbound { conn, msg } => self.handle_message(conn, msg).await,
        }
    }

    pub(crate) async fn handle_message(&mut self, conn: ConnectionId, msg: Message) {
        match msg {
            Message::Greeting { title, server_port, client_name } => {
                self.on_greeting(conn, server_port, title, client_name);
            }
            Message::StartSynchronize { .. } => self.on_start_synchronize(conn),
            Message::StopSynchronize => {
                if let Some(peer_id) = self.core.on_stop_synchronize(conn) {
                    self.core.registry.set_show_in_menu(peer_id, false);
                    self.core.emit_peer_lists();
                }
            }
            Message::Title { title } => {
                self.core.on_title(conn, &title);
                self.forward(conn, |h| {
                    h.send_title(&title);
                });
            }
            Message::Transform { transform, img_transform, canvas_size } => {
                self.core.emit(SyncEvent::Transform { transform, img_transform, canvas_size });
                self.forward(conn, |h| {
                    h.send_transform(transform, img_transform, canvas_size);
                });
            }
            Message::Position { rect, opacity, overlaid } => {
                self.core.emit(SyncEvent::Position { rect, opacity, overlaid });
                self.forward(conn, |h| {
                    h.send_position(rect, opacity, overlaid);
                });
            }
            Message::File { op, filename } => {
                self.core.emit(SyncEvent::File { op, filename: filename.clone() });
                self.forward(conn, |h| {
                    h.send_file(op, &filename);
                });
            }
            Message::UpcomingImage { title } => {
                self.core.emit(SyncEvent::Info {
                    message: format!("receiving image:\n{title}"),
                    duration_ms: 2000,
                });
                self.forward(conn, |h| {
                    h.send_upcoming_image(&title);
                });
            }
            Message::Image { title, data } => {
                self.core.emit(SyncEvent::Image { title: title.clone(), data: data.clone() });
                self.forward(conn, |h| {
                    h.send_image(&title, &data);
                });
            }
            Message::SwitchServer { address, port } => {
                self.on_switch_server(conn, address, port).await;
            }
            Message::Goodbye => self.on_goodbye(conn),
            Message::Status { text } => {
                self.core.emit(SyncEvent::Info { message: text, duration_ms: 2000 });
            }
            other => log::debug!("unhandled message for LAN sync: {other:?}"),
        }
    }

    /// Hub-only propagation: re-send to every synchronized peer except the
    /// originator. Non-hub instances never forward.
    fn forward<F: FnMut(&crate::connection::ConnectionHandle)>(
        &self,
        from: ConnectionId,
        f: F,
    ) {
        if !self.hosting {
            return;
        }
        let from_peer = self.core.conn_peer_id(from);
        self.core.for_each_synchronized(from_peer, f);
    }

    pub(crate) fn on_greeting(
        &mut self,
        conn: ConnectionId,
        server_port: u16,
        title: String,
        client_name: String,
    ) -> Option<u16> {
        let peer_id = self.core.on_greeting(conn, server_port, title, client_name)?;
        // A handover pointed us here before the handshake was done.
        let endpoint = self
            .core
            .registry
            .get(peer_id)
            .map(|p| (p.address, p.local_port))?;
        if let Some(pos) = self.sync_pending.iter().position(|e| *e == endpoint) {
            self.sync_pending.remove(pos);
            self.request_synchronize(peer_id);
        }
        Some(peer_id)
    }

    pub(crate) fn on_start_synchronize(&mut self, conn: ConnectionId) {
        let Some((peer_id, _newly)) = self.core.on_start_synchronize(conn) else {
            return;
        };
        self.core.registry.set_show_in_menu(peer_id, true);
        self.core.emit_peer_lists();
        // Remember who we synchronized with, for allow-listing.
        let name = self
            .core
            .registry
            .get(peer_id)
            .map(|p| p.client_name.clone())
            .unwrap_or_default();
        if !name.is_empty() {
            if let Ok(mut recent) = self.config.recent.lock() {
                recent.record(&name);
                log::debug!("added {name} to recently seen peers");
            }
        }
    }

    pub(crate) fn on_goodbye(&mut self, conn: ConnectionId) {
        self.core.on_goodbye(conn);
    }

    /// Connect to a discovered or explicitly named endpoint. Duplicate and
    /// in-flight endpoints are skipped; an unreachable candidate is simply
    /// discarded.
    pub(crate) async fn start_connection(&mut self, address: IpAddr, port: u16, name: String) {
        if self.core.registry.is_connected_to(address, port) {
            log::debug!("already connected to {address}:{port}");
            return;
        }
        if self.core.pending_to(address, port) {
            log::debug!("already connecting to {address}:{port}");
            return;
        }
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let Some(stream) = discovery::probe(address, port, timeout).await else {
            log::debug!("could not reach {address}:{port}");
            return;
        };
        log::info!("connected to {address}:{port}");
        if let Some(conn) = self.core.adopt_stream(stream, true) {
            if let Some(handle) = self.core.connections.get_mut(&conn) {
                handle.client_name = name;
                handle.show_in_menu = true;
            }
            self.core.send_initial_greeting(conn);
        }
    }

    /// Assume or relinquish the hub role.
    pub(crate) async fn start_server(&mut self, flag: bool) {
        if flag {
            if self.hosting {
                log::debug!("already hosting");
                return;
            }
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
                Ok(listener) => {
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
                    self.listener =
                        Some(discovery::spawn_accept_loop(listener, self.accepted_tx.clone()));
                    self.core.server_port = port;
                    self.hosting = true;
                    self.discovery.start_identity(port).await;
                    self.core.emit(SyncEvent::ServerPortChanged(port));
                    log::info!("hosting on TCP port {port}");
                }
                Err(e) => log::warn!("could not open hub listener: {e}"),
            }
        } else {
            // Tell everyone before the listener goes away.
            self.core.goodbye_to_all();
            self.stop_synchronization_all();
            self.stop_hosting().await;
        }
    }

    async fn stop_hosting(&mut self) {
        if let Some(task) = self.listener.take() {
            task.abort();
        }
        if self.hosting {
            self.hosting = false;
            self.core.server_port = 0;
            self.discovery.stop_identity().await;
            self.core.emit(SyncEvent::ServerPortChanged(0));
            log::info!("stopped hosting");
        }
    }

    /// Tear down the whole synchronized set: clear the flags first, then
    /// drop the connections and forget the peers.
    pub(crate) fn stop_synchronization_all(&mut self) {
        let synced = self.core.registry.synchronized_ids();
        for peer_id in &synced {
            if let Some(handle) = self.core.conn_of(*peer_id) {
                handle.send_stop_synchronize();
            }
            self.core.registry.set_synchronized(*peer_id, false);
        }
        self.core.emit_peer_lists();
        for peer_id in synced {
            if let Some(conn) = self.core.registry.get(peer_id).map(|p| p.conn) {
                self.core.connections.remove(&conn);
            }
            self.core.registry.remove(peer_id);
        }
    }

    pub(crate) fn stop_synchronize_with(&mut self, peer_id: u16) {
        if peer_id == SYNC_WILDCARD_PEER_ID {
            log::debug!("stopping synchronization with all peers");
            self.stop_synchronization_all();
            return;
        }
        if self.core.registry.get(peer_id).is_none() {
            log::debug!("stop-synchronize for unknown peer {peer_id}");
            return;
        }
        match self.core.conn_of(peer_id) {
            Some(handle) => {
                handle.send_stop_synchronize();
            }
            None => log::debug!("peer {peer_id} has no live connection"),
        }
        self.core.registry.set_synchronized(peer_id, false);
        if self.hosting {
            self.core.registry.set_show_in_menu(peer_id, false);
        }
        self.core.emit_peer_lists();
    }

    /// Synchronize with a peer. A hosting instance must hand the hub role
    /// over first so the group never has two hubs.
    pub(crate) async fn synchronize_with(&mut self, peer_id: u16) {
        if self.hosting {
            self.relinquish_hub(peer_id).await;
        }
        self.request_synchronize(peer_id);
    }

    /// Optimistically mark the peer synchronized and ask it to reciprocate.
    pub(crate) fn request_synchronize(&mut self, peer_id: u16) {
        if !self.core.registry.set_synchronized(peer_id, true) {
            log::debug!("synchronize-with for unknown peer {peer_id}");
            return;
        }
        self.core.emit_peer_lists();
        let ports = self.core.registry.synchronized_server_ports();
        match self.core.conn_of(peer_id) {
            Some(handle) => {
                handle.send_start_synchronize(ports);
            }
            None => log::debug!("peer {peer_id} has no live connection"),
        }
    }

    /// Hub handover: point every synchronized peer at the new hub, say
    /// goodbye, demote the old group, and stop hosting. The brief window in
    /// which nobody hosts self-heals through normal reconnect flows.
    async fn relinquish_hub(&mut self, target_id: u16) {
        let Some((addr, port)) = self
            .core
            .registry
            .get(target_id)
            .map(|p| (p.address, p.server_port))
        else {
            log::debug!("handover target {target_id} unknown");
            return;
        };
        let synced: Vec<u16> = self
            .core
            .registry
            .synchronized_ids()
            .into_iter()
            .filter(|id| *id != target_id)
            .collect();
        log::info!("handing hub role over to {addr}:{port} ({} peers)", synced.len());
        for peer_id in &synced {
            if let Some(handle) = self.core.conn_of(*peer_id) {
                handle.send_switch_server(addr, port);
                handle.send_goodbye();
            }
            self.core.registry.set_show_in_menu(*peer_id, false);
        }
        for peer_id in synced {
            self.core.registry.set_synchronized(peer_id, false);
            if let Some(conn) = self.core.registry.get(peer_id).map(|p| p.conn) {
                self.core.connections.remove(&conn);
            }
            self.core.registry.remove(peer_id);
        }
        self.core.emit_peer_lists();
        self.stop_hosting().await;
    }

    /// The hub moved: stop following the sender and synchronize with the
    /// instance it named, connecting first if we are not connected yet.
    async fn on_switch_server(&mut self, from: ConnectionId, address: IpAddr, port: u16) {
        if let Some(old_id) = self.core.conn_peer_id(from) {
            if let Some(handle) = self.core.connections.get(&from) {
                handle.send_stop_synchronize();
            }
            self.core.registry.set_synchronized(old_id, false);
            self.core.emit_peer_lists();
        }
        if let Some(peer_id) = self.core.registry.by_endpoint(address, port).map(|p| p.id) {
            self.request_synchronize(peer_id);
            return;
        }
        self.sync_pending.retain(|e| *e != (address, port));
        self.sync_pending.push((address, port));
        self.start_connection(address, port, String::new()).await;
    }

    /// Peers the user should see: those flagged visible.
    pub(crate) fn visible_peers(&self) -> Vec<PeerSnapshot> {
        self.core
            .registry
            .peers()
            .filter(|p| p.show_in_menu)
            .map(snapshot)
            .collect()
    }
}
