//! Same-host manager: full mesh between sibling instances.
//!
//! Discovery is a port scan over the configured loopback range; every pair
//! of synchronized instances talks directly, so nothing is ever forwarded.
//! A joining instance learns the rest of the mesh from the port list inside
//! the StartSynchronize acknowledgment and greets each member itself.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::connection::{ConnectionId, NetEvent};
use crate::discovery;
use crate::discovery::local::LocalListener;
use crate::protocol::Message;

use super::{snapshot, Command, PeerSnapshot, SyncCore, SyncEvent};

pub(crate) struct LocalManager {
    core: SyncCore,
    config: SyncConfig,
    listener: Option<LocalListener>,
}

impl LocalManager {
    pub async fn new(
        config: SyncConfig,
        title: String,
        events: mpsc::UnboundedSender<SyncEvent>,
        net_tx: mpsc::Sender<NetEvent>,
        accepted_tx: mpsc::Sender<TcpStream>,
    ) -> Self {
        let listener =
            LocalListener::bind(config.local_port_start, config.local_port_end, accepted_tx).await;
        let mut core = SyncCore::new(title, config.client_name.clone(), events, net_tx);
        core.server_port = listener.as_ref().map_or(0, |l| l.port);
        Self { core, config, listener }
    }

    pub fn server_port(&self) -> u16 {
        self.listener.as_ref().map_or(0, |l| l.port)
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut net: mpsc::Receiver<NetEvent>,
        mut accepted: mpsc::Receiver<TcpStream>,
    ) {
        self.search_for_clients().await;
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
                Some(ev) = net.recv() => self.handle_net(ev),
                Some(stream) = accepted.recv() => {
                    self.core.adopt_stream(stream, false);
                }
            }
        }
        self.core.goodbye_to_all();
    }

    /// Returns true when the session should shut down.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SynchronizeWith(peer_id) => self.synchronize_with(peer_id),
            Command::SynchronizeWithServerPort(port) => {
                match self.core.registry.by_server_port(port).map(|p| p.id) {
                    Some(peer_id) => self.synchronize_with(peer_id),
                    None => log::debug!("no peer advertising server port {port}"),
                }
            }
            // The local mesh always stops synchronizing with everyone.
            Command::StopSynchronizeWith(_) => self.stop_synchronize_all(),
            Command::SendTitle(title) => {
                self.core.title = title;
                self.core.send_title_to_all();
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
            Command::ArrangeInstances { screen, overlaid } => {
                self.arrange_instances(screen, overlaid);
            }
            Command::SearchForClients => self.search_for_clients().await,
            Command::QuitPeers => {
                for peer in self.core.registry.peers() {
                    if let Some(handle) = self.core.connections.get(&peer.conn) {
                        handle.send_quit();
                    }
                }
            }
            Command::GetPeerList(reply) => {
                let _ = reply.send(self.peer_list());
            }
            Command::Shutdown => return true,
            other => log::debug!("command not available for local sync: {other:?}"),
        }
        false
    }

    fn handle_net(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Closed { conn } => self.core.on_closed(conn),
            NetEvent::Inbound { conn, msg } => self.handle_message(conn, msg),
        }
    }

    fn handle_message(&mut self, conn: ConnectionId, msg: Message) {
        match msg {
            Message::Greeting { title, server_port, client_name } => {
                if self.core.on_greeting(conn, server_port, title, client_name).is_some() {
                    // Make sure the newcomer has our current title.
                    self.core.send_title_to_all();
                }
            }
            Message::StartSynchronize { synchronized_ports } => {
                if self.core.on_start_synchronize(conn).is_some() {
                    self.core.emit_peer_lists();
                    self.join_listed_peers(conn, &synchronized_ports);
                }
            }
            Message::StopSynchronize => {
                if self.core.on_stop_synchronize(conn).is_some() {
                    self.core.emit_peer_lists();
                }
            }
            Message::Title { title } => self.core.on_title(conn, &title),
            Message::Transform { transform, img_transform, canvas_size } => {
                self.core.emit(SyncEvent::Transform { transform, img_transform, canvas_size });
            }
            Message::Position { rect, opacity, overlaid } => {
                self.core.emit(SyncEvent::Position { rect, opacity, overlaid });
            }
            Message::File { op, filename } => {
                self.core.emit(SyncEvent::File { op, filename });
            }
            Message::Goodbye => self.core.on_goodbye(conn),
            Message::Quit => self.core.emit(SyncEvent::Quit),
            Message::Status { text } => {
                self.core.emit(SyncEvent::Info { message: text, duration_ms: 2000 });
            }
            other => log::debug!("unhandled message for local sync: {other:?}"),
        }
    }

    /// Scan the configured port range for sibling instances. Ports that do
    /// not answer within the probe timeout are simply skipped.
    async fn search_for_clients(&mut self) {
        let own = self.server_port();
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        for port in self.config.local_port_start..=self.config.local_port_end {
            if port == own {
                continue;
            }
            if self.core.registry.is_connected_to(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
                || self.core.pending_to(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            {
                continue;
            }
            let Some(stream) =
                discovery::probe(IpAddr::V4(Ipv4Addr::LOCALHOST), port, timeout).await
            else {
                continue;
            };
            if let Some(conn) = self.core.adopt_stream(stream, true) {
                self.core.send_initial_greeting(conn);
            }
        }
    }

    /// Optimistically mark the peer synchronized and ask it to reciprocate.
    /// The flag is cleared again if the connection drops instead.
    fn synchronize_with(&mut self, peer_id: u16) {
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

    fn stop_synchronize_all(&mut self) {
        for peer_id in self.core.registry.synchronized_ids() {
            if let Some(handle) = self.core.conn_of(peer_id) {
                handle.send_stop_synchronize();
            }
            self.core.registry.set_synchronized(peer_id, false);
        }
        self.core.emit_peer_lists();
    }

    /// Mesh closure: an acknowledgment carries the server ports of everyone
    /// already synchronized with the sender; greet each one we know but are
    /// not synchronized with yet.
    fn join_listed_peers(&mut self, from: ConnectionId, ports: &[u16]) {
        let own = self.server_port();
        let from_peer = self.core.conn_peer_id(from);
        for &port in ports {
            if port == own || port == 0 {
                continue;
            }
            let Some((peer_id, synced)) = self
                .core
                .registry
                .by_server_port(port)
                .map(|p| (p.id, p.is_synchronized()))
            else {
                continue;
            };
            if Some(peer_id) == from_peer || synced {
                continue;
            }
            self.synchronize_with(peer_id);
        }
    }

    /// Tile this instance plus every synchronized peer across the screen,
    /// row-major: 2 columns for 2 or 4 instances, 3 otherwise.
    fn arrange_instances(&mut self, screen: crate::protocol::WindowRect, overlaid: bool) {
        let synced = self.core.registry.synchronized_ids();
        let count = synced.len() + 1;
        if count == 1 {
            return;
        }
        let cols = if count == 2 || count == 4 { 2 } else { 3 };
        let rows = (count + cols - 1) / cols;
        let width = screen.width / cols as i32;
        let height = screen.height / rows as i32;
        let tile = |i: usize| crate::protocol::WindowRect {
            x: screen.x + (i % cols) as i32 * width,
            y: screen.y + (i / cols) as i32 * height,
            width,
            height,
        };

        // Tile 0 is ours; the shell applies it via the position event.
        self.core.emit(SyncEvent::Position { rect: tile(0), opacity: false, overlaid });
        for (i, peer_id) in synced.iter().enumerate() {
            if let Some(handle) = self.core.conn_of(*peer_id) {
                handle.send_position(tile(i + 1), false, overlaid);
            }
        }
    }

    fn peer_list(&self) -> Vec<PeerSnapshot> {
        self.core.registry.peers().map(snapshot).collect()
    }
}
