//! Remote-control manager: permissioned specialization of the LAN manager.
//!
//! Remote control runs on its own fixed UDP port so RC sessions never mix
//! with plain LAN sync groups. A freshly greeted peer is not admitted;
//! instead we immediately ask it for permission, and it answers from its
//! recent-peer allow-list. A peer only shows up in the externally visible
//! list once it granted permission *and* we initiated the connection: those
//! are the instances we may drive, as opposed to inbound attempts.

use std::collections::HashMap;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::connection::{ConnectionId, NetEvent};
use crate::discovery::lan::Discovered;
use crate::protocol::Message;

use super::lan::LanManager;
use super::{snapshot, Command, PeerSnapshot, SyncEvent};

/// Mode reported after a peer says goodbye.
pub(crate) const DEFAULT_RC_MODE: i32 = 0;

pub(crate) struct RcManager {
    lan: LanManager,
    /// peer id → whether that peer allows us to drive it.
    permissions: HashMap<u16, bool>,
    /// peer id → what we answered to its permission request.
    granted: HashMap<u16, bool>,
}

impl RcManager {
    pub async fn new(
        config: SyncConfig,
        title: String,
        events: mpsc::UnboundedSender<SyncEvent>,
        net_tx: mpsc::Sender<NetEvent>,
        accepted_tx: mpsc::Sender<TcpStream>,
        discovered_tx: mpsc::Sender<Discovered>,
    ) -> Self {
        let rc_port = config.rc_udp_port;
        let lan = LanManager::new(
            config,
            title,
            events,
            net_tx,
            accepted_tx,
            discovered_tx,
            rc_port,
            rc_port,
        )
        .await;
        Self {
            lan,
            permissions: HashMap::new(),
            granted: HashMap::new(),
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
                    self.lan.core.adopt_stream(stream, false);
                }
                Some(d) = discovered.recv() => {
                    self.lan.start_connection(d.address, d.port, d.name).await;
                }
            }
        }
        self.lan.core.goodbye_to_all();
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            // No hub handover in RC sessions: a controller synchronizes
            // directly with the instance it wants to drive.
            Command::SynchronizeWith(peer_id) => self.lan.request_synchronize(peer_id),
            Command::SynchronizeWithServerPort(port) => {
                match self.lan.core.registry.by_server_port(port).map(|p| p.id) {
                    Some(peer_id) => self.lan.request_synchronize(peer_id),
                    None => log::debug!("no peer advertising server port {port}"),
                }
            }
            Command::SendMode(mode) => {
                self.lan.core.for_each_synchronized(None, |h| {
                    h.send_rc_mode(mode);
                });
            }
            Command::GetPeerList(reply) => {
                let _ = reply.send(self.visible_peers());
            }
            other => return self.lan.handle_command(other).await,
        }
        false
    }

    async fn handle_net(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Closed { conn } => {
                if let Some(peer_id) = self.lan.core.conn_peer_id(conn) {
                    self.permissions.remove(&peer_id);
                    self.granted.remove(&peer_id);
                }
                self.lan.core.on_closed(conn);
            }
            NetEvent::Inbound { conn, msg } => self.handle_message(conn, msg).await,
        }
    }

    async fn handle_message(&mut self, conn: ConnectionId, msg: Message) {
        match msg {
            Message::Greeting { title, server_port, client_name } => {
                if self.lan.on_greeting(conn, server_port, title, client_name).is_some() {
                    // Nobody is auto-admitted: ask before anything else.
                    if let Some(handle) = self.lan.core.connections.get(&conn) {
                        handle.send_ask_for_permission();
                    }
                }
            }
            Message::AskForPermission => self.answer_permission_request(conn),
            Message::Permission { allowed } => {
                if let Some(peer_id) = self.lan.core.conn_peer_id(conn) {
                    log::info!(
                        "peer {peer_id} {} remote control",
                        if allowed { "granted" } else { "denied" }
                    );
                    self.permissions.insert(peer_id, allowed);
                }
            }
            Message::RcMode { mode } => {
                self.lan.core.emit(SyncEvent::ModeChanged(mode));
            }
            Message::StartSynchronize { .. } => {
                let Some(peer_id) = self.lan.core.conn_peer_id(conn) else {
                    log::debug!("start-synchronize from unknown connection {conn}");
                    return;
                };
                if self.granted.get(&peer_id).copied().unwrap_or(false) {
                    self.lan.on_start_synchronize(conn);
                } else {
                    log::debug!("peer {peer_id} tried to synchronize without permission");
                    if let Some(handle) = self.lan.core.connections.get(&conn) {
                        handle.send_status("synchronization not permitted");
                    }
                }
            }
            Message::Goodbye => {
                self.lan.core.emit(SyncEvent::ModeChanged(DEFAULT_RC_MODE));
                if let Some(peer_id) = self.lan.core.conn_peer_id(conn) {
                    self.permissions.remove(&peer_id);
                    self.granted.remove(&peer_id);
                }
                self.lan.on_goodbye(conn);
            }
            msg @ (Message::Transform { .. }
            | Message::Position { .. }
            | Message::File { .. }
            | Message::UpcomingImage { .. }
            | Message::Image { .. }) => {
                // A peer we never accepted synchronization from must not
                // drive this instance.
                if self.peer_synchronized(conn) {
                    self.lan.handle_message(conn, msg).await;
                } else {
                    log::debug!("dropping state message from unsynchronized connection {conn}");
                }
            }
            other => self.lan.handle_message(conn, other).await,
        }
    }

    fn peer_synchronized(&self, conn: ConnectionId) -> bool {
        self.lan
            .core
            .conn_peer_id(conn)
            .and_then(|id| self.lan.core.registry.get(id))
            .map_or(false, |p| p.is_synchronized())
    }

    /// Answer from the allow-list: instances we synchronized with before
    /// may drive us, strangers may not.
    fn answer_permission_request(&mut self, conn: ConnectionId) {
        let Some(peer_id) = self.lan.core.conn_peer_id(conn) else {
            log::debug!("permission request from unknown connection {conn}");
            return;
        };
        let name = self
            .lan
            .core
            .registry
            .get(peer_id)
            .map(|p| p.client_name.clone())
            .unwrap_or_default();
        let allowed = !name.is_empty()
            && self
                .lan
                .config
                .recent
                .lock()
                .map(|r| r.contains(&name))
                .unwrap_or(false);
        self.granted.insert(peer_id, allowed);
        if let Some(handle) = self.lan.core.connections.get(&conn) {
            handle.send_permission(allowed);
        }
        log::info!(
            "permission {} for peer {peer_id} ({name})",
            if allowed { "granted" } else { "denied" }
        );
    }

    /// Instances we may drive: permission granted and the connection was
    /// initiated by this side.
    fn visible_peers(&self) -> Vec<PeerSnapshot> {
        self.lan
            .core
            .registry
            .peers()
            .filter(|p| self.permissions.get(&p.id).copied().unwrap_or(false))
            .filter(|p| {
                self.lan
                    .core
                    .connections
                    .get(&p.conn)
                    .map_or(false, |h| h.initiated)
            })
            .map(snapshot)
            .collect()
    }
}
