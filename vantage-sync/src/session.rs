//! Worker-task boundary for one synchronization session.
//!
//! The manager (with its registry, connections and discovery transports) is
//! constructed, lives, and is destroyed inside one dedicated worker task.
//! The owning side never touches it directly: it only sends [`Command`]s
//! and receives [`SyncEvent`]s over channels. `spawn_*` waits on a oneshot
//! readiness barrier so the manager is fully initialized before the first
//! command or event can reach it.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::manager::lan::LanManager;
use crate::manager::local::LocalManager;
use crate::manager::rc::RcManager;
use crate::manager::{Command, SyncEvent};

/// Handle to a running synchronization session.
pub struct SyncSession {
    commands: mpsc::Sender<Command>,
    events: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    server_port: u16,
    worker: JoinHandle<()>,
}

enum SessionKind {
    Local,
    Lan,
    RemoteControl,
}

impl SyncSession {
    /// Same-host mesh session. Binds a loopback listener (if a port is
    /// free) and scans the configured range for sibling instances.
    pub async fn spawn_local(config: SyncConfig, title: impl Into<String>) -> Self {
        Self::spawn(SessionKind::Local, config, title.into()).await
    }

    /// LAN star session with UDP beacon discovery.
    pub async fn spawn_lan(config: SyncConfig, title: impl Into<String>) -> Self {
        Self::spawn(SessionKind::Lan, config, title.into()).await
    }

    /// Remote-control session on the dedicated RC port.
    pub async fn spawn_rc(config: SyncConfig, title: impl Into<String>) -> Self {
        Self::spawn(SessionKind::RemoteControl, config, title.into()).await
    }

    async fn spawn(kind: SessionKind, config: SyncConfig, title: String) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = tokio::spawn(async move {
            let (net_tx, net_rx) = mpsc::channel(256);
            let (accept_tx, accept_rx) = mpsc::channel(16);
            let (disc_tx, disc_rx) = mpsc::channel(16);

            match kind {
                SessionKind::Local => {
                    let manager =
                        LocalManager::new(config, title, event_tx, net_tx, accept_tx).await;
                    let _ = ready_tx.send(manager.server_port());
                    manager.run(cmd_rx, net_rx, accept_rx).await;
                }
                SessionKind::Lan => {
                    let udp = (config.lan_udp_port_start, config.lan_udp_port_end);
                    let manager = LanManager::new(
                        config,
                        title,
                        event_tx,
                        net_tx,
                        accept_tx.clone(),
                        disc_tx,
                        udp.0,
                        udp.1,
                    )
                    .await;
                    let _ = ready_tx.send(0);
                    manager.run(cmd_rx, net_rx, accept_rx, disc_rx).await;
                }
                SessionKind::RemoteControl => {
                    let manager = RcManager::new(
                        config,
                        title,
                        event_tx,
                        net_tx,
                        accept_tx.clone(),
                        disc_tx,
                    )
                    .await;
                    let _ = ready_tx.send(0);
                    manager.run(cmd_rx, net_rx, accept_rx, disc_rx).await;
                }
            }
            log::debug!("sync worker finished");
        });

        // Barrier: the manager exists before any command can reach it.
        let server_port = ready_rx.await.unwrap_or(0);

        Self {
            commands: cmd_tx,
            events: Some(event_rx),
            server_port,
            worker,
        }
    }

    /// Sender for inward requests. Cheap to clone.
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// Convenience: queue one command, ignoring a closed worker.
    pub async fn send(&self, cmd: Command) -> bool {
        self.commands.send(cmd).await.is_ok()
    }

    /// Take the outward event stream. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.events.take()
    }

    /// Loopback listener port of a local session (0 if none was free, or
    /// for LAN/RC sessions, whose hub port arrives via
    /// [`SyncEvent::ServerPortChanged`]).
    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    /// Orderly teardown: goodbye to all peers (best effort), then the
    /// worker drops the manager on its own context.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.worker.await;
    }
}
