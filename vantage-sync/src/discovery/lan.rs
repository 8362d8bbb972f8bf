//! LAN discovery: UDP beacon exchange over a port range.
//!
//! Two beacon kinds travel as `name@port` datagrams:
//!
//! - `newClient@0` — sent by instances looking for a group. The current hub
//!   answers with an identity beacon.
//! - `<hostname>@<tcp_port>` — identity of a hosting instance, sent every
//!   10 seconds while hosting and immediately when hosting starts or a
//!   `newClient` beacon arrives.
//!
//! Beacons originating from this host's own interface addresses are ignored
//! to prevent self-discovery. Malformed datagrams (wrong field count,
//! non-numeric port) are dropped.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identity beacon cadence while hosting.
pub(crate) const IDENTITY_INTERVAL: Duration = Duration::from_secs(10);

const NEW_CLIENT: &str = "newClient";

/// A beacon that maps to a connect candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Discovered {
    pub address: IpAddr,
    pub port: u16,
    pub name: String,
}

enum BeaconControl {
    StartIdentity(u16),
    StopIdentity,
    ClientBeacon,
}

/// Handle to the beacon task. Dropping it stops beaconing.
pub(crate) struct LanDiscovery {
    /// Port our UDP socket ended up on, `None` when the range was exhausted
    /// (discovery disabled, the session keeps running).
    pub udp_port: Option<u16>,
    control: mpsc::Sender<BeaconControl>,
    task: Option<JoinHandle<()>>,
}

impl LanDiscovery {
    /// Bind the first free UDP port in `start..=end` and start the beacon
    /// task. Discovered peers arrive on `discovered`.
    pub async fn spawn(start: u16, end: u16, discovered: mpsc::Sender<Discovered>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        match bind_first_free(start, end).await {
            Some((socket, port)) => {
                let task = tokio::spawn(beacon_loop(socket, start, end, control_rx, discovered));
                Self {
                    udp_port: Some(port),
                    control: control_tx,
                    task: Some(task),
                }
            }
            None => {
                log::warn!("no free UDP port in {start}..={end}; LAN discovery disabled");
                Self {
                    udp_port: None,
                    control: control_tx,
                    task: None,
                }
            }
        }
    }

    /// Begin identity beaconing for a hub listening on `tcp_port`.
    pub async fn start_identity(&self, tcp_port: u16) {
        let _ = self.control.send(BeaconControl::StartIdentity(tcp_port)).await;
    }

    pub async fn stop_identity(&self) {
        let _ = self.control.send(BeaconControl::StopIdentity).await;
    }

    /// Announce ourselves as a client looking for a hub.
    pub async fn client_beacon(&self) {
        let _ = self.control.send(BeaconControl::ClientBeacon).await;
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn bind_first_free(start: u16, end: u16) -> Option<(UdpSocket, u16)> {
    for port in start..=end {
        if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            if let Err(e) = socket.set_broadcast(true) {
                log::warn!("could not enable broadcast on beacon socket: {e}");
            }
            log::info!("beacon socket bound on UDP port {port}");
            return Some((socket, port));
        }
    }
    None
}

async fn beacon_loop(
    socket: UdpSocket,
    start: u16,
    end: u16,
    mut control: mpsc::Receiver<BeaconControl>,
    discovered: mpsc::Sender<Discovered>,
) {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "vantage".to_string());
    let local_addrs = local_addresses();
    let mut hosting: Option<u16> = None;
    let mut ticker = tokio::time::interval(IDENTITY_INTERVAL);
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            ctl = control.recv() => match ctl {
                Some(BeaconControl::StartIdentity(port)) => {
                    hosting = Some(port);
                    ticker.reset();
                    send_to_range(&socket, &encode_beacon(&host, port), start, end).await;
                }
                Some(BeaconControl::StopIdentity) => hosting = None,
                Some(BeaconControl::ClientBeacon) => {
                    send_to_range(&socket, &encode_beacon(NEW_CLIENT, 0), start, end).await;
                }
                None => return,
            },
            _ = ticker.tick(), if hosting.is_some() => {
                if let Some(port) = hosting {
                    send_to_range(&socket, &encode_beacon(&host, port), start, end).await;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("beacon receive failed: {e}");
                        continue;
                    }
                };
                handle_datagram(
                    &buf[..len], from, &local_addrs, hosting,
                    &socket, &host, start, end, &discovered,
                ).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    data: &[u8],
    from: SocketAddr,
    local_addrs: &[IpAddr],
    hosting: Option<u16>,
    socket: &UdpSocket,
    host: &str,
    start: u16,
    end: u16,
    discovered: &mpsc::Sender<Discovered>,
) {
    let Some((name, port)) = parse_beacon(data) else {
        log::debug!("dropping malformed beacon from {from}");
        return;
    };
    if is_local_address(from.ip(), local_addrs) {
        return;
    }
    if name == NEW_CLIENT && port == 0 {
        // A new client is looking for a group; answer only while hosting.
        if let Some(tcp_port) = hosting {
            send_to_range(socket, &encode_beacon(host, tcp_port), start, end).await;
        }
        return;
    }
    let _ = discovered
        .send(Discovered { address: from.ip(), port, name })
        .await;
}

/// `name@port` → (name, port). `None` for anything else.
pub(crate) fn parse_beacon(data: &[u8]) -> Option<(String, u16)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut fields = text.split('@');
    let name = fields.next()?;
    let port = fields.next()?;
    if fields.next().is_some() || name.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((name.to_string(), port))
}

pub(crate) fn encode_beacon(name: &str, port: u16) -> Vec<u8> {
    format!("{name}@{port}").into_bytes()
}

fn is_local_address(addr: IpAddr, local: &[IpAddr]) -> bool {
    addr.is_loopback() || local.contains(&addr)
}

fn local_addresses() -> Vec<IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => ifas.into_iter().map(|(_, addr)| addr).collect(),
        Err(e) => {
            log::warn!("could not enumerate local interfaces: {e}");
            Vec::new()
        }
    }
}

async fn send_to_range(socket: &UdpSocket, payload: &[u8], start: u16, end: u16) {
    for port in start..=end {
        if let Err(e) = socket.send_to(payload, (Ipv4Addr::BROADCAST, port)).await {
            // Broadcast may be unavailable (VPN-only hosts, sandboxes).
            log::debug!("beacon send to port {port} failed: {e}");
        }
    }
}
