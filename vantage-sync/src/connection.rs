//! Framed typed-message channel bound to one remote peer socket.
//!
//! A `ConnectionHandle` owns the outbound side of a connection and exposes
//! one explicit send method per message kind; a spawned reader task decodes
//! inbound frames and forwards them to the owning manager's net channel as
//! `NetEvent`s. The manager is the sole owner of handles; peers only keep
//! the connection id.
//!
//! ```text
//! TcpStream ──split──┬── read_loop ──► NetEvent::Inbound / Closed ──► manager
//!                    └── write_loop ◄── mpsc ◄── ConnectionHandle::send_*
//! ```

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{FileOp, Message, Transform, WindowRect};

/// Opaque per-manager connection identifier.
pub type ConnectionId = u64;

/// Upper bound on a single frame; anything larger closes the connection.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Inbound notifications delivered to the owning manager.
#[derive(Debug)]
pub(crate) enum NetEvent {
    Inbound { conn: ConnectionId, msg: Message },
    Closed { conn: ConnectionId },
}

/// Manager-owned handle to one live connection.
pub(crate) struct ConnectionHandle {
    pub id: ConnectionId,
    /// Remote endpoint of the socket. For connections we initiated the port
    /// is the peer's advertised server port; for accepted ones it is
    /// ephemeral.
    pub remote_addr: SocketAddr,
    /// Whether this side initiated the connection.
    pub initiated: bool,
    /// LAN metadata learned at discovery/handshake time.
    pub client_name: String,
    pub show_in_menu: bool,
    /// Assigned once the greeting handshake completes.
    pub peer_id: Option<u16>,
    /// Whether our own greeting has gone out on this connection.
    pub greeting_sent: bool,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    /// Take ownership of a connected stream and spawn its reader/writer
    /// tasks. Inbound messages and the closed notification arrive on
    /// `net_tx`.
    pub fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        initiated: bool,
        net_tx: mpsc::Sender<NetEvent>,
    ) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, out_rx));
        tokio::spawn(read_loop(reader, id, net_tx));
        Ok(Self {
            id,
            remote_addr,
            initiated,
            client_name: String::new(),
            show_in_menu: false,
            peer_id: None,
            greeting_sent: false,
            outbound: out_tx,
        })
    }

    /// Queue a message for sending. Returns false if the writer is gone.
    pub fn send(&self, msg: Message) -> bool {
        let ok = self.outbound.send(msg).is_ok();
        if !ok {
            log::debug!("send on closed connection {}", self.id);
        }
        ok
    }

    pub fn send_greeting(&self, title: &str, server_port: u16, client_name: &str) -> bool {
        self.send(Message::Greeting {
            title: title.to_string(),
            server_port,
            client_name: client_name.to_string(),
        })
    }

    pub fn send_start_synchronize(&self, synchronized_ports: Vec<u16>) -> bool {
        self.send(Message::StartSynchronize { synchronized_ports })
    }

    pub fn send_stop_synchronize(&self) -> bool {
        self.send(Message::StopSynchronize)
    }

    pub fn send_title(&self, title: &str) -> bool {
        self.send(Message::Title { title: title.to_string() })
    }

    pub fn send_transform(
        &self,
        transform: Transform,
        img_transform: Transform,
        canvas_size: (f64, f64),
    ) -> bool {
        self.send(Message::Transform { transform, img_transform, canvas_size })
    }

    pub fn send_position(&self, rect: WindowRect, opacity: bool, overlaid: bool) -> bool {
        self.send(Message::Position { rect, opacity, overlaid })
    }

    pub fn send_file(&self, op: FileOp, filename: &str) -> bool {
        self.send(Message::File { op, filename: filename.to_string() })
    }

    pub fn send_upcoming_image(&self, title: &str) -> bool {
        self.send(Message::UpcomingImage { title: title.to_string() })
    }

    pub fn send_image(&self, title: &str, data: &[u8]) -> bool {
        self.send(Message::Image {
            title: title.to_string(),
            data: data.to_vec(),
        })
    }

    pub fn send_switch_server(&self, address: IpAddr, port: u16) -> bool {
        self.send(Message::SwitchServer { address, port })
    }

    pub fn send_goodbye(&self) -> bool {
        self.send(Message::Goodbye)
    }

    pub fn send_quit(&self) -> bool {
        self.send(Message::Quit)
    }

    pub fn send_status(&self, text: &str) -> bool {
        self.send(Message::Status { text: text.to_string() })
    }

    pub fn send_ask_for_permission(&self) -> bool {
        self.send(Message::AskForPermission)
    }

    pub fn send_permission(&self, allowed: bool) -> bool {
        self.send(Message::Permission { allowed })
    }

    pub fn send_rc_mode(&self, mode: i32) -> bool {
        self.send(Message::RcMode { mode })
    }
}

async fn read_loop(mut reader: OwnedReadHalf, id: ConnectionId, net_tx: mpsc::Sender<NetEvent>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(bytes)) => match Message::decode(&bytes) {
                Ok(msg) => {
                    if net_tx.send(NetEvent::Inbound { conn: id, msg }).await.is_err() {
                        // Manager is gone; nothing left to notify.
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("undecodable frame on connection {id}: {e}");
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                log::debug!("read error on connection {id}: {e}");
                break;
            }
        }
    }
    let _ = net_tx.send(NetEvent::Closed { conn: id }).await;
}

/// Read one length-prefixed frame. `Ok(None)` means clean EOF.
async fn read_frame(reader: &mut OwnedReadHalf) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let bytes = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                log::warn!("dropping unencodable message: {e}");
                continue;
            }
        };
        let len = (bytes.len() as u32).to_be_bytes();
        if writer.write_all(&len).await.is_err() || writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
    // Handle dropped (or socket dead): flush the FIN so the peer sees EOF.
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_message_crosses_the_wire() {
        let (a_stream, b_stream) = loopback_pair().await;
        let (a_net_tx, _a_net_rx) = mpsc::channel(8);
        let (b_net_tx, mut b_net_rx) = mpsc::channel(8);

        let a = ConnectionHandle::spawn(1, a_stream, true, a_net_tx).unwrap();
        let _b = ConnectionHandle::spawn(1, b_stream, false, b_net_tx).unwrap();

        assert!(a.send_title("hello"));

        match b_net_rx.recv().await.unwrap() {
            NetEvent::Inbound { msg: Message::Title { title }, .. } => {
                assert_eq!(title, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drop_closes_remote() {
        let (a_stream, b_stream) = loopback_pair().await;
        let (a_net_tx, _a_net_rx) = mpsc::channel(8);
        let (b_net_tx, mut b_net_rx) = mpsc::channel(8);

        let a = ConnectionHandle::spawn(7, a_stream, true, a_net_tx).unwrap();
        let _b = ConnectionHandle::spawn(9, b_stream, false, b_net_tx).unwrap();

        drop(a);

        match b_net_rx.recv().await.unwrap() {
            NetEvent::Closed { conn } => assert_eq!(conn, 9),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (a_stream, b_stream) = loopback_pair().await;
        let (a_net_tx, _a_net_rx) = mpsc::channel(8);
        let (b_net_tx, mut b_net_rx) = mpsc::channel(8);

        let a = ConnectionHandle::spawn(1, a_stream, true, a_net_tx).unwrap();
        let _b = ConnectionHandle::spawn(2, b_stream, false, b_net_tx).unwrap();

        a.send_upcoming_image("shot");
        a.send_image("shot", &[1, 2, 3]);

        match b_net_rx.recv().await.unwrap() {
            NetEvent::Inbound { msg: Message::UpcomingImage { .. }, .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        match b_net_rx.recv().await.unwrap() {
            NetEvent::Inbound { msg: Message::Image { data, .. }, .. } => {
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
