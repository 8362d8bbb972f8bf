//! Binary protocol for instance view-state synchronization.
//!
//! Wire format: every message is one frame on the TCP stream,
//! `u32` big-endian length prefix followed by a bincode-encoded [`Message`].
//!
//! ```text
//! ┌───────────┬──────────────────────────────┐
//! │ len (u32) │ bincode(Message)             │
//! └───────────┴──────────────────────────────┘
//! ```
//!
//! The catalog mirrors what two viewer instances exchange over one
//! connection: a greeting handshake, synchronize on/off control, the
//! view-state updates themselves (title, transform, window position, file
//! navigation, image content) and the hub-handover / permission messages.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Reserved peer id meaning "all synchronized peers" for stop-synchronize.
pub const SYNC_WILDCARD_PEER_ID: u16 = u16::MAX;

/// 2-D affine view transform (row-major 2×2 plus translation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub m11: f64,
    pub m12: f64,
    pub m21: f64,
    pub m22: f64,
    pub dx: f64,
    pub dy: f64,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        m11: 1.0,
        m12: 0.0,
        m21: 0.0,
        m22: 1.0,
        dx: 0.0,
        dy: 0.0,
    };

    /// Pure translation.
    pub fn translation(dx: f64, dy: f64) -> Self {
        Transform { dx, dy, ..Self::IDENTITY }
    }

    /// Uniform scale about the origin.
    pub fn scale(factor: f64) -> Self {
        Transform {
            m11: factor,
            m22: factor,
            ..Self::IDENTITY
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Window geometry in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl WindowRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// File navigation operation carried by [`Message::File`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOp {
    /// Open the named file.
    Open,
    /// Step to the next file in the peer's playlist.
    Next,
    /// Step to the previous file.
    Previous,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Handshake, sent once per new connection by each side.
    /// `server_port` is the port this instance accepts inbound
    /// synchronization on (0 when it has none); `client_name` identifies
    /// the instance for allow-listing and is empty for same-host sync.
    Greeting {
        title: String,
        server_port: u16,
        client_name: String,
    },
    /// Request (and acknowledgement) to include the sender in the
    /// receiver's broadcast set. Carries the advertised server ports of the
    /// peers already synchronized with the sender so a joining instance can
    /// complete the mesh.
    StartSynchronize { synchronized_ports: Vec<u16> },
    StopSynchronize,
    /// Window title update.
    Title { title: String },
    /// Pan/zoom state: view transform, image transform, canvas extent.
    Transform {
        transform: Transform,
        img_transform: Transform,
        canvas_size: (f64, f64),
    },
    /// Window placement update.
    Position {
        rect: WindowRect,
        opacity: bool,
        overlaid: bool,
    },
    /// File navigation event.
    File { op: FileOp, filename: String },
    /// Announces that an [`Message::Image`] frame follows.
    UpcomingImage { title: String },
    /// Image content transfer. The pixel encoding is opaque to this layer.
    Image { title: String, data: Vec<u8> },
    /// Hub handover: reconnect to the instance at `address`:`port`.
    SwitchServer { address: IpAddr, port: u16 },
    Goodbye,
    /// Same-host only: ask all sibling instances to quit.
    Quit,
    /// Advisory text for the receiver's status display.
    Status { text: String },
    /// Remote control: ask the receiver whether we may drive it.
    AskForPermission,
    /// Remote control: answer to [`Message::AskForPermission`].
    Permission { allowed: bool },
    /// Remote control: interaction mode broadcast.
    RcMode { mode: i32 },
}

impl Message {
    /// Serialize to the bincode wire encoding (frame body, no length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize a frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    FrameTooLarge(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::FrameTooLarge(n) => write!(f, "Frame of {n} bytes exceeds limit"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_roundtrip() {
        let msg = Message::Greeting {
            title: "a.jpg - vantage".to_string(),
            server_port: 49200,
            client_name: "workstation".to_string(),
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Greeting {
                title,
                server_port,
                client_name,
            } => {
                assert_eq!(title, "a.jpg - vantage");
                assert_eq!(server_port, 49200);
                assert_eq!(client_name, "workstation");
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_transform_payload_roundtrip() {
        let msg = Message::Transform {
            transform: Transform::scale(2.0),
            img_transform: Transform::translation(10.0, -4.5),
            canvas_size: (1920.0, 1080.0),
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Transform {
                transform,
                img_transform,
                canvas_size,
            } => {
                assert_eq!(transform.m11, 2.0);
                assert_eq!(img_transform.dx, 10.0);
                assert_eq!(canvas_size, (1920.0, 1080.0));
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_switch_server_carries_address() {
        let msg = Message::SwitchServer {
            address: "192.168.1.17".parse().unwrap(),
            port: 40123,
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::SwitchServer { address, port } => {
                assert_eq!(address, "192.168.1.17".parse::<IpAddr>().unwrap());
                assert_eq!(port, 40123);
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Message::decode(&garbage).is_err());
    }

    #[test]
    fn test_wildcard_is_max_u16() {
        assert_eq!(SYNC_WILDCARD_PEER_ID, 65535);
    }

    #[test]
    fn test_identity_transform() {
        let t = Transform::default();
        assert_eq!(t, Transform::IDENTITY);
        assert_eq!(t.m11, 1.0);
        assert_eq!(t.dx, 0.0);
    }

    #[test]
    fn test_large_image_frame() {
        // A 4K RGBA screenshot is ~32MB; make sure big payloads survive.
        let data = vec![42u8; 1 << 20];
        let msg = Message::Image {
            title: "shot".to_string(),
            data: data.clone(),
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Image { data: d, .. } => assert_eq!(d, data),
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }
}
