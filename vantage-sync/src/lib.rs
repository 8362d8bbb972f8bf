//! # vantage-sync — instance synchronization layer for Vantage
//!
//! Lets independently running viewer instances discover one another and
//! mirror view state — current file, pan/zoom transform, window placement
//! and (on a LAN) image content — in near-real time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────────────────────────────┐
//! │ shell /      │ ──────────► │ worker task                          │
//! │ renderer     │ ◄────────── │  ClientManager ── PeerRegistry       │
//! └──────────────┘   events    │       │                              │
//!                              │       ├── discovery (scan / beacon)  │
//!                              │       └── Connections (TCP frames)   │
//!                              └──────────────────────────────────────┘
//! ```
//!
//! Three session flavors:
//!
//! - **Local** — siblings on one host, found by port scanning, full mesh.
//! - **LAN** — UDP beacon discovery, star topology around a single hub;
//!   hub status hands over so a group never has two.
//! - **Remote control** — LAN variant gated behind explicit permission.
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded [`Message`])
//! - [`connection`] — framed typed-message channel per peer socket
//! - [`peer`] — peer records and the single-writer registry
//! - `discovery` — port scanning and UDP beaconing (crate-internal)
//! - [`manager`] — the client managers and their command/event surface
//! - [`session`] — worker-task boundary ([`SyncSession`])
//! - [`config`] — port ranges, instance name, recent-peer allow-list

pub mod config;
pub mod connection;
pub mod manager;
pub mod peer;
pub mod protocol;
pub mod session;

pub(crate) mod discovery;

// Re-exports for convenience
pub use config::{RecentPeers, RecentPeersHandle, SyncConfig};
pub use manager::{Command, PeerSnapshot, SyncEvent};
pub use peer::{Peer, PeerRegistry, ACTIVE_DEBOUNCE};
pub use protocol::{
    FileOp, Message, ProtocolError, Transform, WindowRect, SYNC_WILDCARD_PEER_ID,
};
pub use session::SyncSession;
