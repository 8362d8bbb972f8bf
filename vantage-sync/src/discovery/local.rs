//! Same-host discovery.
//!
//! Loopback interfaces do not support broadcast reliably across
//! environments, so sibling instances on one host are found by scanning a
//! fixed port range with short-timeout connects instead. The listener binds
//! the first free port of the same range; if every port is taken the
//! instance simply cannot be discovered, which is not fatal.

use std::net::Ipv4Addr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Loopback listener bound to the first free port of the configured range.
pub(crate) struct LocalListener {
    pub port: u16,
    task: JoinHandle<()>,
}

impl LocalListener {
    /// Bind the first free port in `start..=end` and start accepting.
    /// Returns `None` when the whole range is occupied.
    pub async fn bind(start: u16, end: u16, accepted: mpsc::Sender<TcpStream>) -> Option<Self> {
        for port in start..=end {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => {
                    log::info!("listening for sibling instances on port {port}");
                    let task = super::spawn_accept_loop(listener, accepted);
                    return Some(Self { port, task });
                }
                Err(_) => continue,
            }
        }
        log::warn!("no free port in {start}..={end}; this instance is not discoverable");
        None
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bind_skips_occupied_ports() {
        let (tx, _rx) = mpsc::channel(4);
        let first = LocalListener::bind(47811, 47813, tx.clone()).await.unwrap();
        let second = LocalListener::bind(47811, 47813, tx).await.unwrap();

        assert_eq!(first.port, 47811);
        assert_eq!(second.port, 47812);
    }

    #[tokio::test]
    async fn test_exhausted_range_is_not_fatal() {
        let (tx, _rx) = mpsc::channel(4);
        let a = LocalListener::bind(47815, 47815, tx.clone()).await;
        assert!(a.is_some());
        let b = LocalListener::bind(47815, 47815, tx).await;
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn test_probe_finds_listener_and_discards_dead_port() {
        let (tx, mut rx) = mpsc::channel(4);
        let listener = LocalListener::bind(47817, 47818, tx).await.unwrap();

        let hit = super::super::probe(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            listener.port,
            Duration::from_millis(50),
        )
        .await;
        assert!(hit.is_some());
        assert!(rx.recv().await.is_some());

        let miss = super::super::probe(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            47818,
            Duration::from_millis(50),
        )
        .await;
        assert!(miss.is_none());
    }
}
