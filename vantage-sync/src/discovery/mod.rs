//! Discovery transports: same-host port scanning and LAN UDP beaconing.
//!
//! Both transports only surface raw material, accepted sockets and
//! discovered (address, port, name) tuples. Turning those into tracked
//! peers is the manager's job.

pub(crate) mod lan;
pub(crate) mod local;

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Short-timeout connect. `None` means the candidate is unreachable and is
/// simply discarded.
pub(crate) async fn probe(address: IpAddr, port: u16, timeout: Duration) -> Option<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(stream)) => Some(stream),
        _ => None,
    }
}

/// Forward every accepted socket to the manager until the listener is
/// aborted or the manager goes away.
pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    accepted: mpsc::Sender<TcpStream>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("accepted connection from {addr}");
                    if accepted.send(stream).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::debug!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}
