//! Integration tests for same-host (mesh) synchronization.
//!
//! Each test uses its own loopback port range so the tests can run in
//! parallel without stepping on each other.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use vantage_sync::{
    Command, FileOp, PeerSnapshot, SyncConfig, SyncEvent, SyncSession, Transform, WindowRect,
    SYNC_WILDCARD_PEER_ID,
};

fn config(start: u16, end: u16, name: &str) -> SyncConfig {
    SyncConfig {
        local_port_start: start,
        local_port_end: end,
        client_name: name.to_string(),
        probe_timeout_ms: 100,
        ..SyncConfig::default()
    }
}

async fn peer_list(session: &SyncSession) -> Vec<PeerSnapshot> {
    let (tx, rx) = oneshot::channel();
    assert!(session.send(Command::GetPeerList(tx)).await);
    rx.await.expect("manager dropped the reply")
}

/// Poll the peer list until `pred` holds (or give up after ~5s).
async fn wait_for_peers<F>(session: &SyncSession, pred: F) -> Vec<PeerSnapshot>
where
    F: Fn(&[PeerSnapshot]) -> bool,
{
    for _ in 0..200 {
        let peers = peer_list(session).await;
        if pred(&peers) {
            return peers;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("peer list never reached the expected state");
}

/// Wait for the first event matching `pred`, discarding others.
async fn wait_for_event<F>(events: &mut UnboundedReceiver<SyncEvent>, pred: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = events.recv().await.expect("event channel closed");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn no_event_matching<F>(events: &mut UnboundedReceiver<SyncEvent>, pred: F, wait_ms: u64)
where
    F: Fn(&SyncEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(ev)) => assert!(!pred(&ev), "unexpected event: {ev:?}"),
            Ok(None) | Err(_) => return,
        }
    }
}

fn is_synced(p: &PeerSnapshot) -> bool {
    p.synchronized
}

#[tokio::test]
async fn scan_discovers_sibling_and_mesh_syncs_transform() {
    let mut a = SyncSession::spawn_local(config(49300, 49309, "a"), "instance-a").await;
    let mut b = SyncSession::spawn_local(config(49300, 49309, "b"), "instance-b").await;

    // The second instance scanned the range and found exactly the first.
    let peers_b = wait_for_peers(&b, |p| p.len() == 1).await;
    assert_eq!(peers_b[0].server_port, a.server_port());
    let peers_a = wait_for_peers(&a, |p| p.len() == 1).await;
    assert_eq!(peers_a[0].server_port, b.server_port());

    b.send(Command::SynchronizeWith(peers_b[0].id)).await;
    wait_for_peers(&a, |p| p.iter().any(is_synced)).await;
    wait_for_peers(&b, |p| p.iter().any(is_synced)).await;

    let mut events_a = a.take_events().unwrap();
    let mut events_b = b.take_events().unwrap();

    // Mesh: a transform travels in both directions.
    a.send(Command::SendTransform {
        transform: Transform::scale(2.0),
        img_transform: Transform::IDENTITY,
        canvas_size: (800.0, 600.0),
    })
    .await;
    match wait_for_event(&mut events_b, |e| matches!(e, SyncEvent::Transform { .. })).await {
        SyncEvent::Transform { transform, canvas_size, .. } => {
            assert_eq!(transform.m11, 2.0);
            assert_eq!(canvas_size, (800.0, 600.0));
        }
        _ => unreachable!(),
    }

    b.send(Command::SendTransform {
        transform: Transform::translation(5.0, 5.0),
        img_transform: Transform::IDENTITY,
        canvas_size: (800.0, 600.0),
    })
    .await;
    wait_for_event(&mut events_a, |e| matches!(e, SyncEvent::Transform { .. })).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn joining_instance_completes_the_mesh() {
    let a = SyncSession::spawn_local(config(49310, 49319, "a"), "a").await;
    let b = SyncSession::spawn_local(config(49310, 49319, "b"), "b").await;
    let c = SyncSession::spawn_local(config(49310, 49319, "c"), "c").await;

    // Everyone scanned everyone.
    wait_for_peers(&a, |p| p.len() == 2).await;
    wait_for_peers(&b, |p| p.len() == 2).await;
    let peers_c = wait_for_peers(&c, |p| p.len() == 2).await;

    // a and b form a pair first.
    let peers_b = peer_list(&b).await;
    let a_id_at_b = peers_b
        .iter()
        .find(|p| p.server_port == a.server_port())
        .unwrap()
        .id;
    b.send(Command::SynchronizeWith(a_id_at_b)).await;
    wait_for_peers(&b, |p| p.iter().filter(|s| is_synced(s)).count() == 1).await;

    // c joins a; the acknowledgment's port list pulls in b as well.
    let a_id_at_c = peers_c
        .iter()
        .find(|p| p.server_port == a.server_port())
        .unwrap()
        .id;
    c.send(Command::SynchronizeWith(a_id_at_c)).await;

    wait_for_peers(&a, |p| p.iter().filter(|s| is_synced(s)).count() == 2).await;
    wait_for_peers(&b, |p| p.iter().filter(|s| is_synced(s)).count() == 2).await;
    wait_for_peers(&c, |p| p.iter().filter(|s| is_synced(s)).count() == 2).await;

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn stop_all_is_idempotent() {
    let a = SyncSession::spawn_local(config(49320, 49329, "a"), "a").await;
    let b = SyncSession::spawn_local(config(49320, 49329, "b"), "b").await;

    let peers_b = wait_for_peers(&b, |p| p.len() == 1).await;
    b.send(Command::SynchronizeWith(peers_b[0].id)).await;
    wait_for_peers(&b, |p| p.iter().any(is_synced)).await;

    b.send(Command::StopSynchronizeWith(SYNC_WILDCARD_PEER_ID)).await;
    wait_for_peers(&b, |p| !p.iter().any(is_synced)).await;
    wait_for_peers(&a, |p| !p.iter().any(is_synced)).await;

    // Second wildcard stop: still empty, no error, peers still known.
    b.send(Command::StopSynchronizeWith(SYNC_WILDCARD_PEER_ID)).await;
    let peers = wait_for_peers(&b, |p| !p.iter().any(is_synced)).await;
    assert_eq!(peers.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn arrange_tiles_self_and_peers() {
    let mut a = SyncSession::spawn_local(config(49330, 49339, "a"), "a").await;
    let mut b = SyncSession::spawn_local(config(49330, 49339, "b"), "b").await;

    let peers_a = wait_for_peers(&a, |p| p.len() == 1).await;
    a.send(Command::SynchronizeWith(peers_a[0].id)).await;
    wait_for_peers(&b, |p| p.iter().any(is_synced)).await;

    let mut events_a = a.take_events().unwrap();
    let mut events_b = b.take_events().unwrap();

    a.send(Command::ArrangeInstances {
        screen: WindowRect::new(0, 0, 1200, 800),
        overlaid: false,
    })
    .await;

    // Two instances: two columns, one row. We take the first tile…
    match wait_for_event(&mut events_a, |e| matches!(e, SyncEvent::Position { .. })).await {
        SyncEvent::Position { rect, opacity, .. } => {
            assert_eq!(rect, WindowRect::new(0, 0, 600, 800));
            assert!(!opacity);
        }
        _ => unreachable!(),
    }
    // …and the peer gets the second.
    match wait_for_event(&mut events_b, |e| matches!(e, SyncEvent::Position { .. })).await {
        SyncEvent::Position { rect, .. } => {
            assert_eq!(rect, WindowRect::new(600, 0, 600, 800));
        }
        _ => unreachable!(),
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn quit_broadcast_reaches_siblings() {
    let a = SyncSession::spawn_local(config(49340, 49349, "a"), "a").await;
    let mut b = SyncSession::spawn_local(config(49340, 49349, "b"), "b").await;

    wait_for_peers(&a, |p| p.len() == 1).await;
    let mut events_b = b.take_events().unwrap();

    a.send(Command::QuitPeers).await;
    wait_for_event(&mut events_b, |e| matches!(e, SyncEvent::Quit)).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn file_event_does_not_echo_in_mesh() {
    let mut a = SyncSession::spawn_local(config(49350, 49359, "a"), "a").await;
    let mut b = SyncSession::spawn_local(config(49350, 49359, "b"), "b").await;

    let peers_b = wait_for_peers(&b, |p| p.len() == 1).await;
    b.send(Command::SynchronizeWith(peers_b[0].id)).await;
    wait_for_peers(&a, |p| p.iter().any(is_synced)).await;

    let mut events_a = a.take_events().unwrap();
    let mut events_b = b.take_events().unwrap();

    b.send(Command::SendFile {
        op: FileOp::Open,
        filename: "a.jpg".to_string(),
    })
    .await;

    match wait_for_event(&mut events_a, |e| matches!(e, SyncEvent::File { .. })).await {
        SyncEvent::File { op, filename } => {
            assert_eq!(op, FileOp::Open);
            assert_eq!(filename, "a.jpg");
        }
        _ => unreachable!(),
    }
    // The sender itself never sees its own file event back.
    no_event_matching(&mut events_b, |e| matches!(e, SyncEvent::File { .. }), 300).await;

    a.shutdown().await;
    b.shutdown().await;
}
