//! Session interruption: suspension, reconnection and resynchronisation

mod common;

use bytes::Bytes;
use tokio::sync::mpsc;

use coordkit::control::{CoordEvent, Directive};
use coordkit::state::{CrashMonitor, ElectionProtocol, ElectionState, Heartbeat};
use coordkit::store::{CreateMode, MemoryStore};

use common::{connect, next, spawn, wait_for, Events};

fn role_of(event: &CoordEvent, who: &str) -> Option<ElectionState> {
    match event {
        CoordEvent::RoleChanged { identity, role, .. } if identity == who => Some(*role),
        _ => None,
    }
}

/// Collect events until `a` has become a follower and `b` the leader
async fn await_swap(events: &mut Events, a: &str, b: &str) -> Vec<CoordEvent> {
    let mut seen = Vec::new();
    let mut a_follows = false;
    let mut b_leads = false;
    while !(a_follows && b_leads) {
        let event = next(events).await;
        a_follows |= role_of(&event, a) == Some(ElectionState::Follower);
        b_leads |= role_of(&event, b) == Some(ElectionState::Leader);
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn monitor_resyncs_without_stale_diff_after_partition() {
    let store = MemoryStore::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let monitor = spawn(&store, &tx, Directive::Continue, |c| {
        CrashMonitor::new(c, "/nodes").unwrap()
    })
    .await;
    assert!(matches!(
        next(&mut events).await,
        CoordEvent::MembersResynced { ref members, .. } if members.is_empty()
    ));

    let (w1, c1) = connect(&store).await;
    c1.create_member("/nodes", "w1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();
    assert_eq!(
        next(&mut events).await,
        CoordEvent::MemberDiscovered { path: "/nodes".into(), member: "w1".into() }
    );
    let (w2, c2) = connect(&store).await;
    c2.create_member("/nodes", "w2", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();
    assert_eq!(
        next(&mut events).await,
        CoordEvent::MemberDiscovered { path: "/nodes".into(), member: "w2".into() }
    );

    store.partition(monitor.client_id).await;
    assert_eq!(next(&mut events).await, CoordEvent::SessionSuspended);

    // Changes while suspended are never reported as a diff
    store.expire_session(w1).await;
    let (_, c3) = connect(&store).await;
    c3.create_member("/nodes", "w3", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

    store.heal(monitor.client_id).await;
    assert_eq!(next(&mut events).await, CoordEvent::SessionRestored { renewed: false });
    assert_eq!(
        next(&mut events).await,
        CoordEvent::MembersResynced {
            path: "/nodes".into(),
            members: vec!["w2".into(), "w3".into()],
        }
    );

    // Diffing resumes against the resynced set
    store.expire_session(w2).await;
    assert_eq!(
        next(&mut events).await,
        CoordEvent::MemberLost { path: "/nodes".into(), member: "w2".into() }
    );

    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn expired_monitor_resyncs_and_registers_once() {
    let store = MemoryStore::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let (w1, c1) = connect(&store).await;
    c1.ensure_path("/nodes").await.unwrap();
    c1.create_member("/nodes", "w1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();
    let (_, c2) = connect(&store).await;
    c2.create_member("/nodes", "w2", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

    let monitor = spawn(&store, &tx, Directive::Continue, |c| {
        CrashMonitor::new(c, "/nodes").unwrap().register_under("/monitors").unwrap()
    })
    .await;
    assert_eq!(
        next(&mut events).await,
        CoordEvent::MembersResynced {
            path: "/nodes".into(),
            members: vec!["w1".into(), "w2".into()],
        }
    );
    assert_eq!(store.peek_children("/monitors").await.len(), 1);

    // The monitor's own session dies while it cannot see the workers change
    store.partition(monitor.client_id).await;
    assert_eq!(next(&mut events).await, CoordEvent::SessionSuspended);
    store.expire_session(monitor.client_id).await;
    assert!(store.peek_children("/monitors").await.is_empty());

    store.expire_session(w1).await;
    let (_, c3) = connect(&store).await;
    c3.create_member("/nodes", "w3", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

    store.heal(monitor.client_id).await;
    assert_eq!(next(&mut events).await, CoordEvent::SessionRestored { renewed: true });
    assert_eq!(
        next(&mut events).await,
        CoordEvent::MembersResynced {
            path: "/nodes".into(),
            members: vec!["w2".into(), "w3".into()],
        }
    );
    assert_eq!(store.peek_children("/monitors").await.len(), 1);

    // Diffing resumes against the resynced set
    c3.delete("/nodes/w3").await.unwrap();
    assert_eq!(
        next(&mut events).await,
        CoordEvent::MemberLost { path: "/nodes".into(), member: "w3".into() }
    );

    monitor.stop().await.unwrap();
    assert!(store.peek_children("/monitors").await.is_empty());
}

#[tokio::test]
async fn expired_leader_rejoins_as_follower() {
    let store = MemoryStore::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let a = spawn(&store, &tx, Directive::Continue, |c| {
        ElectionProtocol::leader_election(c, "/election", "server1").unwrap()
    })
    .await;
    let b = spawn(&store, &tx, Directive::Continue, |c| {
        ElectionProtocol::leader_election(c, "/election", "server2").unwrap()
    })
    .await;
    wait_for(&mut events, |e| role_of(e, "server2") == Some(ElectionState::Follower)).await;

    store.expire_session(a.client_id).await;
    let seen = await_swap(&mut events, "server1", "server2").await;
    assert!(seen.contains(&CoordEvent::SessionSuspended));
    assert!(seen.contains(&CoordEvent::SessionRestored { renewed: true }));

    // The rejoined node queues behind the new leader
    let members = store.peek_children("/election").await;
    assert_eq!(members.len(), 2);
    assert!(members.contains("server1_0000000002"));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn expiry_during_partition_is_detected_on_reconnect() {
    let store = MemoryStore::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let a = spawn(&store, &tx, Directive::Continue, |c| {
        ElectionProtocol::leader_election(c, "/election", "server1").unwrap()
    })
    .await;
    let b = spawn(&store, &tx, Directive::Continue, |c| {
        ElectionProtocol::leader_election(c, "/election", "server2").unwrap()
    })
    .await;
    wait_for(&mut events, |e| role_of(e, "server2") == Some(ElectionState::Follower)).await;

    store.partition(a.client_id).await;
    wait_for(&mut events, |e| *e == CoordEvent::SessionSuspended).await;

    // The store gives up on the session while the client cannot hear it
    store.expire_session(a.client_id).await;
    wait_for(&mut events, |e| role_of(e, "server2") == Some(ElectionState::Leader)).await;

    store.heal(a.client_id).await;
    let (_, skipped) = wait_for(&mut events, |e| {
        role_of(e, "server1") == Some(ElectionState::Follower)
    })
    .await;
    assert!(skipped.contains(&CoordEvent::SessionRestored { renewed: true }));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn heartbeat_is_recreated_after_expiry() {
    let store = MemoryStore::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let monitor = spawn(&store, &tx, Directive::Continue, |c| {
        CrashMonitor::new(c, "/nodes").unwrap()
    })
    .await;
    next(&mut events).await;
    let worker = spawn(&store, &tx, Directive::Continue, |c| {
        Heartbeat::new(c, "/nodes", "w1").unwrap()
    })
    .await;
    wait_for(&mut events, |e| matches!(e, CoordEvent::MemberDiscovered { .. })).await;

    // Hold the worker off until the monitor has seen the node go
    store.partition(worker.client_id).await;
    store.expire_session(worker.client_id).await;
    wait_for(&mut events, |e| {
        *e == CoordEvent::MemberLost { path: "/nodes".into(), member: "w1".into() }
    })
    .await;

    store.heal(worker.client_id).await;
    wait_for(&mut events, |e| {
        *e == CoordEvent::MemberDiscovered { path: "/nodes".into(), member: "w1".into() }
    })
    .await;
    assert!(store.exists("/nodes/w1").await);

    worker.stop().await.unwrap();
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn release_is_idempotent_and_shutdown_is_final() {
    let store = MemoryStore::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let running = spawn(&store, &tx, Directive::Continue, |c| {
        ElectionProtocol::lock(c, "/locks", "A").unwrap()
    })
    .await;
    next(&mut events).await;
    let handle = running.handle.clone();

    handle.release("/locks").unwrap();
    handle.release("/locks").unwrap();
    handle.release("/unknown").unwrap();
    running.stop().await.unwrap();

    assert!(store.peek_children("/locks").await.is_empty());
    assert!(handle.release("/locks").is_err());
    assert!(handle.shutdown().is_err());
}

#[tokio::test]
async fn shutdown_while_suspended_still_cleans_up() {
    let store = MemoryStore::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let running = spawn(&store, &tx, Directive::Continue, |c| {
        ElectionProtocol::lock(c, "/locks", "A").unwrap()
    })
    .await;
    next(&mut events).await;

    store.partition(running.client_id).await;
    assert_eq!(next(&mut events).await, CoordEvent::SessionSuspended);

    running.stop().await.unwrap();
    assert!(store.peek_children("/locks").await.is_empty());
}
