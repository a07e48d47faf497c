mod common;

use std::time::Duration;

use tether_core::{Group, GroupError, Init, Listener, RpcError, SessionConfig, SignalError};

use common::{connect, connect_with, within, Peer, QUIET};

/// A server-side peer for one connected client, plus the client's listener.
struct Member {
    client: Peer,
    server: Peer,
    listener: Listener,
}

async fn member(config: SessionConfig, queue_size: usize) -> Member {
    let (client, server) = connect_with(config, Init::new(), Init::new().signal("test")).await;
    let listener = client
        .signaler
        .on_signal_opts("test", queue_size)
        .await
        .unwrap();
    Member {
        client,
        server,
        listener,
    }
}

async fn expect_event(listener: &mut Listener, expected: &str) {
    let ctx = within(listener.recv()).await.unwrap();
    assert_eq!(ctx.decode::<String>().unwrap(), expected);
}

async fn expect_nothing(listener: &mut Listener) {
    tokio::time::sleep(QUIET).await;
    assert!(listener.try_recv().is_none());
}

#[tokio::test]
async fn broadcast_exclude_and_prune() {
    let mut one = member(SessionConfig::default(), 16).await;
    let mut two = member(SessionConfig::default(), 16).await;

    let group = Group::new();
    group.add([&one.server.signaler, &two.server.signaler]);
    assert_eq!(group.len(), 2);

    // Everyone.
    within(group.trigger_signal("test", "testData", &[]))
        .await
        .unwrap();
    expect_event(&mut one.listener, "testData").await;
    expect_event(&mut two.listener, "testData").await;

    // Everyone but one.
    within(group.trigger_signal("test", "testData", &[&one.server.signaler]))
        .await
        .unwrap();
    expect_event(&mut two.listener, "testData").await;
    expect_nothing(&mut one.listener).await;

    // Unknown ids are a no-op for every member.
    within(group.trigger_signal("blabla", "testData", &[]))
        .await
        .unwrap();
    expect_nothing(&mut one.listener).await;
    expect_nothing(&mut two.listener).await;

    // A closed member leaves without an explicit remove.
    one.client.session.close();
    within(one.server.session.closed()).await;
    assert_eq!(group.len(), 1);
    assert!(!group.contains(&one.server.signaler));

    within(group.trigger_signal("test", "testData", &[]))
        .await
        .unwrap();
    expect_event(&mut two.listener, "testData").await;
}

#[tokio::test]
async fn add_skips_none_duplicates_and_closed() {
    let one = member(SessionConfig::default(), 16).await;
    let two = member(SessionConfig::default(), 16).await;
    two.server.session.close();

    let group = Group::new();
    group.add([
        Some(&one.server.signaler),
        None,
        Some(&one.server.signaler),
        Some(&two.server.signaler),
    ]);
    assert_eq!(group.len(), 1);

    assert!(group.remove(&one.server.signaler));
    assert!(!group.remove(&one.server.signaler));
    assert!(group.is_empty());
}

#[tokio::test]
async fn removed_member_gets_nothing() {
    let mut one = member(SessionConfig::default(), 16).await;
    let group = Group::new();
    group.add([&one.server.signaler]);
    group.remove(&one.server.signaler);

    within(group.trigger_signal("test", "testData", &[]))
        .await
        .unwrap();
    expect_nothing(&mut one.listener).await;

    // Removing also dropped the close hook, so closing later is harmless.
    one.client.session.close();
    within(one.server.session.closed()).await;
    assert!(group.is_empty());
}

#[tokio::test]
async fn one_failing_member_does_not_stop_the_others() {
    let config = SessionConfig {
        trigger_timeout: Some(Duration::from_millis(50)),
        ..SessionConfig::default()
    };
    let mut stalled = member(config.clone(), 1).await;
    let mut healthy = member(config, 16).await;

    let group = Group::new();
    group.add([&stalled.server.signaler, &healthy.server.signaler]);

    // Fill the stalled listener's only slot.
    within(group.trigger_signal("test", "first", &[])).await.unwrap();
    expect_event(&mut healthy.listener, "first").await;

    let err = within(group.trigger_signal("test", "second", &[]))
        .await
        .unwrap_err();
    match err {
        GroupError::Delivery(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].session, stalled.server.session.id());
            assert_eq!(
                failures[0].error,
                SignalError::Rpc(RpcError::DeadlineExceeded)
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    expect_event(&mut healthy.listener, "second").await;
    expect_event(&mut stalled.listener, "first").await;
    assert_eq!(group.len(), 2);
}

#[tokio::test]
async fn client_side_signalers_can_be_members() {
    let (client, server) = connect(Init::new().signal("test"), Init::new()).await;
    let mut listener = server.signaler.on_signal("test").await.unwrap();
    let group = Group::new();
    group.add([&client.signaler]);
    within(group.trigger_signal("test", "testData", &[]))
        .await
        .unwrap();
    expect_event(&mut listener, "testData").await;
}
