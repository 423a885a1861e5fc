use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::DuplexStream;

use iotfw_core::{BoxTransport, ConnectionState, DeviceSession, Dialer, SessionError};
use iotfw_test_support::{scripted_pair, HandshakeInfo};

/// A dialer that hands out one pre-built stream and then fails every
/// subsequent call -- enough for tests that connect exactly once.
fn once_dialer(stream: DuplexStream) -> Dialer {
    let slot = Arc::new(Mutex::new(Some(stream)));
    Arc::new(move || {
        let slot = slot.clone();
        Box::pin(async move {
            slot.lock()
                .unwrap()
                .take()
                .map(|s| Box::new(s) as BoxTransport)
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no scripted stream left"))
        })
    })
}

#[tokio::test]
async fn handshake_populates_metadata_and_primes_the_cache() {
    let (mut peer, client_end) = scripted_pair();
    let session = DeviceSession::new(once_dialer(client_end));

    let connect_task = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });

    let info = HandshakeInfo { id: "esp-1".to_owned(), ..Default::default() };
    peer.run_handshake(&info, &[("led.0", "on"), ("config.name", "lab light")]).await;

    connect_task.await.unwrap().unwrap();

    assert_eq!(session.state().await, ConnectionState::Connected);
    let metadata = session.info().await;
    assert_eq!(metadata.id, "esp-1");
    // list's config.name overrides whatever (or nothing) info handed back.
    assert_eq!(metadata.name, "lab light");
    assert_eq!(session.get("led.0").await, Some("on".to_owned()));
}

#[tokio::test]
async fn missing_id_in_info_fails_the_connection() {
    let (mut peer, client_end) = scripted_pair();
    let session = DeviceSession::new(once_dialer(client_end));

    let connect_task = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });

    peer.expect_command("info").await;
    peer.send(iotfw_protocol::Packet::new("attr").with_arg("model", "m1").with_arg("hw", "1.0").with_arg("fw", "2.3"))
        .await;
    peer.send_ok().await;

    let result = connect_task.await.unwrap();
    assert!(matches!(result, Err(SessionError::Protocol(_))));
    assert_eq!(session.state().await, ConnectionState::Disconnected);
}

async fn connected_session() -> (DeviceSession, iotfw_test_support::ScriptedPeer) {
    let (mut peer, client_end) = scripted_pair();
    let session = DeviceSession::new(once_dialer(client_end));
    let connect_task = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    peer.run_handshake(&HandshakeInfo::default(), &[]).await;
    connect_task.await.unwrap().unwrap();
    (session, peer)
}

#[tokio::test]
async fn set_round_trips_ok() {
    let (session, mut peer) = connected_session().await;
    let (result, ()) = tokio::join!(session.set("led.0", "off"), async {
        let p = peer.expect_command("set").await;
        assert_eq!(p.arg("name"), Some("led.0"));
        assert_eq!(p.arg("value"), Some("off"));
        peer.send_ok().await;
    });
    assert!(result.is_ok());
}

#[tokio::test]
async fn set_surfaces_a_device_error() {
    let (session, mut peer) = connected_session().await;
    let (result, ()) = tokio::join!(session.set("led.0", "off"), async {
        peer.expect_command("set").await;
        peer.send_err("gpio busy").await;
    });
    match result {
        Err(SessionError::Device(msg)) => assert_eq!(msg, "gpio busy"),
        other => panic!("expected Device error, got {other:?}"),
    }
    // A device-rejected exchange is local to that request -- the connection
    // itself must survive.
    assert_eq!(session.state().await, ConnectionState::Connected);
    let (result, ()) = tokio::join!(session.set("led.1", "on"), async {
        peer.expect_command("set").await;
        peer.send_ok().await;
    });
    assert!(result.is_ok(), "session should still accept requests after a device error");
}

#[tokio::test]
async fn config_name_is_cached_optimistically_on_set() {
    let (session, mut peer) = connected_session().await;
    let (result, ()) = tokio::join!(session.set("config.name", "new name"), async {
        peer.expect_command("set").await;
        peer.send_ok().await;
    });
    assert!(result.is_ok());
    assert_eq!(session.info().await.name, "new name");
}

#[tokio::test]
async fn async_events_are_delivered_only_to_matching_subscriptions() {
    let (session, mut peer) = connected_session().await;
    let mut sub = session.subscribe("led.*").await.unwrap();

    peer.send_async_attr("led.0", "bool", "true").await;
    peer.send_async_attr("gpio.0", "bool", "true").await;

    let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("subscription should have received the matching event")
        .unwrap();
    assert_eq!(event.name, "led.0");

    let second = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(second.is_err(), "a non-matching key must never be delivered");
}

#[tokio::test]
async fn async_attr_events_write_through_to_the_cache() {
    let (session, mut peer) = connected_session().await;

    peer.send_async_attr("led.0", "bool", "true").await;
    peer.send_async_attr("config.name", "string", "kitchen light").await;
    // Give the executor's single-threaded loop time to apply both events
    // before reading the cache back out.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.get("led.0").await, Some("true".to_owned()));
    assert_eq!(session.info().await.name, "kitchen light");
}

#[tokio::test]
async fn a_slow_subscriber_is_evicted_once_its_buffer_fills() {
    let (session, mut peer) = connected_session().await;
    let mut sub = session.subscribe(">").await.unwrap();

    for i in 0..11 {
        peer.send_async_attr(&format!("k.{i}"), "int", &i.to_string()).await;
    }
    // Give the executor's single-threaded loop time to drain the event
    // channel and run the fan-out before we touch the subscription.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for _ in 0..10 {
        assert!(sub.recv().await.is_some(), "first 10 buffered events should still be there");
    }
    assert!(sub.recv().await.is_none(), "the 11th event should have evicted this slow subscriber");
}

#[tokio::test(start_paused = true)]
async fn keepalive_pings_after_extended_silence_and_stays_connected() {
    let (mut peer, client_end) = scripted_pair();
    let session = DeviceSession::new(once_dialer(client_end));
    let connect_task = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    peer.run_handshake(&HandshakeInfo::default(), &[]).await;
    connect_task.await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;
    peer.expect_command("ping").await;
    peer.send_ok().await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn wait_returns_not_connected_before_any_connect_and_after_teardown() {
    let (mut peer, client_end) = scripted_pair();
    let session = DeviceSession::new(once_dialer(client_end));
    assert!(matches!(session.wait().await, SessionError::NotConnected));

    let connect_task = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    peer.run_handshake(&HandshakeInfo::default(), &[]).await;
    connect_task.await.unwrap().unwrap();

    session.disconnect().await;
    // Give the executor a moment to actually process the disconnect and
    // tear the connection down before we ask it to wait.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(session.wait().await, SessionError::NotConnected));
}
