use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use iotfw_fleet::{Fleet, FleetHooks, ServiceEventKind};

async fn bind_and_answer_handshake(addr: SocketAddr, device_id: &'static str) {
    let listener = TcpListener::bind(addr).await.expect("rebind the scanned address");
    let (stream, _) = listener.accept().await.expect("accept");
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let info = lines.next_line().await.unwrap().unwrap();
    assert_eq!(info, "info");
    write_half
        .write_all(format!("attr id:{device_id} model:m1 hw:1.0 fw:2.3\n").as_bytes())
        .await
        .unwrap();
    write_half.write_all(b"ok\n").await.unwrap();

    let list = lines.next_line().await.unwrap().unwrap();
    assert_eq!(list, "list");
    write_half.write_all(b"ok\n").await.unwrap();

    let sub = lines.next_line().await.unwrap().unwrap();
    assert_eq!(sub, "sub filter:*");
    write_half.write_all(b"ok\n").await.unwrap();

    // Hold the connection open for the rest of the test.
    std::future::pending::<()>().await;
}

#[tokio::test]
async fn registering_a_device_publishes_a_connect_event_on_the_bus() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        lines.next_line().await.unwrap().unwrap(); // info
        write_half.write_all(b"attr id:esp-bus model:m1 hw:1.0 fw:2.3\n").await.unwrap();
        write_half.write_all(b"ok\n").await.unwrap();
        lines.next_line().await.unwrap().unwrap(); // list
        write_half.write_all(b"ok\n").await.unwrap();
        lines.next_line().await.unwrap().unwrap(); // sub
        write_half.write_all(b"ok\n").await.unwrap();
        std::future::pending::<()>().await
    });

    let fleet = Fleet::with_default_hooks();
    fleet.start().await.unwrap();

    let mut sub = fleet.subscribe("*.@event").await.unwrap();
    fleet.register("esp-bus", addr).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("bus should deliver a connect event")
        .unwrap();
    assert_eq!(event.device_id, "esp-bus");
    assert!(matches!(event.kind, ServiceEventKind::Connect));

    let summary = fleet.device("esp-bus").await.unwrap().expect("device should be registered");
    assert_eq!(summary.metadata.id, "esp-bus");
}

#[tokio::test(start_paused = true)]
async fn supervisor_retries_with_backoff_until_a_listener_appears() {
    // Reserve a port, then immediately stop listening on it so the first
    // two connect attempts are refused outright.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let fleet = Fleet::with_default_hooks();
    fleet.start().await.unwrap();
    fleet.register("esp-retry", addr).await.unwrap();

    // Let the first (refused) connect attempt run and enter its backoff
    // sleep before we start advancing virtual time.
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    tokio::time::advance(iotfw_fleet::RECONNECT_BACKOFF).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::advance(iotfw_fleet::RECONNECT_BACKOFF).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    // The third attempt is about to happen; start listening now.
    let handshake = tokio::spawn(bind_and_answer_handshake(addr, "esp-retry"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(summary) = fleet.device("esp-retry").await.unwrap() {
            if summary.state == iotfw_core::ConnectionState::Connected {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "device never reached Connected");
        tokio::time::advance(Duration::from_millis(50)).await;
    }

    handshake.abort();
}

struct RecordingPlugin {
    name: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FleetHooks for RecordingPlugin {
    fn service_name(&self) -> &str {
        self.name
    }

    fn on_register(&self, id: &str) {
        self.calls.lock().unwrap().push(format!("{}:register:{}", self.name, id));
    }

    fn on_unregister(&self, id: &str) {
        self.calls.lock().unwrap().push(format!("{}:unregister:{}", self.name, id));
    }
}

#[tokio::test]
async fn every_installed_plugin_sees_each_registration_hook() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let plugin_a: Arc<dyn FleetHooks> = Arc::new(RecordingPlugin { name: "metrics", calls: calls.clone() });
    let plugin_b: Arc<dyn FleetHooks> = Arc::new(RecordingPlugin { name: "exporter", calls: calls.clone() });

    // The hooks fire on register/unregister regardless of whether the
    // supervisor's connect attempt ever succeeds, so no real listener is
    // needed here -- an address nothing answers on is enough.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let fleet = Fleet::new(vec![plugin_a, plugin_b]);
    fleet.start().await.unwrap();
    fleet.register("esp-plugins", addr).await.unwrap();
    fleet.unregister("esp-plugins").await.unwrap();

    let seen = calls.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "metrics:register:esp-plugins".to_owned(),
            "exporter:register:esp-plugins".to_owned(),
            "metrics:unregister:esp-plugins".to_owned(),
            "exporter:unregister:esp-plugins".to_owned(),
        ]
    );
}
