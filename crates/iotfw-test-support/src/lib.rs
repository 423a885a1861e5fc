//! In-memory scripted device peer and loopback listener helpers for testing
//! `iotfw-core` and `iotfw-fleet` without a real device on the wire.
//!
//! Modeled on the accept-loop-plus-scripted-state-machine shape of a mock
//! websocket server, adapted here for the raw line protocol instead of
//! framed JSON messages.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};

use iotfw_protocol::{decode, encode, Packet};

/// The default handshake a scripted peer answers with unless overridden.
pub struct HandshakeInfo {
    pub id: String,
    pub model: String,
    pub hw: String,
    pub fw: String,
    pub name: Option<String>,
}

impl Default for HandshakeInfo {
    fn default() -> Self {
        HandshakeInfo {
            id: "esp-test-0001".to_owned(),
            model: "unit-test".to_owned(),
            hw: "1.0".to_owned(),
            fw: "2.3".to_owned(),
            name: None,
        }
    }
}

/// The test-held end of a scripted in-memory transport. The other end (a
/// plain [`DuplexStream`]) is handed to the code under test as if it were a
/// dialed socket.
pub struct ScriptedPeer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

/// Create a scripted peer and the stream end to hand to a dialer.
pub fn scripted_pair() -> (ScriptedPeer, DuplexStream) {
    let (client_end, peer_end) = tokio::io::duplex(8192);
    let (peer_read, peer_write) = tokio::io::split(peer_end);
    let peer = ScriptedPeer {
        reader: BufReader::new(peer_read),
        writer: peer_write,
    };
    (peer, client_end)
}

impl ScriptedPeer {
    /// Read one decoded line from the peer, with a generous timeout so a
    /// broken test fails fast instead of hanging the suite.
    pub async fn expect_packet(&mut self) -> Packet {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("peer: timed out waiting for a line")
            .expect("peer: read error");
        assert!(n > 0, "peer: transport closed while expecting a line");
        decode(line.trim_end()).expect("peer: received an unparsable line")
    }

    /// Read one decoded line and assert its command token.
    pub async fn expect_command(&mut self, cmd: &str) -> Packet {
        let p = self.expect_packet().await;
        assert_eq!(p.cmd, cmd, "peer: expected command {cmd:?}, got {p:?}");
        p
    }

    /// Write one packet as a line.
    pub async fn send(&mut self, packet: Packet) {
        let line = format!("{}\n", encode(&packet));
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("peer: write error");
        self.writer.flush().await.expect("peer: flush error");
    }

    pub async fn send_ok(&mut self) {
        self.send(Packet::new("ok")).await;
    }

    pub async fn send_err(&mut self, msg: &str) {
        self.send(Packet::new("err").with_arg("msg", msg)).await;
    }

    /// Answer an `info` request with the given handshake fields, followed by
    /// `ok`. Does not itself wait for the `info` command -- call
    /// [`ScriptedPeer::expect_command`] first.
    pub async fn answer_info(&mut self, info: &HandshakeInfo) {
        let mut p = Packet::new("attr")
            .with_arg("id", info.id.clone())
            .with_arg("model", info.model.clone())
            .with_arg("hw", info.hw.clone())
            .with_arg("fw", info.fw.clone());
        if let Some(name) = &info.name {
            p = p.with_arg("name", name.clone());
        }
        self.send(p).await;
        self.send_ok().await;
    }

    /// Answer a `list` request with zero or more `attr name:.. value:..`
    /// packets, followed by `ok`.
    pub async fn answer_list(&mut self, attrs: &[(&str, &str)]) {
        for (name, value) in attrs {
            self.send(Packet::new("attr").with_arg("name", *name).with_arg("value", *value))
                .await;
        }
        self.send_ok().await;
    }

    /// Drive a full successful handshake: `info` -> attrs+ok, `list` -> ok,
    /// `sub` -> ok. The most common fixture for connect-path tests.
    pub async fn run_handshake(&mut self, info: &HandshakeInfo, list_attrs: &[(&str, &str)]) {
        self.expect_command("info").await;
        self.answer_info(info).await;
        self.expect_command("list").await;
        self.answer_list(list_attrs).await;
        self.expect_command("sub").await;
        self.send_ok().await;
    }

    /// Send an async attribute-change notification.
    pub async fn send_async_attr(&mut self, name: &str, type_tag: &str, value: &str) {
        self.send(
            Packet::new("@attr")
                .with_arg("name", name)
                .with_arg("type", type_tag)
                .with_arg("value", value),
        )
        .await;
    }
}

/// Bind an ephemeral loopback listener, accept exactly one connection, and
/// run `handler` against it. Returns the bound address so a dialer can be
/// pointed at it. Used by scanner and fleet tests that need a real
/// [`TcpStream`] without a real device.
pub async fn spawn_loopback_listener<F, Fut>(handler: F) -> std::net::SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind loopback listener");
    let addr = listener.local_addr().expect("listener has no local addr");
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            handler(stream).await;
        }
    });
    addr
}
