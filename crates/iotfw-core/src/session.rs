//! A device session: the reader/executor task pair that owns one TCP (or
//! scripted) connection to a device, plus the public handle used to drive
//! it.
//!
//! Split directly from the original driver's per-connection goroutines: a
//! reader that only demultiplexes lines, and an executor that is the sole
//! writer of requests and the sole mutator of session state. The executor
//! loop is a single-threaded event loop serviced by `tokio::select!`, so
//! every state transition happens on one task without locking.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use iotfw_protocol::{decode, encode, AttributeValue, Packet};

use crate::subscription::{AttributeEvent, Subscription};
use crate::transport::Dialer;

/// How long a connection may sit silent before the executor issues a ping.
const KEEPALIVE_SILENCE: Duration = Duration::from_secs(10);
/// Executor tick interval used to evaluate the keepalive condition.
const KEEPALIVE_TICK: Duration = Duration::from_secs(1);
/// Idle timeout for a single reply line while draining a synchronous
/// request/response exchange (including the keepalive ping itself).
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on the pending-event channel feeding the executor; events arriving
/// during a synchronous exchange queue here rather than interleaving with
/// the reply channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;
const REPLY_CHANNEL_CAPACITY: usize = 8;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Handshake-derived, slowly-changing facts about a device.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub id: String,
    pub name: String,
    pub model: String,
    pub hardware_version: iotfw_protocol::Version,
    pub firmware_version: iotfw_protocol::Version,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device returned an error: {0}")]
    Device(String),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOutcome {
    pub output: Vec<String>,
    pub debug: Vec<String>,
}

pub(crate) enum Command {
    Exec {
        packet: Packet,
        reply: oneshot::Sender<Result<Vec<Packet>, SessionError>>,
    },
    Subscribe {
        filter: String,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: u64,
    },
    Wait {
        reply: oneshot::Sender<SessionError>,
    },
    Disconnect,
}

struct SharedState {
    state: RwLock<ConnectionState>,
    metadata: RwLock<Metadata>,
    cache: RwLock<HashMap<String, AttributeValue>>,
}

struct Control {
    cmd_tx: mpsc::Sender<Command>,
}

/// A handle to one device's session. Cheaply cloned; every clone shares the
/// same underlying connection (or lack of one).
#[derive(Clone)]
pub struct DeviceSession {
    dialer: Dialer,
    shared: Arc<SharedState>,
    control: Arc<Mutex<Option<Control>>>,
}

impl DeviceSession {
    pub fn new(dialer: Dialer) -> Self {
        DeviceSession {
            dialer,
            shared: Arc::new(SharedState {
                state: RwLock::new(ConnectionState::Idle),
                metadata: RwLock::new(Metadata::default()),
                cache: RwLock::new(HashMap::new()),
            }),
            control: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Opens the transport, runs the handshake, and spawns the reader and
    /// executor tasks that own the connection until it ends. Idempotent: a
    /// second call on an already-connected session returns immediately with
    /// no side effect. Two concurrent calls serialize on the connect path;
    /// the loser observes `Connected` once it acquires the lock and returns
    /// without dialing again.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut control = self.control.lock().await;
        if *self.shared.state.read().await == ConnectionState::Connected {
            return Ok(());
        }

        *self.shared.state.write().await = ConnectionState::Connecting;
        let transport = match (self.dialer)().await {
            Ok(t) => t,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(SessionError::Dial(e.to_string()));
            }
        };

        let (read_half, mut write_half) = tokio::io::split(transport);
        let mut lines = BufReader::new(read_half).lines();
        let (reply_tx, mut reply_rx) = mpsc::channel::<String>(REPLY_CHANNEL_CAPACITY);
        let (event_tx, mut event_rx) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);
        let last_read_at = Arc::new(StdMutex::new(Instant::now()));
        let (exit_tx, mut exit_rx) = oneshot::channel::<Option<String>>();

        tokio::spawn(reader_task(lines, reply_tx, event_tx, last_read_at.clone(), exit_tx));

        let handshake = do_handshake(&mut write_half, &mut reply_rx).await;
        let (metadata, cache) = match handshake {
            Ok(v) => v,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        if let Err(e) = exchange(&mut write_half, &mut reply_rx, Packet::new("sub").with_arg("filter", "*")).await {
            tracing::warn!(device = %metadata.id, error = %e, "device rejected subscribe-all during handshake");
        }

        *self.shared.metadata.write().await = metadata;
        *self.shared.cache.write().await = cache;
        *self.shared.state.write().await = ConnectionState::Connected;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cmd_tx_clone = cmd_tx.clone();
        *control = Some(Control { cmd_tx });
        drop(control);

        let shared = self.shared.clone();
        let cmd_tx_for_subs = cmd_tx_clone;
        tokio::spawn(async move {
            let terminal = executor_loop(
                write_half,
                &mut event_rx,
                &mut exit_rx,
                &mut reply_rx,
                cmd_rx,
                cmd_tx_for_subs,
                last_read_at,
                shared.clone(),
            )
            .await;
            *shared.state.write().await = ConnectionState::Disconnecting;
            teardown(&shared, terminal).await;
        });

        Ok(())
    }

    /// Requests a graceful disconnect. Idempotent; returns immediately if
    /// the session is not connected.
    pub async fn disconnect(&self) {
        let cmd_tx = {
            let guard = self.control.lock().await;
            guard.as_ref().map(|c| c.cmd_tx.clone())
        };
        if let Some(tx) = cmd_tx {
            let _ = tx.send(Command::Disconnect).await;
        }
    }

    /// Blocks until the session disconnects and returns the terminal error.
    /// Returns [`SessionError::NotConnected`] immediately if called on a
    /// session that was never connected, or that has already finished
    /// tearing down.
    pub async fn wait(&self) -> SessionError {
        let cmd_tx = {
            let guard = self.control.lock().await;
            guard.as_ref().map(|c| c.cmd_tx.clone())
        };
        let Some(cmd_tx) = cmd_tx else {
            return SessionError::NotConnected;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if cmd_tx.send(Command::Wait { reply: reply_tx }).await.is_err() {
            return SessionError::NotConnected;
        }
        reply_rx.await.unwrap_or(SessionError::NotConnected)
    }

    pub async fn info(&self) -> Metadata {
        self.shared.metadata.read().await.clone()
    }

    /// Returns the cached attribute value as a string, or `None` if no such
    /// attribute has been observed. Never touches the network.
    pub async fn get(&self, name: &str) -> Option<String> {
        self.shared.cache.read().await.get(name).map(AttributeValue::as_wire_string)
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<(), SessionError> {
        self.set_inner(name, value, false).await
    }

    /// Same as [`DeviceSession::set`], but asks the device to apply the
    /// value only once the session disconnects.
    pub async fn set_on_disconnect(&self, name: &str, value: &str) -> Result<(), SessionError> {
        self.set_inner(name, value, true).await
    }

    async fn set_inner(&self, name: &str, value: &str, on_disconnect: bool) -> Result<(), SessionError> {
        let mut packet = Packet::new("set").with_arg("name", name).with_arg("value", value);
        if on_disconnect {
            packet = packet.with_arg("disconnect", "true");
        }
        self.exec_command(packet).await?;
        if name == "config.name" {
            self.shared.metadata.write().await.name = value.to_owned();
        }
        Ok(())
    }

    pub async fn execute(&self, command: &str, args: HashMap<String, String>) -> Result<ExecuteOutcome, SessionError> {
        let mut packet = Packet::new(command);
        packet.args = args;
        let packets = self.exec_command(packet).await?;
        let mut outcome = ExecuteOutcome::default();
        for p in packets {
            match p.cmd.as_str() {
                "output" => outcome.output.push(p.arg("msg").unwrap_or("").to_owned()),
                "debug" => outcome.debug.push(p.arg("msg").unwrap_or("").to_owned()),
                _ => {}
            }
        }
        Ok(outcome)
    }

    pub async fn subscribe(&self, filter: &str) -> Result<Subscription, SessionError> {
        let cmd_tx = self.require_cmd_tx().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Subscribe { filter: filter.to_owned(), reply: reply_tx })
            .await
            .map_err(|_| SessionError::NotConnected)?;
        reply_rx.await.map_err(|_| SessionError::NotConnected)
    }

    async fn exec_command(&self, packet: Packet) -> Result<Vec<Packet>, SessionError> {
        let cmd_tx = self.require_cmd_tx().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Exec { packet, reply: reply_tx })
            .await
            .map_err(|_| SessionError::NotConnected)?;
        reply_rx.await.map_err(|_| SessionError::NotConnected)?
    }

    async fn require_cmd_tx(&self) -> Result<mpsc::Sender<Command>, SessionError> {
        self.control
            .lock()
            .await
            .as_ref()
            .map(|c| c.cmd_tx.clone())
            .ok_or(SessionError::NotConnected)
    }
}

/// Open a connection just long enough to run the `info` handshake and
/// immediately close it, without spawning a reader/executor pair or priming
/// the attribute cache. Used by the network scanner, which only needs
/// identity, not a live session.
pub async fn probe_info(dialer: &Dialer) -> Result<Metadata, SessionError> {
    let transport = dialer().await.map_err(|e| SessionError::Dial(e.to_string()))?;
    let (read_half, mut write_half) = tokio::io::split(transport);
    let mut lines = BufReader::new(read_half).lines();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(REPLY_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if !trimmed.starts_with('@') && reply_tx.send(trimmed.to_owned()).await.is_err() {
                break;
            }
        }
    });

    let info_packets = exchange(&mut write_half, &mut reply_rx, Packet::new("info")).await?;
    let info = info_packets
        .into_iter()
        .next()
        .ok_or_else(|| SessionError::Protocol("info handshake returned no attributes".into()))?;
    let id = info
        .arg("id")
        .ok_or_else(|| SessionError::Protocol("info response missing 'id'".into()))?
        .to_owned();
    let model = info.arg("model").unwrap_or("").to_owned();
    let hardware_version = info
        .arg("hw")
        .and_then(|s| s.parse::<iotfw_protocol::Version>().ok())
        .unwrap_or_default();
    let firmware_version = info
        .arg("fw")
        .or_else(|| info.arg("ver"))
        .and_then(|s| s.parse::<iotfw_protocol::Version>().ok())
        .unwrap_or_default();
    let name = info.arg("name").unwrap_or("").to_owned();

    Ok(Metadata { id, name, model, hardware_version, firmware_version })
}

async fn reader_task<R>(
    mut lines: tokio::io::Lines<R>,
    reply_tx: mpsc::Sender<String>,
    event_tx: mpsc::Sender<String>,
    last_read_at: Arc<StdMutex<Instant>>,
    exit_tx: oneshot::Sender<Option<String>>,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                *last_read_at.lock().unwrap() = Instant::now();
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let delivered = if trimmed.starts_with('@') {
                    event_tx.send(trimmed.to_owned()).await.is_ok()
                } else {
                    reply_tx.send(trimmed.to_owned()).await.is_ok()
                };
                if !delivered {
                    let _ = exit_tx.send(None);
                    return;
                }
            }
            Ok(None) => {
                let _ = exit_tx.send(None);
                return;
            }
            Err(e) => {
                let _ = exit_tx.send(Some(e.to_string()));
                return;
            }
        }
    }
}

async fn exchange(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    reply_rx: &mut mpsc::Receiver<String>,
    packet: Packet,
) -> Result<Vec<Packet>, SessionError> {
    let line = format!("{}\n", encode(&packet));
    writer.write_all(line.as_bytes()).await.map_err(|e| SessionError::Io(e.to_string()))?;
    writer.flush().await.map_err(|e| SessionError::Io(e.to_string()))?;

    let mut collected = Vec::new();
    loop {
        match tokio::time::timeout(REPLY_TIMEOUT, reply_rx.recv()).await {
            Ok(Some(line)) => {
                let p = decode(&line).map_err(|e| SessionError::Protocol(e.to_string()))?;
                match p.cmd.as_str() {
                    "ok" => return Ok(collected),
                    "err" => return Err(SessionError::Device(p.arg("msg").unwrap_or("").to_owned())),
                    _ => collected.push(p),
                }
            }
            Ok(None) => return Err(SessionError::NotConnected),
            Err(_) => return Err(SessionError::Timeout),
        }
    }
}

async fn do_handshake(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    reply_rx: &mut mpsc::Receiver<String>,
) -> Result<(Metadata, HashMap<String, AttributeValue>), SessionError> {
    let info_packets = exchange(writer, reply_rx, Packet::new("info")).await?;
    let info = info_packets
        .into_iter()
        .next()
        .ok_or_else(|| SessionError::Protocol("info handshake returned no attributes".into()))?;

    let id = info
        .arg("id")
        .ok_or_else(|| SessionError::Protocol("info response missing 'id'".into()))?
        .to_owned();
    let model = info
        .arg("model")
        .ok_or_else(|| SessionError::Protocol("info response missing 'model'".into()))?
        .to_owned();
    let hw_raw = info
        .arg("hw")
        .ok_or_else(|| SessionError::Protocol("info response missing 'hw'".into()))?;
    let hardware_version = hw_raw
        .parse::<iotfw_protocol::Version>()
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    // Prefer `fw`; fall back to `ver` for devices running an older firmware
    // that hasn't adopted the renamed field yet.
    let fw_raw = info
        .arg("fw")
        .or_else(|| info.arg("ver"))
        .ok_or_else(|| SessionError::Protocol("info response missing 'fw'".into()))?;
    let firmware_version = fw_raw
        .parse::<iotfw_protocol::Version>()
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    let mut name = info.arg("name").unwrap_or("").to_owned();

    let list_packets = exchange(writer, reply_rx, Packet::new("list")).await?;
    let mut cache = HashMap::new();
    for p in list_packets {
        if p.cmd == "attr" {
            if let (Some(n), Some(v)) = (p.arg("name"), p.arg("value")) {
                cache.insert(n.to_owned(), AttributeValue::String(v.to_owned()));
            }
        }
    }
    if let Some(AttributeValue::String(n)) = cache.get("config.name") {
        name = n.clone();
    }

    Ok((Metadata { id, name, model, hardware_version, firmware_version }, cache))
}

enum Terminal {
    Reader(Option<String>),
    Exchange(SessionError),
    Explicit,
}

#[allow(clippy::too_many_arguments)]
async fn executor_loop(
    mut writer: impl tokio::io::AsyncWrite + Unpin,
    event_rx: &mut mpsc::Receiver<String>,
    exit_rx: &mut oneshot::Receiver<Option<String>>,
    reply_rx: &mut mpsc::Receiver<String>,
    mut cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    last_read_at: Arc<StdMutex<Instant>>,
    shared: Arc<SharedState>,
) -> Terminal {
    let mut subscriptions: Vec<crate::fanout::FanoutSlot<AttributeEvent>> = Vec::new();
    let mut waiters: Vec<oneshot::Sender<SessionError>> = Vec::new();
    let mut next_sub_id: u64 = 1;
    let mut tick = tokio::time::interval(KEEPALIVE_TICK);

    let terminal = loop {
        tokio::select! {
            biased;

            exit = &mut *exit_rx => {
                break Terminal::Reader(exit.unwrap_or(None));
            }

            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    None => break Terminal::Explicit,
                    Some(Command::Disconnect) => break Terminal::Explicit,
                    Some(Command::Wait { reply }) => waiters.push(reply),
                    Some(Command::Unsubscribe { id }) => {
                        subscriptions.retain(|s| s.id != id);
                    }
                    Some(Command::Subscribe { filter, reply }) => {
                        let (tx, rx) = mpsc::channel(10);
                        let id = next_sub_id;
                        next_sub_id += 1;
                        subscriptions.push(crate::fanout::FanoutSlot { id, filter: filter.clone(), tx });
                        let _ = reply.send(Subscription {
                            id,
                            filter,
                            rx,
                            closed: Arc::new(AtomicBool::new(false)),
                            unsub_tx: Some(cmd_tx.clone()),
                        });
                    }
                    Some(Command::Exec { packet, reply }) => {
                        let result = exchange(&mut writer, reply_rx, packet).await;
                        match result {
                            Ok(packets) => { let _ = reply.send(Ok(packets)); }
                            // A device-rejected exchange is local to this
                            // request: the caller sees the device's message
                            // but the connection survives.
                            Err(e @ SessionError::Device(_)) => {
                                let _ = reply.send(Err(e));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e.clone()));
                                break Terminal::Exchange(e);
                            }
                        }
                    }
                }
            }

            maybe_line = event_rx.recv() => {
                if let Some(line) = maybe_line {
                    handle_async_line(&line, &mut subscriptions, &shared).await;
                }
            }

            _ = tick.tick() => {
                let silent_for = last_read_at.lock().unwrap().elapsed();
                if silent_for > KEEPALIVE_SILENCE {
                    if let Err(e) = exchange(&mut writer, reply_rx, Packet::new("ping")).await {
                        break Terminal::Exchange(e);
                    }
                }
            }
        }
    };

    for w in waiters {
        let err = match &terminal {
            Terminal::Reader(Some(msg)) => SessionError::Io(msg.clone()),
            Terminal::Reader(None) => SessionError::NotConnected,
            Terminal::Exchange(e) => e.clone(),
            Terminal::Explicit => SessionError::NotConnected,
        };
        let _ = w.send(err);
    }
    subscriptions.clear();

    terminal
}

async fn handle_async_line(
    line: &str,
    subscriptions: &mut Vec<crate::fanout::FanoutSlot<AttributeEvent>>,
    shared: &Arc<SharedState>,
) {
    let Ok(p) = decode(line) else {
        tracing::warn!(line, "dropping unparsable async line");
        return;
    };
    if p.cmd != "@attr" {
        return;
    }
    let (Some(name), Some(type_tag), Some(raw)) = (p.arg("name"), p.arg("type"), p.arg("value")) else {
        tracing::warn!(?p, "dropping malformed @attr event");
        return;
    };
    let Some(value) = AttributeValue::parse(type_tag, raw) else {
        tracing::warn!(name, type_tag, raw, "dropping @attr event with unparsable value");
        return;
    };
    let name = name.to_owned();

    shared.cache.write().await.insert(name.clone(), value.clone());
    if name == "config.name" {
        if let AttributeValue::String(n) = &value {
            shared.metadata.write().await.name = n.clone();
        }
    }

    crate::fanout::dispatch(subscriptions, &name, || AttributeEvent { name: name.clone(), value: value.clone() });
}

async fn teardown(shared: &Arc<SharedState>, _terminal: Terminal) {
    *shared.state.write().await = ConnectionState::Disconnected;
}
