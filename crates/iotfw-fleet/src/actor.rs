//! The fleet's single-writer actor: the only place the device registry and
//! bus subscriber list are mutated, following the same
//! typed-command-plus-`oneshot`-reply shape as the device session's
//! executor. This is the idiomatic-Rust rendition of the original driver's
//! `execCh chan func()` closure queue used by its forwarder service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use iotfw_core::{dispatch, tcp_dialer, ConnectionState, DeviceSession, FanoutSlot, Metadata};

use crate::bus::{BusSubscription, ServiceEvent};
use crate::hooks::{invoke_all, FleetHooks};
use crate::supervisor::supervise;
use crate::FleetError;

/// Snapshot of one registered device, returned by [`crate::Fleet::devices`]
/// and [`crate::Fleet::device`].
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub id: String,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub metadata: Metadata,
}

pub(crate) enum FleetCommand {
    Register {
        id: String,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    Unregister {
        id: String,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    Devices {
        reply: oneshot::Sender<Vec<DeviceSummary>>,
    },
    Device {
        id: String,
        reply: oneshot::Sender<Option<DeviceSummary>>,
    },
    Subscribe {
        filter: String,
        reply: oneshot::Sender<BusSubscription>,
    },
    UnsubscribeBus {
        id: u64,
    },
    PublishEvent(ServiceEvent),
    Shutdown,
}

struct DeviceContext {
    addr: SocketAddr,
    session: DeviceSession,
    reconnect: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

pub(crate) async fn fleet_actor(
    mut cmd_rx: mpsc::Receiver<FleetCommand>,
    cmd_tx: mpsc::Sender<FleetCommand>,
    plugins: Arc<Vec<Arc<dyn FleetHooks>>>,
) {
    let mut registry: HashMap<String, DeviceContext> = HashMap::new();
    let mut bus_subs: Vec<FanoutSlot<ServiceEvent>> = Vec::new();
    let mut next_bus_id: u64 = 1;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            FleetCommand::Shutdown => break,

            FleetCommand::PublishEvent(event) => {
                let key = event.bus_key();
                dispatch(&mut bus_subs, &key, || event.clone());
            }

            FleetCommand::UnsubscribeBus { id } => {
                bus_subs.retain(|s| s.id != id);
            }

            FleetCommand::Subscribe { filter, reply } => {
                let (tx, rx) = mpsc::channel(10);
                let id = next_bus_id;
                next_bus_id += 1;
                bus_subs.push(FanoutSlot { id, filter: filter.clone(), tx });
                let _ = reply.send(BusSubscription {
                    id,
                    filter,
                    rx,
                    closed: Arc::new(AtomicBool::new(false)),
                    unsub_tx: Some(cmd_tx.clone()),
                });
            }

            FleetCommand::Devices { reply } => {
                let mut summaries = Vec::with_capacity(registry.len());
                for (id, ctx) in &registry {
                    summaries.push(DeviceSummary {
                        id: id.clone(),
                        addr: ctx.addr,
                        state: ctx.session.state().await,
                        metadata: ctx.session.info().await,
                    });
                }
                summaries.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(summaries);
            }

            FleetCommand::Device { id, reply } => {
                let summary = match registry.get(&id) {
                    Some(ctx) => Some(DeviceSummary {
                        id: id.clone(),
                        addr: ctx.addr,
                        state: ctx.session.state().await,
                        metadata: ctx.session.info().await,
                    }),
                    None => None,
                };
                let _ = reply.send(summary);
            }

            FleetCommand::Unregister { id, reply } => {
                if let Some(ctx) = registry.remove(&id) {
                    ctx.reconnect.store(false, Ordering::SeqCst);
                    ctx.session.disconnect().await;
                    ctx.supervisor.abort();
                    invoke_all(&plugins, "OnUnregister", |p| p.on_unregister(&id));
                }
                let _ = reply.send(Ok(()));
            }

            FleetCommand::Register { id, addr, reply } => {
                let same_addr = registry.get(&id).map(|existing| existing.addr == addr).unwrap_or(false);
                if same_addr {
                    // Already registered at this address: a no-op, so a
                    // rediscovery sweep doesn't disturb a live session.
                    let _ = reply.send(Ok(()));
                    continue;
                }
                // Either unregistered, or registered at a stale address --
                // either way, tear down any old registration before
                // standing up the new one.
                if let Some(old) = registry.remove(&id) {
                    old.reconnect.store(false, Ordering::SeqCst);
                    old.session.disconnect().await;
                    old.supervisor.abort();
                    invoke_all(&plugins, "OnUnregister", |p| p.on_unregister(&id));
                }

                let dialer = tcp_dialer(addr);
                let session = DeviceSession::new(dialer);
                let reconnect = Arc::new(AtomicBool::new(true));
                let supervisor = tokio::spawn(supervise(
                    id.clone(),
                    session.clone(),
                    cmd_tx.clone(),
                    plugins.clone(),
                    reconnect.clone(),
                ));
                registry.insert(id.clone(), DeviceContext { addr, session, reconnect, supervisor });
                invoke_all(&plugins, "OnRegister", |p| p.on_register(&id));
                let _ = reply.send(Ok(()));
            }
        }
    }

    for (_, ctx) in registry {
        ctx.reconnect.store(false, Ordering::SeqCst);
        ctx.supervisor.abort();
    }
}
