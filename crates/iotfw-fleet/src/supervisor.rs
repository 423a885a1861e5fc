//! Per-device supervisor: connect, forward events onto the bus, wait for
//! disconnect, back off, repeat.
//!
//! Grounded on the original driver's per-device goroutine: connect, publish
//! a connect event, invoke lifecycle hooks, block until disconnect,
//! publish a disconnect event, invoke the disconnect hook, and -- if still
//! wanted -- sleep before trying again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use iotfw_core::DeviceSession;

use crate::actor::FleetCommand;
use crate::bus::{ServiceEvent, ServiceEventKind};
use crate::hooks::{invoke_all, FleetHooks};

/// Delay between a disconnect (or failed connect attempt) and the next
/// reconnect attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) async fn supervise(
    id: String,
    session: DeviceSession,
    bus_tx: mpsc::Sender<FleetCommand>,
    plugins: Arc<Vec<Arc<dyn FleetHooks>>>,
    reconnect: Arc<AtomicBool>,
) {
    while reconnect.load(Ordering::SeqCst) {
        match session.connect().await {
            Ok(()) => {
                publish(&bus_tx, &id, "@event", ServiceEventKind::Connect).await;
                let forwarder = spawn_bus_forwarder(id.clone(), session.clone(), bus_tx.clone());
                invoke_all(&plugins, "OnConnect", |p| p.on_connect(&id, &session));

                let terminal = session.wait().await;
                forwarder.abort();
                publish(&bus_tx, &id, "@event", ServiceEventKind::Disconnect).await;
                invoke_all(&plugins, "OnDisconnect", |p| p.on_disconnect(&id, &terminal));
            }
            Err(e) => {
                tracing::warn!(device = %id, error = %e, "connect attempt failed");
            }
        }

        if reconnect.load(Ordering::SeqCst) {
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }
}

fn spawn_bus_forwarder(
    id: String,
    session: DeviceSession,
    bus_tx: mpsc::Sender<FleetCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(mut sub) = session.subscribe(">").await else {
            return;
        };
        while let Some(event) = sub.recv().await {
            publish(&bus_tx, &id, &event.name, ServiceEventKind::Attribute(event.value)).await;
        }
    })
}

async fn publish(bus_tx: &mpsc::Sender<FleetCommand>, device_id: &str, key: &str, kind: ServiceEventKind) {
    let event = ServiceEvent { device_id: device_id.to_owned(), key: key.to_owned(), kind };
    let _ = bus_tx.send(FleetCommand::PublishEvent(event)).await;
}
