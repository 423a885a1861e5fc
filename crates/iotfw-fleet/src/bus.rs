//! The fleet-wide event bus: every registered device's attribute changes
//! and connect/disconnect transitions, addressable as dotted keys prefixed
//! by device id (`esp-7fe02c.led.0`, `esp-7fe02c.@event`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use iotfw_protocol::AttributeValue;

use crate::actor::FleetCommand;

#[derive(Debug, Clone)]
pub enum ServiceEventKind {
    Connect,
    Disconnect,
    Attribute(AttributeValue),
}

/// One bus-scoped event: which device, which dotted key within it, and
/// what happened.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub device_id: String,
    pub key: String,
    pub kind: ServiceEventKind,
}

impl ServiceEvent {
    /// The fully-qualified bus key this event is filtered and delivered
    /// under: `<device_id>.<key>`.
    pub fn bus_key(&self) -> String {
        format!("{}.{}", self.device_id, self.key)
    }
}

/// A subscriber's view of the fleet bus, filtered by a dotted-key pattern.
/// Mirrors `iotfw_core::Subscription` one level up: same bounded channel,
/// same idempotent-close contract.
pub struct BusSubscription {
    pub(crate) id: u64,
    pub(crate) filter: String,
    pub(crate) rx: mpsc::Receiver<ServiceEvent>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) unsub_tx: Option<mpsc::Sender<FleetCommand>>,
}

impl BusSubscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        self.rx.recv().await
    }

    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.unsub_tx.take() {
            let _ = tx.send(FleetCommand::UnsubscribeBus { id: self.id }).await;
        }
        self.rx.close();
    }
}
