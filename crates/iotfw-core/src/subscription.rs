//! A live handle to a device session's async-event stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use iotfw_protocol::AttributeValue;

use crate::session::Command;

/// One `@attr` notification, decoded and filtered against a subscription.
#[derive(Debug, Clone)]
pub struct AttributeEvent {
    pub name: String,
    pub value: AttributeValue,
}

/// A subscriber's view of a session's matching attribute events.
///
/// Dropping a `Subscription` without calling [`Subscription::close`] is safe
/// -- the owning session notices the receiver went away on its next delivery
/// attempt and evicts the slot itself -- but `close` is preferred where the
/// caller knows it is done, since it frees the slot immediately instead of
/// waiting for the next matching event.
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) filter: String,
    pub(crate) rx: mpsc::Receiver<AttributeEvent>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) unsub_tx: Option<mpsc::Sender<Command>>,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Await the next event matching this subscription's filter, or `None`
    /// once the owning session has closed the channel (explicit close,
    /// slow-consumer eviction, or session teardown).
    pub async fn recv(&mut self) -> Option<AttributeEvent> {
        self.rx.recv().await
    }

    /// Detach from the owning session. Idempotent: a second call is a no-op.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.unsub_tx.take() {
            let _ = tx.send(Command::Unsubscribe { id: self.id }).await;
        }
        self.rx.close();
    }
}
