//! Non-blocking fan-out with slow-consumer eviction, shared by the device
//! session's subscriber list and the fleet service bus.
//!
//! A subscriber that cannot keep up is detached rather than allowed to stall
//! delivery to everyone else -- the same trade-off the original driver makes
//! by closing a subscription's channel once its buffered send fails.

use tokio::sync::mpsc;

/// One registered subscriber: a filter over dotted keys and the channel
/// events matching it are delivered on.
pub struct FanoutSlot<T> {
    pub id: u64,
    pub filter: String,
    pub tx: mpsc::Sender<T>,
}

/// Deliver one event (built lazily via `make_event`, since building it may
/// not be free) to every slot whose filter matches `key`. A slot whose
/// channel is full or closed is collected as slow and removed after the
/// walk completes -- never while the vector being walked is still borrowed.
pub fn dispatch<T>(slots: &mut Vec<FanoutSlot<T>>, key: &str, make_event: impl Fn() -> T) {
    let mut slow = Vec::new();
    for (i, slot) in slots.iter().enumerate() {
        if iotfw_protocol::matches(key, &slot.filter) && slot.tx.try_send(make_event()).is_err() {
            slow.push(i);
        }
    }
    for i in slow.into_iter().rev() {
        slots.remove(i);
    }
}
