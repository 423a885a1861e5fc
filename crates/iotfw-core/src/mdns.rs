//! mDNS-based device discovery, bridging the `mdns-sd` crate's callback
//! style into an async `Stream` of discovered devices.
//!
//! Grounded on the original driver's `mdns.go`, which browses a single
//! service type and reads `id`/`model`/`hw`/`fw` (or `ver`) out of each
//! instance's TXT record.

use std::net::SocketAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::session::Metadata;

/// Service type browsed by default; callers with a different fleet naming
/// scheme can pass their own to [`discover_with_service_type`].
pub const DEFAULT_SERVICE_TYPE: &str = "_iotfw._tcp.local.";

#[derive(Debug, Clone, thiserror::Error)]
pub enum MdnsError {
    #[error("failed to start mDNS daemon: {0}")]
    Daemon(String),
    #[error("failed to browse {service_type}: {source}")]
    Browse { service_type: String, source: String },
}

/// One device advertised over mDNS.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub addr: SocketAddr,
    pub metadata: Metadata,
}

/// Start browsing [`DEFAULT_SERVICE_TYPE`] and return a stream of devices as
/// they're resolved. The stream runs until dropped; dropping it stops the
/// underlying mDNS daemon.
pub fn discover() -> Result<ReceiverStream<DiscoveredDevice>, MdnsError> {
    discover_with_service_type(DEFAULT_SERVICE_TYPE)
}

pub fn discover_with_service_type(service_type: &str) -> Result<ReceiverStream<DiscoveredDevice>, MdnsError> {
    let daemon = ServiceDaemon::new().map_err(|e| MdnsError::Daemon(e.to_string()))?;
    let receiver = daemon
        .browse(service_type)
        .map_err(|e| MdnsError::Browse { service_type: service_type.to_owned(), source: e.to_string() })?;

    let (tx, rx) = mpsc::channel(32);
    let service_type = service_type.to_owned();
    tokio::spawn(async move {
        // `mdns-sd` delivers events on a crossbeam channel; bridge it onto a
        // blocking task rather than polling it from async code.
        let service_type_for_forward = service_type.clone();
        let forward = tokio::task::spawn_blocking(move || {
            while let Ok(event) = receiver.recv() {
                if let ServiceEvent::ServiceResolved(info) = event {
                    if let Some(device) = device_from_service_info(&info, &service_type_for_forward) {
                        if tx.blocking_send(device).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let _ = forward.await;
        // Keep the daemon alive for as long as the forwarding task runs;
        // shutting it down here (rather than leaking it) stops the browse.
        let _ = daemon.shutdown();
    });

    Ok(ReceiverStream::new(rx))
}

/// The device id is the mDNS instance name, not a TXT key -- the original
/// driver reads it off `ServiceRecord.Instance`, the part of `fullname`
/// before the service type.
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname.strip_suffix(&format!(".{service_type}")).unwrap_or(fullname).to_owned()
}

fn device_from_service_info(info: &mdns_sd::ServiceInfo, service_type: &str) -> Option<DiscoveredDevice> {
    let ip = info.get_addresses().iter().next()?;
    let addr = SocketAddr::new(*ip, info.get_port());
    let props = info.get_properties();
    let id = instance_name(info.get_fullname(), service_type);
    let model = props.get_property_val_str("model").unwrap_or_default().to_owned();
    let name = props.get_property_val_str("name").unwrap_or_default().to_owned();
    let hardware_version = props
        .get_property_val_str("hw")
        .and_then(|s| s.parse::<iotfw_protocol::Version>().ok())
        .unwrap_or_default();
    // Prefer `fw`; fall back to `ver` for the same reason the handshake
    // does -- a device's TXT record uses whichever field its firmware
    // still calls it.
    let firmware_version = props
        .get_property_val_str("fw")
        .or_else(|| props.get_property_val_str("ver"))
        .and_then(|s| s.parse::<iotfw_protocol::Version>().ok())
        .unwrap_or_default();

    Some(DiscoveredDevice {
        addr,
        metadata: Metadata { id, name, model, hardware_version, firmware_version },
    })
}

/// How long [`discover`] is typically given to settle before a caller treats
/// the devices seen so far as "the current fleet" -- mDNS resolution is
/// best-effort and devices can continue trickling in after this.
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_secs(3);
