//! The device session, discovery, and scanning primitives fleet management
//! is built on.
//!
//! `iotfw-core` owns exactly one connection at a time per [`DeviceSession`];
//! juggling many devices, reconnection policy, and cross-device pub/sub
//! belong to `iotfw-fleet`.

pub mod fanout;
pub mod mdns;
pub mod scan;
pub mod session;
pub mod subscription;
pub mod transport;

pub use fanout::{dispatch, FanoutSlot};
pub use mdns::{discover, discover_with_service_type, DiscoveredDevice, MdnsError};
pub use scan::{local_networks, scan_network, scan_network_with, ScanError, ScanResult};
pub use session::{ConnectionState, DeviceSession, ExecuteOutcome, Metadata, SessionError};
pub use subscription::{AttributeEvent, Subscription};
pub use transport::{tcp_dialer, tcp_dialer_with_timeout, BoxTransport, Dialer, Transport};
