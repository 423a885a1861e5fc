//! Wire-level types shared by the device session and fleet crates.
//!
//! Everything in this crate is pure and allocation-light: packet encoding and
//! decoding, dotted-key filter matching, and firmware version parsing. No I/O
//! lives here.

pub mod attribute;
pub mod filter;
pub mod version;
pub mod wire;

pub use attribute::AttributeValue;
pub use filter::matches;
pub use version::{Version, VersionError};
pub use wire::{decode, encode, CodecError, Packet};

/// Reserved command tokens defined by the wire protocol (see `wire` module).
pub mod commands {
    pub const INFO: &str = "info";
    pub const LIST: &str = "list";
    pub const SET: &str = "set";
    pub const SUB: &str = "sub";
    pub const PING: &str = "ping";
    pub const OK: &str = "ok";
    pub const ERR: &str = "err";
    pub const ATTR: &str = "attr";
    pub const OUTPUT: &str = "output";
    pub const DEBUG: &str = "debug";
    /// Async attribute-change notification (device -> host).
    pub const ASYNC_ATTR: &str = "@attr";
    /// Synthesised by the fleet service, never sent by a device.
    pub const ASYNC_EVENT: &str = "@event";
}
