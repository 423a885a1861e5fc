//! Plugin hooks invoked inline on the fleet's per-device supervisor as a
//! device is registered, connects, disconnects, and is unregistered.
//!
//! Kept as a plain object-safe trait with no-op default hook methods rather
//! than a set of boxed closures, so a plugin can hold its own state across
//! calls (counters, a metrics handle, a database connection) the way the
//! original driver's plugin interface does. The original models a plugin as
//! any type exposing `ServiceName() string` plus zero or more of
//! `ServicePluginOnRegister`/`OnConnect`/`OnDisconnect`/`OnUnregister` as
//! separate optional interfaces, checked with a type assertion at each call
//! site; collapsing those into one trait with no-op defaults gets the same
//! "implement only the hooks you need" behaviour without the type-assertion
//! dance, which Rust's object model has no equivalent for anyway.

use iotfw_core::{DeviceSession, SessionError};

pub trait FleetHooks: Send + Sync {
    /// Identifies this plugin in supervisor log lines, mirroring the
    /// original driver's `ServiceName()`.
    fn service_name(&self) -> &str;

    fn on_register(&self, _id: &str) {}
    fn on_connect(&self, _id: &str, _session: &DeviceSession) {}
    fn on_disconnect(&self, _id: &str, _error: &SessionError) {}
    fn on_unregister(&self, _id: &str) {}
}

/// The default: does nothing. Used when a caller has no plugins to install.
pub struct NoopHooks;

impl FleetHooks for NoopHooks {
    fn service_name(&self) -> &str {
        "noop"
    }
}

/// Invoke one hook on every installed plugin, in registration order, logging
/// each under its `service_name()` the way the original driver's `logf`
/// does before each plugin call.
pub(crate) fn invoke_all(plugins: &[std::sync::Arc<dyn FleetHooks>], hook: &str, f: impl Fn(&dyn FleetHooks)) {
    for plugin in plugins {
        tracing::debug!(plugin = plugin.service_name(), hook, "executing fleet plugin hook");
        f(plugin.as_ref());
    }
}
