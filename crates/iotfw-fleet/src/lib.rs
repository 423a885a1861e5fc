//! Fleet management: a registry of device sessions, each kept alive by its
//! own reconnect-with-backoff supervisor, all multiplexed onto a single
//! dotted-key event bus.

mod actor;
mod bus;
mod hooks;
mod supervisor;

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot, Mutex};

pub use actor::DeviceSummary;
pub use bus::{BusSubscription, ServiceEvent, ServiceEventKind};
pub use hooks::{FleetHooks, NoopHooks};
pub use supervisor::RECONNECT_BACKOFF;

use actor::{fleet_actor, FleetCommand};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FleetError {
    #[error("fleet has not been started")]
    NotStarted,
    #[error("fleet has already been started")]
    AlreadyStarted,
}

/// A handle to a running (or not-yet-started) fleet. Cheaply cloned; every
/// clone talks to the same registry and bus.
#[derive(Clone)]
pub struct Fleet {
    cmd_tx: std::sync::Arc<Mutex<Option<mpsc::Sender<FleetCommand>>>>,
    plugins: std::sync::Arc<Vec<std::sync::Arc<dyn FleetHooks>>>,
}

impl Fleet {
    /// Installs `plugins` in registration order; every capability hook each
    /// one implements is invoked inline on the service loop as the
    /// corresponding state transition happens, mirroring the original
    /// driver's `Service.Plugins []ServicePlugin`.
    pub fn new(plugins: Vec<std::sync::Arc<dyn FleetHooks>>) -> Self {
        Fleet { cmd_tx: std::sync::Arc::new(Mutex::new(None)), plugins: std::sync::Arc::new(plugins) }
    }

    pub fn with_default_hooks() -> Self {
        Self::new(Vec::new())
    }

    /// Spawns the fleet's registry actor. One-shot: a second call returns
    /// [`FleetError::AlreadyStarted`] without disturbing the running fleet.
    pub async fn start(&self) -> Result<(), FleetError> {
        let mut guard = self.cmd_tx.lock().await;
        if guard.is_some() {
            return Err(FleetError::AlreadyStarted);
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(fleet_actor(cmd_rx, cmd_tx.clone(), self.plugins.clone()));
        *guard = Some(cmd_tx);
        Ok(())
    }

    /// Shuts the fleet down: every supervisor is aborted and every device
    /// session dropped without a graceful disconnect handshake. Idempotent.
    pub async fn shutdown(&self) {
        let mut guard = self.cmd_tx.lock().await;
        if let Some(tx) = guard.take() {
            let _ = tx.send(FleetCommand::Shutdown).await;
        }
    }

    /// Registers (or, if already registered at a different address,
    /// re-registers) a device and starts its reconnect supervisor.
    /// Re-registering at the same address is a no-op.
    pub async fn register(&self, id: impl Into<String>, addr: SocketAddr) -> Result<(), FleetError> {
        let cmd_tx = self.cmd_tx().await?;
        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(FleetCommand::Register { id: id.into(), addr, reply })
            .await
            .map_err(|_| FleetError::NotStarted)?;
        reply_rx.await.map_err(|_| FleetError::NotStarted)?
    }

    pub async fn unregister(&self, id: impl Into<String>) -> Result<(), FleetError> {
        let cmd_tx = self.cmd_tx().await?;
        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(FleetCommand::Unregister { id: id.into(), reply })
            .await
            .map_err(|_| FleetError::NotStarted)?;
        reply_rx.await.map_err(|_| FleetError::NotStarted)?
    }

    pub async fn devices(&self) -> Result<Vec<DeviceSummary>, FleetError> {
        let cmd_tx = self.cmd_tx().await?;
        let (reply, reply_rx) = oneshot::channel();
        cmd_tx.send(FleetCommand::Devices { reply }).await.map_err(|_| FleetError::NotStarted)?;
        reply_rx.await.map_err(|_| FleetError::NotStarted)
    }

    pub async fn device(&self, id: &str) -> Result<Option<DeviceSummary>, FleetError> {
        let cmd_tx = self.cmd_tx().await?;
        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(FleetCommand::Device { id: id.to_owned(), reply })
            .await
            .map_err(|_| FleetError::NotStarted)?;
        reply_rx.await.map_err(|_| FleetError::NotStarted)
    }

    /// Subscribes to the fleet-wide bus. Keys are `<device_id>.<attr>` (or
    /// `<device_id>.@event` for connect/disconnect), so `"*.led.0"` matches
    /// every device's `led.0` and `"esp-1.>"` matches everything from one
    /// device.
    pub async fn subscribe(&self, filter: &str) -> Result<BusSubscription, FleetError> {
        let cmd_tx = self.cmd_tx().await?;
        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(FleetCommand::Subscribe { filter: filter.to_owned(), reply })
            .await
            .map_err(|_| FleetError::NotStarted)?;
        reply_rx.await.map_err(|_| FleetError::NotStarted)
    }

    async fn cmd_tx(&self) -> Result<mpsc::Sender<FleetCommand>, FleetError> {
        self.cmd_tx.lock().await.clone().ok_or(FleetError::NotStarted)
    }
}
