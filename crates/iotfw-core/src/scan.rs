//! Active network sweep: dial every host in a subnet and keep the ones that
//! answer the device handshake.
//!
//! The original driver fans a subnet scan out across a fixed pool of 64
//! goroutines reading from a shared job channel. The idiomatic-Rust
//! equivalent is a `Semaphore`-gated `tokio::spawn` per host: same bounded
//! concurrency, no explicit worker loop to manage.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use tokio::sync::Semaphore;

use crate::session::{probe_info, Metadata};
use crate::transport::tcp_dialer_with_timeout;

/// Matches the original driver's fixed worker-pool size.
pub const DEFAULT_SCAN_CONCURRENCY: usize = 64;
pub const DEFAULT_SCAN_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("failed to enumerate local network interfaces: {0}")]
    Interfaces(String),
}

/// One device that answered the handshake during a sweep.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub addr: SocketAddr,
    pub metadata: Metadata,
}

/// Sweep every address in `network` on `port`, keeping devices that answer
/// the `info` handshake within [`DEFAULT_SCAN_DIAL_TIMEOUT`]. Per-host
/// failures (refused, timed out, garbled handshake) are dropped silently --
/// the scan as a whole still reports every host that did answer. Results
/// are sorted by device id.
pub async fn scan_network(network: Ipv4Network, port: u16) -> Vec<ScanResult> {
    scan_network_with(network, port, DEFAULT_SCAN_CONCURRENCY, DEFAULT_SCAN_DIAL_TIMEOUT).await
}

pub async fn scan_network_with(
    network: Ipv4Network,
    port: u16,
    concurrency: usize,
    dial_timeout: Duration,
) -> Vec<ScanResult> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::new();

    for ip in network.iter() {
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("scan semaphore is never closed");
            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            let dialer = tcp_dialer_with_timeout(addr, dial_timeout);
            probe_info(&dialer).await.ok().map(|metadata| ScanResult { addr, metadata })
        }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(Some(result)) = task.await {
            results.push(result);
        }
    }
    results.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
    results
}

/// Enumerate the IPv4 networks attached to this host's non-loopback
/// interfaces, one [`Ipv4Network`] per interface address.
pub fn local_networks() -> Result<Vec<Ipv4Network>, ScanError> {
    let interfaces = if_addrs::get_if_addrs().map_err(|e| ScanError::Interfaces(e.to_string()))?;
    let mut networks = Vec::new();
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            if let Ok(network) = Ipv4Network::with_netmask(v4.ip, v4.netmask) {
                networks.push(network);
            }
        }
    }
    networks.sort_by_key(ToString::to_string);
    networks.dedup();
    Ok(networks)
}
