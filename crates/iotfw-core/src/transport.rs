//! Dialer abstraction: a cheaply-cloned factory for opening one fresh
//! transport to a device. Kept as a boxed closure rather than a trait object
//! built on `async_trait`, since the only thing callers ever do with it is
//! call it and await the future -- a concrete `Fn` pointer says that more
//! directly than a trait would.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Anything readable/writable asynchronously and sendable across tasks can
/// stand in for a device socket.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send>>;

/// Opens one connection attempt per call. Sessions hold a `Dialer` and call
/// it again on every reconnect; it carries no per-attempt state itself.
pub type Dialer = Arc<dyn Fn() -> DialFuture + Send + Sync>;

/// Default dial timeout, matching the original driver's
/// `net.DialTimeout("tcp", addr, 2*time.Second)`.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Build a dialer that opens a TCP connection to `addr`, failing the dial if
/// it does not complete within `timeout`.
pub fn tcp_dialer_with_timeout(addr: SocketAddr, timeout: Duration) -> Dialer {
    Arc::new(move || {
        Box::pin(async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out")))??;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream) as BoxTransport)
        })
    })
}

/// Build a dialer for `addr` using [`DEFAULT_DIAL_TIMEOUT`].
pub fn tcp_dialer(addr: SocketAddr) -> Dialer {
    tcp_dialer_with_timeout(addr, DEFAULT_DIAL_TIMEOUT)
}
