use std::net::SocketAddr;
use std::sync::Arc;

use crate::TransportError;

/// A reliable, ordered byte stream to one remote service.
///
/// All methods take `&self`: the receive flow, the send flow and the
/// connection owner hold the same session concurrently. `close()` must
/// unblock a pending `read()` on the same session.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Read whatever is available into `buf`. Returns the byte count
    /// (never 0); end of stream is reported as [`TransportError::Closed`].
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write all of `data`. Concurrent writers never interleave.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the session. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Address of the remote side.
    fn remote_addr(&self) -> SocketAddr;
}

/// A bound listening endpoint.
#[async_trait::async_trait]
pub trait SessionListener: Send + Sync {
    /// Wait for the next inbound session. Fails with
    /// [`TransportError::ListenerClosed`] once `close()` was called.
    async fn accept(&self) -> Result<SharedSession, TransportError>;

    /// Stop accepting. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    fn local_addr(&self) -> SocketAddr;
}

/// Factory for listeners and outbound sessions.
#[async_trait::async_trait]
pub trait SessionTransport: Send + Sync {
    /// Bind a listener on `host`, trying each port of the configured
    /// range in order. Returns the listener and the bound port.
    async fn listen(&self, host: &str) -> Result<(SharedListener, u16), TransportError>;

    /// Open a session to `address:port`.
    async fn dial(&self, address: &str, port: u16) -> Result<SharedSession, TransportError>;

    /// Protocol name published in directory announcements.
    fn protocol(&self) -> &'static str;
}

pub type SharedSession = Arc<dyn Session>;
pub type SharedListener = Arc<dyn SessionListener>;
