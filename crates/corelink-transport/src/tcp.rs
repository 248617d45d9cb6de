use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use crate::config::TransportConfig;
use crate::session::{Session, SessionListener, SessionTransport, SharedListener, SharedSession};
use crate::TransportError;

/// [`SessionTransport`] over plain TCP.
///
/// TCP already gives the ordering and reliability the framework needs;
/// message boundaries are recovered by the framework's stream decoder.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TransportConfig::new())
    }
}

#[async_trait::async_trait]
impl SessionTransport for TcpTransport {
    async fn listen(&self, host: &str) -> Result<(SharedListener, u16), TransportError> {
        let ports = self.config.ports();
        for port in ports.clone() {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    tracing::debug!("transport: listening on {local}");
                    let listener: SharedListener = Arc::new(TcpSessionListener::new(
                        listener,
                        local,
                        self.config.nodelay,
                    ));
                    return Ok((listener, port));
                }
                Err(e) => {
                    tracing::trace!("transport: bind {host}:{port} failed: {e}");
                }
            }
        }
        Err(TransportError::NoPortAvailable {
            host: host.to_string(),
            start: ports.start,
            end: ports.end,
        })
    }

    async fn dial(&self, address: &str, port: u16) -> Result<SharedSession, TransportError> {
        let stream = TcpStream::connect((address, port))
            .await
            .map_err(|source| TransportError::Dial {
                address: format!("{address}:{port}"),
                source,
            })?;
        let session = TcpSession::from_stream(stream, self.config.nodelay)?;
        Ok(Arc::new(session))
    }

    fn protocol(&self) -> &'static str {
        crate::TCP_PROTOCOL
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// One TCP connection split into independently locked halves.
pub struct TcpSession {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    remote: SocketAddr,
    closed: watch::Sender<bool>,
}

impl TcpSession {
    pub fn from_stream(stream: TcpStream, nodelay: bool) -> Result<Self, TransportError> {
        stream.set_nodelay(nodelay)?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote,
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait::async_trait]
impl Session for TcpSession {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            result = reader.read(buf) => match result {
                Ok(0) => Err(TransportError::Closed),
                Ok(n) => Ok(n),
                Err(e) => Err(e.into()),
            },
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Err(TransportError::Closed),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

// ── Listener ─────────────────────────────────────────────────────────

pub struct TcpSessionListener {
    listener: TcpListener,
    local: SocketAddr,
    nodelay: bool,
    closed: watch::Sender<bool>,
}

impl TcpSessionListener {
    fn new(listener: TcpListener, local: SocketAddr, nodelay: bool) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            listener,
            local,
            nodelay,
            closed,
        }
    }
}

#[async_trait::async_trait]
impl SessionListener for TcpSessionListener {
    async fn accept(&self) -> Result<SharedSession, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::ListenerClosed);
        }
        tokio::select! {
            result = self.listener.accept() => {
                let (stream, _) = result?;
                let session = TcpSession::from_stream(stream, self.nodelay)?;
                Ok(Arc::new(session) as SharedSession)
            }
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Err(TransportError::ListenerClosed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(ports: std::ops::Range<u16>) -> TcpTransport {
        TcpTransport::new(TransportConfig::new().port_range(ports))
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let transport = transport(23100..23150);
        let (listener, port) = transport.listen("127.0.0.1").await.unwrap();
        let client = transport.dial("127.0.0.1", port).await.unwrap();
        let _server = listener.accept().await.unwrap();

        let reader = client.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.close().await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
            .await
            .expect("read still blocked")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(client.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn closed_listener_rejects_accept() {
        let transport = transport(23150..23200);
        let (listener, _) = transport.listen("127.0.0.1").await.unwrap();
        listener.close().await.unwrap();
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn remote_close_reads_as_closed() {
        let transport = transport(23200..23250);
        let (listener, port) = transport.listen("127.0.0.1").await.unwrap();
        let client = transport.dial("127.0.0.1", port).await.unwrap();
        let server = listener.accept().await.unwrap();

        client.close().await.unwrap();
        let mut buf = [0u8; 8];
        let result = server.read(&mut buf).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
