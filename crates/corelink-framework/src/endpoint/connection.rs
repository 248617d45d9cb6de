//! Per-connection plumbing: handshake, receive flow and send flow.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use corelink_transport::{SessionTransport, SharedListener, SharedSession, TransportError};
use tokio::sync::{mpsc, oneshot};

use super::guardian::ConnEvent;
use super::{Links, Shared};
use crate::codec::WireFormat;
use crate::ids::{self, ServiceType};
use crate::{FrameworkError, Message};

/// Pause after an accept error that did not close the listener.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ── Reading ───────────────────────────────────────────────────────────

/// Turns a session's byte stream back into messages.
pub(crate) struct MessageReader {
    session: SharedSession,
    format: WireFormat,
    pending: Vec<u8>,
    ready: VecDeque<Message>,
    chunk: Vec<u8>,
    capacity: usize,
    shared: Arc<Shared>,
}

impl MessageReader {
    pub(crate) fn new(session: SharedSession, shared: Arc<Shared>) -> Self {
        let config = &shared.config;
        Self {
            session,
            format: config.wire_format,
            pending: Vec::new(),
            ready: VecDeque::new(),
            chunk: vec![0u8; config.read_chunk.max(1)],
            capacity: config.buffer_capacity,
            shared,
        }
    }

    /// Next complete message, reading from the session as needed.
    pub(crate) async fn next(&mut self) -> Result<Message, TransportError> {
        loop {
            if let Some(msg) = self.ready.pop_front() {
                return Ok(msg);
            }
            let n = self.session.read(&mut self.chunk).await?;
            self.pending.extend_from_slice(&self.chunk[..n]);

            let decoded = self.format.decode_stream(&self.pending);
            self.ready.extend(decoded.messages);
            if decoded.corrupt {
                tracing::warn!(
                    "endpoint: discarding {} undecodable bytes from {}",
                    self.pending.len() - decoded.consumed,
                    self.session.remote_addr()
                );
                self.shared.stats.buffer_discards.inc();
                self.pending.clear();
            } else {
                self.pending.drain(..decoded.consumed);
                if self.pending.len() > self.capacity {
                    tracing::warn!(
                        "endpoint: receive buffer from {} exceeded {} bytes, discarding",
                        self.session.remote_addr(),
                        self.capacity
                    );
                    self.shared.stats.buffer_discards.inc();
                    self.pending.clear();
                }
            }
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────

fn hello(shared: &Shared) -> Message {
    let mut msg = Message::new(ids::CONNECTION_OPENED);
    msg.set_string(ids::PARAM_KEY_NAME, shared.name());
    msg.set_uint(
        ids::PARAM_KEY_TYPE,
        shared.identity.service_type().as_u64(),
    );
    msg
}

async fn write_message(
    session: &SharedSession,
    format: WireFormat,
    msg: &Message,
) -> Result<(), FrameworkError> {
    let bytes = format.encode(msg)?;
    session.write(&bytes).await?;
    Ok(())
}

async fn read_hello(
    reader: &mut MessageReader,
    timeout: Duration,
) -> Result<(String, ServiceType), FrameworkError> {
    let msg = tokio::time::timeout(timeout, reader.next())
        .await
        .map_err(|_| FrameworkError::Handshake {
            reason: format!("no introduction within {timeout:?}"),
        })??;
    if msg.id() != ids::CONNECTION_OPENED {
        return Err(FrameworkError::Handshake {
            reason: format!("expected introduction, got {}", msg.id()),
        });
    }
    let name = msg.get_string(ids::PARAM_KEY_NAME)?.to_string();
    let service_type = ServiceType::from_u64(msg.get_uint(ids::PARAM_KEY_TYPE)?)?;
    if name.is_empty() {
        return Err(FrameworkError::Handshake {
            reason: "empty service name".to_string(),
        });
    }
    Ok((name, service_type))
}

// ── Connector ─────────────────────────────────────────────────────────

/// Opens and registers connections, inbound and outbound.
pub(crate) struct Connector {
    shared: Arc<Shared>,
    transport: Arc<dyn SessionTransport>,
    links: Links,
}

/// What the guardian handed back when it accepted a connection.
struct Registered {
    conn: u64,
    name: String,
    outgoing: mpsc::Receiver<Message>,
    finished: oneshot::Sender<()>,
}

impl Connector {
    pub(crate) fn new(shared: Arc<Shared>, transport: Arc<dyn SessionTransport>, links: Links) -> Self {
        Self {
            shared,
            transport,
            links,
        }
    }

    /// Dial a remote service, introduce ourselves, learn who answered and
    /// start the connection's flows.
    pub(crate) async fn connect(&self, address: &str, port: u16) -> Result<(), FrameworkError> {
        let session = self.transport.dial(address, port).await?;
        let mut reader = MessageReader::new(session.clone(), self.shared.clone());

        let registered = async {
            write_message(&session, self.shared.config.wire_format, &hello(&self.shared)).await?;
            let (name, service_type) =
                read_hello(&mut reader, self.shared.config.handshake_timeout).await?;
            self.register(&session, name, service_type).await
        }
        .await;

        match registered {
            Ok(registered) => {
                tracing::debug!(
                    "endpoint: connected to '{}' at {address}:{port}",
                    registered.name
                );
                self.spawn_flow(session, reader, registered);
                Ok(())
            }
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    /// Inbound side: learn who connected, register, then introduce
    /// ourselves. Failures are logged and the session dropped.
    pub(crate) async fn accept(self: Arc<Self>, session: SharedSession) {
        let remote = session.remote_addr();
        let mut reader = MessageReader::new(session.clone(), self.shared.clone());

        let registered = async {
            let (name, service_type) =
                read_hello(&mut reader, self.shared.config.handshake_timeout).await?;
            self.register(&session, name, service_type).await
        }
        .await;

        let registered = match registered {
            Ok(registered) => registered,
            Err(e) => {
                tracing::warn!("endpoint: inbound session from {remote} rejected: {e}");
                let _ = session.close().await;
                return;
            }
        };

        if let Err(e) =
            write_message(&session, self.shared.config.wire_format, &hello(&self.shared)).await
        {
            // The flow sees the closed session and reports the loss.
            tracing::warn!("endpoint: introduce to '{}' failed: {e}", registered.name);
            let _ = session.close().await;
        }
        tracing::debug!("endpoint: accepted '{}' from {remote}", registered.name);
        self.spawn_flow(session, reader, registered);
    }

    /// Ask the guardian to take the connection into its table.
    async fn register(
        &self,
        session: &SharedSession,
        name: String,
        service_type: ServiceType,
    ) -> Result<Registered, FrameworkError> {
        let conn = self.shared.next_connection_id();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.shared.config.queue_capacity);
        let (finished_tx, finished_rx) = oneshot::channel();
        let (reply, accepted) = oneshot::channel();

        self.links
            .events
            .send(ConnEvent::Open {
                conn,
                name: name.clone(),
                service_type,
                address: session.remote_addr().ip().to_string(),
                session: session.clone(),
                outgoing: outgoing_tx,
                finished: finished_rx,
                reply,
            })
            .await
            .map_err(|_| FrameworkError::NotRunning)?;

        match accepted.await {
            Ok(true) => Ok(Registered {
                conn,
                name,
                outgoing: outgoing_rx,
                finished: finished_tx,
            }),
            Ok(false) => Err(FrameworkError::AlreadyConnected(name)),
            Err(_) => Err(FrameworkError::NotRunning),
        }
    }

    fn spawn_flow(&self, session: SharedSession, reader: MessageReader, registered: Registered) {
        tokio::spawn(connection_flow(
            session,
            reader,
            registered,
            self.links.clone(),
            self.shared.clone(),
        ));
    }
}

pub(crate) async fn accept_loop(listener: SharedListener, connector: Arc<Connector>) {
    loop {
        match listener.accept().await {
            Ok(session) => {
                tokio::spawn(connector.clone().accept(session));
            }
            Err(e) if e.is_closed() => break,
            Err(e) => {
                tracing::warn!("endpoint: accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("endpoint: accept loop exited");
}

// ── Flows ─────────────────────────────────────────────────────────────

/// Run the receive flow until the session ends, then shut the send flow
/// down, report the close and signal that we are done.
async fn connection_flow(
    session: SharedSession,
    mut reader: MessageReader,
    registered: Registered,
    links: Links,
    shared: Arc<Shared>,
) {
    let Registered {
        conn,
        name,
        outgoing,
        finished,
    } = registered;

    let (stop_tx, stop_rx) = oneshot::channel();
    let send = tokio::spawn(send_flow(
        session.clone(),
        shared.config.wire_format,
        outgoing,
        stop_rx,
        name.clone(),
    ));

    let gracefully = receive_flow(&mut reader, conn, &name, &links, &shared).await;

    let _ = stop_tx.send(());
    let _ = send.await;
    let _ = session.close().await;

    let _ = links
        .events
        .send(ConnEvent::Close {
            conn,
            name: name.clone(),
            gracefully,
        })
        .await;
    let _ = finished.send(());
    tracing::debug!("endpoint: flow for '{name}' finished (gracefully: {gracefully})");
}

/// Returns whether the remote side said goodbye.
async fn receive_flow(
    reader: &mut MessageReader,
    conn: u64,
    name: &str,
    links: &Links,
    shared: &Shared,
) -> bool {
    loop {
        let mut msg = match reader.next().await {
            Ok(msg) => msg,
            Err(e) if e.is_closed() => {
                tracing::debug!("endpoint: session to '{name}' closed");
                return false;
            }
            Err(e) => {
                tracing::warn!("endpoint: receive from '{name}' failed: {e}");
                return false;
            }
        };

        let id = msg.id();
        if id == ids::CONNECTION_KEEP_ALIVE {
            let heartbeat = ConnEvent::Heartbeat {
                conn,
                name: name.to_string(),
            };
            if links.events.send(heartbeat).await.is_err() {
                return false;
            }
        } else if id == ids::CONNECTION_CLOSED {
            tracing::debug!("endpoint: '{name}' closed the connection");
            return true;
        } else if id == ids::CONNECTION_OPENED {
            tracing::debug!("endpoint: ignoring repeated introduction from '{name}'");
        } else {
            if msg.sender().is_empty() {
                msg.set_sender(name);
            }
            shared.stats.received.inc();
            if links.incoming.send(msg).await.is_err() {
                return false;
            }
        }
    }
}

async fn send_flow(
    session: SharedSession,
    format: WireFormat,
    mut outgoing: mpsc::Receiver<Message>,
    mut stop: oneshot::Receiver<()>,
    name: String,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            msg = outgoing.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write_message(&session, format, &msg).await {
                    tracing::warn!("endpoint: send to '{name}' failed: {e}");
                    let _ = session.close().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointConfig, Identity};
    use crate::ids::MessageId;
    use corelink_transport::{TcpTransport, TransportConfig};
    use std::ops::Range;

    const NOTE: MessageId = MessageId::new(1, 0x30, ids::KIND_REQUEST);
    const KEY_TEXT: u32 = 7;

    /// Small reads and a small buffer so a few bytes exercise every path.
    fn small_buffers() -> Arc<Shared> {
        let config = EndpointConfig {
            read_chunk: 8,
            buffer_capacity: 64,
            ..EndpointConfig::new()
        };
        Arc::new(Shared::new(
            Identity::new("Core_rd", ServiceType::Core),
            config,
        ))
    }

    async fn session_pair(ports: Range<u16>) -> (SharedSession, SharedSession) {
        let transport = TcpTransport::new(TransportConfig::new().port_range(ports));
        let (listener, port) = transport.listen("127.0.0.1").await.unwrap();
        let (accepted, dialed) =
            tokio::join!(listener.accept(), transport.dial("127.0.0.1", port));
        (accepted.unwrap(), dialed.unwrap())
    }

    /// Drive a reader on `session`, forwarding each decoded message.
    fn spawn_reader(session: SharedSession, shared: Arc<Shared>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reader = MessageReader::new(session, shared);
        tokio::spawn(async move {
            while let Ok(msg) = reader.next().await {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn note(text: &str) -> Vec<u8> {
        let mut msg = Message::new(NOTE);
        msg.set_string(KEY_TEXT, text);
        WireFormat::Json.encode(&msg).unwrap()
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no message decoded")
            .expect("reader exited");
        msg.get_string(KEY_TEXT).unwrap().to_string()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn message_split_across_writes_is_reassembled() {
        let shared = small_buffers();
        let (server, client) = session_pair(27000..27030).await;
        let mut rx = spawn_reader(server, shared.clone());

        let bytes = note("split in two");
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        client.write(head).await.unwrap();
        settle().await;
        assert!(rx.try_recv().is_err());

        client.write(tail).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "split in two");

        // Two messages in one write come out in order.
        let mut both = note("first");
        both.extend(note("second"));
        client.write(&both).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "first");
        assert_eq!(next_text(&mut rx).await, "second");
        assert_eq!(shared.stats.buffer_discards.get(), 0);
    }

    #[tokio::test]
    async fn oversized_pending_data_is_discarded() {
        let shared = small_buffers();
        let (server, client) = session_pair(27030..27060).await;
        let mut rx = spawn_reader(server, shared.clone());

        // An unterminated string that never completes within the buffer.
        let mut runaway = br#"{"id":1,"strings":{"0":""#.to_vec();
        runaway.extend(std::iter::repeat(b'x').take(200));
        client.write(&runaway).await.unwrap();
        settle().await;
        assert!(rx.try_recv().is_err());
        assert!(shared.stats.buffer_discards.get() >= 1);

        client.write(&note("after overflow")).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "after overflow");
    }

    #[tokio::test]
    async fn corrupt_bytes_are_dropped_and_reading_resumes() {
        let shared = small_buffers();
        let (server, client) = session_pair(27060..27090).await;
        let mut rx = spawn_reader(server, shared.clone());

        client.write(b"}}broken").await.unwrap();
        settle().await;
        assert!(rx.try_recv().is_err());
        assert!(shared.stats.buffer_discards.get() >= 1);

        client.write(&note("clean again")).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "clean again");
    }
}
