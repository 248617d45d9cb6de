//! Endpoint service: discovery, connection management and routing.
//!
//! An endpoint is either the hub (publishes itself in the group
//! directory and accepts sessions) or a peer (queries the directory,
//! connects to the hub, and reconnects when the hub goes away). Both
//! roles also accept inbound sessions from other services.
//!
//! Work is split across single-purpose tasks that talk over bounded
//! channels: one accept loop, one guardian owning the connection table,
//! one dispatch loop feeding the [`ServiceHandler`], and a receive/send
//! flow pair per connection.
mod config;
mod connection;
mod guardian;
mod handler;
mod recovery;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use corelink_metrics::{Counter, Gauge};
use corelink_transport::{
    GroupDirectory, ServiceRecord, SessionTransport, SharedListener, TransportError,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::ids::{self, ServiceType, HUB_KIND};
use crate::{FrameworkError, Message};

pub use config::{generate_name, EndpointConfig, Identity};
pub use guardian::{ConnectionInfo, ConnectionStatus};
pub use handler::ServiceHandler;

use connection::Connector;
use guardian::{ConnEvent, Guardian, Routes};

/// Lifecycle of an endpoint: `Stopped → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Stopped,
    Running,
    Stopping,
}

/// Which side of the cluster an endpoint plays, derived from its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Hub,
    Peer,
}

/// Counters kept by an endpoint.
#[derive(Debug, Default, Serialize)]
pub struct EndpointStats {
    /// Messages forwarded from sessions to the inbound queue.
    pub received: Counter,
    /// Messages handed to the handler.
    pub dispatched: Counter,
    /// Keep-alives not queued because the outgoing queue was full.
    pub keepalive_dropped: Counter,
    /// Receive buffers thrown away (overflow or corrupt data).
    pub buffer_discards: Counter,
    /// Hub recovery attempts.
    pub recovery_attempts: Counter,
    /// Live connections.
    pub connections: Gauge,
}

// ── Shared state ──────────────────────────────────────────────────────

/// Channels into the running loops. Present only while started.
#[derive(Clone)]
pub(crate) struct Links {
    pub(crate) incoming: mpsc::Sender<Message>,
    pub(crate) events: mpsc::Sender<ConnEvent>,
    /// Latest connection table published by the guardian.
    pub(crate) routes: watch::Receiver<Routes>,
}

pub(crate) struct Shared {
    pub(crate) identity: Identity,
    pub(crate) config: EndpointConfig,
    pub(crate) status: watch::Sender<EndpointStatus>,
    pub(crate) stats: EndpointStats,
    links: Mutex<Option<Links>>,
    submodules: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    listening: Mutex<Option<(String, u16)>>,
    next_connection: AtomicU64,
}

impl Shared {
    pub(crate) fn new(identity: Identity, config: EndpointConfig) -> Self {
        let (status, _) = watch::channel(EndpointStatus::Stopped);
        Self {
            identity,
            config,
            status,
            stats: EndpointStats::default(),
            links: Mutex::new(None),
            submodules: Mutex::new(HashMap::new()),
            listening: Mutex::new(None),
            next_connection: AtomicU64::new(1),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.identity.name()
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.status.borrow() == EndpointStatus::Running
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    fn links(&self) -> Option<Links> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn running_links(&self) -> Result<Links, FrameworkError> {
        if !self.is_running() {
            return Err(FrameworkError::NotRunning);
        }
        self.links().ok_or(FrameworkError::NotRunning)
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        let Some(links) = self.links() else {
            return Vec::new();
        };
        let mut list: Vec<ConnectionInfo> = links
            .routes
            .borrow()
            .values()
            .map(|route| route.info.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    fn set_links(&self, links: Option<Links>) {
        *self.links.lock().unwrap_or_else(PoisonError::into_inner) = links;
    }

    fn submodule(&self, name: &str) -> Option<mpsc::Sender<Message>> {
        self.submodules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn set_status(&self, status: EndpointStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!("endpoint: {} {previous:?} -> {status:?}", self.name());
        }
    }
}

// ── Sending ───────────────────────────────────────────────────────────

/// Something messages can be handed to.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    /// Route `msg` to `target`: this service, a registered submodule, or
    /// a connected remote service.
    async fn send_message(&self, msg: Message, target: &str) -> Result<(), FrameworkError>;

    /// Queue `msg` for this service's own handler.
    async fn send_to_self(&self, msg: Message) -> Result<(), FrameworkError>;
}

/// Cheap, cloneable handle to an endpoint, for handlers and executors.
#[derive(Clone)]
pub struct EndpointHandle {
    shared: Arc<Shared>,
}

impl EndpointHandle {
    /// Name of the owning endpoint.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn service_type(&self) -> ServiceType {
        self.shared.identity.service_type()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> EndpointStatus {
        *self.shared.status.borrow()
    }

    /// Services currently connected, sorted by name.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.connections()
    }

    /// Bind a local name to a queue; messages sent to that name land
    /// there instead of going over the network.
    pub fn register_submodule(
        &self,
        name: &str,
        sender: mpsc::Sender<Message>,
    ) -> Result<(), FrameworkError> {
        let mut submodules = self
            .shared
            .submodules
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if submodules.contains_key(name) {
            return Err(FrameworkError::DuplicateSubmodule(name.to_string()));
        }
        submodules.insert(name.to_string(), sender);
        tracing::debug!("endpoint: submodule '{name}' registered");
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageSender for EndpointHandle {
    async fn send_message(&self, msg: Message, target: &str) -> Result<(), FrameworkError> {
        let links = self.shared.running_links()?;
        if target == self.shared.name() {
            return self.send_to_self(msg).await;
        }
        if let Some(submodule) = self.shared.submodule(target) {
            return submodule
                .send(msg)
                .await
                .map_err(|_| FrameworkError::QueueClosed(target.to_string()));
        }

        let outgoing = links
            .routes
            .borrow()
            .get(target)
            .map(|route| route.outgoing.clone())
            .ok_or_else(|| FrameworkError::UnknownTarget(target.to_string()))?;
        outgoing
            .send(msg)
            .await
            .map_err(|_| FrameworkError::QueueClosed(target.to_string()))
    }

    async fn send_to_self(&self, mut msg: Message) -> Result<(), FrameworkError> {
        let links = self.shared.running_links()?;
        if msg.sender().is_empty() {
            msg.set_sender(self.shared.name());
        }
        links
            .incoming
            .send(msg)
            .await
            .map_err(|_| FrameworkError::QueueClosed(self.shared.name().to_string()))
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────

/// Everything started by `start()` and torn down by `stop()`.
struct Running {
    handler: Arc<dyn ServiceHandler>,
    listener: SharedListener,
    guardian_stop: Option<oneshot::Sender<()>>,
    guardian: JoinHandle<()>,
    accept: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.accept.abort();
        self.dispatch.abort();
    }
}

/// One service's presence in the cluster.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use corelink_framework::{Endpoint, EndpointConfig, Identity, ServiceType};
/// use corelink_transport::{MemoryDirectory, TcpTransport};
///
/// # async fn example(handler: Arc<dyn corelink_framework::ServiceHandler>) -> anyhow::Result<()> {
/// let identity = Identity::generate(ServiceType::Core, None)?;
/// let endpoint = Endpoint::new(
///     identity,
///     EndpointConfig::default(),
///     Arc::new(TcpTransport::default()),
///     Arc::new(MemoryDirectory::new("lab")),
/// );
/// endpoint.start(handler).await?;
/// endpoint.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Endpoint {
    shared: Arc<Shared>,
    transport: Arc<dyn SessionTransport>,
    directory: Arc<dyn GroupDirectory>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Endpoint {
    /// Create a stopped endpoint. Nothing touches the network until
    /// [`start`](Self::start).
    pub fn new(
        identity: Identity,
        config: EndpointConfig,
        transport: Arc<dyn SessionTransport>,
        directory: Arc<dyn GroupDirectory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(identity, config)),
            transport,
            directory,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// A handle for handlers and executors to send through.
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            shared: self.shared.clone(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Unique service name within the domain.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn service_type(&self) -> ServiceType {
        self.shared.identity.service_type()
    }

    /// Hub for the `Core` type, peer otherwise.
    pub fn role(&self) -> Role {
        if self.service_type().is_hub() {
            Role::Hub
        } else {
            Role::Peer
        }
    }

    /// Cluster domain this endpoint announces and queries in.
    pub fn domain(&self) -> &str {
        self.shared.identity.domain_name()
    }

    /// Discovery group address and port.
    pub fn group_address(&self) -> &str {
        self.shared.identity.group_address()
    }

    pub fn group_port(&self) -> u16 {
        self.shared.identity.group_port()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> EndpointStatus {
        *self.shared.status.borrow()
    }

    /// Address the listener is bound to while running.
    pub fn listen_address(&self) -> Option<String> {
        self.listening().map(|(address, _)| address)
    }

    /// Bound listen port, `None` when stopped.
    pub fn listen_port(&self) -> Option<u16> {
        self.listening().map(|(_, port)| port)
    }

    /// Live counters.
    pub fn stats(&self) -> &EndpointStats {
        &self.shared.stats
    }

    /// See [`EndpointHandle::register_submodule`].
    pub fn register_submodule(
        &self,
        name: &str,
        sender: mpsc::Sender<Message>,
    ) -> Result<(), FrameworkError> {
        self.handle().register_submodule(name, sender)
    }

    /// Snapshot of the connection table, sorted by name. Empty unless
    /// running.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.connections()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        let Some(links) = self.shared.links() else {
            return 0;
        };
        let count = links.routes.borrow().len();
        count
    }

    fn listening(&self) -> Option<(String, u16)> {
        self.shared
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Bring the endpoint up with `handler` receiving its callbacks.
    pub async fn start(&self, handler: Arc<dyn ServiceHandler>) -> Result<(), FrameworkError> {
        let mut running = self.running.lock().await;
        if self.status() != EndpointStatus::Stopped || running.is_some() {
            return Err(FrameworkError::NotStopped);
        }
        handler
            .initial_endpoint()
            .await
            .map_err(FrameworkError::Handler)?;

        let state = match self.role() {
            Role::Hub => self.start_hub(handler.clone()).await?,
            Role::Peer => self.start_peer(handler.clone()).await?,
        };
        *running = Some(state);

        if let Err(e) = handler.on_endpoint_started().await {
            tracing::warn!("endpoint: {} start hook failed: {e}", self.name());
            if let Some(state) = running.take() {
                self.teardown(state).await;
            }
            return Err(FrameworkError::Handler(e));
        }
        tracing::info!(
            "endpoint: {} started as {:?} on {}:{}",
            self.name(),
            self.role(),
            self.listen_address().unwrap_or_default(),
            self.listen_port().unwrap_or_default()
        );
        Ok(())
    }

    async fn start_hub(&self, handler: Arc<dyn ServiceHandler>) -> Result<Running, FrameworkError> {
        let address = self.shared.identity.configured_listen_address().to_string();
        let (listener, port) = self.transport.listen(&address).await?;

        let record = ServiceRecord::new(HUB_KIND, self.transport.protocol(), &address, port);
        let published = async {
            self.directory.announce(record).await?;
            self.directory.start().await
        }
        .await;
        if let Err(e) = published {
            let _ = listener.close().await;
            let _ = self.directory.stop().await;
            return Err(e.into());
        }
        tracing::debug!("endpoint: published hub {address}:{port}");

        Ok(self.spawn_routines(handler, listener, address, port))
    }

    async fn start_peer(&self, handler: Arc<dyn ServiceHandler>) -> Result<Running, FrameworkError> {
        let candidates = match self.directory.query(self.shared.config.query_timeout).await {
            Ok(candidates) => candidates,
            Err(TransportError::QueryTimeout(timeout)) => {
                tracing::warn!("endpoint: no hub answered within {timeout:?}");
                return Err(FrameworkError::NoHubAvailable);
            }
            Err(e) => return Err(e.into()),
        };
        let hub = candidates
            .into_iter()
            .find(|c| c.kind == HUB_KIND)
            .ok_or(FrameworkError::NoHubAvailable)?;
        tracing::debug!(
            "endpoint: hub candidate {}:{} via local {}",
            hub.address,
            hub.port,
            hub.local_address
        );

        let (listener, port) = self.transport.listen(&hub.local_address).await?;
        let state = self.spawn_routines(handler, listener, hub.local_address.clone(), port);

        let connector = self.connector()?;
        if let Err(e) = connector.connect(&hub.address, hub.port).await {
            tracing::warn!(
                "endpoint: connect to hub {}:{} failed: {e}",
                hub.address,
                hub.port
            );
            self.teardown(state).await;
            return Err(e);
        }
        Ok(state)
    }

    fn connector(&self) -> Result<Arc<Connector>, FrameworkError> {
        let links = self.shared.links().ok_or(FrameworkError::NotRunning)?;
        Ok(Arc::new(Connector::new(
            self.shared.clone(),
            self.transport.clone(),
            links,
        )))
    }

    /// Create the shared channels, mark the endpoint running and spawn
    /// the accept, guardian and dispatch loops.
    fn spawn_routines(
        &self,
        handler: Arc<dyn ServiceHandler>,
        listener: SharedListener,
        address: String,
        port: u16,
    ) -> Running {
        let capacity = self.shared.config.queue_capacity;
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (routes_tx, routes_rx) = watch::channel(Routes::default());
        let links = Links {
            incoming: incoming_tx,
            events: events_tx,
            routes: routes_rx,
        };
        self.shared.set_links(Some(links.clone()));
        *self
            .shared
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((address, port));
        self.shared.set_status(EndpointStatus::Running);

        let connector = Arc::new(Connector::new(
            self.shared.clone(),
            self.transport.clone(),
            links.clone(),
        ));

        let (guardian_stop, stop_rx) = oneshot::channel();
        let guardian = Guardian::new(
            self.shared.clone(),
            links.incoming.clone(),
            routes_tx,
            connector.clone(),
            self.directory.clone(),
            self.role() == Role::Peer,
        );
        let guardian = tokio::spawn(guardian.run(events_rx, stop_rx));
        let accept = tokio::spawn(connection::accept_loop(listener.clone(), connector));
        let dispatch = tokio::spawn(dispatch_loop(
            self.shared.clone(),
            handler.clone(),
            incoming_rx,
        ));

        Running {
            handler,
            listener,
            guardian_stop: Some(guardian_stop),
            guardian,
            accept,
            dispatch,
        }
    }

    /// Stop a running endpoint, disconnecting every remote service.
    pub async fn stop(&self) -> Result<(), FrameworkError> {
        let mut running = self.running.lock().await;
        if self.status() != EndpointStatus::Running {
            return Err(FrameworkError::NotRunning);
        }
        let state = running.take().ok_or(FrameworkError::NotRunning)?;
        self.shared.set_status(EndpointStatus::Stopping);
        state.handler.on_endpoint_stopped().await;
        self.teardown(state).await;
        tracing::info!("endpoint: {} stopped", self.name());
        Ok(())
    }

    async fn teardown(&self, mut state: Running) {
        self.shared.set_status(EndpointStatus::Stopping);

        if let Err(e) = state.listener.close().await {
            tracing::debug!("endpoint: close listener: {e}");
        }
        let _ = (&mut state.accept).await;

        if let Some(stop) = state.guardian_stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut state.guardian).await {
            tracing::warn!("endpoint: guardian ended abnormally: {e}");
        }

        if let Err(e) = self.directory.stop().await {
            tracing::warn!("endpoint: directory stop failed: {e}");
        }
        let _ = (&mut state.dispatch).await;

        self.shared.set_links(None);
        *self
            .shared
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.set_status(EndpointStatus::Stopped);
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────

async fn dispatch_loop(
    shared: Arc<Shared>,
    handler: Arc<dyn ServiceHandler>,
    mut incoming: mpsc::Receiver<Message>,
) {
    let mut status = shared.status.subscribe();
    loop {
        tokio::select! {
            msg = incoming.recv() => match msg {
                Some(msg) => {
                    shared.stats.dispatched.inc();
                    dispatch(&shared, handler.as_ref(), msg).await;
                }
                None => break,
            },
            _ = async {
                let _ = status.wait_for(|s| *s != EndpointStatus::Running).await;
            } => break,
        }
    }
    tracing::debug!("endpoint: {} dispatch loop exited", shared.name());
}

async fn dispatch(shared: &Shared, handler: &dyn ServiceHandler, msg: Message) {
    let id = msg.id();
    if id == ids::SERVICE_CONNECTED {
        match unpack_service(&msg) {
            Ok((name, service_type)) => {
                let address = msg.get_string(ids::PARAM_KEY_ADDRESS).unwrap_or_default();
                handler
                    .on_service_connected(name, service_type, address)
                    .await;
            }
            Err(e) => tracing::warn!("endpoint: bad service connected event: {e}"),
        }
    } else if id == ids::SERVICE_DISCONNECTED {
        match unpack_service(&msg) {
            Ok((name, service_type)) => {
                let gracefully = msg.get_bool(ids::PARAM_KEY_FLAG).unwrap_or(false);
                handler
                    .on_service_disconnected(name, service_type, gracefully)
                    .await;
            }
            Err(e) => tracing::warn!("endpoint: bad service disconnected event: {e}"),
        }
    } else if id == ids::SERVICE_READY {
        handler.on_dependency_ready().await;
    } else if id == ids::SERVICE_AVAILABLE {
        tracing::info!(
            "endpoint: {} service available from '{}'",
            shared.name(),
            msg.sender()
        );
    } else {
        handler.on_message_received(msg).await;
    }
}

fn unpack_service(msg: &Message) -> Result<(&str, ServiceType), FrameworkError> {
    let name = msg.get_string(ids::PARAM_KEY_NAME)?;
    let service_type = ServiceType::from_u64(msg.get_uint(ids::PARAM_KEY_TYPE)?)?;
    Ok((name, service_type))
}
