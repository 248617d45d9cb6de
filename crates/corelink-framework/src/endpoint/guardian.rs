//! The guardian loop: sole owner of the connection table.
//!
//! Connection flows report opens, closes and heartbeats. Every change to
//! the table is published as a read-only [`Routes`] snapshot, so senders
//! never wait on this loop. Two tickers drive keep-alives and the health
//! check that walks silent entries from `Connected` to `Lost` to
//! `Disconnected`.
use std::collections::HashMap;
use std::sync::Arc;

use corelink_transport::{GroupDirectory, SharedSession};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::Connector;
use super::{recovery, Shared};
use crate::ids::{self, ServiceType};
use crate::Message;

/// Liveness of a connection entry. Only moves forward, except that a
/// heartbeat brings a `Lost` entry back to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Lost,
    Disconnected,
}

/// Public view of one connection entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub name: String,
    pub service_type: ServiceType,
    pub address: String,
    pub status: ConnectionStatus,
}

/// Where messages for one connected service go, as last published.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) info: ConnectionInfo,
    pub(crate) outgoing: mpsc::Sender<Message>,
}

pub(crate) type Routes = Arc<HashMap<String, Route>>;

/// Everything the guardian is told.
pub(crate) enum ConnEvent {
    Open {
        conn: u64,
        name: String,
        service_type: ServiceType,
        address: String,
        session: SharedSession,
        outgoing: mpsc::Sender<Message>,
        finished: oneshot::Receiver<()>,
        reply: oneshot::Sender<bool>,
    },
    Close {
        conn: u64,
        name: String,
        gracefully: bool,
    },
    Heartbeat {
        conn: u64,
        name: String,
    },
}

struct Entry {
    conn: u64,
    service_type: ServiceType,
    address: String,
    status: ConnectionStatus,
    last_heartbeat: Instant,
    session: SharedSession,
    outgoing: mpsc::Sender<Message>,
    finished: Option<oneshot::Receiver<()>>,
}

pub(crate) struct Guardian {
    shared: Arc<Shared>,
    connections: HashMap<String, Entry>,
    incoming: mpsc::Sender<Message>,
    routes: watch::Sender<Routes>,
    hub_reachable: watch::Sender<bool>,
    connector: Arc<Connector>,
    directory: Arc<dyn GroupDirectory>,
    is_peer: bool,
    recovery: Option<JoinHandle<()>>,
}

impl Guardian {
    pub(crate) fn new(
        shared: Arc<Shared>,
        incoming: mpsc::Sender<Message>,
        routes: watch::Sender<Routes>,
        connector: Arc<Connector>,
        directory: Arc<dyn GroupDirectory>,
        is_peer: bool,
    ) -> Self {
        let (hub_reachable, _) = watch::channel(false);
        Self {
            shared,
            connections: HashMap::new(),
            incoming,
            routes,
            hub_reachable,
            connector,
            directory,
            is_peer,
            recovery: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<ConnEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let config = self.shared.config.clone();
        let mut keepalive = tokio::time::interval(config.keepalive_interval);
        let mut check = tokio::time::interval(config.check_interval);

        // Skip the immediate first tick
        keepalive.tick().await;
        check.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = keepalive.tick() => self.send_keepalives(),
                _ = check.tick() => self.check_health().await,
            }
        }

        if let Some(recovery) = self.recovery.take() {
            recovery.abort();
        }
        self.disconnect_all().await;
        tracing::debug!("guardian: {} exited", self.shared.name());
    }

    async fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Open {
                conn,
                name,
                service_type,
                address,
                session,
                outgoing,
                finished,
                reply,
            } => {
                if self.connections.contains_key(&name) {
                    tracing::warn!("guardian: '{name}' already connected, rejecting new session");
                    let _ = reply.send(false);
                    return;
                }
                if reply.send(true).is_err() {
                    // The connecting side gave up; its session is gone.
                    return;
                }
                tracing::info!("guardian: '{name}' ({service_type}) connected from {address}");
                self.connections.insert(
                    name.clone(),
                    Entry {
                        conn,
                        service_type,
                        address: address.clone(),
                        status: ConnectionStatus::Connected,
                        last_heartbeat: Instant::now(),
                        session,
                        outgoing,
                        finished: Some(finished),
                    },
                );
                self.shared.stats.connections.inc();
                self.publish();
                if service_type.is_hub() {
                    self.hub_reachable.send_replace(true);
                }
                let mut event = Message::new(ids::SERVICE_CONNECTED);
                event.set_string(ids::PARAM_KEY_NAME, name.as_str());
                event.set_uint(ids::PARAM_KEY_TYPE, service_type.as_u64());
                event.set_string(ids::PARAM_KEY_ADDRESS, address);
                self.notify(event).await;
            }
            ConnEvent::Close {
                conn,
                name,
                gracefully,
            } => {
                let current = self.connections.get(&name).map(|e| e.conn);
                if current != Some(conn) {
                    tracing::debug!("guardian: stale close for '{name}' ignored");
                    return;
                }
                if let Some(entry) = self.connections.remove(&name) {
                    tracing::info!("guardian: '{name}' disconnected (gracefully: {gracefully})");
                    self.shared.stats.connections.dec();
                    self.publish();
                    self.lost_service(&name, entry.service_type, gracefully).await;
                }
            }
            ConnEvent::Heartbeat { conn, name } => {
                if let Some(entry) = self.connections.get_mut(&name) {
                    if entry.conn != conn {
                        return;
                    }
                    entry.last_heartbeat = Instant::now();
                    if entry.status == ConnectionStatus::Lost {
                        tracing::info!("guardian: '{name}' is back");
                        entry.status = ConnectionStatus::Connected;
                        self.publish();
                    }
                }
            }
        }
    }

    /// Replace the route snapshot with the current table.
    fn publish(&self) {
        let routes: HashMap<String, Route> = self
            .connections
            .iter()
            .map(|(name, e)| {
                let route = Route {
                    info: ConnectionInfo {
                        name: name.clone(),
                        service_type: e.service_type,
                        address: e.address.clone(),
                        status: e.status,
                    },
                    outgoing: e.outgoing.clone(),
                };
                (name.clone(), route)
            })
            .collect();
        self.routes.send_replace(Arc::new(routes));
    }

    fn send_keepalives(&self) {
        for (name, entry) in &self.connections {
            if entry.status != ConnectionStatus::Connected {
                continue;
            }
            if entry
                .outgoing
                .try_send(Message::new(ids::CONNECTION_KEEP_ALIVE))
                .is_err()
            {
                self.shared.stats.keepalive_dropped.inc();
                tracing::debug!("guardian: keep-alive to '{name}' dropped");
            }
        }
    }

    async fn check_health(&mut self) {
        let config = &self.shared.config;
        let now = Instant::now();
        let mut changed = false;
        let mut dead = Vec::new();
        for (name, entry) in self.connections.iter_mut() {
            let silent = now.saturating_duration_since(entry.last_heartbeat);
            match entry.status {
                ConnectionStatus::Connected if silent > config.lost_timeout => {
                    tracing::warn!("guardian: '{name}' lost, silent for {silent:?}");
                    entry.status = ConnectionStatus::Lost;
                    changed = true;
                }
                ConnectionStatus::Lost if silent > config.disconnect_timeout => {
                    tracing::warn!("guardian: '{name}' disconnected, silent for {silent:?}");
                    entry.status = ConnectionStatus::Disconnected;
                    dead.push(name.clone());
                }
                _ => {}
            }
        }

        // Dead entries leave the routes before their teardown starts.
        let dead: Vec<(String, Entry)> = dead
            .into_iter()
            .filter_map(|name| self.connections.remove(&name).map(|e| (name, e)))
            .collect();
        if changed || !dead.is_empty() {
            self.publish();
        }

        for (name, entry) in dead {
            self.shared.stats.connections.dec();
            let service_type = entry.service_type;
            self.teardown(&name, entry).await;
            self.lost_service(&name, service_type, false).await;
        }
    }

    /// Say goodbye, close the session and wait (bounded) for its flow.
    async fn teardown(&self, name: &str, mut entry: Entry) {
        let config = &self.shared.config;
        match config
            .wire_format
            .encode(&Message::new(ids::CONNECTION_CLOSED))
        {
            Ok(bytes) => {
                match tokio::time::timeout(config.teardown_timeout, entry.session.write(&bytes))
                    .await
                {
                    Ok(Err(e)) => tracing::debug!("guardian: goodbye to '{name}' failed: {e}"),
                    Err(_) => tracing::debug!("guardian: goodbye to '{name}' timed out"),
                    Ok(Ok(())) => {}
                }
            }
            Err(e) => tracing::warn!("guardian: encode goodbye failed: {e}"),
        }
        if let Err(e) = entry.session.close().await {
            tracing::debug!("guardian: close session to '{name}': {e}");
        }
        if let Some(finished) = entry.finished.take() {
            if tokio::time::timeout(config.teardown_timeout, finished)
                .await
                .is_err()
            {
                tracing::warn!(
                    "guardian: flow for '{name}' did not finish within {:?}",
                    config.teardown_timeout
                );
            }
        }
    }

    async fn disconnect_all(&mut self) {
        let entries: Vec<(String, Entry)> = self.connections.drain().collect();
        self.publish();
        for (name, entry) in entries {
            self.shared.stats.connections.dec();
            self.teardown(&name, entry).await;
        }
        self.hub_reachable.send_replace(false);
    }

    /// Bookkeeping after an entry left the table: hub reachability,
    /// recovery and the local notification.
    async fn lost_service(&mut self, name: &str, service_type: ServiceType, gracefully: bool) {
        if service_type.is_hub() {
            self.hub_reachable.send_replace(false);
            if self.is_peer && self.shared.is_running() {
                self.start_recovery();
            }
        }
        let mut event = Message::new(ids::SERVICE_DISCONNECTED);
        event.set_string(ids::PARAM_KEY_NAME, name);
        event.set_uint(ids::PARAM_KEY_TYPE, service_type.as_u64());
        event.set_bool(ids::PARAM_KEY_FLAG, gracefully);
        self.notify(event).await;
    }

    fn start_recovery(&mut self) {
        if let Some(task) = &self.recovery {
            if !task.is_finished() {
                tracing::info!("guardian: hub recovery already in progress");
                return;
            }
        }
        tracing::info!("guardian: hub lost, starting recovery");
        self.recovery = Some(tokio::spawn(recovery::recover_hub(
            self.shared.clone(),
            self.connector.clone(),
            self.directory.clone(),
            self.hub_reachable.subscribe(),
        )));
    }

    async fn notify(&self, mut event: Message) {
        event.set_sender(self.shared.name());
        if self.incoming.send(event).await.is_err() {
            tracing::debug!("guardian: inbound queue closed, notification dropped");
        }
    }
}
