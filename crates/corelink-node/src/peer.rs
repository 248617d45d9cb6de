use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use corelink_framework::{
    EndpointHandle, Message, MessageSender, RoutineController, ServiceHandler, ServiceType,
};

use crate::echo::{self, ECHO_RESPONSE};
use crate::events::{emit, EventEcho, EventService};

/// State shared by the peer handler and its echo routine.
#[derive(Default)]
pub struct PeerState {
    hub: Mutex<Option<String>>,
    in_flight: Mutex<HashMap<u32, Instant>>,
    pub sent: AtomicU64,
    pub answered: AtomicU64,
}

impl PeerState {
    fn hub(&self) -> Option<String> {
        self.hub
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_hub(&self, hub: Option<String>) {
        *self.hub.lock().unwrap_or_else(PoisonError::into_inner) = hub;
    }
}

pub struct PeerHandler {
    state: Arc<PeerState>,
    start: Instant,
}

impl PeerHandler {
    pub fn new(state: Arc<PeerState>, start: Instant) -> Self {
        Self { state, start }
    }
}

#[async_trait::async_trait]
impl ServiceHandler for PeerHandler {
    async fn on_message_received(&self, msg: Message) {
        if msg.id() != ECHO_RESPONSE {
            tracing::debug!("peer: ignoring {} from {}", msg.id(), msg.sender());
            return;
        }
        let seq = msg.transaction();
        let sent_at = self
            .state
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq);
        let Some(sent_at) = sent_at else {
            tracing::warn!("peer: unexpected echo #{seq}");
            return;
        };
        if !msg.success() {
            tracing::warn!("peer: echo #{seq} failed: {}", msg.error());
            return;
        }
        self.state.answered.fetch_add(1, Ordering::Relaxed);
        emit(&EventEcho {
            event: "echo",
            seq,
            hub: msg.sender().to_string(),
            session: msg.from_session(),
            rtt_ms: sent_at.elapsed().as_secs_f64() * 1000.0,
        });
    }

    async fn on_service_connected(&self, name: &str, service_type: ServiceType, address: &str) {
        if service_type.is_hub() {
            self.state.set_hub(Some(name.to_string()));
        }
        emit(&EventService {
            event: "connected",
            name: name.to_string(),
            service_type: service_type.to_string(),
            detail: address.to_string(),
            elapsed_s: self.start.elapsed().as_secs_f64(),
        });
    }

    async fn on_service_disconnected(&self, name: &str, service_type: ServiceType, gracefully: bool) {
        if service_type.is_hub() {
            self.state.set_hub(None);
            eprintln!("Hub {name} gone, waiting for it to come back...");
        }
        emit(&EventService {
            event: "disconnected",
            name: name.to_string(),
            service_type: service_type.to_string(),
            detail: if gracefully { "graceful" } else { "silent" }.to_string(),
            elapsed_s: self.start.elapsed().as_secs_f64(),
        });
    }
}

/// Periodic echo requests to whichever hub is currently connected.
pub async fn echo_routine(
    mut controller: RoutineController,
    endpoint: EndpointHandle,
    state: Arc<PeerState>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // Skip the immediate first tick

    let mut seq: u32 = 0;
    loop {
        tokio::select! {
            _ = controller.notified() => break,
            _ = tick.tick() => {}
        }
        let Some(hub) = state.hub() else {
            continue;
        };
        seq = seq.wrapping_add(1);
        state
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, Instant::now());
        let request = echo::request(seq, &format!("hello #{seq} from {}", endpoint.name()));
        match endpoint.send_message(request, &hub).await {
            Ok(()) => {
                state.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                state
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&seq);
                tracing::warn!("peer: echo #{seq} to {hub} not sent: {e}");
            }
        }
    }
    tracing::debug!("peer: echo routine exited after {seq} requests");
}
