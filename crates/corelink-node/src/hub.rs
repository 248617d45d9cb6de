use std::sync::Arc;
use std::time::Instant;

use corelink_framework::{Message, ServiceHandler, ServiceType, TransactionEngine};

use crate::events::{emit, EventService};

/// Hub side: every application message is work for the transaction
/// engine, either a new request or a follow-up for a live session.
pub struct HubHandler {
    engine: Arc<TransactionEngine>,
    start: Instant,
}

impl HubHandler {
    pub fn new(engine: Arc<TransactionEngine>, start: Instant) -> Self {
        Self { engine, start }
    }
}

#[async_trait::async_trait]
impl ServiceHandler for HubHandler {
    async fn on_message_received(&self, msg: Message) {
        let id = msg.id();
        let sender = msg.sender().to_string();
        let result = if msg.to_session() != 0 {
            self.engine.push_message(msg).await
        } else {
            self.engine.invoke_task(msg).await
        };
        if let Err(e) = result {
            tracing::warn!("hub: {id} from {sender} not handled: {e}");
        }
    }

    async fn on_service_connected(&self, name: &str, service_type: ServiceType, address: &str) {
        emit(&EventService {
            event: "connected",
            name: name.to_string(),
            service_type: service_type.to_string(),
            detail: address.to_string(),
            elapsed_s: self.start.elapsed().as_secs_f64(),
        });
    }

    async fn on_service_disconnected(&self, name: &str, service_type: ServiceType, gracefully: bool) {
        emit(&EventService {
            event: "disconnected",
            name: name.to_string(),
            service_type: service_type.to_string(),
            detail: if gracefully { "graceful" } else { "silent" }.to_string(),
            elapsed_s: self.start.elapsed().as_secs_f64(),
        });
    }

    async fn initial_endpoint(&self) -> anyhow::Result<()> {
        self.engine.start()?;
        Ok(())
    }

    async fn on_endpoint_stopped(&self) {
        if let Err(e) = self.engine.stop().await {
            tracing::debug!("hub: engine stop: {e}");
        }
    }
}
