use crate::ids::ServiceType;
use crate::Message;

/// Callbacks an [`Endpoint`](super::Endpoint) drives.
///
/// The endpoint never looks at the concrete handler; everything it knows
/// about the application goes through this trait. Callbacks run on the
/// dispatch task one at a time, so a slow callback delays the next one.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Any non-system message addressed to this service.
    async fn on_message_received(&self, msg: Message);

    async fn on_service_connected(&self, name: &str, service_type: ServiceType, address: &str);

    /// `gracefully` is false when the service went silent or its session
    /// failed, true when it said goodbye.
    async fn on_service_disconnected(&self, name: &str, service_type: ServiceType, gracefully: bool);

    async fn on_dependency_ready(&self) {}

    /// Runs first thing in `start()`. An error aborts the start.
    async fn initial_endpoint(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once the endpoint is up. An error tears it down again.
    async fn on_endpoint_started(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_endpoint_stopped(&self) {}
}
