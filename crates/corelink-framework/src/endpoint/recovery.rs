use std::sync::Arc;

use corelink_transport::GroupDirectory;
use tokio::sync::watch;

use super::connection::Connector;
use super::{EndpointStatus, Shared};
use crate::ids::HUB_KIND;

/// Keep looking for a hub until one is connected or the endpoint stops.
pub(crate) async fn recover_hub(
    shared: Arc<Shared>,
    connector: Arc<Connector>,
    directory: Arc<dyn GroupDirectory>,
    hub_reachable: watch::Receiver<bool>,
) {
    let config = shared.config.clone();
    let mut status = shared.status.subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.recovery_interval) => {}
            _ = async {
                let _ = status.wait_for(|s| *s != EndpointStatus::Running).await;
            } => {
                tracing::debug!("recovery: endpoint stopping, abandoned");
                return;
            }
        }
        if *hub_reachable.borrow() {
            tracing::info!("recovery: hub already reachable");
            return;
        }
        shared.stats.recovery_attempts.inc();

        let candidates = match directory.query(config.query_timeout).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("recovery: directory query failed: {e}");
                continue;
            }
        };
        let Some(hub) = candidates.into_iter().find(|c| c.kind == HUB_KIND) else {
            tracing::warn!("recovery: no hub among candidates");
            continue;
        };
        if !shared.is_running() {
            return;
        }
        match connector.connect(&hub.address, hub.port).await {
            Ok(()) => {
                tracing::info!("recovery: reconnected to hub at {}:{}", hub.address, hub.port);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "recovery: connect to hub {}:{} failed: {e}",
                    hub.address,
                    hub.port
                );
            }
        }
    }
}
