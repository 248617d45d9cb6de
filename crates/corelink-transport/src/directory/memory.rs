use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::{Candidate, GroupDirectory, ServiceRecord};
use crate::TransportError;

/// How often a waiting query re-checks the registry.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type Registry = Arc<Mutex<HashMap<String, Vec<ServiceRecord>>>>;

/// In-process directory: every client created from the same registry
/// and sharing a domain sees the others' published records.
///
/// ```rust
/// use corelink_transport::MemoryDirectory;
///
/// let hub_side = MemoryDirectory::new("lab");
/// let peer_side = hub_side.join("lab");
/// let other_cluster = hub_side.join("prod");
/// # let _ = (peer_side, other_cluster);
/// ```
pub struct MemoryDirectory {
    registry: Registry,
    domain: String,
    local_address: String,
    announced: Mutex<Vec<ServiceRecord>>,
}

impl MemoryDirectory {
    /// Create a client on a fresh registry.
    pub fn new(domain: &str) -> Self {
        Self::with_registry(Registry::default(), domain)
    }

    /// Create another client on the same registry.
    pub fn join(&self, domain: &str) -> Self {
        Self::with_registry(self.registry.clone(), domain)
    }

    /// Address reported as `Candidate::local_address` (default `127.0.0.1`).
    pub fn local_address(mut self, address: &str) -> Self {
        self.local_address = address.to_string();
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn with_registry(registry: Registry, domain: &str) -> Self {
        Self {
            registry,
            domain: domain.to_string(),
            local_address: "127.0.0.1".to_string(),
            announced: Mutex::new(Vec::new()),
        }
    }

    fn published(&self) -> Vec<ServiceRecord> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.get(&self.domain).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl GroupDirectory for MemoryDirectory {
    async fn announce(&self, record: ServiceRecord) -> Result<(), TransportError> {
        self.announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    async fn start(&self) -> Result<(), TransportError> {
        let announced = self
            .announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let records = registry.entry(self.domain.clone()).or_default();
        for record in announced {
            if !records.contains(&record) {
                tracing::debug!(
                    "directory: publish {} {}:{} in '{}'",
                    record.kind,
                    record.address,
                    record.port,
                    self.domain
                );
                records.push(record);
            }
        }
        Ok(())
    }

    async fn query(&self, timeout: Duration) -> Result<Vec<Candidate>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let records = self.published();
            if !records.is_empty() {
                return Ok(records
                    .iter()
                    .map(|r| Candidate::from_record(r, &self.local_address))
                    .collect());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::QueryTimeout(timeout));
            }
            tokio::time::sleep_until((Instant::now() + POLL_INTERVAL).min(deadline)).await;
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let announced = std::mem::take(
            &mut *self.announced.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(records) = registry.get_mut(&self.domain) {
            records.retain(|r| !announced.contains(r));
            if records.is_empty() {
                registry.remove(&self.domain);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_record(port: u16) -> ServiceRecord {
        ServiceRecord::new("core", "tcp", "127.0.0.1", port)
    }

    #[tokio::test]
    async fn announce_is_invisible_until_started() {
        let hub = MemoryDirectory::new("lab");
        let peer = hub.join("lab");

        hub.announce(hub_record(5600)).await.unwrap();
        assert!(peer.query(Duration::from_millis(60)).await.is_err());

        hub.start().await.unwrap();
        let candidates = peer.query(Duration::from_millis(60)).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, "core");
        assert_eq!(candidates[0].port, 5600);
        assert_eq!(candidates[0].local_address, "127.0.0.1");
    }

    #[tokio::test]
    async fn domains_are_isolated() {
        let hub = MemoryDirectory::new("lab");
        let stranger = hub.join("prod");
        hub.announce(hub_record(5601)).await.unwrap();
        hub.start().await.unwrap();

        let result = stranger.query(Duration::from_millis(60)).await;
        assert!(matches!(result, Err(TransportError::QueryTimeout(_))));
    }

    #[tokio::test]
    async fn stop_withdraws_records() {
        let hub = MemoryDirectory::new("lab");
        let peer = hub.join("lab");
        hub.announce(hub_record(5602)).await.unwrap();
        hub.start().await.unwrap();
        hub.stop().await.unwrap();

        assert!(peer.query(Duration::from_millis(60)).await.is_err());
    }

    #[tokio::test]
    async fn query_waits_for_late_publisher() {
        let hub = MemoryDirectory::new("lab");
        let peer = hub.join("lab");
        hub.announce(hub_record(5603)).await.unwrap();

        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            hub.start().await.unwrap();
            hub
        });

        let candidates = peer.query(Duration::from_secs(2)).await.unwrap();
        assert_eq!(candidates[0].port, 5603);
        publisher.await.unwrap();
    }
}
