use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Candidate, GroupDirectory, ServiceRecord};
use crate::TransportError;

/// Default group address for service discovery.
pub const DEFAULT_GROUP_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 226);

/// Default group port for service discovery.
pub const DEFAULT_GROUP_PORT: u16 = 5599;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Where a [`UdpDirectory`] meets its group.
///
/// ```rust
/// use std::net::Ipv4Addr;
/// use corelink_transport::DirectoryConfig;
///
/// let config = DirectoryConfig::new("lab")
///     .group(Ipv4Addr::LOCALHOST, 25599);
/// assert_eq!(config.domain(), "lab");
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub(crate) group_address: Ipv4Addr,
    pub(crate) group_port: u16,
    pub(crate) domain: String,
    /// Interface used to join the multicast group.
    pub(crate) interface: Ipv4Addr,
}

impl DirectoryConfig {
    pub fn new(domain: &str) -> Self {
        Self {
            group_address: DEFAULT_GROUP_ADDRESS,
            group_port: DEFAULT_GROUP_PORT,
            domain: domain.to_string(),
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Set the group address and port. A non-multicast address makes the
    /// responder bind that address directly, which is handy on loopback.
    pub fn group(mut self, address: Ipv4Addr, port: u16) -> Self {
        self.group_address = address;
        self.group_port = port;
        self
    }

    pub fn interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.group_address), self.group_port)
    }
}

/// Wire form of directory datagrams (JSON, tagged by `op`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Datagram {
    Query {
        domain: String,
        nonce: u64,
    },
    Echo {
        domain: String,
        nonce: u64,
        services: Vec<ServiceRecord>,
    },
}

/// Directory over UDP group datagrams.
///
/// The hub side runs a responder task that answers `query` datagrams for
/// its domain with the announced records; the peer side sends a query to
/// the group and takes the first non-empty echo.
pub struct UdpDirectory {
    config: DirectoryConfig,
    announced: Mutex<Vec<ServiceRecord>>,
    responder: Mutex<Option<JoinHandle<()>>>,
}

impl UdpDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            announced: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    async fn bind_responder(&self) -> Result<UdpSocket, TransportError> {
        let group = self.config.group_address;
        let port = self.config.group_port;
        let bind_addr = if group.is_multicast() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        } else {
            SocketAddr::new(IpAddr::V4(group), port)
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                address: bind_addr.to_string(),
                source,
            })?;
        if group.is_multicast() {
            socket.join_multicast_v4(group, self.config.interface)?;
        }
        Ok(socket)
    }
}

#[async_trait::async_trait]
impl GroupDirectory for UdpDirectory {
    async fn announce(&self, record: ServiceRecord) -> Result<(), TransportError> {
        self.announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    async fn start(&self) -> Result<(), TransportError> {
        let socket = self.bind_responder().await?;
        let records = self
            .announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let domain = self.config.domain.clone();
        tracing::debug!(
            "directory: answering for '{domain}' on {} ({} records)",
            self.config.group_addr(),
            records.len()
        );
        let task = tokio::spawn(respond(socket, domain, records));
        let previous = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn query(&self, timeout: Duration) -> Result<Vec<Candidate>, TransportError> {
        let socket = UdpSocket::bind((self.config.interface, 0)).await?;
        if self.config.group_address.is_multicast() {
            socket.set_multicast_loop_v4(true)?;
        }
        let nonce: u64 = rand::random();
        let query = Datagram::Query {
            domain: self.config.domain.clone(),
            nonce,
        };
        socket
            .send_to(&serde_json::to_vec(&query)?, self.config.group_addr())
            .await?;

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (n, from) = match received {
                Ok(result) => result?,
                Err(_) => return Err(TransportError::QueryTimeout(timeout)),
            };
            let services = match serde_json::from_slice::<Datagram>(&buf[..n]) {
                Ok(Datagram::Echo {
                    domain,
                    nonce: echoed,
                    services,
                }) if echoed == nonce && domain == self.config.domain && !services.is_empty() => {
                    services
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::trace!("directory: ignoring datagram from {from}: {e}");
                    continue;
                }
            };
            let local = local_address_towards(from).await?;
            return Ok(services
                .iter()
                .map(|r| Candidate::from_record(r, &local))
                .collect());
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let task = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            tracing::debug!("directory: stopped answering for '{}'", self.config.domain);
        }
        Ok(())
    }
}

impl Drop for UdpDirectory {
    fn drop(&mut self) {
        if let Some(task) = self
            .responder
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn respond(socket: UdpSocket, domain: String, records: Vec<ServiceRecord>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("directory: receive failed: {e}");
                continue;
            }
        };
        let nonce = match serde_json::from_slice::<Datagram>(&buf[..n]) {
            Ok(Datagram::Query { domain: asked, nonce }) if asked == domain => nonce,
            Ok(_) => continue,
            Err(e) => {
                tracing::trace!("directory: ignoring datagram from {from}: {e}");
                continue;
            }
        };
        let echo = Datagram::Echo {
            domain: domain.clone(),
            nonce,
            services: records.clone(),
        };
        let payload = match serde_json::to_vec(&echo) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("directory: encode echo failed: {e}");
                continue;
            }
        };
        if let Err(e) = socket.send_to(&payload, from).await {
            tracing::debug!("directory: echo to {from} failed: {e}");
        }
    }
}

/// The local address the OS routes through to reach `remote`.
async fn local_address_towards(remote: SocketAddr) -> Result<String, TransportError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(remote).await?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_is_tagged_by_op() {
        let query = Datagram::Query {
            domain: "lab".into(),
            nonce: 7,
        };
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["op"], "query");
        assert_eq!(json["domain"], "lab");

        let echo: Datagram = serde_json::from_str(
            r#"{"op":"echo","domain":"lab","nonce":7,"services":[
                {"kind":"core","protocol":"tcp","address":"10.0.0.2","port":5600}]}"#,
        )
        .unwrap();
        match echo {
            Datagram::Echo { services, .. } => assert_eq!(services[0].port, 5600),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn default_group() {
        let config = DirectoryConfig::new("lab");
        assert_eq!(config.group_addr().to_string(), "224.0.0.226:5599");
    }
}
