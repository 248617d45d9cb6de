//! corelink transport layer.
//!
//! Two capabilities the framework consumes, each behind a trait:
//!
//! - [`SessionTransport`]: reliable, ordered point-to-point byte streams
//!   ([`Session`]) plus a listener that searches a fixed port range.
//! - [`GroupDirectory`]: a hub announces itself, peers query for it.
//!
//! Concrete implementations ship alongside: [`TcpTransport`],
//! [`MemoryDirectory`] (in-process, domain scoped) and [`UdpDirectory`]
//! (group datagrams, multicast when the group address is multicast).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use corelink_transport::{SessionTransport, TcpTransport, TransportConfig};
//!
//! # async fn example() -> Result<(), corelink_transport::TransportError> {
//! let transport = TcpTransport::new(TransportConfig::new());
//! let (listener, port) = transport.listen("127.0.0.1").await?;
//! println!("listening on port {port}");
//!
//! let session = transport.dial("127.0.0.1", port).await?;
//! session.write(b"hello").await?;
//!
//! let inbound = listener.accept().await?;
//! let mut buf = [0u8; 16];
//! let n = inbound.read(&mut buf).await?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok(())
//! # }
//! ```

mod config;
pub mod directory;
mod error;
mod session;
mod tcp;

pub use config::{parse_port_range, TransportConfig};
pub use directory::{
    Candidate, DirectoryConfig, GroupDirectory, MemoryDirectory, ServiceRecord, UdpDirectory,
};
pub use error::TransportError;
pub use session::{Session, SessionListener, SessionTransport, SharedListener, SharedSession};
pub use tcp::{TcpSession, TcpSessionListener, TcpTransport};

/// Protocol name announced for sessions carried by [`TcpTransport`].
pub const TCP_PROTOCOL: &str = "tcp";
