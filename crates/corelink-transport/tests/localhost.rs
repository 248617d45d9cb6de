//! Integration tests: TCP sessions and directories on localhost.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use corelink_transport::{
    DirectoryConfig, GroupDirectory, MemoryDirectory, ServiceRecord, SessionTransport,
    TcpTransport, TransportConfig, TransportError, UdpDirectory,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Dial a listener, write from both sides, verify ordering is preserved.
#[tokio::test]
async fn tcp_sessions_exchange_bytes() {
    init_tracing();
    let transport = TcpTransport::new(TransportConfig::new().port_range(24100..24150));
    let (listener, port) = transport.listen("127.0.0.1").await.unwrap();
    assert!((24100..24150).contains(&port));

    let client = transport.dial("127.0.0.1", port).await.unwrap();
    let server = listener.accept().await.unwrap();

    client.write(b"first,").await.unwrap();
    client.write(b"second").await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < b"first,second".len() {
        let n = tokio::time::timeout(Duration::from_secs(5), server.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"first,second");

    server.write(b"pong").await.unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pong");

    client.close().await.unwrap();
    server.close().await.unwrap();
    listener.close().await.unwrap();
}

/// Two listeners on the same host get distinct ports from the range.
#[tokio::test]
async fn listeners_walk_the_port_range() {
    init_tracing();
    let transport = TcpTransport::new(TransportConfig::new().port_range(24200..24250));
    let (_first, a) = transport.listen("127.0.0.1").await.unwrap();
    let (_second, b) = transport.listen("127.0.0.1").await.unwrap();
    assert_ne!(a, b);
    assert!(b > a);
}

/// Exhausting the range reports the range that was searched.
#[tokio::test]
async fn exhausted_range_is_an_error() {
    init_tracing();
    let transport = TcpTransport::new(TransportConfig::new().port_range(24300..24301));
    let (_held, _) = transport.listen("127.0.0.1").await.unwrap();
    match transport.listen("127.0.0.1").await {
        Err(TransportError::NoPortAvailable { start, end, .. }) => {
            assert_eq!((start, end), (24300, 24301));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("second listener should not bind"),
    }
}

#[tokio::test]
async fn dial_without_listener_fails() {
    init_tracing();
    let transport = TcpTransport::default();
    let result = transport.dial("127.0.0.1", 1).await;
    assert!(matches!(result, Err(TransportError::Dial { .. })));
}

/// Hub announces over loopback UDP, peer finds it.
#[tokio::test]
async fn udp_directory_answers_queries() {
    init_tracing();
    let config = DirectoryConfig::new("lab").group(Ipv4Addr::LOCALHOST, 24599);
    let hub = UdpDirectory::new(config.clone());
    hub.announce(ServiceRecord::new("core", "tcp", "127.0.0.1", 5600))
        .await
        .unwrap();
    hub.start().await.unwrap();

    let peer = UdpDirectory::new(config);
    let candidates = peer.query(Duration::from_secs(3)).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].kind, "core");
    assert_eq!(candidates[0].address, "127.0.0.1");
    assert_eq!(candidates[0].port, 5600);
    assert_eq!(candidates[0].local_address, "127.0.0.1");

    hub.stop().await.unwrap();
    hub.stop().await.unwrap();
}

/// A query in another domain gets no answer.
#[tokio::test]
async fn udp_directory_ignores_other_domains() {
    init_tracing();
    let hub = UdpDirectory::new(DirectoryConfig::new("lab").group(Ipv4Addr::LOCALHOST, 24598));
    hub.announce(ServiceRecord::new("core", "tcp", "127.0.0.1", 5601))
        .await
        .unwrap();
    hub.start().await.unwrap();

    let stranger =
        UdpDirectory::new(DirectoryConfig::new("prod").group(Ipv4Addr::LOCALHOST, 24598));
    let result = stranger.query(Duration::from_millis(300)).await;
    assert!(matches!(result, Err(TransportError::QueryTimeout(_))));
    hub.stop().await.unwrap();
}

/// Directories are usable behind the trait object the framework holds.
#[tokio::test]
async fn memory_directory_behind_trait_object() {
    init_tracing();
    let registry = MemoryDirectory::new("lab");
    let hub: Arc<dyn GroupDirectory> = Arc::new(registry.join("lab"));
    let peer: Arc<dyn GroupDirectory> = Arc::new(registry.join("lab"));

    hub.announce(ServiceRecord::new("core", "tcp", "127.0.0.1", 5602))
        .await
        .unwrap();
    hub.start().await.unwrap();
    let candidates = peer.query(Duration::from_millis(200)).await.unwrap();
    assert_eq!(candidates[0].port, 5602);

    hub.stop().await.unwrap();
    assert!(peer.query(Duration::from_millis(100)).await.is_err());
}
