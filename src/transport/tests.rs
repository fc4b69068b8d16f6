use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};

use super::*;

#[tokio::test]
async fn configure_stream_applies_socket_options() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();

    let config = TransportConfig {
        tcp_nodelay: true,
        tcp_keepalive: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    configure_stream(&server, &config).unwrap();

    assert!(server.nodelay().unwrap());
    assert!(SockRef::from(&server).keepalive().unwrap());
    drop(client);
}

#[test]
fn durations_deserialize_from_humantime() {
    let config: TransportConfig = toml::from_str("tcp_keepalive = \"90s\"").unwrap();
    assert_eq!(config.tcp_keepalive, Some(Duration::from_secs(90)));
    assert!(config.tcp_nodelay);
}
