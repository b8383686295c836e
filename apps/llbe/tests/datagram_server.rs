use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use llbe::{
    config::TransportConfig,
    error::TransportError,
    transport::{
        mock::{PlaintextAcceptor, StallingAcceptor},
        DatagramHandler, DatagramServer,
    },
};
use parking_lot::Mutex;
use tokio::{net::UdpSocket, time::timeout};

fn transport_config() -> TransportConfig {
    TransportConfig {
        host: "127.0.0.1".into(),
        port: 0,
        max_connections: 8,
        handshake_timeout_ms: 200,
        poll_interval_ms: 20,
        reap_interval_ms: 50,
        ..TransportConfig::default()
    }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("client socket")
}

async fn exchange(client: &UdpSocket, server: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    client.send_to(payload, server).await.expect("send");
    let mut buf = [0u8; 1500];
    match timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => {
            assert_eq!(from, server, "replies come from the listening port");
            Some(buf[..len].to_vec())
        }
        _ => None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct ShoutingHandler {
    disconnects: Mutex<Vec<SocketAddr>>,
}

#[async_trait]
impl DatagramHandler for ShoutingHandler {
    async fn on_message(&self, _peer: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        Some(payload.to_ascii_uppercase())
    }

    async fn on_disconnect(&self, peer: SocketAddr) {
        self.disconnects.lock().push(peer);
    }
}

#[tokio::test]
async fn echoes_and_counts_bytes() {
    let server = DatagramServer::bind(&transport_config(), Arc::new(PlaintextAcceptor))
        .await
        .expect("bind");
    server.start();
    let addr = server.local_addr();

    let alice = client().await;
    assert_eq!(exchange(&alice, addr, b"hello").await.as_deref(), Some(&b"hello"[..]));
    assert_eq!(exchange(&alice, addr, b"again").await.as_deref(), Some(&b"again"[..]));

    let connections = server.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].remote, alice.local_addr().expect("addr"));
    assert_eq!(connections[0].bytes_received, 10);
    assert_eq!(connections[0].bytes_sent, 10);

    server.stop().await;
}

#[tokio::test]
async fn latest_handler_wins_and_sees_disconnects() {
    let server = DatagramServer::bind(&transport_config(), Arc::new(PlaintextAcceptor))
        .await
        .expect("bind");
    let handler = Arc::new(ShoutingHandler::default());
    server.set_handler(handler.clone());
    server.start();
    let addr = server.local_addr();

    let bob = client().await;
    assert_eq!(exchange(&bob, addr, b"quiet").await.as_deref(), Some(&b"QUIET"[..]));

    // An empty datagram ends a plaintext session.
    bob.send_to(&[], addr).await.expect("send");
    wait_until(|| server.active_connections() == 0).await;
    wait_until(|| server.tracked_connections() == 0).await;
    assert_eq!(
        handler.disconnects.lock().clone(),
        vec![bob.local_addr().expect("addr")]
    );

    server.stop().await;
}

#[tokio::test]
async fn clients_over_the_cap_are_discarded() {
    let config = TransportConfig {
        max_connections: 1,
        ..transport_config()
    };
    let server = DatagramServer::bind(&config, Arc::new(PlaintextAcceptor))
        .await
        .expect("bind");
    server.start();
    let addr = server.local_addr();

    let first = client().await;
    let second = client().await;
    assert!(exchange(&first, addr, b"one").await.is_some());
    assert!(exchange(&second, addr, b"two").await.is_none());
    assert_eq!(server.active_connections(), 1);
    assert_eq!(server.tracked_connections(), 1);

    // The admitted client is unaffected.
    assert!(exchange(&first, addr, b"three").await.is_some());
    server.stop().await;
}

#[tokio::test]
async fn stalled_handshakes_time_out_and_are_reaped() {
    let server = DatagramServer::bind(&transport_config(), Arc::new(StallingAcceptor))
        .await
        .expect("bind");
    server.start();

    let slow = client().await;
    assert!(exchange(&slow, server.local_addr(), b"client hello").await.is_none());
    wait_until(|| server.tracked_connections() == 0).await;
    assert_eq!(server.active_connections(), 0);

    server.stop().await;
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let server = DatagramServer::bind(&transport_config(), Arc::new(PlaintextAcceptor))
        .await
        .expect("bind");
    server.stop().await;
    assert!(!server.is_running());

    server.start();
    server.start();
    assert!(server.is_running());

    let carol = client().await;
    assert!(exchange(&carol, server.local_addr(), b"hi").await.is_some());

    server.stop().await;
    server.stop().await;
    assert!(!server.is_running());
    assert_eq!(server.tracked_connections(), 0);
    assert!(exchange(&carol, server.local_addr(), b"anyone?").await.is_none());
}

#[tokio::test]
async fn port_in_use_fails_to_bind() {
    let squatter = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let config = TransportConfig {
        port: squatter.local_addr().expect("addr").port(),
        ..transport_config()
    };
    let result = DatagramServer::bind(&config, Arc::new(PlaintextAcceptor)).await;
    assert!(matches!(result, Err(TransportError::Bind { .. })));
}

#[tokio::test]
async fn missing_credentials_fail_initialization() {
    let config = TransportConfig {
        certificate_file: Some("/nonexistent/server.crt".into()),
        private_key_file: Some("/nonexistent/server.key".into()),
        ..transport_config()
    };
    assert!(matches!(
        DatagramServer::initialize(&config).await,
        Err(TransportError::Credentials(_))
    ));

    let config = TransportConfig {
        self_signed: true,
        cipher_suites: vec!["NULL-MD5".into()],
        ..transport_config()
    };
    assert!(matches!(
        DatagramServer::initialize(&config).await,
        Err(TransportError::CipherPolicy(_))
    ));
}

#[tokio::test]
async fn dtls_client_gets_its_records_echoed() {
    use webrtc::dtls::{config::Config as DtlsConfig, conn::DTLSConn, crypto::Certificate};
    use webrtc::util::conn::Conn;

    let config = TransportConfig {
        self_signed: true,
        handshake_timeout_ms: 5_000,
        ..transport_config()
    };
    let server = DatagramServer::initialize(&config).await.expect("initialize");
    server.start();

    let socket = client().await;
    socket.connect(server.local_addr()).await.expect("connect");
    let conn: Arc<dyn Conn + Send + Sync> = Arc::new(socket);
    let client_config = DtlsConfig {
        certificates: vec![Certificate::generate_self_signed(vec!["client".to_owned()])
            .expect("client certificate")],
        insecure_skip_verify: true,
        ..Default::default()
    };

    let dtls = timeout(
        Duration::from_secs(10),
        DTLSConn::new(conn, client_config, true, None),
    )
    .await
    .expect("handshake finished")
    .expect("handshake succeeded");

    dtls.write(b"over dtls", None).await.expect("write");
    let mut buf = [0u8; 256];
    let len = timeout(Duration::from_secs(5), dtls.read(&mut buf, None))
        .await
        .expect("reply arrived")
        .expect("read");
    assert_eq!(&buf[..len], b"over dtls");
    assert_eq!(server.active_connections(), 1);

    let _ = dtls.close().await;
    server.stop().await;
}
