//! End-to-end transport tests over an in-memory duplex stream.

use std::sync::Arc;

use kedge_platform::{KedgeError, KedgeResult};
use kedge_proto::ssh::conn::Connection;
use kedge_proto::ssh::dispatcher::Dispatcher;
use kedge_proto::ssh::kex_dh::{HostKeySigner, HostKeyVerifier};
use kedge_proto::ssh::message::disconnect_reason;
use kedge_proto::ssh::service::{ServiceRegistry, SSH_USERAUTH};
use kedge_proto::ssh::transport::{TransportConfig, TransportEvent};
use sha2::{Digest, Sha256};

const TEST_ALGORITHM: &str = "kedge-test-key";
const TEST_SECRET: &[u8] = b"integration test signing secret";
const TEST_BLOB: &[u8] = b"integration-test-public-blob";

struct TestSigner;

impl HostKeySigner for TestSigner {
    fn algorithm(&self) -> &'static str {
        TEST_ALGORITHM
    }
    fn public_key_blob(&self) -> Vec<u8> {
        TEST_BLOB.to_vec()
    }
    fn sign(&self, data: &[u8]) -> KedgeResult<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(TEST_SECRET);
        hasher.update(data);
        Ok(hasher.finalize().to_vec())
    }
}

struct TestVerifier;

impl HostKeyVerifier for TestVerifier {
    fn algorithms(&self) -> Vec<&'static str> {
        vec![TEST_ALGORITHM]
    }
    fn verify(&self, host_key: &[u8], data: &[u8], signature: &[u8]) -> KedgeResult<()> {
        if host_key != TEST_BLOB {
            return Err(KedgeError::Trust("unknown host key".to_string()));
        }
        if TestSigner.sign(data)? != signature {
            return Err(KedgeError::Trust("bad signature".to_string()));
        }
        Ok(())
    }
}

struct RejectingVerifier;

impl HostKeyVerifier for RejectingVerifier {
    fn algorithms(&self) -> Vec<&'static str> {
        vec![TEST_ALGORITHM]
    }
    fn verify(&self, _: &[u8], _: &[u8], _: &[u8]) -> KedgeResult<()> {
        Err(KedgeError::Trust(
            "host key rejected by policy".to_string(),
        ))
    }
}

type DuplexConn = Connection<tokio::io::DuplexStream>;

async fn connect_with(config: TransportConfig) -> (DuplexConn, DuplexConn) {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    let mut services = ServiceRegistry::new();
    services.register(SSH_USERAUTH);
    let client = Connection::client(client_stream, config.clone(), Arc::new(TestVerifier));
    let server = Connection::server(server_stream, config, Arc::new(TestSigner), services);
    let (client, server) = tokio::join!(client, server);
    (client.unwrap(), server.unwrap())
}

async fn connect() -> (DuplexConn, DuplexConn) {
    connect_with(TransportConfig::default()).await
}

/// Reads events until `want` returns true for one, failing on disconnect.
async fn wait_for(
    conn: &mut DuplexConn,
    mut want: impl FnMut(&TransportEvent) -> bool,
) -> TransportEvent {
    loop {
        let event = conn.next_event().await.unwrap();
        if want(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_handshake_establishes_matching_sessions() {
    let (client, server) = connect().await;
    assert!(client.transport().is_established());
    assert!(server.transport().is_established());
    assert_eq!(
        client.transport().session_id().unwrap(),
        server.transport().session_id().unwrap()
    );
    assert_eq!(client.transport().peer_version().unwrap().protocol, "2.0");
}

#[tokio::test]
async fn test_service_request_and_application_traffic() {
    let (mut client, mut server) = connect().await;
    client.request_service(SSH_USERAUTH).await.unwrap();

    let requested = wait_for(&mut server, |e| {
        matches!(e, TransportEvent::ServiceRequested { .. })
    })
    .await;
    assert!(matches!(
        requested,
        TransportEvent::ServiceRequested { service } if service == SSH_USERAUTH
    ));
    wait_for(&mut client, |e| {
        matches!(e, TransportEvent::ServiceAccepted { service } if service == SSH_USERAUTH)
    })
    .await;

    // Application bytes flow both ways once the service is up.
    client.send_application(vec![50, 1, 2, 3]).await.unwrap();
    let got = wait_for(&mut server, |e| {
        matches!(e, TransportEvent::ApplicationMessage { .. })
    })
    .await;
    assert!(matches!(
        got,
        TransportEvent::ApplicationMessage { payload } if payload == vec![50, 1, 2, 3]
    ));

    server.send_application(vec![51, 4, 5]).await.unwrap();
    let got = wait_for(&mut client, |e| {
        matches!(e, TransportEvent::ApplicationMessage { .. })
    })
    .await;
    assert!(matches!(
        got,
        TransportEvent::ApplicationMessage { payload } if payload == vec![51, 4, 5]
    ));
}

#[tokio::test]
async fn test_disconnect_reaches_peer() {
    let (mut client, mut server) = connect().await;
    client
        .disconnect(disconnect_reason::BY_APPLICATION, "session over")
        .await
        .unwrap();

    let event = wait_for(&mut server, |e| {
        matches!(e, TransportEvent::Disconnected { .. })
    })
    .await;
    match event {
        TransportEvent::Disconnected {
            reason_code,
            description,
        } => {
            assert_eq!(reason_code, disconnect_reason::BY_APPLICATION);
            assert_eq!(description, "session over");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_untrusted_host_key_aborts_handshake() {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    let mut services = ServiceRegistry::new();
    services.register(SSH_USERAUTH);
    let client = Connection::client(
        client_stream,
        TransportConfig::default(),
        Arc::new(RejectingVerifier),
    );
    let server = Connection::server(
        server_stream,
        TransportConfig::default(),
        Arc::new(TestSigner),
        services,
    );
    let (client, _server) = tokio::join!(client, server);
    match client {
        Err(KedgeError::Trust(msg)) => assert!(msg.contains("rejected")),
        other => panic!("expected security error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rekey_preserves_session_and_traffic() {
    let config = TransportConfig {
        rekey_bytes_limit: 2048,
        ..TransportConfig::default()
    };
    let (mut client, mut server) = connect_with(config).await;
    client.request_service(SSH_USERAUTH).await.unwrap();
    let session_id = client.transport().session_id().unwrap().to_vec();

    // Server echoes every application message back; the request/response
    // rhythm keeps both engines reading, so rekeys can complete inline.
    let server_task = tokio::spawn(async move {
        let mut handled = 0usize;
        while handled < 20 {
            match server.next_event().await.unwrap() {
                TransportEvent::ApplicationMessage { payload } => {
                    server.send_application(payload).await.unwrap();
                    handled += 1;
                }
                _ => continue,
            }
        }
        server
    });

    let mut rekeyed = false;
    for i in 0u8..20 {
        let mut message = vec![60u8; 300];
        message[1] = i;
        client.send_application(message.clone()).await.unwrap();
        loop {
            match client.next_event().await.unwrap() {
                TransportEvent::ApplicationMessage { payload } => {
                    assert_eq!(payload, message);
                    break;
                }
                TransportEvent::KeysEstablished { initial: false } => rekeyed = true,
                _ => continue,
            }
        }
    }
    let server = server_task.await.unwrap();

    assert!(rekeyed, "byte limit should have forced a rekey");
    assert_eq!(client.transport().session_id().unwrap(), &session_id[..]);
    assert_eq!(server.transport().session_id().unwrap(), &session_id[..]);
}

#[tokio::test]
async fn test_dispatcher_routes_application_payloads() {
    let (mut client, mut server) = connect().await;
    client.request_service(SSH_USERAUTH).await.unwrap();
    wait_for(&mut server, |e| {
        matches!(e, TransportEvent::ServiceRequested { .. })
    })
    .await;

    let mut dispatcher = Dispatcher::new();
    let mut userauth_rx = dispatcher.register(50, 16);
    server.set_dispatcher(dispatcher);

    // A handled id goes to the channel, never out of next_event.
    client.send_application(vec![50, 0xaa]).await.unwrap();
    let routed = tokio::select! {
        payload = userauth_rx.recv() => payload.unwrap(),
        event = server.next_event() => panic!("expected channel delivery, got {event:?}"),
    };
    assert_eq!(routed, vec![50, 0xaa]);

    // An unhandled id still surfaces as an event.
    client.send_application(vec![51, 0xbb]).await.unwrap();
    let event = wait_for(&mut server, |e| {
        matches!(e, TransportEvent::ApplicationMessage { .. })
    })
    .await;
    assert!(matches!(
        event,
        TransportEvent::ApplicationMessage { payload } if payload == vec![51, 0xbb]
    ));
}
