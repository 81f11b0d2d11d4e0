mod support;

use std::time::Duration;

use socketry::server::{Listener, ListenerExt, TcpServer, TlsServer};
use socketry::{Connector, TlsOptions};
use support::{make_certs, port_of, v4};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn tls_server(hosts: &[&str]) -> (TlsServer<TcpServer>, u16, support::TestCerts) {
    let certs = make_certs(hosts);
    let inner = TcpServer::bind("tcp://127.0.0.1:0").unwrap();
    let port = port_of(&inner.local_addr().unwrap());
    let server = TlsServer::new(
        inner,
        TlsOptions::new().local_cert(&certs.server_pem),
    )
    .unwrap();
    (server, port, certs)
}

#[tokio::test]
async fn end_to_end_echo_with_sni_from_the_hostname_hint() {
    let _ = env_logger::try_init();

    let (mut server, port, certs) = tls_server(&["app.internal"]);
    assert!(server.local_addr().unwrap().starts_with("tls://"));

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await.unwrap().unwrap();
        assert!(conn.is_tls());
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(&buf).await.unwrap();
        conn.shutdown().await.unwrap();
    });

    // The hostname resolves through an override; peer verification uses the
    // hostname carried by the `?hostname=` hint, not the literal IP.
    let connector = Connector::builder()
        .resolve("app.internal", &[v4("127.0.0.1")])
        .tls_options(TlsOptions::new().add_root_certificate(&certs.ca_pem))
        .build()
        .unwrap();

    let mut conn = connector
        .connect(&format!("tls://app.internal:{}", port))
        .await
        .unwrap();

    assert!(conn.is_tls());
    assert!(conn.peer_addr().unwrap().starts_with("tls://127.0.0.1:"));
    assert!(conn.local_addr().unwrap().starts_with("tls://"));

    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    server_task.await.unwrap();
}

#[tokio::test]
async fn untrusted_certificates_fail_the_handshake() {
    let _ = env_logger::try_init();

    let (mut server, port, _certs) = tls_server(&["app.internal"]);

    let server_task = tokio::spawn(async move {
        // The handshake failure surfaces server-side as an error item too.
        let item = server.accept().await.unwrap();
        assert!(item.is_err());
    });

    // No custom root: the test CA is unknown.
    let connector = Connector::builder()
        .resolve("app.internal", &[v4("127.0.0.1")])
        .build()
        .unwrap();

    let err = connector
        .connect(&format!("tls://app.internal:{}", port))
        .await
        .unwrap_err();
    assert!(err.is_encryption(), "{}", err);
    let msg = err.to_string();
    assert!(msg.contains("TLS handshake"), "{}", msg);
    assert!(
        msg.starts_with(&format!("Connection to tls://app.internal:{}", port)),
        "{}",
        msg
    );

    server_task.await.unwrap();
}

#[tokio::test]
async fn self_signed_certificates_can_be_allowed() {
    let _ = env_logger::try_init();

    let (mut server, port, _certs) = tls_server(&["app.internal"]);

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await.unwrap().unwrap();
        conn.write_all(b"ok").await.unwrap();
        conn.shutdown().await.unwrap();
    });

    let connector = Connector::builder()
        .resolve("app.internal", &[v4("127.0.0.1")])
        .tls_options(TlsOptions::new().allow_self_signed(true))
        .build()
        .unwrap();

    let mut conn = connector
        .connect(&format!("tls://app.internal:{}", port))
        .await
        .unwrap();
    let mut buf = [0u8; 2];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");

    server_task.await.unwrap();
}

#[tokio::test]
async fn peer_name_mismatches_are_rejected_unless_disabled() {
    let _ = env_logger::try_init();

    let (mut server, port, certs) = tls_server(&["app.internal"]);

    let server_task = tokio::spawn(async move {
        // First client fails verification, second succeeds.
        let first = server.accept().await.unwrap();
        assert!(first.is_err());
        let mut conn = server.accept().await.unwrap().unwrap();
        conn.shutdown().await.unwrap();
    });

    // The certificate names app.internal, the client expects other.internal.
    let strict = Connector::builder()
        .resolve("other.internal", &[v4("127.0.0.1")])
        .tls_options(TlsOptions::new().add_root_certificate(&certs.ca_pem))
        .build()
        .unwrap();
    let err = strict
        .connect(&format!("tls://other.internal:{}", port))
        .await
        .unwrap_err();
    assert!(err.is_encryption(), "{}", err);

    let relaxed = Connector::builder()
        .resolve("other.internal", &[v4("127.0.0.1")])
        .tls_options(
            TlsOptions::new()
                .add_root_certificate(&certs.ca_pem)
                .verify_peer_name(false),
        )
        .build()
        .unwrap();
    relaxed
        .connect(&format!("tls://other.internal:{}", port))
        .await
        .unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn garbage_bytes_emit_an_error_and_keep_the_server_alive() {
    let _ = env_logger::try_init();

    let (mut server, port, certs) = tls_server(&["app.internal"]);

    let server_task = tokio::spawn(async move {
        let first = server.accept().await.unwrap();
        let err = first.unwrap_err();
        assert!(err.is_encryption());
        assert!(err.to_string().contains("TLS handshake"), "{}", err);

        // Still serving.
        let mut conn = server.accept().await.unwrap().unwrap();
        conn.shutdown().await.unwrap();
    });

    // Not a TLS client at all.
    let mut garbage = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    garbage.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    drop(garbage);

    // Give the server a moment to process the bad client first.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connector = Connector::builder()
        .resolve("app.internal", &[v4("127.0.0.1")])
        .tls_options(TlsOptions::new().add_root_certificate(&certs.ca_pem))
        .build()
        .unwrap();
    connector
        .connect(&format!("tls://app.internal:{}", port))
        .await
        .unwrap();

    server_task.await.unwrap();
}
