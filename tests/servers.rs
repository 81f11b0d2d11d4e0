mod support;

use std::time::Duration;

use futures_util::StreamExt;
use socketry::server::{self, Listener, ListenerExt, TcpServer};
use support::port_of;

#[tokio::test]
async fn pause_defers_accepts_until_resume() {
    let _ = env_logger::try_init();

    let mut server = TcpServer::bind("tcp://127.0.0.1:0").unwrap();
    let port = port_of(&server.local_addr().unwrap());

    server.pause();

    // The kernel still completes the TCP handshake from its backlog; the
    // application just does not accept.
    let client = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();

    let paused = tokio::time::timeout(Duration::from_millis(100), server.accept()).await;
    assert!(paused.is_err(), "accepted while paused");

    server.resume();
    let conn = tokio::time::timeout(Duration::from_millis(500), server.accept())
        .await
        .expect("resumed accept")
        .unwrap()
        .unwrap();
    assert_eq!(
        conn.peer_addr().unwrap(),
        format!("tcp://{}", client.local_addr().unwrap())
    );
}

#[tokio::test]
async fn incoming_is_a_stream_of_connections() {
    let _ = env_logger::try_init();

    let server = TcpServer::bind("tcp://127.0.0.1:0").unwrap();
    let port = port_of(&server.local_addr().unwrap());
    let mut incoming = server.incoming();

    let _c1 = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let _c2 = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();

    let first = incoming.next().await.unwrap().unwrap();
    let second = incoming.next().await.unwrap().unwrap();
    assert_ne!(first.peer_addr(), second.peer_addr());

    // Closing ends the stream.
    let mut server = incoming.into_inner();
    server.close();
    assert!(server.incoming().next().await.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn inherited_fd_targets_are_served() {
    use std::os::unix::io::IntoRawFd;

    let _ = env_logger::try_init();

    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    let fd = std_listener.into_raw_fd();

    let mut listener = server::bind(&format!("fd/{}", fd)).unwrap();
    assert_eq!(listener.local_addr(), Some(format!("tcp://{}", addr)));

    let (client, accepted) = tokio::join!(
        tokio::net::TcpStream::connect(addr),
        listener.accept()
    );
    client.unwrap();
    accepted.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn malformed_fd_targets_are_invalid() {
    let err = server::bind("fd/not-a-number").unwrap_err();
    assert!(err.is_invalid_uri());
}

#[tokio::test]
async fn facade_binds_tls_with_options() {
    let _ = env_logger::try_init();

    let certs = support::make_certs(&["localhost"]);
    let listener = server::ServerBuilder::new()
        .tls_options(socketry::TlsOptions::new().local_cert(&certs.server_pem))
        .bind("tls://127.0.0.1:0")
        .unwrap();

    let addr = listener.local_addr().unwrap();
    assert!(addr.starts_with("tls://127.0.0.1:"), "{}", addr);
}
