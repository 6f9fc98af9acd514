//! Port forwarding against the in-process server's echo channels.

#![cfg(feature = "port_forward")]

mod support;

use std::time::Duration;

use sshplex::Forwarder;
use support::{HANGUP_HOST, TestServer, eventually};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn paired_forwarder_echoes_megabytes() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let (forwarder, local) = Forwarder::paired(&session, "echo.internal", 7).await.unwrap();
    assert_eq!(forwarder.client_count(), 1);
    assert!(forwarder.local_addr().is_none());

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let (mut reader, mut writer) = tokio::io::split(local);

    let outgoing = payload.clone();
    let sender = tokio::spawn(async move {
        writer.write_all(&outgoing).await.unwrap();
        // Keep the write half open: local EOF would close the forward.
        writer
    });

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(TRANSFER_TIMEOUT, reader.read_exact(&mut echoed))
        .await
        .expect("echo completes in time")
        .unwrap();
    assert!(echoed == payload, "echoed bytes differ from what was sent");

    let _writer = sender.await.unwrap();
    forwarder.close().await.unwrap();
    assert!(!forwarder.is_active());
    assert_eq!(forwarder.client_count(), 0);

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn close_tears_down_every_client() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let forwarder = Forwarder::listen(&session, 0, "echo.internal", 7, None)
        .await
        .unwrap();
    let addr = forwarder.local_addr().unwrap();
    assert!(addr.ip().is_loopback());

    let mut sockets = Vec::new();
    for _ in 0..3 {
        sockets.push(TcpStream::connect(addr).await.unwrap());
    }
    assert!(eventually(|| forwarder.client_count() == 3).await);

    // Each client round-trips before teardown.
    for (n, socket) in sockets.iter_mut().enumerate() {
        let message = format!("client {n}");
        socket.write_all(message.as_bytes()).await.unwrap();
        let mut reply = vec![0u8; message.len()];
        socket.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, message.as_bytes());
    }

    forwarder.close().await.unwrap();
    assert_eq!(forwarder.client_count(), 0);
    assert_eq!(session.open_channels(), 0);

    for socket in &mut sockets {
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut rest))
            .await
            .expect("local socket closed");
        assert!(read.is_ok());
        assert!(rest.is_empty());
    }

    // Closing twice is fine.
    forwarder.close().await.unwrap();

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn info_describes_the_forward() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let forwarder = Forwarder::listen(&session, 0, "db.internal", 5432, Some("127.0.0.1"))
        .await
        .unwrap();
    let info = forwarder.info();
    assert_eq!(info.remote_address, "db.internal:5432");
    assert_eq!(info.session_id, session.id().to_string());
    assert_eq!(
        info.local_address,
        forwarder.local_addr().map(|addr| addr.to_string())
    );
    assert!(info.active);
    assert_eq!(info.clients, 0);
    let debug = format!("{forwarder:?}");
    assert!(debug.contains("db.internal"));
    assert!(debug.contains("5432"));

    forwarder.close().await.unwrap();
    assert!(!forwarder.info().active);

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn local_eof_closes_socket_and_channel() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let (forwarder, local) = Forwarder::paired(&session, "echo.internal", 7).await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(local);

    writer.write_all(b"last words").await.unwrap();
    let mut reply = [0u8; 10];
    reader.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"last words");
    assert_eq!(session.open_channels(), 1);

    writer.shutdown().await.unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
        .await
        .expect("local socket closed after local EOF")
        .unwrap();
    assert!(rest.is_empty());
    assert!(eventually(|| session.open_channels() == 0).await);
    assert!(eventually(|| session.tracked_channels() == 0).await);

    forwarder.close().await.unwrap();
    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn remote_eof_closes_socket_and_channel() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let (forwarder, local) = Forwarder::paired(&session, HANGUP_HOST, 7).await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(local);

    // The write half stays open: only the remote side ends the stream.
    writer.write_all(b"hello").await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut received))
        .await
        .expect("local socket closed after remote EOF")
        .unwrap();
    assert_eq!(received, b"hello");
    assert!(eventually(|| session.open_channels() == 0).await);
    assert!(eventually(|| session.tracked_channels() == 0).await);

    forwarder.close().await.unwrap();
    drop(writer);
    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn close_during_client_setup() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let forwarder = Forwarder::listen(&session, 0, "echo.internal", 7, None)
        .await
        .unwrap();
    let addr = forwarder.local_addr().unwrap();

    let mut socket = TcpStream::connect(addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), forwarder.close())
        .await
        .expect("close does not wait on client setup")
        .unwrap();

    // Whether or not the connection was picked up, it ends.
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut rest))
        .await
        .expect("local socket closed");
    assert!(eventually(|| forwarder.client_count() == 0).await);
    assert!(eventually(|| session.open_channels() == 0).await);

    session.close().await.unwrap();
    server.stop().await.unwrap();
}
