//! Channel and session lifecycle against the in-process server.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sshplex::{CallbackSet, Channel, PollOutcome, Stream};
use support::TestServer;

fn collecting(sink: &Arc<Mutex<Vec<u8>>>) -> CallbackSet {
    let sink = sink.clone();
    CallbackSet::new().on_data(move |data, _stream| {
        let sink = sink.clone();
        async move { sink.lock().extend_from_slice(&data) }
    })
}

#[tokio::test]
async fn close_is_idempotent() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let channel = Channel::new(&session).unwrap();
    channel.open_session().await.unwrap();
    assert!(channel.is_open());
    assert_eq!(session.open_channels(), 1);

    channel.close(false).await.unwrap();
    channel.close(false).await.unwrap();
    assert!(!channel.is_assigned());
    assert!(!channel.is_open());
    assert_eq!(session.tracked_channels(), 0);

    let err = channel.write(b"late", Stream::Stdout).await.unwrap_err();
    assert!(err.is_usage());

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn close_from_own_eof_callback() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let channel = Arc::new(Channel::new(&session).unwrap());
    let output = Arc::new(Mutex::new(Vec::new()));
    let closed_inside = Arc::new(AtomicBool::new(false));

    let weak = Arc::downgrade(&channel);
    let flag = closed_inside.clone();
    let sink = output.clone();
    channel
        .set_callbacks(Some(
            CallbackSet::new()
                .on_data(move |data, _stream| {
                    let sink = sink.clone();
                    async move { sink.lock().extend_from_slice(&data) }
                })
                .on_eof(move || {
                    let weak = weak.clone();
                    let flag = flag.clone();
                    async move {
                        if let Some(channel) = weak.upgrade() {
                            channel.close(false).await.unwrap();
                            flag.store(true, Ordering::SeqCst);
                        }
                    }
                }),
        ))
        .unwrap();

    channel.open_session().await.unwrap();
    channel.request_exec("echo goodbye").await.unwrap();
    let outcome = channel.poll_loop(true).await.unwrap();

    assert_eq!(outcome, PollOutcome::Eof);
    assert!(closed_inside.load(Ordering::SeqCst));
    assert!(!channel.is_assigned());
    assert_eq!(&*output.lock(), b"goodbye\n");
    // Closing again after the callback did is a no-op.
    channel.close(false).await.unwrap();

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn close_from_another_task_while_callback_closes() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let channel = Arc::new(Channel::new(&session).unwrap());
    let weak = Arc::downgrade(&channel);
    channel
        .set_callbacks(Some(CallbackSet::new().on_eof(move || {
            let weak = weak.clone();
            async move {
                // Still delivering when the other task starts its close.
                tokio::time::sleep(Duration::from_millis(200)).await;
                if let Some(channel) = weak.upgrade() {
                    channel.close(true).await.unwrap();
                }
            }
        })))
        .unwrap();
    channel.open_session().await.unwrap();
    channel.request_exec("echo bye").await.unwrap();

    let poller = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.poll_loop(false).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), channel.close(false))
        .await
        .expect("close finishes while a callback closes the same channel")
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), poller)
        .await
        .expect("poll loop finishes")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, PollOutcome::Eof | PollOutcome::Closed));
    assert!(!channel.is_assigned());
    assert_eq!(session.tracked_channels(), 0);

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn write_then_closewrite() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let channel = Channel::new(&session).unwrap();
    let echoed = Arc::new(Mutex::new(Vec::new()));
    channel.set_callbacks(Some(collecting(&echoed))).unwrap();
    channel.open_session().await.unwrap();
    channel.request_exec("cat").await.unwrap();

    assert_eq!(channel.write(b"ping", Stream::Stdout).await.unwrap(), 4);
    assert_eq!(channel.write(b"", Stream::Stdout).await.unwrap(), 0);
    channel.closewrite(false).await.unwrap();
    assert!(!channel.is_writable());
    assert!(channel.is_open());

    // A second half-close is a no-op; writing after it is not allowed.
    channel.closewrite(false).await.unwrap();
    let err = channel.write(b"pong", Stream::Stdout).await.unwrap_err();
    assert!(err.is_usage());

    assert_eq!(channel.poll_loop(true).await.unwrap(), PollOutcome::Eof);
    assert!(channel.is_eof());
    assert_eq!(&*echoed.lock(), b"ping");

    channel.close(false).await.unwrap();
    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_closes_remaining_channels() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let mut channels = Vec::new();
    for _ in 0..3 {
        let channel = Channel::new(&session).unwrap();
        channel.open_session().await.unwrap();
        channels.push(channel);
    }
    assert_eq!(session.open_channels(), 3);

    session.disconnect().await.unwrap();
    assert!(!session.is_connected());
    assert_eq!(session.tracked_channels(), 0);
    for channel in &channels {
        assert!(!channel.is_assigned());
    }

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn dropped_channel_is_untracked() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let channel = Channel::new(&session).unwrap();
    channel.open_session().await.unwrap();
    drop(channel);

    assert!(support::eventually(|| session.tracked_channels() == 0).await);

    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_request_is_a_protocol_error() {
    let server = TestServer::start().await;
    let session = server.connect().await;

    let channel = Channel::new(&session).unwrap();
    channel.open_session().await.unwrap();
    // The test server has no pty support.
    let err = channel
        .request_pty(&sshplex::PtyRequest::default())
        .await
        .unwrap_err();
    assert!(err.is_protocol());

    channel.close(true).await.unwrap();
    session.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn channel_requires_authenticated_session() {
    let session = sshplex::Session::loopback();
    let err = Channel::new(&session).unwrap_err();
    assert!(err.is_usage());
}
