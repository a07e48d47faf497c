mod common;

use std::time::Duration;

use tether_core::{
    AnyTransport, Frame, FrameBody, HandlerError, Init, RawStream, Role, Session, SessionConfig,
    SessionError,
};
use tokio::sync::mpsc;

use common::{connect, connect_with, within, QUIET};

const UPLOAD_LEN: usize = 64 * 1024;

/// Reads exactly `UPLOAD_LEN` bytes and answers with their sum.
async fn sink(mut stream: RawStream) {
    let mut received = 0usize;
    let mut sum = 0u64;
    while received < UPLOAD_LEN {
        let Some(chunk) = stream.recv().await else {
            return;
        };
        received += chunk.len();
        sum += chunk.iter().map(|b| u64::from(*b)).sum::<u64>();
    }
    let _ = stream.send(&sum.to_le_bytes()).await;
    // Hold the stream until the uploader is done with it.
    while stream.recv().await.is_some() {}
}

/// Sends one chunk back, then hangs up.
async fn ping(mut stream: RawStream) {
    if let Some(chunk) = stream.recv().await {
        let _ = stream.send(&chunk).await;
    }
}

async fn explode(_stream: RawStream) {
    panic!("stream handler bug");
}

fn raw_config(stream_init_timeout: Duration) -> SessionConfig {
    SessionConfig {
        stream_init_timeout,
        ..SessionConfig::default()
    }
}

async fn next_frame(peer: &AnyTransport) -> Frame {
    let buf = within(peer.recv_frame(1 << 20)).await.unwrap();
    Frame::decode(&buf).unwrap()
}

async fn send_frame(peer: &AnyTransport, frame: Frame) {
    peer.send_frame(frame.encode().unwrap().into()).await.unwrap();
}

#[tokio::test]
async fn upload_through_a_small_window() {
    let config = SessionConfig {
        stream_window: 4,
        stream_chunk_size: 1024,
        ..SessionConfig::default()
    };
    let (client, _server) =
        connect_with(config, Init::new(), Init::new().stream("upload", sink)).await;

    let data: Vec<u8> = (0..UPLOAD_LEN).map(|i| (i % 251) as u8).collect();
    let expected: u64 = data.iter().map(|b| u64::from(*b)).sum();

    let mut stream = within(client.session.open_stream("upload")).await.unwrap();
    assert_eq!(stream.channel(), "upload");
    assert_eq!(stream.id() % 2, 1);
    within(stream.send(&data)).await.unwrap();

    let reply = within(stream.recv()).await.unwrap();
    assert_eq!(u64::from_le_bytes(reply[..].try_into().unwrap()), expected);
    stream.close().await.unwrap();
}

#[tokio::test]
async fn unknown_channel_is_rejected() {
    let (client, _server) = connect(Init::new(), Init::new().stream("upload", sink)).await;
    assert_eq!(
        within(client.session.open_stream("download")).await.unwrap_err(),
        SessionError::StreamRejected {
            channel: "download".into()
        }
    );
}

#[tokio::test]
async fn reserved_channels_cannot_be_opened() {
    let (client, _server) = connect(Init::new(), Init::new()).await;
    for channel in ["control", "signal"] {
        assert_eq!(
            client.session.open_stream(channel).await.unwrap_err(),
            SessionError::ReservedChannel(channel.into())
        );
    }
}

#[tokio::test]
async fn both_sides_open_at_once() {
    let (client, server) = connect(
        Init::new().stream("ping", ping),
        Init::new().stream("ping", ping),
    )
    .await;

    let (from_client, from_server) = tokio::join!(
        client.session.open_stream("ping"),
        server.session.open_stream("ping"),
    );
    let mut from_client = from_client.unwrap();
    let mut from_server = from_server.unwrap();
    assert_eq!(from_client.id() % 2, 1);
    assert_eq!(from_server.id() % 2, 0);

    for (stream, msg) in [(&mut from_client, b"client"), (&mut from_server, b"server")] {
        stream.send(msg).await.unwrap();
        assert_eq!(&within(stream.recv()).await.unwrap()[..], msg);
        // The handler returned, which closes its end.
        assert!(within(stream.recv()).await.is_none());
    }
}

#[tokio::test]
async fn dropping_one_end_ends_the_other() {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let server = Init::new()
        .stream("hold", move |mut stream: RawStream| {
            let done_tx = done_tx.clone();
            async move {
                while stream.recv().await.is_some() {}
                let _ = done_tx.send(());
            }
        })
        .stream("hangup", |stream: RawStream| async move { drop(stream) });
    let (client, _server) = connect(Init::new(), server).await;

    let stream = within(client.session.open_stream("hold")).await.unwrap();
    drop(stream);
    assert!(within(done_rx.recv()).await.is_some());

    let mut stream = within(client.session.open_stream("hangup")).await.unwrap();
    assert!(within(stream.recv()).await.is_none());
}

#[tokio::test]
async fn open_times_out_when_the_peer_never_answers() {
    common::init_tracing();
    let (a, peer) = AnyTransport::mem_pair();
    let session = Session::new(a, Role::Initiator, raw_config(Duration::from_millis(100))).unwrap();
    session.init(Init::new()).unwrap();
    send_frame(&peer, Frame::hello(Role::Acceptor)).await;
    assert!(within(session.ready()).await);

    assert_eq!(
        within(session.open_stream("files")).await.unwrap_err(),
        SessionError::StreamOpenTimeout {
            channel: "files".into()
        }
    );

    assert_eq!(next_frame(&peer).await, Frame::hello(Role::Initiator));
    assert_eq!(
        next_frame(&peer).await,
        Frame::new("files", FrameBody::StreamOpen { stream: 1 })
    );

    // A late accept is answered with a close.
    send_frame(&peer, Frame::new("files", FrameBody::StreamAccept { stream: 1 })).await;
    assert_eq!(
        next_frame(&peer).await,
        Frame::new("files", FrameBody::StreamClose { stream: 1 })
    );
    assert!(!session.is_closed());
}

#[tokio::test]
async fn sending_past_the_window_closes_the_stream() {
    common::init_tracing();
    let config = SessionConfig {
        stream_window: 2,
        ..SessionConfig::default()
    };
    let (a, peer) = AnyTransport::mem_pair();
    let session = Session::new(a, Role::Acceptor, config).unwrap();
    // The handler never reads, so no credits come back.
    session
        .init(Init::new().stream("sink", |stream: RawStream| async move {
            let _stream = stream;
            std::future::pending::<()>().await;
        }))
        .unwrap();
    send_frame(&peer, Frame::hello(Role::Initiator)).await;
    assert_eq!(next_frame(&peer).await, Frame::hello(Role::Acceptor));

    send_frame(&peer, Frame::new("sink", FrameBody::StreamOpen { stream: 1 })).await;
    assert_eq!(
        next_frame(&peer).await,
        Frame::new("sink", FrameBody::StreamAccept { stream: 1 })
    );

    for _ in 0..3 {
        let data = FrameBody::StreamData {
            stream: 1,
            data: vec![0; 8],
        };
        send_frame(&peer, Frame::new("sink", data)).await;
    }
    assert_eq!(
        next_frame(&peer).await,
        Frame::new("sink", FrameBody::StreamClose { stream: 1 })
    );
    tokio::time::sleep(QUIET).await;
    assert!(!session.is_closed());
}

#[tokio::test]
async fn wrong_parity_open_is_rejected() {
    common::init_tracing();
    let (a, peer) = AnyTransport::mem_pair();
    let session = Session::new(a, Role::Acceptor, SessionConfig::default()).unwrap();
    session
        .init(Init::new().stream("ping", ping))
        .unwrap();
    send_frame(&peer, Frame::hello(Role::Initiator)).await;
    assert_eq!(next_frame(&peer).await, Frame::hello(Role::Acceptor));

    // Even ids belong to the acceptor.
    send_frame(&peer, Frame::new("ping", FrameBody::StreamOpen { stream: 2 })).await;
    assert_eq!(
        next_frame(&peer).await,
        Frame::new("ping", FrameBody::StreamReject { stream: 2 })
    );
}

#[tokio::test]
async fn panicking_stream_handler_leaves_the_session_usable() {
    let server = Init::new()
        .stream("boom", explode)
        .call("add", |_ctx, (a, b): (i32, i32)| async move {
            Ok::<_, HandlerError>(a + b)
        });
    let (client, _server) = connect(Init::new(), server).await;

    let mut stream = within(client.session.open_stream("boom")).await.unwrap();
    assert!(within(stream.recv()).await.is_none());

    let sum: i32 = within(client.control.call("add", &(20, 22))).await.unwrap();
    assert_eq!(sum, 42);
}
