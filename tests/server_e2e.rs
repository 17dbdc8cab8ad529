//! End-to-end tests over real TCP sockets: a device client talks to a running
//! server while operator commands are pushed through [`DeviceService`].

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use bytes::Bytes;
use device_link::config::{LinkConfig, ResyncPolicy};
use device_link::core::codec::{Decoded, FrameCodec};
use device_link::core::frame::{Body, Frame, STATUS_OK};
use device_link::protocol::events::EventKind;
use device_link::service::commands::DeviceService;
use device_link::transport::server::{connect, Server};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Client = Framed<TcpStream, FrameCodec>;

struct Running {
    addr: SocketAddr,
    server: Server,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<device_link::Result<()>>,
    root: PathBuf,
}

impl Running {
    async fn start(configure: impl FnOnce(&mut LinkConfig)) -> Self {
        let root = std::env::temp_dir().join(format!("device-link-e2e-{}", rand::random::<u64>()));
        let upload_root = root.clone();
        let config = LinkConfig::default_with_overrides(|c| {
            c.server.address = "127.0.0.1:0".to_string();
            c.server.shutdown_timeout = Duration::from_secs(2);
            c.upload.root = upload_root;
            c.upload.memory_threshold = 16;
            configure(c);
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(config);
        let (shutdown, shutdown_rx) = mpsc::channel(1);

        let runner = server.clone();
        let task = tokio::spawn(async move { runner.run_with_shutdown(listener, shutdown_rx).await });

        Self {
            addr,
            server,
            shutdown,
            task,
            root,
        }
    }

    fn service(&self) -> DeviceService {
        self.server.device_service()
    }

    async fn stop(self) {
        self.shutdown.send(()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server stops")
            .expect("server task joins");
        assert!(result.is_ok());
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

async fn recv(client: &mut Client) -> Option<Frame> {
    let item = tokio::time::timeout(RECV_TIMEOUT, client.next())
        .await
        .expect("response before timeout");
    match item {
        Some(Ok(Decoded::Frame(frame))) => Some(frame),
        Some(Ok(Decoded::Rejected(e))) => panic!("server sent an invalid frame: {e}"),
        Some(Err(e)) => panic!("client transport error: {e}"),
        None => None,
    }
}

async fn request(client: &mut Client, frame: Frame) -> Frame {
    client.send(frame).await.unwrap();
    recv(client).await.expect("response frame")
}

async fn register(client: &mut Client, device_id: u32) -> u16 {
    let ack = request(client, Frame::new(device_id, 0, 0, Body::ConnectionRequest)).await;
    assert!(matches!(ack.body, Body::ConnectionAck { .. }));
    ack.session_id
}

#[tokio::test]
async fn test_device_session_over_tcp() {
    let running = Running::start(|c| c.codec.resync = ResyncPolicy::DiscardBuffer).await;
    let mut events = running.server.state().events.subscribe();
    let mut client = connect(running.addr).await.unwrap();

    // Register.
    let session_id = register(&mut client, 1001).await;
    assert_ne!(session_id, 0);
    assert!(running.server.state().connections.is_connected(1001));

    // Heartbeat.
    let ack = request(
        &mut client,
        Frame::new(1001, session_id, 3, Body::Heartbeat { battery: 80, status: 1 }),
    )
    .await;
    assert!(matches!(ack.body, Body::HeartbeatAck { .. }));
    assert_eq!((ack.device_id, ack.session_id, ack.task_id), (1001, session_id, 3));

    // Keyframe.
    let ack = request(
        &mut client,
        Frame::new(1001, session_id, 3, Body::KeyframeMark { seq: 4, timestamp: 1234 }),
    )
    .await;
    assert_eq!(ack.body, Body::KeyframeAck { seq: 4, status: STATUS_OK });

    // Upload, out of order, one chunk spilled.
    let parts: [(u32, &'static [u8]); 2] = [(2, b"second-part-on-disk"), (1, b"first")];
    for (seq, data) in parts {
        let ack = request(
            &mut client,
            Frame::new(1001, session_id, 3, Body::UploadChunk { seq, data: Bytes::from_static(data) }),
        )
        .await;
        assert_eq!(ack.body, Body::ChunkAck { seq, status: STATUS_OK });
    }
    let ack = request(&mut client, Frame::new(1001, session_id, 3, Body::UploadEnd { total_chunks: 2 })).await;
    let expected = device_link::utils::hash::hash_bytes(b"firstsecond-part-on-disk", Default::default());
    assert_eq!(
        ack.body,
        Body::UploadEndAck { chunk_count: 2, content_hash: Bytes::from(expected) }
    );

    // A corrupted frame is answered with a protocol error and the link survives.
    let mut raw = Frame::new(1001, session_id, 3, Body::Heartbeat { battery: 1, status: 1 })
        .to_bytes()
        .unwrap()
        .to_vec();
    raw[17] ^= 0xFF;
    client.get_mut().write_all(&raw).await.unwrap();
    let response = recv(&mut client).await.unwrap();
    assert_eq!(response.body, Body::ProtocolError);
    assert_eq!(response.device_id, 1001);

    let ack = request(
        &mut client,
        Frame::new(1001, session_id, 3, Body::Heartbeat { battery: 79, status: 1 }),
    )
    .await;
    assert!(matches!(ack.body, Body::HeartbeatAck { .. }));

    // Operator command reaches the device; its ack becomes an event.
    let service = running.service();
    assert!(service.start_recording(1001).await.success);
    let command = recv(&mut client).await.unwrap();
    assert_eq!(command.body, Body::StartRecording);
    assert_eq!(command.session_id, session_id);

    while events.try_recv().is_ok() {}
    client
        .send(Frame::new(1001, session_id, 3, Body::StartRecordingAck { status: 1 }))
        .await
        .unwrap();
    let event = tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::StartRecording { status: 1 });

    // Forced disconnect: the command is flushed, then the stream ends.
    assert!(service.force_disconnect(1001).await.success);
    let last = recv(&mut client).await.unwrap();
    assert_eq!(last.body, Body::ForceDisconnect);
    assert!(recv(&mut client).await.is_none());
    assert!(service.connected_devices().is_empty());

    let metrics = running.server.state().metrics.snapshot();
    assert_eq!(metrics.protocol_errors, 1);
    assert_eq!(metrics.uploads_completed, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_client_close_cleans_up_session() {
    let running = Running::start(|_| {}).await;
    let mut events = running.server.state().events.subscribe();

    let mut client = connect(running.addr).await.unwrap();
    let session_id = register(&mut client, 2002).await;
    client
        .send(Frame::new(2002, session_id, 1, Body::UploadChunk { seq: 1, data: Bytes::from_static(b"left-behind-chunk") }))
        .await
        .unwrap();
    recv(&mut client).await.unwrap();
    drop(client);

    let state = running.server.state().clone();
    let disconnected = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches!(event.kind, EventKind::DeviceDisconnected { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("disconnect event");

    assert_eq!(disconnected.device_id, 2002);
    assert!(state.sessions.get(2002).is_none());
    assert!(!state.connections.is_connected(2002));
    assert_eq!(state.uploads.pending_uploads(), 0);
    assert!(!state.uploads.temp_path(2002, 1, 1).exists());

    running.stop().await;
}

#[tokio::test]
async fn test_server_heartbeat_broadcast() {
    let running = Running::start(|c| {
        c.server.heartbeat_enabled = true;
        c.server.heartbeat_interval = Duration::from_millis(50);
    })
    .await;

    let mut client = connect(running.addr).await.unwrap();
    let session_id = register(&mut client, 3003).await;

    let heartbeat = recv(&mut client).await.unwrap();
    assert_eq!(heartbeat.body, Body::ServerHeartbeat);
    assert_eq!(heartbeat.device_id, 3003);
    assert_eq!(heartbeat.session_id, session_id);

    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let running = Running::start(|_| {}).await;
    let mut client = connect(running.addr).await.unwrap();
    register(&mut client, 4004).await;

    let state = running.server.state().clone();
    running.stop().await;

    assert!(recv(&mut client).await.is_none());
    assert_eq!(state.metrics.snapshot().connections_active, 0);
}
