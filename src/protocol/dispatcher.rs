//! # Connection Dispatcher
//!
//! Consumes decoded frames for one connection, drives the registries and the
//! upload engine, publishes events and produces the response frame.
//!
//! ```text
//! Connected --connection request--> Registered --transport close--> Closed
//! ```
//!
//! Responses echo the inbound prefix (`device_id`, `session_id`, `task_id`),
//! except the connection ack which carries the newly assigned session id.
//! Frames from a device that never registered are still served; activity on
//! them simply has no session to touch.

use std::collections::HashSet;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use crate::core::frame::{Body, Frame, STATUS_FAILED, STATUS_OK};
use crate::error::ProtocolError;
use crate::protocol::connection::{ConnectionHandle, ConnectionId};
use crate::protocol::events::{DeviceEvent, EventKind};
use crate::protocol::session::SessionStatus;
use crate::protocol::upload::{ChunkTier, UploadKey};
use crate::protocol::LinkState;
use crate::utils::time::now_millis;

/// Per-connection state owned by the connection task
#[derive(Debug)]
pub struct ConnectionContext {
    handle: ConnectionHandle,
    device_id: Option<u32>,
    uploads: HashSet<UploadKey>,
    closed: bool,
}

impl ConnectionContext {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            device_id: None,
            uploads: HashSet::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.handle.peer()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Device registered on this connection, if any
    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    /// Uploads started on this connection and not yet finished
    pub fn open_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Frame handler shared by all connection tasks
#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: LinkState,
}

impl Dispatcher {
    pub fn new(state: LinkState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Handle one decoded frame, returning the response to send, if any.
    pub async fn handle_frame(&self, ctx: &mut ConnectionContext, frame: Frame) -> Option<Frame> {
        if ctx.closed {
            debug!(connection = %ctx.id(), "Ignoring frame on closed connection");
            return None;
        }

        let Frame {
            device_id,
            session_id,
            task_id,
            body,
            ..
        } = frame;

        match body {
            Body::ConnectionRequest => Some(self.on_connection_request(ctx, device_id, task_id)),

            Body::Heartbeat { battery, status } => {
                self.state.sessions.touch(device_id, task_id);
                debug!(device_id, battery, status, "Heartbeat");
                self.publish(device_id, task_id, EventKind::Heartbeat { battery, status });
                Some(Frame::new(
                    device_id,
                    session_id,
                    task_id,
                    Body::HeartbeatAck {
                        server_time: now_millis(),
                    },
                ))
            }

            Body::KeyframeMark { seq, timestamp } => {
                self.state.sessions.touch(device_id, task_id);
                info!(device_id, task_id, seq, timestamp, "Keyframe mark");
                self.publish(
                    device_id,
                    task_id,
                    EventKind::KeyframeMark {
                        seq,
                        frame_timestamp: timestamp,
                    },
                );
                Some(Frame::new(
                    device_id,
                    session_id,
                    task_id,
                    Body::KeyframeAck {
                        seq,
                        status: STATUS_OK,
                    },
                ))
            }

            Body::UploadChunk { seq, data } => {
                let status = self.on_upload_chunk(ctx, device_id, task_id, seq, data).await;
                Some(Frame::new(
                    device_id,
                    session_id,
                    task_id,
                    Body::ChunkAck { seq, status },
                ))
            }

            Body::UploadEnd { total_chunks } => {
                let body = self.on_upload_end(ctx, device_id, task_id, total_chunks).await;
                Some(Frame::new(device_id, session_id, task_id, body))
            }

            Body::BindAck { status } => {
                info!(device_id, task_id, status, "Bind/unbind acknowledged");
                self.publish(device_id, task_id, EventKind::DeviceBind { status });
                None
            }

            Body::StartRecordingAck { status } => {
                info!(device_id, task_id, status, "Start recording acknowledged");
                self.publish(device_id, task_id, EventKind::StartRecording { status });
                None
            }

            Body::StopRecordingAck { status } => {
                info!(device_id, task_id, status, "Stop recording acknowledged");
                self.publish(device_id, task_id, EventKind::StopRecording { status });
                None
            }

            other => {
                warn!(
                    device_id,
                    command = format_args!("0x{:02X}", other.command().code()),
                    "Ignoring server-side command sent by device"
                );
                None
            }
        }
    }

    fn on_connection_request(&self, ctx: &mut ConnectionContext, device_id: u32, task_id: u32) -> Frame {
        let session = self.state.sessions.create(device_id);

        if let Some(previous) = self.state.connections.bind(device_id, ctx.handle.clone()) {
            if previous.id() != ctx.id() {
                info!(
                    device_id,
                    old_connection = %previous.id(),
                    new_connection = %ctx.id(),
                    "Device reconnected, closing previous connection"
                );
                previous.close();
            }
        }
        ctx.device_id = Some(device_id);

        info!(device_id, session_id = session.session_id, peer = %ctx.peer(), "Device connected");
        self.publish(
            device_id,
            task_id,
            EventKind::DeviceConnected {
                session_id: session.session_id,
                remote_address: ctx.peer().to_string(),
            },
        );

        Frame::new(
            device_id,
            session.session_id,
            task_id,
            Body::ConnectionAck {
                server_time: now_millis(),
            },
        )
    }

    async fn on_upload_chunk(
        &self,
        ctx: &mut ConnectionContext,
        device_id: u32,
        task_id: u32,
        seq: u32,
        data: Bytes,
    ) -> u8 {
        self.state.sessions.touch(device_id, task_id);
        ctx.uploads.insert((device_id, task_id));

        match self.state.uploads.cache_chunk(device_id, task_id, seq, data).await {
            Ok(ChunkTier::Memory) => {
                self.state.metrics.chunk_in_memory();
                STATUS_OK
            }
            Ok(ChunkTier::Disk) => {
                self.state.metrics.chunk_on_disk();
                STATUS_OK
            }
            Err(e) => {
                error!(device_id, task_id, seq, error = %e, "Dropping upload chunk");
                self.state.metrics.chunk_failed();
                STATUS_FAILED
            }
        }
    }

    async fn on_upload_end(
        &self,
        ctx: &mut ConnectionContext,
        device_id: u32,
        task_id: u32,
        total_chunks: u32,
    ) -> Body {
        self.state.sessions.touch(device_id, task_id);
        ctx.uploads.remove(&(device_id, task_id));

        let result = match self.state.uploads.finish(device_id, task_id, total_chunks).await {
            Ok(result) => result,
            Err(e) => {
                error!(device_id, task_id, error = %e, "Upload merge failed");
                self.state.metrics.upload_failed();
                self.publish(
                    device_id,
                    task_id,
                    EventKind::FileUploadComplete {
                        success: false,
                        total_chunks: 0,
                        expected_chunks: total_chunks,
                        file_name: None,
                        content_hash: String::new(),
                    },
                );
                return Body::UploadEndAck {
                    chunk_count: 0,
                    content_hash: Bytes::new(),
                };
            }
        };

        if result.success {
            self.state.metrics.upload_completed();
        }
        let file_name = result.file_name();
        info!(
            device_id,
            task_id,
            chunks = result.chunk_count,
            expected = total_chunks,
            file = file_name.as_deref().unwrap_or("-"),
            "Upload finished"
        );
        self.publish(
            device_id,
            task_id,
            EventKind::FileUploadComplete {
                success: result.success,
                total_chunks: result.chunk_count,
                expected_chunks: total_chunks,
                file_name,
                content_hash: result.content_hash_hex(),
            },
        );

        Body::UploadEndAck {
            chunk_count: result.chunk_count,
            content_hash: Bytes::from(result.content_hash),
        }
    }

    /// Build the protocol-error response for an input the decoder rejected
    pub fn handle_rejected(&self, ctx: &ConnectionContext, error: &ProtocolError) -> Frame {
        self.state.metrics.protocol_error();
        let device_id = ctx.device_id.unwrap_or(0);
        warn!(connection = %ctx.id(), device_id, error = %error, "Answering with protocol error");
        Frame::new(
            device_id,
            self.state.sessions.session_id(device_id),
            0,
            Body::ProtocolError,
        )
    }

    /// Transport failed: mark the session inactive and report it. The caller
    /// closes the connection and runs [`Dispatcher::handle_disconnect`].
    pub fn handle_transport_error(&self, ctx: &ConnectionContext, error: &ProtocolError) {
        self.state.metrics.connection_error();
        let Some(device_id) = self.state.connections.lookup_by_connection(ctx.id()) else {
            warn!(connection = %ctx.id(), peer = %ctx.peer(), error = %error, "Transport error on unregistered connection");
            return;
        };

        error!(device_id, peer = %ctx.peer(), error = %error, "Transport error");
        self.state.sessions.set_status(device_id, SessionStatus::Inactive);
        let task_id = self
            .state
            .sessions
            .get(device_id)
            .map(|session| session.task_id)
            .unwrap_or(0);
        self.publish(
            device_id,
            task_id,
            EventKind::DeviceError {
                error: error.to_string(),
                remote_address: ctx.peer().to_string(),
            },
        );
    }

    /// Transport closed: unbind, abandon open uploads, close and remove the
    /// session. Idempotent.
    ///
    /// Uploads of a device that has since re-registered on another connection
    /// are left for that connection to finish.
    #[instrument(skip_all, fields(connection = %ctx.id(), peer = %ctx.peer()))]
    pub async fn handle_disconnect(&self, ctx: &mut ConnectionContext) {
        if ctx.closed {
            return;
        }
        ctx.closed = true;
        ctx.handle.close();

        let bound = self.state.connections.unbind_connection(ctx.id());

        for (device_id, task_id) in ctx.uploads.drain() {
            if self.state.connections.is_connected(device_id) {
                debug!(device_id, task_id, "Upload taken over by a newer connection");
                continue;
            }
            if self.state.uploads.abandon(device_id, task_id).await > 0 {
                self.state.metrics.upload_abandoned();
            }
        }

        let Some(device_id) = bound else {
            debug!("Connection closed without a device binding");
            return;
        };

        self.state.sessions.set_status(device_id, SessionStatus::Closed);
        let task_id = self
            .state
            .sessions
            .remove(device_id)
            .map(|session| session.task_id)
            .unwrap_or(0);

        info!(device_id, "Device disconnected");
        self.publish(
            device_id,
            task_id,
            EventKind::DeviceDisconnected {
                remote_address: ctx.peer().to_string(),
            },
        );
    }

    fn publish(&self, device_id: u32, task_id: u32, kind: EventKind) {
        self.state
            .events
            .publish(DeviceEvent::new(device_id, task_id, kind));
    }
}
