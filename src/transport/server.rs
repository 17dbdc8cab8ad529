//! # Device TCP Server
//!
//! Accept loop, per-connection task and graceful shutdown.
//!
//! ## Connection task
//! Reads frames through [`FrameCodec`], hands them to the [`Dispatcher`] and
//! writes responses back. The same task drains the connection's outbound
//! queue, so operator commands and heartbeats are serialized with responses.
//! Closing the connection's token flushes whatever is still queued and ends
//! the task.
//!
//! ## Shutdown
//! The shutdown signal cancels the sweeper and heartbeat tasks and every
//! connection token, then waits up to `shutdown_timeout` for connection
//! tasks to finish.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::LinkConfig;
use crate::core::codec::{Decoded, FrameCodec};
use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::ConnectionHandle;
use crate::protocol::dispatcher::{ConnectionContext, Dispatcher};
use crate::protocol::sweeper::{HeartbeatBroadcaster, SessionSweeper};
use crate::protocol::LinkState;
use crate::service::commands::DeviceService;
use crate::utils::metrics::Metrics;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Device link server
#[derive(Debug, Clone)]
pub struct Server {
    state: LinkState,
    dispatcher: Dispatcher,
}

impl Server {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_state(LinkState::new(config))
    }

    pub fn with_state(state: LinkState) -> Self {
        Self {
            dispatcher: Dispatcher::new(state.clone()),
            state,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Operator command service bound to this server's state
    pub fn device_service(&self) -> DeviceService {
        DeviceService::new(self.state.clone())
    }

    /// Bind the configured address and serve until CTRL+C
    #[instrument(skip(self), fields(address = %self.state.config.server.address))]
    pub async fn run(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx_clone.send(()).await;
            }
        });

        let listener = TcpListener::bind(&self.state.config.server.address).await?;
        self.run_with_shutdown(listener, shutdown_rx).await
    }

    /// Serve on `listener` until `shutdown_rx` fires or all its senders drop
    pub async fn run_with_shutdown(
        &self,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening for device connections");

        let tasks = CancellationToken::new();
        self.spawn_background(&tasks);

        let max_connections = self.state.config.server.max_connections as u64;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server. Waiting for connections to close...");
                    tasks.cancel();
                    self.drain(self.state.config.server.shutdown_timeout).await;
                    self.state.metrics.log_metrics();
                    return Ok(());
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let active = self.state.metrics.connections_active.load(Ordering::Relaxed);
                            if active >= max_connections {
                                warn!(peer = %peer, active, "Connection limit reached, refusing device");
                                drop(stream);
                            } else {
                                self.state.metrics.connection_established();
                                tokio::spawn(serve_connection(
                                    self.dispatcher.clone(),
                                    stream,
                                    peer,
                                    tasks.child_token(),
                                ));
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }

    fn spawn_background(&self, tasks: &CancellationToken) {
        let session = &self.state.config.session;
        if session.sweep_enabled {
            let sweeper = SessionSweeper::new(self.state.clone());
            tokio::spawn(sweeper.run(session.sweep_interval(), tasks.child_token()));
        }

        let server = &self.state.config.server;
        if server.heartbeat_enabled {
            let broadcaster = HeartbeatBroadcaster::new(self.state.clone());
            tokio::spawn(broadcaster.run(server.heartbeat_interval, tasks.child_token()));
        }
    }

    async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    let connections = self.state.metrics.connections_active.load(Ordering::Relaxed);
                    debug!(connections, "Waiting for connections to close");
                    if connections == 0 {
                        info!("All connections closed, shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[instrument(skip_all, fields(peer = %peer))]
async fn serve_connection(
    dispatcher: Dispatcher,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let state = dispatcher.state().clone();
    let codec = FrameCodec::with_resync(state.config.codec.resync);

    let (tx, mut rx) = mpsc::channel(state.config.server.outbound_queue.max(1));
    let handle = ConnectionHandle::new(state.connections.allocate_id(), peer, tx, shutdown.clone());
    let mut ctx = ConnectionContext::new(handle);
    info!(connection = %ctx.id(), "Device connection accepted");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec);
    let mut writer = FramedWrite::new(write_half, codec);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if write_frame(&mut writer, &state.metrics, frame).await.is_err() {
                        break;
                    }
                }
                debug!("Connection close requested");
                break;
            }

            Some(frame) = rx.recv() => {
                if let Err(e) = write_frame(&mut writer, &state.metrics, frame).await {
                    dispatcher.handle_transport_error(&ctx, &e);
                    break;
                }
            }

            inbound = reader.next() => {
                let response = match inbound {
                    Some(Ok(Decoded::Frame(frame))) => {
                        state.metrics.frame_received(frame.encoded_len() as u64);
                        dispatcher.handle_frame(&mut ctx, frame).await
                    }
                    Some(Ok(Decoded::Rejected(error))) => {
                        Some(dispatcher.handle_rejected(&ctx, &error))
                    }
                    Some(Err(e)) => {
                        dispatcher.handle_transport_error(&ctx, &e);
                        break;
                    }
                    None => {
                        debug!("Peer closed connection");
                        break;
                    }
                };

                if let Some(response) = response {
                    if let Err(e) = write_frame(&mut writer, &state.metrics, response).await {
                        dispatcher.handle_transport_error(&ctx, &e);
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = writer.close().await {
        debug!(error = %e, "Error closing write half");
    }
    dispatcher.handle_disconnect(&mut ctx).await;
    state.metrics.connection_closed();
    info!(connection = %ctx.id(), "Device connection closed");
}

/// Encode and flush one frame. An unencodable frame is logged and dropped;
/// only I/O failures are returned.
async fn write_frame(
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    metrics: &Metrics,
    frame: Frame,
) -> Result<()> {
    let len = frame.encoded_len() as u64;
    let command = frame.command();
    match writer.send(frame).await {
        Ok(()) => {
            metrics.frame_sent(len);
            Ok(())
        }
        Err(ProtocolError::OversizedFrame(size)) => {
            error!(?command, size, "Dropping oversized outbound frame");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Open a device-side connection to a running server
#[instrument(skip(addr))]
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Framed<TcpStream, FrameCodec>> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Framed::new(stream, FrameCodec::new()))
}
