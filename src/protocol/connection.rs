//! # Connection Registry
//!
//! Maps a device id to the live transport connection serving it. The registry
//! is the single source of truth for "is this device connected" and for the
//! reverse lookup a closing connection needs to find its device.
//!
//! A [`ConnectionHandle`] is what the rest of the engine holds on to: it can
//! queue outbound frames and ask the owning connection task to close, without
//! touching the socket directly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};

/// Process-unique identifier of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cloneable handle to a connection task
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            outbound,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection task is still running and accepting frames
    pub fn is_active(&self) -> bool {
        !self.outbound.is_closed() && !self.shutdown.is_cancelled()
    }

    /// Queue a frame, waiting for queue space
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue a frame without waiting; fails when the queue is full or closed
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ProtocolError::Custom(format!("Outbound queue full for {}", self.id))
            }
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    /// Ask the connection task to flush queued frames and close
    pub fn close(&self) {
        trace!(connection = %self.id, peer = %self.peer, "Close requested");
        self.shutdown.cancel();
    }
}

/// Concurrent `device_id <-> connection` binding table
#[derive(Debug)]
pub struct ConnectionRegistry {
    bindings: DashMap<u32, ConnectionHandle>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a newly accepted connection
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind `device_id` to `handle`, returning the handle it replaced
    pub fn bind(&self, device_id: u32, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        debug!(device_id, connection = %handle.id(), peer = %handle.peer(), "Device bound");
        self.bindings.insert(device_id, handle)
    }

    pub fn lookup_by_device(&self, device_id: u32) -> Option<ConnectionHandle> {
        self.bindings
            .get(&device_id)
            .map(|entry| entry.value().clone())
    }

    /// Reverse lookup. Scans the table; binding count equals live connections.
    pub fn lookup_by_connection(&self, id: ConnectionId) -> Option<u32> {
        self.bindings
            .iter()
            .find(|entry| entry.value().id() == id)
            .map(|entry| *entry.key())
    }

    pub fn unbind(&self, device_id: u32) -> Option<ConnectionHandle> {
        let removed = self.bindings.remove(&device_id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(device_id, "Device unbound");
        }
        removed
    }

    /// Remove whichever binding points at connection `id`.
    ///
    /// A device that has since been rebound to another connection is left alone.
    pub fn unbind_connection(&self, id: ConnectionId) -> Option<u32> {
        let device_id = self.lookup_by_connection(id)?;
        self.unbind_if(device_id, id).then_some(device_id)
    }

    /// Remove the binding of `device_id` only if it still points at `id`
    pub fn unbind_if(&self, device_id: u32, id: ConnectionId) -> bool {
        let removed = self
            .bindings
            .remove_if(&device_id, |_, handle| handle.id() == id)
            .is_some();
        if removed {
            debug!(device_id, connection = %id, "Device unbound from connection");
        }
        removed
    }

    pub fn is_connected(&self, device_id: u32) -> bool {
        self.bindings
            .get(&device_id)
            .map(|entry| entry.is_active())
            .unwrap_or(false)
    }

    /// Snapshot of all bindings
    pub fn handles(&self) -> Vec<(u32, ConnectionHandle)> {
        self.bindings
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.bindings.len()
    }
}
