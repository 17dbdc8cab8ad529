//! # Operator Commands
//!
//! The boundary an operator-facing API (HTTP, CLI, ...) calls into: list
//! connected devices and push server commands to a device by id.
//!
//! Every command returns a [`CommandResult`]; nothing here returns an error
//! to the caller. A binding whose connection is already gone is cleaned up
//! and reported as a failed command.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::frame::{Body, Frame};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::ConnectionHandle;
use crate::protocol::events::{DeviceEvent, EventKind};
use crate::protocol::session::SessionStatus;
use crate::protocol::LinkState;
use crate::utils::time::{now_millis, timestamp_millis};

/// Outcome of one operator command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            timestamp: now_millis(),
        }
    }
}

/// Snapshot of one registered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub session_id: u16,
    /// Peer address, `None` when no connection is bound
    pub remote_address: Option<String>,
    /// Unix milliseconds
    pub connected_time: u64,
    /// Unix milliseconds
    pub last_active_time: u64,
    pub task_id: u32,
    pub status: SessionStatus,
}

/// Operator command service over the shared engine state
#[derive(Debug, Clone)]
pub struct DeviceService {
    state: LinkState,
}

impl DeviceService {
    pub fn new(state: LinkState) -> Self {
        Self { state }
    }

    /// Every registered session, sorted by device id
    pub fn connected_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .state
            .sessions
            .list_all()
            .into_iter()
            .map(|session| DeviceInfo {
                device_id: session.device_id,
                session_id: session.session_id,
                remote_address: self
                    .state
                    .connections
                    .lookup_by_device(session.device_id)
                    .map(|handle| handle.peer().to_string()),
                connected_time: timestamp_millis(session.created_at),
                last_active_time: timestamp_millis(session.last_seen()),
                task_id: session.task_id,
                status: session.status,
            })
            .collect();
        devices.sort_by_key(|device| device.device_id);
        devices
    }

    pub async fn bind(&self, device_id: u32, task_id: u32) -> CommandResult {
        self.send_command(device_id, task_id, Body::DeviceBind).await
    }

    pub async fn unbind(&self, device_id: u32, task_id: u32) -> CommandResult {
        self.send_command(device_id, task_id, Body::DeviceUnbind).await
    }

    pub async fn start_recording(&self, device_id: u32) -> CommandResult {
        self.send_command(device_id, 0, Body::StartRecording).await
    }

    pub async fn stop_recording(&self, device_id: u32) -> CommandResult {
        self.send_command(device_id, 0, Body::StopRecording).await
    }

    /// Send the disconnect command, then close the connection and drop the
    /// device's binding and session. The disconnect event is published here
    /// since the connection's own teardown no longer finds a binding.
    pub async fn force_disconnect(&self, device_id: u32) -> CommandResult {
        let handle = match self.resolve(device_id) {
            Ok(handle) => handle,
            Err(e) => return self.reject(device_id, e),
        };

        let frame = self.command_frame(device_id, 0, Body::ForceDisconnect);
        if let Err(e) = handle.send(frame).await {
            debug!(device_id, error = %e, "Disconnect command not delivered");
        }
        handle.close();

        if !self.state.connections.unbind_if(device_id, handle.id()) {
            debug!(device_id, "Binding already released by connection teardown");
            return CommandResult::success(constants::MSG_DEVICE_DISCONNECTED);
        }
        self.state.sessions.set_status(device_id, SessionStatus::Closed);
        let task_id = self
            .state
            .sessions
            .remove(device_id)
            .map(|session| session.task_id)
            .unwrap_or(0);

        info!(device_id, peer = %handle.peer(), "Device forcibly disconnected");
        self.state.events.publish(DeviceEvent::new(
            device_id,
            task_id,
            EventKind::DeviceDisconnected {
                remote_address: handle.peer().to_string(),
            },
        ));
        CommandResult::success(constants::MSG_DEVICE_DISCONNECTED)
    }

    async fn send_command(&self, device_id: u32, task_id: u32, body: Body) -> CommandResult {
        let handle = match self.resolve(device_id) {
            Ok(handle) => handle,
            Err(e) => return self.reject(device_id, e),
        };

        let command = body.command();
        let frame = self.command_frame(device_id, task_id, body);
        match handle.send(frame).await {
            Ok(()) => {
                info!(device_id, task_id, ?command, "Command sent");
                CommandResult::success(constants::MSG_COMMAND_SENT)
            }
            Err(e) => {
                warn!(device_id, ?command, error = %e, "Command send failed");
                CommandResult::failure(format!("Command send failed: {e}"))
            }
        }
    }

    /// Find the live connection of `device_id`, dropping a stale binding
    fn resolve(&self, device_id: u32) -> Result<ConnectionHandle> {
        let handle = self
            .state
            .connections
            .lookup_by_device(device_id)
            .ok_or(ProtocolError::SessionNotFound(device_id))?;

        if !handle.is_active() {
            self.state.connections.unbind_if(device_id, handle.id());
            self.state.sessions.remove(device_id);
            return Err(ProtocolError::ConnectionInactive(device_id));
        }
        Ok(handle)
    }

    fn reject(&self, device_id: u32, error: ProtocolError) -> CommandResult {
        warn!(device_id, error = %error, "Command rejected");
        match error {
            ProtocolError::SessionNotFound(_) => {
                CommandResult::failure(constants::MSG_DEVICE_NOT_CONNECTED)
            }
            ProtocolError::ConnectionInactive(_) => {
                CommandResult::failure(constants::MSG_CONNECTION_INACTIVE)
            }
            other => CommandResult::failure(other.to_string()),
        }
    }

    fn command_frame(&self, device_id: u32, task_id: u32, body: Body) -> Frame {
        Frame::new(
            device_id,
            self.state.sessions.session_id(device_id),
            task_id,
            body,
        )
    }
}
