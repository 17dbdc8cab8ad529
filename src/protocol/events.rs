//! # Device Events
//!
//! Typed domain events published by the dispatcher and the sweeper.
//!
//! [`EventBus`] is a `tokio::sync::broadcast` topic. Publishing never blocks
//! and never fails the caller: with no subscribers the event is dropped, and
//! a subscriber that falls behind skips ahead instead of stalling producers.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

use crate::utils::time::now_millis;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Event-specific data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    DeviceConnected {
        session_id: u16,
        remote_address: String,
    },
    DeviceDisconnected {
        remote_address: String,
    },
    Heartbeat {
        battery: u8,
        status: u8,
    },
    KeyframeMark {
        seq: u32,
        frame_timestamp: u64,
    },
    /// Device acknowledged a bind or unbind command
    DeviceBind {
        status: u16,
    },
    StartRecording {
        status: u16,
    },
    StopRecording {
        status: u16,
    },
    FileUploadComplete {
        success: bool,
        total_chunks: u32,
        expected_chunks: u32,
        file_name: Option<String>,
        content_hash: String,
    },
    SessionExpired {
        last_active_time: u64,
    },
    DeviceError {
        error: String,
        remote_address: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::DeviceConnected { .. } => "DEVICE_CONNECTED",
            EventKind::DeviceDisconnected { .. } => "DEVICE_DISCONNECTED",
            EventKind::Heartbeat { .. } => "HEARTBEAT",
            EventKind::KeyframeMark { .. } => "KEYFRAME_MARK",
            EventKind::DeviceBind { .. } => "DEVICE_BIND",
            EventKind::StartRecording { .. } => "START_RECORDING",
            EventKind::StopRecording { .. } => "STOP_RECORDING",
            EventKind::FileUploadComplete { .. } => "FILE_UPLOAD_COMPLETE",
            EventKind::SessionExpired { .. } => "SESSION_EXPIRED",
            EventKind::DeviceError { .. } => "DEVICE_ERROR",
        }
    }
}

/// One published event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEvent {
    pub device_id: u32,
    pub task_id: u32,
    /// Unix milliseconds at publication
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DeviceEvent {
    pub fn new(device_id: u32, task_id: u32, kind: EventKind) -> Self {
        Self {
            device_id,
            task_id,
            timestamp: now_millis(),
            kind,
        }
    }
}

/// Broadcast topic for [`DeviceEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeviceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber, returning how many received it
    pub fn publish(&self, event: DeviceEvent) -> usize {
        let kind = event.kind.name();
        let device_id = event.device_id;
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(event = kind, device_id, receivers, "Event published");
                receivers
            }
            Err(_) => {
                trace!(event = kind, device_id, "Event dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`; lagged gaps are logged and skipped
    pub fn stream(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(error = %err, "Event subscriber lagged");
                None
            }
        })
    }
}
