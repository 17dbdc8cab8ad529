//! # Protocol Layer
//!
//! Device session state machine and the shared state it drives.
//!
//! ## Components
//! - **Session**: `device_id -> DeviceSession` registry with expiry predicate
//! - **Connection**: `device_id <-> ConnectionHandle` bindings
//! - **Upload**: chunk cache and artifact merge
//! - **Events**: broadcast topic of domain events
//! - **Dispatcher**: per-connection frame handling
//! - **Sweeper**: periodic session eviction and server heartbeats
//!
//! All shared state lives in one [`LinkState`] that is constructed once by the
//! server and cloned (cheaply, by `Arc`) into every task that needs it.

pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod session;
pub mod sweeper;
pub mod upload;

use std::sync::Arc;

use crate::config::LinkConfig;
use crate::utils::metrics::Metrics;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use dispatcher::{ConnectionContext, Dispatcher};
pub use events::{DeviceEvent, EventBus, EventKind};
pub use session::{DeviceSession, SessionRegistry, SessionStatus};
pub use sweeper::{HeartbeatBroadcaster, SessionSweeper};
pub use upload::{ChunkTier, FileSaveResult, UploadManager};

/// Shared engine state owned by the server process
#[derive(Debug, Clone)]
pub struct LinkState {
    pub config: Arc<LinkConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub uploads: Arc<UploadManager>,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
}

impl LinkState {
    pub fn new(config: LinkConfig) -> Self {
        let uploads = UploadManager::new(&config.upload);
        Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionRegistry::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            uploads: Arc::new(uploads),
            events: EventBus::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }
}
