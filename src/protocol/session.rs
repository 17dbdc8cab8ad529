//! # Device Session Registry
//!
//! Per-device session state, independent of the transport.
//!
//! ## Features
//! - **Concurrent**: sharded `DashMap`, safe under calls from every connection task
//! - **One session per device**: creating a session replaces the previous one
//! - **Cheap ids**: `(device_id ^ counter) & 0xFFFF`, collision tolerant, not a secret
//!
//! ## Expiry
//! A session is expired when its status is [`SessionStatus::Closed`] or it has
//! been idle longer than the configured timeout. Idle time is measured from
//! `last_active_at`, falling back to `created_at`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::utils::time::is_older_than;

/// Lifecycle status of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Registered, or the transport reported an error
    Inactive,
    /// Seen an activity-bearing frame
    Active,
    /// Transport closed or forcibly disconnected
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Inactive => "INACTIVE",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Closed => "CLOSED",
        }
    }
}

/// Server-side record of one registered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub device_id: u32,
    pub session_id: u16,
    /// Last task seen on an activity-bearing frame
    pub task_id: u32,
    pub created_at: SystemTime,
    pub last_active_at: Option<SystemTime>,
    pub status: SessionStatus,
}

impl DeviceSession {
    fn new(device_id: u32, session_id: u16, now: SystemTime) -> Self {
        Self {
            device_id,
            session_id,
            task_id: 0,
            created_at: now,
            last_active_at: Some(now),
            status: SessionStatus::Inactive,
        }
    }

    /// Timestamp idle time is measured from
    pub fn last_seen(&self) -> SystemTime {
        self.last_active_at.unwrap_or(self.created_at)
    }

    /// Expiry predicate evaluated against `now`
    pub fn is_expired_at(&self, timeout: Duration, now: SystemTime) -> bool {
        self.status == SessionStatus::Closed || is_older_than(self.last_seen(), timeout, now)
    }
}

/// Concurrent map of `device_id -> DeviceSession`
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<u32, DeviceSession>,
    id_counter: AtomicU32,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            id_counter: AtomicU32::new(1),
        }
    }

    /// Create a session for `device_id`, replacing any existing one.
    pub fn create(&self, device_id: u32) -> DeviceSession {
        let session_id = self.next_session_id(device_id);
        let session = DeviceSession::new(device_id, session_id, SystemTime::now());

        if let Some(previous) = self.sessions.insert(device_id, session.clone()) {
            warn!(
                device_id,
                old_session_id = previous.session_id,
                new_session_id = session_id,
                "Replacing existing device session"
            );
        } else {
            debug!(device_id, session_id, "Device session created");
        }
        session
    }

    fn next_session_id(&self, device_id: u32) -> u16 {
        let counter = self.id_counter.fetch_add(1, Ordering::Relaxed);
        ((device_id ^ counter) & 0xFFFF) as u16
    }

    pub fn get(&self, device_id: u32) -> Option<DeviceSession> {
        self.sessions.get(&device_id).map(|entry| entry.value().clone())
    }

    /// Session id for outbound frames, `0` when the device is not registered
    pub fn session_id(&self, device_id: u32) -> u16 {
        self.sessions
            .get(&device_id)
            .map(|entry| entry.session_id)
            .unwrap_or(0)
    }

    pub fn remove(&self, device_id: u32) -> Option<DeviceSession> {
        let removed = self.sessions.remove(&device_id).map(|(_, session)| session);
        if removed.is_some() {
            debug!(device_id, "Device session removed");
        }
        removed
    }

    /// Remove the session only if it is still expired at `now`.
    ///
    /// Guards against evicting a device that re-registered between the
    /// sweeper's scan and its removal.
    pub fn remove_if_expired(
        &self,
        device_id: u32,
        timeout: Duration,
        now: SystemTime,
    ) -> Option<DeviceSession> {
        self.sessions
            .remove_if(&device_id, |_, session| session.is_expired_at(timeout, now))
            .map(|(_, session)| session)
    }

    /// Record activity: `last_active_at = now`, `task_id`, `status = Active`.
    ///
    /// Returns `false` when the device has no session.
    pub fn touch(&self, device_id: u32, task_id: u32) -> bool {
        match self.sessions.get_mut(&device_id) {
            Some(mut session) => {
                session.last_active_at = Some(SystemTime::now());
                session.task_id = task_id;
                session.status = SessionStatus::Active;
                trace!(device_id, task_id, "Session touched");
                true
            }
            None => {
                trace!(device_id, "Activity from unregistered device");
                false
            }
        }
    }

    /// Returns `false` when the device has no session.
    pub fn set_status(&self, device_id: u32, status: SessionStatus) -> bool {
        match self.sessions.get_mut(&device_id) {
            Some(mut session) => {
                session.status = status;
                true
            }
            None => false,
        }
    }

    pub fn list_all(&self) -> Vec<DeviceSession> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sessions satisfying the expiry predicate at `now`
    pub fn expired(&self, timeout: Duration, now: SystemTime) -> Vec<DeviceSession> {
        self.sessions
            .iter()
            .filter(|entry| entry.is_expired_at(timeout, now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn clear(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        debug!(cleared_count = count, "Session registry cleared");
    }
}
