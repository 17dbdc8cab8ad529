//! # Periodic Tasks
//!
//! [`SessionSweeper`] evicts expired sessions; [`HeartbeatBroadcaster`]
//! pushes server heartbeat commands to every bound device.
//!
//! Both run on a `tokio::time::interval` with delayed missed ticks and do all
//! their work synchronously inside a tick, so two passes never overlap. Both
//! stop when their `CancellationToken` fires.

use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::frame::{Body, Frame};
use crate::protocol::connection::ConnectionHandle;
use crate::protocol::events::{DeviceEvent, EventKind};
use crate::protocol::LinkState;
use crate::utils::time::timestamp_millis;

/// Evicts sessions that are closed or idle past the timeout
#[derive(Debug, Clone)]
pub struct SessionSweeper {
    state: LinkState,
    timeout: Duration,
}

impl SessionSweeper {
    pub fn new(state: LinkState) -> Self {
        let timeout = state.config.session.timeout();
        Self { state, timeout }
    }

    pub fn with_timeout(state: LinkState, timeout: Duration) -> Self {
        Self { state, timeout }
    }

    /// One sweep pass evaluated at `now`; returns how many sessions were evicted
    pub fn sweep_at(&self, now: SystemTime) -> usize {
        let evicted = self
            .scan(now)
            .into_iter()
            .filter(|(device_id, bound)| self.evict(*device_id, bound.as_ref(), now))
            .count();

        if evicted > 0 {
            info!(
                evicted,
                remaining = self.state.sessions.count(),
                "Session sweep finished"
            );
        }
        evicted
    }

    /// Expired candidates paired with the connection bound to them right now
    fn scan(&self, now: SystemTime) -> Vec<(u32, Option<ConnectionHandle>)> {
        self.state
            .sessions
            .expired(self.timeout, now)
            .into_iter()
            .map(|session| {
                let bound = self.state.connections.lookup_by_device(session.device_id);
                (session.device_id, bound)
            })
            .collect()
    }

    /// Remove one candidate and release the connection seen by [`Self::scan`].
    ///
    /// Only that connection is unbound and closed; a device that re-registered
    /// in the meantime keeps its new binding.
    fn evict(&self, device_id: u32, bound: Option<&ConnectionHandle>, now: SystemTime) -> bool {
        // Re-checked under the map lock: the device may have re-registered.
        let Some(session) = self
            .state
            .sessions
            .remove_if_expired(device_id, self.timeout, now)
        else {
            return false;
        };

        if let Some(handle) = bound {
            self.state.connections.unbind_if(device_id, handle.id());
            if handle.is_active() {
                debug!(device_id, connection = %handle.id(), "Closing connection of expired session");
                handle.close();
            }
        }

        let last_active_time = timestamp_millis(session.last_seen());
        info!(
            device_id,
            session_id = session.session_id,
            status = session.status.as_str(),
            last_active_time,
            "Session expired"
        );
        self.state.metrics.session_expired();
        self.state.events.publish(DeviceEvent::new(
            device_id,
            session.task_id,
            EventKind::SessionExpired { last_active_time },
        ));
        true
    }

    /// Sweep every `period` until `cancel` fires
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(period_secs = period.as_secs(), timeout_secs = self.timeout.as_secs(), "Session sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_at(SystemTime::now());
                }
            }
        }
        debug!("Session sweeper stopped");
    }
}

/// Sends a server heartbeat command to every bound device
#[derive(Debug, Clone)]
pub struct HeartbeatBroadcaster {
    state: LinkState,
}

impl HeartbeatBroadcaster {
    pub fn new(state: LinkState) -> Self {
        Self { state }
    }

    /// Queue one heartbeat per bound connection; returns how many were queued
    pub fn broadcast_once(&self) -> usize {
        let mut sent = 0;
        for (device_id, handle) in self.state.connections.handles() {
            let (session_id, task_id) = self
                .state
                .sessions
                .get(device_id)
                .map(|session| (session.session_id, session.task_id))
                .unwrap_or((0, 0));
            let frame = Frame::new(device_id, session_id, task_id, Body::ServerHeartbeat);

            match handle.try_send(frame) {
                Ok(()) => sent += 1,
                Err(e) => warn!(device_id, error = %e, "Server heartbeat not queued"),
            }
        }
        debug!(sent, "Server heartbeat broadcast");
        sent
    }

    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(period_secs = period.as_secs(), "Heartbeat broadcaster started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.broadcast_once();
                }
            }
        }
        debug!("Heartbeat broadcaster stopped");
    }
}
