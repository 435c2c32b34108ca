//! Channel sessions
//!
//! A session binds one logical device to one channel handle at a fixed baud
//! rate. Sessions are owned by [`SessionManager`]; the frame monitor only
//! sees the cancellation flag, the handle, the shared state cell and the
//! counters.

mod manager;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canmon_core::{BaudRate, ChannelHandle, LogicalDeviceId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub use manager::{Reconciliation, SessionManager, StartRequest};

/// Session lifecycle
///
/// ```text
/// Idle -> Initializing -> Active -> Stopping -> Idle
///              |             |          ^
///              v             v          |
///             Idle        Faulted ------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Initializing,
    Active,
    /// Monitor gave up after repeated read errors; the channel is still
    /// initialized until the session is stopped
    Faulted,
    Stopping,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Active)
                | (Initializing, Idle)
                | (Active, Stopping)
                | (Active, Faulted)
                | (Faulted, Stopping)
                | (Stopping, Idle)
        )
    }

    /// Whether `stop` applies to a session in this state
    pub fn is_stoppable(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Faulted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Faulted => "faulted",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Lifecycle state shared between the manager and a session's monitor
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    device: LogicalDeviceId,
    handle: ChannelHandle,
    state: Arc<RwLock<SessionState>>,
}

impl StateCell {
    pub(crate) fn new(device: LogicalDeviceId, handle: ChannelHandle) -> Self {
        Self {
            device,
            handle,
            state: Arc::new(RwLock::new(SessionState::Idle)),
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.state.read()
    }

    /// Apply `next` if the lifecycle allows it; returns whether it did
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            warn!(
                device = %self.device,
                handle = %self.handle,
                from = %current,
                to = %next,
                "Rejected session state transition"
            );
            return false;
        }
        *state = next;
        info!(device = %self.device, handle = %self.handle, from = %current, to = %next, "Session state changed");
        true
    }

    /// Move from `expected` to `next`; does nothing if the state moved on
    /// in the meantime
    pub(crate) fn transition_from(&self, expected: SessionState, next: SessionState) -> bool {
        let mut state = self.state.write();
        if *state != expected || !expected.can_transition_to(next) {
            return false;
        }
        *state = next;
        info!(device = %self.device, handle = %self.handle, from = %expected, to = %next, "Session state changed");
        true
    }
}

/// Per-session traffic counters
#[derive(Debug, Default)]
pub struct MonitorCounters {
    received: AtomicU64,
    sent: AtomicU64,
    write_failures: AtomicU64,
    read_errors: AtomicU64,
}

impl MonitorCounters {
    /// Count one received frame and return the new total
    pub(crate) fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MonitorCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub sent: u64,
    pub write_failures: u64,
    pub read_errors: u64,
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub device: LogicalDeviceId,
    pub handle: ChannelHandle,
    pub baud: BaudRate,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub counters: CounterSnapshot,
}
