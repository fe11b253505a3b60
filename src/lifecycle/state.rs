//! Session state owned by the lifecycle controller.
//!
//! ```text
//! ┌──────────────┐ connect ┌────────────┐ socket up ┌────────────────┐ success ┌───────────┐
//! │ Disconnected │────────>│ Connecting │──────────>│ Authenticating │────────>│ Connected │
//! └──────────────┘         └────────────┘           └────────────────┘         └───────────┘
//!        ^                                                                           │
//!        └──────────────────── stream error / transport failure ─────────────────────┘
//! ```
//!
//! All fields are safe to touch from concurrent handlers and background
//! tasks; repeated writes of the same value are harmless.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// Lifecycle phase of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// No connection.
    Disconnected,
    /// Opening the socket / running the handshake.
    Connecting,
    /// Socket open, waiting for success or failure.
    Authenticating,
    /// Authenticated.
    Connected,
}

/// What the reconnection scheduler should do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnect per the usual backoff policy.
    AutoReconnect,
    /// The disconnect was expected; do not reconnect.
    Suppressed,
}

/// Session state.
#[derive(Debug)]
pub struct SessionState {
    logged_in: AtomicBool,
    expect_disconnect: AtomicBool,
    auto_reconnect_errors: AtomicU32,
    last_successful_connect: Mutex<Option<SystemTime>>,
    phase: Mutex<LifecyclePhase>,
}

impl SessionState {
    /// Fresh, disconnected state.
    pub fn new() -> Self {
        Self {
            logged_in: AtomicBool::new(false),
            expect_disconnect: AtomicBool::new(false),
            auto_reconnect_errors: AtomicU32::new(0),
            last_successful_connect: Mutex::new(None),
            phase: Mutex::new(LifecyclePhase::Disconnected),
        }
    }

    /// Whether the session is authenticated.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Whether the next disconnect is expected.
    pub fn is_disconnect_expected(&self) -> bool {
        self.expect_disconnect.load(Ordering::Acquire)
    }

    /// Number of consecutive failed auto-reconnect attempts.
    pub fn auto_reconnect_errors(&self) -> u32 {
        self.auto_reconnect_errors.load(Ordering::Acquire)
    }

    /// Time of the last connect success.
    pub fn last_successful_connect(&self) -> Option<SystemTime> {
        *self
            .last_successful_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_phase(&self, phase: LifecyclePhase) {
        let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != phase {
            tracing::debug!("Lifecycle phase {:?} -> {:?}", *current, phase);
            *current = phase;
        }
    }

    pub(crate) fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Release);
    }

    /// Suppress auto-reconnect for the next disconnect.
    pub(crate) fn expect_disconnect(&self) {
        self.expect_disconnect.store(true, Ordering::Release);
    }

    /// Clear a pending expect-disconnect without consuming a disconnect.
    pub(crate) fn reset_expected_disconnect(&self) {
        self.expect_disconnect.store(false, Ordering::Release);
    }

    /// Consume the expect-disconnect flag.
    pub(crate) fn take_expected_disconnect(&self) -> bool {
        self.expect_disconnect.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn record_reconnect_failure(&self) -> u32 {
        self.auto_reconnect_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Mark the session authenticated at `now`.
    pub(crate) fn mark_connected(&self, now: SystemTime) {
        *self
            .last_successful_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.auto_reconnect_errors.store(0, Ordering::Release);
        self.set_logged_in(true);
        self.set_phase(LifecyclePhase::Connected);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
