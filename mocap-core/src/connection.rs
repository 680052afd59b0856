//! Session state machine for the NatNet client.
//!
//! Pure state tracking with no I/O. The socket layer in `mocap-tracker`
//! drives the transitions and asks this module whether a keep-alive is due.
//!
//! ```text
//!   Idle ──start──▶ Connecting ──sockets open──▶ Streaming
//!    ▲                  │                            │
//!    │               failure                      stop()
//!    │                  ▼                            ▼
//!    └──────────────── Idle ◀──threads joined── Stopping
//! ```
//!
//! # Usage
//!
//! ```rust
//! use mocap_core::connection::{SessionManager, SessionState};
//!
//! let mut session = SessionManager::new();
//! session.start_connecting(0).unwrap();
//! session.streaming(10).unwrap();
//! assert_eq!(session.state(), SessionState::Streaming);
//!
//! session.stopping(20).unwrap();
//! session.stopped(30).unwrap();
//! assert_eq!(session.state(), SessionState::Idle);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// No sockets open
    #[default]
    Idle,
    /// Opening sockets and sending the handshake
    Connecting,
    /// Receive loops running
    Streaming,
    /// Stop requested, waiting for the receive loops to exit
    Stopping,
}

impl SessionState {
    /// Check if the receive loops are (or may be) running
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Stopping)
    }

    /// Check if requests can be sent to the server
    pub fn can_send(&self) -> bool {
        matches!(self, SessionState::Streaming)
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Streaming)
                | (Connecting, Idle)
                | (Streaming, Stopping)
                | (Stopping, Idle)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Streaming => write!(f, "Streaming"),
            SessionState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// An illegal state transition was requested
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid session transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

// =============================================================================
// Session Manager
// =============================================================================

/// Tracks session state plus the facts the client reports about the server.
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    state: SessionState,
    /// Timestamp of last state change (milliseconds since start)
    last_state_change_ms: u64,
    /// A SERVERINFO reply has been seen in this session
    server_info_received: bool,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Streaming and the server has introduced itself
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Streaming && self.server_info_received
    }

    pub fn server_info_received(&self) -> bool {
        self.server_info_received
    }

    /// Calculate time since last state change.
    pub fn time_in_state_ms(&self, current_time_ms: u64) -> u64 {
        current_time_ms.saturating_sub(self.last_state_change_ms)
    }

    // -------------------------------------------------------------------------
    // State Transitions
    // -------------------------------------------------------------------------

    pub fn start_connecting(&mut self, current_time_ms: u64) -> Result<(), TransitionError> {
        self.transition(SessionState::Connecting, current_time_ms)?;
        self.server_info_received = false;
        Ok(())
    }

    pub fn streaming(&mut self, current_time_ms: u64) -> Result<(), TransitionError> {
        self.transition(SessionState::Streaming, current_time_ms)
    }

    /// Socket setup failed, back to idle
    pub fn connect_failed(&mut self, current_time_ms: u64) -> Result<(), TransitionError> {
        if self.state != SessionState::Connecting {
            return Err(TransitionError {
                from: self.state,
                to: SessionState::Idle,
            });
        }
        self.transition(SessionState::Idle, current_time_ms)
    }

    pub fn stopping(&mut self, current_time_ms: u64) -> Result<(), TransitionError> {
        self.transition(SessionState::Stopping, current_time_ms)
    }

    pub fn stopped(&mut self, current_time_ms: u64) -> Result<(), TransitionError> {
        if self.state != SessionState::Stopping {
            return Err(TransitionError {
                from: self.state,
                to: SessionState::Idle,
            });
        }
        self.transition(SessionState::Idle, current_time_ms)?;
        self.server_info_received = false;
        Ok(())
    }

    /// Record that the server answered with SERVERINFO
    pub fn server_info(&mut self) {
        if self.state.is_active() {
            self.server_info_received = true;
        }
    }

    fn transition(
        &mut self,
        next: SessionState,
        current_time_ms: u64,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_state_change_ms = current_time_ms;
        Ok(())
    }
}

// =============================================================================
// Keep-Alive Timer
// =============================================================================

/// Decides when the next KEEPALIVE is due on a unicast session.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveTimer {
    interval_ms: u64,
    last_sent_ms: Option<u64>,
}

impl KeepAliveTimer {
    pub fn new(interval_ms: u64) -> Self {
        KeepAliveTimer {
            interval_ms,
            last_sent_ms: None,
        }
    }

    /// True if nothing was sent yet or the interval has elapsed
    pub fn is_due(&self, current_time_ms: u64) -> bool {
        match self.last_sent_ms {
            None => true,
            Some(last) => current_time_ms.saturating_sub(last) >= self.interval_ms,
        }
    }

    pub fn mark_sent(&mut self, current_time_ms: u64) {
        self.last_sent_ms = Some(current_time_ms);
    }
}

// =============================================================================
// Tests
// =============================================================================
