//! Session state machine for the realtime transcription client
//!
//! All status transitions go through `reduce()`, which returns the next
//! state and a list of effects for the transport actor to execute. The
//! reducer never performs I/O.
//!
//! ```text
//! created ──▶ connecting ──▶ connected ──▶ transcribing ──▶ stopped
//!    │            │              │              │
//!    └────────────┴──────────────┴──────────────┴──────▶ error
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical status of one transcription session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Connecting,
    Connected,
    Transcribing,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Transcribing => "transcribing",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    /// `stopped` and `error` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus the reconnection bookkeeping that decides whether a close
/// is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Unexpected closures so far. Never reset, so the bound holds for the
    /// whole session even when every reconnect opens and then drops.
    pub reconnect_attempts: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Created,
            reconnect_attempts: 0,
        }
    }
}

/// Events that can trigger status transitions.
#[derive(Debug, Clone)]
pub enum Event {
    /// Task creation request is about to be sent
    TaskRequested,
    /// Backend returned ids; `live` is false when no join address came back
    TaskCreated { live: bool },
    /// Task creation failed (network or non-2xx)
    TaskFailed { message: String },
    /// Live channel handshake completed
    ChannelOpened,
    /// StartTranscription went out on the channel
    StartSent,
    /// Live channel closed, errored, or a connect attempt failed
    ChannelClosed,
    /// Caller requested stop
    Stop,
}

/// Work the transport actor performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open the live channel using the stored join address
    OpenChannel,
    /// Begin degraded-mode result polling
    StartPolling,
    /// Send the StartTranscription control envelope
    SendStartCommand,
    /// Drain the outbound queue onto the channel in FIFO order
    FlushQueue,
    /// Re-open the channel after `delay`
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Send StopTranscription and close after the grace period
    CloseChannel,
    /// Tell the backend the session is complete
    CompleteSession,
    /// Surface an error message to the caller
    ReportError(String),
    /// Publish the current status to observers
    EmitStatus,
}

/// Limits the reducer needs from the client configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Terminal states only ever return themselves
/// - Every status change is followed by `EmitStatus`
/// - A close while stopped never schedules a reconnect
pub fn reduce(
    state: &SessionState,
    event: Event,
    policy: &ReconnectPolicy,
) -> (SessionState, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use SessionStatus::*;

    let with_status = |status: SessionStatus| SessionState {
        status,
        ..state.clone()
    };

    match (state.status, event) {
        // -----------------
        // Task creation
        // -----------------
        (Created, TaskRequested) => (with_status(Connecting), vec![EmitStatus]),
        (Connecting, TaskCreated { live: true }) => (state.clone(), vec![OpenChannel]),
        // Degraded mode: usable without a live channel
        (Connecting, TaskCreated { live: false }) => {
            (with_status(Connected), vec![EmitStatus, StartPolling])
        }
        (Created | Connecting, TaskFailed { message }) => {
            (with_status(Error), vec![EmitStatus, ReportError(message)])
        }

        // -----------------
        // Live channel
        // -----------------
        (Connecting | Connected | Transcribing, ChannelOpened) => (
            with_status(Connected),
            vec![EmitStatus, SendStartCommand, FlushQueue],
        ),
        (Connected, StartSent) => (with_status(Transcribing), vec![EmitStatus]),

        // Unexpected close: bounded, linearly delayed retries
        (Connecting | Connected | Transcribing, ChannelClosed) => {
            if state.reconnect_attempts < policy.max_attempts {
                let attempt = state.reconnect_attempts + 1;
                (
                    SessionState {
                        status: state.status,
                        reconnect_attempts: attempt,
                    },
                    vec![ScheduleReconnect {
                        attempt,
                        delay: policy.delay_for(attempt),
                    }],
                )
            } else {
                (state.clone(), vec![])
            }
        }

        // -----------------
        // Stop
        // -----------------
        (Created | Connecting | Connected | Transcribing, Stop) => (
            with_status(Stopped),
            vec![EmitStatus, CloseChannel, CompleteSession],
        ),

        // -----------------
        // Terminal and unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
