//! Streaming transcription over the backend's live channel
//!
//! # Architecture
//!
//! ```text
//! send_audio(buf) ──▶ OutboundQueue (until ready) ──▶ frame_audio (≤4 KiB)
//!                                                          │
//!                                                          ▼
//!                                                  RealtimeClient worker
//!                                                     (WebSocket)
//!                                                          │
//!                                                          ▼
//!                                    decode ──▶ TranscriptTracker ──▶ SessionEvent
//! ```
//!
//! # Fallback Strategy
//!
//! - Unexpected closes reconnect up to 3 times with linearly growing delay
//! - No join address from task creation means degraded mode: audio goes over
//!   HTTP and results are polled
//! - Exhausted reconnects are silent; the caller sees no further events

pub mod audio_buffer;
mod audio_pump;
pub mod polling;
pub mod protocol;
mod realtime_client;
mod transcript_tracker;

pub use audio_buffer::{frame_audio, OutboundQueue};
pub use audio_pump::{AudioPump, AudioSink, PumpConfig};
pub use protocol::{decode, ClientMessage, DecodeError, ProtocolEvent, ServerMessage};
pub use realtime_client::{RealtimeClient, Session};
pub use transcript_tracker::{TranscriptSegment, TranscriptTracker};

/// Errors that can occur on the live channel
#[derive(Debug, Clone)]
pub enum StreamingError {
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// WebSocket protocol error while reading
    ProtocolError(String),
    /// Connection was closed by the peer
    Disconnected(String),
    /// Failed to write a frame
    SendFailed(String),
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to transcription channel: {}", e)
            }
            StreamingError::ProtocolError(e) => write!(f, "WebSocket protocol error: {}", e),
            StreamingError::Disconnected(e) => write!(f, "WebSocket disconnected: {}", e),
            StreamingError::SendFailed(e) => write!(f, "Failed to send audio: {}", e),
        }
    }
}

impl std::error::Error for StreamingError {}
