//! Caller-facing event stream
//!
//! Every session delivers its output through one channel of `SessionEvent`s
//! instead of a set of independent callbacks.

use tokio::sync::mpsc;

use crate::speech::Provider;
use crate::state_machine::SessionStatus;
use crate::streaming::TranscriptSegment;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Backend acknowledged StartTranscription
    Started,
    /// A new utterance began; any interim text is void
    SegmentBegin,
    /// Latest non-final hypothesis for the utterance in progress
    Interim { text: String, index: u32 },
    /// The utterance in progress ended without text; interim text is void
    InterimCleared,
    /// A finalized utterance
    Segment(TranscriptSegment),
    /// Backend finished transcribing
    Completed,
    /// Human-readable failure; never terminates the session on its own
    Error(String),
    Status(SessionStatus),
    ProviderChanged(Provider),
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send an event, ignoring a receiver that has gone away.
pub(crate) fn emit(tx: &EventSender, event: SessionEvent) {
    if tx.send(event).is_err() {
        log::debug!("Event receiver dropped");
    }
}
