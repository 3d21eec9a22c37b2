//! Segment and interim-text bookkeeping for one session
//!
//! # Tracking Strategy
//!
//! - **Interim**: a single slot, overwritten by each hypothesis and cleared
//!   when a sentence begins or ends
//! - **Final**: each finalized sentence becomes an immutable
//!   `TranscriptSegment` with an id built from the session id and a
//!   monotonically increasing sequence number
//!
//! Segments are numbered in arrival order. `begin_time` ordering is never
//! used to re-sort them.

use serde::{Deserialize, Serialize};

/// A finalized utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub id: String,
    pub text: String,
    /// Offset from session start in milliseconds
    pub start_ms: u64,
    /// Always >= `start_ms`
    pub end_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    /// In [0, 1]
    pub confidence: f32,
    pub is_final: bool,
}

/// Tracks the interim slot and numbers final segments for one session.
#[derive(Debug, Clone)]
pub struct TranscriptTracker {
    session_id: String,
    /// Latest non-final hypothesis; empty when none is live
    interim_text: String,
    next_sequence: u64,
}

impl TranscriptTracker {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            interim_text: String::new(),
            next_sequence: 0,
        }
    }

    /// A new sentence started; the previous hypothesis is void.
    pub fn begin_segment(&mut self) {
        self.interim_text.clear();
    }

    /// Replace the interim hypothesis. Returns the new interim text.
    pub fn update_interim(&mut self, text: &str) -> &str {
        self.interim_text.clear();
        self.interim_text.push_str(text);
        &self.interim_text
    }

    /// Build the next final segment, clearing the interim slot.
    ///
    /// Offsets are normalized so `end_ms >= start_ms` and confidence is
    /// clamped to [0, 1].
    pub fn finalize(
        &mut self,
        text: &str,
        start_ms: u64,
        end_ms: u64,
        confidence: f32,
    ) -> TranscriptSegment {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.interim_text.clear();

        if end_ms < start_ms {
            log::debug!(
                "TranscriptTracker: segment {} ends before it starts ({} < {})",
                sequence,
                end_ms,
                start_ms
            );
        }

        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        TranscriptSegment {
            id: format!("seg-{}-{}", self.session_id, sequence),
            text: text.to_string(),
            start_ms,
            end_ms: end_ms.max(start_ms),
            speaker_id: None,
            confidence,
            is_final: true,
        }
    }

    /// Current interim hypothesis, if any.
    pub fn interim_text(&self) -> Option<&str> {
        if self.interim_text.is_empty() {
            None
        } else {
            Some(&self.interim_text)
        }
    }

    /// Drop the hypothesis without finalizing it (empty sentence end, stop).
    pub fn clear_interim(&mut self) {
        self.interim_text.clear();
    }

    /// Number of segments finalized so far
    pub fn segment_count(&self) -> u64 {
        self.next_sequence
    }
}
