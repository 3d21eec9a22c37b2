//! On-device recognizer seam
//!
//! The host supplies a `LocalRecognizer`; `LocalSession` turns its raw
//! results into the same segment and interim events the streaming client
//! produces.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ServiceConfig;
use crate::events::{emit, EventSender, SessionEvent};
use crate::state_machine::SessionStatus;
use crate::streaming::protocol::DEFAULT_CONFIDENCE;
use crate::streaming::TranscriptTracker;

/// Error code hosts report when a recognition window heard nothing.
pub const NO_SPEECH: &str = "no-speech";

/// Final local results carry no timing; a segment is assumed to span this
/// much audio before the moment it was reported.
const ASSUMED_SEGMENT_MS: u64 = 2000;

/// What a recognizer reports while running.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Started,
    Result {
        transcript: String,
        /// Hosts that cannot score results report `None` (or 0)
        confidence: Option<f32>,
        is_final: bool,
    },
    /// Host error code, e.g. `no-speech`, `network`, `not-allowed`
    Error(String),
    /// Recognition stopped on its own
    Ended,
}

pub type RecognitionSender = mpsc::UnboundedSender<RecognitionEvent>;

#[derive(Debug, Clone)]
pub enum RecognizerError {
    /// The host has no local recognition capability
    Unavailable,
    StartFailed(String),
}

impl std::fmt::Display for RecognizerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecognizerError::Unavailable => write!(f, "Local speech recognition is not available"),
            RecognizerError::StartFailed(e) => {
                write!(f, "Failed to start local speech recognition: {}", e)
            }
        }
    }
}

impl std::error::Error for RecognizerError {}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizerOptions {
    /// BCP-47 tag
    pub language: String,
    pub continuous: bool,
    pub interim_results: bool,
}

impl From<&ServiceConfig> for RecognizerOptions {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            language: config.language.clone(),
            continuous: config.continuous,
            interim_results: true,
        }
    }
}

/// A host-provided speech recognizer.
///
/// `start` may be called again after the recognizer reports `Ended`.
#[async_trait]
pub trait LocalRecognizer: Send + Sync {
    fn is_available(&self) -> bool;

    async fn start(
        &self,
        options: &RecognizerOptions,
        events: RecognitionSender,
    ) -> Result<(), RecognizerError>;

    async fn stop(&self);
}

/// One run of a local recognizer, owned by the orchestrator.
pub struct LocalSession {
    recognizer: Arc<dyn LocalRecognizer>,
    options: RecognizerOptions,
    tracker: TranscriptTracker,
    started_at: Instant,
    events: EventSender,
    tx: RecognitionSender,
    rx: mpsc::UnboundedReceiver<RecognitionEvent>,
    stopped: bool,
}

impl LocalSession {
    pub async fn start(
        recognizer: Arc<dyn LocalRecognizer>,
        options: RecognizerOptions,
        session_id: &str,
        events: EventSender,
    ) -> Result<Self, RecognizerError> {
        if !recognizer.is_available() {
            return Err(RecognizerError::Unavailable);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        log::info!(
            "LocalSession: starting ({}, continuous: {})",
            options.language,
            options.continuous
        );
        recognizer.start(&options, tx.clone()).await?;

        Ok(Self {
            recognizer,
            options,
            tracker: TranscriptTracker::new(session_id),
            started_at: Instant::now(),
            events,
            tx,
            rx,
            stopped: false,
        })
    }

    /// Next recognizer event. Pending forever once stopped.
    pub async fn next_event(&mut self) -> Option<RecognitionEvent> {
        if self.stopped {
            return std::future::pending().await;
        }
        self.rx.recv().await
    }

    pub async fn handle(&mut self, event: RecognitionEvent) {
        if self.stopped {
            return;
        }

        match event {
            RecognitionEvent::Started => {
                emit(&self.events, SessionEvent::Status(SessionStatus::Transcribing));
            }
            RecognitionEvent::Result {
                transcript,
                confidence,
                is_final: true,
            } => {
                let end_ms = self.started_at.elapsed().as_millis() as u64;
                let confidence = confidence
                    .filter(|c| *c > 0.0)
                    .unwrap_or(DEFAULT_CONFIDENCE);
                let segment = self.tracker.finalize(
                    &transcript,
                    end_ms.saturating_sub(ASSUMED_SEGMENT_MS),
                    end_ms,
                    confidence,
                );
                emit(&self.events, SessionEvent::Segment(segment));
            }
            RecognitionEvent::Result { transcript, .. } => {
                let index = self.tracker.segment_count() as u32;
                self.tracker.update_interim(&transcript);
                emit(&self.events, SessionEvent::Interim { text: transcript, index });
            }
            RecognitionEvent::Error(code) if code == NO_SPEECH => {
                log::debug!("LocalSession: no speech detected, still listening");
            }
            RecognitionEvent::Error(code) => {
                log::error!("LocalSession: recognition error: {}", code);
                emit(
                    &self.events,
                    SessionEvent::Error(format!("Speech recognition error: {}", code)),
                );
                emit(&self.events, SessionEvent::Status(SessionStatus::Error));
            }
            RecognitionEvent::Ended if self.options.continuous => {
                log::debug!("LocalSession: recognition ended, restarting");
                if let Err(e) = self.recognizer.start(&self.options, self.tx.clone()).await {
                    log::warn!("LocalSession: restart failed: {}", e);
                }
            }
            RecognitionEvent::Ended => log::info!("LocalSession: recognition ended"),
        }
    }

    /// Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.tracker.clear_interim();
        self.recognizer.stop().await;
        log::info!(
            "LocalSession: stopped after {} segments",
            self.tracker.segment_count()
        );
    }
}
