//! Live channel protocol types
//!
//! Text frames in both directions are JSON envelopes of the form
//! `{ "header": { "name": ..., ... }, "payload": { ... } }`. Audio travels as
//! raw binary frames and has no envelope.
//!
//! # Protocol Overview
//!
//! 1. Connect to the join address returned by task creation
//! 2. Send `StartTranscription`
//! 3. Stream binary audio frames
//! 4. Receive `SentenceBegin` / `TranscriptionResultChanged` / `SentenceEnd`
//! 5. Send `StopTranscription`, receive `TranscriptionCompleted`

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const NAMESPACE: &str = "SpeechTranscriber";

/// Confidence used when a final result does not carry one.
pub const DEFAULT_CONFIDENCE: f32 = 0.9;

// ============================================================================
// Client Messages (sent TO the backend)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ClientHeader {
    pub name: &'static str,
    pub namespace: &'static str,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Recognition parameters sent with StartTranscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    pub format: String,
    pub sample_rate: u32,
    pub enable_intermediate_result: bool,
    pub enable_punctuation_prediction: bool,
    pub enable_inverse_text_normalization: bool,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            format: "pcm".to_string(),
            sample_rate: 16000,
            enable_intermediate_result: true,
            enable_punctuation_prediction: true,
            enable_inverse_text_normalization: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClientPayload {
    Start(StartParams),
    Empty {},
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMessage {
    pub header: ClientHeader,
    pub payload: ClientPayload,
}

impl ClientMessage {
    fn new(name: &'static str, task_id: Option<&str>, payload: ClientPayload) -> Self {
        Self {
            header: ClientHeader {
                name,
                namespace: NAMESPACE,
                message_id: format!("msg-{}", Uuid::new_v4().simple()),
                task_id: task_id.map(str::to_string),
            },
            payload,
        }
    }

    pub fn start_transcription(task_id: Option<&str>) -> Self {
        Self::new(
            "StartTranscription",
            task_id,
            ClientPayload::Start(StartParams::default()),
        )
    }

    pub fn stop_transcription(task_id: Option<&str>) -> Self {
        Self::new("StopTranscription", task_id, ClientPayload::Empty {})
    }

    pub fn name(&self) -> &'static str {
        self.header.name
    }
}

// ============================================================================
// Server Messages (received FROM the backend)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerHeader {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub status_text: Option<String>,
}

/// Only the fields the client reads are declared. Anything else the backend
/// sends (word timings, timestamps) is skipped without being validated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPayload {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub begin_time: Option<u64>,
    #[serde(default)]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerMessage {
    pub header: ServerHeader,
    #[serde(default)]
    pub payload: Option<ServerPayload>,
}

/// Domain events decoded from server envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    TranscriptionStarted,
    SentenceBegin {
        index: u32,
    },
    ResultChanged {
        text: String,
        index: u32,
    },
    SentenceEnd {
        text: String,
        begin_time: u64,
        end_time: u64,
        confidence: f32,
    },
    /// A sentence ended with no text; the in-progress hypothesis is void
    SentenceDiscarded,
    TranscriptionCompleted,
    TaskFailed {
        reason: String,
    },
}

/// Why an inbound text frame produced no event.
#[derive(Debug)]
pub enum DecodeError {
    /// Not JSON, or not shaped like an envelope
    Malformed(serde_json::Error),
    /// Well-formed envelope with a name we don't handle
    UnknownName(String),
    /// Known name but no usable result text
    EmptyResult(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed(e) => write!(f, "malformed envelope: {}", e),
            DecodeError::UnknownName(name) => write!(f, "unhandled envelope: {}", name),
            DecodeError::EmptyResult(name) => write!(f, "{} without result text", name),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<ProtocolEvent, DecodeError> {
    let msg: ServerMessage = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
    into_event(msg)
}

fn into_event(msg: ServerMessage) -> Result<ProtocolEvent, DecodeError> {
    let ServerMessage { header, payload } = msg;
    let payload = payload.unwrap_or_default();

    match header.name.as_str() {
        "TranscriptionStarted" => Ok(ProtocolEvent::TranscriptionStarted),
        "SentenceBegin" => Ok(ProtocolEvent::SentenceBegin {
            index: payload.index.unwrap_or(0),
        }),
        "TranscriptionResultChanged" => match payload.result.filter(|r| !r.is_empty()) {
            Some(text) => Ok(ProtocolEvent::ResultChanged {
                text,
                index: payload.index.unwrap_or(0),
            }),
            None => Err(DecodeError::EmptyResult("TranscriptionResultChanged")),
        },
        "SentenceEnd" => match payload.result.filter(|r| !r.is_empty()) {
            Some(text) => Ok(ProtocolEvent::SentenceEnd {
                text,
                begin_time: payload.begin_time.unwrap_or(0),
                end_time: payload.end_time.unwrap_or(0),
                confidence: payload.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            }),
            None => Ok(ProtocolEvent::SentenceDiscarded),
        },
        "TranscriptionCompleted" => Ok(ProtocolEvent::TranscriptionCompleted),
        "TaskFailed" => {
            let reason = header
                .status_text
                .filter(|s| !s.is_empty())
                .or(payload.result.filter(|s| !s.is_empty()))
                .unwrap_or_else(|| "Transcription task failed".to_string());
            Ok(ProtocolEvent::TaskFailed { reason })
        }
        _ => Err(DecodeError::UnknownName(header.name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_serialization() {
        let msg = ClientMessage::start_transcription(Some("task-1"));
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["header"]["name"], "StartTranscription");
        assert_eq!(json["header"]["namespace"], "SpeechTranscriber");
        assert_eq!(json["header"]["task_id"], "task-1");
        assert_eq!(json["payload"]["format"], "pcm");
        assert_eq!(json["payload"]["sample_rate"], 16000);
        assert_eq!(json["payload"]["enable_intermediate_result"], true);
        assert_eq!(json["payload"]["enable_punctuation_prediction"], true);
        assert_eq!(json["payload"]["enable_inverse_text_normalization"], true);
    }

    #[test]
    fn test_stop_command_has_empty_payload() {
        let msg = ClientMessage::stop_transcription(Some("task-1"));
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"name\":\"StopTranscription\""));
        assert!(json.contains("\"payload\":{}"));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = ClientMessage::stop_transcription(None);
        let b = ClientMessage::stop_transcription(None);
        assert_ne!(a.header.message_id, b.header.message_id);
        assert!(a.header.message_id.starts_with("msg-"));
    }

    #[test]
    fn test_decode_sentence_end() {
        let json = r#"{
            "header": { "name": "SentenceEnd", "namespace": "SpeechTranscriber", "task_id": "t" },
            "payload": { "index": 2, "begin_time": 1200, "end_time": 3400, "result": "你好", "confidence": 0.75 }
        }"#;

        assert_eq!(
            decode(json).unwrap(),
            ProtocolEvent::SentenceEnd {
                text: "你好".to_string(),
                begin_time: 1200,
                end_time: 3400,
                confidence: 0.75,
            }
        );
    }

    #[test]
    fn test_decode_sentence_end_defaults() {
        let json = r#"{ "header": { "name": "SentenceEnd" }, "payload": { "result": "hi" } }"#;
        match decode(json).unwrap() {
            ProtocolEvent::SentenceEnd {
                begin_time,
                end_time,
                confidence,
                ..
            } => {
                assert_eq!(begin_time, 0);
                assert_eq!(end_time, 0);
                assert_eq!(confidence, DEFAULT_CONFIDENCE);
            }
            other => panic!("Expected SentenceEnd, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_result_changed() {
        let json = r#"{ "header": { "name": "TranscriptionResultChanged" }, "payload": { "result": "partial", "index": 4 } }"#;
        assert_eq!(
            decode(json).unwrap(),
            ProtocolEvent::ResultChanged {
                text: "partial".to_string(),
                index: 4
            }
        );
    }

    #[test]
    fn test_decode_empty_result_is_skipped() {
        let json = r#"{ "header": { "name": "TranscriptionResultChanged" }, "payload": { "result": "" } }"#;
        assert!(matches!(decode(json), Err(DecodeError::EmptyResult(_))));
    }

    #[test]
    fn test_decode_empty_sentence_end_is_discarded() {
        let json = r#"{ "header": { "name": "SentenceEnd" }, "payload": { "result": "" } }"#;
        assert_eq!(decode(json).unwrap(), ProtocolEvent::SentenceDiscarded);

        let json = r#"{ "header": { "name": "SentenceEnd" }, "payload": {} }"#;
        assert_eq!(decode(json).unwrap(), ProtocolEvent::SentenceDiscarded);
    }

    #[test]
    fn test_decode_ignores_unread_payload_fields() {
        let expected = ProtocolEvent::SentenceEnd {
            text: "hello".to_string(),
            begin_time: 0,
            end_time: 0,
            confidence: DEFAULT_CONFIDENCE,
        };

        let null_words = r#"{ "header": { "name": "SentenceEnd" }, "payload": { "result": "hello", "words": null } }"#;
        assert_eq!(decode(null_words).unwrap(), expected);

        let word_without_text = r#"{ "header": { "name": "SentenceEnd" }, "payload": { "result": "hello", "words": [{ "startTime": 3 }] } }"#;
        assert_eq!(decode(word_without_text).unwrap(), expected);

        let negative_time = r#"{ "header": { "name": "SentenceEnd" }, "payload": { "result": "hello", "time": -1 } }"#;
        assert_eq!(decode(negative_time).unwrap(), expected);
    }

    #[test]
    fn test_decode_task_failed_reason() {
        let json = r#"{ "header": { "name": "TaskFailed", "status": 40000000, "status_text": "quota exceeded" } }"#;
        assert_eq!(
            decode(json).unwrap(),
            ProtocolEvent::TaskFailed {
                reason: "quota exceeded".to_string()
            }
        );

        let json = r#"{ "header": { "name": "TaskFailed" } }"#;
        assert!(matches!(
            decode(json).unwrap(),
            ProtocolEvent::TaskFailed { reason } if !reason.is_empty()
        ));
    }

    #[test]
    fn test_decode_lifecycle() {
        let started = r#"{ "header": { "name": "TranscriptionStarted" }, "payload": {} }"#;
        let completed = r#"{ "header": { "name": "TranscriptionCompleted" } }"#;
        assert_eq!(decode(started).unwrap(), ProtocolEvent::TranscriptionStarted);
        assert_eq!(decode(completed).unwrap(), ProtocolEvent::TranscriptionCompleted);
    }

    #[test]
    fn test_decode_unknown_name() {
        let json = r#"{ "header": { "name": "SomeFutureEvent" }, "payload": { "x": 1 } }"#;
        assert!(matches!(decode(json), Err(DecodeError::UnknownName(name)) if name == "SomeFutureEvent"));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(r#"{"payload":{}}"#), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"header":{"name":"SentenceEnd"},"payload":{"begin_time":"soon"}}"#),
            Err(DecodeError::Malformed(_))
        ));
    }
}
