//! Degraded-mode result polling
//!
//! When task creation returns no join address, results are fetched from
//! `GET /sessions/{id}/transcripts` on a fixed interval. The backend returns
//! the whole accumulated result set each time, so a cursor remembers how many
//! items were already emitted.
//!
//! # Accepted shapes
//!
//! Containers:
//! - a bare array of items
//! - `{ "transcription": [ ... ] }`
//! - `{ "segments": [ ... ] }`
//!
//! Item fields (first match wins):
//! - text: `text`, `content`
//! - start offset: `startMs`, `begin_time`
//! - end offset: `endMs`, `end_time`
//! - confidence: `confidence`
//!
//! Missing offsets default to 0 and missing confidence to 0.9. An item with
//! none of the text spellings is skipped; any other container is a shape
//! error.

use serde_json::Value;

use super::protocol::DEFAULT_CONFIDENCE;

/// Canonical view of one polled result item.
#[derive(Debug, Clone, PartialEq)]
pub struct PolledResult {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
}

/// The response body matched none of the known container shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeError {
    pub description: String,
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unrecognized transcript payload: {}", self.description)
    }
}

impl std::error::Error for ShapeError {}

/// Locate the item list inside a response body.
pub fn result_items(body: &Value) -> Result<&[Value], ShapeError> {
    let items = match body {
        Value::Array(items) => Some(items),
        Value::Object(map) => ["transcription", "segments"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array)),
        _ => None,
    };

    items.map(Vec::as_slice).ok_or_else(|| ShapeError {
        description: describe(body),
    })
}

fn describe(body: &Value) -> String {
    match body {
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
    }
}

fn first_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| item.get(*key).and_then(Value::as_str))
}

fn first_u64(item: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| {
        item.get(*key).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        })
    })
}

/// Normalize one raw item. Returns `None` when it carries no text.
pub fn normalize_item(item: &Value) -> Option<PolledResult> {
    let text = first_str(item, &["text", "content"]).filter(|t| !t.is_empty())?;

    Some(PolledResult {
        text: text.to_string(),
        start_ms: first_u64(item, &["startMs", "begin_time"]).unwrap_or(0),
        end_ms: first_u64(item, &["endMs", "end_time"]).unwrap_or(0),
        confidence: item
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| c as f32)
            .unwrap_or(DEFAULT_CONFIDENCE),
    })
}

/// Count of result items already emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCursor {
    emitted: usize,
}

impl PollCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.emitted
    }

    /// Return the items past the cursor, normalized, and advance the cursor
    /// to the new total.
    ///
    /// A result set shorter than the cursor (backend reset) emits nothing and
    /// moves the cursor back to the new total.
    pub fn advance(&mut self, body: &Value) -> Result<Vec<PolledResult>, ShapeError> {
        let items = result_items(body)?;
        let fresh = items.get(self.emitted..).unwrap_or(&[]);

        let mut results = Vec::with_capacity(fresh.len());
        for (offset, item) in fresh.iter().enumerate() {
            match normalize_item(item) {
                Some(result) => results.push(result),
                None => log::warn!(
                    "Polling: skipping result {} without text",
                    self.emitted + offset
                ),
            }
        }

        self.emitted = items.len();
        Ok(results)
    }
}
