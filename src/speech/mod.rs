//! Provider selection and fallback
//!
//! Three strategies can produce transcripts, tried in a fixed priority:
//!
//! 1. `PrimaryStreaming` - the backend's realtime service (needs a healthy backend)
//! 2. `SecondaryLocal` - an on-device recognizer supplied by the host
//! 3. `None` - record only, no transcription (always available)

mod local;
mod service;

pub use local::{
    LocalRecognizer, LocalSession, RecognitionEvent, RecognitionSender, RecognizerError,
    RecognizerOptions, NO_SPEECH,
};
pub use service::SpeechService;

use serde::{Deserialize, Serialize};

use crate::backend::BackendClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    PrimaryStreaming,
    SecondaryLocal,
    None,
}

impl Provider {
    /// Highest priority first
    pub const PRIORITY: [Provider; 3] = [
        Provider::PrimaryStreaming,
        Provider::SecondaryLocal,
        Provider::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::PrimaryStreaming => "primary-streaming",
            Provider::SecondaryLocal => "secondary-local",
            Provider::None => "none",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::PrimaryStreaming => "Streaming transcription",
            Provider::SecondaryLocal => "On-device recognition",
            Provider::None => "Recording only",
        }
    }

    /// Next provider to try when this one fails. `None` is the floor.
    pub fn fallback(&self) -> Provider {
        match self {
            Provider::PrimaryStreaming => Provider::SecondaryLocal,
            Provider::SecondaryLocal | Provider::None => Provider::None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::PRIORITY
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown provider '{}'", s))
    }
}

/// Probe every provider. The result is in priority order and always ends
/// with `Provider::None`.
pub async fn detect_available_providers(
    backend: &BackendClient,
    local: Option<&dyn LocalRecognizer>,
) -> Vec<Provider> {
    let mut providers = Vec::with_capacity(3);

    if backend.is_healthy().await {
        providers.push(Provider::PrimaryStreaming);
    }
    if local.is_some_and(|r| r.is_available()) {
        providers.push(Provider::SecondaryLocal);
    }
    providers.push(Provider::None);

    log::debug!("Speech: available providers {:?}", providers);
    providers
}

/// The preference wins when available; otherwise the first available
/// provider by priority.
pub fn select_provider(preferred: Option<Provider>, available: &[Provider]) -> Provider {
    if let Some(p) = preferred.filter(|p| available.contains(p)) {
        return p;
    }

    Provider::PRIORITY
        .into_iter()
        .find(|p| available.contains(p))
        .unwrap_or(Provider::None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpeechSupport {
    pub streaming: bool,
    pub local: bool,
    pub recommended: Provider,
}

pub async fn check_speech_support(
    backend: &BackendClient,
    local: Option<&dyn LocalRecognizer>,
) -> SpeechSupport {
    let providers = detect_available_providers(backend, local).await;

    SpeechSupport {
        streaming: providers.contains(&Provider::PrimaryStreaming),
        local: providers.contains(&Provider::SecondaryLocal),
        recommended: select_provider(None, &providers),
    }
}
