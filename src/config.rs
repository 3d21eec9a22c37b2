use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::speech::Provider;

/// Environment variable that overrides the backend base path.
pub const BACKEND_URL_ENV: &str = "DISCUSSION_API";

const DEFAULT_BACKEND_URL: &str = "http://localhost:4000";

/// Tuning for a single transcription client and its backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base path of the backend HTTP surface (no trailing slash).
    pub base_url: String,

    /// Largest binary frame written to the live channel.
    pub max_frame_bytes: usize,

    /// Reconnection attempts after an unexpected close before giving up.
    pub max_reconnect_attempts: u32,

    /// Attempt `n` waits `n * reconnect_base_delay_ms`.
    pub reconnect_base_delay_ms: u64,

    /// How long `stop()` keeps the channel open for in-flight results.
    pub stop_grace_ms: u64,

    /// Interval between result fetches in degraded mode.
    pub poll_interval_ms: u64,

    /// Health probes slower than this count as unavailable.
    pub health_timeout_ms: u64,

    /// Upper bound for the live channel to reach `transcribing`.
    pub connect_timeout_ms: u64,

    /// Timeout for ordinary backend requests.
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            max_frame_bytes: 4096,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 1000,
            stop_grace_ms: 1000,
            poll_interval_ms: 1000,
            health_timeout_ms: 3000,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Defaults, with the backend base path taken from `DISCUSSION_API` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = std::env::var(BACKEND_URL_ENV)
            .ok()
            .filter(|u| !u.trim().is_empty())
        {
            config.base_url = url.trim().trim_end_matches('/').to_string();
        }
        config
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Caller-facing orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Used when available; otherwise the first available provider by priority.
    pub preferred_provider: Option<Provider>,

    /// BCP-47 language tag handed to the local recognizer.
    pub language: String,

    /// Keep the local recognizer running across utterances.
    pub continuous: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            preferred_provider: Some(Provider::PrimaryStreaming),
            language: "zh-CN".to_string(),
            continuous: true,
        }
    }
}

/// Settings file layout: both config sections side by side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientConfig,
    pub service: ServiceConfig,
}

/// Load settings from a JSON file, falling back to defaults.
///
/// A missing file is normal; an unreadable or corrupt one is logged.
pub fn load_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
