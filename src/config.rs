//! Configuration management for the ThirdEye client

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

/// Default detection service URL
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Default preferred locale for voice selection
const DEFAULT_LOCALE: &str = "en-US";

/// Bounded timeout applied to every outbound HTTP call.
///
/// The service applies none itself; without this a hung request would hold
/// the processing/speaking flags forever.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// ThirdEye client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the detection/synthesis service
    pub server_url: String,

    /// Preferred locale for default voice selection (e.g. "en-US")
    pub locale: String,

    /// Speak detection summaries automatically as they arrive
    pub auto_speak: bool,

    /// Speech configuration
    pub speech: SpeechConfig,

    /// Capture loop configuration
    pub capture: CaptureConfig,

    /// Outbound HTTP timeout in seconds
    pub request_timeout_secs: u64,
}

/// Speech synthesis configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Speaking rate multiplier (clamped per backend at dispatch time)
    pub rate: f32,

    /// Pitch adjustment (clamped per backend at dispatch time)
    pub pitch: f32,

    /// Override path to the local synthesis engine binary
    pub engine_path: Option<PathBuf>,
}

/// Capture loop configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Frame source device identifier (for the file source: a JPEG file or
    /// a directory of JPEG frames)
    pub device: Option<String>,

    /// Base reschedule interval between ticks, in milliseconds
    pub interval_ms: u64,

    /// Short backoff while speech is in flight, in milliseconds
    pub speech_backoff_ms: u64,

    /// Settle delay between stopping one stream and starting the next
    /// when switching sources, in milliseconds
    pub switch_settle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
            auto_speak: true,
            speech: SpeechConfig::default(),
            capture: CaptureConfig::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch: 0.0,
            engine_path: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            interval_ms: 2500,
            speech_backoff_ms: 250,
            switch_settle_ms: 300,
        }
    }
}

impl Config {
    /// Load configuration from the default config file (if present) with
    /// environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut config = match config_file_path() {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)?;
                let parsed: Self = toml::from_str(&raw)?;
                tracing::debug!(path = %path.display(), "loaded config file");
                parsed
            }
            _ => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `THIRDEYE_*` environment variable overrides
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("THIRDEYE_SERVER_URL") {
            self.server_url = url;
        }
        if let Ok(locale) = std::env::var("THIRDEYE_LOCALE") {
            self.locale = locale;
        }
        if let Ok(v) = std::env::var("THIRDEYE_AUTO_SPEAK") {
            self.auto_speak = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(device) = std::env::var("THIRDEYE_CAPTURE_DEVICE") {
            self.capture.device = Some(device);
        }
    }

    /// Outbound HTTP timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The language prefix of the preferred locale ("en" for "en-US")
    #[must_use]
    pub fn locale_prefix(&self) -> &str {
        self.locale.split('-').next().unwrap_or(&self.locale)
    }
}

/// Return the config file path under the XDG config directory
///
/// Uses `~/.config/thirdeye/config.toml` on Linux
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "thirdeye", "thirdeye")
        .map(|d| d.config_dir().join("config.toml"))
}
