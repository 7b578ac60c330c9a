//! Error types for the ThirdEye client

use thiserror::Error;

/// Result type alias for ThirdEye operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ThirdEye client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Camera / frame source error
    #[error("camera error: {0}")]
    Camera(String),

    /// Audio playback error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech synthesis error (remote or local engine)
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Detection service error
    #[error("detection error: {0}")]
    Detection(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// True when the error is a transport-level failure (network, timeout,
    /// non-2xx) rather than a device or content problem.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Detection(_))
    }
}
