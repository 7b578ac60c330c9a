//! User-facing notifications
//!
//! Core-internal failures never propagate out of the scheduling loops; they
//! are converted to state plus one of these notices.

use crate::Error;

/// A notification for the host UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Network failure or non-2xx response; transient, loop continues
    Transport {
        /// What failed
        detail: String,
    },

    /// Unexpected content (wrong content type, missing audio payload);
    /// transient, loop continues
    Content {
        /// What was wrong
        detail: String,
    },

    /// Camera, audio, or synthesis device problem; sticky until the user
    /// retries or dismisses
    Device {
        /// What failed
        detail: String,
    },

    /// Input problem (nothing selected, detection paused); shown inline
    Validation {
        /// What was wrong
        detail: String,
    },
}

impl Notice {
    /// Whether the notice should stay visible until dismissed
    #[must_use]
    pub const fn is_sticky(&self) -> bool {
        matches!(self, Self::Device { .. })
    }

    /// Classify an internal error into a notice
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Http(_) => Self::Transport {
                detail: error.to_string(),
            },
            Error::Camera(_) | Error::Audio(_) => Self::Device {
                detail: error.to_string(),
            },
            Error::Detection(detail) if detail.contains("paused") => Self::Validation {
                detail: detail.clone(),
            },
            Error::Detection(_) => Self::Transport {
                detail: error.to_string(),
            },
            _ => Self::Content {
                detail: error.to_string(),
            },
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { detail } => write!(f, "transport: {detail}"),
            Self::Content { detail } => write!(f, "content: {detail}"),
            Self::Device { detail } => write!(f, "device: {detail}"),
            Self::Validation { detail } => write!(f, "{detail}"),
        }
    }
}
