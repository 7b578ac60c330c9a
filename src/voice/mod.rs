//! Speech synthesis: voice inventory, backends, and the coordinator
//!
//! Two heterogeneous backends sit behind one coordinator: the remote neural
//! synthesis endpoint (audio comes back as MP3 and is played through an
//! [`AudioSink`]) and the local on-device engine (a [`LocalEngine`]).

mod coordinator;
mod engine;
mod playback;

pub use coordinator::{SpeechCommand, SpeechCoordinator, SpeechHandle, SpeechSnapshot};
pub use engine::{EngineUtterance, EngineVoice, EspeakEngine, LocalEngine};
pub use playback::{AudioSink, CpalSink, NullSink};

use crate::api::RemoteVoiceInfo;

/// Identifier for a voice within one inventory load.
///
/// Unique across the merged remote + local list; reassigned whenever the
/// inventory is refreshed, so ids must not be persisted across refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u32);

/// A remote (cloud-hosted) synthesis voice
#[derive(Debug, Clone)]
pub struct RemoteVoice {
    /// Inventory id
    pub id: VoiceId,

    /// Cloud voice name, e.g. "en-US-Neural2-C"
    pub name: String,

    /// Supported language codes
    pub language_codes: Vec<String>,

    /// SSML gender tag
    pub gender: String,

    /// Natural sample rate in hertz
    pub sample_rate_hertz: u32,

    /// Whether the synthesis endpoint accepts pitch for this voice
    pub supports_pitch: bool,
}

/// A local (on-device) synthesis voice
#[derive(Debug, Clone)]
pub struct LocalVoice {
    /// Inventory id
    pub id: VoiceId,

    /// Display name
    pub name: String,

    /// Language tag, e.g. "en-US" or "en"
    pub language: String,

    /// Whether the engine marks this voice as its default
    pub is_default: bool,

    /// Whether the voice is served by the local device rather than fetched
    pub is_local_service: bool,

    /// Engine resource identifier used for dedup and dispatch-time lookup
    pub resource_id: String,
}

/// A synthesis voice from either backend
#[derive(Debug, Clone)]
pub enum Voice {
    /// Cloud-hosted voice
    Remote(RemoteVoice),
    /// On-device voice
    Local(LocalVoice),
}

impl Voice {
    /// Inventory id
    #[must_use]
    pub const fn id(&self) -> VoiceId {
        match self {
            Self::Remote(v) => v.id,
            Self::Local(v) => v.id,
        }
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Remote(v) => &v.name,
            Self::Local(v) => &v.name,
        }
    }

    /// Whether any of the voice's language tags starts with `prefix`
    #[must_use]
    pub fn matches_language_prefix(&self, prefix: &str) -> bool {
        match self {
            Self::Remote(v) => v.language_codes.iter().any(|c| c.starts_with(prefix)),
            Self::Local(v) => v.language.starts_with(prefix),
        }
    }
}

/// Name patterns that win the default remote-voice selection when they match
/// the preferred locale.
const PREFERRED_NAME_PATTERNS: [&str; 2] = ["neural2", "wavenet"];

/// Merge remote and raw local voice lists into one inventory.
///
/// Remote voices come first; local voices are deduplicated by engine resource
/// identifier (engines may report the same physical voice resource more than
/// once) before ids are assigned.
#[must_use]
pub fn merge_voices(remote: Vec<RemoteVoiceInfo>, local: Vec<EngineVoice>) -> Vec<Voice> {
    let mut voices = Vec::with_capacity(remote.len() + local.len());
    let mut next_id = 0u32;

    for info in remote {
        voices.push(Voice::Remote(RemoteVoice {
            id: VoiceId(next_id),
            name: info.name,
            language_codes: info.language_codes,
            gender: info.ssml_gender,
            sample_rate_hertz: info.natural_sample_rate_hertz,
            supports_pitch: info.supports_pitch,
        }));
        next_id += 1;
    }

    let mut seen = std::collections::HashSet::new();
    for entry in local {
        if !seen.insert(entry.resource_id.clone()) {
            continue;
        }
        voices.push(Voice::Local(LocalVoice {
            id: VoiceId(next_id),
            name: entry.name,
            language: entry.language,
            is_default: entry.is_default,
            is_local_service: entry.is_local_service,
            resource_id: entry.resource_id,
        }));
        next_id += 1;
    }

    voices
}

/// Pick the default selected voice for a freshly loaded inventory.
///
/// Precedence: (a) a remote voice matching the preferred locale with a
/// preferred name pattern, (b) the engine-default local voice whose language
/// starts with the locale prefix, (c) the first remote voice matching the
/// prefix, (d) the first local voice matching the prefix, (e) the first voice.
#[must_use]
pub fn pick_default_voice(voices: &[Voice], locale: &str) -> Option<VoiceId> {
    let prefix = locale.split('-').next().unwrap_or(locale);

    let preferred_remote = voices.iter().find(|v| match v {
        Voice::Remote(r) => {
            let name = r.name.to_lowercase();
            r.language_codes.iter().any(|c| c == locale)
                && PREFERRED_NAME_PATTERNS.iter().any(|p| name.contains(p))
        }
        Voice::Local(_) => false,
    });
    if let Some(v) = preferred_remote {
        return Some(v.id());
    }

    let default_local = voices.iter().find(|v| match v {
        Voice::Local(l) => l.is_default && l.language.starts_with(prefix),
        Voice::Remote(_) => false,
    });
    if let Some(v) = default_local {
        return Some(v.id());
    }

    let first_remote = voices
        .iter()
        .find(|v| matches!(v, Voice::Remote(_)) && v.matches_language_prefix(prefix));
    if let Some(v) = first_remote {
        return Some(v.id());
    }

    let first_local = voices
        .iter()
        .find(|v| matches!(v, Voice::Local(_)) && v.matches_language_prefix(prefix));
    if let Some(v) = first_local {
        return Some(v.id());
    }

    voices.first().map(Voice::id)
}
