//! Local on-device speech synthesis engine

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::{Error, Result};

/// Words-per-minute the engine treats as rate 1.0
const BASE_WPM: f32 = 175.0;

/// One voice as reported by the local engine, before inventory mapping
#[derive(Debug, Clone)]
pub struct EngineVoice {
    /// Display name
    pub name: String,

    /// Language tag
    pub language: String,

    /// Engine resource identifier; engines may report the same resource
    /// under several entries, so callers dedupe on this
    pub resource_id: String,

    /// Whether the engine considers this its default voice
    pub is_default: bool,

    /// Whether the voice is served from the local device
    pub is_local_service: bool,
}

/// A fully resolved utterance for the local engine
#[derive(Debug, Clone)]
pub struct EngineUtterance {
    /// Text to speak
    pub text: String,

    /// Exact engine resource to use, when one matched the selected voice
    pub voice_resource: Option<String>,

    /// Language tag fallback when no exact resource matched
    pub language: String,

    /// Rate multiplier, already clamped to the local range
    pub rate: f32,

    /// Pitch, already clamped to the local range [0, 2]
    pub pitch: f32,
}

/// Local synthesis backend.
///
/// `speak` resolves when the utterance has finished (or failed); `cancel`
/// stops the current utterance immediately, causing the pending `speak`
/// future to resolve.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    /// List the engine's voices
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be queried.
    async fn voices(&self) -> Result<Vec<EngineVoice>>;

    /// Speak one utterance to completion
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails to start or reports failure.
    async fn speak(&self, utterance: EngineUtterance) -> Result<()>;

    /// Stop the current utterance, if any. Idempotent.
    fn cancel(&self);
}

/// One spawned synthesis process, tagged so each `speak` call polls only the
/// process it started.
struct RunningUtterance {
    token: u64,
    child: Child,
}

/// [`LocalEngine`] backed by the espeak-ng command-line synthesizer
pub struct EspeakEngine {
    binary: PathBuf,
    current: Arc<Mutex<Option<RunningUtterance>>>,
    next_token: AtomicU64,
}

impl EspeakEngine {
    /// Locate espeak-ng (or the older espeak binary) and build an engine
    ///
    /// # Errors
    ///
    /// Returns error if no engine binary is on the path.
    pub fn locate(override_path: Option<PathBuf>) -> Result<Self> {
        let binary = match override_path {
            Some(path) => path,
            None => which::which("espeak-ng")
                .or_else(|_| which::which("espeak"))
                .map_err(|_| Error::Synthesis("no local synthesis engine found".to_string()))?,
        };

        tracing::debug!(binary = %binary.display(), "local synthesis engine located");

        Ok(Self {
            binary,
            current: Arc::new(Mutex::new(None)),
            next_token: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl LocalEngine for EspeakEngine {
    async fn voices(&self) -> Result<Vec<EngineVoice>> {
        let output = Command::new(&self.binary)
            .arg("--voices")
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Synthesis(format!(
                "voice listing exited with {}",
                output.status
            )));
        }

        Ok(parse_voice_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn speak(&self, utterance: EngineUtterance) -> Result<()> {
        let voice_arg = utterance
            .voice_resource
            .unwrap_or_else(|| utterance.language.clone());

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wpm = (BASE_WPM * utterance.rate).clamp(80.0, 450.0) as u32;
        // Engine pitch range is 0-99, 50 being neutral; [0, 2] maps onto it
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let pitch = (utterance.pitch * 49.5).round() as u32;

        let child = Command::new(&self.binary)
            .arg("-v")
            .arg(&voice_arg)
            .arg("-s")
            .arg(wpm.to_string())
            .arg("-p")
            .arg(pitch.to_string())
            .arg("--")
            .arg(&utterance.text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        tracing::debug!(voice = %voice_arg, wpm, pitch, "local utterance started");

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self
                .current
                .lock()
                .map_err(|_| Error::Synthesis("engine state poisoned".to_string()))?;
            if let Some(mut old) = guard.replace(RunningUtterance { token, child }) {
                let _ = old.child.start_kill();
            }
        }

        // Poll rather than wait(): cancel() needs concurrent access to the
        // child handle. The token keeps this loop off any process a later
        // speak() installs.
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;

            let mut guard = self
                .current
                .lock()
                .map_err(|_| Error::Synthesis("engine state poisoned".to_string()))?;

            let Some(running) = guard.as_mut() else {
                // Cancelled from outside
                return Ok(());
            };
            if running.token != token {
                // Superseded; the newer speak() owns the slot now
                return Ok(());
            }

            match running.child.try_wait() {
                Ok(Some(status)) => {
                    *guard = None;
                    if status.success() {
                        return Ok(());
                    }
                    return Err(Error::Synthesis(format!("engine exited with {status}")));
                }
                Ok(None) => {}
                Err(e) => {
                    *guard = None;
                    return Err(Error::Synthesis(format!("engine wait failed: {e}")));
                }
            }
        }
    }

    fn cancel(&self) {
        if let Ok(mut guard) = self.current.lock() {
            if let Some(mut running) = guard.take() {
                let _ = running.child.start_kill();
                tracing::debug!("local utterance cancelled");
            }
        }
    }
}

/// Parse `espeak-ng --voices` output.
///
/// Columns: `Pty Language Age/Gender VoiceName File Other Languages`; the
/// voice name may contain spaces, so the file column is found as the first
/// path-like token after the gender column.
fn parse_voice_listing(listing: &str) -> Vec<EngineVoice> {
    let mut voices = Vec::new();

    for line in listing.lines().skip(1) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            continue;
        }

        let language = tokens[1].to_string();
        let file_idx = tokens[3..]
            .iter()
            .position(|t| t.contains('/'))
            .map(|i| i + 3);

        let (name, resource_id) = match file_idx {
            Some(idx) => (tokens[3..idx].join(" "), tokens[idx].to_string()),
            None => (tokens[3..].join(" "), language.clone()),
        };
        if name.is_empty() {
            continue;
        }

        // The engine starts up speaking plain "en"; treat that entry as its
        // default voice.
        let is_default = language == "en";

        voices.push(EngineVoice {
            name,
            language,
            resource_id,
            is_default,
            is_local_service: true,
        });
    }

    voices
}
