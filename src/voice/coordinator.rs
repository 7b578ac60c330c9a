//! Speech output coordination
//!
//! Serializes overlapping speak requests across the two synthesis backends.
//! The coordinator is an explicit state machine driven by a single task:
//! commands arrive on one channel, playback completions on another, and the
//! task owns every piece of queue state. Invariants it maintains:
//!
//! - at most one utterance is in flight at any time;
//! - at most one request is pending behind it, and the pending slot always
//!   holds the most recently requested text (last write wins, not FIFO);
//! - every completion path, including all failures, drains the pending slot
//!   or clears the speaking flag — the queue can never stall speaking.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{DetectionClient, SynthesizeRequest};
use crate::notice::Notice;
use crate::voice::{
    merge_voices, pick_default_voice, AudioSink, EngineUtterance, LocalEngine, Voice, VoiceId,
};
use crate::Result;

/// Bounded wait for the local engine's voice list to populate
const VOICE_LIST_TIMEOUT: Duration = Duration::from_millis(2500);

/// Poll interval while waiting for the local voice list
const VOICE_LIST_POLL: Duration = Duration::from_millis(100);

/// Remote backend speaking-rate range
const REMOTE_RATE_RANGE: (f32, f32) = (0.25, 4.0);

/// Remote backend pitch range
const REMOTE_PITCH_RANGE: (f32, f32) = (-20.0, 20.0);

/// Local backend speaking-rate range
const LOCAL_RATE_RANGE: (f32, f32) = (0.1, 10.0);

/// Local backend pitch range
const LOCAL_PITCH_RANGE: (f32, f32) = (0.0, 2.0);

/// Commands accepted by the coordinator task
#[derive(Debug)]
pub enum SpeechCommand {
    /// Request an utterance; overwrites the pending slot while busy
    Speak(String),
    /// Stop everything and clear the pending slot
    Cancel,
    /// Select a voice for subsequent dispatches
    SetVoice(VoiceId),
    /// Set the speaking rate read at dispatch time
    SetRate(f32),
    /// Set the pitch read at dispatch time
    SetPitch(f32),
    /// Rebuild the voice inventory (local list changed, or retry)
    ReloadVoices,
    /// Stop the coordinator task
    Shutdown,
}

/// Completion of one utterance's playback
#[derive(Debug)]
struct PlaybackDone {
    generation: u64,
    result: Result<()>,
}

/// Observable coordinator state, shared with the host
#[derive(Debug, Clone, Default)]
pub struct SpeechSnapshot {
    /// An utterance is currently in flight
    pub is_speaking: bool,

    /// At least one voice is available
    pub is_supported: bool,

    /// Voice inventory load in progress
    pub is_loading: bool,

    /// Merged voice inventory, remote voices first
    pub voices: Vec<Voice>,

    /// Currently selected voice
    pub selected: Option<VoiceId>,

    /// Speaking rate (clamped per backend at dispatch)
    pub rate: f32,

    /// Pitch (clamped per backend at dispatch)
    pub pitch: f32,

    /// Most recently dispatched text
    pub last_text: Option<String>,
}

/// Handle for talking to a running coordinator
#[derive(Clone)]
pub struct SpeechHandle {
    tx: mpsc::UnboundedSender<SpeechCommand>,
    shared: Arc<Mutex<SpeechSnapshot>>,
}

impl SpeechHandle {
    /// Request an utterance; no-op when synthesis is unsupported
    pub fn speak(&self, text: &str) {
        let _ = self.tx.send(SpeechCommand::Speak(text.to_string()));
    }

    /// Stop playback and clear the pending slot
    pub fn cancel(&self) {
        let _ = self.tx.send(SpeechCommand::Cancel);
    }

    /// Select a voice; takes effect on the next dispatch
    pub fn set_voice(&self, id: VoiceId) {
        let _ = self.tx.send(SpeechCommand::SetVoice(id));
    }

    /// Set the speaking rate; read at dispatch time
    pub fn set_rate(&self, rate: f32) {
        let _ = self.tx.send(SpeechCommand::SetRate(rate));
    }

    /// Set the pitch; read at dispatch time
    pub fn set_pitch(&self, pitch: f32) {
        let _ = self.tx.send(SpeechCommand::SetPitch(pitch));
    }

    /// Rebuild the voice inventory
    pub fn reload_voices(&self) {
        let _ = self.tx.send(SpeechCommand::ReloadVoices);
    }

    /// Stop the coordinator task
    pub fn shutdown(&self) {
        let _ = self.tx.send(SpeechCommand::Shutdown);
    }

    /// Whether an utterance is currently in flight
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.shared.lock().map(|s| s.is_speaking).unwrap_or(false)
    }

    /// Whether any voice is available
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.shared.lock().map(|s| s.is_supported).unwrap_or(false)
    }

    /// Snapshot of the observable state
    #[must_use]
    pub fn snapshot(&self) -> SpeechSnapshot {
        self.shared
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Outcome of one dispatch attempt
enum Dispatch {
    /// Playback started; completion arrives as an event
    Started,
    /// Treated as immediately complete (no voice, synthesis failure)
    Finished,
}

/// The speech coordination state machine
pub struct SpeechCoordinator {
    client: DetectionClient,
    engine: Option<Arc<dyn LocalEngine>>,
    sink: Arc<dyn AudioSink>,
    locale: String,

    shared: Arc<Mutex<SpeechSnapshot>>,
    pending: Option<String>,
    in_flight: bool,
    generation: u64,

    cmd_rx: mpsc::UnboundedReceiver<SpeechCommand>,
    done_tx: mpsc::UnboundedSender<PlaybackDone>,
    done_rx: mpsc::UnboundedReceiver<PlaybackDone>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl SpeechCoordinator {
    /// Spawn the coordinator task and return its handle.
    ///
    /// The voice inventory is loaded before the first command is processed.
    #[must_use]
    pub fn spawn(
        client: DetectionClient,
        engine: Option<Arc<dyn LocalEngine>>,
        sink: Arc<dyn AudioSink>,
        locale: String,
        rate: f32,
        pitch: f32,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> (SpeechHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Mutex::new(SpeechSnapshot {
            rate,
            pitch,
            is_loading: true,
            ..SpeechSnapshot::default()
        }));

        let coordinator = Self {
            client,
            engine,
            sink,
            locale,
            shared: Arc::clone(&shared),
            pending: None,
            in_flight: false,
            generation: 0,
            cmd_rx,
            done_tx,
            done_rx,
            notices,
        };

        let handle = SpeechHandle {
            tx: cmd_tx,
            shared,
        };
        let task = tokio::spawn(coordinator.run());

        (handle, task)
    }

    async fn run(mut self) {
        self.load_voices().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(SpeechCommand::Shutdown) => break,
                        Some(SpeechCommand::Speak(text)) => self.on_speak(text).await,
                        Some(SpeechCommand::Cancel) => self.on_cancel(),
                        Some(SpeechCommand::SetVoice(id)) => self.update(|s| s.selected = Some(id)),
                        Some(SpeechCommand::SetRate(rate)) => self.update(|s| s.rate = rate),
                        Some(SpeechCommand::SetPitch(pitch)) => self.update(|s| s.pitch = pitch),
                        Some(SpeechCommand::ReloadVoices) => self.load_voices().await,
                    }
                }
                Some(done) = self.done_rx.recv() => {
                    self.on_playback_done(done).await;
                }
            }
        }

        self.on_cancel();
        tracing::debug!("speech coordinator stopped");
    }

    fn update(&self, f: impl FnOnce(&mut SpeechSnapshot)) {
        if let Ok(mut shared) = self.shared.lock() {
            f(&mut shared);
        }
    }

    fn snapshot(&self) -> SpeechSnapshot {
        self.shared
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Build the merged voice inventory and derive the default selection
    async fn load_voices(&mut self) {
        self.update(|s| s.is_loading = true);

        let local = match &self.engine {
            Some(engine) => wait_for_engine_voices(engine.as_ref()).await,
            None => Vec::new(),
        };

        let remote = match self.client.list_voices().await {
            Ok(voices) => voices,
            Err(e) => {
                tracing::warn!(error = %e, "remote voice listing failed");
                let _ = self.notices.send(Notice::from_error(&e));
                Vec::new()
            }
        };

        let voices = merge_voices(remote, local);
        let selected = pick_default_voice(&voices, &self.locale);
        let supported = !voices.is_empty();

        tracing::info!(
            count = voices.len(),
            supported,
            selected = ?selected.map(|id| id.0),
            "voice inventory loaded"
        );

        self.update(|s| {
            s.voices = voices;
            s.selected = selected;
            s.is_supported = supported;
            s.is_loading = false;
        });
    }

    async fn on_speak(&mut self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        if !self.snapshot().is_supported {
            tracing::debug!("speak ignored: synthesis unsupported");
            return;
        }

        if self.in_flight {
            if let Some(dropped) = self.pending.replace(text) {
                tracing::debug!(dropped = %dropped, "pending utterance overwritten");
            }
        } else {
            self.dispatch_chain(text).await;
        }
    }

    /// Dispatch `text`, and on immediate completion keep draining the pending
    /// slot until something starts playing or nothing is left.
    async fn dispatch_chain(&mut self, text: String) {
        let mut next = text;
        loop {
            match self.dispatch(next).await {
                Dispatch::Started => break,
                Dispatch::Finished => {
                    if let Some(queued) = self.pending.take() {
                        next = queued;
                    } else {
                        self.update(|s| s.is_speaking = false);
                        break;
                    }
                }
            }
        }
    }

    /// Resolve the selected voice and hand the text to its backend.
    ///
    /// Voice, rate, and pitch are all read here, at dispatch time, so setter
    /// changes made while a request sat in the pending slot take effect.
    async fn dispatch(&mut self, text: String) -> Dispatch {
        let snapshot = self.snapshot();
        self.update(|s| {
            s.is_speaking = true;
            s.last_text = Some(text.clone());
        });

        let voice = snapshot
            .selected
            .and_then(|id| snapshot.voices.iter().find(|v| v.id() == id).cloned());

        let Some(voice) = voice else {
            tracing::debug!("no resolvable voice; treating utterance as complete");
            return Dispatch::Finished;
        };

        match voice {
            Voice::Remote(remote) => {
                let language_code = remote
                    .language_codes
                    .iter()
                    .find(|c| c.starts_with(self.locale.split('-').next().unwrap_or("")))
                    .or_else(|| remote.language_codes.first())
                    .cloned()
                    .unwrap_or_else(|| self.locale.clone());

                let rate = snapshot.rate.clamp(REMOTE_RATE_RANGE.0, REMOTE_RATE_RANGE.1);
                let pitch = remote.supports_pitch.then(|| {
                    snapshot
                        .pitch
                        .clamp(REMOTE_PITCH_RANGE.0, REMOTE_PITCH_RANGE.1)
                });

                let request = SynthesizeRequest {
                    text: &text,
                    language_code: &language_code,
                    voice_name: &remote.name,
                    speaking_rate: rate,
                    pitch,
                };

                match self.client.synthesize(&request).await {
                    Ok(audio) => {
                        self.generation += 1;
                        self.in_flight = true;

                        let generation = self.generation;
                        let sink = Arc::clone(&self.sink);
                        let done_tx = self.done_tx.clone();
                        tokio::spawn(async move {
                            let result = sink.play(audio).await;
                            let _ = done_tx.send(PlaybackDone { generation, result });
                        });

                        tracing::debug!(voice = %remote.name, "remote utterance playing");
                        Dispatch::Started
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, voice = %remote.name, "remote synthesis failed");
                        let _ = self.notices.send(Notice::from_error(&e));
                        Dispatch::Finished
                    }
                }
            }
            Voice::Local(local) => {
                let Some(engine) = self.engine.clone() else {
                    tracing::debug!("local voice selected but no engine present");
                    return Dispatch::Finished;
                };

                // A local utterance may still be winding down after a cancel;
                // the engine owns at most one at a time.
                engine.cancel();

                let utterance = EngineUtterance {
                    text,
                    voice_resource: (!local.resource_id.is_empty())
                        .then(|| local.resource_id.clone()),
                    language: local.language.clone(),
                    rate: snapshot.rate.clamp(LOCAL_RATE_RANGE.0, LOCAL_RATE_RANGE.1),
                    pitch: snapshot
                        .pitch
                        .clamp(LOCAL_PITCH_RANGE.0, LOCAL_PITCH_RANGE.1),
                };

                self.generation += 1;
                self.in_flight = true;

                let generation = self.generation;
                let done_tx = self.done_tx.clone();
                tokio::spawn(async move {
                    let result = engine.speak(utterance).await;
                    let _ = done_tx.send(PlaybackDone { generation, result });
                });

                tracing::debug!(voice = %local.name, "local utterance started");
                Dispatch::Started
            }
        }
    }

    /// Both backends converge here: drain the pending slot or go quiet
    async fn on_playback_done(&mut self, done: PlaybackDone) {
        if done.generation != self.generation {
            tracing::debug!(generation = done.generation, "stale playback completion ignored");
            return;
        }

        if let Err(e) = done.result {
            tracing::warn!(error = %e, "utterance failed");
            let _ = self.notices.send(Notice::from_error(&e));
        }

        self.in_flight = false;

        if let Some(next) = self.pending.take() {
            self.dispatch_chain(next).await;
        } else {
            self.update(|s| s.is_speaking = false);
        }
    }

    fn on_cancel(&mut self) {
        self.pending = None;
        // Invalidate any in-flight completion so it cannot re-trigger dispatch
        self.generation += 1;
        self.in_flight = false;

        self.sink.stop();
        if let Some(engine) = &self.engine {
            engine.cancel();
        }

        self.update(|s| s.is_speaking = false);
    }
}

/// Poll the engine until its voice list populates or the bounded wait ends.
///
/// Device voice lists may fill in asynchronously after startup.
async fn wait_for_engine_voices(engine: &dyn LocalEngine) -> Vec<crate::voice::EngineVoice> {
    let deadline = tokio::time::Instant::now() + VOICE_LIST_TIMEOUT;

    loop {
        match engine.voices().await {
            Ok(voices) if !voices.is_empty() => return voices,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "local voice listing failed");
                return Vec::new();
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Vec::new();
        }
        tokio::time::sleep(VOICE_LIST_POLL).await;
    }
}
