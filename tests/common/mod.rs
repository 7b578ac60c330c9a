//! Shared test utilities: mock synthesis backends and a mock detection service
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use tokio::sync::Semaphore;

use thirdeye::error::{Error, Result};
use thirdeye::voice::{AudioSink, EngineUtterance, EngineVoice, LocalEngine};

/// JPEG-ish bytes with a valid SOI + SOF0 header declaring 640x480
#[must_use]
pub fn fake_jpeg() -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8];
    data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
    data.extend_from_slice(&480u16.to_be_bytes());
    data.extend_from_slice(&640u16.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
    data
}

/// Local engine that records utterances; completion is gated so tests can
/// hold an utterance in flight.
pub struct RecordingEngine {
    voices: Vec<EngineVoice>,
    /// Every utterance handed to `speak`, in order
    pub spoken: Arc<Mutex<Vec<EngineUtterance>>>,
    /// Number of `cancel` calls that actually stopped an utterance
    pub cancelled: Arc<AtomicUsize>,
    auto_complete: bool,
    gate: Arc<Semaphore>,
    speaking: Arc<AtomicBool>,
}

impl RecordingEngine {
    /// `auto_complete` makes every utterance finish immediately
    #[must_use]
    pub fn new(voices: Vec<EngineVoice>, auto_complete: bool) -> Self {
        Self {
            voices,
            spoken: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicUsize::new(0)),
            auto_complete,
            gate: Arc::new(Semaphore::new(0)),
            speaking: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Let the currently held utterance finish
    pub fn finish(&self) {
        self.gate.add_permits(1);
    }

    /// Texts spoken so far
    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.spoken
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.text.clone())
            .collect()
    }
}

#[async_trait]
impl LocalEngine for RecordingEngine {
    async fn voices(&self) -> Result<Vec<EngineVoice>> {
        Ok(self.voices.clone())
    }

    async fn speak(&self, utterance: EngineUtterance) -> Result<()> {
        self.spoken.lock().unwrap().push(utterance);
        if self.auto_complete {
            return Ok(());
        }

        self.speaking.store(true, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::Synthesis("gate closed".to_string()))?;
        permit.forget();
        self.speaking.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&self) {
        if self.speaking.swap(false, Ordering::SeqCst) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            self.gate.add_permits(1);
        }
    }
}

/// Audio sink that records playback sizes; completion is gated like
/// [`RecordingEngine`].
pub struct RecordingSink {
    /// Byte lengths of every payload handed to `play`
    pub played: Arc<Mutex<Vec<usize>>>,
    auto_complete: bool,
    gate: Arc<Semaphore>,
    playing: Arc<AtomicBool>,
}

impl RecordingSink {
    #[must_use]
    pub fn new(auto_complete: bool) -> Self {
        Self {
            played: Arc::new(Mutex::new(Vec::new())),
            auto_complete,
            gate: Arc::new(Semaphore::new(0)),
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Let the current playback finish
    pub fn finish(&self) {
        self.gate.add_permits(1);
    }

    /// Number of playbacks started
    #[must_use]
    pub fn play_count(&self) -> usize {
        self.played.lock().unwrap().len()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, mp3: Vec<u8>) -> Result<()> {
        self.played.lock().unwrap().push(mp3.len());
        if self.auto_complete {
            return Ok(());
        }

        self.playing.store(true, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::Audio("gate closed".to_string()))?;
        permit.forget();
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            self.gate.add_permits(1);
        }
    }
}

/// An espeak-style engine voice entry
#[must_use]
pub fn engine_voice(name: &str, language: &str, resource_id: &str, is_default: bool) -> EngineVoice {
    EngineVoice {
        name: name.to_string(),
        language: language.to_string(),
        resource_id: resource_id.to_string(),
        is_default,
        is_local_service: true,
    }
}

/// Mutable behavior of the mock detection service
pub struct ServerState {
    /// Body for `GET /status`
    pub status: serde_json::Value,
    /// Voices for `GET /google_tts_voices`
    pub voices: Vec<serde_json::Value>,
    /// Respond 500 to synthesis requests
    pub synthesis_fails: bool,
    /// Respond 423 to frame submissions
    pub detection_paused: bool,
    /// Respond 500 to `draw_boxes=true` submissions only
    pub annotated_fails: bool,
    /// Service-global detection flag, flipped by `POST /toggle_detection`
    pub detection_active: bool,
    /// The `announce_scene_clear` service setting
    pub scene_clear: bool,
    /// Body for plain `POST /process_image`
    pub detection: serde_json::Value,
    /// Last synthesis request body received
    pub last_synthesis: Option<serde_json::Value>,
    /// Plain frame submissions received
    pub process_count: usize,
    /// `draw_boxes=true` frame submissions received
    pub annotated_count: usize,
    /// Synthesis requests received
    pub synthesis_count: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            status: serde_json::json!({
                "detection_active": true,
                "model_loaded": true,
                "class_names_count": 80,
            }),
            voices: Vec::new(),
            synthesis_fails: false,
            detection_paused: false,
            annotated_fails: false,
            detection_active: true,
            scene_clear: false,
            detection: serde_json::json!({
                "detections_text": ["chair (left) [0.82]"],
                "detections_json": [{"class_name": "chair", "score": 0.82}],
                "speech_output": "to your left, there's a chair.",
            }),
            last_synthesis: None,
            process_count: 0,
            annotated_count: 0,
            synthesis_count: 0,
        }
    }
}

/// A standard remote voice entry for the mock service
#[must_use]
pub fn remote_voice(name: &str, locale: &str, supports_pitch: bool) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "language_codes": [locale],
        "ssml_gender": "FEMALE",
        "natural_sample_rate_hertz": 24000,
        "supportsPitch": supports_pitch,
    })
}

type SharedState = Arc<Mutex<ServerState>>;

/// A running mock detection service
pub struct MockServer {
    /// Bound address
    pub addr: SocketAddr,
    /// Shared behavior and counters
    pub state: SharedState,
}

impl MockServer {
    /// Spawn a mock service on an ephemeral port
    pub async fn spawn(state: ServerState) -> Self {
        let state = Arc::new(Mutex::new(state));

        let app = Router::new()
            .route("/status", get(status_route))
            .route("/process_image", post(process_image_route))
            .route("/google_tts_voices", get(voices_route))
            .route("/synthesize_speech_google", post(synthesize_route))
            .route("/repeat_last_announcement_text", get(repeat_route))
            .route("/toggle_detection", post(toggle_route))
            .route(
                "/settings/announce_scene_clear",
                get(scene_clear_get).post(scene_clear_set),
            )
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });

        Self { addr, state }
    }

    /// Base URL for a `DetectionClient`
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Run a closure over the shared state
    pub fn with_state<T>(&self, f: impl FnOnce(&mut ServerState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }
}

async fn status_route(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(state.lock().unwrap().status.clone())
}

async fn voices_route(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let voices = state.lock().unwrap().voices.clone();
    Json(serde_json::json!({ "voices": voices }))
}

#[derive(serde::Deserialize)]
struct DrawBoxes {
    #[serde(default)]
    draw_boxes: Option<String>,
}

async fn process_image_route(
    State(state): State<SharedState>,
    Query(query): Query<DrawBoxes>,
    mut multipart: Multipart,
) -> axum::response::Response {
    // The frame must arrive as the multipart field `image`
    let mut image_bytes = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("image") {
            image_bytes = field.bytes().await.ok();
        }
    }
    let Some(image_bytes) = image_bytes else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "No image file provided."})),
        )
            .into_response();
    };

    let draw = query.draw_boxes.as_deref() == Some("true");
    let mut state = state.lock().unwrap();

    if state.detection_paused {
        return (
            StatusCode::LOCKED,
            Json(serde_json::json!({
                "message": "Detection is paused.",
                "detections_json": [],
                "speech_output": "Detection is currently paused.",
            })),
        )
            .into_response();
    }

    if draw {
        if state.annotated_fails {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "annotation backend down"})),
            )
                .into_response();
        }
        state.annotated_count += 1;
        // Echo the frame back as the "annotated" image
        ([(header::CONTENT_TYPE, "image/jpeg")], image_bytes.to_vec()).into_response()
    } else {
        state.process_count += 1;
        Json(state.detection.clone()).into_response()
    }
}

async fn synthesize_route(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    let mut state = state.lock().unwrap();
    state.synthesis_count += 1;
    state.last_synthesis = Some(body);

    if state.synthesis_fails {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "synthesis backend down"})),
        )
            .into_response();
    }

    let audio = base64::engine::general_purpose::STANDARD.encode(b"mp3-bytes");
    Json(serde_json::json!({ "audioContent": audio })).into_response()
}

async fn repeat_route(State(state): State<SharedState>) -> axum::response::Response {
    let last = state
        .lock()
        .unwrap()
        .detection
        .get("speech_output")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    if last.is_null() {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"speech_output": null, "message": "No previous announcement."})),
        )
            .into_response()
    } else {
        Json(serde_json::json!({ "speech_output": last })).into_response()
    }
}

async fn toggle_route(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let mut state = state.lock().unwrap();
    state.detection_active = !state.detection_active;
    let message = if state.detection_active {
        "Detection Resumed."
    } else {
        "Detection Paused."
    };
    Json(serde_json::json!({
        "message": message,
        "speech_output": message,
        "detection_active": state.detection_active,
    }))
}

async fn scene_clear_get(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let value = state.lock().unwrap().scene_clear;
    Json(serde_json::json!({ "value": value }))
}

async fn scene_clear_set(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let value = body["value"].as_bool().unwrap_or(false);
    state.lock().unwrap().scene_clear = value;
    Json(serde_json::json!({ "value": value }))
}

/// Poll until `predicate` holds or the timeout elapses; panics on timeout
pub async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
