//! HTTP client for the ThirdEye detection/synthesis service

use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Service status, as reported by `GET /status`
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceStatus {
    /// Whether frame processing is globally enabled on the service
    pub detection_active: bool,

    /// Whether the detection model is loaded
    pub model_loaded: bool,

    /// Model input tensor name, when loaded
    #[serde(default)]
    pub model_input_name: Option<String>,

    /// Model input shape, when loaded (entries may be symbolic)
    #[serde(default)]
    pub model_input_shape: Option<serde_json::Value>,

    /// Number of object classes the service recognizes
    #[serde(default)]
    pub class_names_count: Option<u64>,
}

/// Structured result of one frame submission
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionResult {
    /// Human-readable detection lines, e.g. `"chair (left) [0.82]"`
    #[serde(default)]
    pub detections_text: Vec<String>,

    /// Structured detections (class, score, direction, bbox)
    #[serde(default)]
    pub detections_json: Vec<serde_json::Value>,

    /// Spoken summary for this frame, when the service generated one
    #[serde(default)]
    pub speech_output: Option<String>,
}

/// Response to `POST /toggle_detection`
#[derive(Debug, Clone, Deserialize)]
pub struct ToggleResult {
    /// Confirmation text ("Detection Paused." / "Detection Resumed.")
    pub message: String,

    /// Spoken form of the confirmation
    #[serde(default)]
    pub speech_output: Option<String>,

    /// New state of the global detection flag
    pub detection_active: bool,
}

/// One remote voice, as listed by `GET /google_tts_voices`
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteVoiceInfo {
    /// Cloud voice name, e.g. "en-US-Neural2-C"
    pub name: String,

    /// Supported language codes
    pub language_codes: Vec<String>,

    /// SSML gender tag
    #[serde(default)]
    pub ssml_gender: String,

    /// Natural sample rate in hertz
    #[serde(default)]
    pub natural_sample_rate_hertz: u32,

    /// Whether the synthesis endpoint accepts a pitch parameter for this voice
    #[serde(default = "default_true", alias = "supportsPitch")]
    pub supports_pitch: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<RemoteVoiceInfo>,
}

/// Request body for `POST /synthesize_speech_google`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeRequest<'a> {
    /// Text to synthesize
    pub text: &'a str,

    /// Language code, e.g. "en-US"
    pub language_code: &'a str,

    /// Cloud voice name
    pub voice_name: &'a str,

    /// Speaking rate, already clamped by the caller
    pub speaking_rate: f32,

    /// Pitch, included only for voices that support it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    #[serde(rename = "audioContent")]
    audio_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepeatResponse {
    #[serde(default)]
    speech_output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingResponse {
    value: bool,
}

/// Client for the ThirdEye detection/synthesis HTTP service
///
/// Every call carries a bounded timeout; the service applies none of its own,
/// and an unbounded hang would wedge the capture and speech state machines.
#[derive(Debug, Clone)]
pub struct DetectionClient {
    client: reqwest::Client,
    base_url: String,
}

impl DetectionClient {
    /// Create a new client for the service at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the underlying HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Fetch service status
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a non-2xx response.
    pub async fn status(&self) -> Result<ServiceStatus> {
        let response = self.client.get(self.url("/status")).send().await?;

        if !response.status().is_success() {
            return Err(Error::Detection(format!(
                "status check failed: {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Submit one frame for structured detections
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, a paused service (423), or a
    /// non-2xx response.
    pub async fn process_image(&self, jpeg: Vec<u8>) -> Result<DetectionResult> {
        let response = self
            .client
            .post(self.url("/process_image"))
            .multipart(image_form(jpeg)?)
            .send()
            .await?;

        if response.status().as_u16() == 423 {
            return Err(Error::Detection("detection is paused".to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Detection(format!(
                "process_image failed {status}: {body}"
            )));
        }

        Ok(response.json().await?)
    }

    /// Submit the same frame again with `draw_boxes=true`, returning the
    /// annotated JPEG.
    ///
    /// The service cannot return both the annotated image and the JSON
    /// detections in one response, so each frame is uploaded twice.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, non-2xx, or a non-image body.
    pub async fn process_image_annotated(&self, jpeg: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(self.url("/process_image"))
            .query(&[("draw_boxes", "true")])
            .multipart(image_form(jpeg)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Detection(format!(
                "annotated frame request failed: {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !content_type.starts_with("image/") {
            return Err(Error::Detection(format!(
                "expected image body, got {content_type}"
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Flip the service-global detection flag
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a non-2xx response.
    pub async fn toggle_detection(&self) -> Result<ToggleResult> {
        let response = self
            .client
            .post(self.url("/toggle_detection"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Detection(format!(
                "toggle_detection failed: {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Fetch the service's last generated announcement text, if any
    ///
    /// # Errors
    ///
    /// Returns error on transport failure; a 404 (no previous announcement)
    /// is `Ok(None)`.
    pub async fn repeat_last_announcement(&self) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.url("/repeat_last_announcement_text"))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Detection(format!(
                "repeat_last_announcement failed: {}",
                response.status()
            )));
        }

        let body: RepeatResponse = response.json().await?;
        Ok(body.speech_output)
    }

    /// Read the service-side "announce scene clear" setting
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a non-2xx response.
    pub async fn announce_scene_clear(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/settings/announce_scene_clear"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Detection(format!(
                "announce_scene_clear read failed: {}",
                response.status()
            )));
        }

        let body: SettingResponse = response.json().await?;
        Ok(body.value)
    }

    /// Write the service-side "announce scene clear" setting
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a non-2xx response.
    pub async fn set_announce_scene_clear(&self, value: bool) -> Result<bool> {
        let response = self
            .client
            .post(self.url("/settings/announce_scene_clear"))
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Detection(format!(
                "announce_scene_clear write failed: {}",
                response.status()
            )));
        }

        let body: SettingResponse = response.json().await?;
        Ok(body.value)
    }

    /// List the remote synthesis voices
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a non-2xx response.
    pub async fn list_voices(&self) -> Result<Vec<RemoteVoiceInfo>> {
        let response = self
            .client
            .get(self.url("/google_tts_voices"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Synthesis(format!(
                "voice listing failed: {}",
                response.status()
            )));
        }

        let body: VoicesResponse = response.json().await?;
        Ok(body.voices)
    }

    /// Synthesize speech remotely, returning decoded MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, non-2xx, or a missing/undecodable
    /// audio payload.
    pub async fn synthesize(&self, request: &SynthesizeRequest<'_>) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(self.url("/synthesize_speech_google"))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!(
                "synthesis failed {status}: {body}"
            )));
        }

        let body: SynthesizeResponse = response.json().await?;
        let encoded = body
            .audio_content
            .ok_or_else(|| Error::Synthesis("response carried no audio".to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| Error::Synthesis(format!("audio payload not base64: {e}")))
    }
}

/// Build the multipart form for a frame upload (field name `image`)
fn image_form(jpeg: Vec<u8>) -> Result<reqwest::multipart::Form> {
    let part = reqwest::multipart::Part::bytes(jpeg)
        .file_name("frame.jpg")
        .mime_str("image/jpeg")
        .map_err(|e| Error::Detection(format!("invalid frame part: {e}")))?;

    Ok(reqwest::multipart::Form::new().part("image", part))
}
