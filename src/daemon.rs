//! Daemon - the live narration service
//!
//! Wires the detection client, speech coordinator, capture loop, and action
//! bridge together and runs until interrupted.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::api::DetectionClient;
use crate::bridge::{ActionBridge, ActionSlot};
use crate::capture::{CaptureLoop, FileFrameSource};
use crate::notice::Notice;
use crate::voice::{AudioSink, CpalSink, EspeakEngine, LocalEngine, NullSink, SpeechCoordinator};
use crate::{Config, Result};

/// The ThirdEye daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a new daemon instance
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed; service
    /// unavailability is reported and retried, not fatal.
    #[allow(clippy::too_many_lines)]
    pub async fn run(self) -> Result<()> {
        let client = DetectionClient::new(&self.config.server_url, self.config.request_timeout())?;

        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<Notice>();
        tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                if notice.is_sticky() {
                    tracing::error!(%notice, "device problem");
                } else {
                    tracing::warn!(%notice, "notice");
                }
            }
        });

        // Detection gate follows the service's own flag when reachable
        let detection_active = match client.status().await {
            Ok(status) => {
                tracing::info!(
                    detection_active = status.detection_active,
                    model_loaded = status.model_loaded,
                    classes = ?status.class_names_count,
                    "service reachable"
                );
                status.detection_active
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %self.config.server_url, "service unreachable at startup");
                let _ = notice_tx.send(Notice::from_error(&e));
                true
            }
        };

        let engine: Option<Arc<dyn LocalEngine>> =
            match EspeakEngine::locate(self.config.speech.engine_path.clone()) {
                Ok(engine) => Some(Arc::new(engine)),
                Err(e) => {
                    tracing::info!(error = %e, "no local synthesis engine; remote voices only");
                    None
                }
            };

        let sink: Arc<dyn AudioSink> = match CpalSink::new() {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                tracing::warn!(error = %e, "audio output unavailable");
                let _ = notice_tx.send(Notice::Device {
                    detail: format!("audio output unavailable: {e}"),
                });
                Arc::new(NullSink)
            }
        };

        let (speech, speech_task) = SpeechCoordinator::spawn(
            client.clone(),
            engine,
            sink,
            self.config.locale.clone(),
            self.config.speech.rate,
            self.config.speech.pitch,
            notice_tx.clone(),
        );

        let (capture, capture_task) = CaptureLoop::spawn(
            client.clone(),
            Arc::new(FileFrameSource),
            speech.clone(),
            std::time::Duration::from_millis(self.config.capture.interval_ms),
            std::time::Duration::from_millis(self.config.capture.speech_backoff_ms),
            std::time::Duration::from_millis(self.config.capture.switch_settle_ms),
            self.config.auto_speak,
            notice_tx.clone(),
        );
        capture.set_detection_enabled(detection_active);

        // Wire the bridge slots the host can trigger
        let bridge = ActionBridge::new();
        {
            let capture = capture.clone();
            bridge.register(ActionSlot::Submit, move || capture.submit_frame());
        }
        {
            let client = client.clone();
            let speech = speech.clone();
            let notices = notice_tx.clone();
            bridge.register(ActionSlot::Speak, move || {
                let client = client.clone();
                let speech = speech.clone();
                let notices = notices.clone();
                tokio::spawn(async move {
                    match client.repeat_last_announcement().await {
                        Ok(Some(text)) => speech.speak(&text),
                        Ok(None) => {
                            let _ = notices.send(Notice::Validation {
                                detail: "no previous announcement".to_string(),
                            });
                        }
                        Err(e) => {
                            let _ = notices.send(Notice::from_error(&e));
                        }
                    }
                });
            });
        }
        {
            let capture = capture.clone();
            let device = self.config.capture.device.clone();
            let notices = notice_tx.clone();
            bridge.register(ActionSlot::StartStop, move || {
                if capture.is_camera_on() {
                    capture.stop_camera();
                } else if let Some(device) = &device {
                    capture.start_camera(device);
                } else {
                    let _ = notices.send(Notice::Validation {
                        detail: "no capture device configured".to_string(),
                    });
                }
            });
        }

        if let Some(device) = &self.config.capture.device {
            capture.start_camera(device);
        } else {
            tracing::info!("no capture device configured; camera stays off");
        }

        // Map console lines onto bridge slots, standing in for the host's
        // keyboard shortcuts
        spawn_console_triggers(ConsoleTriggers {
            bridge: bridge.clone(),
            client: client.clone(),
            capture: capture.clone(),
            speech: speech.clone(),
            auto_speak: self.config.auto_speak,
            notices: notice_tx.clone(),
        });

        tracing::info!("thirdeye daemon running; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");

        bridge.clear_all();
        capture.shutdown();
        speech.shutdown();
        let _ = capture_task.await;
        let _ = speech_task.await;

        Ok(())
    }
}

struct ConsoleTriggers {
    bridge: ActionBridge,
    client: DetectionClient,
    capture: crate::capture::CaptureHandle,
    speech: crate::voice::SpeechHandle,
    auto_speak: bool,
    notices: mpsc::UnboundedSender<Notice>,
}

impl ConsoleTriggers {
    /// Flip the service-global detection flag and mirror it into the gate
    async fn toggle_detection(&self) {
        match self.client.toggle_detection().await {
            Ok(result) => {
                tracing::info!(detection_active = result.detection_active, "{}", result.message);
                self.capture.set_detection_enabled(result.detection_active);
                if self.auto_speak {
                    if let Some(text) = &result.speech_output {
                        self.speech.speak(text);
                    }
                }
            }
            Err(e) => {
                let _ = self.notices.send(Notice::from_error(&e));
            }
        }
    }
}

/// Read stdin lines and invoke the matching bridge slot
fn spawn_console_triggers(triggers: ConsoleTriggers) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "submit" | "d" => triggers.bridge.invoke(ActionSlot::Submit),
                "speak" | "r" => triggers.bridge.invoke(ActionSlot::Speak),
                "camera" | "c" => triggers.bridge.invoke(ActionSlot::StartStop),
                "toggle" | "t" => triggers.toggle_detection().await,
                "" => {}
                other => tracing::info!(
                    input = other,
                    "unknown trigger (try: submit, speak, camera, toggle)"
                ),
            }
        }
    });
}
