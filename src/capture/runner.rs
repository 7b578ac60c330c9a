//! The live frame-capture loop
//!
//! A timer-driven process, not a tight loop: every tick either captures and
//! submits one frame or reschedules itself. Backpressure comes from two
//! flags — the in-flight processing flag (at most one frame round-trip at a
//! time) and the speech coordinator's speaking flag (no new frame while the
//! previous result is still being spoken).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::DetectionClient;
use crate::capture::{CameraState, CaptureSession, FrameSource, ProcessedFrame};
use crate::notice::Notice;
use crate::voice::SpeechHandle;
use crate::{Error, Result};

/// Commands accepted by the capture loop
#[derive(Debug)]
pub enum CaptureCommand {
    /// Open a stream on `device` (switching first if one is already live)
    StartCamera(String),
    /// Stop the stream and release all session resources
    StopCamera,
    /// Gate frame processing globally
    SetDetectionEnabled(bool),
    /// Speak detection summaries automatically
    SetAutoSpeak(bool),
    /// Run one frame round-trip now (user-initiated submit)
    SubmitFrame,
    /// Stop the loop task
    Shutdown,
}

/// Observable capture state, shared with the host
#[derive(Debug, Clone)]
pub struct CaptureSnapshot {
    /// Camera lifecycle state
    pub camera: CameraState,

    /// Device the current/last session was opened on
    pub device: Option<String>,

    /// A frame round-trip is in flight
    pub processing: bool,

    /// Global detection gate
    pub detection_enabled: bool,

    /// Speak summaries automatically
    pub auto_speak: bool,

    /// Detection lines from the latest processed frame
    pub detections: Vec<String>,

    /// Spoken summary from the latest processed frame
    pub speech_text: Option<String>,

    /// Path to the latest annotated frame
    pub annotated_path: Option<PathBuf>,
}

impl CaptureSnapshot {
    fn new(detection_enabled: bool, auto_speak: bool) -> Self {
        Self {
            camera: CameraState::Off,
            device: None,
            processing: false,
            detection_enabled,
            auto_speak,
            detections: Vec::new(),
            speech_text: None,
            annotated_path: None,
        }
    }
}

/// Handle for talking to a running capture loop
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::UnboundedSender<CaptureCommand>,
    shared: Arc<Mutex<CaptureSnapshot>>,
}

impl CaptureHandle {
    /// Open a stream on `device`
    pub fn start_camera(&self, device: &str) {
        let _ = self
            .tx
            .send(CaptureCommand::StartCamera(device.to_string()));
    }

    /// Stop the stream and release session resources
    pub fn stop_camera(&self) {
        let _ = self.tx.send(CaptureCommand::StopCamera);
    }

    /// Gate frame processing globally
    pub fn set_detection_enabled(&self, enabled: bool) {
        let _ = self.tx.send(CaptureCommand::SetDetectionEnabled(enabled));
    }

    /// Speak summaries automatically
    pub fn set_auto_speak(&self, enabled: bool) {
        let _ = self.tx.send(CaptureCommand::SetAutoSpeak(enabled));
    }

    /// Run one frame round-trip now
    pub fn submit_frame(&self) {
        let _ = self.tx.send(CaptureCommand::SubmitFrame);
    }

    /// Stop the loop task
    pub fn shutdown(&self) {
        let _ = self.tx.send(CaptureCommand::Shutdown);
    }

    /// Snapshot of the observable state
    #[must_use]
    pub fn snapshot(&self) -> CaptureSnapshot {
        self.shared
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| CaptureSnapshot::new(false, false))
    }

    /// Whether the camera is currently on
    #[must_use]
    pub fn is_camera_on(&self) -> bool {
        self.snapshot().camera == CameraState::On
    }
}

/// The live capture state machine
pub struct CaptureLoop {
    client: DetectionClient,
    source: Arc<dyn FrameSource>,
    speech: SpeechHandle,

    shared: Arc<Mutex<CaptureSnapshot>>,
    session: Option<CaptureSession>,

    base_interval: Duration,
    speech_backoff: Duration,
    switch_settle: Duration,

    cmd_rx: mpsc::UnboundedReceiver<CaptureCommand>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl CaptureLoop {
    /// Spawn the capture loop task and return its handle
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        client: DetectionClient,
        source: Arc<dyn FrameSource>,
        speech: SpeechHandle,
        base_interval: Duration,
        speech_backoff: Duration,
        switch_settle: Duration,
        auto_speak: bool,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> (CaptureHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(CaptureSnapshot::new(true, auto_speak)));

        let runner = Self {
            client,
            source,
            speech,
            shared: Arc::clone(&shared),
            session: None,
            base_interval,
            speech_backoff,
            switch_settle,
            cmd_rx,
            notices,
        };

        let handle = CaptureHandle {
            tx: cmd_tx,
            shared,
        };
        let task = tokio::spawn(runner.run());

        (handle, task)
    }

    async fn run(mut self) {
        let mut delay = self.base_interval;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(CaptureCommand::Shutdown) => break,
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
                () = tokio::time::sleep(delay) => {
                    delay = self.tick().await;
                }
            }
        }

        self.close_session();
        tracing::debug!("capture loop stopped");
    }

    fn update(&self, f: impl FnOnce(&mut CaptureSnapshot)) {
        if let Ok(mut shared) = self.shared.lock() {
            f(&mut shared);
        }
    }

    fn snapshot(&self) -> CaptureSnapshot {
        self.shared
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| CaptureSnapshot::new(false, false))
    }

    async fn on_command(&mut self, cmd: CaptureCommand) {
        match cmd {
            CaptureCommand::StartCamera(device) => self.start_camera(device).await,
            CaptureCommand::StopCamera => {
                self.close_session();
                tracing::info!("camera stopped");
            }
            CaptureCommand::SetDetectionEnabled(enabled) => {
                self.update(|s| s.detection_enabled = enabled);
            }
            CaptureCommand::SetAutoSpeak(enabled) => {
                self.update(|s| s.auto_speak = enabled);
            }
            CaptureCommand::SubmitFrame => {
                if self.session.is_some() && !self.snapshot().processing {
                    self.process_one_frame().await;
                } else {
                    let _ = self.notices.send(Notice::Validation {
                        detail: "nothing to submit: camera off or frame in flight".to_string(),
                    });
                }
            }
            CaptureCommand::Shutdown => unreachable!("handled by run"),
        }
    }

    /// `Off/On → Starting → On`, with the `Switching` detour when a stream
    /// for a different device is already live. Fails closed.
    async fn start_camera(&mut self, device: String) {
        if let Some(session) = &self.session {
            if session.device_id == device {
                return;
            }

            // Tear the old stream down completely before touching the new
            // device; two streams must never be live at once.
            self.update(|s| s.camera = CameraState::Switching);
            tracing::info!(device = %device, "switching camera source");
            self.close_session();
            tokio::time::sleep(self.switch_settle).await;
        }

        self.update(|s| {
            s.camera = CameraState::Starting;
            s.device = Some(device.clone());
        });

        match self.source.open(&device).await {
            Ok(stream) => {
                self.session = Some(CaptureSession::new(device.clone(), stream));
                self.update(|s| s.camera = CameraState::On);
                tracing::info!(device = %device, "camera started");
            }
            Err(e) => {
                self.session = None;
                self.update(|s| {
                    s.camera = CameraState::Off;
                    s.device = None;
                });
                tracing::warn!(device = %device, error = %e, "camera start failed");
                let _ = self.notices.send(Notice::Device {
                    detail: format!("camera start failed: {e}"),
                });
            }
        }
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.update(|s| {
            s.camera = CameraState::Off;
            s.processing = false;
            s.annotated_path = None;
        });
    }

    /// One scheduling decision; returns the delay before the next tick
    async fn tick(&mut self) -> Duration {
        let snapshot = self.snapshot();

        let stream_active = self
            .session
            .as_ref()
            .is_some_and(|s| s.stream.is_active());

        if snapshot.camera != CameraState::On
            || !stream_active
            || !snapshot.detection_enabled
            || snapshot.processing
        {
            return self.base_interval;
        }

        // Backpressure: never pile up new detection speech while the
        // previous announcement is still playing.
        if self.speech.is_speaking() {
            return self.speech_backoff;
        }

        self.process_one_frame().await;
        self.base_interval
    }

    /// Capture one frame and run the dual-request round-trip.
    ///
    /// The processing flag is held across the whole round-trip; errors are
    /// converted to notices so the loop always reschedules.
    async fn process_one_frame(&mut self) {
        self.set_processing(true);

        if let Err(e) = self.try_process_frame().await {
            tracing::warn!(error = %e, "frame processing failed");
            let _ = self.notices.send(Notice::from_error(&e));
        }

        self.set_processing(false);
    }

    fn set_processing(&mut self, processing: bool) {
        if let Some(session) = &mut self.session {
            session.processing = processing;
        }
        self.update(|s| s.processing = processing);
    }

    async fn try_process_frame(&mut self) -> Result<()> {
        let frame = {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| Error::Camera("no active session".to_string()))?;
            session.stream.grab()?
        };

        tracing::debug!(
            bytes = frame.jpeg.len(),
            width = frame.width,
            height = frame.height,
            "frame captured"
        );

        // The service returns either the annotated image or the JSON
        // detections, never both, so the same frame goes up twice.
        let annotated = self.client.process_image_annotated(frame.jpeg.clone()).await;
        match annotated {
            Ok(jpeg) => {
                let processed = ProcessedFrame::new(&jpeg)?;
                let path = processed.path().to_path_buf();
                if let Some(session) = &mut self.session {
                    // Drop the superseded handle before installing the new one
                    session.annotated.take();
                    session.annotated = Some(processed);
                }
                self.update(|s| s.annotated_path = Some(path));
            }
            Err(e) => {
                tracing::warn!(error = %e, "annotated frame request failed");
                let _ = self.notices.send(Notice::from_error(&e));
            }
        }

        let result = self.client.process_image(frame.jpeg).await?;

        let snapshot = self.snapshot();
        self.update(|s| {
            s.detections = result.detections_text.clone();
            s.speech_text = result.speech_output.clone();
        });

        if let Some(text) = &result.speech_output {
            if snapshot.auto_speak && self.speech.is_supported() {
                self.speech.speak(text);
            }
        }

        tracing::debug!(
            detections = result.detections_text.len(),
            spoke = result.speech_output.is_some(),
            "frame processed"
        );

        Ok(())
    }
}
