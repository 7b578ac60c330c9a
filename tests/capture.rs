//! Capture loop integration tests
//!
//! Drive the loop against the mock detection service with file-backed and
//! counting frame sources; no camera hardware required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use thirdeye::api::DetectionClient;
use thirdeye::capture::{
    CameraState, CaptureHandle, CaptureLoop, FileFrameSource, Frame, FrameSource, FrameStream,
};
use thirdeye::notice::Notice;
use thirdeye::voice::{LocalEngine, SpeechCoordinator, SpeechHandle};
use thirdeye::Result;

mod common;
use common::{
    engine_voice, fake_jpeg, wait_until, MockServer, RecordingEngine, RecordingSink, ServerState,
};

/// Frame source that counts concurrently live streams
#[derive(Default)]
struct CountingSource {
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

struct CountingStream {
    live: Arc<AtomicUsize>,
    active: bool,
}

#[async_trait]
impl FrameSource for CountingSource {
    async fn open(&self, _device: &str) -> Result<Box<dyn FrameStream>> {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(CountingStream {
            live: Arc::clone(&self.live),
            active: true,
        }))
    }
}

impl FrameStream for CountingStream {
    fn grab(&mut self) -> Result<Frame> {
        Ok(Frame {
            jpeg: fake_jpeg(),
            width: 640,
            height: 480,
        })
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct Fixture {
    server: MockServer,
    speech: SpeechHandle,
    capture: CaptureHandle,
    notices: mpsc::UnboundedReceiver<Notice>,
}

async fn spawn_fixture(
    state: ServerState,
    source: Arc<dyn FrameSource>,
    engine: Option<Arc<RecordingEngine>>,
    auto_speak: bool,
) -> Fixture {
    let server = MockServer::spawn(state).await;
    let client = DetectionClient::new(&server.url(), Duration::from_secs(5)).unwrap();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();

    let (speech, _speech_task) = SpeechCoordinator::spawn(
        client.clone(),
        engine.map(|e| e as Arc<dyn LocalEngine>),
        Arc::new(RecordingSink::new(true)),
        "en-US".to_string(),
        1.0,
        0.0,
        notice_tx.clone(),
    );
    wait_until("voice inventory", || !speech.snapshot().is_loading).await;

    let (capture, _capture_task) = CaptureLoop::spawn(
        client,
        source,
        speech.clone(),
        Duration::from_millis(60),
        Duration::from_millis(25),
        Duration::from_millis(20),
        auto_speak,
        notice_tx,
    );

    Fixture {
        server,
        speech,
        capture,
        notices: notice_rx,
    }
}

/// A single-frame device directory
fn frame_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("frame.jpg"), fake_jpeg()).unwrap();
    dir
}

async fn expect_notice(
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    what: &str,
    matches: impl Fn(&Notice) -> bool,
) -> Notice {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for {what} notice"));
        let notice = tokio::time::timeout(remaining, notices.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what} notice"))
            .expect("notice channel closed");
        if matches(&notice) {
            return notice;
        }
    }
}

#[tokio::test]
async fn frame_roundtrip_submits_both_requests() {
    let dir = frame_dir();
    let mut fixture = spawn_fixture(
        ServerState::default(),
        Arc::new(FileFrameSource),
        None,
        false,
    )
    .await;

    fixture.capture.start_camera(dir.path().to_str().unwrap());
    wait_until("camera on", || fixture.capture.is_camera_on()).await;

    wait_until("frame processed", || {
        fixture.server.with_state(|s| s.process_count >= 1)
    })
    .await;
    assert!(fixture.server.with_state(|s| s.annotated_count) >= 1);

    wait_until("state published", || {
        fixture.capture.snapshot().speech_text.is_some()
    })
    .await;
    let snapshot = fixture.capture.snapshot();
    assert_eq!(snapshot.detections, ["chair (left) [0.82]"]);
    assert_eq!(
        snapshot.speech_text.as_deref(),
        Some("to your left, there's a chair.")
    );

    let annotated = snapshot.annotated_path.expect("annotated frame stored");
    assert!(annotated.exists());
    // The mock echoes the uploaded frame back
    assert_eq!(std::fs::read(annotated).unwrap(), fake_jpeg());

    assert!(fixture.notices.try_recv().is_err());
    fixture.capture.shutdown();
}

#[tokio::test]
async fn one_shot_still_runs_both_requests() {
    let server = MockServer::spawn(ServerState::default()).await;
    let client = DetectionClient::new(&server.url(), Duration::from_secs(5)).unwrap();

    let (result, annotated) = thirdeye::capture::process_still(&client, fake_jpeg())
        .await
        .unwrap();

    assert_eq!(result.detections_text, ["chair (left) [0.82]"]);
    assert_eq!(annotated.unwrap(), fake_jpeg());
    assert_eq!(server.with_state(|s| s.annotated_count), 1);
    assert_eq!(server.with_state(|s| s.process_count), 1);
}

#[tokio::test]
async fn one_shot_still_survives_missing_annotation() {
    let mut state = ServerState::default();
    state.annotated_fails = true;
    let server = MockServer::spawn(state).await;
    let client = DetectionClient::new(&server.url(), Duration::from_secs(5)).unwrap();

    let (result, annotated) = thirdeye::capture::process_still(&client, fake_jpeg())
        .await
        .unwrap();

    // The annotation is best effort; the detections still come back
    assert!(annotated.is_none());
    assert_eq!(result.detections_text, ["chair (left) [0.82]"]);
    assert_eq!(server.with_state(|s| s.process_count), 1);
}

#[tokio::test]
async fn submissions_pause_while_speaking() {
    let dir = frame_dir();
    let engine = Arc::new(RecordingEngine::new(
        vec![engine_voice("English (America)", "en-US", "gmw/en-US", true)],
        false,
    ));
    let fixture = spawn_fixture(
        ServerState::default(),
        Arc::new(FileFrameSource),
        Some(Arc::clone(&engine)),
        true,
    )
    .await;

    fixture.capture.start_camera(dir.path().to_str().unwrap());
    wait_until("summary spoken", || !engine.texts().is_empty()).await;
    wait_until("speaking", || fixture.speech.is_speaking()).await;

    // While the announcement is held in flight, no new frames go up
    let before = fixture.server.with_state(|s| s.process_count);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fixture.server.with_state(|s| s.process_count), before);

    engine.finish();
    wait_until("submissions resume", || {
        fixture.server.with_state(|s| s.process_count) > before
    })
    .await;

    fixture.capture.shutdown();
    fixture.speech.cancel();
}

#[tokio::test]
async fn device_switch_never_overlaps_streams() {
    let source = Arc::new(CountingSource::default());
    let live = Arc::clone(&source.live);
    let max_live = Arc::clone(&source.max_live);

    let fixture = spawn_fixture(
        ServerState::default(),
        source as Arc<dyn FrameSource>,
        None,
        false,
    )
    .await;

    fixture.capture.start_camera("cam-a");
    wait_until("first stream", || fixture.capture.is_camera_on()).await;
    assert_eq!(fixture.capture.snapshot().device.as_deref(), Some("cam-a"));

    fixture.capture.start_camera("cam-b");
    wait_until("switched", || {
        let s = fixture.capture.snapshot();
        s.camera == CameraState::On && s.device.as_deref() == Some("cam-b")
    })
    .await;

    assert_eq!(max_live.load(Ordering::SeqCst), 1);
    assert_eq!(live.load(Ordering::SeqCst), 1);

    fixture.capture.stop_camera();
    wait_until("stream released", || live.load(Ordering::SeqCst) == 0).await;
    assert_eq!(fixture.capture.snapshot().camera, CameraState::Off);

    fixture.capture.shutdown();
}

#[tokio::test]
async fn stop_camera_releases_annotated_storage() {
    let dir = frame_dir();
    let fixture = spawn_fixture(
        ServerState::default(),
        Arc::new(FileFrameSource),
        None,
        false,
    )
    .await;

    fixture.capture.start_camera(dir.path().to_str().unwrap());
    wait_until("annotated frame stored", || {
        fixture.capture.snapshot().annotated_path.is_some()
    })
    .await;
    let annotated = fixture.capture.snapshot().annotated_path.unwrap();
    assert!(annotated.exists());

    fixture.capture.stop_camera();
    wait_until("camera off", || {
        fixture.capture.snapshot().camera == CameraState::Off
    })
    .await;

    assert!(fixture.capture.snapshot().annotated_path.is_none());
    assert!(!annotated.exists());

    // And no further submissions after the stream is gone
    let after = fixture.server.with_state(|s| s.process_count);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(fixture.server.with_state(|s| s.process_count), after);

    fixture.capture.shutdown();
}

#[tokio::test]
async fn detection_gate_blocks_processing() {
    let dir = frame_dir();
    let fixture = spawn_fixture(
        ServerState::default(),
        Arc::new(FileFrameSource),
        None,
        false,
    )
    .await;

    fixture.capture.set_detection_enabled(false);
    fixture.capture.start_camera(dir.path().to_str().unwrap());
    wait_until("camera on", || fixture.capture.is_camera_on()).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fixture.server.with_state(|s| s.process_count), 0);

    fixture.capture.set_detection_enabled(true);
    wait_until("processing resumes", || {
        fixture.server.with_state(|s| s.process_count) > 0
    })
    .await;

    fixture.capture.shutdown();
}

#[tokio::test]
async fn camera_start_failure_fails_closed() {
    let mut fixture = spawn_fixture(
        ServerState::default(),
        Arc::new(FileFrameSource),
        None,
        false,
    )
    .await;

    fixture.capture.start_camera("/no/such/device");

    let notice = expect_notice(&mut fixture.notices, "device", |n| {
        matches!(n, Notice::Device { .. })
    })
    .await;
    assert!(notice.is_sticky());

    let snapshot = fixture.capture.snapshot();
    assert_eq!(snapshot.camera, CameraState::Off);
    assert!(snapshot.device.is_none());

    fixture.capture.shutdown();
}

#[tokio::test]
async fn manual_submit_without_camera_is_rejected() {
    let mut fixture = spawn_fixture(
        ServerState::default(),
        Arc::new(FileFrameSource),
        None,
        false,
    )
    .await;

    fixture.capture.submit_frame();

    expect_notice(&mut fixture.notices, "validation", |n| {
        matches!(n, Notice::Validation { .. })
    })
    .await;
    assert_eq!(fixture.server.with_state(|s| s.process_count), 0);

    fixture.capture.shutdown();
}

#[tokio::test]
async fn paused_service_surfaces_validation_notice() {
    let dir = frame_dir();
    let mut state = ServerState::default();
    state.detection_paused = true;

    let mut fixture =
        spawn_fixture(state, Arc::new(FileFrameSource), None, false).await;

    fixture.capture.start_camera(dir.path().to_str().unwrap());

    let notice = expect_notice(&mut fixture.notices, "paused", |n| {
        matches!(n, Notice::Validation { .. })
    })
    .await;
    assert!(!notice.is_sticky());
    // The loop keeps rescheduling rather than wedging
    assert!(fixture.capture.is_camera_on());

    fixture.capture.shutdown();
}
