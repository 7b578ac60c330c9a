//! Frame capture: sources, sessions, and the live loop

mod runner;

pub use runner::{CaptureCommand, CaptureHandle, CaptureLoop, CaptureSnapshot};

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::api::{DetectionClient, DetectionResult};
use crate::{Error, Result};

/// Frame dimensions assumed when the source does not report its own
pub const FALLBACK_WIDTH: u32 = 640;
/// Frame dimensions assumed when the source does not report its own
pub const FALLBACK_HEIGHT: u32 = 480;

/// One captured frame, already JPEG-encoded
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes
    pub jpeg: Vec<u8>,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,
}

/// A live stream of frames from one device.
///
/// Exclusively owned by its [`CaptureSession`]; `stop` releases the
/// underlying device.
pub trait FrameStream: Send {
    /// Capture the next frame
    ///
    /// # Errors
    ///
    /// Returns error if the device fails or the stream is stopped.
    fn grab(&mut self) -> Result<Frame>;

    /// Whether the stream is still delivering frames
    fn is_active(&self) -> bool;

    /// Release the underlying device. Idempotent.
    fn stop(&mut self);
}

/// Opens frame streams for named devices
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Acquire a stream from `device`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened (missing, permission
    /// denied); callers treat this as fail-closed.
    async fn open(&self, device: &str) -> Result<Box<dyn FrameStream>>;
}

/// Camera lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// No stream held
    Off,
    /// Acquiring a stream
    Starting,
    /// Stream live, frames flowing
    On,
    /// Tearing down one stream before acquiring another
    Switching,
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Starting => "starting",
            Self::On => "on",
            Self::Switching => "switching",
        };
        f.write_str(name)
    }
}

/// Handle to one annotated frame returned by the service.
///
/// The image lives in a temp file that is deleted when the handle drops, so
/// superseding or discarding a frame always releases its storage.
#[derive(Debug)]
pub struct ProcessedFrame {
    file: tempfile::NamedTempFile,
    len: usize,
}

impl ProcessedFrame {
    /// Persist annotated JPEG bytes into a new handle
    ///
    /// # Errors
    ///
    /// Returns error if the temp file cannot be written.
    pub fn new(jpeg: &[u8]) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("thirdeye-frame-")
            .suffix(".jpg")
            .tempfile()?;
        file.write_all(jpeg)?;
        file.flush()?;

        Ok(Self {
            file,
            len: jpeg.len(),
        })
    }

    /// Path to the annotated image
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Encoded size in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the frame is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One camera-active lifetime: the stream plus its processing state
pub struct CaptureSession {
    /// Device the stream was opened on
    pub device_id: String,

    /// The live stream; exclusively owned here
    pub stream: Box<dyn FrameStream>,

    /// A frame round-trip is in flight
    pub processing: bool,

    /// Latest annotated frame; replaced handles release their storage
    pub annotated: Option<ProcessedFrame>,
}

impl CaptureSession {
    /// Wrap a freshly opened stream
    #[must_use]
    pub fn new(device_id: String, stream: Box<dyn FrameStream>) -> Self {
        Self {
            device_id,
            stream,
            processing: false,
            annotated: None,
        }
    }

    /// Stop the stream and release the annotated-frame handle
    pub fn close(&mut self) {
        self.stream.stop();
        self.annotated = None;
    }
}

/// [`FrameSource`] reading JPEG frames from a file or directory.
///
/// The device identifier is a path: a single JPEG is replayed every tick, a
/// directory is cycled in sorted order. Real camera devices plug in behind
/// the same trait.
#[derive(Debug, Default)]
pub struct FileFrameSource;

#[async_trait]
impl FrameSource for FileFrameSource {
    async fn open(&self, device: &str) -> Result<Box<dyn FrameStream>> {
        let path = PathBuf::from(device);
        if !path.exists() {
            return Err(Error::Camera(format!("no such device: {device}")));
        }

        let frames = if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&path)?
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
                })
                .collect();
            entries.sort();
            entries
        } else {
            vec![path]
        };

        if frames.is_empty() {
            return Err(Error::Camera(format!("device has no frames: {device}")));
        }

        tracing::debug!(device, frames = frames.len(), "frame stream opened");

        Ok(Box::new(FileFrameStream {
            frames,
            next: 0,
            active: true,
        }))
    }
}

struct FileFrameStream {
    frames: Vec<PathBuf>,
    next: usize,
    active: bool,
}

impl FrameStream for FileFrameStream {
    fn grab(&mut self) -> Result<Frame> {
        if !self.active {
            return Err(Error::Camera("stream is stopped".to_string()));
        }

        let path = &self.frames[self.next % self.frames.len()];
        self.next = self.next.wrapping_add(1);

        let jpeg = std::fs::read(path)?;
        let (width, height) =
            jpeg_dimensions(&jpeg).unwrap_or((FALLBACK_WIDTH, FALLBACK_HEIGHT));

        Ok(Frame {
            jpeg,
            width,
            height,
        })
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) {
        self.active = false;
    }
}

/// One-shot dual-request round-trip for a still image.
///
/// The same two submissions the live loop makes for every frame: one with
/// `draw_boxes=true` for the annotated JPEG, one plain for the structured
/// detections. The annotated frame is best effort; its failure does not fail
/// the detection.
///
/// # Errors
///
/// Returns error if the plain detection submission fails.
pub async fn process_still(
    client: &DetectionClient,
    jpeg: Vec<u8>,
) -> Result<(DetectionResult, Option<Vec<u8>>)> {
    let annotated = match client.process_image_annotated(jpeg.clone()).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "annotated frame request failed");
            None
        }
    };

    let result = client.process_image(jpeg).await?;
    Ok((result, annotated))
}

/// Read image dimensions from JPEG start-of-frame markers
fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }

    let mut i = 2;
    while i + 9 < data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];

        // SOF0-SOF15 except DHT (C4), JPG (C8), DAC (CC)
        if (0xC0..=0xCF).contains(&marker) && ![0xC4, 0xC8, 0xCC].contains(&marker) {
            let height = u32::from(u16::from_be_bytes([data[i + 5], data[i + 6]]));
            let width = u32::from(u16::from_be_bytes([data[i + 7], data[i + 8]]));
            return Some((width, height));
        }

        let length = usize::from(u16::from_be_bytes([data[i + 2], data[i + 3]]));
        i += 2 + length;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal JPEG prelude: SOI, then an SOF0 declaring 480x640
    fn fake_jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        data
    }

    #[test]
    fn reads_dimensions_from_sof_marker() {
        let jpeg = fake_jpeg(1280, 720);
        assert_eq!(jpeg_dimensions(&jpeg), Some((1280, 720)));
    }

    #[test]
    fn falls_back_on_non_jpeg_data() {
        assert_eq!(jpeg_dimensions(b"not a jpeg"), None);
        assert_eq!(jpeg_dimensions(&[]), None);
    }

    #[test]
    fn processed_frame_releases_storage_on_drop() {
        let frame = ProcessedFrame::new(b"annotated bytes").unwrap();
        let path = frame.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(frame.len(), 15);

        drop(frame);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_source_cycles_directory_frames() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), fake_jpeg(640, 480)).unwrap();
        std::fs::write(dir.path().join("b.jpg"), fake_jpeg(320, 240)).unwrap();
        std::fs::write(dir.path().join("ignore.txt"), b"nope").unwrap();

        let source = FileFrameSource;
        let mut stream = source.open(dir.path().to_str().unwrap()).await.unwrap();

        let first = stream.grab().unwrap();
        let second = stream.grab().unwrap();
        let third = stream.grab().unwrap();
        assert_eq!((first.width, first.height), (640, 480));
        assert_eq!((second.width, second.height), (320, 240));
        assert_eq!((third.width, third.height), (640, 480));

        stream.stop();
        assert!(!stream.is_active());
        assert!(stream.grab().is_err());
    }

    #[tokio::test]
    async fn file_source_fails_closed_on_missing_device() {
        let source = FileFrameSource;
        let result = source.open("/no/such/device").await;
        assert!(matches!(result, Err(Error::Camera(_))));
    }
}
