//! ThirdEye client - scene narration for a remote object-detection service
//!
//! The client captures frames, submits them to the detection service, shows
//! the annotated result, and speaks the returned summary through one of two
//! synthesis backends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Host UI / CLI                     │
//! │        ActionBridge slots  │  observable snapshots    │
//! └──────────────────┬────────────────────────────────────┘
//!                    │
//! ┌──────────────────▼────────────────────────────────────┐
//! │  CaptureLoop ── frames ──► DetectionClient (HTTP)     │
//! │      ▲                         │ detections + text    │
//! │      │ backpressure            ▼                      │
//! │  SpeechCoordinator ◄── speak(summary)                 │
//! │   ├── remote: /synthesize_speech_google → AudioSink   │
//! │   └── local:  LocalEngine (on-device synthesis)       │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod bridge;
pub mod capture;
pub mod config;
pub mod daemon;
pub mod error;
pub mod notice;
pub mod voice;

pub use bridge::{ActionBridge, ActionSlot};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use notice::Notice;
