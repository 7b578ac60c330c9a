//! Audio playback for remotely synthesized speech

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Plays decoded speech audio.
///
/// `play` resolves when playback has ended (or failed); `stop` interrupts the
/// current playback immediately, causing the pending `play` future to resolve.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Decode and play MP3 audio to completion
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails.
    async fn play(&self, mp3: Vec<u8>) -> Result<()>;

    /// Stop the current playback, if any. Idempotent.
    fn stop(&self);
}

/// Sink that discards audio immediately.
///
/// Stands in when no output device is available so the speech queue keeps
/// draining instead of stalling.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, _mp3: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}
}

/// [`AudioSink`] playing through the default output device via cpal
pub struct CpalSink {
    config: StreamConfig,
    interrupt: Arc<AtomicBool>,
}

impl CpalSink {
    /// Create a sink on the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no output device or suitable config exists.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            config,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, mp3: Vec<u8>) -> Result<()> {
        let samples = decode_mp3(&mp3)?;

        self.interrupt.store(false, Ordering::SeqCst);
        let config = self.config.clone();
        let interrupt = Arc::clone(&self.interrupt);

        tokio::task::spawn_blocking(move || play_samples_blocking(&config, samples, &interrupt))
            .await
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }

    fn stop(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

/// Play samples on the default device, returning when done or interrupted
fn play_samples_blocking(
    config: &StreamConfig,
    samples: Vec<f32>,
    interrupt: &Arc<AtomicBool>,
) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let channels = config.channels as usize;
    let sample_count = samples.len();

    let position = Arc::new(Mutex::new(0usize));
    let finished = Arc::new(AtomicBool::new(false));

    let finished_cb = Arc::clone(&finished);
    let position_cb = Arc::clone(&position);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = position_cb.lock().unwrap();

                for frame in data.chunks_mut(channels) {
                    let sample = if *pos < samples.len() {
                        samples[*pos]
                    } else {
                        finished_cb.store(true, Ordering::SeqCst);
                        0.0
                    };

                    for out in frame.iter_mut() {
                        *out = sample;
                    }

                    if *pos < samples.len() {
                        *pos += 1;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::SeqCst) && !interrupt.load(Ordering::SeqCst) {
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    let interrupted = interrupt.load(Ordering::SeqCst);
    drop(stream);
    tracing::debug!(samples = sample_count, interrupted, "playback finished");

    Ok(())
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                // Convert i16 samples to f32 and fold stereo to mono
                let frame_samples: Vec<f32> = if frame.channels == 2 {
                    frame
                        .data
                        .chunks(2)
                        .map(|chunk| {
                            let left = f32::from(chunk[0]) / 32768.0;
                            let right =
                                f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                            (left + right) / 2.0
                        })
                        .collect()
                } else {
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect()
                };

                samples.extend(frame_samples);
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}
