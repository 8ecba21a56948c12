//! Capture backends.
//!
//! A backend turns a device (or a generator) into a [`MediaTrack`]. The
//! device side runs in its own task and pushes into the track's single
//! writer; consumers only ever pull.

use std::f32::consts::TAU;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::{AudioFrame, Frame, MediaError, MediaKind, MediaTrack, PixelFormat, TrackWriter, VideoFrame};

/// Opens local capture tracks.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, kind: MediaKind) -> Result<CaptureHandle, MediaError>;
}

/// A running capture. Dropping it stops the capture and ends the track.
#[derive(Debug)]
pub struct CaptureHandle {
    track: MediaTrack,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn new(track: MediaTrack, task: JoinHandle<()>) -> Self {
        Self { track, task }
    }

    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Duration of one audio frame.
    pub audio_frame_ms: u32,
    pub tone_hz: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 15,
            sample_rate: 48_000,
            channels: 1,
            audio_frame_ms: 20,
            tone_hz: 440.0,
        }
    }
}

/// Moving colour bars and a sine tone.
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    config: SyntheticConfig,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }
}

impl CaptureBackend for SyntheticBackend {
    fn open(&self, kind: MediaKind) -> Result<CaptureHandle, MediaError> {
        let config = self.config;
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(MediaError::Capture("video size and rate must be non-zero".into()));
        }
        if config.sample_rate == 0 || config.channels == 0 || config.audio_frame_ms == 0 {
            return Err(MediaError::Capture("audio rate and framing must be non-zero".into()));
        }

        let (writer, track) = MediaTrack::channel(kind, format!("synthetic-{kind}"));
        let task = match kind {
            MediaKind::Video => tokio::spawn(run_video(writer, config)),
            MediaKind::Audio => tokio::spawn(run_audio(writer, config)),
        };
        Ok(CaptureHandle::new(track, task))
    }
}

const BAR_COLOURS: [[u8; 4]; 8] = [
    [255, 255, 255, 255],
    [255, 255, 0, 255],
    [0, 255, 255, 255],
    [0, 255, 0, 255],
    [255, 0, 255, 255],
    [255, 0, 0, 255],
    [0, 0, 255, 255],
    [0, 0, 0, 255],
];

/// Colour bars shifted right by `offset` pixels.
pub fn colour_bars(width: u32, height: u32, offset: u32) -> Vec<u8> {
    let bar_width = (width / BAR_COLOURS.len() as u32).max(1);
    let mut row = Vec::with_capacity(width as usize * 4);
    for x in 0..width {
        let bar = ((x + width - offset % width.max(1)) / bar_width) as usize % BAR_COLOURS.len();
        row.extend_from_slice(&BAR_COLOURS[bar]);
    }
    let mut data = Vec::with_capacity(row.len() * height as usize);
    for _ in 0..height {
        data.extend_from_slice(&row);
    }
    data
}

async fn run_video(mut writer: TrackWriter, config: SyntheticConfig) {
    let start = Instant::now();
    let mut ticker = time::interval(Duration::from_micros(1_000_000 / config.fps as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frame_no: u32 = 0;

    loop {
        ticker.tick().await;
        let data = colour_bars(config.width, config.height, frame_no.wrapping_mul(2));
        let frame = match VideoFrame::new(config.width, config.height, PixelFormat::Rgba8, data) {
            Ok(video) => Frame::video(start.elapsed().as_micros() as u64, video),
            Err(err) => {
                debug!("synthetic video stopped: {}", err);
                return;
            }
        };
        if writer.push(frame).is_err() {
            return;
        }
        frame_no = frame_no.wrapping_add(1);
    }
}

async fn run_audio(mut writer: TrackWriter, config: SyntheticConfig) {
    let samples_per_frame = (config.sample_rate as u64 * config.audio_frame_ms as u64 / 1000) as usize;
    let mut ticker = time::interval(Duration::from_millis(config.audio_frame_ms as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut phase = 0.0f32;
    let step = TAU * config.tone_hz / config.sample_rate as f32;
    let mut sample_clock: u64 = 0;

    loop {
        ticker.tick().await;
        let mut samples = Vec::with_capacity(samples_per_frame * config.channels as usize);
        for _ in 0..samples_per_frame {
            let value = (phase.sin() * i16::MAX as f32 * 0.25) as i16;
            for _ in 0..config.channels {
                samples.push(value);
            }
            phase = (phase + step) % TAU;
        }
        let timestamp_us = sample_clock * 1_000_000 / config.sample_rate as u64;
        sample_clock += samples_per_frame as u64;

        let frame = match AudioFrame::new(config.sample_rate, config.channels, samples) {
            Ok(audio) => Frame::audio(timestamp_us, audio),
            Err(err) => {
                debug!("synthetic audio stopped: {}", err);
                return;
            }
        };
        if writer.push(frame).is_err() {
            return;
        }
    }
}
