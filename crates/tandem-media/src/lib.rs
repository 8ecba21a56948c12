//! Media model for tandem: frames, tracks, transforms and codecs.
//!
//! Capture sources and decoded remote streams are both exposed as
//! [`MediaTrack`]s, a pull-based cursor over a shared most-recent-frame slot.
//! Frames are immutable; transforms return new frames.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;
pub mod synthetic;
pub mod track;
pub mod transform;

pub use codec::{decoder_for, encoder_for, L16Decoder, L16Encoder, RleDecoder, RleEncoder};
pub use synthetic::{CaptureBackend, CaptureHandle, SyntheticBackend, SyntheticConfig};
pub use track::{MediaTrack, TrackReader, TrackWriter};
pub use transform::{transform, TransformParams};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("expected a {expected:?} frame, got {got:?}")]
    KindMismatch { expected: MediaKind, got: MediaKind },

    #[error("timestamp {got}us is older than {previous}us")]
    NonMonotonicTimestamp { previous: u64, got: u64 },

    #[error("track ended")]
    TrackEnded,

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("capture backend error: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PixelFormat {
    Rgba8 = 1,
    Gray8 = 2,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::Gray8 => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Rgba8),
            2 => Some(Self::Gray8),
            _ => None,
        }
    }
}

/// Tightly packed pixel grid (stride = width * bytes per pixel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Arc<[u8]>,
}

impl VideoFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, MediaError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if width == 0 || height == 0 || data.len() != expected {
            return Err(MediaError::InvalidFrame(format!(
                "{width}x{height} {format:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data: data.into(),
        })
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let start = y as usize * self.stride() + x as usize * bpp;
        &self.data[start..start + bpp]
    }
}

/// Interleaved signed 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Arc<[i16]>,
}

impl AudioFrame {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Result<Self, MediaError> {
        if sample_rate == 0 || channels == 0 || samples.len() % channels as usize != 0 {
            return Err(MediaError::InvalidFrame(format!(
                "{} samples do not fit {channels} channels at {sample_rate}Hz",
                samples.len()
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            samples: samples.into(),
        })
    }

    pub fn duration_us(&self) -> u64 {
        let per_channel = (self.samples.len() / self.channels as usize) as u64;
        per_channel * 1_000_000 / self.sample_rate as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Video(VideoFrame),
    Audio(AudioFrame),
}

/// A timestamped unit of media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp_us: u64,
    pub payload: FramePayload,
}

impl Frame {
    pub fn video(timestamp_us: u64, video: VideoFrame) -> Self {
        Self {
            timestamp_us,
            payload: FramePayload::Video(video),
        }
    }

    pub fn audio(timestamp_us: u64, audio: AudioFrame) -> Self {
        Self {
            timestamp_us,
            payload: FramePayload::Audio(audio),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self.payload {
            FramePayload::Video(_) => MediaKind::Video,
            FramePayload::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn as_video(&self) -> Option<&VideoFrame> {
        match &self.payload {
            FramePayload::Video(v) => Some(v),
            FramePayload::Audio(_) => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioFrame> {
        match &self.payload {
            FramePayload::Audio(a) => Some(a),
            FramePayload::Video(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

pub trait Encoder: Send {
    fn kind(&self) -> MediaKind;
    fn encode(&mut self, frame: &Frame) -> Result<EncodedFrame, MediaError>;
}

pub trait Decoder: Send {
    fn kind(&self) -> MediaKind;
    fn decode(&mut self, payload: &[u8], timestamp_us: u64) -> Result<Frame, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_validates_size() {
        assert!(VideoFrame::new(2, 2, PixelFormat::Rgba8, vec![0; 16]).is_ok());
        assert!(VideoFrame::new(2, 2, PixelFormat::Rgba8, vec![0; 15]).is_err());
        assert!(VideoFrame::new(0, 2, PixelFormat::Gray8, vec![]).is_err());
    }

    #[test]
    fn audio_frame_duration() {
        let frame = AudioFrame::new(48_000, 2, vec![0; 960 * 2]).unwrap();
        assert_eq!(frame.duration_us(), 20_000);
        assert!(AudioFrame::new(48_000, 2, vec![0; 3]).is_err());
    }

    #[test]
    fn frame_kind() {
        let video = VideoFrame::new(1, 1, PixelFormat::Gray8, vec![9]).unwrap();
        let frame = Frame::video(5, video);
        assert_eq!(frame.kind(), MediaKind::Video);
        assert!(frame.as_audio().is_none());
        assert_eq!(frame.as_video().unwrap().pixel(0, 0), &[9]);
    }
}
