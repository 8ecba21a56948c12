//! Per-frame transforms: horizontal mirror and quality scaling.
//!
//! Stateless across frames. Audio frames pass through untouched; the
//! timestamp and kind of every frame are preserved.

use std::sync::Arc;

use tandem_common::MediaSettings;

use crate::{Frame, FramePayload, VideoFrame};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    pub mirror: bool,
    /// Resolution factor in `(0, 1]`. Out-of-range values act as 1.0.
    pub quality: f32,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            mirror: false,
            quality: 1.0,
        }
    }
}

impl From<&MediaSettings> for TransformParams {
    fn from(settings: &MediaSettings) -> Self {
        Self {
            mirror: settings.mirror,
            quality: settings.quality,
        }
    }
}

impl TransformParams {
    fn effective_quality(&self) -> f32 {
        if self.quality.is_finite() && self.quality > 0.0 {
            self.quality.min(1.0)
        } else {
            1.0
        }
    }

    pub fn is_identity(&self) -> bool {
        !self.mirror && self.effective_quality() >= 1.0
    }

    /// Output size for a `width`x`height` input, never below 1x1.
    pub fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        let q = self.effective_quality();
        if q >= 1.0 {
            return (width, height);
        }
        let scale = |v: u32| ((v as f32 * q).round() as u32).clamp(1, v.max(1));
        (scale(width), scale(height))
    }
}

pub fn transform(frame: &Frame, params: TransformParams) -> Frame {
    match &frame.payload {
        FramePayload::Video(video) if !params.is_identity() => {
            Frame::video(frame.timestamp_us, transform_video(video, params))
        }
        _ => frame.clone(),
    }
}

fn transform_video(video: &VideoFrame, params: TransformParams) -> VideoFrame {
    let (out_w, out_h) = params.scaled_size(video.width, video.height);
    let bpp = video.format.bytes_per_pixel();
    let src_stride = video.stride();
    let mut out = Vec::with_capacity(out_w as usize * out_h as usize * bpp);

    for y in 0..out_h {
        // Nearest neighbour, sampling at output pixel centres.
        let src_y = ((y as u64 * 2 + 1) * video.height as u64 / (out_h as u64 * 2)) as usize;
        let row = &video.data[src_y * src_stride..(src_y + 1) * src_stride];
        for x in 0..out_w {
            let mut src_x = ((x as u64 * 2 + 1) * video.width as u64 / (out_w as u64 * 2)) as usize;
            if params.mirror {
                src_x = video.width as usize - 1 - src_x;
            }
            out.extend_from_slice(&row[src_x * bpp..(src_x + 1) * bpp]);
        }
    }

    VideoFrame {
        width: out_w,
        height: out_h,
        format: video.format,
        data: Arc::from(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioFrame, MediaKind, PixelFormat};

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, (x ^ y) as u8, 255]);
            }
        }
        Frame::video(
            1234,
            VideoFrame::new(width, height, PixelFormat::Rgba8, data).unwrap(),
        )
    }

    #[test]
    fn identity_returns_equal_frame() {
        let frame = gradient(7, 5);
        assert_eq!(transform(&frame, TransformParams::default()), frame);
    }

    #[test]
    fn mirror_is_its_own_inverse() {
        let frame = gradient(7, 5);
        let params = TransformParams {
            mirror: true,
            quality: 1.0,
        };
        let once = transform(&frame, params);
        assert_ne!(once, frame);
        assert_eq!(once.as_video().unwrap().pixel(0, 0), frame.as_video().unwrap().pixel(6, 0));
        assert_eq!(transform(&once, params), frame);
    }

    #[test]
    fn quality_scales_resolution() {
        let frame = gradient(64, 48);
        let out = transform(
            &frame,
            TransformParams {
                mirror: false,
                quality: 0.5,
            },
        );
        let video = out.as_video().unwrap();
        assert_eq!((video.width, video.height), (32, 24));
        assert_eq!(video.data.len(), 32 * 24 * 4);
        assert_eq!(out.timestamp_us, 1234);
        assert_eq!(out.kind(), MediaKind::Video);
        // Output (0,0) samples source (1,1).
        assert_eq!(video.pixel(0, 0), &[1, 1, 0, 255]);
    }

    #[test]
    fn tiny_quality_keeps_one_pixel() {
        let params = TransformParams {
            mirror: true,
            quality: 0.001,
        };
        assert_eq!(params.scaled_size(10, 10), (1, 1));
        let out = transform(&gradient(10, 10), params);
        assert_eq!(out.as_video().unwrap().data.len(), 4);
    }

    #[test]
    fn invalid_quality_behaves_as_full() {
        for quality in [0.0, -1.0, f32::NAN, 3.0] {
            let params = TransformParams {
                mirror: false,
                quality,
            };
            assert!(params.is_identity(), "{quality}");
        }
    }

    #[test]
    fn audio_passes_through() {
        let frame = Frame::audio(9, AudioFrame::new(48_000, 1, vec![1, 2, 3]).unwrap());
        let out = transform(
            &frame,
            TransformParams {
                mirror: true,
                quality: 0.5,
            },
        );
        assert_eq!(out, frame);
    }
}
