//! Built-in software codecs.
//!
//! - `TRLE`: intra-only run-length coding of raw pixels. Every frame is a
//!   keyframe, so a lost frame never corrupts the ones after it.
//! - `L16`: big-endian 16-bit PCM.
//!
//! Bitstreams start with a small header so decoders can reject payloads
//! that were truncated or belong to the other kind.

use crate::{
    AudioFrame, Decoder, EncodedFrame, Encoder, Frame, MediaError, MediaKind, PixelFormat,
    VideoFrame,
};

const RLE_MAGIC: [u8; 2] = *b"TV";
const RLE_HEADER: usize = 2 + 1 + 4 + 4;
const L16_MAGIC: [u8; 2] = *b"TA";
const L16_HEADER: usize = 2 + 4 + 2;

/// Upper bound on decoded frame area, guards against hostile headers.
const MAX_PIXELS: u64 = 8192 * 8192;

pub fn encoder_for(kind: MediaKind) -> Box<dyn Encoder> {
    match kind {
        MediaKind::Video => Box::new(RleEncoder),
        MediaKind::Audio => Box::new(L16Encoder),
    }
}

pub fn decoder_for(kind: MediaKind) -> Box<dyn Decoder> {
    match kind {
        MediaKind::Video => Box::new(RleDecoder),
        MediaKind::Audio => Box::new(L16Decoder),
    }
}

#[derive(Debug, Default)]
pub struct RleEncoder;

impl Encoder for RleEncoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn encode(&mut self, frame: &Frame) -> Result<EncodedFrame, MediaError> {
        let video = frame.as_video().ok_or(MediaError::KindMismatch {
            expected: MediaKind::Video,
            got: frame.kind(),
        })?;
        let bpp = video.format.bytes_per_pixel();

        let mut out = Vec::with_capacity(RLE_HEADER + video.data.len() / 8);
        out.extend_from_slice(&RLE_MAGIC);
        out.push(video.format as u8);
        out.extend_from_slice(&video.width.to_be_bytes());
        out.extend_from_slice(&video.height.to_be_bytes());

        let mut pixels = video.data.chunks_exact(bpp).peekable();
        while let Some(pixel) = pixels.next() {
            let mut run: u8 = 1;
            while run < u8::MAX && pixels.peek() == Some(&pixel) {
                pixels.next();
                run += 1;
            }
            out.push(run);
            out.extend_from_slice(pixel);
        }

        Ok(EncodedFrame {
            timestamp_us: frame.timestamp_us,
            keyframe: true,
            data: out,
        })
    }
}

#[derive(Debug, Default)]
pub struct RleDecoder;

impl Decoder for RleDecoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn decode(&mut self, payload: &[u8], timestamp_us: u64) -> Result<Frame, MediaError> {
        if payload.len() < RLE_HEADER || payload[0..2] != RLE_MAGIC {
            return Err(MediaError::Decode("missing TRLE header".into()));
        }
        let format = PixelFormat::from_u8(payload[2])
            .ok_or_else(|| MediaError::Decode(format!("unknown pixel format {}", payload[2])))?;
        let width = u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]);
        let height = u32::from_be_bytes([payload[7], payload[8], payload[9], payload[10]]);
        let pixels = width as u64 * height as u64;
        if pixels == 0 || pixels > MAX_PIXELS {
            return Err(MediaError::Decode(format!("bad dimensions {width}x{height}")));
        }

        let bpp = format.bytes_per_pixel();
        let expected = pixels as usize * bpp;
        let mut data = Vec::with_capacity(expected);
        for run in payload[RLE_HEADER..].chunks(1 + bpp) {
            if run.len() != 1 + bpp || run[0] == 0 {
                return Err(MediaError::Decode("truncated run".into()));
            }
            for _ in 0..run[0] {
                data.extend_from_slice(&run[1..]);
            }
            if data.len() > expected {
                return Err(MediaError::Decode("runs overflow frame".into()));
            }
        }
        if data.len() != expected {
            return Err(MediaError::Decode(format!(
                "decoded {} of {expected} bytes",
                data.len()
            )));
        }

        let video = VideoFrame::new(width, height, format, data)
            .map_err(|err| MediaError::Decode(err.to_string()))?;
        Ok(Frame::video(timestamp_us, video))
    }
}

#[derive(Debug, Default)]
pub struct L16Encoder;

impl Encoder for L16Encoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn encode(&mut self, frame: &Frame) -> Result<EncodedFrame, MediaError> {
        let audio = frame.as_audio().ok_or(MediaError::KindMismatch {
            expected: MediaKind::Audio,
            got: frame.kind(),
        })?;
        let mut out = Vec::with_capacity(L16_HEADER + audio.samples.len() * 2);
        out.extend_from_slice(&L16_MAGIC);
        out.extend_from_slice(&audio.sample_rate.to_be_bytes());
        out.extend_from_slice(&audio.channels.to_be_bytes());
        for sample in audio.samples.iter() {
            out.extend_from_slice(&sample.to_be_bytes());
        }
        Ok(EncodedFrame {
            timestamp_us: frame.timestamp_us,
            keyframe: true,
            data: out,
        })
    }
}

#[derive(Debug, Default)]
pub struct L16Decoder;

impl Decoder for L16Decoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn decode(&mut self, payload: &[u8], timestamp_us: u64) -> Result<Frame, MediaError> {
        if payload.len() < L16_HEADER || payload[0..2] != L16_MAGIC {
            return Err(MediaError::Decode("missing L16 header".into()));
        }
        let sample_rate = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let channels = u16::from_be_bytes([payload[6], payload[7]]);
        let body = &payload[L16_HEADER..];
        if body.len() % 2 != 0 {
            return Err(MediaError::Decode("odd PCM byte count".into()));
        }
        let samples = body
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect();
        let audio = AudioFrame::new(sample_rate, channels, samples)
            .map_err(|err| MediaError::Decode(err.to_string()))?;
        Ok(Frame::audio(timestamp_us, audio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars() -> Frame {
        let mut data = Vec::new();
        for _ in 0..6 {
            for x in 0..300u32 {
                let v = (x / 100) as u8 * 80;
                data.extend_from_slice(&[v, 255 - v, 0, 255]);
            }
        }
        Frame::video(42, VideoFrame::new(300, 6, PixelFormat::Rgba8, data).unwrap())
    }

    #[test]
    fn rle_reproduces_pixels_and_compresses() {
        let frame = bars();
        let encoded = RleEncoder.encode(&frame).unwrap();
        assert!(encoded.keyframe);
        assert!(encoded.data.len() < 300 * 6 * 4 / 10);
        let decoded = RleDecoder.decode(&encoded.data, 42).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rle_rejects_damage() {
        let encoded = RleEncoder.encode(&bars()).unwrap().data;
        assert!(RleDecoder.decode(&encoded[..encoded.len() - 3], 0).is_err());
        assert!(RleDecoder.decode(&encoded[..5], 0).is_err());
        let mut wrong_dims = encoded.clone();
        wrong_dims[10] = 200;
        assert!(RleDecoder.decode(&wrong_dims, 0).is_err());
        let mut zero_run = encoded;
        zero_run[RLE_HEADER] = 0;
        assert!(RleDecoder.decode(&zero_run, 0).is_err());
    }

    #[test]
    fn l16_reproduces_samples() {
        let frame = Frame::audio(
            7,
            AudioFrame::new(48_000, 2, vec![i16::MIN, -1, 0, i16::MAX]).unwrap(),
        );
        let encoded = L16Encoder.encode(&frame).unwrap();
        assert_eq!(L16Decoder.decode(&encoded.data, 7).unwrap(), frame);
        assert!(L16Decoder.decode(&encoded.data[..encoded.data.len() - 1], 7).is_err());
    }

    #[test]
    fn codecs_refuse_other_kind() {
        let encoded = L16Encoder
            .encode(&Frame::audio(1, AudioFrame::new(8_000, 1, vec![0]).unwrap()))
            .unwrap();
        assert!(RleDecoder.decode(&encoded.data, 1).is_err());
        assert!(matches!(
            encoder_for(MediaKind::Audio).encode(&bars()),
            Err(MediaError::KindMismatch { .. })
        ));
    }
}
