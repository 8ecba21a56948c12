use criterion::{criterion_group, criterion_main, Criterion};

use tandem_media::synthetic::colour_bars;
use tandem_media::{
    transform, Encoder, Frame, PixelFormat, RleEncoder, TransformParams, VideoFrame,
};

fn sample_frame() -> Frame {
    let data = colour_bars(1280, 720, 0);
    let video = VideoFrame::new(1280, 720, PixelFormat::Rgba8, data).unwrap();
    Frame::video(0, video)
}

fn bench_transform(c: &mut Criterion) {
    let frame = sample_frame();

    c.bench_function("mirror_720p", |b| {
        let params = TransformParams {
            mirror: true,
            quality: 1.0,
        };
        b.iter(|| transform(&frame, params))
    });

    c.bench_function("half_quality_720p", |b| {
        let params = TransformParams {
            mirror: false,
            quality: 0.5,
        };
        b.iter(|| transform(&frame, params))
    });
}

fn bench_rle(c: &mut Criterion) {
    let frame = sample_frame();
    c.bench_function("rle_encode_720p", |b| {
        let mut encoder = RleEncoder;
        b.iter(|| encoder.encode(&frame).unwrap())
    });
}

criterion_group!(benches, bench_transform, bench_rle);
criterion_main!(benches);
