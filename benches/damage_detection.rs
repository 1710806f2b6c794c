//! Damage detection benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lamco_rdp_session::graphics::buffer::RdpBuffer;
use lamco_rdp_session::graphics::damage::DamageDetector;

fn frame(width: u32, height: u32, seed: u8) -> RdpBuffer {
    let mut data = vec![0u8; (width * height * 4) as usize];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(seed);
    }
    RdpBuffer::standalone(width, height, width * 4, data)
}

fn bench_static_frame(c: &mut Criterion) {
    let mut detector = DamageDetector::new(1920, 1080);
    let f = frame(1920, 1080, 1);
    let _ = detector.detect(&f);

    c.bench_function("damage_static_1080p", |b| {
        b.iter(|| black_box(detector.detect(&f)))
    });
}

fn bench_partial_change(c: &mut Criterion) {
    let mut detector = DamageDetector::new(1920, 1080);
    let f1 = frame(1920, 1080, 1);
    let mut f2 = frame(1920, 1080, 1);
    // Touch a 64×64 block in the middle.
    for y in 512..576 {
        for x in 960..1024 {
            f2.data_mut()[(y * 1920 + x) * 4] ^= 0xFF;
        }
    }
    let _ = detector.detect(&f1);

    c.bench_function("damage_partial_1080p", |b| {
        b.iter(|| {
            black_box(detector.detect(&f2));
            black_box(detector.detect(&f1));
        })
    });
}

fn bench_full_change(c: &mut Criterion) {
    let mut detector = DamageDetector::new(1920, 1080);
    let f1 = frame(1920, 1080, 1);
    let f2 = frame(1920, 1080, 3);
    let _ = detector.detect(&f1);

    c.bench_function("damage_full_1080p", |b| {
        b.iter(|| {
            black_box(detector.detect(&f2));
            black_box(detector.detect(&f1));
        })
    });
}

criterion_group!(
    benches,
    bench_static_frame,
    bench_partial_change,
    bench_full_change
);
criterion_main!(benches);
