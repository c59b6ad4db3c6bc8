use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tether::{Compressor, RangeCoder};

fn range_coder(c: &mut Criterion) {
    // Mixed payload shaped like a typical batched state-update datagram.
    let payload: Vec<u8> = (0..1200u32)
        .map(|i| if i % 5 == 0 { 0 } else { (i * 31 % 251) as u8 })
        .collect();

    let mut reference = RangeCoder::new();
    let mut compressed = vec![0u8; 4096];
    let compressed_len = reference.compress(&payload, &mut compressed);
    assert!(compressed_len > 0);

    c.bench_function("range_coder_compress_1200", |b| {
        let mut coder = RangeCoder::new();
        let mut out = vec![0u8; 4096];
        b.iter(|| black_box(coder.compress(black_box(&payload), &mut out)));
    });

    c.bench_function("range_coder_decompress_1200", |b| {
        let mut coder = RangeCoder::new();
        let mut out = vec![0u8; 1200];
        b.iter(|| black_box(coder.decompress(black_box(&compressed[..compressed_len]), &mut out)));
    });
}

criterion_group!(benches, range_coder);
criterion_main!(benches);
