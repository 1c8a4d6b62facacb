use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mailvault::{get_codec, Algorithm};

fn compressible_payload(size: usize) -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog. ".iter().copied().cycle().take(size).collect()
}

fn bench_compress(c: &mut Criterion) {
    let payload = compressible_payload(256 * 1024);
    let mut group = c.benchmark_group("codec_compress_256kib");
    for alg in [Algorithm::None, Algorithm::Gzip, Algorithm::Zstd, Algorithm::Brotli, Algorithm::Lz4] {
        let codec = get_codec(alg);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{alg:?}")), &alg, |b, _| {
            b.iter(|| codec.compress(black_box(&payload)).unwrap());
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let payload = compressible_payload(256 * 1024);
    let mut group = c.benchmark_group("codec_round_trip_256kib");
    for alg in [Algorithm::Gzip, Algorithm::Zstd, Algorithm::Brotli, Algorithm::Lz4] {
        let codec = get_codec(alg);
        let compressed = codec.compress(&payload).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(format!("{alg:?}")), &alg, |b, _| {
            b.iter(|| codec.decompress(black_box(&compressed)).unwrap());
        });
    }
    group.finish();
}

fn bench_block_codec(c: &mut Criterion) {
    use mailvault::{Block, BlockKind, PayloadEncoding};
    let payload = compressible_payload(64 * 1024);
    let block = Block::new(BlockKind::EmailBatch, 0, PayloadEncoding::RawBytes, 1_700_000_000, 1, payload);

    c.bench_function("block_encode_64kib", |b| {
        b.iter(|| mailvault::block::encode(black_box(&block)).unwrap());
    });

    let encoded = mailvault::block::encode(&block).unwrap();
    c.bench_function("block_decode_64kib", |b| {
        b.iter(|| mailvault::block::decode(black_box(&encoded)).unwrap());
    });
}

criterion_group!(benches, bench_compress, bench_round_trip, bench_block_codec);
criterion_main!(benches);
