use std::hint::black_box;
use std::sync::Arc;

use booru_index::db::MemoryStore;
use booru_index::hamming::{hamming_128, hamming_naive};
use booru_index::imhash::Fingerprint;
use booru_index::neardup::NearDupIndex;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;

fn bench_hamming(c: &mut Criterion) {
    let mut group = c.benchmark_group("Hamming");
    let mut rng = rand::rng();
    let mut src = [0u8; 16];
    let mut dst = vec![0u8; 8 << 20];
    rng.fill_bytes(&mut src);
    rng.fill_bytes(&mut dst);
    let (dst, _) = dst.as_chunks::<16>();

    group.throughput(Throughput::Bytes((dst.len() * 16) as u64));
    group.bench_function("hamming_16_naive", |b| {
        b.iter(|| dst.iter().map(|chunk| hamming_naive::<16>(&src, black_box(chunk))).sum::<u32>());
    });
    group.bench_function("hamming_16_u128", |b| {
        b.iter(|| dst.iter().map(|chunk| hamming_128(&src, black_box(chunk))).sum::<u32>());
    });
    group.finish();
}

fn bench_bucket_search(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let mut rng = rand::rng();
    let index = NearDupIndex::new(Arc::new(MemoryStore::new()));

    rt.block_on(async {
        for id in 0..20_000u64 {
            let mut fp = [0u8; 16];
            rng.fill_bytes(&mut fp);
            index.insert(&Fingerprint::from(fp), id).await.unwrap();
        }
    });

    let mut query = [0u8; 16];
    rng.fill_bytes(&mut query);

    c.bench_function("bucket_search_20k", |b| {
        b.iter(|| rt.block_on(index.search(black_box(&query), 24)).unwrap());
    });
}

criterion_group!(benches, bench_hamming, bench_bucket_search);
criterion_main!(benches);
