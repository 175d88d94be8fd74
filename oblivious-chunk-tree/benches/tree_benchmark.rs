#[macro_use]
extern crate criterion;

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use oblivious_chunk_tree::{Blake3Mac, ConcurrentTree, SequentialTree, TreeConfig, verify_signature};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

const CHUNK: usize = 64;

fn signer() -> Blake3Mac {
    Blake3Mac::new([7; 32])
}

fn content(chunks: usize) -> Vec<u8> {
    (0..chunks * CHUNK).map(|i| (i % 251) as u8).collect()
}

fn config() -> TreeConfig {
    TreeConfig::default().with_chunk_size(CHUNK).with_seed(3)
}

fn bench(c: &mut Criterion) {
    {
        let mut group = c.benchmark_group("chunk tree build");
        for chunks in [1_000, 10_000, 100_000] {
            let bytes = content(chunks);
            group.bench_with_input(BenchmarkId::new("chunks", chunks), &bytes, |b, bytes| {
                b.iter(|| SequentialTree::build(bytes, &signer(), config()).expect("build"));
            });
        }
    }

    c.bench_function("sequential insert+delete", |b| {
        let tree = SequentialTree::build(&content(100_000), &signer(), config()).expect("build");
        let chunk = vec![1; CHUNK];
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        b.iter(|| {
            let position = rng.gen_range(0..tree.size());
            tree.insert(&chunk, position, &signer()).expect("insert");
            tree.delete(position, &signer()).expect("delete");
        });
    });

    c.bench_function("concurrent insert+delete", |b| {
        let tree = ConcurrentTree::build(&content(100_000), &signer(), config()).expect("build");
        let worker = tree.worker();
        let chunk = vec![1; CHUNK];
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        b.iter(|| {
            let position = rng.gen_range(0..tree.size());
            worker.insert(&chunk, position, &signer()).expect("insert");
            worker.delete(position, &signer()).expect("delete");
        });
    });

    c.bench_function("verify 10k chunks", |b| {
        let bytes = content(10_000);
        let tree = SequentialTree::build(&bytes, &signer(), config()).expect("build");
        let blob = tree.generate_signature().expect("signature");
        b.iter(|| assert!(verify_signature(black_box(&bytes), &blob, &signer(), CHUNK)));
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench
);
criterion_main!(benches);
