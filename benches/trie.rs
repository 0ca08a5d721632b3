use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use std::time::Duration;

use vtrie::gc::MarkSweep;
use vtrie::model::Blake3Hasher;
use vtrie::proof::{to_wire, verify};
use vtrie::store::MemoryBackend;
use vtrie::{GcOptions, GcStrategy, KvNodeStore, RetentionPolicy, VersionedTrie};

fn get_entries(n: usize, salt: u64) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    (0..n)
        .map(|i| {
            let key = format!("account-{:08}", i).into_bytes();
            let value = blake3::hash(&[&i.to_le_bytes()[..], &salt.to_le_bytes()].concat());
            (key, Some(value.as_bytes().to_vec()))
        })
        .collect()
}

fn create_trie() -> VersionedTrie {
    let store = KvNodeStore::new(Arc::new(MemoryBackend::new()), "bench").unwrap();
    VersionedTrie::new(Arc::new(store), Arc::new(Blake3Hasher))
}

fn filled_trie(size: usize, versions: u64) -> VersionedTrie {
    let trie = create_trie();
    for v in 1..=versions {
        trie.apply(v, get_entries(size, v)).unwrap();
    }
    trie
}

fn commit_batch(c: &mut Criterion) {
    for size in [100, 1_000] {
        c.bench_function(&format!("Trie: commit {size} keys"), move |b| {
            let entries = get_entries(size, 0);
            b.iter_batched(
                || (create_trie(), entries.clone()),
                |(trie, entries)| {
                    trie.apply(1, entries).unwrap();
                },
                BatchSize::SmallInput,
            );
        });
    }
}

fn update_existing(c: &mut Criterion) {
    let trie = filled_trie(10_000, 1);
    let mut version = 1;
    c.bench_function("Trie: update 100 of 10000 keys", |b| {
        b.iter(|| {
            version += 1;
            let updates = get_entries(100, version);
            trie.apply(version, updates).unwrap();
        });
    });
}

fn read_historical(c: &mut Criterion) {
    let trie = filled_trie(1_000, 8);
    c.bench_function("Trie: get at historical version", |b| {
        b.iter(|| trie.get(b"account-00000500", 3).unwrap());
    });
}

fn prove_and_verify(c: &mut Criterion) {
    let trie = filled_trie(10_000, 1);
    let root = trie.latest_root_hash().unwrap();
    let (h, s) = (trie.hasher().as_ref(), trie.commitment().as_ref());
    let key = b"account-00004242";

    c.bench_function("Trie: prove", |b| {
        b.iter(|| {
            let proof = trie.prove(key, 1).unwrap().unwrap();
            to_wire(&proof, key, h, s).unwrap()
        });
    });

    let proof = trie.prove(key, 1).unwrap().unwrap();
    let value = proof.value.clone();
    let wire = to_wire(&proof, key, h, s).unwrap();
    c.bench_function("Trie: verify", |b| {
        b.iter(|| assert!(verify(&root, key, value.as_deref(), true, &wire, h, s)));
    });
}

fn collect_garbage(c: &mut Criterion) {
    c.bench_function("Trie: mark-sweep 20 versions", |b| {
        b.iter_batched(
            || filled_trie(500, 20),
            |trie| {
                let store = trie.store().as_ref();
                MarkSweep::default()
                    .run(store, store, &RetentionPolicy::KeepLatest(2), &GcOptions::default())
                    .unwrap()
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    name = trie;
    config = Criterion::default().warm_up_time(Duration::from_millis(500)).sample_size(10);
    targets = commit_batch, update_existing, read_historical, prove_and_verify, collect_garbage
);

criterion_main!(trie);
