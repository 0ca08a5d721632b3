//! Property-based tests for the versioned trie.
//!
//! Run with: `cargo test --test trie_properties`

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use vtrie::gc::{Incremental, MarkSweep};
use vtrie::model::Blake3Hasher;
use vtrie::proof::{to_wire, verify};
use vtrie::store::MemoryBackend;
use vtrie::{GcOptions, GcStrategy, KvNodeStore, RetentionPolicy, VersionedTrie};

// =============================================================================
// Strategies for generating test data
// =============================================================================

type Update = (Vec<u8>, Option<Vec<u8>>);

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    // a small alphabet so updates and deletes hit existing keys
    prop::collection::vec(0u8..6, 1..4)
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..24)
}

fn update_strategy() -> impl Strategy<Value = Update> {
    (key_strategy(), prop::option::weighted(0.75, value_strategy()))
}

/// A history of commits, each a list of updates
fn history_strategy() -> impl Strategy<Value = Vec<Vec<Update>>> {
    prop::collection::vec(prop::collection::vec(update_strategy(), 0..12), 1..8)
}

fn new_trie() -> VersionedTrie {
    let store = KvNodeStore::new(Arc::new(MemoryBackend::new()), "props").unwrap();
    VersionedTrie::new(Arc::new(store), Arc::new(Blake3Hasher))
}

/// Commit `history` at versions 1.. and return the expected map per version
fn replay(trie: &VersionedTrie, history: &[Vec<Update>]) -> Vec<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut model = BTreeMap::new();
    let mut states = Vec::with_capacity(history.len());
    for (i, updates) in history.iter().enumerate() {
        trie.apply(i as u64 + 1, updates.iter().cloned()).unwrap();
        for (key, value) in updates {
            match value {
                Some(value) => model.insert(key.clone(), value.clone()),
                None => model.remove(key),
            };
        }
        states.push(model.clone());
    }
    states
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The root depends only on the final contents, not on the order or
    /// batching of the updates that produced them
    #[test]
    fn root_is_independent_of_history(history in history_strategy()) {
        let trie = new_trie();
        let states = replay(&trie, &history);
        let last = states.last().unwrap();

        let direct = new_trie();
        let mut entries: Vec<_> = last.iter().collect();
        entries.reverse();
        let outcome = direct
            .apply(1, entries.into_iter().map(|(k, v)| (k.clone(), Some(v.clone()))))
            .unwrap();

        prop_assert_eq!(trie.latest_root_hash().unwrap(), outcome.root_hash);
    }

    /// Every version keeps answering with the contents it was committed with
    #[test]
    fn every_version_stays_visible(history in history_strategy()) {
        let trie = new_trie();
        let states = replay(&trie, &history);

        for (i, state) in states.iter().enumerate() {
            let version = i as u64 + 1;
            for (key, value) in state {
                let got = trie.get(key, version).unwrap();
                prop_assert_eq!(got.as_ref(), Some(value));
            }
            for (key, _) in history.iter().flatten() {
                if !state.contains_key(key) {
                    prop_assert_eq!(trie.get(key, version).unwrap(), None);
                }
            }
        }
    }

    /// Collection never changes what a retained version reads
    #[test]
    fn gc_preserves_retained_versions(
        history in history_strategy(),
        keep in 1u64..4,
        incremental in any::<bool>(),
    ) {
        let trie = new_trie();
        let states = replay(&trie, &history);
        let roots_before: Vec<_> = (1..=states.len() as u64)
            .map(|v| trie.root_hash(v).unwrap())
            .collect();

        let strategy: Box<dyn GcStrategy> = if incremental {
            Box::new(Incremental)
        } else {
            Box::new(MarkSweep::default())
        };
        let store = trie.store().as_ref();
        let options = GcOptions { batch_size: 5, ..GcOptions::default() };
        let report = strategy
            .run(store, store, &RetentionPolicy::KeepLatest(keep), &options)
            .unwrap();
        trie.clear_cache();
        prop_assert!(report.errors.is_empty());

        let first_kept = states.len().saturating_sub(keep as usize);
        for (i, state) in states.iter().enumerate().skip(first_kept) {
            let version = i as u64 + 1;
            prop_assert_eq!(trie.root_hash(version).unwrap(), roots_before[i]);
            for (key, value) in state {
                let got = trie.get(key, version).unwrap();
                prop_assert_eq!(got.as_ref(), Some(value));
            }
        }
    }

    /// Fresh proofs verify; flipping any byte of the proof, the value or the
    /// root makes them fail
    #[test]
    fn proofs_are_sound(
        entries in prop::collection::btree_map(key_strategy(), value_strategy(), 1..20),
        lookup in key_strategy(),
        flip in any::<prop::sample::Index>(),
    ) {
        let trie = new_trie();
        let root = trie
            .apply(1, entries.iter().map(|(k, v)| (k.clone(), Some(v.clone()))))
            .unwrap()
            .root_hash;
        let (h, c) = (trie.hasher().as_ref(), trie.commitment().as_ref());

        let proof = trie.prove(&lookup, 1).unwrap().unwrap();
        let wire = to_wire(&proof, &lookup, h, c).unwrap();
        let expected = entries.get(&lookup);

        match expected {
            Some(value) => {
                prop_assert!(proof.kind.is_inclusion());
                prop_assert!(verify(&root, &lookup, Some(value.as_slice()), true, &wire, h, c));
                prop_assert!(!verify(&root, &lookup, None, false, &wire, h, c));
                let mut other = value.clone();
                other.push(0);
                prop_assert!(!verify(&root, &lookup, Some(other.as_slice()), true, &wire, h, c));
            }
            None => {
                prop_assert!(!proof.kind.is_inclusion());
                prop_assert!(verify(&root, &lookup, None, false, &wire, h, c));
                prop_assert!(!verify(&root, &lookup, None, true, &wire, h, c));
            }
        }

        let value = expected.map(|v| v.as_slice());
        let including = expected.is_some();

        let mut tampered = wire.clone();
        tampered[flip.index(wire.len())] ^= 0x80;
        prop_assert!(!verify(&root, &lookup, value, including, &tampered, h, c));

        let mut bad_root = *root.as_bytes();
        bad_root[flip.index(32)] ^= 0x01;
        let bad_root = vtrie::Hash::from_bytes(bad_root);
        prop_assert!(!verify(&bad_root, &lookup, value, including, &wire, h, c));
    }
}
