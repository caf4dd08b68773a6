//! End-to-end flows: chunker feeding the key store, canonical dictionary
//! reconstruction, and on-disk log invariants.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tempfile::TempDir;

use cask_core::cdc::{SliceSource, ZpaqChunker};
use cask_core::config::{ChunkerConfig, StoreConfig};
use cask_core::store::{Blake3Hasher, FragmentHasher, LargeKey, LargeKeyStore};

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn key_of(data: &[u8]) -> LargeKey {
    let digest = Blake3Hasher::new().digest(data);
    let mut key = LargeKey::from_digest(&digest);
    key.set_size(data.len() as u32);
    key
}

fn file_lists(store: &mut LargeKeyStore) -> Vec<(u32, Vec<u32>)> {
    let mut out = Vec::new();
    store
        .file_index_info(|file_index, list| out.push((file_index, list.to_vec())))
        .unwrap();
    out
}

#[test]
fn constant_megabyte_dedupes_to_two_keys() {
    let dir = TempDir::new().unwrap();
    let mut store = LargeKeyStore::open(&StoreConfig::with_log_dir(dir.path())).unwrap();
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let data = vec![0x41u8; 1 << 20];

    let mut lengths = Vec::new();
    let mut novel = 0u32;
    let mut offset = 0i64;
    let mut source = SliceSource::new(&data);
    chunker
        .cut(&mut source, |fragment, score| {
            assert_eq!(score, 100);
            lengths.push(fragment.len());
            if store.add(fragment, 0, offset, false)? {
                novel += 1;
            }
            offset += fragment.len() as i64;
            Ok(())
        })
        .unwrap();

    // the constant stream cuts at the same deterministic length each time
    assert_eq!(lengths.len(), 9);
    assert!(lengths[..8].iter().all(|&l| l == 127_877));
    assert_eq!(lengths[8], (1 << 20) - 8 * 127_877);
    assert_eq!(novel, 2);

    let mut keys = Vec::new();
    store.drain_keys(false, &mut keys).unwrap();
    assert_eq!(keys.len(), 2);

    store
        .resolve_collisions(|_, _, _, _| false, |_, _| {})
        .unwrap();
    assert_eq!(store.count(), 3); // sentinel + the two distinct fragments
    assert_eq!(store.collision_count(), 0);

    let lists = file_lists(&mut store);
    assert_eq!(lists, vec![(0, vec![1, 1, 1, 1, 1, 1, 1, 1, 2])]);
}

#[test]
fn two_files_keep_distinct_identities() {
    let dir = TempDir::new().unwrap();
    let mut store = LargeKeyStore::open(&StoreConfig::with_log_dir(dir.path())).unwrap();
    let a = random_bytes(1, 10 * 1024);
    let b = random_bytes(2, 10 * 1024);

    assert!(store.add(&a, 0, 0, false).unwrap());
    assert!(store.add(&b, 1, 0, false).unwrap());

    let mut keys = Vec::new();
    store.drain_keys(false, &mut keys).unwrap();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    assert_eq!(keys[0], key_of(&a));
    assert_eq!(keys[1], key_of(&b));

    store
        .resolve_collisions(|_, _, _, _| false, |_, _| {})
        .unwrap();
    let lists = file_lists(&mut store);
    assert_eq!(lists, vec![(0, vec![1]), (1, vec![2])]);
}

#[test]
fn empty_stream_produces_no_fragments_and_empty_logs() {
    let dir = TempDir::new().unwrap();
    let store = LargeKeyStore::open(&StoreConfig::with_log_dir(dir.path())).unwrap();
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();

    let mut fragments = 0;
    let mut source = SliceSource::new(b"");
    chunker
        .cut(&mut source, |_, _| {
            fragments += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(fragments, 0);

    drop(store);
    assert_eq!(std::fs::metadata(dir.path().join("fi.log")).unwrap().len(), 0);
    let lk_dat = std::fs::read(dir.path().join("lk.dat")).unwrap();
    assert_eq!(lk_dat.len(), 4096);
    assert_eq!(LargeKey::from_bytes(&lk_dat[..32].try_into().unwrap()), LargeKey::SENTINEL);
}

#[test]
fn repetitive_fragments_route_to_the_cold_selector() {
    let dir = TempDir::new().unwrap();
    let mut store = LargeKeyStore::open(&StoreConfig::with_log_dir(dir.path())).unwrap();
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let data = vec![0x41u8; 1 << 20];
    let mut source = SliceSource::new(&data);

    let fragments = store.ingest_source(&mut chunker, &mut source, 0).unwrap();
    assert_eq!(fragments, 9);
    assert_eq!(store.selector_count(true), 2);
    assert_eq!(store.selector_count(false), 0);
}

/// Interleaved files, shared fragments, and multiple drains of both
/// selectors: every surviving file list, dereferenced against the
/// canonical dictionary, reproduces its original fragment sequence, and
/// the on-disk dictionary matches the drained batches record for record.
#[test]
fn file_lists_round_trip_through_the_canonical_dictionary() {
    let dir = TempDir::new().unwrap();
    let mut store = LargeKeyStore::open(&StoreConfig::with_log_dir(dir.path())).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    let mut contents: Vec<Vec<u8>> = Vec::new();
    let mut sequences: Vec<Vec<usize>> = Vec::new();
    let mut dictionary = vec![LargeKey::SENTINEL];

    for file_index in 0..6u32 {
        let mut sequence = Vec::new();
        let mut offset = 0i64;
        for _ in 0..rng.gen_range(1..=8) {
            let id = if !contents.is_empty() && rng.gen_bool(0.4) {
                rng.gen_range(0..contents.len())
            } else {
                contents.push(random_bytes(rng.gen(), rng.gen_range(40..=200)));
                contents.len() - 1
            };
            store
                .add(&contents[id], file_index, offset, rng.gen_bool(0.5))
                .unwrap();
            sequence.push(id);
            offset += contents[id].len() as i64;
        }
        sequences.push(sequence);

        if file_index % 2 == 1 {
            for low in [false, true] {
                if store.selector_count(low) > 0 {
                    let mut batch = Vec::new();
                    store.drain_keys(low, &mut batch).unwrap();
                    dictionary.extend(batch);
                }
            }
        }
    }
    for low in [false, true] {
        if store.selector_count(low) > 0 {
            let mut batch = Vec::new();
            store.drain_keys(low, &mut batch).unwrap();
            dictionary.extend(batch);
        }
    }

    store
        .resolve_collisions(|_, _, _, _| false, |_, _| {})
        .unwrap();
    assert_eq!(store.count() as usize, dictionary.len());

    let lists = file_lists(&mut store);
    assert_eq!(lists.len(), 6);
    for (file_index, indices) in &lists {
        let expected: Vec<LargeKey> = sequences[*file_index as usize]
            .iter()
            .map(|&id| key_of(&contents[id]))
            .collect();
        let got: Vec<LargeKey> = indices
            .iter()
            .map(|&i| dictionary[i as usize])
            .collect();
        assert_eq!(got, expected, "file {file_index} did not round-trip");
    }

    // on-disk dictionary: page-aligned, batches in order, zero padding
    let lk_dat = std::fs::read(dir.path().join("lk.dat")).unwrap();
    assert_eq!(lk_dat.len() % 4096, 0);
    let rows: Vec<LargeKey> = lk_dat
        .chunks_exact(32)
        .map(|c| LargeKey::from_bytes(c.try_into().unwrap()))
        .collect();
    assert!(rows.len() >= dictionary.len());
    assert_eq!(&rows[..dictionary.len()], &dictionary[..]);
    assert!(rows[dictionary.len()..].iter().all(LargeKey::is_zero));

    let fi_len = std::fs::metadata(dir.path().join("fi.log")).unwrap().len();
    assert_eq!(fi_len % 20480, 0);
}

#[test]
fn identical_runs_produce_identical_fingerprints() {
    let run = || {
        let dir = TempDir::new().unwrap();
        let mut store = LargeKeyStore::open(&StoreConfig::with_log_dir(dir.path())).unwrap();
        for i in 0..5u32 {
            store
                .add(&random_bytes(100 + i as u64, 512), i, 0, i % 2 == 0)
                .unwrap();
        }
        let mut batch = Vec::new();
        store.drain_keys(false, &mut batch).unwrap();
        store.drain_keys(true, &mut batch).unwrap();
        store
            .resolve_collisions(|_, _, _, _| false, |_, _| {})
            .unwrap()
    };
    assert_eq!(run(), run());
}
