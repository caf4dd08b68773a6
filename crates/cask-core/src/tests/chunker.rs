use crate::cdc::{SliceSource, ZpaqChunker};
use crate::config::ChunkerConfig;
use crate::testutil::{random_bytes, ChunkedSource};

fn collect_fragments(chunker: &mut ZpaqChunker, data: &[u8]) -> Vec<(Vec<u8>, u32)> {
    let mut out = Vec::new();
    let mut source = SliceSource::new(data);
    chunker
        .cut(&mut source, |fragment, score| {
            out.push((fragment.to_vec(), score));
            Ok(())
        })
        .expect("slice cut cannot fail");
    out
}

#[test]
fn empty_stream_emits_nothing() {
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let fragments = collect_fragments(&mut chunker, b"");
    assert!(fragments.is_empty());
}

#[test]
fn short_stream_is_one_trailing_fragment() {
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let data = random_bytes(3, 1000);
    let fragments = collect_fragments(&mut chunker, &data);
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].0, data);
}

#[test]
fn fragments_cover_stream_in_order() {
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let data = random_bytes(4, 700_000);
    let fragments = collect_fragments(&mut chunker, &data);
    let rebuilt: Vec<u8> = fragments.iter().flat_map(|(f, _)| f.clone()).collect();
    assert_eq!(rebuilt, data);
}

#[test]
fn fragment_lengths_stay_in_bounds() {
    let config = ChunkerConfig::default();
    let mut chunker = ZpaqChunker::new(config).unwrap();
    let max = chunker.max_fragment_size();
    let data = random_bytes(5, 2_000_000);
    let fragments = collect_fragments(&mut chunker, &data);
    for (i, (fragment, _)) in fragments.iter().enumerate() {
        assert!(fragment.len() <= max);
        if i + 1 != fragments.len() {
            assert!(
                fragment.len() >= config.min_fragment_size as usize,
                "fragment {i} of {} bytes is below the minimum",
                fragment.len()
            );
        }
    }
}

#[test]
fn boundaries_ignore_producer_blocking() {
    let data = random_bytes(6, 1_000_000);
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let reference = collect_fragments(&mut chunker, &data);
    assert!(reference.len() > 1, "fixture should cut at least once");

    for splits in [
        vec![1usize],
        vec![7, 13, 4096],
        vec![65_536],
        vec![3, 100_000],
    ] {
        let mut source = ChunkedSource::new(&data, splits.clone());
        let mut got = Vec::new();
        chunker
            .cut(&mut source, |fragment, score| {
                got.push((fragment.to_vec(), score));
                Ok(())
            })
            .unwrap();
        assert_eq!(got, reference, "splits {splits:?} moved a boundary");
    }
}

#[test]
fn reader_source_matches_slice_source() {
    use std::io::Cursor;

    use crate::cdc::ReaderSource;

    let data = random_bytes(9, 300_000);
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let expected = collect_fragments(&mut chunker, &data);

    let mut source = ReaderSource::with_buffer_size(Cursor::new(data), 4096);
    let mut got = Vec::new();
    chunker
        .cut(&mut source, |fragment, score| {
            got.push((fragment.to_vec(), score));
            Ok(())
        })
        .unwrap();
    assert_eq!(got, expected);
}

/// A constant stream is fully deterministic: starting from zero, the
/// rolling hash dips below the limit after exactly 127 877 identical
/// bytes, so every fragment but the tail has that length.
#[test]
fn constant_stream_cuts_deterministically() {
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let data = vec![0x41u8; 1 << 20];
    let fragments = collect_fragments(&mut chunker, &data);
    assert_eq!(fragments.len(), 9);
    for (fragment, score) in &fragments[..8] {
        assert_eq!(fragment.len(), 127_877);
        assert_eq!(*score, 100);
    }
    assert_eq!(fragments[8].0.len(), (1 << 20) - 8 * 127_877);
    assert_eq!(fragments[8].1, 100);
}

#[test]
fn repetitive_data_scores_high_random_scores_low() {
    let mut chunker = ZpaqChunker::new(ChunkerConfig::default()).unwrap();
    let repetitive = collect_fragments(&mut chunker, &vec![7u8; 50_000]);
    assert!(repetitive.iter().all(|(_, score)| *score >= 90));
    let random = collect_fragments(&mut chunker, &random_bytes(8, 50_000));
    assert!(random.iter().all(|(_, score)| *score < 30));
}

#[test]
fn alternate_config_respects_its_bounds() {
    let config = ChunkerConfig {
        min_fragment_size: 2048,
        max_fragment_bits: 20,
        avg_fragment_size: 7,
        include_zero_size: true,
    };
    let mut chunker = ZpaqChunker::new(config).unwrap();
    assert_eq!(chunker.max_fragment_size(), (1 << 20) - 1);
    assert_eq!(chunker.hash_limit(), (1 << 15) + 4096);

    let data = random_bytes(14, 2_000_000);
    let fragments = collect_fragments(&mut chunker, &data);
    let rebuilt: usize = fragments.iter().map(|(f, _)| f.len()).sum();
    assert_eq!(rebuilt, data.len());
    for (i, (fragment, _)) in fragments.iter().enumerate() {
        assert!(fragment.len() <= (1 << 20) - 1);
        if i + 1 != fragments.len() {
            assert!(fragment.len() >= 2048);
        }
    }
}

#[test]
fn invalid_configs_are_rejected() {
    for config in [
        ChunkerConfig {
            max_fragment_bits: 18,
            ..Default::default()
        },
        ChunkerConfig {
            avg_fragment_size: 5,
            ..Default::default()
        },
        ChunkerConfig {
            min_fragment_size: 1000,
            ..Default::default()
        },
        ChunkerConfig {
            min_fragment_size: (1 << 19) / 2 + 1024,
            ..Default::default()
        },
    ] {
        assert!(ZpaqChunker::new(config).is_err(), "accepted {config:?}");
    }
}
