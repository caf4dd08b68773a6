use std::io;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::cdc::ByteSource;
use crate::store::FragmentHasher;

/// Deterministic pseudo-random bytes for content fixtures.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Serves one slice in caller-chosen block sizes, cycling through `splits`.
/// Lets tests prove that fragment boundaries ignore producer blocking.
pub struct ChunkedSource<'a> {
    data: &'a [u8],
    pos: usize,
    splits: Vec<usize>,
    next_split: usize,
}

impl<'a> ChunkedSource<'a> {
    pub fn new(data: &'a [u8], splits: Vec<usize>) -> Self {
        assert!(!splits.is_empty() && splits.iter().all(|&s| s > 0));
        Self {
            data,
            pos: 0,
            splits,
            next_split: 0,
        }
    }
}

impl ByteSource for ChunkedSource<'_> {
    fn next_block(&mut self, consumed: usize) -> io::Result<Option<&[u8]>> {
        self.pos += consumed;
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let size = self.splits[self.next_split % self.splits.len()];
        self.next_split += 1;
        let end = self.data.len().min(self.pos + size);
        Ok(Some(&self.data[self.pos..end]))
    }
}

/// Digest stub that hands out crafted colliding digests for fragments
/// starting with byte 1 or 2 (same smallKey, different remainder), and
/// real BLAKE3 for everything else.
pub struct CollidingHasher {
    fallback: crate::store::Blake3Hasher,
}

impl CollidingHasher {
    pub fn new() -> Self {
        Self {
            fallback: crate::store::Blake3Hasher::new(),
        }
    }
}

impl FragmentHasher for CollidingHasher {
    fn digest(&mut self, fragment: &[u8]) -> [u8; 32] {
        match fragment.first().copied() {
            Some(b @ (1 | 2)) => {
                let mut digest = [0u8; 32];
                digest[0..8].copy_from_slice(&0xDEAD_BEEF_00u64.to_le_bytes());
                digest[8..16].copy_from_slice(&(0xABC0_0000u64 + ((b as u64) << 32)).to_le_bytes());
                digest[16..24].copy_from_slice(&7u64.to_le_bytes());
                digest[24..32].copy_from_slice(&9u64.to_le_bytes());
                digest
            }
            _ => self.fallback.digest(fragment),
        }
    }
}
