//! Deduplicated string storage: each distinct string is copied into the
//! pool once and identified by a dense u32 id in first-insertion order.

use xxhash_rust::xxh3::xxh3_64;

use crate::pool::{GrowingMemoryPool, PoolRef};
use crate::simd_hash::Index;

pub struct StringStorage {
    pool: GrowingMemoryPool,
    strings: Index<PoolRef>,
}

impl Default for StringStorage {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl StringStorage {
    pub fn new(page_size: usize) -> Self {
        Self {
            pool: GrowingMemoryPool::new(page_size),
            strings: Index::new(),
        }
    }

    pub fn count(&self) -> u32 {
        self.strings.count()
    }

    /// Interns the string, returning its id. The copy into the pool is
    /// speculative: on a duplicate the checkpoint rolls it back.
    pub fn get_or_add(&mut self, source: &str) -> u32 {
        self.pool.checkpoint();
        let span = self.pool.alloc_bytes(source.as_bytes());
        let Self { pool, strings } = self;
        let (inserted, id) = strings.try_add_hashed(xxh3_64(source.as_bytes()), span, |other| {
            pool.bytes(*other) == source.as_bytes()
        });
        if inserted {
            pool.discard_checkpoint();
        } else {
            pool.rollback_checkpoint();
        }
        id
    }

    /// Id of an already interned string.
    pub fn get(&self, source: &str) -> Option<u32> {
        self.strings
            .get_hashed(xxh3_64(source.as_bytes()), |other| {
                self.pool.bytes(*other) == source.as_bytes()
            })
    }

    /// Interned string by id.
    pub fn get_str(&self, id: u32) -> Option<&str> {
        if id >= self.strings.count() {
            return None;
        }
        let bytes = self.pool.bytes(*self.strings.get_key(id));
        Some(std::str::from_utf8(bytes).expect("interned bytes are valid UTF-8"))
    }

    pub fn contains(&self, source: &str) -> bool {
        self.get(source).is_some()
    }

    pub fn contains_id(&self, id: u32) -> bool {
        id < self.strings.count()
    }

    /// `(id, string)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        (0..self.count()).map(move |id| {
            (
                id,
                self.get_str(id).expect("ids below count are populated"),
            )
        })
    }

    pub fn clear(&mut self) {
        self.strings.clear();
        self.pool.release();
    }
}
