use tracing::debug;

use super::group::{Group, GROUP_SIZE};
use super::{
    adjust_capacity, clamp_load_factor, fitted_capacity, growth_limit, hash_to_tag, new_tags,
    Reduction, TableKey, MIN_SIZE,
};

/// Hash index: every distinct key is assigned the next integer, starting
/// at 0, and keeps it for the lifetime of the table. Keys live densely in
/// first-insertion order, so iteration is insertion order and
/// `get_key(index)` is O(1). There is no removal.
///
/// The tag array stores the assigned index next to each control byte; a
/// rehash rebuilds only the tag/slot arrays and leaves the dense key array
/// untouched, which is what makes the indices stable.
pub struct Index<K> {
    tags: Vec<u8>,
    /// Assigned index per tag position.
    slots: Vec<u32>,
    /// Dense keys, position == assigned index.
    keys: Vec<K>,
    /// Cached full hash per key, used to rebuild the tag array.
    hashes: Vec<u64>,
    capacity: u32,
    reduction: Reduction,
    growth_limit: u32,
    max_load_factor: f64,
}

impl<K> Default for Index<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Index<K> {
    pub fn new() -> Self {
        Self::with_capacity(MIN_SIZE)
    }

    /// Table sized for `size` keys, rounded to a power of two.
    pub fn with_capacity(size: u32) -> Self {
        Self::with_raw_capacity(adjust_capacity(size))
    }

    /// Table sized for `size` keys with the capacity fitted to 4096-slot
    /// pages instead of doubled; index reduction uses multiply-high.
    pub fn with_fitted_capacity(size: u32) -> Self {
        Self::with_raw_capacity(fitted_capacity(size))
    }

    fn with_raw_capacity(capacity: u32) -> Self {
        let max_load_factor = super::DEFAULT_LOAD_FACTOR;
        Self {
            tags: new_tags(capacity),
            slots: vec![0; capacity as usize],
            keys: Vec::new(),
            hashes: Vec::new(),
            capacity,
            reduction: Reduction::new(capacity),
            growth_limit: growth_limit(capacity, max_load_factor),
            max_load_factor,
        }
    }

    pub fn count(&self) -> u32 {
        self.keys.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn load_factor(&self) -> f64 {
        if self.keys.is_empty() {
            0.0
        } else {
            self.keys.len() as f64 / self.capacity as f64
        }
    }

    pub fn max_load_factor(&self) -> f64 {
        self.max_load_factor
    }

    /// Clamped to [0.75, 0.99]; out-of-range values are ignored.
    pub fn set_max_load_factor(&mut self, mlf: f64) {
        self.max_load_factor = clamp_load_factor(mlf, self.max_load_factor);
        self.growth_limit = growth_limit(self.capacity, self.max_load_factor);
    }

    /// Drops all keys and their indices; capacity is kept.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.hashes.clear();
        let capacity = self.capacity as usize;
        self.tags[..capacity].fill(super::group::EMPTY);
    }

    /// Key for an assigned index. Panics if the index was never assigned.
    pub fn get_key(&self, index: u32) -> &K {
        &self.keys[index as usize]
    }

    /// Keys in insertion (index) order.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }

    /// Lookup with an externally computed hash and equality. This is the
    /// entry point for keys whose identity lives outside the table (e.g.
    /// interned spans compared through their backing pool).
    pub fn get_hashed(&self, hash: u64, eq: impl Fn(&K) -> bool) -> Option<u32> {
        let tag = hash_to_tag(hash);
        let mut pos = self.reduction.index(hash);
        let mut jump = 0usize;
        loop {
            let group = Group::load(&self.tags[pos..]);
            for offset in group.match_tag(tag) {
                let real = self.slots[pos + offset];
                if eq(&self.keys[real as usize]) {
                    return Some(real);
                }
            }
            if group.match_empty().any() {
                return None;
            }
            jump += GROUP_SIZE;
            pos = self.reduction.index((pos + jump) as u64);
        }
    }

    /// Insert with an externally computed hash and equality. Returns
    /// `(true, new_index)` on insertion or `(false, existing_index)`.
    pub fn try_add_hashed(&mut self, hash: u64, key: K, eq: impl Fn(&K) -> bool) -> (bool, u32) {
        let tag = hash_to_tag(hash);
        let mut pos = self.reduction.index(hash);
        let mut jump = 0usize;
        let slot = loop {
            let group = Group::load(&self.tags[pos..]);
            for offset in group.match_tag(tag) {
                let real = self.slots[pos + offset];
                if eq(&self.keys[real as usize]) {
                    return (false, real);
                }
            }
            let free = group.match_empty_or_tombstone();
            if free.any() {
                break pos + free.lowest();
            }
            jump += GROUP_SIZE;
            pos = self.reduction.index((pos + jump) as u64);
        };
        let real = self.keys.len() as u32;
        self.tags[slot] = tag;
        self.slots[slot] = real;
        self.keys.push(key);
        self.hashes.push(hash);
        if self.keys.len() as u32 >= self.growth_limit {
            self.grow();
        }
        (true, real)
    }

    fn grow(&mut self) {
        let new_capacity = adjust_capacity(self.capacity.saturating_add(1));
        if new_capacity == self.capacity {
            return;
        }
        debug!(
            old = self.capacity,
            new = new_capacity,
            count = self.keys.len(),
            "index grows"
        );
        self.rebuild(new_capacity);
    }

    /// Rebuilds the tag/slot arrays from the cached hashes. The dense key
    /// array is untouched: assigned indices survive.
    fn rebuild(&mut self, capacity: u32) {
        self.capacity = capacity;
        self.reduction = Reduction::new(capacity);
        self.growth_limit = growth_limit(capacity, self.max_load_factor);
        self.tags = new_tags(capacity);
        self.slots = vec![0; capacity as usize];
        for real in 0..self.keys.len() {
            let hash = self.hashes[real];
            let slot = self.find_empty(hash);
            self.tags[slot] = hash_to_tag(hash);
            self.slots[slot] = real as u32;
        }
    }

    fn find_empty(&self, hash: u64) -> usize {
        let mut pos = self.reduction.index(hash);
        let mut jump = 0usize;
        loop {
            let group = Group::load(&self.tags[pos..]);
            let empties = group.match_empty();
            if empties.any() {
                return pos + empties.lowest();
            }
            jump += GROUP_SIZE;
            pos = self.reduction.index((pos + jump) as u64);
        }
    }
}

impl<K: TableKey> Index<K> {
    /// Returns true if the key was new.
    pub fn add(&mut self, key: &K) -> bool {
        self.try_add(key).0
    }

    /// Returns `(inserted, index)`; the index is the new assignment on
    /// insertion or the existing one on a duplicate.
    pub fn try_add(&mut self, key: &K) -> (bool, u32) {
        let key = *key;
        self.try_add_hashed(key.table_hash(), key, |other| *other == key)
    }

    pub fn try_get_index(&self, key: &K) -> Option<u32> {
        self.get_hashed(key.table_hash(), |other| other == key)
    }

    /// Index of a key, or the current capacity if absent.
    pub fn get_index(&self, key: &K) -> u32 {
        self.try_get_index(key).unwrap_or(self.capacity)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.try_get_index(key).is_some()
    }
}
