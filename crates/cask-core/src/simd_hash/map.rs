use super::group::{Group, GROUP_SIZE, TOMBSTONE};
use super::{
    adjust_capacity, clamp_load_factor, fitted_capacity, growth_limit, hash_to_tag, new_tags,
    Reduction, TableKey, MIN_SIZE,
};

struct Bucket<K, V> {
    hash: u64,
    key: K,
    value: V,
}

/// Open-addressing hash map. Removal leaves a tombstone in the tag array;
/// tombstoned slots are reused by later inserts and swept on rehash.
pub struct Map<K, V> {
    tags: Vec<u8>,
    entries: Vec<Option<Bucket<K, V>>>,
    count: u32,
    capacity: u32,
    reduction: Reduction,
    growth_limit: u32,
    max_load_factor: f64,
}

impl<K, V> Default for Map<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Map<K, V> {
    pub fn new() -> Self {
        Self::with_raw_capacity(MIN_SIZE)
    }

    pub fn with_capacity(size: u32) -> Self {
        Self::with_raw_capacity(adjust_capacity(size))
    }

    /// Capacity fitted to 4096-slot pages instead of the next power of two.
    pub fn with_fitted_capacity(size: u32) -> Self {
        Self::with_raw_capacity(fitted_capacity(size))
    }

    fn with_raw_capacity(capacity: u32) -> Self {
        let max_load_factor = super::DEFAULT_LOAD_FACTOR;
        let mut entries = Vec::new();
        entries.resize_with(capacity as usize, || None);
        Self {
            tags: new_tags(capacity),
            entries,
            count: 0,
            capacity,
            reduction: Reduction::new(capacity),
            growth_limit: growth_limit(capacity, max_load_factor),
            max_load_factor,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn set_max_load_factor(&mut self, mlf: f64) {
        self.max_load_factor = clamp_load_factor(mlf, self.max_load_factor);
        self.growth_limit = growth_limit(self.capacity, self.max_load_factor);
    }

    pub fn clear(&mut self) {
        self.count = 0;
        let capacity = self.capacity as usize;
        self.tags[..capacity].fill(super::group::EMPTY);
        for entry in &mut self.entries {
            *entry = None;
        }
    }

    /// Entries in slot order, walking the control bytes one group at a
    /// time so only occupied slots are touched.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let capacity = self.capacity as usize;
        (0..capacity)
            .step_by(GROUP_SIZE)
            .flat_map(move |base| {
                Group::load(&self.tags[base..])
                    .match_occupied()
                    .map(move |offset| base + offset)
            })
            .filter_map(move |slot| self.entries[slot].as_ref().map(|b| (&b.key, &b.value)))
    }

    fn find_slot(&self, hash: u64, eq: impl Fn(&K) -> bool) -> Option<usize> {
        let tag = hash_to_tag(hash);
        let mut pos = self.reduction.index(hash);
        let mut jump = 0usize;
        loop {
            let group = Group::load(&self.tags[pos..]);
            for offset in group.match_tag(tag) {
                let slot = pos + offset;
                if let Some(bucket) = &self.entries[slot] {
                    if eq(&bucket.key) {
                        return Some(slot);
                    }
                }
            }
            if group.match_empty().any() {
                return None;
            }
            jump += GROUP_SIZE;
            pos = self.reduction.index((pos + jump) as u64);
        }
    }

    /// Probes until the key is found or its absence is certain (an EMPTY
    /// slot). On absence, returns the first reusable slot seen on the way,
    /// so tombstones are filled before fresh slots.
    fn find_or_free(&self, hash: u64, eq: impl Fn(&K) -> bool) -> (Option<usize>, usize) {
        let tag = hash_to_tag(hash);
        let mut pos = self.reduction.index(hash);
        let mut jump = 0usize;
        let mut first_free: Option<usize> = None;
        loop {
            let group = Group::load(&self.tags[pos..]);
            for offset in group.match_tag(tag) {
                let slot = pos + offset;
                if let Some(bucket) = &self.entries[slot] {
                    if eq(&bucket.key) {
                        return (Some(slot), slot);
                    }
                }
            }
            if first_free.is_none() {
                let free = group.match_empty_or_tombstone();
                if free.any() {
                    first_free = Some(pos + free.lowest());
                }
            }
            if group.match_empty().any() {
                let free = first_free.expect("an empty group always yields a free slot");
                return (None, free);
            }
            jump += GROUP_SIZE;
            pos = self.reduction.index((pos + jump) as u64);
        }
    }

    fn insert_at(&mut self, slot: usize, hash: u64, key: K, value: V) {
        self.tags[slot] = hash_to_tag(hash);
        self.entries[slot] = Some(Bucket { hash, key, value });
        self.count += 1;
        if self.count >= self.growth_limit {
            self.grow();
        }
    }

    fn grow(&mut self) {
        let new_capacity = adjust_capacity(self.capacity.saturating_add(1));
        if new_capacity == self.capacity {
            return;
        }
        self.rebuild(new_capacity);
    }

    fn rebuild(&mut self, capacity: u32) {
        let mut old_entries = Vec::new();
        old_entries.resize_with(capacity as usize, || None);
        std::mem::swap(&mut old_entries, &mut self.entries);
        self.capacity = capacity;
        self.reduction = Reduction::new(capacity);
        self.growth_limit = growth_limit(capacity, self.max_load_factor);
        self.tags = new_tags(capacity);
        for bucket in old_entries.into_iter().flatten() {
            let slot = self.find_empty(bucket.hash);
            self.tags[slot] = hash_to_tag(bucket.hash);
            self.entries[slot] = Some(bucket);
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

impl<K: TableKey, V> Map<K, V> {
    /// Inserts only if the key is absent; returns whether it inserted.
    pub fn add(&mut self, key: K, value: V) -> bool {
        let hash = key.table_hash();
        let (found, free) = self.find_or_free(hash, |other| *other == key);
        if found.is_some() {
            return false;
        }
        self.insert_at(free, hash, key, value);
        true
    }

    /// Inserts or overwrites; returns true when the key was new.
    pub fn add_or_update(&mut self, key: K, value: V) -> bool {
        let hash = key.table_hash();
        let (found, free) = self.find_or_free(hash, |other| *other == key);
        if let Some(slot) = found {
            if let Some(bucket) = &mut self.entries[slot] {
                bucket.value = value;
            }
            return false;
        }
        self.insert_at(free, hash, key, value);
        true
    }

    /// Overwrites only an existing entry; returns whether one existed.
    pub fn update(&mut self, key: K, value: V) -> bool {
        match self.find_slot(key.table_hash(), |other| *other == key) {
            Some(slot) => {
                if let Some(bucket) = &mut self.entries[slot] {
                    bucket.value = value;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.find_slot(key.table_hash(), |other| other == key)
            .and_then(|slot| self.entries[slot].as_ref().map(|b| &b.value))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.find_slot(key.table_hash(), |other| other == key)
            .is_some()
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.find_slot(key.table_hash(), |other| other == key) {
            Some(slot) => {
                self.tags[slot] = TOMBSTONE;
                self.entries[slot] = None;
                self.count -= 1;
                true
            }
            None => false,
        }
    }
}
