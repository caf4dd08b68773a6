use super::{Map, TableKey};

/// Hash set over the map core, the way the std containers pair up.
pub struct Set<K> {
    map: Map<K, ()>,
}

impl<K> Default for Set<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Set<K> {
    pub fn new() -> Self {
        Self { map: Map::new() }
    }

    pub fn with_capacity(size: u32) -> Self {
        Self {
            map: Map::with_capacity(size),
        }
    }

    pub fn count(&self) -> u32 {
        self.map.count()
    }

    pub fn capacity(&self) -> u32 {
        self.map.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.map.iter().map(|(k, ())| k)
    }
}

impl<K: TableKey> Set<K> {
    /// Returns true if the key was new.
    pub fn add(&mut self, key: K) -> bool {
        self.map.add(key, ())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains(key)
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.map.remove(key)
    }
}
