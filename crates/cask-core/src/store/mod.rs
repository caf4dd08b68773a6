//! The fingerprint identity engine.
//!
//! Fragments enter through [`LargeKeyStore::add`], which collapses them to
//! 256-bit keys and suppresses duplicates in two stages: a primary index
//! over the 64-bit smallKey prefix, and a collision index over full keys
//! for the rare digests that lose the smallKey race. Novel keys stage in
//! one of two selectors (hot/cold) so the final dictionary groups similar
//! fragments; [`LargeKeyStore::drain_keys`] moves a selector into the
//! canonical dictionary and extends its running fingerprint.
//!
//! Everything observed is appended to `fi.log`; the dictionary itself is
//! `lk.dat`. After the last drain, [`LargeKeyStore::resolve_collisions`]
//! replays the log in dictionary order to reconcile smallKey collisions
//! against actual file bytes, and [`LargeKeyStore::file_index_info`]
//! replays it in file order to rebuild each file's fragment list.

pub mod keys;
pub mod range_mapper;

pub use keys::{FragmentInfo, FragmentInfoKey, LargeKey, MAX_FRAGMENT_SIZE, PADDING_FILE_INDEX};
pub use range_mapper::RangeMapper;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::cdc::{ByteSource, ZpaqChunker};
use crate::config::StoreConfig;
use crate::error::{CaskError, Result};
use crate::simd_hash::{Index, Map, MAX_SIZE};
use crate::sort::{Record, StructSort};

/// Records per padded block of `fi.log`: lcm(40, 4096) / 40.
pub const FI_BLOCK_RECORDS: usize = 512;
/// Records per padded page of `lk.dat`: 4096 / 32.
pub const LK_PAGE_RECORDS: usize = 128;

const FI_BUFFER_RECORDS: usize = 6 * FI_BLOCK_RECORDS;
const LK_BUFFER_RECORDS: usize = 10 * LK_PAGE_RECORDS;

/// Dictionary window read while resolving: 128 KiB of keys.
const LK_WINDOW_RECORDS: u32 = (128 * 1024 / LargeKey::SIZE) as u32;

/// Fragments scoring at least this many order-1 hits per hundred bytes are
/// routed to the cold selector.
pub const LOW_ENTROPY_SCORE: u32 = 30;

/// The digest primitive the store consumes. The default is BLAKE3; tests
/// inject crafted digests to force smallKey collisions.
pub trait FragmentHasher {
    fn digest(&mut self, fragment: &[u8]) -> [u8; 32];
}

#[derive(Default)]
pub struct Blake3Hasher {
    inner: blake3::Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FragmentHasher for Blake3Hasher {
    fn digest(&mut self, fragment: &[u8]) -> [u8; 32] {
        self.inner.reset();
        self.inner.update(fragment);
        *self.inner.finalize().as_bytes()
    }
}

/// Staging table for novel keys between drains. The counter hands out
/// provisional indices in a band far above any final dictionary index;
/// the high band sits above the low band because the range mapper consults
/// the high queue first.
struct Selector {
    keys: Index<LargeKey>,
    index: u32,
}

const HIGH_SELECTOR_BASE: u32 = MAX_SIZE + MAX_SIZE / 2;
const LOW_SELECTOR_BASE: u32 = MAX_SIZE;

pub struct LargeKeyStore {
    hi: Index<u64>,
    hi_collision: Index<LargeKey>,
    /// `[0]` = high (hot), `[1]` = low (cold), indexed by the `low` flag.
    selectors: [Selector; 2],
    rm: RangeMapper,
    hasher: Box<dyn FragmentHasher>,
    fingerprint: Xxh3,
    fi_buffer: Vec<FragmentInfo>,
    lk_buffer: Vec<LargeKey>,
    fi_log: File,
    lk_dat: File,
    fi_remap: Map<FragmentInfoKey, u32>,
    scratch: Vec<u8>,
    sort_memory_budget: usize,
}

fn create_log_file(dir: &Path, name: &str) -> Result<File> {
    let path = dir.join(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    Ok(file)
}

impl LargeKeyStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::with_hasher(config, Box::new(Blake3Hasher::new()))
    }

    pub fn with_hasher(config: &StoreConfig, hasher: Box<dyn FragmentHasher>) -> Result<Self> {
        let dir = config
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let fi_log = create_log_file(&dir, "fi.log")?;
        let lk_dat = create_log_file(&dir, "lk.dat")?;

        let mut store = Self {
            hi: Index::new(),
            hi_collision: Index::new(),
            selectors: [
                Selector {
                    keys: Index::new(),
                    index: HIGH_SELECTOR_BASE,
                },
                Selector {
                    keys: Index::new(),
                    index: LOW_SELECTOR_BASE,
                },
            ],
            rm: RangeMapper::new(),
            hasher,
            fingerprint: Xxh3::new(),
            fi_buffer: Vec::with_capacity(FI_BUFFER_RECORDS),
            lk_buffer: Vec::with_capacity(LK_BUFFER_RECORDS),
            fi_log,
            lk_dat,
            fi_remap: Map::new(),
            scratch: Vec::new(),
            sort_memory_budget: config.sort_memory_budget,
        };
        // Index 0 of the dictionary is the zero sentinel. Real keys always
        // carry the key-form bit, so no fragment ever maps to it.
        store.lk_buffer.push(LargeKey::SENTINEL);
        store.hi.add(&LargeKey::SENTINEL.small_key);
        Ok(store)
    }

    /// Unique smallKeys (primaries and aliases), sentinel included.
    pub fn count(&self) -> u32 {
        self.hi.count()
    }

    /// Keys staged in one selector.
    pub fn selector_count(&self, low: bool) -> u32 {
        self.selectors[usize::from(low)].keys.count()
    }

    /// Full keys that lost the smallKey race.
    pub fn collision_count(&self) -> u32 {
        self.hi_collision.count()
    }

    /// Running fingerprint over the canonical dictionary so far.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint.digest()
    }

    /// Final indices pass through; provisional ones go through the range
    /// queues.
    pub fn remap(&mut self, input: u32) -> u32 {
        if input <= MAX_SIZE {
            input
        } else {
            self.rm.remap(input)
        }
    }

    /// Offers one fragment. Returns whether it was novel. The observation
    /// is appended to the fragment log either way.
    pub fn add(
        &mut self,
        fragment: &[u8],
        file_index: u32,
        file_offset: i64,
        low_entropy: bool,
    ) -> Result<bool> {
        if fragment.len() > MAX_FRAGMENT_SIZE as usize {
            return Err(CaskError::config(format!(
                "fragment of {} bytes exceeds the {} byte limit",
                fragment.len(),
                MAX_FRAGMENT_SIZE
            )));
        }
        let digest = self.hasher.digest(fragment);
        let mut lk = LargeKey::from_digest(&digest);
        lk.set_size(fragment.len() as u32);

        let (novel, sk_index) = self.add_to_selector(&lk, low_entropy)?;
        self.fi_buffer.push(FragmentInfo {
            sk_index,
            file_index,
            file_offset,
            l1: lk.l1,
            l2: lk.l2,
            l3: lk.l3,
        });
        if self.fi_buffer.len() >= FI_BUFFER_RECORDS {
            flush_fragment_infos(&mut self.fi_buffer, &mut self.fi_log)?;
        }
        Ok(novel)
    }

    fn add_to_selector(&mut self, lk: &LargeKey, low: bool) -> Result<(bool, u32)> {
        if let Some(mut sk_index) = self.hi.try_get_index(&lk.small_key) {
            // Known smallKey. If the full key is a known collision, the
            // fragment belongs to the alias, not the primary.
            if let Some(ck_index) = self.hi_collision.try_get_index(lk) {
                let mut alias = *lk;
                alias.set_alias(ck_index, sk_index);
                sk_index = self.hi.try_get_index(&alias.small_key).ok_or_else(|| {
                    CaskError::corruption("collision alias missing from the smallKey index")
                })?;
            }
            return Ok((false, sk_index));
        }

        let selector = &mut self.selectors[usize::from(low)];
        let (inserted, lookup) = selector.keys.try_add(lk);
        if inserted {
            selector.index += 1;
            return Ok((true, selector.index));
        }
        // Duplicate within the open batch: its provisional index is the
        // batch base plus its insertion ordinal.
        Ok((false, lookup + selector.index - selector.keys.count() + 1))
    }

    /// Drains one selector into the canonical dictionary (GetLargeKeys).
    ///
    /// `out` receives the batch in selector insertion order, original key
    /// forms only; the dictionary gets the canonical records, with smallKey
    /// losers rewritten to aliases. Returns the fingerprint over the whole
    /// canonical key stream so far. Draining an empty selector is a no-op.
    pub fn drain_keys(&mut self, low: bool, out: &mut Vec<LargeKey>) -> Result<u64> {
        out.clear();
        let start_index = self.hi.count();
        let Self {
            hi,
            hi_collision,
            selectors,
            rm,
            lk_buffer,
            lk_dat,
            fingerprint,
            ..
        } = self;
        let selector = &mut selectors[usize::from(low)];
        if selector.keys.is_empty() {
            return Ok(fingerprint.digest());
        }

        for i in 0..selector.keys.count() {
            let original = *selector.keys.get_key(i);
            let mut lk = original;
            let (inserted, sk_index) = hi.try_add(&lk.small_key);
            if !inserted {
                let (new_collision, ck_index) = hi_collision.try_add(&lk);
                if !new_collision {
                    return Err(CaskError::corruption(
                        "full key already in the collision index while draining",
                    ));
                }
                lk.set_alias(ck_index, sk_index);
                if !hi.add(&lk.small_key) {
                    return Err(CaskError::corruption(
                        "alias smallKey already in the primary index",
                    ));
                }
            }
            lk_buffer.push(lk);
            if lk_buffer.len() >= LK_BUFFER_RECORDS {
                flush_large_keys(lk_buffer, lk_dat)?;
            }
            out.push(original);
        }

        let count = out.len() as u32;
        rm.add_range(low, selector.index - count + 1, start_index, count);
        selector.keys.clear();
        debug!(count, low, start_index, "selector drained");

        for key in out.iter() {
            fingerprint.update(&key.to_bytes());
        }
        Ok(fingerprint.digest())
    }

    /// Reconciles smallKey collisions against actual bytes. Call exactly
    /// once, after the final drain.
    ///
    /// `read(size, file_index, file_offset, scratch)` must refill the
    /// fragment's bytes; returning false (or short) drops the fragment's
    /// file. `emit(size, key)` observes every key appended to the
    /// dictionary here, in fingerprint order. Returns the final
    /// fingerprint.
    pub fn resolve_collisions<R, E>(&mut self, mut read: R, mut emit: E) -> Result<u64>
    where
        R: FnMut(u32, u32, i64, &mut Vec<u8>) -> bool,
        E: FnMut(u32, &LargeKey),
    {
        if self.selectors[0].keys.count() != 0
            || self.selectors[1].keys.count() != 0
            || self.fi_remap.count() != 0
        {
            return Err(CaskError::corruption(
                "collisions are resolved exactly once, after the final key drain",
            ));
        }

        flush_fragment_infos(&mut self.fi_buffer, &mut self.fi_log)?;

        // Write the dictionary tail out, but keep the records of the last
        // partial page resident: new aliases are appended by rewriting
        // that page.
        let resident = self.lk_buffer.len() % LK_PAGE_RECORDS;
        if resident != 0 {
            let tail = self.lk_buffer[self.lk_buffer.len() - resident..].to_vec();
            flush_large_keys(&mut self.lk_buffer, &mut self.lk_dat)?;
            self.lk_buffer = tail;
        } else {
            flush_large_keys(&mut self.lk_buffer, &mut self.lk_dat)?;
        }

        let log_len = self.fi_log.metadata()?.len();
        let sorter = StructSort::<FragmentInfo, _>::with_memory_budget(
            log_len,
            self.sort_memory_budget,
            |a: &FragmentInfo, b: &FragmentInfo| a.sk_index < b.sk_index,
        )?;

        // Provisional indices are remapped while the log is still in
        // insertion order; that is the order the range queues expect.
        {
            let rm = &mut self.rm;
            let mut pre = |record: &mut FragmentInfo| {
                record.sk_index = rm.remap(record.sk_index);
            };
            sorter.chunk_sort(&mut self.fi_log, Some(&mut pre), None)?;
        }
        self.selectors[0].index += 1;
        self.selectors[1].index += 1;
        self.rm
            .validate(self.selectors[1].index, self.selectors[0].index)?;

        let hi_limit = self.hi.count();
        let mut window: Vec<LargeKey> = Vec::new();
        let mut window_begin = 0u32;
        let mut window_end = 0u32;

        let Self {
            hi,
            hi_collision,
            fi_remap,
            lk_buffer,
            lk_dat,
            fingerprint,
            hasher,
            scratch,
            fi_log,
            ..
        } = self;

        let mut sink = |fi: &FragmentInfo| -> Result<()> {
            if fi.sk_index == 0 {
                return Ok(());
            }
            if fi.sk_index >= hi_limit {
                return Err(CaskError::corruption(format!(
                    "log record points past the dictionary: {} >= {}",
                    fi.sk_index, hi_limit
                )));
            }
            if fi.sk_index >= window_end {
                let begin = fi.sk_index / LK_WINDOW_RECORDS * LK_WINDOW_RECORDS;
                read_key_window(lk_dat, begin, &mut window)?;
                if window.is_empty() {
                    return Err(CaskError::corruption(
                        "dictionary window read past the end of lk.dat",
                    ));
                }
                window_begin = begin;
                window_end = begin + window.len() as u32;
            }
            if fi.sk_index < window_begin {
                return Err(CaskError::corruption(
                    "sorted log went backwards through the dictionary",
                ));
            }
            let row = window[(fi.sk_index - window_begin) as usize];
            if fi.digest_matches(&row) {
                return Ok(());
            }
            // The row owns this smallKey with a different digest, so the
            // record belongs to a collision alias. An alias row can only be
            // reached through a digest match.
            if !row.has_size() {
                return Err(CaskError::corruption(
                    "digest mismatch against an alias dictionary row",
                ));
            }
            let mut clk = LargeKey {
                small_key: row.small_key,
                l1: fi.l1,
                l2: fi.l2,
                l3: fi.l3,
            };
            let record_key = fi.key();

            if let Some(ck_index) = hi_collision.try_get_index(&clk) {
                let mut alias = clk;
                alias.set_alias(ck_index, fi.sk_index);
                let sk_index = hi.try_get_index(&alias.small_key).ok_or_else(|| {
                    CaskError::corruption("known collision has no smallKey entry")
                })?;
                add_remap(fi_remap, record_key, sk_index)?;
                return Ok(());
            }

            // Unknown alias: go back to the file bytes.
            let size = clk.size();
            scratch.clear();
            if !read(size, fi.file_index, fi.file_offset, scratch)
                || scratch.len() < size as usize
            {
                add_remap(fi_remap, record_key, 0)?;
                return Ok(());
            }
            let digest = hasher.digest(&scratch[..size as usize]);
            let mut rehashed = LargeKey::from_digest(&digest);
            rehashed.set_size(size);

            if rehashed.small_key == clk.small_key && fi.digest_matches(&rehashed) {
                // The file is unchanged: admit the key as a new alias.
                fingerprint.update(&rehashed.to_bytes());
                emit(size, &rehashed);
                let (new_collision, ck_index) = hi_collision.try_add(&rehashed);
                if !new_collision {
                    return Err(CaskError::corruption(
                        "re-hashed key already in the collision index",
                    ));
                }
                clk = rehashed;
                clk.set_alias(ck_index, fi.sk_index);
                let (inserted, sk_index) = hi.try_add(&clk.small_key);
                if !inserted {
                    return Err(CaskError::corruption(
                        "new alias smallKey already in the primary index",
                    ));
                }
                lk_buffer.push(clk);
                add_remap(fi_remap, record_key, sk_index)?;
            } else {
                // The file changed underneath us: drop it.
                add_remap(fi_remap, record_key, 0)?;
            }
            Ok(())
        };
        sorter.sort(fi_log, &mut sink)?;
        drop(sink);

        // Append the aliases admitted above, rewriting the resident page.
        if !lk_buffer.is_empty() {
            if resident < lk_buffer.len() {
                let rewind = if resident != 0 { -4096 } else { 0 };
                lk_dat.seek(SeekFrom::End(rewind))?;
                flush_large_keys(lk_buffer, lk_dat)?;
            } else {
                lk_buffer.clear();
            }
        }

        info!(
            keys = hi.count(),
            collisions = hi_collision.count(),
            remapped = fi_remap.count(),
            "collision resolution complete"
        );
        Ok(fingerprint.digest())
    }

    /// Rebuilds each file's ordered fragment index list (GetFileIndexInfo).
    ///
    /// Files containing a dropped fragment are omitted entirely; padding
    /// records never reach the sink.
    pub fn file_index_info(&mut self, mut sink: impl FnMut(u32, &[u32])) -> Result<()> {
        let log_len = self.fi_log.metadata()?.len();
        let sorter = StructSort::<FragmentInfo, _>::with_memory_budget(
            log_len,
            self.sort_memory_budget,
            |a: &FragmentInfo, b: &FragmentInfo| {
                (a.file_index, a.file_offset) < (b.file_index, b.file_offset)
            },
        )?;

        if self.fi_remap.count() != 0 {
            let remap = &self.fi_remap;
            let mut pre = |record: &mut FragmentInfo| {
                if let Some(index) = remap.get(&record.key()) {
                    record.sk_index = *index;
                }
            };
            sorter.chunk_sort(&mut self.fi_log, Some(&mut pre), None)?;
        } else {
            sorter.chunk_sort(&mut self.fi_log, None, None)?;
        }

        let mut indices: Vec<u32> = Vec::with_capacity(16 * 1024);
        let mut current: Option<(u32, bool)> = None;
        {
            let mut merge_sink = |fi: &FragmentInfo| -> Result<()> {
                if fi.is_padding() {
                    return Ok(());
                }
                match &mut current {
                    Some((file_index, usable)) if *file_index == fi.file_index => {
                        if *usable {
                            if fi.sk_index != 0 {
                                indices.push(fi.sk_index);
                            } else {
                                *usable = false;
                            }
                        }
                    }
                    _ => {
                        if let Some((file_index, true)) = current {
                            if !indices.is_empty() {
                                sink(file_index, &indices);
                            }
                        }
                        indices.clear();
                        current = Some((fi.file_index, fi.sk_index != 0));
                        if fi.sk_index != 0 {
                            indices.push(fi.sk_index);
                        }
                    }
                }
                Ok(())
            };
            sorter.sort(&mut self.fi_log, &mut merge_sink)?;
        }
        if let Some((file_index, true)) = current {
            if !indices.is_empty() {
                sink(file_index, &indices);
            }
        }
        Ok(())
    }

    /// Seeds the store from a previously emitted canonical dictionary.
    /// Keys must arrive in dictionary order; aliases re-register against
    /// their primary's smallKey.
    pub fn load(&mut self, keys: &[LargeKey]) -> Result<()> {
        for key in keys {
            if key.small_key == 0 {
                return Err(CaskError::corruption("zero smallKey in a dictionary load"));
            }
            if !self.hi.add(&key.small_key) {
                return Err(CaskError::corruption(
                    "duplicate smallKey in a dictionary load",
                ));
            }
            self.lk_buffer.push(*key);
            if self.lk_buffer.len() >= LK_BUFFER_RECORDS {
                flush_large_keys(&mut self.lk_buffer, &mut self.lk_dat)?;
            }
            if !key.has_size() {
                if self.hi_collision.count() != key.collision_index() {
                    return Err(CaskError::corruption(
                        "alias out of collision order in a dictionary load",
                    ));
                }
                let sk_index = key.sk_index();
                if sk_index >= self.hi.count() {
                    return Err(CaskError::corruption(
                        "alias points past the loaded dictionary",
                    ));
                }
                let mut primary = *key;
                primary.small_key = *self.hi.get_key(sk_index);
                if !self.hi_collision.add(&primary) {
                    return Err(CaskError::corruption(
                        "duplicate full key in a dictionary load",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Drives a chunker over a source and offers every fragment, routing
    /// high-scoring (repetitive) fragments to the cold selector. Returns
    /// the fragment count.
    pub fn ingest_source<S: ByteSource>(
        &mut self,
        chunker: &mut ZpaqChunker,
        source: &mut S,
        file_index: u32,
    ) -> Result<u32> {
        let mut offset = 0i64;
        let mut fragments = 0u32;
        chunker.cut(source, |fragment, score| {
            self.add(fragment, file_index, offset, score >= LOW_ENTROPY_SCORE)?;
            offset += fragment.len() as i64;
            fragments += 1;
            Ok(())
        })?;
        Ok(fragments)
    }
}

impl Drop for LargeKeyStore {
    fn drop(&mut self) {
        if let Err(error) = flush_fragment_infos(&mut self.fi_buffer, &mut self.fi_log) {
            warn!(%error, "fragment log flush failed on drop");
        }
        if let Err(error) = flush_large_keys(&mut self.lk_buffer, &mut self.lk_dat) {
            warn!(%error, "dictionary flush failed on drop");
        }
    }
}

fn add_remap(
    fi_remap: &mut Map<FragmentInfoKey, u32>,
    key: FragmentInfoKey,
    index: u32,
) -> Result<()> {
    if !fi_remap.add(key, index) {
        return Err(CaskError::corruption(format!(
            "fragment at file {} offset {} remapped twice",
            key.file_index, key.file_offset
        )));
    }
    Ok(())
}

/// Pads the buffer to a whole block with sentinel records and appends it.
fn flush_fragment_infos(buffer: &mut Vec<FragmentInfo>, file: &mut File) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let remainder = buffer.len() % FI_BLOCK_RECORDS;
    if remainder != 0 {
        for _ in remainder..FI_BLOCK_RECORDS {
            buffer.push(FragmentInfo::padding());
        }
    }
    let mut bytes = vec![0u8; buffer.len() * FragmentInfo::SIZE];
    for (record, slot) in buffer.iter().zip(bytes.chunks_exact_mut(FragmentInfo::SIZE)) {
        record.write_to(slot);
    }
    file.write_all(&bytes)?;
    debug!(records = buffer.len(), "fragment log flush");
    buffer.clear();
    Ok(())
}

/// Pads the buffer to a whole page with zero records and appends it.
fn flush_large_keys(buffer: &mut Vec<LargeKey>, file: &mut File) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let remainder = buffer.len() % LK_PAGE_RECORDS;
    if remainder != 0 {
        buffer.resize(buffer.len() + LK_PAGE_RECORDS - remainder, LargeKey::SENTINEL);
    }
    let mut bytes = vec![0u8; buffer.len() * LargeKey::SIZE];
    for (record, slot) in buffer.iter().zip(bytes.chunks_exact_mut(LargeKey::SIZE)) {
        record.write_to(slot);
    }
    file.write_all(&bytes)?;
    debug!(records = buffer.len(), "dictionary flush");
    buffer.clear();
    Ok(())
}

fn read_key_window(file: &mut File, begin_record: u32, out: &mut Vec<LargeKey>) -> Result<()> {
    out.clear();
    let offset = begin_record as u64 * LargeKey::SIZE as u64;
    let len = file.metadata()?.len();
    if offset >= len {
        return Ok(());
    }
    let bytes = ((len - offset) as usize).min(LK_WINDOW_RECORDS as usize * LargeKey::SIZE);
    let mut buf = vec![0u8; bytes];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    out.extend(buf.chunks_exact(LargeKey::SIZE).map(LargeKey::read_from));
    Ok(())
}
