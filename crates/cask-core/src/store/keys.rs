use std::fmt;

use xxhash_rust::xxh3::xxh3_64;

use crate::simd_hash::TableKey;
use crate::sort::Record;

/// Fragment length limit: 19 bits.
pub const MAX_FRAGMENT_SIZE: u32 = (1 << 19) - 1;

/// Marks padding records in the fragment log.
pub const PADDING_FILE_INDEX: u32 = u32::MAX;

/// 256-bit fragment identity in one of two forms, told apart by the low
/// bit of `small_key`:
///
/// - **key form** (low bit 1): `small_key` carries the top of the digest,
///   the low 19 bits of `l1` carry the fragment length, the rest of
///   `l1..l3` is digest.
/// - **alias form** (low bit 0): the key lost the smallKey race to another
///   digest; `small_key` packs (collision index, smallKey index) and the
///   digest words stay intact.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LargeKey {
    pub small_key: u64,
    pub l1: u64,
    pub l2: u64,
    pub l3: u64,
}

impl LargeKey {
    pub const SIZE: usize = 32;

    /// The all-zero key reserved at index 0 of the dictionary.
    pub const SENTINEL: LargeKey = LargeKey {
        small_key: 0,
        l1: 0,
        l2: 0,
        l3: 0,
    };

    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self {
            small_key: u64::from_le_bytes(digest[0..8].try_into().expect("8-byte slice")),
            l1: u64::from_le_bytes(digest[8..16].try_into().expect("8-byte slice")),
            l2: u64::from_le_bytes(digest[16..24].try_into().expect("8-byte slice")),
            l3: u64::from_le_bytes(digest[24..32].try_into().expect("8-byte slice")),
        }
    }

    /// Key form carries the fragment length; alias form does not.
    #[inline]
    pub fn has_size(&self) -> bool {
        self.small_key & 1 == 1
    }

    #[inline]
    pub fn size(&self) -> u32 {
        (self.l1 & MAX_FRAGMENT_SIZE as u64) as u32
    }

    /// Embeds the fragment length and switches the record to key form.
    #[inline]
    pub fn set_size(&mut self, size: u32) {
        debug_assert!(size <= MAX_FRAGMENT_SIZE);
        self.l1 = (self.l1 & !(MAX_FRAGMENT_SIZE as u64)) | size as u64;
        self.small_key |= 1;
    }

    /// Alias form, bits [31:1].
    #[inline]
    pub fn collision_index(&self) -> u32 {
        (self.small_key as u32) >> 1
    }

    /// Alias form, bits [63:32].
    #[inline]
    pub fn sk_index(&self) -> u32 {
        (self.small_key >> 32) as u32
    }

    /// Rewrites `small_key` to alias form; the digest words are untouched.
    #[inline]
    pub fn set_alias(&mut self, collision_index: u32, sk_index: u32) {
        self.small_key =
            (sk_index as u64) << 32 | ((collision_index as u64 & 0x7FFF_FFFF) << 1);
    }

    /// Digest-words-only comparison; the smallKey slot is excluded because
    /// it may hold an alias or, in a log record, a file offset.
    #[inline]
    pub fn short_cmp(&self, other: &LargeKey) -> bool {
        self.l1 == other.l1 && self.l2 == other.l2 && self.l3 == other.l3
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..8].copy_from_slice(&self.small_key.to_le_bytes());
        out[8..16].copy_from_slice(&self.l1.to_le_bytes());
        out[16..24].copy_from_slice(&self.l2.to_le_bytes());
        out[24..32].copy_from_slice(&self.l3.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_digest(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::SENTINEL
    }
}

impl TableKey for LargeKey {
    fn table_hash(&self) -> u64 {
        xxh3_64(&self.to_bytes())
    }
}

impl Record for LargeKey {
    const SIZE: usize = 32;

    fn read_from(buf: &[u8]) -> Self {
        Self::from_digest(buf[..32].try_into().expect("32-byte record"))
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[..32].copy_from_slice(&self.to_bytes());
    }
}

impl fmt::Debug for LargeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LargeKey({})", &hex::encode(self.to_bytes())[..16])
    }
}

impl fmt::Display for LargeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.to_bytes())[..16])
    }
}

/// One fragment observation, appended to the fragment log in insertion
/// order. The digest remainder shares the record with the file
/// coordinates: `small_key` is recoverable from the dictionary row the
/// record's `sk_index` points at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FragmentInfo {
    pub sk_index: u32,
    pub file_index: u32,
    pub file_offset: i64,
    pub l1: u64,
    pub l2: u64,
    pub l3: u64,
}

impl FragmentInfo {
    pub const SIZE: usize = 40;

    pub fn padding() -> Self {
        Self {
            sk_index: 0,
            file_index: PADDING_FILE_INDEX,
            file_offset: 0,
            l1: 0,
            l2: 0,
            l3: 0,
        }
    }

    pub fn is_padding(&self) -> bool {
        self.file_index == PADDING_FILE_INDEX
    }

    /// Matches the digest remainder against a key's digest words.
    pub fn digest_matches(&self, key: &LargeKey) -> bool {
        self.l1 == key.l1 && self.l2 == key.l2 && self.l3 == key.l3
    }

    pub fn key(&self) -> FragmentInfoKey {
        FragmentInfoKey {
            file_index: self.file_index,
            file_offset: self.file_offset,
        }
    }
}

impl Record for FragmentInfo {
    const SIZE: usize = 40;

    fn read_from(buf: &[u8]) -> Self {
        Self {
            sk_index: u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")),
            file_index: u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice")),
            file_offset: i64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
            l1: u64::from_le_bytes(buf[16..24].try_into().expect("8-byte slice")),
            l2: u64::from_le_bytes(buf[24..32].try_into().expect("8-byte slice")),
            l3: u64::from_le_bytes(buf[32..40].try_into().expect("8-byte slice")),
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.sk_index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.file_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.file_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.l1.to_le_bytes());
        buf[24..32].copy_from_slice(&self.l2.to_le_bytes());
        buf[32..40].copy_from_slice(&self.l3.to_le_bytes());
    }
}

/// Identity of a log record across the two resolve passes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FragmentInfoKey {
    pub file_index: u32,
    pub file_offset: i64,
}

impl TableKey for FragmentInfoKey {
    fn table_hash(&self) -> u64 {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&(self.file_index as u64).to_le_bytes());
        bytes[8..16].copy_from_slice(&self.file_offset.to_le_bytes());
        xxh3_64(&bytes)
    }
}
