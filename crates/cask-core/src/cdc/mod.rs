//! Content-defined chunking.
//!
//! An order-1 rolling hash walks the stream and declares a fragment
//! boundary wherever the hash dips below a limit derived from the target
//! mean size. Boundaries depend only on content, so an edit moves the cuts
//! near it and leaves the rest of the stream fragmented identically,
//! which is what lets downstream deduplication find the unchanged parts.
//!
//! Each fragment also gets a cheap entropy score (`hits * 100 / len`):
//! the number of order-1 prediction hits per hundred bytes. Repetitive,
//! highly compressible data scores high; random data scores near zero.
//! The score is advisory, downstream may use it to route fragments.

use std::io::{self, Read};

use crate::config::ChunkerConfig;
use crate::error::Result;

/// Supplies the stream in whatever block sizes suit the producer.
///
/// `next_block(consumed)` first advances past the `consumed` bytes of the
/// previous block, then returns the next view of the stream; `None` or an
/// empty block ends the stream. Fragment boundaries do not depend on how
/// the producer chooses its block sizes.
pub trait ByteSource {
    fn next_block(&mut self, consumed: usize) -> io::Result<Option<&[u8]>>;
}

/// The whole stream as one in-memory slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_block(&mut self, consumed: usize) -> io::Result<Option<&[u8]>> {
        self.pos += consumed;
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        Ok(Some(&self.data[self.pos..]))
    }
}

/// Reads the stream from any `Read` through an internal buffer.
pub struct ReaderSource<R: Read> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, 256 * 1024)
    }

    pub fn with_buffer_size(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            buf: vec![0; buffer_size.max(4096)],
            pos: 0,
            filled: 0,
        }
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn next_block(&mut self, consumed: usize) -> io::Result<Option<&[u8]>> {
        self.pos += consumed;
        if self.pos >= self.filled {
            self.pos = 0;
            self.filled = 0;
            loop {
                match self.reader.read(&mut self.buf) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        self.filled = n;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(Some(&self.buf[self.pos..self.filled]))
    }
}

/// Rolling-hash cutter. One instance owns the fragment buffer and the
/// order-1 prediction table and can be reused across streams.
pub struct ZpaqChunker {
    fast_mult: [u32; 256],
    fast_sum: [u32; 256],
    o1: [u8; 256],
    fragment: Vec<u8>,
    hash_limit: u32,
    min_fragment_size: usize,
    max_fragment_size: usize,
}

impl ZpaqChunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        let mut fast_mult = [271_828_182u32; 256];
        fast_mult[0] = 314_159_265;
        let mut fast_sum = [0u32; 256];
        fast_sum[0] = 1;
        let buffer_size = 1usize << config.max_fragment_bits;
        let max_fragment_size = buffer_size - usize::from(config.include_zero_size);
        Ok(Self {
            fast_mult,
            fast_sum,
            o1: [0; 256],
            fragment: vec![0; buffer_size],
            hash_limit: (1u32 << (22 - config.avg_fragment_size)) + 4096,
            min_fragment_size: config.min_fragment_size as usize,
            max_fragment_size,
        })
    }

    pub fn hash_limit(&self) -> u32 {
        self.hash_limit
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// Cuts the stream into fragments and hands each `(fragment, score)`
    /// to the sink. A trailing partial fragment is emitted at end of
    /// stream; an empty stream emits nothing.
    pub fn cut<S: ByteSource>(
        &mut self,
        source: &mut S,
        mut sink: impl FnMut(&[u8], u32) -> Result<()>,
    ) -> Result<()> {
        let mut hash = 0u32;
        let mut hits = 0u32;
        let mut prev = 0usize;
        let mut fragment_length = 0usize;
        let mut consumed = 0usize;

        loop {
            let block = match source.next_block(consumed)? {
                Some(block) if !block.is_empty() => block,
                _ => break,
            };

            if fragment_length < self.min_fragment_size {
                if fragment_length == 0 {
                    // New fragment: reset the order-1 table and prime it
                    // with the first byte so its own prediction hits.
                    self.o1.fill(0);
                    let first = block[0];
                    prev = first as usize;
                    self.o1[prev] = first;
                    hash = 0;
                    hits = 0;
                }
                // Below the minimum the hash accumulates but is never
                // tested, which hard-enforces the minimum fragment size.
                let take = block.len().min(self.min_fragment_size - fragment_length);
                self.fragment[fragment_length..fragment_length + take]
                    .copy_from_slice(&block[..take]);
                for &b in &block[..take] {
                    let m = (self.o1[prev] ^ b) as usize;
                    hash = hash
                        .wrapping_add(1)
                        .wrapping_add(b as u32)
                        .wrapping_mul(self.fast_mult[m]);
                    hits = hits.wrapping_add(self.fast_sum[m]);
                    self.o1[prev] = b;
                    prev = b as usize;
                }
                fragment_length += take;
                consumed = take;
                continue;
            }

            let limit = block.len().min(self.max_fragment_size - fragment_length);
            let mut used = 0usize;
            let mut cut_found = false;
            while used < limit {
                let b = block[used];
                let m = (self.o1[prev] ^ b) as usize;
                hash = hash
                    .wrapping_add(1)
                    .wrapping_add(b as u32)
                    .wrapping_mul(self.fast_mult[m]);
                hits = hits.wrapping_add(self.fast_sum[m]);
                self.o1[prev] = b;
                prev = b as usize;
                used += 1;
                if hash < self.hash_limit {
                    cut_found = true;
                    break;
                }
            }
            self.fragment[fragment_length..fragment_length + used].copy_from_slice(&block[..used]);
            fragment_length += used;
            consumed = used;

            if cut_found || fragment_length == self.max_fragment_size {
                sink(&self.fragment[..fragment_length], hits * 100 / fragment_length as u32)?;
                fragment_length = 0;
            }
        }

        if fragment_length > 0 {
            sink(&self.fragment[..fragment_length], hits * 100 / fragment_length as u32)?;
        }
        Ok(())
    }
}
