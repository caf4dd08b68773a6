//! External merge sort over files of fixed-size records.
//!
//! The file is sorted in two passes that share one planning step:
//! [`StructSort::chunk_sort`] turns the file into sorted runs (optionally
//! transforming records on the way in, or emitting them instead of writing
//! back), and [`StructSort::sort`] merges the runs through a binary
//! min-heap, streaming records to a sink in comparator order. Chunks are
//! sized in whole 4 KiB-aligned record blocks so every read and write is
//! page-shaped.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

use rayon::slice::ParallelSliceMut;

use crate::error::{CaskError, Result};

/// Default memory budget of a sort: 256 MiB.
pub const DEFAULT_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

/// A fixed-size record with an explicit little-endian byte image.
pub trait Record: Copy {
    /// Record size in bytes; must be even.
    const SIZE: usize;

    fn read_from(buf: &[u8]) -> Self;

    fn write_to(&self, buf: &mut [u8]);
}

/// Records per block, where a block is the smallest run of records whose
/// byte size is a whole multiple of 4096.
pub fn records_per_block(record_size: usize) -> usize {
    4096 / gcd(record_size, 4096)
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Largest multiple of `alignment` not exceeding `max_chunk` whose final
/// chunk stays at least 90% full, falling back to `alignment`.
fn optimal_chunk_records(num_records: u64, max_chunk: u64, alignment: u64) -> u64 {
    let mut chunk = max_chunk / alignment * alignment;
    while chunk >= alignment {
        let num_chunks = num_records.div_ceil(chunk);
        let last = num_records - (num_chunks - 1) * chunk;
        if last * 10 >= chunk * 9 {
            return chunk;
        }
        chunk -= alignment;
    }
    alignment
}

/// Merge cursor over one sorted run of the file.
struct RunCursor<T> {
    /// Absolute record index of the next disk read.
    next: u64,
    /// One past the last record of the run.
    end: u64,
    buffered: Vec<T>,
    head: usize,
}

impl<T> RunCursor<T> {
    fn has_record(&self) -> bool {
        self.head < self.buffered.len()
    }
}

pub struct StructSort<T, F> {
    num_records: u64,
    chunk_records: u64,
    preload_records: u64,
    less: F,
    _record: PhantomData<T>,
}

impl<T, F> std::fmt::Debug for StructSort<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructSort")
            .field("num_records", &self.num_records)
            .field("chunk_records", &self.chunk_records)
            .field("preload_records", &self.preload_records)
            .finish_non_exhaustive()
    }
}

impl<T, F> StructSort<T, F>
where
    T: Record + Send + Sync,
    F: Fn(&T, &T) -> bool + Sync,
{
    pub fn new(file_len: u64, less: F) -> Result<Self> {
        Self::with_memory_budget(file_len, DEFAULT_MEMORY_BUDGET, less)
    }

    pub fn with_memory_budget(file_len: u64, budget: usize, less: F) -> Result<Self> {
        if T::SIZE == 0 || T::SIZE % 2 != 0 {
            return Err(CaskError::config(format!(
                "record size must be even and non-zero, got {}",
                T::SIZE
            )));
        }
        let record_size = T::SIZE as u64;
        if file_len % record_size != 0 {
            return Err(CaskError::corruption(format!(
                "file length {file_len} is not a multiple of the record size {record_size}"
            )));
        }
        let num_records = file_len / record_size;
        let alignment = records_per_block(T::SIZE) as u64;
        if num_records % alignment != 0 {
            return Err(CaskError::corruption(format!(
                "record count {num_records} is not a multiple of the block alignment {alignment}"
            )));
        }
        let max_chunk = (budget as u64 / record_size).max(alignment);
        let chunk_records = if num_records <= max_chunk {
            num_records.max(alignment)
        } else {
            optimal_chunk_records(num_records, max_chunk, alignment)
        };
        let preload_records = (budget as u64 / 1024 / record_size).max(alignment);
        Ok(Self {
            num_records,
            chunk_records,
            preload_records,
            less,
            _record: PhantomData,
        })
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    pub fn chunk_records(&self) -> u64 {
        self.chunk_records
    }

    fn compare(&self, a: &T, b: &T) -> Ordering {
        if (self.less)(a, b) {
            Ordering::Less
        } else if (self.less)(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Streams the file chunk by chunk: applies `pre` to each record in
    /// place, sorts the chunk (stable), then either emits every record
    /// through `after` without touching the file, or rewrites the chunk in
    /// place. The rewrite is skipped when nothing changed and the chunk
    /// was already sorted.
    pub fn chunk_sort(
        &self,
        file: &mut File,
        mut pre: Option<&mut dyn FnMut(&mut T)>,
        mut after: Option<&mut dyn FnMut(&T) -> Result<()>>,
    ) -> Result<()> {
        if self.num_records == 0 {
            return Ok(());
        }
        file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; self.chunk_records as usize * T::SIZE];
        let mut remaining = self.num_records;
        while remaining > 0 {
            let n = remaining.min(self.chunk_records) as usize;
            let bytes = n * T::SIZE;
            file.read_exact(&mut buf[..bytes])?;
            let mut records: Vec<T> = buf[..bytes]
                .chunks_exact(T::SIZE)
                .map(T::read_from)
                .collect();
            let mut changed = false;
            if let Some(pre) = pre.as_deref_mut() {
                for record in &mut records {
                    pre(record);
                }
                changed = true;
            }
            let was_sorted = records.windows(2).all(|w| !(self.less)(&w[1], &w[0]));
            if !was_sorted {
                records.par_sort_by(|a, b| self.compare(a, b));
            }
            if let Some(after) = after.as_deref_mut() {
                for record in &records {
                    after(record)?;
                }
            } else if changed || !was_sorted {
                for (record, slot) in records.iter().zip(buf[..bytes].chunks_exact_mut(T::SIZE)) {
                    record.write_to(slot);
                }
                file.seek(SeekFrom::Current(-(bytes as i64)))?;
                file.write_all(&buf[..bytes])?;
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    /// K-way merge of the chunk-sorted runs. Every record is emitted
    /// exactly once, in non-decreasing comparator order. The file must have
    /// been through [`chunk_sort`](Self::chunk_sort) with the same planning
    /// (same instance, or same length/budget/comparator).
    pub fn sort(
        &self,
        file: &mut File,
        sink: &mut dyn FnMut(&T) -> Result<()>,
    ) -> Result<()> {
        if self.num_records == 0 {
            return Ok(());
        }
        let num_chunks = self.num_records.div_ceil(self.chunk_records) as usize;
        let mut runs: Vec<RunCursor<T>> = Vec::with_capacity(num_chunks);
        for i in 0..num_chunks {
            let begin = i as u64 * self.chunk_records;
            let end = self.num_records.min(begin + self.chunk_records);
            runs.push(RunCursor {
                next: begin,
                end,
                buffered: Vec::new(),
                head: 0,
            });
        }

        let mut heap: Vec<usize> = Vec::with_capacity(num_chunks);
        for id in 0..num_chunks {
            self.refill(file, &mut runs[id])?;
            if runs[id].has_record() {
                self.heap_push(&mut heap, &runs, id);
            }
        }

        while let Some(id) = self.heap_pop(&mut heap, &runs) {
            {
                let run = &runs[id];
                sink(&run.buffered[run.head])?;
            }
            let run = &mut runs[id];
            run.head += 1;
            if !run.has_record() && run.next < run.end {
                self.refill(file, run)?;
            }
            if runs[id].has_record() {
                self.heap_push(&mut heap, &runs, id);
            }
        }
        Ok(())
    }

    fn refill(&self, file: &mut File, run: &mut RunCursor<T>) -> Result<()> {
        let n = (run.end - run.next).min(self.preload_records) as usize;
        run.buffered.clear();
        run.head = 0;
        if n == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; n * T::SIZE];
        file.seek(SeekFrom::Start(run.next * T::SIZE as u64))?;
        file.read_exact(&mut buf)?;
        run.buffered.extend(buf.chunks_exact(T::SIZE).map(T::read_from));
        run.next += n as u64;
        Ok(())
    }

    fn head_less(&self, runs: &[RunCursor<T>], a: usize, b: usize) -> bool {
        let ra = &runs[a];
        let rb = &runs[b];
        (self.less)(&ra.buffered[ra.head], &rb.buffered[rb.head])
    }

    fn heap_push(&self, heap: &mut Vec<usize>, runs: &[RunCursor<T>], id: usize) {
        heap.push(id);
        let mut child = heap.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if self.head_less(runs, heap[child], heap[parent]) {
                heap.swap(child, parent);
                child = parent;
            } else {
                break;
            }
        }
    }

    fn heap_pop(&self, heap: &mut Vec<usize>, runs: &[RunCursor<T>]) -> Option<usize> {
        if heap.is_empty() {
            return None;
        }
        let top = heap.swap_remove(0);
        let len = heap.len();
        let mut parent = 0usize;
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = parent;
            if self.head_less(runs, heap[left], heap[smallest]) {
                smallest = left;
            }
            if right < len && self.head_less(runs, heap[right], heap[smallest]) {
                smallest = right;
            }
            if smallest == parent {
                break;
            }
            heap.swap(parent, smallest);
            parent = smallest;
        }
        Some(top)
    }
}
