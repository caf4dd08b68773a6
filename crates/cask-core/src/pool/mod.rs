//! Growing memory pool: a bump arena over fixed-size pages with a
//! checkpoint stack. Allocations live until [`GrowingMemoryPool::release`];
//! a checkpoint lets a caller allocate speculatively and throw the
//! allocations away on failure by truncating back to the recorded
//! high-water mark.

pub const MIN_PAGE_SIZE: usize = 4096;

/// Handle to an allocation: (page, offset, len). Handles stay valid until
/// `release` or a rollback past their checkpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PoolRef {
    page: u32,
    offset: u32,
    len: u32,
}

impl PoolRef {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Copy)]
struct Checkpoint {
    page: usize,
    used: usize,
}

pub struct GrowingMemoryPool {
    pages: Vec<Vec<u8>>,
    checkpoints: Vec<Checkpoint>,
    page_size: usize,
}

impl GrowingMemoryPool {
    /// Pages are sized to the nearest 4 KiB at or below the request, and
    /// never below 4 KiB.
    pub fn new(page_size: usize) -> Self {
        let page_size = page_size.max(MIN_PAGE_SIZE);
        let page_size = ((page_size + MIN_PAGE_SIZE) / MIN_PAGE_SIZE - 1) * MIN_PAGE_SIZE;
        Self {
            pages: Vec::new(),
            checkpoints: Vec::new(),
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Copies `data` into the arena. Panics if a single allocation exceeds
    /// the page size; that is a construction-time sizing mistake.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> PoolRef {
        let r = self.alloc(data.len());
        self.bytes_mut(r).copy_from_slice(data);
        r
    }

    /// Reserves `size` zero-initialized bytes.
    pub fn alloc(&mut self, size: usize) -> PoolRef {
        assert!(
            size <= self.page_size,
            "allocation of {size} bytes exceeds the page size {}",
            self.page_size
        );
        if size == 0 {
            return PoolRef {
                page: 0,
                offset: 0,
                len: 0,
            };
        }
        let fits = self
            .pages
            .last()
            .is_some_and(|page| page.len() + size <= self.page_size);
        if !fits {
            self.pages.push(Vec::with_capacity(self.page_size));
        }
        let page_index = self.pages.len() - 1;
        let page = &mut self.pages[page_index];
        let offset = page.len();
        page.resize(offset + size, 0);
        PoolRef {
            page: page_index as u32,
            offset: offset as u32,
            len: size as u32,
        }
    }

    pub fn bytes(&self, r: PoolRef) -> &[u8] {
        if r.len == 0 {
            return &[];
        }
        let start = r.offset as usize;
        &self.pages[r.page as usize][start..start + r.len as usize]
    }

    pub fn bytes_mut(&mut self, r: PoolRef) -> &mut [u8] {
        if r.len == 0 {
            return &mut [];
        }
        let start = r.offset as usize;
        &mut self.pages[r.page as usize][start..start + r.len as usize]
    }

    /// Records the current high-water mark.
    pub fn checkpoint(&mut self) {
        let cp = match self.pages.last() {
            None => Checkpoint { page: 0, used: 0 },
            Some(page) => Checkpoint {
                page: self.pages.len() - 1,
                used: page.len(),
            },
        };
        self.checkpoints.push(cp);
    }

    /// Keeps everything allocated since the last checkpoint.
    pub fn discard_checkpoint(&mut self) {
        self.checkpoints.pop();
    }

    /// Frees everything allocated since the last checkpoint: drops the
    /// pages past the recorded one and truncates the recorded page back to
    /// its used count.
    pub fn rollback_checkpoint(&mut self) {
        if let Some(cp) = self.checkpoints.pop() {
            while self.pages.len() > cp.page + 1 {
                self.pages.pop();
            }
            if let Some(page) = self.pages.get_mut(cp.page) {
                page.truncate(cp.used);
            }
        }
    }

    /// Frees everything.
    pub fn release(&mut self) {
        self.pages.clear();
        self.checkpoints.clear();
    }
}
