use crate::block::BlockHandle;

/// Shift applied to page offsets to pick a hash bucket.
pub const HASH_SHIFT: usize = 4;
/// Bucket 0 holds cross-page spare entries; 1..=256 hold blocks keyed
/// by their in-page start offset.
pub const HASH_BUCKETS: usize = 1 + (4096 >> HASH_SHIFT);

/// Per-guest-page bookkeeping for translated code.
///
/// `write_map[i]` counts how many cached blocks cover byte `i`; a guest
/// write to a covered byte invalidates the overlapping blocks. The
/// invalidation map counts guest writes per byte and is allocated
/// lazily on the first write into covered code; the decoder reads it to
/// spot bytes hot enough to leave to the interpreter.
#[derive(Debug)]
pub struct CodePage {
    pub phys_page: u32,
    pub write_map: Box<[u8]>,
    pub invalidation_map: Option<Box<[u8]>>,
    pub hash: Vec<Option<BlockHandle>>,
    /// Number of blocks currently registered on this page.
    pub active_blocks: u32,
    /// Countdown of code-free writes before the page is released.
    pub active_count: u32,
}

impl CodePage {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            phys_page: 0,
            write_map: vec![0; page_size].into_boxed_slice(),
            invalidation_map: None,
            hash: vec![None; HASH_BUCKETS],
            active_blocks: 0,
            active_count: 0,
        }
    }

    pub(crate) fn setup(&mut self, phys_page: u32, release_delay: u32) {
        self.phys_page = phys_page;
        self.write_map.fill(0);
        self.invalidation_map = None;
        self.hash.fill(None);
        self.active_blocks = 0;
        self.active_count = release_delay;
    }

    /// Write counter for a byte, zero when the byte was never written.
    #[inline]
    pub fn invalidation_count(&self, offset: usize) -> u8 {
        self.invalidation_map
            .as_ref()
            .map_or(0, |m| m[offset])
    }

    pub(crate) fn bump_invalidation(&mut self, offset: usize, len: usize) {
        let map = self
            .invalidation_map
            .get_or_insert_with(|| vec![0; self.write_map.len()].into_boxed_slice());
        for i in offset..offset + len {
            map[i] = map[i].saturating_add(1);
        }
    }
}
