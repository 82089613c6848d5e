/// Index of a block descriptor in the cache's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle(pub(crate) u32);

impl BlockHandle {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// What a link slot currently resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkTarget {
    /// The pre-built stub that returns the slot's link code.
    #[default]
    Stub,
    Block(BlockHandle),
}

/// One translated unit of guest code.
///
/// Descriptors are pooled; a handle stays valid across clears, only the
/// fields are recycled. Blocks that own arena memory stay threaded on
/// the memory-order chain forever; spare cross-page entries own no
/// memory and travel between the free chain and page hash buckets.
#[derive(Debug, Default)]
pub struct CacheBlock {
    /// Page-relative byte range of the translated guest code.
    pub page_start: u16,
    pub page_end: u16,
    /// Owning code page, if currently registered.
    pub handler: Option<usize>,

    /// Arena offset and reserved size of the host code.
    pub cache_start: usize,
    pub cache_size: usize,
    /// Next block in arena memory order, or next free entry.
    pub next_mem: Option<BlockHandle>,

    pub hash_index: usize,
    pub hash_next: Option<BlockHandle>,

    /// Outgoing link per slot (0 = not taken, 1 = taken).
    pub link_to: [LinkTarget; 2],
    /// Chain through blocks whose same slot links to one target.
    pub link_next: [Option<BlockHandle>; 2],
    /// Head of the chain of blocks linking to this one, per slot.
    pub link_from: [Option<BlockHandle>; 2],

    /// Sibling block when translation crossed a page boundary.
    pub crossblock: Option<BlockHandle>,

    /// Mask over [maskstart, page_end]: nonzero bytes were captured by
    /// pointer and carry no write-map coverage.
    pub wmapmask: Vec<u8>,
    pub maskstart: u16,
}

impl CacheBlock {
    /// Reset every field for reuse from the free chain.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
