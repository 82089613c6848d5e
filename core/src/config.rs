/// Tuning knobs for the recompiler.
///
/// The defaults reproduce the classic cache geometry; all of them are
/// explicit here rather than buried as literals in the cache code.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Total size of the host code arena in bytes.
    pub cache_total: usize,
    /// Maximum host code bytes one block may emit.
    pub block_max_code: usize,
    /// Number of block descriptors in the pool.
    pub block_count: usize,
    /// Number of guest code page handlers in the pool.
    pub page_count: usize,
    /// Guest page size in bytes (must be a power of two).
    pub page_size: u32,
    /// Bound on guest instructions translated into one block.
    pub max_block_insns: u32,
    /// Write counter at which a byte is considered hot self-modifying
    /// code and translation refuses to cross it.
    pub smc_hot_threshold: u8,
    /// Number of stray writes a code page with no live blocks absorbs
    /// before it is released.
    pub release_delay: u16,
    /// Keep using the recompiler while guest paging is enabled.
    /// Off by default; turning it on is logged as a warning.
    pub allow_paged_core: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_total: 8 * 1024 * 1024,
            block_max_code: 8192,
            block_count: 128 * 1024,
            page_count: 512,
            page_size: 4096,
            max_block_insns: 32,
            smc_hot_threshold: 4,
            release_delay: 16,
            allow_paged_core: false,
        }
    }
}

impl CoreConfig {
    #[inline]
    pub fn page_mask(&self) -> u32 {
        self.page_size - 1
    }

    #[inline]
    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }
}
