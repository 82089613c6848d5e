//! Block and page cache for translated guest code.
//!
//! Owns the code arena, the pooled block descriptors, the per-page
//! write/invalidation maps, and the link indirection cells. Host code
//! (text) is only ever written between [`BlockCache::open_block`] and
//! [`BlockCache::close_block`], which bracket the arena's writable
//! window; late link resolution writes data cells only and needs no
//! permission toggle.

pub mod block;
pub mod page;

pub use block::{BlockHandle, CacheBlock, LinkTarget};
pub use page::{CodePage, HASH_BUCKETS, HASH_SHIFT};

use std::cell::Cell;
use std::collections::HashMap;

use tracing::{debug, trace};

use drc_core::{BlockReturn, CoreConfig, CpuState, DrcError, SMC_CURRENT_BLOCK};

use drc_backend::{CodeArena, CodeGen};

/// Blocks are carved from the arena at this granularity.
const BLOCK_ALIGN: usize = 16;
/// Arena bytes reserved in front of the block area for the entry thunk
/// and the two link stubs.
const PROLOGUE: usize = 4096;

pub struct BlockCache {
    cfg: CoreConfig,
    arena: CodeArena,

    blocks: Vec<CacheBlock>,
    free_block: Option<BlockHandle>,
    first_block: BlockHandle,
    active_block: BlockHandle,

    /// Two 8-byte cells per block, read by generated exit code.
    link_cells: Box<[Cell<u64>]>,
    /// Host addresses of the stubs returning `Link1`/`Link2`.
    link_stub: [u64; 2],
    run_thunk: u64,

    pages: Vec<CodePage>,
    free_pages: Vec<usize>,
    /// Acquisition order; eviction scans from the front.
    used_pages: Vec<usize>,
    page_map: HashMap<u32, usize>,
}

impl BlockCache {
    pub fn new(cfg: CoreConfig, gen: &mut dyn CodeGen) -> Result<Self, DrcError> {
        let mut arena = CodeArena::new(PROLOGUE + cfg.cache_total + cfg.block_max_code)?;

        // Entry thunk and link stubs live in front of the block area and
        // survive every reset.
        let thunk_off = gen.run_code(&mut arena);
        arena.align_to(BLOCK_ALIGN);
        let stub1 = arena.offset();
        gen.return_imm(&mut arena, BlockReturn::Link1);
        arena.align_to(BLOCK_ALIGN);
        let stub2 = arena.offset();
        gen.return_imm(&mut arena, BlockReturn::Link2);
        assert!(arena.offset() <= PROLOGUE, "cache prologue overflow");
        gen.block_closing(&arena, 0, arena.offset());

        let link_stub = [arena.addr_at(stub1), arena.addr_at(stub2)];
        let run_thunk = arena.addr_at(thunk_off);

        let mut blocks = Vec::with_capacity(cfg.block_count);
        blocks.resize_with(cfg.block_count, CacheBlock::default);
        let link_cells: Box<[Cell<u64>]> = (0..cfg.block_count * 2)
            .map(|i| Cell::new(link_stub[i & 1]))
            .collect();

        let mut pages = Vec::with_capacity(cfg.page_count);
        pages.resize_with(cfg.page_count, || CodePage::new(cfg.page_size as usize));
        let free_pages = (0..cfg.page_count).rev().collect();

        let mut cache = Self {
            cfg,
            arena,
            blocks,
            free_block: None,
            first_block: BlockHandle(0),
            active_block: BlockHandle(0),
            link_cells,
            link_stub,
            run_thunk,
            pages,
            free_pages,
            used_pages: Vec::new(),
            page_map: HashMap::new(),
        };
        cache.init_block_pool()?;
        cache.arena.seal()?;
        debug!(
            cache_total = cache.cfg.cache_total,
            blocks = cache.cfg.block_count,
            pages = cache.cfg.page_count,
            "code cache initialized"
        );
        Ok(cache)
    }

    fn init_block_pool(&mut self) -> Result<(), DrcError> {
        for b in &mut self.blocks {
            b.reset();
        }
        self.free_block = None;
        for i in (0..self.blocks.len()).rev() {
            self.blocks[i].next_mem = self.free_block;
            self.free_block = Some(BlockHandle(i as u32));
        }
        for (i, cell) in self.link_cells.iter().enumerate() {
            cell.set(self.link_stub[i & 1]);
        }

        // One block initially spans the whole code area.
        let first = self.alloc_block()?;
        self.blocks[first.idx()].cache_start = PROLOGUE;
        self.blocks[first.idx()].cache_size = self.cfg.cache_total;
        self.blocks[first.idx()].next_mem = None;
        self.first_block = first;
        self.active_block = first;
        Ok(())
    }

    /// Drop all translated state; e.g. on guest reset.
    pub fn reset(&mut self) -> Result<(), DrcError> {
        while let Some(&p) = self.used_pages.first() {
            self.clear_release_page(p);
        }
        self.init_block_pool()?;
        debug!("code cache reset");
        Ok(())
    }

    // -- Accessors for the run loop and decoder --

    #[inline]
    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    #[inline]
    pub fn arena(&mut self) -> &mut CodeArena {
        &mut self.arena
    }

    #[inline]
    pub fn block(&self, h: BlockHandle) -> &CacheBlock {
        &self.blocks[h.idx()]
    }

    #[inline]
    pub fn block_mut(&mut self, h: BlockHandle) -> &mut CacheBlock {
        &mut self.blocks[h.idx()]
    }

    /// Host address generated code jumps to when entering this block.
    #[inline]
    pub fn block_entry(&self, h: BlockHandle) -> u64 {
        self.arena.addr_at(self.blocks[h.idx()].cache_start)
    }

    /// Address of a block's link indirection cell.
    #[inline]
    pub fn cell_addr(&self, h: BlockHandle, ind: usize) -> u64 {
        self.link_cells.as_ptr() as u64 + ((h.idx() * 2 + ind) * 8) as u64
    }

    /// Entry thunk: `extern "C" fn(*mut CpuState, *const u8) -> u32`.
    #[inline]
    pub fn run_thunk_addr(&self) -> u64 {
        self.run_thunk
    }

    #[inline]
    pub fn page(&self, idx: usize) -> &CodePage {
        &self.pages[idx]
    }

    #[inline]
    pub fn page_mut(&mut self, idx: usize) -> &mut CodePage {
        &mut self.pages[idx]
    }

    #[inline]
    pub fn page_index(&self, phys_page: u32) -> Option<usize> {
        self.page_map.get(&phys_page).copied()
    }

    // -- Block pool --

    fn alloc_block(&mut self) -> Result<BlockHandle, DrcError> {
        let h = self.free_block.ok_or(DrcError::NoFreeBlock)?;
        self.free_block = self.blocks[h.idx()].next_mem;
        self.blocks[h.idx()].reset();
        Ok(h)
    }

    fn free_block_entry(&mut self, h: BlockHandle) {
        self.blocks[h.idx()].next_mem = self.free_block;
        self.free_block = Some(h);
    }

    /// Allocate a bookkeeping-only descriptor for the second page of a
    /// page-crossing translation. Owns no arena memory.
    pub fn alloc_spare_block(&mut self) -> Result<BlockHandle, DrcError> {
        self.alloc_block()
    }

    // -- Page registration --

    /// Register a block under its page at the given start offset. The
    /// end offset is filled in by the translator once it is known.
    pub fn add_to_page(&mut self, h: BlockHandle, page: usize, start: u16) {
        let index = 1 + (start as usize >> HASH_SHIFT);
        self.register(h, page, index);
        self.blocks[h.idx()].page_start = start;
        self.blocks[h.idx()].page_end = start;
    }

    /// Register a cross-page spare under bucket 0 of the second page.
    pub fn add_cross_block(&mut self, h: BlockHandle, page: usize) {
        self.register(h, page, 0);
    }

    fn register(&mut self, h: BlockHandle, page: usize, index: usize) {
        self.blocks[h.idx()].hash_index = index;
        self.blocks[h.idx()].hash_next = self.pages[page].hash[index];
        self.pages[page].hash[index] = Some(h);
        self.blocks[h.idx()].handler = Some(page);
        self.pages[page].active_blocks += 1;
    }

    fn del_cache_block(&mut self, page: usize, h: BlockHandle) {
        self.pages[page].active_blocks -= 1;
        self.pages[page].active_count = u32::from(self.cfg.release_delay);

        // Unlink from the hash bucket.
        let index = self.blocks[h.idx()].hash_index;
        let next = self.blocks[h.idx()].hash_next;
        if self.pages[page].hash[index] == Some(h) {
            self.pages[page].hash[index] = next;
        } else {
            let mut cur = self.pages[page].hash[index];
            while let Some(c) = cur {
                if self.blocks[c.idx()].hash_next == Some(h) {
                    self.blocks[c.idx()].hash_next = next;
                    break;
                }
                cur = self.blocks[c.idx()].hash_next;
            }
        }

        // Drop the block's write-map coverage, honoring the capture mask.
        let start = self.blocks[h.idx()].page_start as usize;
        let end = self.blocks[h.idx()].page_end as usize;
        if !self.blocks[h.idx()].wmapmask.is_empty() {
            let maskstart = self.blocks[h.idx()].maskstart as usize;
            for i in start..maskstart.min(end + 1) {
                let w = &mut self.pages[page].write_map[i];
                if *w > 0 {
                    *w -= 1;
                }
            }
            for i in maskstart..=end {
                let masked = self
                    .blocks[h.idx()]
                    .wmapmask
                    .get(i - maskstart)
                    .is_some_and(|&m| m != 0);
                if !masked {
                    let w = &mut self.pages[page].write_map[i];
                    if *w > 0 {
                        *w -= 1;
                    }
                }
            }
        } else {
            for i in start..=end {
                let w = &mut self.pages[page].write_map[i];
                if *w > 0 {
                    *w -= 1;
                }
            }
        }
    }

    // -- Block clearing and linking --

    /// Drop a block: detach all links, deregister from its page, clear
    /// its cross-page sibling.
    pub fn clear_block(&mut self, h: BlockHandle) {
        if self.blocks[h.idx()].hash_index != 0 {
            for ind in 0..2 {
                // Everyone linking here falls back to the stub.
                let mut fromlink = self.blocks[h.idx()].link_from[ind];
                self.blocks[h.idx()].link_from[ind] = None;
                while let Some(f) = fromlink {
                    let next = self.blocks[f.idx()].link_next[ind];
                    self.blocks[f.idx()].link_next[ind] = None;
                    self.blocks[f.idx()].link_to[ind] = LinkTarget::Stub;
                    self.link_cells[f.idx() * 2 + ind].set(self.link_stub[ind]);
                    fromlink = next;
                }
                // Detach the outgoing edge from its target's from-chain.
                if let LinkTarget::Block(t) = self.blocks[h.idx()].link_to[ind] {
                    let hnext = self.blocks[h.idx()].link_next[ind];
                    if self.blocks[t.idx()].link_from[ind] == Some(h) {
                        self.blocks[t.idx()].link_from[ind] = hnext;
                    } else {
                        let mut cur = self.blocks[t.idx()].link_from[ind];
                        while let Some(c) = cur {
                            let nx = self.blocks[c.idx()].link_next[ind];
                            if nx == Some(h) {
                                self.blocks[c.idx()].link_next[ind] = hnext;
                                break;
                            }
                            cur = nx;
                        }
                    }
                    self.blocks[h.idx()].link_to[ind] = LinkTarget::Stub;
                    self.blocks[h.idx()].link_next[ind] = None;
                    self.link_cells[h.idx() * 2 + ind].set(self.link_stub[ind]);
                }
            }
        } else {
            // Spare cross-page entry, owns no code memory.
            self.free_block_entry(h);
        }
        if let Some(cb) = self.blocks[h.idx()].crossblock.take() {
            self.blocks[cb.idx()].crossblock = None;
            self.clear_block(cb);
        }
        if let Some(page) = self.blocks[h.idx()].handler.take() {
            self.del_cache_block(page, h);
        }
        self.blocks[h.idx()].wmapmask = Vec::new();
    }

    /// Patch a link slot to jump straight to `to`. A data write into the
    /// indirection cell; the arena stays sealed.
    pub fn link_block(&mut self, from: BlockHandle, ind: usize, to: BlockHandle) {
        self.blocks[from.idx()].link_to[ind] = LinkTarget::Block(to);
        self.blocks[from.idx()].link_next[ind] = self.blocks[to.idx()].link_from[ind];
        self.blocks[to.idx()].link_from[ind] = Some(from);
        self.link_cells[from.idx() * 2 + ind].set(self.block_entry(to));
        trace!(from = from.0, to = to.0, slot = ind, "block linked");
    }

    // -- Open / close --

    /// Claim the active slot for a new translation and open the arena's
    /// writable window. Absorbs following blocks until the slot can hold
    /// a maximum-size block.
    pub fn open_block(&mut self) -> Result<BlockHandle, DrcError> {
        self.arena.open_write()?;
        let h = self.active_block;
        if self.blocks[h.idx()].handler.is_some() {
            self.clear_block(h);
        }
        let mut size = self.blocks[h.idx()].cache_size;
        let mut next = self.blocks[h.idx()].next_mem;
        while size < self.cfg.block_max_code {
            let Some(n) = next else { break };
            size += self.blocks[n.idx()].cache_size;
            let after = self.blocks[n.idx()].next_mem;
            if self.blocks[n.idx()].handler.is_some() {
                self.clear_block(n);
            }
            self.free_block_entry(n);
            next = after;
        }
        self.blocks[h.idx()].cache_size = size;
        self.blocks[h.idx()].next_mem = next;
        self.arena.set_offset(self.blocks[h.idx()].cache_start);
        Ok(h)
    }

    /// Finish the active block: reset its link slots to the stubs, split
    /// off unused space, flush the host instruction cache, and seal the
    /// arena.
    pub fn close_block(&mut self, gen: &mut dyn CodeGen) -> Result<(), DrcError> {
        let h = self.active_block;
        for ind in 0..2 {
            self.blocks[h.idx()].link_to[ind] = LinkTarget::Stub;
            self.blocks[h.idx()].link_from[ind] = None;
            self.blocks[h.idx()].link_next[ind] = None;
            self.link_cells[h.idx() * 2 + ind].set(self.link_stub[ind]);
        }

        let start = self.blocks[h.idx()].cache_start;
        let written = self.arena.offset() - start;
        let size = self.blocks[h.idx()].cache_size;
        if written > size {
            // Only the last block may spill, into the slack at the end
            // of the arena.
            assert!(
                self.blocks[h.idx()].next_mem.is_none()
                    && written <= size + self.cfg.block_max_code,
                "cache block overrun"
            );
        } else if size - written > BLOCK_ALIGN {
            let new_size = ((written.max(1) - 1) | (BLOCK_ALIGN - 1)) + 1;
            let nb = self.alloc_block()?;
            self.blocks[nb.idx()].cache_start = start + new_size;
            self.blocks[nb.idx()].cache_size = size - new_size;
            self.blocks[nb.idx()].next_mem = self.blocks[h.idx()].next_mem;
            self.blocks[h.idx()].next_mem = Some(nb);
            self.blocks[h.idx()].cache_size = new_size;
        }

        gen.block_closing(&self.arena, start, self.arena.offset() - start);

        // Wrap to the start when the next slot could not hold a block of
        // maximum size.
        let limit = PROLOGUE + self.cfg.cache_total - self.cfg.block_max_code;
        self.active_block = match self.blocks[h.idx()].next_mem {
            Some(n) if self.blocks[n.idx()].cache_start <= limit => n,
            _ => self.first_block,
        };
        self.arena.seal()?;
        Ok(())
    }

    // -- Page pool --

    /// Page handler for a guest physical page, allocating one if the
    /// page has none. `keep` protects the page currently being
    /// translated from eviction.
    pub fn acquire_page(
        &mut self,
        phys_page: u32,
        keep: Option<usize>,
    ) -> Result<usize, DrcError> {
        if let Some(&idx) = self.page_map.get(&phys_page) {
            return Ok(idx);
        }
        if self.free_pages.is_empty() {
            let victim = self
                .used_pages
                .iter()
                .copied()
                .find(|&p| Some(p) != keep)
                .ok_or(DrcError::NoEvictablePage)?;
            debug!(phys_page = self.pages[victim].phys_page, "evicting code page");
            self.clear_release_page(victim);
        }
        let idx = self
            .free_pages
            .pop()
            .ok_or(DrcError::NoEvictablePage)?;
        self.pages[idx].setup(phys_page, u32::from(self.cfg.release_delay));
        self.page_map.insert(phys_page, idx);
        self.used_pages.push(idx);
        debug!(phys_page, "code page allocated");
        Ok(idx)
    }

    fn release_page(&mut self, idx: usize) {
        self.page_map.remove(&self.pages[idx].phys_page);
        self.used_pages.retain(|&p| p != idx);
        self.free_pages.push(idx);
        debug!(phys_page = self.pages[idx].phys_page, "code page released");
    }

    /// Drop every block on a page, then return it to the free pool.
    pub fn clear_release_page(&mut self, idx: usize) {
        for index in 0..HASH_BUCKETS {
            let mut cur = self.pages[idx].hash[index];
            while let Some(b) = cur {
                let next = self.blocks[b.idx()].hash_next;
                // Full page clear; skip per-block write-map bookkeeping.
                self.blocks[b.idx()].handler = None;
                self.clear_block(b);
                cur = next;
            }
        }
        self.release_page(idx);
    }

    /// Block translated from exactly this in-page start offset.
    pub fn find_block(&self, page: usize, start: u16) -> Option<BlockHandle> {
        let mut cur = self.pages[page].hash[1 + (start as usize >> HASH_SHIFT)];
        while let Some(b) = cur {
            if self.blocks[b.idx()].page_start == start && self.blocks[b.idx()].hash_index != 0 {
                return Some(b);
            }
            cur = self.blocks[b.idx()].hash_next;
        }
        None
    }

    /// `find_block` keyed by guest physical address.
    pub fn lookup(&self, phys: u32) -> Option<BlockHandle> {
        let page = self.page_index(phys >> self.cfg.page_shift())?;
        self.find_block(page, (phys & self.cfg.page_mask()) as u16)
    }

    // -- SMC detection --

    /// Clear all blocks overlapping `[start, end]` on a page. Returns
    /// true when the block containing the guest's current instruction
    /// pointer (given as an in-page offset) was among them.
    pub fn invalidate_range(
        &mut self,
        page: usize,
        start: usize,
        end: usize,
        ip_off: Option<usize>,
    ) -> bool {
        let mut index = (1 + (end >> HASH_SHIFT)) as isize;
        let mut is_current = false;
        while index >= 0 {
            let live: u32 = self.pages[page].write_map[start..=end]
                .iter()
                .map(|&c| c as u32)
                .sum();
            if live == 0 {
                return is_current;
            }
            let mut cur = self.pages[page].hash[index as usize];
            while let Some(b) = cur {
                let next = self.blocks[b.idx()].hash_next;
                let bs = self.blocks[b.idx()].page_start as usize;
                let be = self.blocks[b.idx()].page_end as usize;
                if start <= be && end >= bs {
                    if ip_off.is_some_and(|ip| ip >= bs && ip <= be) {
                        is_current = true;
                    }
                    self.clear_block(b);
                }
                cur = next;
            }
            index -= 1;
        }
        is_current
    }

    /// Checked guest store. Observes writes into translated code,
    /// invalidates overlapping blocks, and reports self-modification of
    /// the running block as a fault without performing the store.
    pub fn guest_write(
        &mut self,
        env: &mut CpuState,
        addr: u32,
        val: u32,
        width: u32,
    ) -> u32 {
        let page_mask = self.cfg.page_mask();
        let off = (addr & page_mask) as usize;

        // Stores crossing a page boundary go byte by byte.
        if off + width as usize > self.cfg.page_size as usize {
            for i in 0..width {
                let r = self.guest_write(env, addr + i, (val >> (8 * i)) & 0xff, 1);
                if r != 0 {
                    return r;
                }
            }
            return 0;
        }

        let page = match self.page_index(addr >> self.cfg.page_shift()) {
            Some(p) => p,
            None => return env.write_ram(addr, val, width),
        };

        let masked = val & width_mask(width);
        if env.read_ram(addr, width) == Some(masked) {
            return 0;
        }

        let covered = self.pages[page].write_map[off..off + width as usize]
            .iter()
            .any(|&c| c != 0);
        if !covered {
            if self.pages[page].active_blocks == 0 {
                self.pages[page].active_count -= 1;
                if self.pages[page].active_count == 0 {
                    self.release_page(page);
                }
            }
            return env.write_ram(addr, val, width);
        }

        self.pages[page].bump_invalidation(off, width as usize);
        let ip = env.ip_point();
        let ip_off = (ip >> self.cfg.page_shift() == addr >> self.cfg.page_shift())
            .then_some((ip & page_mask) as usize);
        if self.invalidate_range(page, off, off + width as usize - 1, ip_off) {
            env.exception = SMC_CURRENT_BLOCK;
            return 1;
        }
        env.write_ram(addr, val, width)
    }
}

fn width_mask(width: u32) -> u32 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}
