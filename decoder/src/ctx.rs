//! Translation context: instruction fetch over the page write maps,
//! prefix state, and the deferred exit records resolved when the block
//! is closed.

use bitflags::bitflags;

use drc_backend::{BranchPatch, CodeArena, CodeGen};
use drc_cache::{BlockCache, BlockHandle};
use drc_core::{CpuState, DrcError};

use crate::flagopt::FlagOpt;

/// Why decoding stopped before the current instruction finished.
pub(crate) enum Stop {
    /// The fetch ran past guest RAM; the block closes at the current
    /// instruction and the interpreter raises the fault.
    PageFault,
    Fatal(DrcError),
}

pub(crate) type DResult<T> = Result<T, Stop>;

/// Result of translating one instruction.
pub(crate) enum Step {
    Continue,
    /// A prefix byte was consumed; dispatch again under the updated
    /// prefix state.
    Restart,
    /// The instruction emitted the block's exit code.
    Closed,
}

/// An instruction immediate, captured by value or by guest RAM pointer.
pub(crate) enum Imm {
    Val(u32),
    Ptr(u64),
}

/// Deferred exit stubs, emitted after the main instruction stream so
/// the uncommon paths stay out of line.
pub(crate) enum SaveKind {
    /// Entry check: the cycle budget was already exhausted.
    CycleCheck,
    /// A runtime helper reported a fault.
    Exception { eip_add: u32, cycles: u32 },
    /// A string operation stopped with work left.
    StringBreak { eip_add: u32, cycles: u32 },
}

pub(crate) struct SaveRec {
    pub patch: BranchPatch,
    pub kind: SaveKind,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub(crate) struct Prefix: u8 {
        /// Operand size override seen.
        const BIG_OP = 1;
        /// Address size override seen.
        const BIG_ADDR = 2;
        const REP = 4;
        const REP_NZ = 8;
    }
}

/// Operand width of the instruction form being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    B,
    W,
    D,
}

impl Width {
    /// The v-form width under the current operand size.
    #[inline]
    pub fn v(big: bool) -> Self {
        if big {
            Width::D
        } else {
            Width::W
        }
    }

    #[inline]
    pub fn dword(self) -> bool {
        matches!(self, Width::D)
    }
}

pub(crate) struct TransContext<'a> {
    pub env: &'a mut CpuState,
    pub cache: &'a mut BlockCache,
    pub gen: &'a mut dyn CodeGen,

    /// Block owning the emitted host code.
    pub block: BlockHandle,
    /// Block registered on the page currently fetched from; switches to
    /// the spare descriptor after a page crossing.
    pub active_block: BlockHandle,
    pub page: usize,
    /// In-page offset of the next byte to fetch.
    pub page_index: usize,

    /// Guest physical address of the next byte to fetch.
    pub code: u32,
    pub code_start: u32,
    /// Guest physical address of the current instruction's first byte.
    pub op_start: u32,

    /// Guest instructions translated so far.
    pub cycles: u32,
    pub prefix: Prefix,
    pub seg_prefix: Option<usize>,

    pub saves: Vec<SaveRec>,
    pub flagopt: FlagOpt,
}

impl TransContext<'_> {
    /// Split borrow for emission: the generator plus the open arena.
    #[inline]
    pub fn ga(&mut self) -> (&mut dyn CodeGen, &mut CodeArena) {
        (&mut *self.gen, self.cache.arena())
    }

    #[inline]
    pub fn big_op(&self) -> bool {
        (self.env.code_big != 0) != self.prefix.contains(Prefix::BIG_OP)
    }

    #[inline]
    pub fn big_addr(&self) -> bool {
        (self.env.code_big != 0) != self.prefix.contains(Prefix::BIG_ADDR)
    }

    /// Segment in effect: the prefix override or the form's default.
    #[inline]
    pub fn seg_or(&self, default: usize) -> usize {
        self.seg_prefix.unwrap_or(default)
    }

    // -- Fetch --
    //
    // Every plain fetch registers the byte with the page's write map so
    // guest stores into it invalidate this block.

    pub fn fetchb(&mut self) -> DResult<u8> {
        let page_size = self.cache.config().page_size as usize;
        if self.page_index >= page_size {
            self.advance_page()?;
        }
        let wm = &mut self.cache.page_mut(self.page).write_map[self.page_index];
        *wm = wm.wrapping_add(1);
        let v = self.env.read_ram(self.code, 1).ok_or(Stop::PageFault)?;
        self.page_index += 1;
        self.code = self.code.wrapping_add(1);
        Ok(v as u8)
    }

    pub fn fetchw(&mut self) -> DResult<u16> {
        let lo = self.fetchb()? as u16;
        let hi = self.fetchb()? as u16;
        Ok(lo | hi << 8)
    }

    pub fn fetchd(&mut self) -> DResult<u32> {
        let lo = self.fetchw()? as u32;
        let hi = self.fetchw()? as u32;
        Ok(lo | hi << 16)
    }

    // -- Pointer-capturing immediate fetch --
    //
    // When every byte of the immediate is cold, the generated code
    // loads it from guest RAM at run time instead of baking the value
    // in. Such bytes carry no write-map coverage (stores to them must
    // not invalidate the block), which the block's capture mask records
    // for deregistration.

    fn capture(&mut self, width: usize) -> Option<u64> {
        let page_size = self.cache.config().page_size as usize;
        if self.page_index + width > page_size {
            return None;
        }
        let pg = self.cache.page(self.page);
        for i in 0..width {
            if pg.invalidation_count(self.page_index + i) != 0 {
                return None;
            }
        }
        let idx = self.page_index;
        let blk = self.cache.block_mut(self.active_block);
        if blk.wmapmask.is_empty() {
            blk.maskstart = idx as u16;
        }
        let maskstart = blk.maskstart as usize;
        if idx < maskstart {
            return None;
        }
        let needed = idx + width - maskstart;
        if blk.wmapmask.len() < needed {
            blk.wmapmask.resize(needed, 0);
        }
        for i in 0..width {
            blk.wmapmask[idx + i - maskstart] = 1;
        }
        let host = self.env.mem_base as u64 + self.code as u64;
        self.page_index += width;
        self.code = self.code.wrapping_add(width as u32);
        Some(host)
    }

    pub fn fetchb_imm(&mut self) -> DResult<Imm> {
        match self.capture(1) {
            Some(p) => Ok(Imm::Ptr(p)),
            None => Ok(Imm::Val(self.fetchb()? as u32)),
        }
    }

    pub fn fetchw_imm(&mut self) -> DResult<Imm> {
        match self.capture(2) {
            Some(p) => Ok(Imm::Ptr(p)),
            None => Ok(Imm::Val(self.fetchw()? as u32)),
        }
    }

    pub fn fetchd_imm(&mut self) -> DResult<Imm> {
        match self.capture(4) {
            Some(p) => Ok(Imm::Ptr(p)),
            None => Ok(Imm::Val(self.fetchd()?)),
        }
    }

    pub fn fetchv(&mut self, wd: Width) -> DResult<u32> {
        match wd {
            Width::B => Ok(self.fetchb()? as u32),
            Width::W => Ok(self.fetchw()? as u32),
            Width::D => self.fetchd(),
        }
    }

    pub fn fetchv_imm(&mut self, wd: Width) -> DResult<Imm> {
        match wd {
            Width::B => self.fetchb_imm(),
            Width::W => self.fetchw_imm(),
            Width::D => self.fetchd_imm(),
        }
    }

    /// Continue fetching on the next guest page. The translation gets a
    /// spare descriptor registered there so stores into the second page
    /// invalidate the whole block.
    fn advance_page(&mut self) -> DResult<()> {
        let page_size = self.cache.config().page_size;
        let shift = self.cache.config().page_shift();
        self.cache.block_mut(self.active_block).page_end = (page_size - 1) as u16;

        // Probe before committing any bookkeeping.
        self.env.read_ram(self.code, 1).ok_or(Stop::PageFault)?;

        let newpage = self
            .cache
            .acquire_page(self.code >> shift, Some(self.page))
            .map_err(Stop::Fatal)?;
        let spare = self.cache.alloc_spare_block().map_err(Stop::Fatal)?;
        self.cache.block_mut(self.active_block).crossblock = Some(spare);
        self.cache.block_mut(spare).crossblock = Some(self.active_block);
        self.cache.add_cross_block(spare, newpage);
        self.cache.block_mut(spare).page_start = 0;
        self.active_block = spare;
        self.page = newpage;
        self.page_index = 0;
        Ok(())
    }
}
