use std::ptr;

/// General register indices into `CpuState::regs`.
pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

/// Segment register indices.
pub const ES: usize = 0;
pub const CS: usize = 1;
pub const SS: usize = 2;
pub const DS: usize = 3;
pub const FS: usize = 4;
pub const GS: usize = 5;

/// Flag word bits.
pub const FLAG_CF: u32 = 0x0001;
pub const FLAG_PF: u32 = 0x0004;
pub const FLAG_AF: u32 = 0x0010;
pub const FLAG_ZF: u32 = 0x0040;
pub const FLAG_SF: u32 = 0x0080;
pub const FLAG_TF: u32 = 0x0100;
pub const FLAG_IF: u32 = 0x0200;
pub const FLAG_DF: u32 = 0x0400;
pub const FLAG_OF: u32 = 0x0800;

/// No guest exception pending.
pub const EXCEPTION_NONE: i32 = -1;
/// Pseudo exception vector recorded when a write lands in the block
/// that is currently executing.
pub const SMC_CURRENT_BLOCK: i32 = 0xffff;

/// Guest exception vectors the engine raises itself.
pub const EXCEPTION_DE: i32 = 0;
pub const EXCEPTION_DB: i32 = 1;
pub const EXCEPTION_GP: i32 = 13;

/// Checked guest store, installed by the embedder. Returns 0 on success;
/// nonzero means a fault or self-modification hit was recorded in the
/// state block and the store may not have completed.
pub type WriteCheckFn =
    extern "C" fn(env: *mut CpuState, addr: u32, val: u32, width: u32) -> u32;

/// Flat guest CPU state block.
///
/// Generated host code addresses the fields directly, so the layout is
/// `repr(C)` and the struct must live at a stable address (the owner
/// keeps it boxed). All runtime helper functions take a raw pointer to
/// this block as their first argument.
#[repr(C)]
pub struct CpuState {
    pub regs: [u32; 8],
    pub segs_val: [u16; 6],
    pub segs_phys: [u32; 6],
    pub eip: u32,
    pub flags: u32,
    /// Remaining cycle budget for this scheduling slice.
    pub cycles: i32,
    /// Cycles handed back to the scheduler on early exits.
    pub cycle_left: i32,
    /// String direction: +1 or -1, mirrors FLAG_DF.
    pub direction: i32,

    // Lazy flag state: the last flag-producing operation.
    pub lf_var1: u32,
    pub lf_var2: u32,
    pub lf_res: u32,
    pub lf_kind: u32,
    /// Carry at the time an ADC/SBB/INC/DEC captured its operands.
    pub lf_oldcf: u32,

    /// Landing slot for checked memory reads.
    pub readdata: u32,
    /// Pending guest exception vector, or `EXCEPTION_NONE`.
    pub exception: i32,
    pub exception_error: u32,
    /// Callback identifier surfaced by `BlockReturn::CallBack`.
    pub callback: u32,
    /// Code segment default operand size (nonzero = 32-bit).
    pub code_big: u32,
    /// 0xffff for 16-bit stacks, 0xffff_ffff for 32-bit stacks.
    pub stack_mask: u32,
    /// Guest paging enabled; gates use of the recompiler.
    pub paging: u32,

    /// Guest physical RAM.
    pub mem_base: *mut u8,
    pub mem_size: u32,
    pub _pad: u32,
    /// Checked store routine; the default writes straight to RAM.
    pub mem_write: WriteCheckFn,
    /// Opaque pointer back to the block cache for SMC routing.
    pub cache_ctl: *mut std::ffi::c_void,
}

extern "C" fn plain_write(env: *mut CpuState, addr: u32, val: u32, width: u32) -> u32 {
    // SAFETY: called from generated code or helpers with a live env.
    let env = unsafe { &mut *env };
    env.write_ram(addr, val, width)
}

impl CpuState {
    pub fn new(mem_base: *mut u8, mem_size: u32) -> Self {
        Self {
            regs: [0; 8],
            segs_val: [0; 6],
            segs_phys: [0; 6],
            eip: 0,
            flags: 0x2,
            cycles: 0,
            cycle_left: 0,
            direction: 1,
            lf_var1: 0,
            lf_var2: 0,
            lf_res: 0,
            lf_kind: 0,
            lf_oldcf: 0,
            readdata: 0,
            exception: EXCEPTION_NONE,
            exception_error: 0,
            callback: 0,
            code_big: 0,
            stack_mask: 0xffff,
            paging: 0,
            mem_base,
            mem_size,
            _pad: 0,
            mem_write: plain_write,
            cache_ctl: ptr::null_mut(),
        }
    }

    /// Load a segment register with real-mode semantics.
    pub fn set_seg(&mut self, seg: usize, val: u16) {
        self.segs_val[seg] = val;
        self.segs_phys[seg] = (val as u32) << 4;
    }

    #[inline]
    pub fn ip_point(&self) -> u32 {
        self.segs_phys[CS].wrapping_add(self.eip)
    }

    #[inline]
    pub fn flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    pub fn set_flag(&mut self, bit: u32, on: bool) {
        if on {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    // -- Raw RAM access (reads are never checked) --

    #[inline]
    pub fn read_ram(&self, addr: u32, width: u32) -> Option<u32> {
        if addr as u64 + width as u64 > self.mem_size as u64 {
            return None;
        }
        // SAFETY: bounds checked above; mem_base covers mem_size bytes.
        unsafe {
            let p = self.mem_base.add(addr as usize);
            Some(match width {
                1 => p.read() as u32,
                2 => (p as *const u16).read_unaligned() as u32,
                _ => (p as *const u32).read_unaligned(),
            })
        }
    }

    #[inline]
    pub fn write_ram(&mut self, addr: u32, val: u32, width: u32) -> u32 {
        if addr as u64 + width as u64 > self.mem_size as u64 {
            self.exception = EXCEPTION_GP;
            self.exception_error = 0;
            return 1;
        }
        // SAFETY: bounds checked above.
        unsafe {
            let p = self.mem_base.add(addr as usize);
            match width {
                1 => p.write(val as u8),
                2 => (p as *mut u16).write_unaligned(val as u16),
                _ => (p as *mut u32).write_unaligned(val),
            }
        }
        0
    }

    // -- Field addresses for the code generator --
    //
    // Generated code reaches guest state by absolute host address; these
    // are only meaningful while the state block is pinned.

    #[inline]
    pub fn addr_of_reg(&self, r: usize) -> u64 {
        &self.regs[r] as *const u32 as u64
    }

    /// Address of an 8-bit register (AL..BH encoding).
    #[inline]
    pub fn addr_of_reg8(&self, r: usize) -> u64 {
        self.addr_of_reg(r & 3) + if r >= 4 { 1 } else { 0 }
    }

    #[inline]
    pub fn addr_of_seg_phys(&self, s: usize) -> u64 {
        &self.segs_phys[s] as *const u32 as u64
    }

    #[inline]
    pub fn addr_of_seg_val(&self, s: usize) -> u64 {
        &self.segs_val[s] as *const u16 as u64
    }

    #[inline]
    pub fn addr_of_eip(&self) -> u64 {
        &self.eip as *const u32 as u64
    }

    #[inline]
    pub fn addr_of_flags(&self) -> u64 {
        &self.flags as *const u32 as u64
    }

    #[inline]
    pub fn addr_of_cycles(&self) -> u64 {
        &self.cycles as *const i32 as u64
    }

    #[inline]
    pub fn addr_of_readdata(&self) -> u64 {
        &self.readdata as *const u32 as u64
    }

    #[inline]
    pub fn addr_of_callback(&self) -> u64 {
        &self.callback as *const u32 as u64
    }
}
