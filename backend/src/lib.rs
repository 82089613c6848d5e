pub mod aarch64;
pub mod arena;
pub mod x86_64;

pub use aarch64::A64Gen;
pub use arena::CodeArena;
pub use x86_64::X64Gen;

use drc_core::{BlockReturn, FlagKind};

/// Host code generator for the running target.
#[cfg(target_arch = "aarch64")]
pub type HostGen = A64Gen;
#[cfg(not(target_arch = "aarch64"))]
pub type HostGen = X64Gen;

/// Abstract host register roles the translator is written against.
///
/// Every backend maps these onto concrete registers under the contract:
/// `Addr` survives generated calls (callee-saved), `Op1`..`Op3` feed
/// call parameters 1..3 without extra moves, `RetOp` receives call
/// results, and `ByteA`/`ByteB` are byte-addressable scratch registers
/// (which may alias `Op2`/`Op3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    RetOp,
    Addr,
    Op1,
    Op2,
    Op3,
    ByteA,
    ByteB,
}

/// Opaque handle for the create-then-fill branch protocol.
///
/// `create` emits a placeholder branch and returns the handle; `fill`
/// resolves the displacement to the current emit position. Each handle
/// must be filled exactly once, while the arena is still open.
#[derive(Debug)]
pub struct BranchPatch {
    pub(crate) pos: usize,
    pub(crate) kind: PatchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchKind {
    /// x86: 8-bit displacement byte at `pos`.
    Rel8,
    /// x86: 32-bit displacement at `pos`.
    Rel32,
    /// AArch64: imm19 field of the branch word at `pos`.
    Imm19,
}

/// The fixed code-emission vocabulary one host ISA must provide.
///
/// The translator is written purely against this trait; nothing above
/// the backend knows an instruction encoding. Backends may only assume
/// the arena is open for writing (the cache enforces that).
pub trait CodeGen {
    /// Byte length of every call site emitted by [`CodeGen::call`];
    /// call-site rewriting depends on it being constant.
    fn call_site_len(&self) -> usize;

    // -- Moves --

    fn mov_reg_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32);
    fn mov_regs(&mut self, a: &mut CodeArena, dst: Reg, src: Reg);
    /// Load 16 or 32 bits from an absolute host address.
    fn mov_word_to_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool);
    fn mov_word_from_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool);
    fn mov_byte_to_reg_low(&mut self, a: &mut CodeArena, reg: Reg, addr: u64);
    fn mov_byte_from_reg_low(&mut self, a: &mut CodeArena, reg: Reg, addr: u64);

    // -- Arithmetic on registers --

    fn extend_byte(&mut self, a: &mut CodeArena, sign: bool, reg: Reg);
    fn extend_word(&mut self, a: &mut CodeArena, sign: bool, reg: Reg);
    fn add_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32);
    fn and_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32);
    /// `dst = dst + (index << scale) + imm`.
    fn lea(&mut self, a: &mut CodeArena, dst: Reg, index: Option<Reg>, scale: u8, imm: u32);
    /// `reg += *addr` (16 or 32 bits).
    fn add_word_to_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool);

    // -- Arithmetic straight on guest state memory --

    fn mov_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool);
    fn add_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool);
    fn sub_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool);

    // -- Calls --

    fn load_param_imm(&mut self, a: &mut CodeArena, nr: usize, imm: u64);
    fn load_param_reg(&mut self, a: &mut CodeArena, nr: usize, reg: Reg);
    /// Load parameter `nr` with the 32-bit value at an absolute address.
    fn load_param_mem(&mut self, a: &mut CodeArena, nr: usize, addr: u64);
    /// Load parameter `nr` with the CPU state block pointer.
    fn load_param_env(&mut self, a: &mut CodeArena, nr: usize);
    /// Emit a call to `fct`; returns the call-site offset for later
    /// rewriting. The result lands in `Reg::RetOp`.
    fn call(&mut self, a: &mut CodeArena, fct: u64) -> usize;
    /// Rewrite the call site at `site` with either an inline sequence
    /// for `kind` or a call to the flags-free `simple_fct`, without
    /// changing the site's size.
    fn fill_function_ptr(&mut self, a: &mut CodeArena, site: usize, simple_fct: u64, kind: FlagKind);

    // -- Branches (create-then-fill) --

    fn branch_on_zero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch;
    fn branch_on_nonzero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch;
    fn fill_branch(&mut self, a: &mut CodeArena, patch: BranchPatch);
    fn branch_long_nonzero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch;
    fn branch_long_leqzero(&mut self, a: &mut CodeArena, reg: Reg) -> BranchPatch;
    fn fill_branch_long(&mut self, a: &mut CodeArena, patch: BranchPatch);

    // -- Block exits --

    /// Indirect jump through an 8-byte cell holding a host code address.
    fn jmp_ptr(&mut self, a: &mut CodeArena, cell_addr: u64);
    /// Load a return code and run the epilogue.
    fn return_imm(&mut self, a: &mut CodeArena, code: BlockReturn);
    /// Run the epilogue with the current `RetOp` as return code.
    fn return_retop(&mut self, a: &mut CodeArena);

    // -- Thunks and maintenance --

    /// Emit the entry thunk `extern "C" fn(env, code) -> u32` and
    /// return its offset.
    fn run_code(&mut self, a: &mut CodeArena) -> usize;
    /// Host instruction-cache maintenance after a block is closed.
    fn block_closing(&self, a: &CodeArena, start: usize, len: usize);
}
