//! Backend smoke tests: emit tiny blocks through the `CodeGen` trait
//! and execute them through the entry thunk on the host this test runs
//! on.
#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use std::mem;

use drc_backend::{CodeArena, CodeGen, HostGen, Reg};
use drc_core::ops;
use drc_core::state::{EAX, EBX};
use drc_core::{BlockReturn, CpuState};

type Thunk = extern "C" fn(*mut CpuState, u64) -> u32;

struct Jit {
    arena: CodeArena,
    gen: HostGen,
    thunk_off: usize,
}

impl Jit {
    fn new() -> Self {
        let mut arena = CodeArena::new(64 * 1024).unwrap();
        let mut gen = HostGen::new();
        let thunk_off = gen.run_code(&mut arena);
        arena.align_to(16);
        Jit {
            arena,
            gen,
            thunk_off,
        }
    }

    fn begin(&mut self) -> usize {
        self.arena.open_write().unwrap();
        self.arena.align_to(16);
        self.arena.offset()
    }

    /// Seal the arena and hand back the block's entry address.
    fn finish(&mut self, start: usize) -> u64 {
        let len = self.arena.offset() - start;
        self.gen.block_closing(&self.arena, start, len);
        self.arena.seal().unwrap();
        self.arena.addr_at(start)
    }

    fn run(&self, env: &mut CpuState, code: u64) -> u32 {
        // SAFETY: thunk_off was emitted by run_code and the arena is
        // sealed executable.
        let thunk: Thunk = unsafe { mem::transmute(self.arena.addr_at(self.thunk_off)) };
        thunk(env, code)
    }
}

fn bare_env() -> Box<CpuState> {
    Box::new(CpuState::new(std::ptr::null_mut(), 0))
}

#[test]
fn return_imm_propagates_code() {
    let mut j = Jit::new();
    let start = j.begin();
    j.gen.return_imm(&mut j.arena, BlockReturn::Opcode);
    let code = j.finish(start);

    let mut env = bare_env();
    assert_eq!(j.run(&mut env, code), BlockReturn::Opcode as u32);
}

#[test]
fn register_store_and_load() {
    let mut j = Jit::new();
    let mut env = bare_env();
    let eax = env.addr_of_reg(EAX);
    let ebx = env.addr_of_reg(EBX);

    let start = j.begin();
    j.gen.mov_reg_imm(&mut j.arena, Reg::Op1, 0x1234_5678);
    j.gen.mov_word_from_reg(&mut j.arena, Reg::Op1, eax, true);
    j.gen.mov_word_to_reg(&mut j.arena, Reg::Op2, eax, true);
    j.gen.and_imm(&mut j.arena, Reg::Op2, 0xffff);
    j.gen.mov_word_from_reg(&mut j.arena, Reg::Op2, ebx, true);
    j.gen.return_imm(&mut j.arena, BlockReturn::Normal);
    let code = j.finish(start);

    j.run(&mut env, code);
    assert_eq!(env.regs[EAX], 0x1234_5678);
    assert_eq!(env.regs[EBX], 0x5678);
}

#[test]
fn direct_word_arithmetic_on_state() {
    let mut j = Jit::new();
    let mut env = bare_env();
    env.cycles = 10;
    let cyc = env.addr_of_cycles();

    let start = j.begin();
    j.gen.sub_direct_word(&mut j.arena, cyc, 3, true);
    j.gen.add_direct_word(&mut j.arena, cyc, 1, true);
    j.gen.return_imm(&mut j.arena, BlockReturn::Normal);
    let code = j.finish(start);

    j.run(&mut env, code);
    assert_eq!(env.cycles, 8);
}

#[test]
fn call_into_operator_library() {
    let mut j = Jit::new();
    let mut env = bare_env();
    let eax = env.addr_of_reg(EAX);

    let start = j.begin();
    // Parameters staged highest first, env pointer last.
    j.gen.load_param_imm(&mut j.arena, 2, 20);
    j.gen.load_param_imm(&mut j.arena, 1, 22);
    j.gen.load_param_env(&mut j.arena, 0);
    j.gen.call(&mut j.arena, ops::add_d as usize as u64);
    j.gen.mov_word_from_reg(&mut j.arena, Reg::RetOp, eax, true);
    j.gen.return_imm(&mut j.arena, BlockReturn::Normal);
    let code = j.finish(start);

    j.run(&mut env, code);
    assert_eq!(env.regs[EAX], 42);
}

#[test]
fn branch_on_zero_skips_taken_path() {
    for (val, expect) in [
        (0u32, BlockReturn::Normal as u32),
        (1, BlockReturn::Cycles as u32),
    ] {
        let mut j = Jit::new();
        let start = j.begin();
        j.gen.mov_reg_imm(&mut j.arena, Reg::RetOp, val);
        let patch = j.gen.branch_on_zero(&mut j.arena, Reg::RetOp, true);
        j.gen.return_imm(&mut j.arena, BlockReturn::Cycles);
        j.gen.fill_branch(&mut j.arena, patch);
        j.gen.return_imm(&mut j.arena, BlockReturn::Normal);
        let code = j.finish(start);

        let mut env = bare_env();
        assert_eq!(j.run(&mut env, code), expect);
    }
}

#[test]
fn byte_extension() {
    let mut j = Jit::new();
    let mut env = bare_env();
    let eax = env.addr_of_reg(EAX);
    let ebx = env.addr_of_reg(EBX);

    let start = j.begin();
    j.gen.mov_reg_imm(&mut j.arena, Reg::Op1, 0xabcd_1280);
    j.gen.extend_byte(&mut j.arena, true, Reg::Op1);
    j.gen.mov_word_from_reg(&mut j.arena, Reg::Op1, eax, true);
    j.gen.mov_reg_imm(&mut j.arena, Reg::Op2, 0xabcd_1280);
    j.gen.extend_byte(&mut j.arena, false, Reg::Op2);
    j.gen.mov_word_from_reg(&mut j.arena, Reg::Op2, ebx, true);
    j.gen.return_imm(&mut j.arena, BlockReturn::Normal);
    let code = j.finish(start);

    j.run(&mut env, code);
    assert_eq!(env.regs[EAX], 0xffff_ff80);
    assert_eq!(env.regs[EBX], 0x80);
}

#[test]
fn lea_combines_base_index_and_offset() {
    let mut j = Jit::new();
    let mut env = bare_env();
    let eax = env.addr_of_reg(EAX);

    let start = j.begin();
    j.gen.mov_reg_imm(&mut j.arena, Reg::Addr, 0x100);
    j.gen.mov_reg_imm(&mut j.arena, Reg::Op2, 0x10);
    j.gen.lea(&mut j.arena, Reg::Addr, Some(Reg::Op2), 2, 5);
    j.gen.mov_word_from_reg(&mut j.arena, Reg::Addr, eax, true);
    j.gen.return_imm(&mut j.arena, BlockReturn::Normal);
    let code = j.finish(start);

    j.run(&mut env, code);
    assert_eq!(env.regs[EAX], 0x145);
}

#[test]
fn jmp_ptr_chains_blocks() {
    let mut j = Jit::new();
    let mut cell = Box::new(0u64);

    let target = j.begin();
    j.gen.return_imm(&mut j.arena, BlockReturn::Iret);
    j.arena.align_to(16);
    let from = j.arena.offset();
    j.gen
        .jmp_ptr(&mut j.arena, &mut *cell as *mut u64 as u64);
    let from_addr = j.finish(from);
    *cell = j.arena.addr_at(target);

    let mut env = bare_env();
    assert_eq!(j.run(&mut env, from_addr), BlockReturn::Iret as u32);
}
