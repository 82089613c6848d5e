use drc_core::helpers::{self, COND_B, COND_L, COND_NZ, COND_Z, LOOP_JCXZ, LOOP_PLAIN};
use drc_core::ops;
use drc_core::state::{
    CS, ECX, ESP, FLAG_CF, FLAG_IF, FLAG_ZF, SMC_CURRENT_BLOCK, SS,
};
use drc_core::BlockReturn;

use super::ram_env;

fn stack_env(ram: &mut Vec<u8>) -> Box<drc_core::CpuState> {
    let mut env = ram_env(ram);
    env.set_seg(SS, 0x300); // stack at phys 0x3000
    env.regs[ESP] = 0x100;
    env
}

#[test]
fn push_pop_roundtrip_16() {
    let mut ram = vec![0u8; 0x10000];
    let mut env = stack_env(&mut ram);
    assert_eq!(helpers::push_w(&mut *env, 0x1234), 0);
    assert_eq!(env.regs[ESP], 0xfe);
    assert_eq!(helpers::pop_w(&mut *env), 0);
    assert_eq!(env.readdata, 0x1234);
    assert_eq!(env.regs[ESP], 0x100);
}

#[test]
fn push_wraps_sp_inside_stack_mask() {
    // SS base 0 so the wrapped store near the top of the 64K stack
    // window still lands inside RAM.
    let mut ram = vec![0u8; 0x11000];
    let mut env = ram_env(&mut ram);
    env.set_seg(SS, 0);
    env.regs[ESP] = 0xdead_0002;
    assert_eq!(helpers::push_d(&mut *env, 0xcafe_babe), 0);
    // Only the low 16 bits of SP move; the upper half is untouched.
    assert_eq!(env.regs[ESP], 0xdead_fffe);
    assert_eq!(ram[0xfffe..0x10002], 0xcafe_babeu32.to_le_bytes());
}

#[test]
fn push_past_ram_faults() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.set_seg(SS, 0x200); // phys 0x2000, beyond RAM
    env.regs[ESP] = 0x10;
    assert_eq!(helpers::push_w(&mut *env, 1), 1);
    assert_ne!(env.exception, drc_core::EXCEPTION_NONE);
}

#[test]
fn branch_cond_materializes_lazy_flags() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    ops::cmp_b(&mut *env, 3, 3);
    assert_eq!(helpers::branch_cond(&mut *env, COND_Z), 1);
    assert_eq!(helpers::branch_cond(&mut *env, COND_NZ), 0);

    ops::cmp_b(&mut *env, 1, 2);
    assert_eq!(helpers::branch_cond(&mut *env, COND_B), 1);
    assert_eq!(helpers::branch_cond(&mut *env, COND_L), 1);
}

#[test]
fn loop_step_counts_cx_down() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.regs[ECX] = 2;
    assert_eq!(helpers::loop_step(&mut *env, LOOP_PLAIN, 0), 1);
    assert_eq!(helpers::loop_step(&mut *env, LOOP_PLAIN, 0), 0);
    assert_eq!(env.regs[ECX], 0);
}

#[test]
fn jcxz_does_not_decrement() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.regs[ECX] = 0;
    assert_eq!(helpers::loop_step(&mut *env, LOOP_JCXZ, 0), 1);
    assert_eq!(env.regs[ECX], 0);
    env.regs[ECX] = 5;
    assert_eq!(helpers::loop_step(&mut *env, LOOP_JCXZ, 0), 0);
    assert_eq!(env.regs[ECX], 5);
}

#[test]
fn ret_near_pops_ip_and_releases_args() {
    let mut ram = vec![0u8; 0x10000];
    let mut env = stack_env(&mut ram);
    helpers::push_w(&mut *env, 0x4567);
    assert_eq!(helpers::ret_near(&mut *env, 4, 0), 0);
    assert_eq!(env.eip, 0x4567);
    assert_eq!(env.regs[ESP], 0x104);
}

#[test]
fn call_far_pushes_return_frame() {
    let mut ram = vec![0u8; 0x10000];
    let mut env = stack_env(&mut ram);
    env.set_seg(CS, 0x100);
    assert_eq!(helpers::call_far(&mut *env, 0x200, 0x10, 0x55), 0);
    assert_eq!(env.segs_val[CS], 0x200);
    assert_eq!(env.segs_phys[CS], 0x2000);
    assert_eq!(env.eip, 0x10);
    assert_eq!(helpers::ret_far(&mut *env, 0, 0), 0);
    assert_eq!(env.segs_val[CS], 0x100);
    assert_eq!(env.eip, 0x55);
    assert_eq!(env.regs[ESP], 0x100);
}

#[test]
fn sw_interrupt_vectors_through_ivt_and_iret_returns() {
    let mut ram = vec![0u8; 0x10000];
    // Vector 0x21: handler at 0040:0010.
    ram[0x84..0x86].copy_from_slice(&0x0010u16.to_le_bytes());
    ram[0x86..0x88].copy_from_slice(&0x0040u16.to_le_bytes());
    let mut env = stack_env(&mut ram);
    env.set_seg(CS, 0x100);
    env.flags |= FLAG_IF;

    assert_eq!(helpers::sw_interrupt(&mut *env, 0x21, 0x33), 0);
    assert_eq!(env.segs_val[CS], 0x0040);
    assert_eq!(env.eip, 0x10);
    assert_eq!(env.flags & FLAG_IF, 0);

    assert_eq!(helpers::iret(&mut *env), 0);
    assert_eq!(env.segs_val[CS], 0x100);
    assert_eq!(env.eip, 0x33);
    assert_ne!(env.flags & FLAG_IF, 0);
    assert_eq!(env.regs[ESP], 0x100);
}

#[test]
fn pushf_popf_roundtrip() {
    let mut ram = vec![0u8; 0x10000];
    let mut env = stack_env(&mut ram);
    env.flags |= FLAG_CF | FLAG_ZF;
    assert_eq!(helpers::pushf(&mut *env, 0), 0);
    env.flags &= !(FLAG_CF | FLAG_ZF);
    assert_eq!(helpers::popf(&mut *env, 0), 0);
    assert_ne!(env.flags & FLAG_CF, 0);
    assert_ne!(env.flags & FLAG_ZF, 0);
}

#[test]
fn run_exception_reports_self_modification() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.eip = 0x10;
    env.cycles = 50;
    env.exception = SMC_CURRENT_BLOCK;
    let ret = helpers::run_exception(&mut *env, 4, 3);
    assert_eq!(ret, BlockReturn::SMCBlock as u32);
    assert_eq!(env.exception, drc_core::EXCEPTION_NONE);
    assert_eq!(env.eip, 0x14);
    assert_eq!(env.cycles, 47);
}

#[test]
fn run_exception_leaves_guest_faults_pending() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.eip = 0x10;
    env.exception = drc_core::state::EXCEPTION_DE;
    let ret = helpers::run_exception(&mut *env, 0, 0);
    assert_eq!(ret, BlockReturn::Normal as u32);
    assert_eq!(env.exception, drc_core::state::EXCEPTION_DE);
}
