//! Runtime helpers reachable from generated code.
//!
//! These cover everything a translated block cannot express inline:
//! checked memory access, stack traffic, condition evaluation, the LOOP
//! family, real-mode control transfers and the deferred exception exit.
//! All of them use the C ABI and take the CPU state block first.

use crate::flags::{fill_flags, FlagKind};
use crate::ret::BlockReturn;
use crate::state::{
    CpuState, CS, ECX, ESP, EXCEPTION_GP, EXCEPTION_NONE, FLAG_CF, FLAG_DF, FLAG_IF,
    FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF, FLAG_ZF, SMC_CURRENT_BLOCK, SS,
};

#[inline]
fn env_mut<'a>(env: *mut CpuState) -> &'a mut CpuState {
    // SAFETY: callers pass the live, pinned state block.
    unsafe { &mut *env }
}

// -- Checked guest memory access --
//
// Reads land in `env.readdata`; the return value is the fault flag so
// generated code can branch to its deferred exception exit.

macro_rules! mem_read {
    ($name:ident, $width:expr) => {
        pub extern "C" fn $name(env: *mut CpuState, addr: u32) -> u32 {
            let env = env_mut(env);
            match env.read_ram(addr, $width) {
                Some(v) => {
                    env.readdata = v;
                    0
                }
                None => {
                    env.exception = EXCEPTION_GP;
                    env.exception_error = 0;
                    1
                }
            }
        }
    };
}

mem_read!(mem_readb_checked, 1);
mem_read!(mem_readw_checked, 2);
mem_read!(mem_readd_checked, 4);

macro_rules! mem_write {
    ($name:ident, $width:expr) => {
        pub extern "C" fn $name(env: *mut CpuState, addr: u32, val: u32) -> u32 {
            let f = env_mut(env).mem_write;
            f(env, addr, val, $width)
        }
    };
}

mem_write!(mem_writeb_checked, 1);
mem_write!(mem_writew_checked, 2);
mem_write!(mem_writed_checked, 4);

// -- Stack --

fn push(env: *mut CpuState, val: u32, width: u32) -> u32 {
    let e = env_mut(env);
    let mask = e.stack_mask;
    let sp = e.regs[ESP] & mask;
    let new_sp = sp.wrapping_sub(width) & mask;
    let addr = e.segs_phys[SS].wrapping_add(new_sp);
    let f = e.mem_write;
    if f(env, addr, val, width) != 0 {
        return 1;
    }
    let e = env_mut(env);
    e.regs[ESP] = e.regs[ESP] & !mask | new_sp;
    0
}

fn pop(env: *mut CpuState, width: u32) -> Option<u32> {
    let e = env_mut(env);
    let mask = e.stack_mask;
    let sp = e.regs[ESP] & mask;
    let addr = e.segs_phys[SS].wrapping_add(sp);
    let val = match e.read_ram(addr, width) {
        Some(v) => v,
        None => {
            e.exception = EXCEPTION_GP;
            e.exception_error = 0;
            return None;
        }
    };
    e.regs[ESP] = e.regs[ESP] & !mask | sp.wrapping_add(width) & mask;
    Some(val)
}

pub extern "C" fn push_w(env: *mut CpuState, val: u32) -> u32 {
    push(env, val & 0xffff, 2)
}

pub extern "C" fn push_d(env: *mut CpuState, val: u32) -> u32 {
    push(env, val, 4)
}

/// Pop into `readdata`, returning the fault flag.
pub extern "C" fn pop_w(env: *mut CpuState) -> u32 {
    match pop(env, 2) {
        Some(v) => {
            env_mut(env).readdata = v;
            0
        }
        None => 1,
    }
}

pub extern "C" fn pop_d(env: *mut CpuState) -> u32 {
    match pop(env, 4) {
        Some(v) => {
            env_mut(env).readdata = v;
            0
        }
        None => 1,
    }
}

// -- Condition evaluation --

/// x86 condition codes in ModRM/Jcc encoding order.
pub const COND_O: u32 = 0x0;
pub const COND_NO: u32 = 0x1;
pub const COND_B: u32 = 0x2;
pub const COND_NB: u32 = 0x3;
pub const COND_Z: u32 = 0x4;
pub const COND_NZ: u32 = 0x5;
pub const COND_BE: u32 = 0x6;
pub const COND_NBE: u32 = 0x7;
pub const COND_S: u32 = 0x8;
pub const COND_NS: u32 = 0x9;
pub const COND_P: u32 = 0xa;
pub const COND_NP: u32 = 0xb;
pub const COND_L: u32 = 0xc;
pub const COND_NL: u32 = 0xd;
pub const COND_LE: u32 = 0xe;
pub const COND_NLE: u32 = 0xf;

/// Evaluate a condition code against the (materialized) flags.
/// This is the flag-read point conditional branches compile to.
pub extern "C" fn branch_cond(env: *mut CpuState, cc: u32) -> u32 {
    let env = env_mut(env);
    fill_flags(env);
    let f = env.flags;
    let cf = f & FLAG_CF != 0;
    let zf = f & FLAG_ZF != 0;
    let sf = f & FLAG_SF != 0;
    let of = f & FLAG_OF != 0;
    let pf = f & FLAG_PF != 0;
    let taken = match cc & 0xf {
        COND_O => of,
        COND_NO => !of,
        COND_B => cf,
        COND_NB => !cf,
        COND_Z => zf,
        COND_NZ => !zf,
        COND_BE => cf || zf,
        COND_NBE => !cf && !zf,
        COND_S => sf,
        COND_NS => !sf,
        COND_P => pf,
        COND_NP => !pf,
        COND_L => sf != of,
        COND_NL => sf == of,
        COND_LE => zf || sf != of,
        _ => !zf && sf == of,
    };
    taken as u32
}

/// LOOP family condition kinds.
pub const LOOP_NZ: u32 = 0;
pub const LOOP_Z: u32 = 1;
pub const LOOP_PLAIN: u32 = 2;
pub const LOOP_JCXZ: u32 = 3;

/// Decrement CX/ECX (except JCXZ) and report whether the branch is taken.
pub extern "C" fn loop_step(env: *mut CpuState, kind: u32, big_addr: u32) -> u32 {
    let env = env_mut(env);
    let mask = if big_addr != 0 { 0xffff_ffff } else { 0xffff };
    let mut cx = env.regs[ECX] & mask;
    if kind != LOOP_JCXZ {
        cx = cx.wrapping_sub(1) & mask;
        env.regs[ECX] = env.regs[ECX] & !mask | cx;
    }
    let taken = match kind {
        LOOP_JCXZ => cx == 0,
        LOOP_PLAIN => cx != 0,
        LOOP_Z => {
            fill_flags(env);
            cx != 0 && env.flags & FLAG_ZF != 0
        }
        _ => {
            fill_flags(env);
            cx != 0 && env.flags & FLAG_ZF == 0
        }
    };
    taken as u32
}

// -- Flag word manipulation --

pub const CARRY_CLC: u32 = 0;
pub const CARRY_STC: u32 = 1;
pub const CARRY_CMC: u32 = 2;

pub extern "C" fn carry_op(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    fill_flags(env);
    match op {
        CARRY_CLC => env.flags &= !FLAG_CF,
        CARRY_STC => env.flags |= FLAG_CF,
        _ => env.flags ^= FLAG_CF,
    }
    0
}

pub extern "C" fn set_direction(env: *mut CpuState, down: u32) -> u32 {
    let env = env_mut(env);
    env.set_flag(FLAG_DF, down != 0);
    env.direction = if down != 0 { -1 } else { 1 };
    0
}

const FLAG_MODIFIABLE: u32 =
    FLAG_CF | FLAG_PF | 0x10 | FLAG_ZF | FLAG_SF | FLAG_TF | FLAG_IF | FLAG_DF | FLAG_OF;

pub extern "C" fn pushf(env: *mut CpuState, big: u32) -> u32 {
    let e = env_mut(env);
    fill_flags(e);
    let val = e.flags | 0x2;
    if big != 0 {
        push(env, val, 4)
    } else {
        push(env, val & 0xffff, 2)
    }
}

pub extern "C" fn popf(env: *mut CpuState, big: u32) -> u32 {
    let width = if big != 0 { 4 } else { 2 };
    let val = match pop(env, width) {
        Some(v) => v,
        None => return 1,
    };
    let e = env_mut(env);
    e.flags = e.flags & !FLAG_MODIFIABLE | val & FLAG_MODIFIABLE | 0x2;
    e.direction = if e.flags & FLAG_DF != 0 { -1 } else { 1 };
    e.lf_kind = FlagKind::Unknown as u32;
    0
}

// -- Segment loads and real-mode control transfers --

pub extern "C" fn set_seg(env: *mut CpuState, seg: u32, val: u32) -> u32 {
    env_mut(env).set_seg(seg as usize, val as u16);
    0
}

#[inline]
fn set_ip(env: &mut CpuState, off: u32) {
    env.eip = if env.code_big != 0 { off } else { off & 0xffff };
}

pub extern "C" fn ret_near(env: *mut CpuState, extra: u32, big: u32) -> u32 {
    let off = match pop(env, if big != 0 { 4 } else { 2 }) {
        Some(v) => v,
        None => return 1,
    };
    let e = env_mut(env);
    set_ip(e, off);
    let mask = e.stack_mask;
    let sp = (e.regs[ESP] & mask).wrapping_add(extra) & mask;
    e.regs[ESP] = e.regs[ESP] & !mask | sp;
    0
}

pub extern "C" fn ret_far(env: *mut CpuState, extra: u32, big: u32) -> u32 {
    let width = if big != 0 { 4 } else { 2 };
    let off = match pop(env, width) {
        Some(v) => v,
        None => return 1,
    };
    let sel = match pop(env, width) {
        Some(v) => v,
        None => return 1,
    };
    let e = env_mut(env);
    e.set_seg(CS, sel as u16);
    set_ip(e, off);
    let mask = e.stack_mask;
    let sp = (e.regs[ESP] & mask).wrapping_add(extra) & mask;
    e.regs[ESP] = e.regs[ESP] & !mask | sp;
    0
}

pub extern "C" fn jmp_far(env: *mut CpuState, sel: u32, off: u32) -> u32 {
    let e = env_mut(env);
    e.set_seg(CS, sel as u16);
    set_ip(e, off);
    0
}

pub extern "C" fn call_far(env: *mut CpuState, sel: u32, off: u32, next_eip: u32) -> u32 {
    let big = env_mut(env).code_big != 0;
    let old_cs = env_mut(env).segs_val[CS] as u32;
    let (pushed_cs, pushed_ip) = if big {
        (push(env, old_cs, 4), push(env, next_eip, 4))
    } else {
        (push(env, old_cs, 2), push(env, next_eip & 0xffff, 2))
    };
    if pushed_cs != 0 || pushed_ip != 0 {
        return 1;
    }
    let e = env_mut(env);
    e.set_seg(CS, sel as u16);
    set_ip(e, off);
    0
}

/// Real-mode software interrupt: push FLAGS/CS/IP, clear TF and IF,
/// vector through the IVT at linear 0.
pub extern "C" fn sw_interrupt(env: *mut CpuState, num: u32, next_eip: u32) -> u32 {
    {
        let e = env_mut(env);
        fill_flags(e);
    }
    let flags = env_mut(env).flags | 0x2;
    if push(env, flags & 0xffff, 2) != 0 {
        return 1;
    }
    let cs = env_mut(env).segs_val[CS] as u32;
    if push(env, cs, 2) != 0 {
        return 1;
    }
    if push(env, next_eip & 0xffff, 2) != 0 {
        return 1;
    }
    let e = env_mut(env);
    e.flags &= !(FLAG_TF | FLAG_IF);
    let vec = num & 0xff;
    let off = e.read_ram(vec * 4, 2).unwrap_or(0);
    let sel = e.read_ram(vec * 4 + 2, 2).unwrap_or(0);
    e.set_seg(CS, sel as u16);
    e.eip = off;
    0
}

/// Real-mode IRET: pop IP, CS and FLAGS.
pub extern "C" fn iret(env: *mut CpuState) -> u32 {
    let off = match pop(env, 2) {
        Some(v) => v,
        None => return 1,
    };
    let sel = match pop(env, 2) {
        Some(v) => v,
        None => return 1,
    };
    let fl = match pop(env, 2) {
        Some(v) => v,
        None => return 1,
    };
    let e = env_mut(env);
    e.set_seg(CS, sel as u16);
    e.eip = off & 0xffff;
    e.flags = e.flags & !FLAG_MODIFIABLE | fl & FLAG_MODIFIABLE | 0x2;
    e.direction = if e.flags & FLAG_DF != 0 { -1 } else { 1 };
    e.lf_kind = FlagKind::Unknown as u32;
    0
}

// -- Deferred exception exit --

/// Target of every deferred exception branch in a block. Repositions
/// EIP at the faulting instruction, refunds unexecuted cycles, and
/// picks the block return code: self-modification of the running block
/// surfaces as `SMCBlock`, everything else returns `Normal` with the
/// exception left pending for the run loop to dispatch.
pub extern "C" fn run_exception(env: *mut CpuState, eip_add: u32, cycle_sub: u32) -> u32 {
    let env = env_mut(env);
    if env.code_big != 0 {
        env.eip = env.eip.wrapping_add(eip_add);
    } else {
        env.eip = env.eip.wrapping_add(eip_add) & 0xffff;
    }
    env.cycles -= cycle_sub as i32;
    if env.exception == SMC_CURRENT_BLOCK {
        env.exception = EXCEPTION_NONE;
        BlockReturn::SMCBlock as u32
    } else {
        BlockReturn::Normal as u32
    }
}
