use drc_core::ops::{self, STR_REP};
use drc_core::state::{EAX, ECX, EDI, ESI, FLAG_DF};

use super::ram_env;

#[test]
fn stos_rep_fills_and_clears_cx() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.cycles = 100;
    env.regs[EAX] = 0xaa;
    env.regs[ECX] = 8;
    env.regs[EDI] = 0x20;
    let left = ops::stos_b(&mut *env, 0x100, STR_REP);
    assert_eq!(left, 0);
    assert_eq!(env.regs[ECX], 0);
    assert_eq!(env.regs[EDI], 0x28);
    assert!(ram[0x120..0x128].iter().all(|&b| b == 0xaa));
    assert_eq!(env.cycles, 92);
}

#[test]
fn stos_stops_at_cycle_budget() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.cycles = 3;
    env.regs[EAX] = 0x55;
    env.regs[ECX] = 10;
    env.regs[EDI] = 0;
    let left = ops::stos_b(&mut *env, 0x200, STR_REP);
    assert_eq!(left, 7);
    assert_eq!(env.regs[ECX], 7);
    assert_eq!(env.regs[EDI], 3);
    assert_eq!(env.cycles, 0);
    assert!(ram[0x200..0x203].iter().all(|&b| b == 0x55));
    assert_eq!(ram[0x203], 0);
}

#[test]
fn movs_copies_between_segments() {
    let mut ram = vec![0u8; 0x1000];
    ram[0x100..0x104].copy_from_slice(b"abcd");
    let mut env = ram_env(&mut ram);
    env.cycles = 100;
    env.regs[ECX] = 4;
    env.regs[ESI] = 0;
    env.regs[EDI] = 0;
    let left = ops::movs_b(&mut *env, 0x100, 0x300, STR_REP);
    assert_eq!(left, 0);
    assert_eq!(&ram[0x300..0x304], b"abcd");
    assert_eq!(env.regs[ESI], 4);
    assert_eq!(env.regs[EDI], 4);
}

#[test]
fn string_direction_down() {
    let mut ram = vec![0u8; 0x1000];
    let mut env = ram_env(&mut ram);
    env.cycles = 100;
    env.set_flag(FLAG_DF, true);
    env.direction = -1;
    env.regs[EAX] = 0x11;
    env.regs[ECX] = 4;
    env.regs[EDI] = 0x43;
    let left = ops::stos_b(&mut *env, 0, STR_REP);
    assert_eq!(left, 0);
    assert!(ram[0x40..0x44].iter().all(|&b| b == 0x11));
    assert_eq!(env.regs[EDI], 0x3f);
}

#[test]
fn lods_without_rep_moves_one_unit() {
    let mut ram = vec![0u8; 0x1000];
    ram[0x80] = 0x7e;
    let mut env = ram_env(&mut ram);
    env.cycles = 100;
    env.regs[EAX] = 0xffff_ff00;
    env.regs[ESI] = 0x80;
    let left = ops::lods_b(&mut *env, 0, 0);
    assert_eq!(left, 0);
    assert_eq!(env.regs[EAX], 0xffff_ff7e);
    assert_eq!(env.regs[ESI], 0x81);
}

#[test]
fn string_fault_reports_remaining_count() {
    let mut ram = vec![0u8; 0x100];
    let mut env = ram_env(&mut ram);
    env.cycles = 100;
    env.regs[EAX] = 1;
    env.regs[ECX] = 8;
    env.regs[EDI] = 0xfc;
    // Runs off the end of RAM after four stores.
    let left = ops::stos_b(&mut *env, 0, STR_REP);
    assert_eq!(left, 4);
    assert_eq!(env.regs[ECX], 4);
    assert_ne!(env.exception, drc_core::EXCEPTION_NONE);
}
