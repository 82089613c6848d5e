//! End-to-end tests: real guest programs run through the recompiling
//! core on the host this test runs on.
#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use drc_backend::HostGen;
use drc_core::state::{
    CS, DS, EAX, EBX, ECX, EDI, ES, ESP, EXCEPTION_DE, FLAG_IF, FLAG_TF, SS,
};
use drc_core::{CoreConfig, CpuState};
use drc_exec::{CoreExit, DynCore, FallbackCore, GuestMem};

use crate::init_logging;

/// Minimal interpreter behind the recompiler. Handles exactly the
/// instructions the tests defer on purpose and records every visit.
#[derive(Default)]
struct Interp {
    stepped: Vec<u32>,
    exceptions: Vec<i32>,
    breaks: usize,
}

impl FallbackCore for Interp {
    fn step_one(&mut self, env: &mut CpuState) {
        self.stepped.push(env.eip);
        let ip = env.ip_point();
        match env.read_ram(ip, 1).unwrap() {
            // hlt: treat as end of the time slice
            0xf4 => env.cycles = 0,
            // mov byte [disp16], imm8 (mod 00, rm 110)
            0xc6 => {
                assert_eq!(env.read_ram(ip + 1, 1).unwrap(), 0x06);
                let disp = env.read_ram(ip + 2, 2).unwrap();
                let val = env.read_ram(ip + 4, 1).unwrap();
                let addr = env.segs_phys[DS].wrapping_add(disp);
                assert_eq!(env.write_ram(addr, val, 1), 0);
                env.eip += 5;
                env.cycles -= 1;
            }
            other => panic!("interpreter asked to run {other:#04x} at {ip:#x}"),
        }
    }

    fn exception(&mut self, env: &mut CpuState, vector: i32, _error: u32) {
        self.exceptions.push(vector);
        env.cycles = 0;
    }

    fn debug_break(&mut self, _env: &mut CpuState) {
        self.breaks += 1;
    }
}

fn test_config() -> CoreConfig {
    CoreConfig {
        cache_total: 512 * 1024,
        block_count: 4096,
        page_count: 16,
        ..CoreConfig::default()
    }
}

/// Core with a 64 KiB guest RAM and the given byte images loaded.
fn core_with(images: &[(u32, &[u8])]) -> DynCore<HostGen> {
    init_logging();
    let mut mem = GuestMem::new(0x10000);
    for (addr, bytes) in images {
        mem.load(*addr, bytes);
    }
    DynCore::new(test_config(), HostGen::new(), mem).unwrap()
}

#[test]
fn straight_line_block_runs_to_halt() {
    // mov ax,5 / add ax,3 / hlt
    let mut core = core_with(&[(0x1000, &[0xb8, 0x05, 0x00, 0x05, 0x03, 0x00, 0xf4])]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().cycles = 100;

    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert_eq!(core.env().regs[EAX], 8);
    assert_eq!(interp.stepped, [6]);
}

#[test]
fn conditional_branch_takes_both_edges() {
    // cmp al,0 / je +3 / mov bl,1 / hlt / mov bl,2 / hlt
    let prog: &[u8] = &[0x3c, 0x00, 0x74, 0x03, 0xb3, 0x01, 0xf4, 0xb3, 0x02, 0xf4];

    let mut core = core_with(&[(0x1000, prog)]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().regs[EAX] = 0;
    core.env_mut().cycles = 100;
    let mut interp = Interp::default();
    core.run(&mut interp).unwrap();
    assert_eq!(core.env().regs[EBX] & 0xff, 2);
    assert_eq!(interp.stepped, [9]);

    let mut core = core_with(&[(0x1000, prog)]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().regs[EAX] = 1;
    core.env_mut().cycles = 100;
    let mut interp = Interp::default();
    core.run(&mut interp).unwrap();
    assert_eq!(core.env().regs[EBX] & 0xff, 1);
    assert_eq!(interp.stepped, [6]);
}

#[test]
fn backward_loop_links_and_terminates() {
    // mov cx,5 / dec cx / jnz -3 / hlt
    let mut core = core_with(&[(0x1000, &[0xb9, 0x05, 0x00, 0x49, 0x75, 0xfd, 0xf4])]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().cycles = 1000;

    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert_eq!(core.env().regs[ECX], 0);
    assert_eq!(interp.stepped, [6]);
}

#[test]
fn callback_trap_returns_identifier() {
    let mut core = core_with(&[(0x1000, &[0xfe, 0x38, 0x34, 0x12])]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().cycles = 100;

    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::Callback(0x1234));
    assert_eq!(core.env().eip, 4);
}

#[test]
fn rep_stos_respects_cycle_budget() {
    // mov cx,0x100 / mov di,0x200 / mov al,0xaa / rep stosb / hlt
    let prog: &[u8] = &[
        0xb9, 0x00, 0x01, 0xbf, 0x00, 0x02, 0xb0, 0xaa, 0xf3, 0xaa, 0xf4,
    ];
    let mut core = core_with(&[(0, prog)]);
    core.env_mut().set_seg(CS, 0);
    core.env_mut().set_seg(ES, 0);
    core.env_mut().cycles = 20;

    // First slice stops partway through the string, at the string
    // instruction, so the next slice resumes it.
    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert_eq!(core.env().eip, 8);
    assert_eq!(core.env().regs[ECX], 0x100 - 20);
    assert_eq!(core.env().regs[EDI], 0x200 + 20);
    assert!(core.mem().slice(0x200, 20).iter().all(|&b| b == 0xaa));
    assert_eq!(core.mem().slice(0x200 + 20, 1)[0], 0);

    core.env_mut().cycles = 1000;
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert_eq!(core.env().regs[ECX], 0);
    assert_eq!(core.env().regs[EDI], 0x300);
    assert!(core.mem().slice(0x200, 0x100).iter().all(|&b| b == 0xaa));
    assert_eq!(interp.stepped, [10]);
}

#[test]
fn software_interrupt_roundtrip() {
    // IVT vector 0x21 -> 0040:0010; handler: mov bx,0x42 / iret
    let mut core = core_with(&[
        (0x84, &[0x10, 0x00, 0x40, 0x00]),
        (0x410, &[0xbb, 0x42, 0x00, 0xcf]),
        (0x1000, &[0xcd, 0x21, 0xf4]),
    ]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().set_seg(SS, 0x300);
    core.env_mut().regs[ESP] = 0x100;
    core.env_mut().flags |= FLAG_IF;
    core.env_mut().cycles = 100;

    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert_eq!(core.env().regs[EBX], 0x42);
    assert_eq!(core.env().eip, 2);
    assert_eq!(core.env().regs[ESP], 0x100);
    assert!(core.env().flag(FLAG_IF));
    assert_eq!(interp.stepped, [2]);
    assert!(interp.exceptions.is_empty());
}

#[test]
fn iret_restoring_trap_flag_single_steps_once() {
    // iret at 0100:0000 pops a frame that returns to the hlt at
    // 0100:0020 with TF set. The core must run that one instruction on
    // the interpreter and fire exactly one break.
    let flags = ((FLAG_TF | 0x2) & 0xffff) as u16;
    let frame = [
        0x20, 0x00, // IP
        0x00, 0x01, // CS
        flags as u8,
        (flags >> 8) as u8,
    ];
    let mut core = core_with(&[
        (0x1000, &[0xcf]),
        (0x1020, &[0xf4]),
        (0x30fa, &frame),
    ]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().set_seg(SS, 0x300);
    core.env_mut().regs[ESP] = 0xfa;
    core.env_mut().cycles = 100;

    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert!(core.env().flag(FLAG_TF));
    assert_eq!(core.env().eip, 0x20);
    assert_eq!(core.env().regs[ESP], 0x100);
    assert_eq!(interp.stepped, [0x20]);
    assert_eq!(interp.breaks, 1);
}

#[test]
fn divide_fault_lands_on_faulting_instruction() {
    // mov ax,5 / mov bl,0 / div bl / hlt
    let mut core = core_with(&[(0x1000, &[0xb8, 0x05, 0x00, 0xb3, 0x00, 0xf6, 0xf3, 0xf4])]);
    core.env_mut().set_seg(CS, 0x100);
    core.env_mut().cycles = 100;

    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert_eq!(interp.exceptions, [EXCEPTION_DE]);
    assert_eq!(core.env().eip, 5);
}

#[test]
fn self_modifying_store_in_running_block() {
    // mov byte [8],0x90 / inc ax x4 / hlt; the store hits this block's
    // own fourth inc, so the block must abort and hand the store to the
    // interpreter before anything stale runs.
    let prog: &[u8] = &[
        0xc6, 0x06, 0x08, 0x00, 0x90, 0x40, 0x40, 0x40, 0x40, 0xf4,
    ];
    let mut core = core_with(&[(0, prog)]);
    core.env_mut().set_seg(CS, 0);
    core.env_mut().set_seg(DS, 0);
    core.env_mut().cycles = 100;

    let mut interp = Interp::default();
    assert_eq!(core.run(&mut interp).unwrap(), CoreExit::CyclesDone);
    assert_eq!(core.mem().slice(8, 1)[0], 0x90);
    assert_eq!(core.env().regs[EAX], 3);
    assert_eq!(interp.stepped, [0, 9]);
    assert!(interp.exceptions.is_empty());
}

#[test]
fn store_invalidates_block_behind_a_jump() {
    // Block at 0x40 is translated first; the main program rewrites its
    // first opcode byte and jumps there, so the stale translation must
    // not run.
    let mut core = core_with(&[
        // mov byte [0x40],0xb9 / jmp 0x40
        (0, &[0xc6, 0x06, 0x40, 0x00, 0xb9, 0xeb, 0x39]),
        // mov bx,1 / hlt
        (0x40, &[0xbb, 0x01, 0x00, 0xf4]),
    ]);
    core.env_mut().set_seg(CS, 0);
    core.env_mut().set_seg(DS, 0);

    core.env_mut().eip = 0x40;
    core.env_mut().cycles = 100;
    let mut interp = Interp::default();
    core.run(&mut interp).unwrap();
    assert_eq!(core.env().regs[EBX], 1);
    assert_eq!(interp.stepped, [0x43]);

    // After the rewrite the same address decodes as mov cx,1.
    core.env_mut().eip = 0;
    core.env_mut().cycles = 100;
    let mut interp = Interp::default();
    core.run(&mut interp).unwrap();
    assert_eq!(core.env().regs[ECX], 1);
    assert_eq!(core.mem().slice(0x40, 1)[0], 0xb9);
    assert_eq!(interp.stepped, [0x43]);
}
