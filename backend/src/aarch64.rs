//! AArch64 host backend.
//!
//! Register roles: RetOp=w0, Op1=w1, Op2=w2, Op3=w3, Addr=w19,
//! ByteA=w10, ByteB=w11. The guest state pointer lives in x20, x16 is
//! the address scratch, x17 the call target, w12/w13 immediate scratch.
//! Op1..Op3 coincide with AAPCS64 parameter registers 1..3.

use drc_core::{BlockReturn, FlagKind};

use crate::arena::CodeArena;
use crate::{BranchPatch, CodeGen, PatchKind, Reg};

const NOP: u32 = 0xD503_201F;
const RET: u32 = 0xD65F_03C0;
const BLR_X17: u32 = 0xD63F_0220;
const BR_X17: u32 = 0xD61F_0220;
const BR_X1: u32 = 0xD61F_0020;
/// 4 mov-immediate words for x17 plus blr.
const CALL_SITE_LEN: usize = 20;

const ADDR_TMP: u32 = 16;
const IMM_TMP: u32 = 12;
const IMM_TMP2: u32 = 13;
const ENV: u32 = 20;

fn rnum(reg: Reg) -> u32 {
    match reg {
        Reg::RetOp => 0,
        Reg::Op1 => 1,
        Reg::Op2 => 2,
        Reg::Op3 => 3,
        Reg::Addr => 19,
        Reg::ByteA => 10,
        Reg::ByteB => 11,
    }
}

fn pnum(nr: usize) -> u32 {
    assert!(nr < 4, "call parameter {nr} out of range");
    nr as u32
}

fn movz_w(rd: u32, imm16: u32, hw: u32) -> u32 {
    0x5280_0000 | (hw << 21) | (imm16 << 5) | rd
}

fn movk_w(rd: u32, imm16: u32, hw: u32) -> u32 {
    0x7280_0000 | (hw << 21) | (imm16 << 5) | rd
}

fn movz_x(rd: u32, imm16: u32, hw: u32) -> u32 {
    0xD280_0000 | (hw << 21) | (imm16 << 5) | rd
}

fn movk_x(rd: u32, imm16: u32, hw: u32) -> u32 {
    0xF280_0000 | (hw << 21) | (imm16 << 5) | rd
}

fn mov_reg(rd: u32, rm: u32) -> u32 {
    // orr wd, wzr, wm
    0x2A00_03E0 | (rm << 16) | rd
}

fn mov_reg_x(rd: u32, rm: u32) -> u32 {
    0xAA00_03E0 | (rm << 16) | rd
}

fn add_reg(rd: u32, rn: u32, rm: u32, shamt: u32) -> u32 {
    0x0B00_0000 | (rm << 16) | (shamt << 10) | (rn << 5) | rd
}

fn and_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    0x0A00_0000 | (rm << 16) | (rn << 5) | rd
}

fn ldr_imm0(opc: u32, rt: u32, rn: u32) -> u32 {
    opc | (rn << 5) | rt
}

const LDR_W: u32 = 0xB940_0000;
const LDRH: u32 = 0x7940_0000;
const LDRB: u32 = 0x3940_0000;
const LDR_X: u32 = 0xF940_0000;
const STR_W: u32 = 0xB900_0000;
const STRH: u32 = 0x7900_0000;
const STRB: u32 = 0x3900_0000;

#[derive(Default)]
pub struct A64Gen;

impl A64Gen {
    pub fn new() -> Self {
        Self
    }

    fn emit_mov_imm32(&mut self, a: &mut CodeArena, rd: u32, imm: u32) {
        a.emit_u32(movz_w(rd, imm & 0xffff, 0));
        if imm >> 16 != 0 {
            a.emit_u32(movk_w(rd, imm >> 16, 1));
        }
    }

    /// Materialize an absolute host address in x16, skipping zero chunks.
    fn load_addr(&mut self, a: &mut CodeArena, addr: u64) {
        a.emit_u32(movz_x(ADDR_TMP, (addr & 0xffff) as u32, 0));
        for hw in 1..4 {
            let chunk = ((addr >> (16 * hw)) & 0xffff) as u32;
            if chunk != 0 {
                a.emit_u32(movk_x(ADDR_TMP, chunk, hw as u32));
            }
        }
    }

    fn add_imm_raw(&mut self, a: &mut CodeArena, rd: u32, imm: u32) {
        if imm == 0 {
            return;
        }
        let neg = imm.wrapping_neg();
        if imm < 0x1000 {
            a.emit_u32(0x1100_0000 | (imm << 10) | (rd << 5) | rd);
        } else if neg < 0x1000 {
            a.emit_u32(0x5100_0000 | (neg << 10) | (rd << 5) | rd);
        } else if imm & 0xfff == 0 && imm < 0x100_0000 {
            // shifted imm12
            a.emit_u32(0x1140_0000 | ((imm >> 12) << 10) | (rd << 5) | rd);
        } else {
            self.emit_mov_imm32(a, IMM_TMP2, imm);
            a.emit_u32(add_reg(rd, rd, IMM_TMP2, 0));
        }
    }

    fn epilogue(&mut self, a: &mut CodeArena) {
        a.emit_u32(0xA941_53F3); // ldp x19, x20, [sp, #16]
        a.emit_u32(0xA8C2_7BFD); // ldp x29, x30, [sp], #32
        a.emit_u32(RET);
    }

    fn cbz_like(&mut self, a: &mut CodeArena, opc: u32, reg: Reg, dword: bool) -> BranchPatch {
        let mut rt = rnum(reg);
        if !dword {
            // uxth w12, wreg; test only the low half.
            a.emit_u32(0x5300_3C00 | (rt << 5) | IMM_TMP);
            rt = IMM_TMP;
        }
        let pos = a.offset();
        a.emit_u32(opc | rt);
        BranchPatch {
            pos,
            kind: PatchKind::Imm19,
        }
    }

    fn fill_imm19(&mut self, a: &mut CodeArena, patch: BranchPatch) {
        assert_eq!(patch.kind, PatchKind::Imm19);
        let disp = (a.offset() as i64 - patch.pos as i64) / 4;
        assert!((-(1 << 18)..1 << 18).contains(&disp), "branch out of range");
        let word = a.read_u32(patch.pos) | (((disp as u32) & 0x7ffff) << 5);
        a.patch_u32(patch.pos, word);
    }
}

impl CodeGen for A64Gen {
    fn call_site_len(&self) -> usize {
        CALL_SITE_LEN
    }

    fn mov_reg_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32) {
        self.emit_mov_imm32(a, rnum(reg), imm);
    }

    fn mov_regs(&mut self, a: &mut CodeArena, dst: Reg, src: Reg) {
        if rnum(dst) == rnum(src) {
            return;
        }
        a.emit_u32(mov_reg(rnum(dst), rnum(src)));
    }

    fn mov_word_to_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool) {
        self.load_addr(a, addr);
        let opc = if dword { LDR_W } else { LDRH };
        a.emit_u32(ldr_imm0(opc, rnum(reg), ADDR_TMP));
    }

    fn mov_word_from_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool) {
        self.load_addr(a, addr);
        let opc = if dword { STR_W } else { STRH };
        a.emit_u32(ldr_imm0(opc, rnum(reg), ADDR_TMP));
    }

    fn mov_byte_to_reg_low(&mut self, a: &mut CodeArena, reg: Reg, addr: u64) {
        self.load_addr(a, addr);
        a.emit_u32(ldr_imm0(LDRB, rnum(reg), ADDR_TMP));
    }

    fn mov_byte_from_reg_low(&mut self, a: &mut CodeArena, reg: Reg, addr: u64) {
        self.load_addr(a, addr);
        a.emit_u32(ldr_imm0(STRB, rnum(reg), ADDR_TMP));
    }

    fn extend_byte(&mut self, a: &mut CodeArena, sign: bool, reg: Reg) {
        let r = rnum(reg);
        let opc = if sign { 0x1300_1C00 } else { 0x5300_1C00 };
        a.emit_u32(opc | (r << 5) | r);
    }

    fn extend_word(&mut self, a: &mut CodeArena, sign: bool, reg: Reg) {
        let r = rnum(reg);
        let opc = if sign { 0x1300_3C00 } else { 0x5300_3C00 };
        a.emit_u32(opc | (r << 5) | r);
    }

    fn add_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32) {
        self.add_imm_raw(a, rnum(reg), imm);
    }

    fn and_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32) {
        let r = rnum(reg);
        self.emit_mov_imm32(a, IMM_TMP, imm);
        a.emit_u32(and_reg(r, r, IMM_TMP));
    }

    fn lea(&mut self, a: &mut CodeArena, dst: Reg, index: Option<Reg>, scale: u8, imm: u32) {
        let d = rnum(dst);
        if let Some(idx) = index {
            a.emit_u32(add_reg(d, d, rnum(idx), scale as u32));
        }
        self.add_imm_raw(a, d, imm);
    }

    fn add_word_to_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool) {
        self.load_addr(a, addr);
        let opc = if dword { LDR_W } else { LDRH };
        a.emit_u32(ldr_imm0(opc, IMM_TMP, ADDR_TMP));
        let r = rnum(reg);
        a.emit_u32(add_reg(r, r, IMM_TMP, 0));
    }

    fn mov_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool) {
        self.load_addr(a, addr);
        self.emit_mov_imm32(a, IMM_TMP, imm);
        let opc = if dword { STR_W } else { STRH };
        a.emit_u32(ldr_imm0(opc, IMM_TMP, ADDR_TMP));
    }

    fn add_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool) {
        self.load_addr(a, addr);
        let (ld, st) = if dword { (LDR_W, STR_W) } else { (LDRH, STRH) };
        a.emit_u32(ldr_imm0(ld, IMM_TMP, ADDR_TMP));
        self.add_imm_raw(a, IMM_TMP, imm);
        a.emit_u32(ldr_imm0(st, IMM_TMP, ADDR_TMP));
    }

    fn sub_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool) {
        self.add_direct_word(a, addr, imm.wrapping_neg(), dword);
    }

    fn load_param_imm(&mut self, a: &mut CodeArena, nr: usize, imm: u64) {
        let p = pnum(nr);
        if imm <= u32::MAX as u64 {
            self.emit_mov_imm32(a, p, imm as u32);
        } else {
            a.emit_u32(movz_x(p, (imm & 0xffff) as u32, 0));
            for hw in 1..4 {
                let chunk = ((imm >> (16 * hw)) & 0xffff) as u32;
                if chunk != 0 {
                    a.emit_u32(movk_x(p, chunk, hw as u32));
                }
            }
        }
    }

    fn load_param_reg(&mut self, a: &mut CodeArena, nr: usize, reg: Reg) {
        let p = pnum(nr);
        let r = rnum(reg);
        if p == r {
            return;
        }
        a.emit_u32(mov_reg(p, r));
    }

    fn load_param_mem(&mut self, a: &mut CodeArena, nr: usize, addr: u64) {
        self.load_addr(a, addr);
        a.emit_u32(ldr_imm0(LDR_W, pnum(nr), ADDR_TMP));
    }

    fn load_param_env(&mut self, a: &mut CodeArena, nr: usize) {
        a.emit_u32(mov_reg_x(pnum(nr), ENV));
    }

    fn call(&mut self, a: &mut CodeArena, fct: u64) -> usize {
        let site = a.offset();
        // All four mov words are always emitted so the site can be
        // rewritten with any other pointer later.
        a.emit_u32(movz_x(17, (fct & 0xffff) as u32, 0));
        a.emit_u32(movk_x(17, ((fct >> 16) & 0xffff) as u32, 1));
        a.emit_u32(movk_x(17, ((fct >> 32) & 0xffff) as u32, 2));
        a.emit_u32(movk_x(17, ((fct >> 48) & 0xffff) as u32, 3));
        a.emit_u32(BLR_X17);
        site
    }

    fn fill_function_ptr(
        &mut self,
        a: &mut CodeArena,
        site: usize,
        simple_fct: u64,
        kind: FlagKind,
    ) {
        use FlagKind::*;

        // Inline replacements compute into w0 from w1/w2 (operand and
        // count already sit in the parameter registers), NOP-padded to
        // the fixed call-site size.
        let inline: Option<&[u32]> = match kind {
            AddB | AddW | AddD => Some(&[0x0B02_0020]), // add w0, w1, w2
            OrB | OrW | OrD => Some(&[0x2A02_0020]),    // orr w0, w1, w2
            AndB | AndW | AndD => Some(&[0x0A02_0020]), // and w0, w1, w2
            SubB | SubW | SubD => Some(&[0x4B02_0020]), // sub w0, w1, w2
            XorB | XorW | XorD => Some(&[0x4A02_0020]), // eor w0, w1, w2
            CmpB | CmpW | CmpD | TestB | TestW | TestD => Some(&[]),
            IncB | IncW | IncD => Some(&[0x1100_0420]), // add w0, w1, #1
            DecB | DecW | DecD => Some(&[0x5100_0420]), // sub w0, w1, #1
            NegB | NegW | NegD => Some(&[0x4B01_03E0]), // sub w0, wzr, w1
            ShlB | ShlW | ShlD => Some(&[0x1AC2_2020]), // lslv w0, w1, w2
            ShrB => Some(&[0x5300_1C20, 0x1AC2_2400]),  // uxtb; lsrv
            ShrW => Some(&[0x5300_3C20, 0x1AC2_2400]),  // uxth; lsrv
            ShrD => Some(&[0x1AC2_2420]),               // lsrv w0, w1, w2
            SarB => Some(&[0x1300_1C20, 0x1AC2_2800]),  // sxtb; asrv
            SarW => Some(&[0x1300_3C20, 0x1AC2_2800]),  // sxth; asrv
            SarD => Some(&[0x1AC2_2820]),               // asrv w0, w1, w2
            RorD => Some(&[0x1AC2_2C20]),               // rorv w0, w1, w2
            // rol d: rotate right by 32 - count
            RolD => Some(&[0x5280_040C, 0x4B02_018C, 0x1ACC_2C20]),
            _ => None,
        };

        match inline {
            Some(seq) => {
                debug_assert!(seq.len() * 4 <= CALL_SITE_LEN);
                let mut off = site;
                for &w in seq {
                    a.patch_u32(off, w);
                    off += 4;
                }
                while off < site + CALL_SITE_LEN {
                    a.patch_u32(off, NOP);
                    off += 4;
                }
            }
            None => {
                // Keep the blr, swap in the flags-free twin.
                a.patch_u32(site, movz_x(17, (simple_fct & 0xffff) as u32, 0));
                a.patch_u32(site + 4, movk_x(17, ((simple_fct >> 16) & 0xffff) as u32, 1));
                a.patch_u32(site + 8, movk_x(17, ((simple_fct >> 32) & 0xffff) as u32, 2));
                a.patch_u32(site + 12, movk_x(17, ((simple_fct >> 48) & 0xffff) as u32, 3));
            }
        }
    }

    fn branch_on_zero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch {
        self.cbz_like(a, 0x3400_0000, reg, dword)
    }

    fn branch_on_nonzero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch {
        self.cbz_like(a, 0x3500_0000, reg, dword)
    }

    fn fill_branch(&mut self, a: &mut CodeArena, patch: BranchPatch) {
        self.fill_imm19(a, patch);
    }

    fn branch_long_nonzero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch {
        // cbnz reaches +-1 MiB, far beyond one block.
        self.cbz_like(a, 0x3500_0000, reg, dword)
    }

    fn branch_long_leqzero(&mut self, a: &mut CodeArena, reg: Reg) -> BranchPatch {
        a.emit_u32(0x7100_0000 | (rnum(reg) << 5) | 0x1F); // cmp wreg, #0
        let pos = a.offset();
        a.emit_u32(0x5400_000D); // b.le
        BranchPatch {
            pos,
            kind: PatchKind::Imm19,
        }
    }

    fn fill_branch_long(&mut self, a: &mut CodeArena, patch: BranchPatch) {
        self.fill_imm19(a, patch);
    }

    fn jmp_ptr(&mut self, a: &mut CodeArena, cell_addr: u64) {
        self.load_addr(a, cell_addr);
        a.emit_u32(ldr_imm0(LDR_X, 17, ADDR_TMP));
        a.emit_u32(BR_X17);
    }

    fn return_imm(&mut self, a: &mut CodeArena, code: BlockReturn) {
        a.emit_u32(movz_w(0, code as u32, 0));
        self.epilogue(a);
    }

    fn return_retop(&mut self, a: &mut CodeArena) {
        self.epilogue(a);
    }

    fn run_code(&mut self, a: &mut CodeArena) -> usize {
        a.align_to(16);
        let off = a.offset();
        a.emit_u32(0xA9BE_7BFD); // stp x29, x30, [sp, #-32]!
        a.emit_u32(0x9100_03FD); // mov x29, sp
        a.emit_u32(0xA901_53F3); // stp x19, x20, [sp, #16]
        a.emit_u32(mov_reg_x(ENV, 0)); // mov x20, x0
        a.emit_u32(BR_X1);
        off
    }

    fn block_closing(&self, a: &CodeArena, start: usize, len: usize) {
        flush_icache(a.addr_at(start), a.addr_at(start) + len as u64);
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_icache(start: u64, end: u64) {
    use std::arch::asm;
    const LINE: u64 = 64;
    let mut p = start & !(LINE - 1);
    while p < end {
        // SAFETY: cache maintenance on addresses inside the arena mapping.
        unsafe { asm!("dc cvau, {}", in(reg) p) };
        p += LINE;
    }
    unsafe { asm!("dsb ish") };
    let mut p = start & !(LINE - 1);
    while p < end {
        unsafe { asm!("ic ivau, {}", in(reg) p) };
        p += LINE;
    }
    unsafe { asm!("dsb ish", "isb") };
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: u64, _end: u64) {}
