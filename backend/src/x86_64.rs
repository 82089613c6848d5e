//! x86-64 host backend.
//!
//! Register roles: RetOp=rax, Addr=rbx, Op1=rsi, Op2=rdx, Op3=rcx
//! (ByteA/ByteB alias rcx/rdx). The guest state pointer lives in rbp,
//! r10 is the internal address scratch. Op1..Op3 coincide with the
//! System V parameter registers 1..3, so operand values flow into
//! helper calls without moves.

use drc_core::{BlockReturn, FlagKind};

use crate::arena::CodeArena;
use crate::{BranchPatch, CodeGen, PatchKind, Reg};

const NOP: u8 = 0x90;
/// movabs rax, imm64 + call rax.
const CALL_SITE_LEN: usize = 12;

fn rnum(reg: Reg) -> u8 {
    match reg {
        Reg::RetOp => 0, // rax
        Reg::Addr => 3,  // rbx
        Reg::Op1 => 6,   // rsi
        Reg::Op2 => 2,   // rdx
        Reg::Op3 => 1,   // rcx
        Reg::ByteA => 1, // cl
        Reg::ByteB => 2, // dl
    }
}

/// System V argument registers 0..3.
fn pnum(nr: usize) -> u8 {
    match nr {
        0 => 7, // rdi
        1 => 6, // rsi
        2 => 2, // rdx
        3 => 1, // rcx
        _ => panic!("call parameter {nr} out of range"),
    }
}

#[derive(Default)]
pub struct X64Gen;

impl X64Gen {
    pub fn new() -> Self {
        Self
    }

    /// movabs r10, imm64. Every absolute memory operand goes through r10.
    fn mov_r10_imm(&mut self, a: &mut CodeArena, imm: u64) {
        a.emit_u8(0x49);
        a.emit_u8(0xBA);
        a.emit_u64(imm);
    }

    /// ModRM for a [r10] memory operand with the given reg field.
    fn modrm_r10(reg: u8) -> u8 {
        (reg << 3) | 0x02
    }

    fn test_reg(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) {
        let r = rnum(reg);
        if !dword {
            a.emit_u8(0x66);
        }
        a.emit_u8(0x85);
        a.emit_u8(0xC0 | (r << 3) | r);
    }

    fn epilogue(&mut self, a: &mut CodeArena) {
        a.emit_u8(0x41); // pop r12
        a.emit_u8(0x5C);
        a.emit_u8(0x5B); // pop rbx
        a.emit_u8(0x5D); // pop rbp
        a.emit_u8(0xC3); // ret
    }
}

impl CodeGen for X64Gen {
    fn call_site_len(&self) -> usize {
        CALL_SITE_LEN
    }

    fn mov_reg_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32) {
        a.emit_u8(0xB8 + rnum(reg));
        a.emit_u32(imm);
    }

    fn mov_regs(&mut self, a: &mut CodeArena, dst: Reg, src: Reg) {
        if rnum(dst) == rnum(src) {
            return;
        }
        a.emit_u8(0x89);
        a.emit_u8(0xC0 | (rnum(src) << 3) | rnum(dst));
    }

    fn mov_word_to_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool) {
        self.mov_r10_imm(a, addr);
        if !dword {
            a.emit_u8(0x66);
        }
        a.emit_u8(0x41);
        a.emit_u8(0x8B);
        a.emit_u8(Self::modrm_r10(rnum(reg)));
    }

    fn mov_word_from_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool) {
        self.mov_r10_imm(a, addr);
        if !dword {
            a.emit_u8(0x66);
        }
        a.emit_u8(0x41);
        a.emit_u8(0x89);
        a.emit_u8(Self::modrm_r10(rnum(reg)));
    }

    fn mov_byte_to_reg_low(&mut self, a: &mut CodeArena, reg: Reg, addr: u64) {
        self.mov_r10_imm(a, addr);
        // REX present, so reg field 6 selects sil rather than dh.
        a.emit_u8(0x41);
        a.emit_u8(0x8A);
        a.emit_u8(Self::modrm_r10(rnum(reg)));
    }

    fn mov_byte_from_reg_low(&mut self, a: &mut CodeArena, reg: Reg, addr: u64) {
        self.mov_r10_imm(a, addr);
        a.emit_u8(0x41);
        a.emit_u8(0x88);
        a.emit_u8(Self::modrm_r10(rnum(reg)));
    }

    fn extend_byte(&mut self, a: &mut CodeArena, sign: bool, reg: Reg) {
        let r = rnum(reg);
        a.emit_u8(0x40); // bare REX for sil access
        a.emit_u8(0x0F);
        a.emit_u8(if sign { 0xBE } else { 0xB6 });
        a.emit_u8(0xC0 | (r << 3) | r);
    }

    fn extend_word(&mut self, a: &mut CodeArena, sign: bool, reg: Reg) {
        let r = rnum(reg);
        a.emit_u8(0x0F);
        a.emit_u8(if sign { 0xBF } else { 0xB7 });
        a.emit_u8(0xC0 | (r << 3) | r);
    }

    fn add_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32) {
        if imm == 0 {
            return;
        }
        a.emit_u8(0x81);
        a.emit_u8(0xC0 | rnum(reg));
        a.emit_u32(imm);
    }

    fn and_imm(&mut self, a: &mut CodeArena, reg: Reg, imm: u32) {
        a.emit_u8(0x81);
        a.emit_u8(0xE0 | rnum(reg));
        a.emit_u32(imm);
    }

    fn lea(&mut self, a: &mut CodeArena, dst: Reg, index: Option<Reg>, scale: u8, imm: u32) {
        let d = rnum(dst);
        a.emit_u8(0x8D);
        match index {
            Some(idx) => {
                // lea d, [d + idx*scale + disp32]
                a.emit_u8(0x80 | (d << 3) | 0x04);
                a.emit_u8((scale << 6) | (rnum(idx) << 3) | d);
            }
            None => {
                a.emit_u8(0x80 | (d << 3) | d);
            }
        }
        a.emit_u32(imm);
    }

    fn add_word_to_reg(&mut self, a: &mut CodeArena, reg: Reg, addr: u64, dword: bool) {
        self.mov_r10_imm(a, addr);
        if !dword {
            a.emit_u8(0x66);
        }
        a.emit_u8(0x41);
        a.emit_u8(0x03);
        a.emit_u8(Self::modrm_r10(rnum(reg)));
    }

    fn mov_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool) {
        self.mov_r10_imm(a, addr);
        if !dword {
            a.emit_u8(0x66);
        }
        a.emit_u8(0x41);
        a.emit_u8(0xC7);
        a.emit_u8(Self::modrm_r10(0));
        if dword {
            a.emit_u32(imm);
        } else {
            a.emit_u16(imm as u16);
        }
    }

    fn add_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool) {
        self.mov_r10_imm(a, addr);
        if !dword {
            a.emit_u8(0x66);
        }
        a.emit_u8(0x41);
        a.emit_u8(0x81);
        a.emit_u8(Self::modrm_r10(0));
        if dword {
            a.emit_u32(imm);
        } else {
            a.emit_u16(imm as u16);
        }
    }

    fn sub_direct_word(&mut self, a: &mut CodeArena, addr: u64, imm: u32, dword: bool) {
        self.mov_r10_imm(a, addr);
        if !dword {
            a.emit_u8(0x66);
        }
        a.emit_u8(0x41);
        a.emit_u8(0x81);
        a.emit_u8(Self::modrm_r10(5));
        if dword {
            a.emit_u32(imm);
        } else {
            a.emit_u16(imm as u16);
        }
    }

    fn load_param_imm(&mut self, a: &mut CodeArena, nr: usize, imm: u64) {
        let p = pnum(nr);
        if imm <= u32::MAX as u64 {
            // 32-bit mov zero-extends.
            a.emit_u8(0xB8 + p);
            a.emit_u32(imm as u32);
        } else {
            a.emit_u8(0x48);
            a.emit_u8(0xB8 + p);
            a.emit_u64(imm);
        }
    }

    fn load_param_reg(&mut self, a: &mut CodeArena, nr: usize, reg: Reg) {
        let p = pnum(nr);
        let r = rnum(reg);
        if p == r {
            return;
        }
        a.emit_u8(0x89);
        a.emit_u8(0xC0 | (r << 3) | p);
    }

    fn load_param_mem(&mut self, a: &mut CodeArena, nr: usize, addr: u64) {
        self.mov_r10_imm(a, addr);
        a.emit_u8(0x41);
        a.emit_u8(0x8B);
        a.emit_u8(Self::modrm_r10(pnum(nr)));
    }

    fn load_param_env(&mut self, a: &mut CodeArena, nr: usize) {
        // mov p, rbp
        a.emit_u8(0x48);
        a.emit_u8(0x89);
        a.emit_u8(0xC0 | (5 << 3) | pnum(nr));
    }

    fn call(&mut self, a: &mut CodeArena, fct: u64) -> usize {
        let site = a.offset();
        a.emit_u8(0x48); // movabs rax, fct
        a.emit_u8(0xB8);
        a.emit_u64(fct);
        a.emit_u8(0xFF); // call rax
        a.emit_u8(0xD0);
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

        // Inline replacements compute into eax from esi/edx, exactly what
        // the simple operator would return. Sequences are NOP-padded to
        // the fixed call-site size.
        let inline: Option<&[u8]> = match kind {
            AddB | AddW | AddD => Some(&[0x8D, 0x04, 0x16]), // lea eax,[rsi+rdx]
            OrB | OrW | OrD => Some(&[0x89, 0xF0, 0x09, 0xD0]), // mov eax,esi; or eax,edx
            AndB | AndW | AndD => Some(&[0x89, 0xF0, 0x21, 0xD0]),
            SubB | SubW | SubD => Some(&[0x89, 0xF0, 0x29, 0xD0]),
            XorB | XorW | XorD => Some(&[0x89, 0xF0, 0x31, 0xD0]),
            // Result unused once flags are dead.
            CmpB | CmpW | CmpD | TestB | TestW | TestD => Some(&[]),
            IncB | IncW | IncD => Some(&[0x8D, 0x46, 0x01]), // lea eax,[rsi+1]
            DecB | DecW | DecD => Some(&[0x8D, 0x46, 0xFF]), // lea eax,[rsi-1]
            NegB | NegW | NegD => Some(&[0x89, 0xF0, 0xF7, 0xD8]), // mov eax,esi; neg eax
            _ => None,
        };

        match inline {
            Some(seq) => {
                debug_assert!(seq.len() <= CALL_SITE_LEN);
                let mut off = site;
                for &b in seq {
                    a.patch_u8(off, b);
                    off += 1;
                }
                while off < site + CALL_SITE_LEN {
                    a.patch_u8(off, NOP);
                    off += 1;
                }
            }
            None => {
                // Keep the movabs/call shape, swap in the flags-free twin.
                a.patch_u32(site + 2, simple_fct as u32);
                a.patch_u32(site + 6, (simple_fct >> 32) as u32);
            }
        }
    }

    fn branch_on_zero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch {
        self.test_reg(a, reg, dword);
        a.emit_u8(0x74);
        let pos = a.offset();
        a.emit_u8(0);
        BranchPatch {
            pos,
            kind: PatchKind::Rel8,
        }
    }

    fn branch_on_nonzero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch {
        self.test_reg(a, reg, dword);
        a.emit_u8(0x75);
        let pos = a.offset();
        a.emit_u8(0);
        BranchPatch {
            pos,
            kind: PatchKind::Rel8,
        }
    }

    fn fill_branch(&mut self, a: &mut CodeArena, patch: BranchPatch) {
        assert_eq!(patch.kind, PatchKind::Rel8);
        let disp = a.offset() as i64 - (patch.pos as i64 + 1);
        assert!(
            (i8::MIN as i64..=i8::MAX as i64).contains(&disp),
            "short branch out of range"
        );
        a.patch_u8(patch.pos, disp as i8 as u8);
    }

    fn branch_long_nonzero(&mut self, a: &mut CodeArena, reg: Reg, dword: bool) -> BranchPatch {
        self.test_reg(a, reg, dword);
        a.emit_u8(0x0F);
        a.emit_u8(0x85);
        let pos = a.offset();
        a.emit_u32(0);
        BranchPatch {
            pos,
            kind: PatchKind::Rel32,
        }
    }

    fn branch_long_leqzero(&mut self, a: &mut CodeArena, reg: Reg) -> BranchPatch {
        // After test, jle takes res <= 0 signed.
        self.test_reg(a, reg, true);
        a.emit_u8(0x0F);
        a.emit_u8(0x8E);
        let pos = a.offset();
        a.emit_u32(0);
        BranchPatch {
            pos,
            kind: PatchKind::Rel32,
        }
    }

    fn fill_branch_long(&mut self, a: &mut CodeArena, patch: BranchPatch) {
        assert_eq!(patch.kind, PatchKind::Rel32);
        let disp = a.offset() as i64 - (patch.pos as i64 + 4);
        a.patch_u32(patch.pos, disp as i32 as u32);
    }

    fn jmp_ptr(&mut self, a: &mut CodeArena, cell_addr: u64) {
        self.mov_r10_imm(a, cell_addr);
        a.emit_u8(0x41); // jmp [r10]
        a.emit_u8(0xFF);
        a.emit_u8(0x22);
    }

    fn return_imm(&mut self, a: &mut CodeArena, code: BlockReturn) {
        a.emit_u8(0xB8); // mov eax, code
        a.emit_u32(code as u32);
        self.epilogue(a);
    }

    fn return_retop(&mut self, a: &mut CodeArena) {
        self.epilogue(a);
    }

    fn run_code(&mut self, a: &mut CodeArena) -> usize {
        a.align_to(16);
        let off = a.offset();
        // Three pushes leave rsp 16-byte aligned for in-block calls.
        a.emit_u8(0x55); // push rbp
        a.emit_u8(0x53); // push rbx
        a.emit_u8(0x41); // push r12
        a.emit_u8(0x54);
        a.emit_u8(0x48); // mov rbp, rdi
        a.emit_u8(0x89);
        a.emit_u8(0xFD);
        a.emit_u8(0xFF); // jmp rsi
        a.emit_u8(0xE6);
        off
    }

    fn block_closing(&self, _a: &CodeArena, _start: usize, _len: usize) {
        // x86 keeps instruction and data caches coherent.
    }
}
