//! Opcode dispatch: one guest instruction per call, emitted through the
//! backend vocabulary.
//!
//! Anything outside the table closes the block at the current
//! instruction and hands it to the interpreter, so coverage here is a
//! performance decision, never a correctness one.

use drc_backend::Reg;
use drc_core::ret::BlockReturn;
use drc_core::state::{CS, DS, EAX, ECX, EDX, ES, FS, GS, SS};
use drc_core::{helpers, ops, FlagKind};

use crate::ctx::{DResult, Imm, Prefix, SaveKind, SaveRec, Step, TransContext, Width};
use crate::emit::{
    alu_kind, dsh_fns, fnp, inc_dec_kind, neg_kind, pop_fn, push_fn, test_kind,
};
use crate::modrm::Mods;

/// Count operand of the shift group.
enum ShiftCount {
    One,
    Imm,
    Cl,
}

impl TransContext<'_> {
    pub(crate) fn dispatch(&mut self) -> DResult<Step> {
        let op = self.fetchb()?;
        match op {
            // -- Prefixes --
            0x26 => self.seg_override(ES),
            0x2e => self.seg_override(CS),
            0x36 => self.seg_override(SS),
            0x3e => self.seg_override(DS),
            0x64 => self.seg_override(FS),
            0x65 => self.seg_override(GS),
            0x66 => self.toggle(Prefix::BIG_OP),
            0x67 => self.toggle(Prefix::BIG_ADDR),
            0xf0 => Ok(Step::Restart),
            0xf2 => self.toggle(Prefix::REP_NZ),
            0xf3 => self.toggle(Prefix::REP),

            // -- The ALU grid --
            op if op < 0x40 && op & 7 < 6 => self.alu_grid(op),

            0x06 => self.push_seg(ES),
            0x0e => self.push_seg(CS),
            0x16 => self.push_seg(SS),
            0x1e => self.push_seg(DS),
            0x07 => self.pop_seg(ES),
            0x17 => self.pop_seg(SS),
            0x1f => self.pop_seg(DS),

            0x0f => self.dispatch_0f(),

            0x40..=0x47 => self.inc_dec_reg(op as usize & 7, true),
            0x48..=0x4f => self.inc_dec_reg(op as usize & 7, false),
            0x50..=0x57 => self.push_reg(op as usize & 7),
            0x58..=0x5f => self.pop_reg(op as usize & 7),

            0x68 => {
                let wd = Width::v(self.big_op());
                let imm = self.fetchv(wd)?;
                self.push_imm(imm)
            }
            0x6a => {
                let imm = self.fetchb()? as i8 as i32 as u32;
                self.push_imm(imm)
            }
            0x69 => self.imul_imm(false),
            0x6b => self.imul_imm(true),

            0x70..=0x7f => {
                let rel = self.fetchb()? as i8 as i32;
                self.jcc(op as u32 & 0xf, rel)
            }

            0x80 | 0x82 => self.grp1(Width::B, false),
            0x81 => self.grp1(Width::v(self.big_op()), false),
            0x83 => self.grp1(Width::v(self.big_op()), true),
            0x84 => self.test_rm(Width::B),
            0x85 => self.test_rm(Width::v(self.big_op())),
            0x86 => self.xchg_rm(Width::B),
            0x87 => self.xchg_rm(Width::v(self.big_op())),
            0x88..=0x8b => self.mov_grid(op),
            0x8c => self.mov_rm_seg(),
            0x8d => self.lea_insn(),
            0x8e => self.mov_seg_rm(),
            0x8f => self.pop_rm(),

            0x90 => Ok(Step::Continue),
            0x91..=0x97 => self.xchg_ax(op as usize & 7),
            0x98 => self.cbw(),
            0x99 => self.cwd(),
            0x9a => self.call_far_imm(),
            0x9c => self.pushf_insn(),
            0x9d => self.popf_insn(),

            0xa0..=0xa3 => self.mov_moffs(op),
            0xa4 | 0xa5 | 0xaa | 0xab | 0xac | 0xad => self.string_insn(op),
            0xa8 => self.test_acc_imm(Width::B),
            0xa9 => self.test_acc_imm(Width::v(self.big_op())),

            0xb0..=0xb7 => self.mov_r8_imm(op as usize & 7),
            0xb8..=0xbf => self.mov_rv_imm(op as usize & 7),

            0xc0 => self.shift_rm(Width::B, ShiftCount::Imm),
            0xc1 => self.shift_rm(Width::v(self.big_op()), ShiftCount::Imm),
            0xc2 => self.ret_insn(true, fnp!(helpers::ret_near), BlockReturn::Normal),
            0xc3 => self.ret_insn(false, fnp!(helpers::ret_near), BlockReturn::Normal),
            0xc6 => self.mov_rm_imm(Width::B),
            0xc7 => self.mov_rm_imm(Width::v(self.big_op())),
            0xca => self.ret_insn(true, fnp!(helpers::ret_far), BlockReturn::Normal),
            0xcb => self.ret_insn(false, fnp!(helpers::ret_far), BlockReturn::Normal),
            0xcd => self.int_imm(),
            0xcf => self.iret_insn(),

            0xd0 => self.shift_rm(Width::B, ShiftCount::One),
            0xd1 => self.shift_rm(Width::v(self.big_op()), ShiftCount::One),
            0xd2 => self.shift_rm(Width::B, ShiftCount::Cl),
            0xd3 => self.shift_rm(Width::v(self.big_op()), ShiftCount::Cl),

            0xe0..=0xe3 => self.loop_insn(op),
            0xe8 => self.call_rel(),
            0xe9 => {
                let big = self.big_op();
                let rel = if big {
                    self.fetchd()? as i32
                } else {
                    self.fetchw()? as i16 as i32
                };
                self.jmp_rel(rel)
            }
            0xea => self.jmp_far_imm(),
            0xeb => {
                let rel = self.fetchb()? as i8 as i32;
                self.jmp_rel(rel)
            }

            0xf5 => self.carry_insn(helpers::CARRY_CMC),
            0xf8 => self.carry_insn(helpers::CARRY_CLC),
            0xf9 => self.carry_insn(helpers::CARRY_STC),
            0xf6 => self.grp3(Width::B),
            0xf7 => self.grp3(Width::v(self.big_op())),
            0xfc => self.direction_insn(0),
            0xfd => self.direction_insn(1),
            0xfe => self.grp4(),
            0xff => self.grp5(),

            _ => self.unhandled(),
        }
    }

    fn dispatch_0f(&mut self) -> DResult<Step> {
        let op = self.fetchb()?;
        match op {
            0x80..=0x8f => {
                let rel = if self.big_op() {
                    self.fetchd()? as i32
                } else {
                    self.fetchw()? as i16 as i32
                };
                self.jcc(op as u32 & 0xf, rel)
            }
            0x90..=0x9f => self.setcc(op as u32 & 0xf),
            0xa0 => self.push_seg(FS),
            0xa1 => self.pop_seg(FS),
            0xa8 => self.push_seg(GS),
            0xa9 => self.pop_seg(GS),
            0xa4 => self.dshift(true, ShiftCount::Imm),
            0xa5 => self.dshift(true, ShiftCount::Cl),
            0xac => self.dshift(false, ShiftCount::Imm),
            0xad => self.dshift(false, ShiftCount::Cl),
            0xaf => self.imul_gv_ev(),
            0xb6 => self.movx(Width::B, false),
            0xb7 => self.movx(Width::W, false),
            0xbe => self.movx(Width::B, true),
            0xbf => self.movx(Width::W, true),
            _ => self.unhandled(),
        }
    }

    // -- Prefix handling --

    fn seg_override(&mut self, seg: usize) -> DResult<Step> {
        self.seg_prefix = Some(seg);
        Ok(Step::Restart)
    }

    fn toggle(&mut self, p: Prefix) -> DResult<Step> {
        self.prefix.insert(p);
        Ok(Step::Restart)
    }

    /// Close at the current instruction and defer it to the
    /// interpreter.
    fn unhandled(&mut self) -> DResult<Step> {
        // The interpreter charges this instruction itself.
        self.cycles -= 1;
        self.close_opcode();
        Ok(Step::Closed)
    }

    // -- Operand plumbing --

    /// Load the r/m operand into `Op1`; a memory form leaves its address
    /// in `Addr` for the write-back.
    fn rm_load(&mut self, m: Mods, wd: Width) -> DResult<()> {
        if m.is_reg() {
            self.load_guest_reg(Reg::Op1, m.rm, wd);
        } else {
            self.fill_ea(m, true)?;
            self.read_mem(wd, Reg::Op1);
        }
        Ok(())
    }

    fn rm_store_retop(&mut self, m: Mods, wd: Width) {
        if m.is_reg() {
            self.store_guest_reg(Reg::RetOp, m.rm, wd);
        } else {
            self.write_mem(wd, Reg::RetOp);
        }
    }

    /// Stage an instruction immediate into `dst`, captured by pointer
    /// when the bytes are cold.
    fn load_imm_operand(&mut self, dst: Reg, wd: Width) -> DResult<()> {
        match self.fetchv_imm(wd)? {
            Imm::Val(v) => {
                let (g, a) = self.ga();
                g.mov_reg_imm(a, dst, v);
            }
            Imm::Ptr(p) => {
                let (g, a) = self.ga();
                match wd {
                    Width::B => {
                        g.mov_byte_to_reg_low(a, dst, p);
                        g.extend_byte(a, false, dst);
                    }
                    Width::W => {
                        g.mov_word_to_reg(a, dst, p, false);
                        g.extend_word(a, false, dst);
                    }
                    Width::D => g.mov_word_to_reg(a, dst, p, true),
                }
            }
        }
        Ok(())
    }

    // -- ALU --

    fn alu_grid(&mut self, op: u8) -> DResult<Step> {
        let c = (op >> 3) as usize & 7;
        let wd = if op & 1 == 0 {
            Width::B
        } else {
            Width::v(self.big_op())
        };
        match op & 7 {
            0 | 1 => self.alu_rm_reg(c, wd, true),
            2 | 3 => self.alu_rm_reg(c, wd, false),
            _ => self.alu_acc_imm(c, wd),
        }
    }

    fn alu_rm_reg(&mut self, c: usize, wd: Width, dest_rm: bool) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        let kind = alu_kind(c, wd);
        let store = c != 7;
        if m.is_reg() {
            let (dst, src) = if dest_rm { (m.rm, m.reg) } else { (m.reg, m.rm) };
            self.load_guest_reg(Reg::Op1, dst, wd);
            self.load_guest_reg(Reg::Op2, src, wd);
            self.gencall_alu(kind);
            if store {
                self.store_guest_reg(Reg::RetOp, dst, wd);
            }
        } else {
            self.fill_ea(m, true)?;
            if dest_rm {
                self.read_mem(wd, Reg::Op1);
                self.load_guest_reg(Reg::Op2, m.reg, wd);
                self.gencall_alu(kind);
                if store {
                    self.write_mem(wd, Reg::RetOp);
                }
            } else {
                self.read_mem(wd, Reg::Op2);
                self.load_guest_reg(Reg::Op1, m.reg, wd);
                self.gencall_alu(kind);
                if store {
                    self.store_guest_reg(Reg::RetOp, m.reg, wd);
                }
            }
        }
        Ok(Step::Continue)
    }

    fn alu_acc_imm(&mut self, c: usize, wd: Width) -> DResult<Step> {
        let imm = self.fetchv(wd)?;
        self.load_guest_reg(Reg::Op1, EAX, wd);
        {
            let (g, a) = self.ga();
            g.mov_reg_imm(a, Reg::Op2, imm);
        }
        self.gencall_alu(alu_kind(c, wd));
        if c != 7 {
            self.store_guest_reg(Reg::RetOp, EAX, wd);
        }
        Ok(Step::Continue)
    }

    fn grp1(&mut self, wd: Width, sign_extend_byte: bool) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        let kind = alu_kind(m.reg, wd);
        let store = m.reg != 7;
        self.rm_load(m, wd)?;
        if sign_extend_byte {
            let imm = self.fetchb()? as i8 as i32 as u32;
            let (g, a) = self.ga();
            g.mov_reg_imm(a, Reg::Op2, imm);
        } else {
            self.load_imm_operand(Reg::Op2, wd)?;
        }
        self.gencall_alu(kind);
        if store {
            self.rm_store_retop(m, wd);
        }
        Ok(Step::Continue)
    }

    fn test_rm(&mut self, wd: Width) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        self.rm_load(m, wd)?;
        self.load_guest_reg(Reg::Op2, m.reg, wd);
        self.gencall_alu(test_kind(wd));
        Ok(Step::Continue)
    }

    fn test_acc_imm(&mut self, wd: Width) -> DResult<Step> {
        let imm = self.fetchv(wd)?;
        self.load_guest_reg(Reg::Op1, EAX, wd);
        {
            let (g, a) = self.ga();
            g.mov_reg_imm(a, Reg::Op2, imm);
        }
        self.gencall_alu(test_kind(wd));
        Ok(Step::Continue)
    }

    fn inc_dec_reg(&mut self, r: usize, inc: bool) -> DResult<Step> {
        let wd = Width::v(self.big_op());
        self.load_guest_reg(Reg::Op1, r, wd);
        self.gencall_unop(inc_dec_kind(inc, wd));
        self.store_guest_reg(Reg::RetOp, r, wd);
        Ok(Step::Continue)
    }

    // -- Stack --

    fn push_reg(&mut self, r: usize) -> DResult<Step> {
        let big = self.big_op();
        let addr = self.env.addr_of_reg(r);
        {
            let (g, a) = self.ga();
            g.load_param_mem(a, 1, addr);
            g.load_param_env(a, 0);
            g.call(a, push_fn(big));
        }
        self.exception_check();
        Ok(Step::Continue)
    }

    fn push_imm(&mut self, imm: u32) -> DResult<Step> {
        let big = self.big_op();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 1, imm as u64);
            g.load_param_env(a, 0);
            g.call(a, push_fn(big));
        }
        self.exception_check();
        Ok(Step::Continue)
    }

    /// Pop into `readdata`; the caller moves the value on.
    fn call_pop(&mut self) {
        let big = self.big_op();
        {
            let (g, a) = self.ga();
            g.load_param_env(a, 0);
            g.call(a, pop_fn(big));
        }
        self.exception_check();
    }

    fn pop_reg(&mut self, r: usize) -> DResult<Step> {
        let wd = Width::v(self.big_op());
        self.call_pop();
        let rd = self.env.addr_of_readdata();
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op1, rd, true);
        }
        self.store_guest_reg(Reg::Op1, r, wd);
        Ok(Step::Continue)
    }

    fn pop_rm(&mut self) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        if m.reg != 0 {
            return self.unhandled();
        }
        if m.is_reg() {
            return self.pop_reg(m.rm);
        }
        let wd = Width::v(self.big_op());
        self.call_pop();
        self.fill_ea(m, true)?;
        let rd = self.env.addr_of_readdata();
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op1, rd, true);
        }
        self.write_mem(wd, Reg::Op1);
        Ok(Step::Continue)
    }

    fn push_seg(&mut self, seg: usize) -> DResult<Step> {
        let big = self.big_op();
        let sv = self.env.addr_of_seg_val(seg);
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op1, sv, false);
            g.extend_word(a, false, Reg::Op1);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, push_fn(big));
        }
        self.exception_check();
        Ok(Step::Continue)
    }

    fn pop_seg(&mut self, seg: usize) -> DResult<Step> {
        self.call_pop();
        let rd = self.env.addr_of_readdata();
        {
            let (g, a) = self.ga();
            g.load_param_mem(a, 2, rd);
            g.load_param_imm(a, 1, seg as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::set_seg));
        }
        // Segment state changed; end the block here.
        self.eip_advance(self.code.wrapping_sub(self.code_start));
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    // -- Moves --

    fn mov_grid(&mut self, op: u8) -> DResult<Step> {
        let wd = if op & 1 == 0 {
            Width::B
        } else {
            Width::v(self.big_op())
        };
        let to_reg = op & 2 != 0;
        let m = self.fetch_modrm()?;
        if m.is_reg() {
            let (dst, src) = if to_reg { (m.reg, m.rm) } else { (m.rm, m.reg) };
            self.load_guest_reg(Reg::Op1, src, wd);
            self.store_guest_reg(Reg::Op1, dst, wd);
        } else {
            self.fill_ea(m, true)?;
            if to_reg {
                self.read_mem(wd, Reg::Op1);
                self.store_guest_reg(Reg::Op1, m.reg, wd);
            } else {
                self.load_guest_reg(Reg::Op1, m.reg, wd);
                self.write_mem(wd, Reg::Op1);
            }
        }
        Ok(Step::Continue)
    }

    fn mov_r8_imm(&mut self, r: usize) -> DResult<Step> {
        let r8 = self.env.addr_of_reg8(r);
        match self.fetchb_imm()? {
            Imm::Val(v) => {
                let (g, a) = self.ga();
                g.mov_reg_imm(a, Reg::Op1, v);
                g.mov_byte_from_reg_low(a, Reg::Op1, r8);
            }
            Imm::Ptr(p) => {
                let (g, a) = self.ga();
                g.mov_byte_to_reg_low(a, Reg::Op1, p);
                g.mov_byte_from_reg_low(a, Reg::Op1, r8);
            }
        }
        Ok(Step::Continue)
    }

    fn mov_rv_imm(&mut self, r: usize) -> DResult<Step> {
        let wd = Width::v(self.big_op());
        let addr = self.env.addr_of_reg(r);
        match self.fetchv_imm(wd)? {
            Imm::Val(v) => {
                let (g, a) = self.ga();
                g.mov_direct_word(a, addr, v, wd.dword());
            }
            Imm::Ptr(p) => {
                let (g, a) = self.ga();
                g.mov_word_to_reg(a, Reg::Op1, p, wd.dword());
                g.mov_word_from_reg(a, Reg::Op1, addr, wd.dword());
            }
        }
        Ok(Step::Continue)
    }

    fn mov_rm_imm(&mut self, wd: Width) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        if m.reg != 0 {
            return self.unhandled();
        }
        if m.is_reg() {
            return match wd {
                Width::B => self.mov_r8_imm(m.rm),
                _ => self.mov_rv_imm(m.rm),
            };
        }
        self.fill_ea(m, true)?;
        self.load_imm_operand(Reg::Op1, wd)?;
        self.write_mem(wd, Reg::Op1);
        Ok(Step::Continue)
    }

    fn mov_rm_seg(&mut self) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        if m.reg > GS {
            return self.unhandled();
        }
        let sv = self.env.addr_of_seg_val(m.reg);
        if m.is_reg() {
            let big = self.big_op();
            let dst = self.env.addr_of_reg(m.rm);
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op1, sv, false);
            if big {
                g.extend_word(a, false, Reg::Op1);
                g.mov_word_from_reg(a, Reg::Op1, dst, true);
            } else {
                g.mov_word_from_reg(a, Reg::Op1, dst, false);
            }
        } else {
            self.fill_ea(m, true)?;
            {
                let (g, a) = self.ga();
                g.mov_word_to_reg(a, Reg::Op1, sv, false);
            }
            self.write_mem(Width::W, Reg::Op1);
        }
        Ok(Step::Continue)
    }

    fn mov_seg_rm(&mut self) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        if m.reg == CS || m.reg > GS {
            return self.unhandled();
        }
        if m.is_reg() {
            let src = self.env.addr_of_reg(m.rm);
            let (g, a) = self.ga();
            g.load_param_mem(a, 2, src);
            g.load_param_imm(a, 1, m.reg as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::set_seg));
        } else {
            self.fill_ea(m, true)?;
            self.read_mem(Width::W, Reg::Op1);
            let rd = self.env.addr_of_readdata();
            let (g, a) = self.ga();
            g.load_param_mem(a, 2, rd);
            g.load_param_imm(a, 1, m.reg as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::set_seg));
        }
        self.eip_advance(self.code.wrapping_sub(self.code_start));
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    fn lea_insn(&mut self) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        if m.is_reg() {
            return self.unhandled();
        }
        let wd = Width::v(self.big_op());
        self.fill_ea(m, false)?;
        self.store_guest_reg(Reg::Addr, m.reg, wd);
        Ok(Step::Continue)
    }

    fn mov_moffs(&mut self, op: u8) -> DResult<Step> {
        let wd = if op & 1 == 0 {
            Width::B
        } else {
            Width::v(self.big_op())
        };
        let to_mem = op & 2 != 0;
        let disp = if self.big_addr() {
            self.fetchd()?
        } else {
            self.fetchw()? as u32
        };
        let seg = self.env.addr_of_seg_phys(self.seg_or(DS));
        {
            let (g, a) = self.ga();
            g.mov_reg_imm(a, Reg::Addr, disp);
            g.add_word_to_reg(a, Reg::Addr, seg, true);
        }
        if to_mem {
            self.load_guest_reg(Reg::Op1, EAX, wd);
            self.write_mem(wd, Reg::Op1);
        } else {
            self.read_mem(wd, Reg::Op1);
            self.store_guest_reg(Reg::Op1, EAX, wd);
        }
        Ok(Step::Continue)
    }

    // -- Exchanges and extensions --

    fn xchg_rm(&mut self, wd: Width) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        if m.is_reg() {
            self.load_guest_reg(Reg::Op1, m.rm, wd);
            self.load_guest_reg(Reg::Op2, m.reg, wd);
            self.store_guest_reg(Reg::Op1, m.reg, wd);
            self.store_guest_reg(Reg::Op2, m.rm, wd);
        } else {
            self.fill_ea(m, true)?;
            self.read_mem(wd, Reg::Op1);
            self.load_guest_reg(Reg::Op2, m.reg, wd);
            self.store_guest_reg(Reg::Op1, m.reg, wd);
            self.write_mem(wd, Reg::Op2);
        }
        Ok(Step::Continue)
    }

    fn xchg_ax(&mut self, r: usize) -> DResult<Step> {
        let wd = Width::v(self.big_op());
        self.load_guest_reg(Reg::Op1, EAX, wd);
        self.load_guest_reg(Reg::Op2, r, wd);
        self.store_guest_reg(Reg::Op1, r, wd);
        self.store_guest_reg(Reg::Op2, EAX, wd);
        Ok(Step::Continue)
    }

    fn cbw(&mut self) -> DResult<Step> {
        let eax = self.env.addr_of_reg(EAX);
        let al = self.env.addr_of_reg8(0);
        let big = self.big_op();
        let (g, a) = self.ga();
        if big {
            g.mov_word_to_reg(a, Reg::Op1, eax, false);
            g.extend_word(a, true, Reg::Op1);
            g.mov_word_from_reg(a, Reg::Op1, eax, true);
        } else {
            g.mov_byte_to_reg_low(a, Reg::Op1, al);
            g.extend_byte(a, true, Reg::Op1);
            g.mov_word_from_reg(a, Reg::Op1, eax, false);
        }
        Ok(Step::Continue)
    }

    fn cwd(&mut self) -> DResult<Step> {
        let eax = self.env.addr_of_reg(EAX);
        let edx = self.env.addr_of_reg(EDX);
        let big = self.big_op();
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op1, eax, big);
            if !big {
                g.extend_word(a, true, Reg::Op1);
            }
            // Arithmetic shift by 31 spreads the sign across the word.
            g.load_param_imm(a, 2, 31);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, fnp!(ops::sar_d_simple));
            g.mov_word_from_reg(a, Reg::RetOp, edx, big);
        }
        Ok(Step::Continue)
    }

    fn movx(&mut self, src: Width, sign: bool) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        let wd = Width::v(self.big_op());
        if m.is_reg() {
            self.load_guest_reg(Reg::Op1, m.rm, src);
        } else {
            self.fill_ea(m, true)?;
            self.read_mem(src, Reg::Op1);
        }
        {
            let (g, a) = self.ga();
            match src {
                Width::B => g.extend_byte(a, sign, Reg::Op1),
                _ => g.extend_word(a, sign, Reg::Op1),
            }
        }
        self.store_guest_reg(Reg::Op1, m.reg, wd);
        Ok(Step::Continue)
    }

    // -- Shifts --

    fn shift_rm(&mut self, wd: Width, count: ShiftCount) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        self.rm_load(m, wd)?;
        let imm = match count {
            ShiftCount::Imm => Some(self.fetchb()? as u32),
            _ => None,
        };
        match count {
            ShiftCount::One => {
                let (g, a) = self.ga();
                g.load_param_imm(a, 2, 1);
            }
            ShiftCount::Imm => {
                let (g, a) = self.ga();
                g.load_param_imm(a, 2, imm.unwrap() as u64);
            }
            ShiftCount::Cl => {
                let cl = self.env.addr_of_reg8(ECX);
                let (g, a) = self.ga();
                g.mov_byte_to_reg_low(a, Reg::Op2, cl);
                g.extend_byte(a, false, Reg::Op2);
                g.load_param_reg(a, 2, Reg::Op2);
            }
        }
        match m.reg {
            2 | 3 => {
                // RCL/RCR read and rewrite the carry; no flags-free twin.
                self.flagopt.acquire();
                let f = rc_fn(m.reg == 2, wd);
                let (g, a) = self.ga();
                g.load_param_reg(a, 1, Reg::Op1);
                g.load_param_env(a, 0);
                g.call(a, f);
            }
            c => {
                let Some(kind) = shift_kind_of(c, wd) else {
                    return self.unhandled();
                };
                self.gencall_shift(kind);
            }
        }
        self.rm_store_retop(m, wd);
        Ok(Step::Continue)
    }

    fn dshift(&mut self, left: bool, count: ShiftCount) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        let wd = Width::v(self.big_op());
        self.rm_load(m, wd)?;
        self.load_guest_reg(Reg::Op2, m.reg, wd);
        match count {
            ShiftCount::Cl => {
                let cl = self.env.addr_of_reg8(ECX);
                let (g, a) = self.ga();
                g.mov_byte_to_reg_low(a, Reg::Op3, cl);
                g.extend_byte(a, false, Reg::Op3);
                g.load_param_reg(a, 3, Reg::Op3);
            }
            _ => {
                let imm = self.fetchb()? as u64;
                let (g, a) = self.ga();
                g.load_param_imm(a, 3, imm);
            }
        }
        let kind = match (left, wd) {
            (true, Width::D) => FlagKind::DshlD,
            (true, _) => FlagKind::DshlW,
            (false, Width::D) => FlagKind::DshrD,
            (false, _) => FlagKind::DshrW,
        };
        let (full, simple) = dsh_fns(kind);
        let site = {
            let (g, a) = self.ga();
            g.load_param_reg(a, 2, Reg::Op2);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, full)
        };
        self.flagopt.push(site, simple, kind);
        self.rm_store_retop(m, wd);
        Ok(Step::Continue)
    }

    // -- Multiplies --

    fn imul_gv_ev(&mut self) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        let wd = Width::v(self.big_op());
        if m.is_reg() {
            self.load_guest_reg(Reg::Op2, m.rm, wd);
        } else {
            self.fill_ea(m, true)?;
            self.read_mem(wd, Reg::Op2);
        }
        self.load_guest_reg(Reg::Op1, m.reg, wd);
        self.flag_invalidate_all();
        {
            let (g, a) = self.ga();
            g.load_param_reg(a, 2, Reg::Op2);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, imul_reg_fn(wd));
        }
        self.store_guest_reg(Reg::RetOp, m.reg, wd);
        Ok(Step::Continue)
    }

    fn imul_imm(&mut self, byte_imm: bool) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        let wd = Width::v(self.big_op());
        if m.is_reg() {
            self.load_guest_reg(Reg::Op1, m.rm, wd);
        } else {
            self.fill_ea(m, true)?;
            self.read_mem(wd, Reg::Op1);
        }
        let imm = if byte_imm {
            self.fetchb()? as i8 as i32 as u32
        } else {
            self.fetchv(wd)?
        };
        self.flag_invalidate_all();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 2, imm as u64);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, imul_reg_fn(wd));
        }
        self.store_guest_reg(Reg::RetOp, m.reg, wd);
        Ok(Step::Continue)
    }

    // -- Groups 3, 4, 5 --

    fn grp3(&mut self, wd: Width) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        match m.reg {
            0 | 1 => {
                self.rm_load(m, wd)?;
                self.load_imm_operand(Reg::Op2, wd)?;
                self.gencall_alu(test_kind(wd));
            }
            2 => {
                self.rm_load(m, wd)?;
                {
                    let (g, a) = self.ga();
                    g.load_param_reg(a, 1, Reg::Op1);
                    g.load_param_env(a, 0);
                    g.call(a, not_fn(wd));
                }
                self.rm_store_retop(m, wd);
            }
            3 => {
                self.rm_load(m, wd)?;
                self.gencall_unop(neg_kind(wd));
                self.rm_store_retop(m, wd);
            }
            4 | 5 => {
                self.rm_load(m, wd)?;
                self.flag_invalidate_all();
                let f = mul_fn(m.reg == 5, wd);
                let (g, a) = self.ga();
                g.load_param_reg(a, 1, Reg::Op1);
                g.load_param_env(a, 0);
                g.call(a, f);
            }
            _ => {
                self.rm_load(m, wd)?;
                self.flag_invalidate_all();
                let f = div_fn(m.reg == 7, wd);
                {
                    let (g, a) = self.ga();
                    g.load_param_reg(a, 1, Reg::Op1);
                    g.load_param_env(a, 0);
                    g.call(a, f);
                }
                self.exception_check();
            }
        }
        Ok(Step::Continue)
    }

    fn grp4(&mut self) -> DResult<Step> {
        let raw = self.fetchb()?;
        if raw == 0x38 {
            // FE /7 with a register operand encodes an embedder
            // callback; the identifier follows inline.
            let id = self.fetchw()? as u32;
            self.eip_advance(self.code.wrapping_sub(self.code_start));
            let cb = self.env.addr_of_callback();
            {
                let (g, a) = self.ga();
                g.mov_direct_word(a, cb, id, true);
            }
            self.close_return(BlockReturn::CallBack);
            return Ok(Step::Closed);
        }
        let m = Mods::from(raw);
        match m.reg {
            0 | 1 => {
                self.rm_load(m, Width::B)?;
                self.gencall_unop(inc_dec_kind(m.reg == 0, Width::B));
                self.rm_store_retop(m, Width::B);
                Ok(Step::Continue)
            }
            _ => self.unhandled(),
        }
    }

    fn grp5(&mut self) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        let wd = Width::v(self.big_op());
        match m.reg {
            0 | 1 => {
                self.rm_load(m, wd)?;
                self.gencall_unop(inc_dec_kind(m.reg == 0, wd));
                self.rm_store_retop(m, wd);
                Ok(Step::Continue)
            }
            2 => self.call_near_rm(m, wd),
            4 => self.jmp_near_rm(m, wd),
            6 => {
                self.rm_load(m, wd)?;
                let big = self.big_op();
                {
                    let (g, a) = self.ga();
                    g.load_param_reg(a, 1, Reg::Op1);
                    g.load_param_env(a, 0);
                    g.call(a, push_fn(big));
                }
                self.exception_check();
                Ok(Step::Continue)
            }
            _ => self.unhandled(),
        }
    }

    fn call_near_rm(&mut self, m: Mods, wd: Width) -> DResult<Step> {
        let big = self.big_op();
        // Target into Addr so it survives the push.
        self.rm_load(m, wd)?;
        {
            let (g, a) = self.ga();
            g.mov_regs(a, Reg::Addr, Reg::Op1);
        }
        let delta = self.code.wrapping_sub(self.code_start);
        let eip = self.env.addr_of_eip();
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op1, eip, true);
            g.add_imm(a, Reg::Op1, delta);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, push_fn(big));
        }
        self.exception_check();
        {
            let (g, a) = self.ga();
            if !big {
                g.extend_word(a, false, Reg::Addr);
            }
            g.mov_word_from_reg(a, Reg::Addr, eip, true);
        }
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    fn jmp_near_rm(&mut self, m: Mods, wd: Width) -> DResult<Step> {
        let big = self.big_op();
        self.rm_load(m, wd)?;
        let eip = self.env.addr_of_eip();
        {
            let (g, a) = self.ga();
            if !big {
                g.extend_word(a, false, Reg::Op1);
            }
            g.mov_word_from_reg(a, Reg::Op1, eip, true);
        }
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    // -- Branches --

    fn jcc(&mut self, cc: u32, rel: i32) -> DResult<Step> {
        self.flagopt.acquire();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 1, cc as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::branch_cond));
        }
        self.branch_exit(rel)
    }

    fn loop_insn(&mut self, op: u8) -> DResult<Step> {
        let rel = self.fetchb()? as i8 as i32;
        let kind = match op {
            0xe0 => helpers::LOOP_NZ,
            0xe1 => helpers::LOOP_Z,
            0xe2 => helpers::LOOP_PLAIN,
            _ => helpers::LOOP_JCXZ,
        };
        let big_addr = self.big_addr();
        self.flagopt.acquire();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 2, big_addr as u64);
            g.load_param_imm(a, 1, kind as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::loop_step));
        }
        self.branch_exit(rel)
    }

    /// Two-way exit on `RetOp`: slot 0 falls through, slot 1 takes the
    /// branch.
    fn branch_exit(&mut self, rel: i32) -> DResult<Step> {
        let taken = {
            let (g, a) = self.ga();
            g.branch_on_nonzero(a, Reg::RetOp, true)
        };
        let next = self.code.wrapping_sub(self.code_start);
        self.close_link(0, next);
        {
            let (g, a) = self.ga();
            g.fill_branch(a, taken);
        }
        self.close_link(1, next.wrapping_add(rel as u32));
        Ok(Step::Closed)
    }

    fn setcc(&mut self, cc: u32) -> DResult<Step> {
        let m = self.fetch_modrm()?;
        if !m.is_reg() {
            self.fill_ea(m, true)?;
        }
        self.flagopt.acquire();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 1, cc as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::branch_cond));
        }
        if m.is_reg() {
            let r8 = self.env.addr_of_reg8(m.rm);
            let (g, a) = self.ga();
            g.mov_byte_from_reg_low(a, Reg::RetOp, r8);
        } else {
            self.write_mem(Width::B, Reg::RetOp);
        }
        Ok(Step::Continue)
    }

    fn jmp_rel(&mut self, rel: i32) -> DResult<Step> {
        let next = self.code.wrapping_sub(self.code_start);
        self.close_link(0, next.wrapping_add(rel as u32));
        Ok(Step::Closed)
    }

    fn call_rel(&mut self) -> DResult<Step> {
        let big = self.big_op();
        let rel = if big {
            self.fetchd()? as i32
        } else {
            self.fetchw()? as i16 as i32
        };
        let delta = self.code.wrapping_sub(self.code_start);
        let eip = self.env.addr_of_eip();
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op1, eip, true);
            g.add_imm(a, Reg::Op1, delta);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, push_fn(big));
        }
        self.exception_check();
        self.close_link(0, delta.wrapping_add(rel as u32));
        Ok(Step::Closed)
    }

    // -- Far control transfers and returns --

    fn call_far_imm(&mut self) -> DResult<Step> {
        let wd = Width::v(self.big_op());
        let off = self.fetchv(wd)?;
        let sel = self.fetchw()? as u32;
        let delta = self.code.wrapping_sub(self.code_start);
        let eip = self.env.addr_of_eip();
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op3, eip, true);
            g.add_imm(a, Reg::Op3, delta);
            g.load_param_reg(a, 3, Reg::Op3);
            g.load_param_imm(a, 2, off as u64);
            g.load_param_imm(a, 1, sel as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::call_far));
        }
        self.exception_check();
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    fn jmp_far_imm(&mut self) -> DResult<Step> {
        let wd = Width::v(self.big_op());
        let off = self.fetchv(wd)?;
        let sel = self.fetchw()? as u32;
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 2, off as u64);
            g.load_param_imm(a, 1, sel as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::jmp_far));
        }
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    fn ret_insn(&mut self, has_extra: bool, f: u64, code: BlockReturn) -> DResult<Step> {
        let extra = if has_extra { self.fetchw()? as u32 } else { 0 };
        let big = self.big_op();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 2, big as u64);
            g.load_param_imm(a, 1, extra as u64);
            g.load_param_env(a, 0);
            g.call(a, f);
        }
        self.exception_check();
        self.close_return(code);
        Ok(Step::Closed)
    }

    fn int_imm(&mut self) -> DResult<Step> {
        let num = self.fetchb()? as u32;
        let delta = self.code.wrapping_sub(self.code_start);
        let eip = self.env.addr_of_eip();
        {
            let (g, a) = self.ga();
            g.mov_word_to_reg(a, Reg::Op2, eip, true);
            g.add_imm(a, Reg::Op2, delta);
            g.load_param_reg(a, 2, Reg::Op2);
            g.load_param_imm(a, 1, num as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::sw_interrupt));
        }
        self.exception_check();
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    fn iret_insn(&mut self) -> DResult<Step> {
        self.call_helper(fnp!(helpers::iret));
        self.exception_check();
        self.close_return(BlockReturn::Iret);
        Ok(Step::Closed)
    }

    // -- Flag and direction state --

    fn carry_insn(&mut self, which: u32) -> DResult<Step> {
        self.flagopt.acquire();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 1, which as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::carry_op));
        }
        Ok(Step::Continue)
    }

    fn direction_insn(&mut self, down: u32) -> DResult<Step> {
        let (g, a) = self.ga();
        g.load_param_imm(a, 1, down as u64);
        g.load_param_env(a, 0);
        g.call(a, fnp!(helpers::set_direction));
        Ok(Step::Continue)
    }

    fn pushf_insn(&mut self) -> DResult<Step> {
        let big = self.big_op();
        self.flagopt.acquire();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 1, big as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::pushf));
        }
        self.exception_check();
        Ok(Step::Continue)
    }

    fn popf_insn(&mut self) -> DResult<Step> {
        let big = self.big_op();
        // The popped word overwrites every flag.
        self.flag_invalidate_all();
        {
            let (g, a) = self.ga();
            g.load_param_imm(a, 1, big as u64);
            g.load_param_env(a, 0);
            g.call(a, fnp!(helpers::popf));
        }
        self.exception_check();
        // Interrupt and trap state may have changed; end the block.
        self.eip_advance(self.code.wrapping_sub(self.code_start));
        self.close_return(BlockReturn::Normal);
        Ok(Step::Closed)
    }

    // -- Strings --

    fn string_insn(&mut self, op: u8) -> DResult<Step> {
        let wd = if op & 1 == 0 {
            Width::B
        } else {
            Width::v(self.big_op())
        };
        let rep = self.prefix.intersects(Prefix::REP | Prefix::REP_NZ);
        let mut ctrl = 0;
        if rep {
            ctrl |= ops::STR_REP;
        }
        if self.big_addr() {
            ctrl |= ops::STR_BIG_ADDR;
        }
        // The helper charges cycles for this instruction itself.
        self.cycles -= 1;

        let src_seg = self.env.addr_of_seg_phys(self.seg_or(DS));
        let es_seg = self.env.addr_of_seg_phys(ES);
        match op {
            0xa4 | 0xa5 => {
                let (g, a) = self.ga();
                g.load_param_imm(a, 3, ctrl as u64);
                g.load_param_mem(a, 2, es_seg);
                g.load_param_mem(a, 1, src_seg);
                g.load_param_env(a, 0);
                g.call(a, movs_fn(wd));
            }
            0xaa | 0xab => {
                let (g, a) = self.ga();
                g.load_param_imm(a, 2, ctrl as u64);
                g.load_param_mem(a, 1, es_seg);
                g.load_param_env(a, 0);
                g.call(a, stos_fn(wd));
            }
            _ => {
                let (g, a) = self.ga();
                g.load_param_imm(a, 2, ctrl as u64);
                g.load_param_mem(a, 1, src_seg);
                g.load_param_env(a, 0);
                g.call(a, lods_fn(wd));
            }
        }
        // Nonzero return means work was left (budget or fault); exit so
        // the instruction restarts with the remaining count.
        let eip_add = self.op_start.wrapping_sub(self.code_start);
        let cycles = self.cycles;
        let patch = {
            let (g, a) = self.ga();
            g.branch_long_nonzero(a, Reg::RetOp, true)
        };
        self.saves.push(SaveRec {
            patch,
            kind: SaveKind::StringBreak { eip_add, cycles },
        });
        Ok(Step::Continue)
    }
}

fn shift_kind_of(c: usize, wd: Width) -> Option<FlagKind> {
    let col = match wd {
        Width::B => 0,
        Width::W => 1,
        Width::D => 2,
    };
    let row = match c {
        0 => [FlagKind::RolB, FlagKind::RolW, FlagKind::RolD],
        1 => [FlagKind::RorB, FlagKind::RorW, FlagKind::RorD],
        4 | 6 => [FlagKind::ShlB, FlagKind::ShlW, FlagKind::ShlD],
        5 => [FlagKind::ShrB, FlagKind::ShrW, FlagKind::ShrD],
        7 => [FlagKind::SarB, FlagKind::SarW, FlagKind::SarD],
        _ => return None,
    };
    Some(row[col])
}

fn rc_fn(left: bool, wd: Width) -> u64 {
    match (left, wd) {
        (true, Width::B) => fnp!(ops::rcl_b),
        (true, Width::W) => fnp!(ops::rcl_w),
        (true, Width::D) => fnp!(ops::rcl_d),
        (false, Width::B) => fnp!(ops::rcr_b),
        (false, Width::W) => fnp!(ops::rcr_w),
        (false, Width::D) => fnp!(ops::rcr_d),
    }
}

fn not_fn(wd: Width) -> u64 {
    match wd {
        Width::B => fnp!(ops::not_b),
        Width::W => fnp!(ops::not_w),
        Width::D => fnp!(ops::not_d),
    }
}

fn mul_fn(signed: bool, wd: Width) -> u64 {
    match (signed, wd) {
        (false, Width::B) => fnp!(ops::mul_b),
        (false, Width::W) => fnp!(ops::mul_w),
        (false, Width::D) => fnp!(ops::mul_d),
        (true, Width::B) => fnp!(ops::imul_b),
        (true, Width::W) => fnp!(ops::imul_w),
        (true, Width::D) => fnp!(ops::imul_d),
    }
}

fn div_fn(signed: bool, wd: Width) -> u64 {
    match (signed, wd) {
        (false, Width::B) => fnp!(ops::div_b),
        (false, Width::W) => fnp!(ops::div_w),
        (false, Width::D) => fnp!(ops::div_d),
        (true, Width::B) => fnp!(ops::idiv_b),
        (true, Width::W) => fnp!(ops::idiv_w),
        (true, Width::D) => fnp!(ops::idiv_d),
    }
}

fn imul_reg_fn(wd: Width) -> u64 {
    match wd {
        Width::D => fnp!(ops::imul_d_reg),
        _ => fnp!(ops::imul_w_reg),
    }
}

fn movs_fn(wd: Width) -> u64 {
    match wd {
        Width::B => fnp!(ops::movs_b),
        Width::W => fnp!(ops::movs_w),
        Width::D => fnp!(ops::movs_d),
    }
}

fn stos_fn(wd: Width) -> u64 {
    match wd {
        Width::B => fnp!(ops::stos_b),
        Width::W => fnp!(ops::stos_w),
        Width::D => fnp!(ops::stos_d),
    }
}

fn lods_fn(wd: Width) -> u64 {
    match wd {
        Width::B => fnp!(ops::lods_b),
        Width::W => fnp!(ops::lods_w),
        Width::D => fnp!(ops::lods_d),
    }
}
