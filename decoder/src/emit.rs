//! Emission helpers shared by the opcode handlers.
//!
//! The conventions here keep the backends honest: helper parameters are
//! staged highest-numbered first and the state pointer last (parameter
//! registers may alias the operand roles), and only `Reg::Addr`
//! survives a generated call.

use drc_backend::Reg;
use drc_core::ret::BlockReturn;
use drc_core::{helpers, ops, FlagKind};

use crate::ctx::{SaveKind, SaveRec, TransContext, Width};

macro_rules! fnp {
    ($f:expr) => {
        $f as usize as u64
    };
}

pub(crate) use fnp;

/// Full and flags-free entry points of a binary ALU operator.
pub(crate) fn binop_fns(kind: FlagKind) -> (u64, u64) {
    match kind {
        FlagKind::AddB => (fnp!(ops::add_b), fnp!(ops::add_b_simple)),
        FlagKind::AddW => (fnp!(ops::add_w), fnp!(ops::add_w_simple)),
        FlagKind::AddD => (fnp!(ops::add_d), fnp!(ops::add_d_simple)),
        FlagKind::AdcB => (fnp!(ops::adc_b), fnp!(ops::adc_b_simple)),
        FlagKind::AdcW => (fnp!(ops::adc_w), fnp!(ops::adc_w_simple)),
        FlagKind::AdcD => (fnp!(ops::adc_d), fnp!(ops::adc_d_simple)),
        FlagKind::SubB => (fnp!(ops::sub_b), fnp!(ops::sub_b_simple)),
        FlagKind::SubW => (fnp!(ops::sub_w), fnp!(ops::sub_w_simple)),
        FlagKind::SubD => (fnp!(ops::sub_d), fnp!(ops::sub_d_simple)),
        FlagKind::SbbB => (fnp!(ops::sbb_b), fnp!(ops::sbb_b_simple)),
        FlagKind::SbbW => (fnp!(ops::sbb_w), fnp!(ops::sbb_w_simple)),
        FlagKind::SbbD => (fnp!(ops::sbb_d), fnp!(ops::sbb_d_simple)),
        FlagKind::OrB => (fnp!(ops::or_b), fnp!(ops::or_b_simple)),
        FlagKind::OrW => (fnp!(ops::or_w), fnp!(ops::or_w_simple)),
        FlagKind::OrD => (fnp!(ops::or_d), fnp!(ops::or_d_simple)),
        FlagKind::AndB => (fnp!(ops::and_b), fnp!(ops::and_b_simple)),
        FlagKind::AndW => (fnp!(ops::and_w), fnp!(ops::and_w_simple)),
        FlagKind::AndD => (fnp!(ops::and_d), fnp!(ops::and_d_simple)),
        FlagKind::XorB => (fnp!(ops::xor_b), fnp!(ops::xor_b_simple)),
        FlagKind::XorW => (fnp!(ops::xor_w), fnp!(ops::xor_w_simple)),
        FlagKind::XorD => (fnp!(ops::xor_d), fnp!(ops::xor_d_simple)),
        FlagKind::CmpB => (fnp!(ops::cmp_b), fnp!(ops::cmp_b_simple)),
        FlagKind::CmpW => (fnp!(ops::cmp_w), fnp!(ops::cmp_w_simple)),
        FlagKind::CmpD => (fnp!(ops::cmp_d), fnp!(ops::cmp_d_simple)),
        FlagKind::TestB => (fnp!(ops::test_b), fnp!(ops::test_b_simple)),
        FlagKind::TestW => (fnp!(ops::test_w), fnp!(ops::test_w_simple)),
        FlagKind::TestD => (fnp!(ops::test_d), fnp!(ops::test_d_simple)),
        _ => unreachable!("not a binary ALU kind"),
    }
}

pub(crate) fn unop_fns(kind: FlagKind) -> (u64, u64) {
    match kind {
        FlagKind::IncB => (fnp!(ops::inc_b), fnp!(ops::inc_b_simple)),
        FlagKind::IncW => (fnp!(ops::inc_w), fnp!(ops::inc_w_simple)),
        FlagKind::IncD => (fnp!(ops::inc_d), fnp!(ops::inc_d_simple)),
        FlagKind::DecB => (fnp!(ops::dec_b), fnp!(ops::dec_b_simple)),
        FlagKind::DecW => (fnp!(ops::dec_w), fnp!(ops::dec_w_simple)),
        FlagKind::DecD => (fnp!(ops::dec_d), fnp!(ops::dec_d_simple)),
        FlagKind::NegB => (fnp!(ops::neg_b), fnp!(ops::neg_b_simple)),
        FlagKind::NegW => (fnp!(ops::neg_w), fnp!(ops::neg_w_simple)),
        FlagKind::NegD => (fnp!(ops::neg_d), fnp!(ops::neg_d_simple)),
        _ => unreachable!("not a unary kind"),
    }
}

pub(crate) fn shift_fns(kind: FlagKind) -> (u64, u64) {
    match kind {
        FlagKind::ShlB => (fnp!(ops::shl_b), fnp!(ops::shl_b_simple)),
        FlagKind::ShlW => (fnp!(ops::shl_w), fnp!(ops::shl_w_simple)),
        FlagKind::ShlD => (fnp!(ops::shl_d), fnp!(ops::shl_d_simple)),
        FlagKind::ShrB => (fnp!(ops::shr_b), fnp!(ops::shr_b_simple)),
        FlagKind::ShrW => (fnp!(ops::shr_w), fnp!(ops::shr_w_simple)),
        FlagKind::ShrD => (fnp!(ops::shr_d), fnp!(ops::shr_d_simple)),
        FlagKind::SarB => (fnp!(ops::sar_b), fnp!(ops::sar_b_simple)),
        FlagKind::SarW => (fnp!(ops::sar_w), fnp!(ops::sar_w_simple)),
        FlagKind::SarD => (fnp!(ops::sar_d), fnp!(ops::sar_d_simple)),
        FlagKind::RolB => (fnp!(ops::rol_b), fnp!(ops::rol_b_simple)),
        FlagKind::RolW => (fnp!(ops::rol_w), fnp!(ops::rol_w_simple)),
        FlagKind::RolD => (fnp!(ops::rol_d), fnp!(ops::rol_d_simple)),
        FlagKind::RorB => (fnp!(ops::ror_b), fnp!(ops::ror_b_simple)),
        FlagKind::RorW => (fnp!(ops::ror_w), fnp!(ops::ror_w_simple)),
        FlagKind::RorD => (fnp!(ops::ror_d), fnp!(ops::ror_d_simple)),
        _ => unreachable!("not a shift kind"),
    }
}

pub(crate) fn dsh_fns(kind: FlagKind) -> (u64, u64) {
    match kind {
        FlagKind::DshlW => (fnp!(ops::dshl_w), fnp!(ops::dshl_w_simple)),
        FlagKind::DshlD => (fnp!(ops::dshl_d), fnp!(ops::dshl_d_simple)),
        FlagKind::DshrW => (fnp!(ops::dshr_w), fnp!(ops::dshr_w_simple)),
        FlagKind::DshrD => (fnp!(ops::dshr_d), fnp!(ops::dshr_d_simple)),
        _ => unreachable!("not a double shift kind"),
    }
}

/// ALU kind for a grid class (add, or, adc, sbb, and, sub, xor, cmp).
pub(crate) fn alu_kind(class: usize, wd: Width) -> FlagKind {
    let table = [
        [FlagKind::AddB, FlagKind::AddW, FlagKind::AddD],
        [FlagKind::OrB, FlagKind::OrW, FlagKind::OrD],
        [FlagKind::AdcB, FlagKind::AdcW, FlagKind::AdcD],
        [FlagKind::SbbB, FlagKind::SbbW, FlagKind::SbbD],
        [FlagKind::AndB, FlagKind::AndW, FlagKind::AndD],
        [FlagKind::SubB, FlagKind::SubW, FlagKind::SubD],
        [FlagKind::XorB, FlagKind::XorW, FlagKind::XorD],
        [FlagKind::CmpB, FlagKind::CmpW, FlagKind::CmpD],
    ];
    table[class][width_col(wd)]
}

pub(crate) fn test_kind(wd: Width) -> FlagKind {
    [FlagKind::TestB, FlagKind::TestW, FlagKind::TestD][width_col(wd)]
}

pub(crate) fn inc_dec_kind(inc: bool, wd: Width) -> FlagKind {
    if inc {
        [FlagKind::IncB, FlagKind::IncW, FlagKind::IncD][width_col(wd)]
    } else {
        [FlagKind::DecB, FlagKind::DecW, FlagKind::DecD][width_col(wd)]
    }
}

pub(crate) fn neg_kind(wd: Width) -> FlagKind {
    [FlagKind::NegB, FlagKind::NegW, FlagKind::NegD][width_col(wd)]
}

fn width_col(wd: Width) -> usize {
    match wd {
        Width::B => 0,
        Width::W => 1,
        Width::D => 2,
    }
}

fn reads_carry(kind: FlagKind) -> bool {
    matches!(
        kind,
        FlagKind::AdcB
            | FlagKind::AdcW
            | FlagKind::AdcD
            | FlagKind::SbbB
            | FlagKind::SbbW
            | FlagKind::SbbD
    )
}

pub(crate) fn read_fn(wd: Width) -> u64 {
    match wd {
        Width::B => fnp!(helpers::mem_readb_checked),
        Width::W => fnp!(helpers::mem_readw_checked),
        Width::D => fnp!(helpers::mem_readd_checked),
    }
}

pub(crate) fn write_fn(wd: Width) -> u64 {
    match wd {
        Width::B => fnp!(helpers::mem_writeb_checked),
        Width::W => fnp!(helpers::mem_writew_checked),
        Width::D => fnp!(helpers::mem_writed_checked),
    }
}

pub(crate) fn push_fn(big: bool) -> u64 {
    if big {
        fnp!(helpers::push_d)
    } else {
        fnp!(helpers::push_w)
    }
}

pub(crate) fn pop_fn(big: bool) -> u64 {
    if big {
        fnp!(helpers::pop_d)
    } else {
        fnp!(helpers::pop_w)
    }
}

impl TransContext<'_> {
    /// Rewrite every queued flag producer to its flags-free form.
    pub(crate) fn flag_invalidate_all(&mut self) {
        let Self {
            gen, cache, flagopt, ..
        } = self;
        flagopt.invalidate_all(&mut **gen, cache.arena());
    }

    // -- Guest register traffic --

    pub(crate) fn load_guest_reg(&mut self, dst: Reg, r: usize, wd: Width) {
        let addr = match wd {
            Width::B => self.env.addr_of_reg8(r),
            _ => self.env.addr_of_reg(r),
        };
        let (g, a) = self.ga();
        match wd {
            Width::B => g.mov_byte_to_reg_low(a, dst, addr),
            _ => g.mov_word_to_reg(a, dst, addr, wd.dword()),
        }
    }

    pub(crate) fn store_guest_reg(&mut self, src: Reg, r: usize, wd: Width) {
        let addr = match wd {
            Width::B => self.env.addr_of_reg8(r),
            _ => self.env.addr_of_reg(r),
        };
        let (g, a) = self.ga();
        match wd {
            Width::B => g.mov_byte_from_reg_low(a, src, addr),
            _ => g.mov_word_from_reg(a, src, addr, wd.dword()),
        }
    }

    // -- Checked guest memory traffic, address in `Reg::Addr` --

    /// Branch to the deferred exception exit when the last helper call
    /// reported a fault.
    pub(crate) fn exception_check(&mut self) {
        let eip_add = self.op_start.wrapping_sub(self.code_start);
        let cycles = self.cycles - 1;
        let patch = {
            let (g, a) = self.ga();
            g.branch_long_nonzero(a, Reg::RetOp, true)
        };
        self.saves.push(SaveRec {
            patch,
            kind: SaveKind::Exception { eip_add, cycles },
        });
    }

    pub(crate) fn read_mem(&mut self, wd: Width, dst: Reg) {
        let f = read_fn(wd);
        {
            let (g, a) = self.ga();
            g.load_param_reg(a, 1, Reg::Addr);
            g.load_param_env(a, 0);
            g.call(a, f);
        }
        self.exception_check();
        let rd = self.env.addr_of_readdata();
        let (g, a) = self.ga();
        g.mov_word_to_reg(a, dst, rd, true);
    }

    pub(crate) fn write_mem(&mut self, wd: Width, src: Reg) {
        let f = write_fn(wd);
        {
            let (g, a) = self.ga();
            g.load_param_reg(a, 2, src);
            g.load_param_reg(a, 1, Reg::Addr);
            g.load_param_env(a, 0);
            g.call(a, f);
        }
        self.exception_check();
    }

    // -- Operator calls under the flags queue --

    /// Binary operator with operands in `Op1`/`Op2`, result in `RetOp`.
    pub(crate) fn gencall_alu(&mut self, kind: FlagKind) {
        if reads_carry(kind) {
            self.flagopt.acquire();
        } else {
            self.flag_invalidate_all();
        }
        let (full, simple) = binop_fns(kind);
        let site = {
            let (g, a) = self.ga();
            g.load_param_reg(a, 2, Reg::Op2);
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, full)
        };
        self.flagopt.push(site, simple, kind);
    }

    /// INC/DEC/NEG with the operand in `Op1`.
    pub(crate) fn gencall_unop(&mut self, kind: FlagKind) {
        if matches!(kind, FlagKind::NegB | FlagKind::NegW | FlagKind::NegD) {
            self.flag_invalidate_all();
        }
        let (full, simple) = unop_fns(kind);
        let site = {
            let (g, a) = self.ga();
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, full)
        };
        self.flagopt.push(site, simple, kind);
    }

    /// Shift or rotate with the operand in `Op1` and the count already
    /// staged as parameter 2.
    pub(crate) fn gencall_shift(&mut self, kind: FlagKind) {
        let (full, simple) = shift_fns(kind);
        let site = {
            let (g, a) = self.ga();
            g.load_param_reg(a, 1, Reg::Op1);
            g.load_param_env(a, 0);
            g.call(a, full)
        };
        // Count-dependent: a zero count preserves everything, so the
        // queue only ever appends here.
        self.flagopt.push(site, simple, kind);
    }

    /// Plain helper call, parameters already staged except the state
    /// pointer.
    pub(crate) fn call_helper(&mut self, fct: u64) {
        let (g, a) = self.ga();
        g.load_param_env(a, 0);
        g.call(a, fct);
    }

    // -- Block exits --

    pub(crate) fn eip_advance(&mut self, delta: u32) {
        if delta == 0 {
            return;
        }
        let eip = self.env.addr_of_eip();
        let big = self.env.code_big != 0;
        let (g, a) = self.ga();
        g.add_direct_word(a, eip, delta, big);
    }

    pub(crate) fn cycles_sub(&mut self) {
        if self.cycles == 0 {
            return;
        }
        let cyc = self.env.addr_of_cycles();
        let n = self.cycles;
        let (g, a) = self.ga();
        g.sub_direct_word(a, cyc, n, true);
    }

    /// Exit after a helper that set `eip` itself.
    pub(crate) fn close_return(&mut self, code: BlockReturn) {
        self.cycles_sub();
        let (g, a) = self.ga();
        g.return_imm(a, code);
    }

    /// Exit deferring the current instruction to the interpreter.
    pub(crate) fn close_opcode(&mut self) {
        self.eip_advance(self.op_start.wrapping_sub(self.code_start));
        self.cycles_sub();
        let (g, a) = self.ga();
        g.return_imm(a, BlockReturn::Opcode);
    }

    /// Exit through a link slot with a known target displacement.
    pub(crate) fn close_link(&mut self, slot: usize, eip_delta: u32) {
        self.eip_advance(eip_delta);
        self.cycles_sub();
        let cell = self.cache.cell_addr(self.block, slot);
        let (g, a) = self.ga();
        g.jmp_ptr(a, cell);
    }

    /// Emit the out-of-line exit stubs recorded during translation.
    pub(crate) fn fill_saves(&mut self) {
        let eip = self.env.addr_of_eip();
        let cyc = self.env.addr_of_cycles();
        let big = self.env.code_big != 0;
        for rec in std::mem::take(&mut self.saves) {
            let (g, a) = self.ga();
            g.fill_branch_long(a, rec.patch);
            match rec.kind {
                SaveKind::CycleCheck => g.return_imm(a, BlockReturn::Cycles),
                SaveKind::Exception { eip_add, cycles } => {
                    g.load_param_imm(a, 2, cycles as u64);
                    g.load_param_imm(a, 1, eip_add as u64);
                    g.load_param_env(a, 0);
                    g.call(a, fnp!(helpers::run_exception));
                    g.return_retop(a);
                }
                SaveKind::StringBreak { eip_add, cycles } => {
                    if eip_add != 0 {
                        g.add_direct_word(a, eip, eip_add, big);
                    }
                    if cycles != 0 {
                        g.sub_direct_word(a, cyc, cycles, true);
                    }
                    g.return_imm(a, BlockReturn::Cycles);
                }
            }
        }
    }
}
