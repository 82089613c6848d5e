//! The operator table: host-callable implementations of guest
//! arithmetic, logic, shift and string primitives.
//!
//! Every flag-producing operator has a `_simple` twin computing only the
//! result; the flags-laziness optimizer retargets call sites to the twin
//! when the flags are provably never read. All functions are `extern "C"`
//! with the CPU state block as first argument so generated code can call
//! them directly.

use crate::flags::{fill_flags, get_cf, FlagKind};
use crate::state::{
    CpuState, EAX, ECX, EDI, EDX, ESI, EXCEPTION_DE, FLAG_CF, FLAG_OF,
};

#[inline]
fn env_mut<'a>(env: *mut CpuState) -> &'a mut CpuState {
    // SAFETY: every caller (generated code, run loop, tests) passes a
    // pointer to the live, pinned state block.
    unsafe { &mut *env }
}

#[inline]
fn record(env: &mut CpuState, kind: FlagKind, v1: u32, v2: u32, res: u32) {
    env.lf_var1 = v1;
    env.lf_var2 = v2;
    env.lf_res = res;
    env.lf_kind = kind as u32;
}

macro_rules! lazy_binop {
    ($full:ident, $simple:ident, $kind:ident, $mask:expr,
     |$v1:ident, $v2:ident| $calc:expr) => {
        pub extern "C" fn $full(env: *mut CpuState, op1: u32, op2: u32) -> u32 {
            let env = env_mut(env);
            let $v1 = op1 & $mask;
            let $v2 = op2 & $mask;
            let res = ($calc) & $mask;
            record(env, FlagKind::$kind, $v1, $v2, res);
            res
        }

        pub extern "C" fn $simple(_env: *mut CpuState, op1: u32, op2: u32) -> u32 {
            let $v1 = op1 & $mask;
            let $v2 = op2 & $mask;
            ($calc) & $mask
        }
    };
}

macro_rules! lazy_carry_binop {
    ($full:ident, $simple:ident, $kind:ident, $mask:expr,
     |$v1:ident, $v2:ident, $cf:ident| $calc:expr) => {
        pub extern "C" fn $full(env: *mut CpuState, op1: u32, op2: u32) -> u32 {
            let env = env_mut(env);
            let $cf = get_cf(env) as u32;
            let $v1 = op1 & $mask;
            let $v2 = op2 & $mask;
            let res = ($calc) & $mask;
            record(env, FlagKind::$kind, $v1, $v2, res);
            env.lf_oldcf = $cf;
            res
        }

        pub extern "C" fn $simple(env: *mut CpuState, op1: u32, op2: u32) -> u32 {
            // Still consumes the carry even when flags are not produced.
            let env = env_mut(env);
            let $cf = get_cf(env) as u32;
            let $v1 = op1 & $mask;
            let $v2 = op2 & $mask;
            ($calc) & $mask
        }
    };
}

lazy_binop!(add_b, add_b_simple, AddB, 0xff, |a, b| a.wrapping_add(b));
lazy_binop!(add_w, add_w_simple, AddW, 0xffff, |a, b| a.wrapping_add(b));
lazy_binop!(add_d, add_d_simple, AddD, 0xffff_ffff, |a, b| a.wrapping_add(b));

lazy_binop!(sub_b, sub_b_simple, SubB, 0xff, |a, b| a.wrapping_sub(b));
lazy_binop!(sub_w, sub_w_simple, SubW, 0xffff, |a, b| a.wrapping_sub(b));
lazy_binop!(sub_d, sub_d_simple, SubD, 0xffff_ffff, |a, b| a.wrapping_sub(b));

lazy_binop!(or_b, or_b_simple, OrB, 0xff, |a, b| a | b);
lazy_binop!(or_w, or_w_simple, OrW, 0xffff, |a, b| a | b);
lazy_binop!(or_d, or_d_simple, OrD, 0xffff_ffff, |a, b| a | b);

lazy_binop!(and_b, and_b_simple, AndB, 0xff, |a, b| a & b);
lazy_binop!(and_w, and_w_simple, AndW, 0xffff, |a, b| a & b);
lazy_binop!(and_d, and_d_simple, AndD, 0xffff_ffff, |a, b| a & b);

lazy_binop!(xor_b, xor_b_simple, XorB, 0xff, |a, b| a ^ b);
lazy_binop!(xor_w, xor_w_simple, XorW, 0xffff, |a, b| a ^ b);
lazy_binop!(xor_d, xor_d_simple, XorD, 0xffff_ffff, |a, b| a ^ b);

// CMP and TEST only exist for their flags; the simple twins are what
// the optimizer degrades them to when those flags die unread.
lazy_binop!(cmp_b, cmp_b_simple, CmpB, 0xff, |a, b| a.wrapping_sub(b));
lazy_binop!(cmp_w, cmp_w_simple, CmpW, 0xffff, |a, b| a.wrapping_sub(b));
lazy_binop!(cmp_d, cmp_d_simple, CmpD, 0xffff_ffff, |a, b| a.wrapping_sub(b));

lazy_binop!(test_b, test_b_simple, TestB, 0xff, |a, b| a & b);
lazy_binop!(test_w, test_w_simple, TestW, 0xffff, |a, b| a & b);
lazy_binop!(test_d, test_d_simple, TestD, 0xffff_ffff, |a, b| a & b);

lazy_carry_binop!(adc_b, adc_b_simple, AdcB, 0xff, |a, b, c| a
    .wrapping_add(b)
    .wrapping_add(c));
lazy_carry_binop!(adc_w, adc_w_simple, AdcW, 0xffff, |a, b, c| a
    .wrapping_add(b)
    .wrapping_add(c));
lazy_carry_binop!(adc_d, adc_d_simple, AdcD, 0xffff_ffff, |a, b, c| a
    .wrapping_add(b)
    .wrapping_add(c));

lazy_carry_binop!(sbb_b, sbb_b_simple, SbbB, 0xff, |a, b, c| a
    .wrapping_sub(b)
    .wrapping_sub(c));
lazy_carry_binop!(sbb_w, sbb_w_simple, SbbW, 0xffff, |a, b, c| a
    .wrapping_sub(b)
    .wrapping_sub(c));
lazy_carry_binop!(sbb_d, sbb_d_simple, SbbD, 0xffff_ffff, |a, b, c| a
    .wrapping_sub(b)
    .wrapping_sub(c));

macro_rules! lazy_unop {
    ($full:ident, $simple:ident, $kind:ident, $mask:expr, $pin_cf:expr,
     |$v1:ident| $calc:expr) => {
        pub extern "C" fn $full(env: *mut CpuState, op1: u32) -> u32 {
            let env = env_mut(env);
            if $pin_cf {
                // INC/DEC leave the carry untouched; materialize it
                // before the lazy record replaces the previous one.
                fill_flags(env);
            }
            let $v1 = op1 & $mask;
            let res = ($calc) & $mask;
            record(env, FlagKind::$kind, $v1, 0, res);
            res
        }

        pub extern "C" fn $simple(_env: *mut CpuState, op1: u32) -> u32 {
            let $v1 = op1 & $mask;
            ($calc) & $mask
        }
    };
}

lazy_unop!(inc_b, inc_b_simple, IncB, 0xff, true, |a| a.wrapping_add(1));
lazy_unop!(inc_w, inc_w_simple, IncW, 0xffff, true, |a| a.wrapping_add(1));
lazy_unop!(inc_d, inc_d_simple, IncD, 0xffff_ffff, true, |a| a.wrapping_add(1));

lazy_unop!(dec_b, dec_b_simple, DecB, 0xff, true, |a| a.wrapping_sub(1));
lazy_unop!(dec_w, dec_w_simple, DecW, 0xffff, true, |a| a.wrapping_sub(1));
lazy_unop!(dec_d, dec_d_simple, DecD, 0xffff_ffff, true, |a| a.wrapping_sub(1));

lazy_unop!(neg_b, neg_b_simple, NegB, 0xff, false, |a| 0u32.wrapping_sub(a));
lazy_unop!(neg_w, neg_w_simple, NegW, 0xffff, false, |a| 0u32.wrapping_sub(a));
lazy_unop!(neg_d, neg_d_simple, NegD, 0xffff_ffff, false, |a| {
    0u32.wrapping_sub(a)
});

// NOT touches no flags; there is nothing to simplify.
pub extern "C" fn not_b(_env: *mut CpuState, op1: u32) -> u32 {
    !op1 & 0xff
}
pub extern "C" fn not_w(_env: *mut CpuState, op1: u32) -> u32 {
    !op1 & 0xffff
}
pub extern "C" fn not_d(_env: *mut CpuState, op1: u32) -> u32 {
    !op1
}

// -- Shifts --
//
// A masked count of zero alters neither result nor flags, so the lazy
// record is only written for nonzero counts (var2 = masked count).

macro_rules! shift_op {
    ($full:ident, $simple:ident, $kind:ident, $mask:expr,
     |$v1:ident, $n:ident| $calc:expr) => {
        pub extern "C" fn $full(env: *mut CpuState, op1: u32, count: u32) -> u32 {
            let env = env_mut(env);
            let $n = count & 0x1f;
            if $n == 0 {
                return op1 & $mask;
            }
            let $v1 = op1 & $mask;
            let res = ($calc) & $mask;
            record(env, FlagKind::$kind, $v1, $n, res);
            res
        }

        pub extern "C" fn $simple(_env: *mut CpuState, op1: u32, count: u32) -> u32 {
            let $n = count & 0x1f;
            if $n == 0 {
                return op1 & $mask;
            }
            let $v1 = op1 & $mask;
            ($calc) & $mask
        }
    };
}

shift_op!(shl_b, shl_b_simple, ShlB, 0xff, |a, n| if n > 31 {
    0
} else {
    a << n
});
shift_op!(shl_w, shl_w_simple, ShlW, 0xffff, |a, n| if n > 31 {
    0
} else {
    a << n
});
shift_op!(shl_d, shl_d_simple, ShlD, 0xffff_ffff, |a, n| a << n);

shift_op!(shr_b, shr_b_simple, ShrB, 0xff, |a, n| a >> n);
shift_op!(shr_w, shr_w_simple, ShrW, 0xffff, |a, n| a >> n);
shift_op!(shr_d, shr_d_simple, ShrD, 0xffff_ffff, |a, n| a >> n);

shift_op!(sar_b, sar_b_simple, SarB, 0xff, |a, n| {
    let sx = a as i32 | if a & 0x80 != 0 { !0xffi32 } else { 0 };
    (sx >> n.min(31)) as u32
});
shift_op!(sar_w, sar_w_simple, SarW, 0xffff, |a, n| {
    let sx = a as i32 | if a & 0x8000 != 0 { !0xffffi32 } else { 0 };
    (sx >> n.min(31)) as u32
});
shift_op!(sar_d, sar_d_simple, SarD, 0xffff_ffff, |a, n| {
    ((a as i32) >> n) as u32
});

// -- Rotates: flags resolved eagerly --

macro_rules! rotate_op {
    ($full:ident, $simple:ident, $bits:expr, $mask:expr, $left:expr) => {
        pub extern "C" fn $full(env: *mut CpuState, op1: u32, count: u32) -> u32 {
            let env = env_mut(env);
            let n = count & 0x1f;
            if n == 0 {
                return op1 & $mask;
            }
            let v = op1 & $mask;
            let e = n % $bits;
            let res = if $left {
                (v << e | v >> ($bits - e) % $bits) & $mask
            } else {
                (v >> e | v << ($bits - e) % $bits) & $mask
            };
            fill_flags(env);
            let sign = 1u32 << ($bits - 1);
            let cf = if $left { res & 1 != 0 } else { res & sign != 0 };
            let of = if $left {
                (res & 1 != 0) ^ (res & sign != 0)
            } else {
                (res ^ (res << 1)) & sign != 0
            };
            env.set_flag(FLAG_CF, cf);
            env.set_flag(FLAG_OF, of);
            res
        }

        pub extern "C" fn $simple(_env: *mut CpuState, op1: u32, count: u32) -> u32 {
            let n = count & 0x1f;
            if n == 0 {
                return op1 & $mask;
            }
            let v = op1 & $mask;
            let e = n % $bits;
            if $left {
                (v << e | v >> ($bits - e) % $bits) & $mask
            } else {
                (v >> e | v << ($bits - e) % $bits) & $mask
            }
        }
    };
}

rotate_op!(rol_b, rol_b_simple, 8u32, 0xffu32, true);
rotate_op!(rol_w, rol_w_simple, 16u32, 0xffffu32, true);
rotate_op!(rol_d, rol_d_simple, 32u32, 0xffff_ffffu32, true);
rotate_op!(ror_b, ror_b_simple, 8u32, 0xffu32, false);
rotate_op!(ror_w, ror_w_simple, 16u32, 0xffffu32, false);
rotate_op!(ror_d, ror_d_simple, 32u32, 0xffff_ffffu32, false);

macro_rules! rotate_carry_op {
    ($full:ident, $bits:expr, $mask:expr, $left:expr) => {
        pub extern "C" fn $full(env: *mut CpuState, op1: u32, count: u32) -> u32 {
            let env = env_mut(env);
            let n = (count & 0x1f) % ($bits + 1);
            if n == 0 {
                return op1 & $mask;
            }
            let cf = get_cf(env) as u64;
            let v = (op1 & $mask) as u64;
            // Rotate through a (bits+1)-wide value with CF on top.
            let wide = v | cf << $bits;
            let rot = if $left {
                (wide << n | wide >> ($bits + 1 - n)) & ((1u64 << ($bits + 1)) - 1)
            } else {
                (wide >> n | wide << ($bits + 1 - n)) & ((1u64 << ($bits + 1)) - 1)
            };
            let res = (rot as u32) & $mask;
            let newcf = rot >> $bits & 1 != 0;
            let sign = 1u32 << ($bits - 1);
            env.set_flag(FLAG_CF, newcf);
            let of = if $left {
                newcf ^ (res & sign != 0)
            } else {
                (res ^ (res << 1)) & sign != 0
            };
            env.set_flag(FLAG_OF, of);
            res
        }
    };
}

rotate_carry_op!(rcl_b, 8u32, 0xffu32, true);
rotate_carry_op!(rcl_w, 16u32, 0xffffu32, true);
rotate_carry_op!(rcl_d, 32u32, 0xffff_ffffu32, true);
rotate_carry_op!(rcr_b, 8u32, 0xffu32, false);
rotate_carry_op!(rcr_w, 16u32, 0xffffu32, false);
rotate_carry_op!(rcr_d, 32u32, 0xffff_ffffu32, false);

// -- Double-precision shifts --

pub extern "C" fn dshl_w(env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let env = env_mut(env);
    let n = count & 0x1f;
    if n == 0 {
        return op1 & 0xffff;
    }
    let wide = (op1 & 0xffff) << 16 | (op2 & 0xffff);
    let res = if n < 32 { wide << n >> 16 } else { 0 } & 0xffff;
    record(env, FlagKind::DshlW, op1 & 0xffff, n, res);
    res
}

pub extern "C" fn dshl_w_simple(_env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let n = count & 0x1f;
    if n == 0 {
        return op1 & 0xffff;
    }
    let wide = (op1 & 0xffff) << 16 | (op2 & 0xffff);
    if n < 32 {
        wide << n >> 16 & 0xffff
    } else {
        0
    }
}

pub extern "C" fn dshl_d(env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let env = env_mut(env);
    let n = count & 0x1f;
    if n == 0 {
        return op1;
    }
    let wide = (op1 as u64) << 32 | op2 as u64;
    let res = (wide << n >> 32) as u32;
    record(env, FlagKind::DshlD, op1, n, res);
    res
}

pub extern "C" fn dshl_d_simple(_env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let n = count & 0x1f;
    if n == 0 {
        return op1;
    }
    (((op1 as u64) << 32 | op2 as u64) << n >> 32) as u32
}

pub extern "C" fn dshr_w(env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let env = env_mut(env);
    let n = count & 0x1f;
    if n == 0 {
        return op1 & 0xffff;
    }
    let wide = (op2 & 0xffff) << 16 | (op1 & 0xffff);
    let res = wide >> n & 0xffff;
    record(env, FlagKind::DshrW, op1 & 0xffff, n, res);
    res
}

pub extern "C" fn dshr_w_simple(_env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let n = count & 0x1f;
    if n == 0 {
        return op1 & 0xffff;
    }
    ((op2 & 0xffff) << 16 | (op1 & 0xffff)) >> n & 0xffff
}

pub extern "C" fn dshr_d(env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let env = env_mut(env);
    let n = count & 0x1f;
    if n == 0 {
        return op1;
    }
    let wide = (op2 as u64) << 32 | op1 as u64;
    let res = (wide >> n) as u32;
    record(env, FlagKind::DshrD, op1, n, res);
    res
}

pub extern "C" fn dshr_d_simple(_env: *mut CpuState, op1: u32, op2: u32, count: u32) -> u32 {
    let n = count & 0x1f;
    if n == 0 {
        return op1;
    }
    (((op2 as u64) << 32 | op1 as u64) >> n) as u32
}

// -- Multiply / divide: operate on the accumulator registers in place --

fn set_mul_flags(env: &mut CpuState, carry: bool) {
    fill_flags(env);
    env.set_flag(FLAG_CF, carry);
    env.set_flag(FLAG_OF, carry);
}

pub extern "C" fn mul_b(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let res = (env.regs[EAX] & 0xff) * (op & 0xff);
    env.regs[EAX] = env.regs[EAX] & 0xffff_0000 | res & 0xffff;
    set_mul_flags(env, res > 0xff);
    res & 0xffff
}

pub extern "C" fn mul_w(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let res = (env.regs[EAX] & 0xffff) * (op & 0xffff);
    env.regs[EAX] = env.regs[EAX] & 0xffff_0000 | res & 0xffff;
    env.regs[EDX] = env.regs[EDX] & 0xffff_0000 | res >> 16;
    set_mul_flags(env, res > 0xffff);
    res & 0xffff
}

pub extern "C" fn mul_d(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let res = env.regs[EAX] as u64 * op as u64;
    env.regs[EAX] = res as u32;
    env.regs[EDX] = (res >> 32) as u32;
    set_mul_flags(env, res > 0xffff_ffff);
    res as u32
}

pub extern "C" fn imul_b(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let res = (env.regs[EAX] as u8 as i8 as i32) * (op as u8 as i8 as i32);
    env.regs[EAX] = env.regs[EAX] & 0xffff_0000 | (res as u32 & 0xffff);
    set_mul_flags(env, res != res as i8 as i32);
    res as u32 & 0xffff
}

pub extern "C" fn imul_w(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let res = (env.regs[EAX] as u16 as i16 as i32) * (op as u16 as i16 as i32);
    env.regs[EAX] = env.regs[EAX] & 0xffff_0000 | (res as u32 & 0xffff);
    env.regs[EDX] = env.regs[EDX] & 0xffff_0000 | (res as u32 >> 16);
    set_mul_flags(env, res != res as i16 as i32);
    res as u32 & 0xffff
}

pub extern "C" fn imul_d(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let res = (env.regs[EAX] as i32 as i64) * (op as i32 as i64);
    env.regs[EAX] = res as u32;
    env.regs[EDX] = (res >> 32) as u32;
    set_mul_flags(env, res != res as i32 as i64);
    res as u32
}

/// Two-operand IMUL (result to an arbitrary register).
pub extern "C" fn imul_w_reg(env: *mut CpuState, op1: u32, op2: u32) -> u32 {
    let env = env_mut(env);
    let res = (op1 as u16 as i16 as i32) * (op2 as u16 as i16 as i32);
    set_mul_flags(env, res != res as i16 as i32);
    res as u32 & 0xffff
}

pub extern "C" fn imul_d_reg(env: *mut CpuState, op1: u32, op2: u32) -> u32 {
    let env = env_mut(env);
    let res = (op1 as i32 as i64) * (op2 as i32 as i64);
    set_mul_flags(env, res != res as i32 as i64);
    res as u32
}

#[inline]
fn divide_fault(env: &mut CpuState) -> u32 {
    env.exception = EXCEPTION_DE;
    env.exception_error = 0;
    1
}

pub extern "C" fn div_b(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let d = op & 0xff;
    if d == 0 {
        return divide_fault(env);
    }
    let num = env.regs[EAX] & 0xffff;
    let quo = num / d;
    if quo > 0xff {
        return divide_fault(env);
    }
    env.regs[EAX] = env.regs[EAX] & 0xffff_0000 | (num % d) << 8 | quo;
    0
}

pub extern "C" fn div_w(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let d = op & 0xffff;
    if d == 0 {
        return divide_fault(env);
    }
    let num = (env.regs[EDX] & 0xffff) << 16 | env.regs[EAX] & 0xffff;
    let quo = num / d;
    if quo > 0xffff {
        return divide_fault(env);
    }
    env.regs[EAX] = env.regs[EAX] & 0xffff_0000 | quo;
    env.regs[EDX] = env.regs[EDX] & 0xffff_0000 | num % d;
    0
}

pub extern "C" fn div_d(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    if op == 0 {
        return divide_fault(env);
    }
    let num = (env.regs[EDX] as u64) << 32 | env.regs[EAX] as u64;
    let quo = num / op as u64;
    if quo > 0xffff_ffff {
        return divide_fault(env);
    }
    env.regs[EAX] = quo as u32;
    env.regs[EDX] = (num % op as u64) as u32;
    0
}

pub extern "C" fn idiv_b(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let d = op as u8 as i8 as i32;
    if d == 0 {
        return divide_fault(env);
    }
    let num = env.regs[EAX] as u16 as i16 as i32;
    let quo = num / d;
    if quo > 0x7f || quo < -0x80 {
        return divide_fault(env);
    }
    env.regs[EAX] =
        env.regs[EAX] & 0xffff_0000 | ((num % d) as u32 & 0xff) << 8 | quo as u32 & 0xff;
    0
}

pub extern "C" fn idiv_w(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let d = op as u16 as i16 as i32;
    if d == 0 {
        return divide_fault(env);
    }
    let num = ((env.regs[EDX] & 0xffff) << 16 | env.regs[EAX] & 0xffff) as i32;
    let quo = num / d;
    if quo > 0x7fff || quo < -0x8000 {
        return divide_fault(env);
    }
    env.regs[EAX] = env.regs[EAX] & 0xffff_0000 | quo as u32 & 0xffff;
    env.regs[EDX] = env.regs[EDX] & 0xffff_0000 | (num % d) as u32 & 0xffff;
    0
}

pub extern "C" fn idiv_d(env: *mut CpuState, op: u32) -> u32 {
    let env = env_mut(env);
    let d = op as i32 as i64;
    if d == 0 {
        return divide_fault(env);
    }
    let num = ((env.regs[EDX] as u64) << 32 | env.regs[EAX] as u64) as i64;
    let quo = num / d;
    if quo > 0x7fff_ffff || quo < -0x8000_0000 {
        return divide_fault(env);
    }
    env.regs[EAX] = quo as u32;
    env.regs[EDX] = (num % d) as u32;
    0
}

// -- String primitives --
//
// Iteration is capped at the remaining cycle budget; the return value
// is the count NOT completed so the caller can re-enter the same
// instruction later. Control word: bit 0 = REP prefix (count from
// CX/ECX), bit 1 = 32-bit address size.

pub const STR_REP: u32 = 1;
pub const STR_BIG_ADDR: u32 = 2;

struct StringRun {
    count: u32,
    left: u32,
    mask: u32,
    rep: bool,
}

fn string_begin(env: &mut CpuState, ctrl: u32) -> StringRun {
    let rep = ctrl & STR_REP != 0;
    let mask = if ctrl & STR_BIG_ADDR != 0 {
        0xffff_ffff
    } else {
        0xffff
    };
    let mut count = if rep { env.regs[ECX] & mask } else { 1 };
    let mut left = 0;
    let budget = env.cycles.max(1) as u32;
    if rep && count > budget {
        left = count - budget;
        count = budget;
    }
    StringRun {
        count,
        left,
        mask,
        rep,
    }
}

fn string_finish(env: &mut CpuState, run: &StringRun, done: u32) {
    if run.rep {
        let cx = (env.regs[ECX] & run.mask).wrapping_sub(done) & run.mask;
        env.regs[ECX] = env.regs[ECX] & !run.mask | cx;
    }
    env.cycles -= done.max(1) as i32;
}

macro_rules! advance {
    ($env:expr, $reg:expr, $mask:expr, $step:expr) => {{
        let cur = $env.regs[$reg] & $mask;
        $env.regs[$reg] =
            $env.regs[$reg] & !$mask | cur.wrapping_add($step as u32) & $mask;
    }};
}

macro_rules! string_mov {
    ($name:ident, $width:expr) => {
        pub extern "C" fn $name(
            env: *mut CpuState,
            src_base: u32,
            dst_base: u32,
            ctrl: u32,
        ) -> u32 {
            let envp = env;
            let env = env_mut(env);
            let run = string_begin(env, ctrl);
            let step = env.direction * $width;
            let mut done = 0;
            while done < run.count {
                let si = env.regs[ESI] & run.mask;
                let di = env.regs[EDI] & run.mask;
                let val = match env.read_ram(src_base.wrapping_add(si), $width as u32)
                {
                    Some(v) => v,
                    None => break,
                };
                if (env.mem_write)(envp, dst_base.wrapping_add(di), val, $width as u32)
                    != 0
                {
                    break;
                }
                advance!(env, ESI, run.mask, step);
                advance!(env, EDI, run.mask, step);
                done += 1;
            }
            string_finish(env, &run, done);
            run.left + (run.count - done)
        }
    };
}

string_mov!(movs_b, 1i32);
string_mov!(movs_w, 2i32);
string_mov!(movs_d, 4i32);

macro_rules! string_sto {
    ($name:ident, $width:expr, $valmask:expr) => {
        pub extern "C" fn $name(env: *mut CpuState, dst_base: u32, ctrl: u32) -> u32 {
            let envp = env;
            let env = env_mut(env);
            let run = string_begin(env, ctrl);
            let step = env.direction * $width;
            let val = env.regs[EAX] & $valmask;
            let mut done = 0;
            while done < run.count {
                let di = env.regs[EDI] & run.mask;
                if (env.mem_write)(envp, dst_base.wrapping_add(di), val, $width as u32)
                    != 0
                {
                    break;
                }
                advance!(env, EDI, run.mask, step);
                done += 1;
            }
            string_finish(env, &run, done);
            run.left + (run.count - done)
        }
    };
}

string_sto!(stos_b, 1i32, 0xffu32);
string_sto!(stos_w, 2i32, 0xffffu32);
string_sto!(stos_d, 4i32, 0xffff_ffffu32);

macro_rules! string_lod {
    ($name:ident, $width:expr, $valmask:expr) => {
        pub extern "C" fn $name(env: *mut CpuState, src_base: u32, ctrl: u32) -> u32 {
            let env = env_mut(env);
            let run = string_begin(env, ctrl);
            let step = env.direction * $width;
            let mut done = 0;
            while done < run.count {
                let si = env.regs[ESI] & run.mask;
                let val = match env.read_ram(src_base.wrapping_add(si), $width as u32)
                {
                    Some(v) => v,
                    None => break,
                };
                env.regs[EAX] = env.regs[EAX] & !$valmask | val & $valmask;
                advance!(env, ESI, run.mask, step);
                done += 1;
            }
            string_finish(env, &run, done);
            run.left + (run.count - done)
        }
    };
}

string_lod!(lods_b, 1i32, 0xffu32);
string_lod!(lods_w, 2i32, 0xffffu32);
string_lod!(lods_d, 4i32, 0xffff_ffffu32);
