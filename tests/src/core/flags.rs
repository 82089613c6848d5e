use drc_core::flags::fill_flags;
use drc_core::ops;
use drc_core::state::{FLAG_AF, FLAG_CF, FLAG_OF, FLAG_SF, FLAG_ZF};
use drc_core::FlagKind;

use super::bare_env;

#[test]
fn add_byte_wraps_and_sets_carry_zero() {
    let mut env = bare_env();
    let res = ops::add_b(&mut *env, 0xff, 1);
    assert_eq!(res, 0);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_CF, 0);
    assert_ne!(env.flags & FLAG_ZF, 0);
    assert_ne!(env.flags & FLAG_AF, 0);
    assert_eq!(env.flags & FLAG_OF, 0);
}

#[test]
fn add_signed_overflow() {
    let mut env = bare_env();
    let res = ops::add_b(&mut *env, 0x7f, 1);
    assert_eq!(res, 0x80);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_OF, 0);
    assert_ne!(env.flags & FLAG_SF, 0);
    assert_eq!(env.flags & FLAG_CF, 0);
}

#[test]
fn cmp_sets_borrow() {
    let mut env = bare_env();
    ops::cmp_w(&mut *env, 1, 2);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_CF, 0);
    assert_ne!(env.flags & FLAG_SF, 0);
    assert_eq!(env.flags & FLAG_ZF, 0);
}

#[test]
fn adc_consumes_pending_carry() {
    let mut env = bare_env();
    // Leave a pending lazy op whose carry is set.
    ops::add_b(&mut *env, 0xff, 2);
    let res = ops::adc_b(&mut *env, 10, 20);
    assert_eq!(res, 31);
}

#[test]
fn adc_simple_twin_still_consumes_carry() {
    let mut env = bare_env();
    ops::add_b(&mut *env, 0xff, 2);
    let res = ops::adc_b_simple(&mut *env, 10, 20);
    assert_eq!(res, 31);
}

#[test]
fn simple_twin_leaves_no_lazy_record() {
    let mut env = bare_env();
    ops::add_d_simple(&mut *env, 1, 2);
    assert_eq!(env.lf_kind, FlagKind::Unknown as u32);
}

#[test]
fn inc_preserves_carry() {
    let mut env = bare_env();
    ops::add_b(&mut *env, 0xff, 1);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_CF, 0);
    let res = ops::inc_w(&mut *env, 0xffff);
    assert_eq!(res, 0);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_CF, 0);
    assert_ne!(env.flags & FLAG_ZF, 0);
}

#[test]
fn neg_sets_carry_for_nonzero_operand() {
    let mut env = bare_env();
    let res = ops::neg_b(&mut *env, 5);
    assert_eq!(res, 0xfb);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_CF, 0);
    let res = ops::neg_b(&mut *env, 0);
    assert_eq!(res, 0);
    fill_flags(&mut env);
    assert_eq!(env.flags & FLAG_CF, 0);
}

#[test]
fn shl_shifts_top_bit_into_carry() {
    let mut env = bare_env();
    let res = ops::shl_b(&mut *env, 0x80, 1);
    assert_eq!(res, 0);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_CF, 0);
    assert_ne!(env.flags & FLAG_ZF, 0);
}

#[test]
fn shift_by_zero_preserves_pending_flags() {
    let mut env = bare_env();
    ops::add_b(&mut *env, 0xff, 1);
    let res = ops::shl_b(&mut *env, 0x40, 0);
    assert_eq!(res, 0x40);
    fill_flags(&mut env);
    // The zero-count shift must not have overwritten the add's flags.
    assert_ne!(env.flags & FLAG_CF, 0);
    assert_ne!(env.flags & FLAG_ZF, 0);
}

#[test]
fn operator_masks_junk_upper_bits() {
    let mut env = bare_env();
    // Byte operators must ignore everything above bit 7; the translator
    // passes host registers with live upper bits.
    let res = ops::add_b(&mut *env, 0xffff_ff01, 0xabcd_0002);
    assert_eq!(res, 3);
    fill_flags(&mut env);
    assert_eq!(env.flags & FLAG_CF, 0);
}

#[test]
fn fill_flags_is_idempotent() {
    let mut env = bare_env();
    ops::add_b(&mut *env, 0xff, 1);
    fill_flags(&mut env);
    let first = env.flags;
    fill_flags(&mut env);
    assert_eq!(env.flags, first);
    assert_eq!(env.lf_kind, FlagKind::Unknown as u32);
}

#[test]
fn two_operand_imul_detects_overflow() {
    let mut env = bare_env();
    let res = ops::imul_w_reg(&mut *env, 0x1234, 2);
    assert_eq!(res, 0x2468);
    fill_flags(&mut env);
    assert_eq!(env.flags & FLAG_CF, 0);

    ops::imul_w_reg(&mut *env, 0x4000, 4);
    fill_flags(&mut env);
    assert_ne!(env.flags & FLAG_CF, 0);
    assert_ne!(env.flags & FLAG_OF, 0);
}

#[test]
fn divide_by_zero_raises_de() {
    let mut env = bare_env();
    env.regs[0] = 100;
    let fault = ops::div_b(&mut *env, 0);
    assert_eq!(fault, 1);
    assert_eq!(env.exception, drc_core::state::EXCEPTION_DE);
}

#[test]
fn word_divide_splits_quotient_and_remainder() {
    let mut env = bare_env();
    env.regs[0] = 1000; // AX
    env.regs[2] = 0; // DX
    let fault = ops::div_w(&mut *env, 7);
    assert_eq!(fault, 0);
    assert_eq!(env.regs[0] & 0xffff, 142);
    assert_eq!(env.regs[2] & 0xffff, 6);
}
