use crate::state::{CpuState, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

/// Identifies the operation that produced the current lazy flag state.
///
/// Shared between the operator table (which records it), `fill_flags`
/// (which evaluates it) and the flags-laziness optimizer / backends
/// (which key their inline call-site replacements on it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FlagKind {
    Unknown = 0,
    AddB,
    AddW,
    AddD,
    AdcB,
    AdcW,
    AdcD,
    SubB,
    SubW,
    SubD,
    SbbB,
    SbbW,
    SbbD,
    OrB,
    OrW,
    OrD,
    AndB,
    AndW,
    AndD,
    XorB,
    XorW,
    XorD,
    TestB,
    TestW,
    TestD,
    CmpB,
    CmpW,
    CmpD,
    IncB,
    IncW,
    IncD,
    DecB,
    DecW,
    DecD,
    NegB,
    NegW,
    NegD,
    ShlB,
    ShlW,
    ShlD,
    ShrB,
    ShrW,
    ShrD,
    SarB,
    SarW,
    SarD,
    RolB,
    RolW,
    RolD,
    RorB,
    RorW,
    RorD,
    DshlW,
    DshlD,
    DshrW,
    DshrD,
}

impl FlagKind {
    pub fn from_raw(v: u32) -> Self {
        if v > Self::DshrD as u32 {
            return Self::Unknown;
        }
        // SAFETY: repr(u32) enum with contiguous discriminants 0..=DshrD,
        // range checked above.
        unsafe { std::mem::transmute(v) }
    }

    /// Operand width in bits.
    pub fn width_bits(self) -> u32 {
        use FlagKind::*;
        match self {
            AddB | AdcB | SubB | SbbB | OrB | AndB | XorB | TestB | CmpB | IncB | DecB
            | NegB | ShlB | ShrB | SarB | RolB | RorB => 8,
            AddW | AdcW | SubW | SbbW | OrW | AndW | XorW | TestW | CmpW | IncW | DecW
            | NegW | ShlW | ShrW | SarW | RolW | RorW | DshlW | DshrW => 16,
            _ => 32,
        }
    }

    #[inline]
    pub fn width_mask(self) -> u32 {
        match self.width_bits() {
            8 => 0xff,
            16 => 0xffff,
            _ => 0xffff_ffff,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u32 {
        1 << (self.width_bits() - 1)
    }
}

#[inline]
fn parity_even(b: u8) -> bool {
    b.count_ones() & 1 == 0
}

/// Materialize CF/PF/AF/ZF/SF/OF from the recorded lazy operation.
///
/// After this the flags word is authoritative and the lazy kind resets
/// to `Unknown`. Calling it with nothing pending is a no-op.
pub fn fill_flags(env: &mut CpuState) {
    use FlagKind::*;

    let kind = FlagKind::from_raw(env.lf_kind);
    if kind == Unknown {
        return;
    }

    let m = kind.width_mask();
    let bits = kind.width_bits();
    let sign = kind.sign_bit();
    let res = env.lf_res & m;
    let v1 = env.lf_var1 & m;
    let v2 = env.lf_var2 & m;
    let oldcf = env.lf_oldcf != 0;

    let keep_cf = matches!(kind, IncB | IncW | IncD | DecB | DecW | DecD);
    let mut f = env.flags & !(FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF);
    if !keep_cf {
        f &= !FLAG_CF;
    }

    let mut cf = false;
    let mut af = false;
    let mut of = false;
    match kind {
        AddB | AddW | AddD => {
            cf = res < v1;
            af = (v1 ^ v2 ^ res) & 0x10 != 0;
            of = (v1 ^ res) & (v2 ^ res) & sign != 0;
        }
        AdcB | AdcW | AdcD => {
            cf = if oldcf { res <= v1 } else { res < v1 };
            af = (v1 ^ v2 ^ res) & 0x10 != 0;
            of = (v1 ^ res) & (v2 ^ res) & sign != 0;
        }
        SubB | SubW | SubD | CmpB | CmpW | CmpD => {
            cf = v1 < v2;
            af = (v1 ^ v2 ^ res) & 0x10 != 0;
            of = (v1 ^ v2) & (v1 ^ res) & sign != 0;
        }
        SbbB | SbbW | SbbD => {
            cf = v1 < res || (oldcf && v2 == m);
            af = (v1 ^ v2 ^ res) & 0x10 != 0;
            of = (v1 ^ v2) & (v1 ^ res) & sign != 0;
        }
        OrB | OrW | OrD | AndB | AndW | AndD | XorB | XorW | XorD | TestB | TestW
        | TestD => {}
        IncB | IncW | IncD => {
            af = res & 0xf == 0;
            of = res == sign;
        }
        DecB | DecW | DecD => {
            af = res & 0xf == 0xf;
            of = res == sign.wrapping_sub(1) & m;
        }
        NegB | NegW | NegD => {
            cf = v1 != 0;
            af = v1 & 0xf != 0;
            of = v1 == sign;
        }
        ShlB | ShlW | ShlD => {
            // var2 holds the masked shift count, never zero here.
            cf = v2 <= bits && (v1 >> (bits - v2)) & 1 != 0;
            af = v2 & 0x1f != 0;
            of = (res ^ v1) & sign != 0;
        }
        ShrB | ShrW | ShrD => {
            cf = v2 <= 32 && (v1 >> (v2 - 1)) & 1 != 0;
            of = v1 & sign != 0;
        }
        SarB | SarW | SarD => {
            let sx = if v1 & sign != 0 { v1 | !m } else { v1 };
            cf = (sx >> (v2 - 1).min(31)) & 1 != 0;
        }
        DshlW | DshlD => {
            cf = (v1 >> (bits - v2)) & 1 != 0;
            of = (res ^ v1) & sign != 0;
        }
        DshrW | DshrD => {
            cf = (v1 >> (v2 - 1)) & 1 != 0;
            of = (res ^ v1) & sign != 0;
        }
        // Rotates and carry rotates resolve their flags eagerly and
        // never leave a lazy record behind.
        RolB | RolW | RolD | RorB | RorW | RorD | Unknown => {}
    }

    if cf {
        f |= FLAG_CF;
    }
    if af {
        f |= FLAG_AF;
    }
    if of {
        f |= FLAG_OF;
    }
    if res == 0 {
        f |= FLAG_ZF;
    }
    if res & sign != 0 {
        f |= FLAG_SF;
    }
    if parity_even(res as u8) {
        f |= FLAG_PF;
    }

    env.flags = f;
    env.lf_kind = Unknown as u32;
}

/// Current carry flag, evaluating lazy state without disturbing it more
/// than a full fill would.
pub fn get_cf(env: &mut CpuState) -> bool {
    fill_flags(env);
    env.flags & FLAG_CF != 0
}
