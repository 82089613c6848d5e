//! ModRM decoding and effective address emission.
//!
//! `fill_ea` leaves the linear address in `Reg::Addr`, which survives
//! generated calls, so a read-modify-write form computes its address
//! once. `Reg::Op2` is scratch while the address is built.

use drc_backend::Reg;
use drc_core::state::{DS, EBP, EBX, EDI, ESI, ESP, SS};

use crate::ctx::{DResult, TransContext};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mods {
    pub md: u8,
    pub reg: usize,
    pub rm: usize,
}

impl Mods {
    #[inline]
    pub fn is_reg(self) -> bool {
        self.md == 3
    }
}

impl From<u8> for Mods {
    fn from(b: u8) -> Self {
        Self {
            md: b >> 6,
            reg: (b >> 3) as usize & 7,
            rm: b as usize & 7,
        }
    }
}

impl TransContext<'_> {
    pub(crate) fn fetch_modrm(&mut self) -> DResult<Mods> {
        Ok(Mods::from(self.fetchb()?))
    }

    /// Emit the effective address of a memory operand into `Reg::Addr`.
    /// `with_seg` adds the segment base (LEA leaves it off).
    pub(crate) fn fill_ea(&mut self, m: Mods, with_seg: bool) -> DResult<()> {
        if self.big_addr() {
            self.fill_ea32(m, with_seg)
        } else {
            self.fill_ea16(m, with_seg)
        }
    }

    fn fill_ea16(&mut self, m: Mods, with_seg: bool) -> DResult<()> {
        let (base, index, defseg) = match m.rm {
            0 => (Some(EBX), Some(ESI), DS),
            1 => (Some(EBX), Some(EDI), DS),
            2 => (Some(EBP), Some(ESI), SS),
            3 => (Some(EBP), Some(EDI), SS),
            4 => (Some(ESI), None, DS),
            5 => (Some(EDI), None, DS),
            6 if m.md == 0 => (None, None, DS),
            6 => (Some(EBP), None, SS),
            _ => (Some(EBX), None, DS),
        };
        let disp = match m.md {
            0 if m.rm == 6 => self.fetchw()? as u32,
            1 => self.fetchb()? as i8 as i16 as u16 as u32,
            2 => self.fetchw()? as u32,
            _ => 0,
        };
        let base_addr = base.map(|r| self.env.addr_of_reg(r));
        let index_addr = index.map(|r| self.env.addr_of_reg(r));
        let seg_addr =
            with_seg.then(|| self.env.addr_of_seg_phys(self.seg_or(defseg)));

        let (g, a) = self.ga();
        match base_addr {
            Some(b) => {
                g.mov_word_to_reg(a, Reg::Addr, b, false);
                if let Some(i) = index_addr {
                    g.add_word_to_reg(a, Reg::Addr, i, false);
                }
                if disp != 0 {
                    g.add_imm(a, Reg::Addr, disp);
                }
                // The 16-bit arithmetic above may leave junk upstairs.
                g.extend_word(a, false, Reg::Addr);
            }
            None => g.mov_reg_imm(a, Reg::Addr, disp),
        }
        if let Some(s) = seg_addr {
            g.add_word_to_reg(a, Reg::Addr, s, true);
        }
        Ok(())
    }

    fn fill_ea32(&mut self, m: Mods, with_seg: bool) -> DResult<()> {
        let mut base = Some(m.rm);
        let mut index = None;
        let mut scale = 0u8;
        if m.rm == 4 {
            let sib = self.fetchb()?;
            scale = sib >> 6;
            let idx = (sib >> 3) as usize & 7;
            if idx != ESP {
                index = Some(idx);
            }
            let b = sib as usize & 7;
            base = if b == EBP && m.md == 0 { None } else { Some(b) };
        } else if m.rm == EBP && m.md == 0 {
            base = None;
        }
        let disp = match (m.md, base) {
            (0, None) => self.fetchd()?,
            (1, _) => self.fetchb()? as i8 as i32 as u32,
            (2, _) => self.fetchd()?,
            _ => 0,
        };
        let defseg = match base {
            Some(EBP) | Some(ESP) => SS,
            _ => DS,
        };
        let base_addr = base.map(|r| self.env.addr_of_reg(r));
        let index_addr = index.map(|r| self.env.addr_of_reg(r));
        let seg_addr =
            with_seg.then(|| self.env.addr_of_seg_phys(self.seg_or(defseg)));

        let (g, a) = self.ga();
        match base_addr {
            Some(b) => {
                g.mov_word_to_reg(a, Reg::Addr, b, true);
                if let Some(i) = index_addr {
                    g.mov_word_to_reg(a, Reg::Op2, i, true);
                    g.lea(a, Reg::Addr, Some(Reg::Op2), scale, disp);
                } else if disp != 0 {
                    g.add_imm(a, Reg::Addr, disp);
                }
            }
            None => match index_addr {
                Some(i) => {
                    g.mov_reg_imm(a, Reg::Addr, disp);
                    g.mov_word_to_reg(a, Reg::Op2, i, true);
                    g.lea(a, Reg::Addr, Some(Reg::Op2), scale, 0);
                }
                None => g.mov_reg_imm(a, Reg::Addr, disp),
            },
        }
        if let Some(s) = seg_addr {
            g.add_word_to_reg(a, Reg::Addr, s, true);
        }
        Ok(())
    }
}
