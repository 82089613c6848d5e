//! Guest physical RAM.

/// Flat guest RAM buffer. The CPU state block holds a raw pointer into
/// it, so the owner must outlive the core and never reallocate.
pub struct GuestMem {
    buf: Box<[u8]>,
}

impl GuestMem {
    pub fn new(size: u32) -> Self {
        Self {
            buf: vec![0; size as usize].into_boxed_slice(),
        }
    }

    pub fn base(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    pub fn size(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Copy an image into guest RAM.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let a = addr as usize;
        self.buf[a..a + bytes.len()].copy_from_slice(bytes);
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        &self.buf[addr as usize..addr as usize + len]
    }
}
