use std::io;
use std::ptr;

/// JIT code arena backed by mmap'd memory.
///
/// Holds every translated block of the engine in one region. Follows
/// W^X discipline: the arena is executable by default and must be
/// opened with [`CodeArena::open_write`] before any emit or patch, then
/// sealed again with [`CodeArena::seal`]. Emits assert the arena is
/// open, so a stray text write outside an open/seal pair panics instead
/// of faulting.
pub struct CodeArena {
    ptr: *mut u8,
    size: usize,
    offset: usize,
    armed: bool,
}

// SAFETY: CodeArena owns its mmap'd memory exclusively.
unsafe impl Send for CodeArena {}

impl CodeArena {
    /// Allocate a new arena of the given size (rounded up to page size).
    /// Starts out writable; callers seal it once startup emission is done.
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size + page_size - 1) & !(page_size - 1);

        // SAFETY: mmap with MAP_ANONYMOUS | MAP_PRIVATE, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: 0,
            armed: true,
        })
    }

    /// Current write offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Remaining writable bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    /// Raw pointer to the start of the arena.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Base address as an integer, for address arithmetic in emitters.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.ptr as u64
    }

    /// Host address of a given offset.
    #[inline]
    pub fn addr_at(&self, offset: usize) -> u64 {
        assert!(offset <= self.size);
        self.ptr as u64 + offset as u64
    }

    /// Pointer at a given offset.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Set the write offset (e.g. to resume writing at a saved position).
    #[inline]
    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.size);
        self.offset = offset;
    }

    /// Round the write offset up to a multiple of `align` (power of two).
    #[inline]
    pub fn align_to(&mut self, align: usize) {
        debug_assert!(align.is_power_of_two());
        let aligned = (self.offset + align - 1) & !(align - 1);
        assert!(aligned <= self.size, "code arena overflow");
        self.offset = aligned;
    }

    // -- Emit methods --

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        assert!(self.armed, "emit into sealed code arena");
        assert!(self.offset < self.size, "code arena overflow");
        unsafe { self.ptr.add(self.offset).write(val) };
        self.offset += 1;
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        assert!(self.armed, "emit into sealed code arena");
        assert!(self.offset + 2 <= self.size, "code arena overflow");
        unsafe { (self.ptr.add(self.offset) as *mut u16).write_unaligned(val) };
        self.offset += 2;
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        assert!(self.armed, "emit into sealed code arena");
        assert!(self.offset + 4 <= self.size, "code arena overflow");
        unsafe { (self.ptr.add(self.offset) as *mut u32).write_unaligned(val) };
        self.offset += 4;
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        assert!(self.armed, "emit into sealed code arena");
        assert!(self.offset + 8 <= self.size, "code arena overflow");
        unsafe { (self.ptr.add(self.offset) as *mut u64).write_unaligned(val) };
        self.offset += 8;
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        assert!(self.armed, "emit into sealed code arena");
        assert!(
            self.offset + data.len() <= self.size,
            "code arena overflow"
        );
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.add(self.offset),
                data.len(),
            );
        }
        self.offset += data.len();
    }

    /// Patch a u8 at the given offset (for back-patching jumps).
    #[inline]
    pub fn patch_u8(&mut self, offset: usize, val: u8) {
        assert!(self.armed, "patch into sealed code arena");
        assert!(offset < self.size);
        unsafe { self.ptr.add(offset).write(val) };
    }

    /// Patch a u32 at the given offset.
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        assert!(self.armed, "patch into sealed code arena");
        assert!(offset + 4 <= self.size);
        unsafe { (self.ptr.add(offset) as *mut u32).write_unaligned(val) };
    }

    /// Read a u32 at the given offset.
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size);
        unsafe { (self.ptr.add(offset) as *const u32).read_unaligned() }
    }

    // -- Permission management (W^X) --

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Make the arena writable for block emission or patching.
    pub fn open_write(&mut self) -> io::Result<()> {
        if self.armed {
            return Ok(());
        }
        mprotect(self.ptr, self.size, libc::PROT_READ | libc::PROT_WRITE)?;
        self.armed = true;
        Ok(())
    }

    /// Make the arena executable and non-writable.
    pub fn seal(&mut self) -> io::Result<()> {
        if !self.armed {
            return Ok(());
        }
        mprotect(self.ptr, self.size, libc::PROT_READ | libc::PROT_EXEC)?;
        self.armed = false;
        Ok(())
    }

    /// Get the emitted code as a byte slice (up to current offset).
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+offset has been written.
        unsafe { std::slice::from_raw_parts(self.ptr, self.offset) }
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn mprotect(ptr: *mut u8, size: usize, prot: libc::c_int) -> io::Result<()> {
    // SAFETY: ptr/size describe the mapping created in new().
    let ret = unsafe { libc::mprotect(ptr as *mut libc::c_void, size, prot) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
