use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    // POSIX mmap and munmap. Callers pass a null hint with fd -1 for
    // anonymous mappings, and unmap only whole ranges they mapped.
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// Reserves and commits `len` zeroed, readable and writable bytes.
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping, no file descriptor involved
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap with the same length
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

#[inline(always)]
pub const fn round_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: the result is null-checked below
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// An owned, page-aligned, zero-filled mapping. Unmapped on drop.
#[derive(Debug)]
pub struct VirtualMemory {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is plain memory owned by this value; it has no thread
// affinity.
unsafe impl Send for VirtualMemory {}

impl VirtualMemory {
    /// Maps at least `size` bytes, rounded up to the OS page size.
    pub fn allocate(size: usize) -> Option<Self> {
        let size = round_up(size.max(1), OS_PAGE_SIZE);
        map_memory(size).map(|base| Self { base, size })
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Overwrites `start..start + len` with `byte`. Used in debug builds to
    /// poison released memory.
    pub fn fill(&self, start: usize, len: usize, byte: u8) {
        assert!(start >= self.start() && start + len <= self.end());
        // SAFETY: range checked against the mapping
        unsafe { (start as *mut u8).write_bytes(byte, len) };
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        unmap_memory(self.base, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_page_rounded_and_zeroed() {
        let memory = VirtualMemory::allocate(100).expect("map memory");
        assert_eq!(memory.size(), OS_PAGE_SIZE);
        assert!(memory.start().is_multiple_of(OS_PAGE_SIZE));
        let first = unsafe { (memory.start() as *const u64).read() };
        assert_eq!(first, 0);
        assert!(memory.contains(memory.end() - 1));
        assert!(!memory.contains(memory.end()));
    }

    #[test]
    fn test_fill() {
        let memory = VirtualMemory::allocate(OS_PAGE_SIZE).expect("map memory");
        memory.fill(memory.start() + 8, 8, 0xab);
        let word = unsafe { ((memory.start() + 8) as *const u64).read() };
        assert_eq!(word, 0xabab_abab_abab_abab);
    }
}
