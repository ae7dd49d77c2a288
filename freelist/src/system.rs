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

    // posix mmap and munmap, callers uphold their usual contracts
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

    /// posix memory allocation using mmap, the mapping is zero filled
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
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

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Round `size` up to a whole number of OS pages.
#[inline]
#[must_use]
pub const fn page_align(size: usize) -> usize {
    size.div_ceil(OS_PAGE_SIZE) * OS_PAGE_SIZE
}

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

/// # Safety
/// `ptr` and `size` must describe a mapping returned by [`map_memory`]
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: by contract
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}
