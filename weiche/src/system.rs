use std::ptr::NonNull;

pub const PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod unix {
    use libc::{MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        let p = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if p == MAP_FAILED { core::ptr::null_mut() } else { p.cast() }
    }

    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        let _ = unsafe { libc::munmap(ptr.cast(), len) };
    }
}

/// Maps `size` bytes of zeroed read/write memory, rounded up to whole pages.
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    let size = size.next_multiple_of(PAGE_SIZE);
    // SAFETY: anonymous mapping, no aliasing with existing memory
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

/// # Safety
/// `ptr` must come from `map_memory` with the same rounded `size`, and the
/// region must not be referenced afterwards.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    let size = size.next_multiple_of(PAGE_SIZE);
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) }
}
