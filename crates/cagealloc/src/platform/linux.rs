use core::ptr;

/// Reserve an inaccessible address range. MAP_NORESERVE keeps the reservation
/// out of the commit accounting; nothing is readable until `commit`.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve_inaccessible(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Make a reserved range accessible.
///
/// # Safety
/// Region must be page-aligned and inside a live reservation.
pub unsafe fn commit(ptr: *mut u8, size: usize) {
    let ret = libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    );
    debug_assert!(ret == 0, "mprotect(PROT_READ|PROT_WRITE) failed");
}

/// Drop a committed range back to inaccessible and release its pages.
/// MADV_DONTNEED guarantees zero-filled pages on any later recommit.
///
/// # Safety
/// Region must be page-aligned and previously committed.
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    let ret = libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");
    let ret = libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
    debug_assert!(ret == 0, "mprotect(PROT_NONE) failed");
}

/// Release a reservation.
///
/// # Safety
/// `ptr`/`size` must match a `reserve_inaccessible` call.
pub unsafe fn release(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Map anonymous read-write memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap memory.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}
