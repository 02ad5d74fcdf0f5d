//! ARM64 Memory Tagging Extension (MTE) support.
//!
//! When running on MTE-capable hardware (ARMv8.5-A+), freed and live slots
//! carry hardware tags, and freelist offsets preserve the tag bits so a
//! decoded pointer faults on tag mismatch. On non-MTE hardware every
//! operation is a no-op and `is_available()` returns false.

use core::sync::atomic::{AtomicBool, Ordering};

static MTE_AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Detect and enable MTE if available.
///
/// # Safety
/// Must be called from single-threaded context (init).
pub unsafe fn init() {
    // Check for MTE support via getauxval(AT_HWCAP2)
    const AT_HWCAP2: libc::c_ulong = 26;
    const HWCAP2_MTE: libc::c_ulong = 1 << 18;

    let hwcap2 = libc::getauxval(AT_HWCAP2);
    if hwcap2 & HWCAP2_MTE == 0 {
        return;
    }

    // Enable MTE in synchronous mode (immediate fault on tag mismatch)
    const PR_SET_TAGGED_ADDR_CTRL: libc::c_int = 55;
    const PR_TAGGED_ADDR_ENABLE: libc::c_ulong = 1;
    const PR_MTE_TCF_SYNC: libc::c_ulong = 1 << 1;
    // Allow all 16 tags (excluding tag 0 which is reserved)
    const PR_MTE_TAG_MASK: libc::c_ulong = 0xfffe << 3;

    let ret = libc::prctl(
        PR_SET_TAGGED_ADDR_CTRL,
        PR_TAGGED_ADDR_ENABLE | PR_MTE_TCF_SYNC | PR_MTE_TAG_MASK,
        0,
        0,
        0,
    );
    if ret == 0 {
        MTE_AVAILABLE.store(true, Ordering::Release);
    }
}

/// Check if MTE is available and enabled.
#[inline(always)]
pub fn is_available() -> bool {
    MTE_AVAILABLE.load(Ordering::Relaxed)
}

/// Generate a random tagged pointer from an untagged base pointer.
/// Uses the IRG (Insert Random Tag) instruction.
///
/// # Safety
/// `ptr` must be a valid pointer. Only meaningful on MTE-enabled hardware.
#[inline(always)]
pub unsafe fn tag_alloc(ptr: *mut u8) -> *mut u8 {
    let tagged: *mut u8;
    core::arch::asm!(
        "irg {out}, {inp}",
        inp = in(reg) ptr,
        out = out(reg) tagged,
        options(nomem, nostack, preserves_flags),
    );
    tagged
}

/// Tag a memory region with the tag from the pointer.
/// Uses STG (Store Allocation Tag) over 16-byte MTE granules.
///
/// # Safety
/// `ptr` must be a tagged pointer from `tag_alloc`; `size` a multiple of 16;
/// the memory mapped with PROT_MTE.
#[inline]
pub unsafe fn tag_region(ptr: *mut u8, size: usize) {
    let mut offset = 0usize;
    while offset < size {
        core::arch::asm!(
            "stg {p}, [{p}]",
            p = in(reg) ptr.add(offset),
            options(nostack, preserves_flags),
        );
        offset += 16;
    }
}
