//! Terminal error reporting. The core never unwinds: corruption and checked
//! allocation failure both end the process with a distinguishing message and
//! the interesting values parked on the stack for minidumps.

/// Abort with a diagnostic message to stderr.
/// This is used when unrecoverable corruption is detected.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        // Write directly to stderr fd (2) -- no allocation needed
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

static OOM_CALLBACK: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Install a hook that runs right before an out-of-memory abort. The
/// embedder typically uses it to note state for crash reporting; it must not
/// allocate and it cannot prevent the abort.
pub fn set_out_of_memory_callback(callback: fn(usize)) {
    OOM_CALLBACK.store(callback as usize, core::sync::atomic::Ordering::Release);
}

/// Checked allocation entry points funnel exhaustion here. The requested size
/// is kept live in a stack slot so it survives into the crash dump.
#[cold]
#[inline(never)]
pub fn handle_out_of_memory(size: usize) -> ! {
    let requested = core::hint::black_box(size);
    let callback = OOM_CALLBACK.load(core::sync::atomic::Ordering::Acquire);
    if callback != 0 {
        let callback: fn(usize) = unsafe { core::mem::transmute(callback) };
        callback(requested);
    }
    let _ = requested;
    abort_with_message("cagealloc: out of memory\n");
}

/// Freelist traversal found an entry that failed validation. `encoded_next`
/// and `shadow` are the raw on-heap values, `slot_size` identifies the
/// bucket; all three are parked on the stack before aborting.
#[cold]
#[inline(never)]
pub fn freelist_corruption_detected(encoded_next: usize, shadow: usize, slot_size: usize) -> ! {
    let first = core::hint::black_box(encoded_next);
    let second = core::hint::black_box(shadow);
    let size = core::hint::black_box(slot_size);
    let _ = (first, second, size);
    abort_with_message("cagealloc: freelist corruption detected\n");
}

/// An in-slot reference-count header failed its consistency check.
#[cold]
#[inline(never)]
pub fn ref_count_corruption_detected(bits: u32) -> ! {
    let raw = core::hint::black_box(bits);
    let _ = raw;
    abort_with_message("cagealloc: ref-count corruption detected\n");
}
