use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default per-branch quarantine capacity when nothing is configured.
pub const DEFAULT_QUARANTINE_CAPACITY: usize = 1024 * 1024; // 1 MiB

static QUARANTINE_CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_QUARANTINE_CAPACITY);
static QUARANTINE_DISABLED: AtomicBool = AtomicBool::new(false);
static CONFIG_READ: AtomicBool = AtomicBool::new(false);

/// Read configuration overrides from environment variables. Runs once, from
/// the root-creation slow path (under its spin lock, so single-threaded).
pub fn read_config() {
    if CONFIG_READ.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe {
        if let Some(val) = getenv_usize(b"CAGEALLOC_QUARANTINE_CAPACITY\0") {
            QUARANTINE_CAPACITY.store(val, Ordering::Relaxed);
        }
        let key = b"CAGEALLOC_DISABLE_QUARANTINE\0".as_ptr() as *const libc::c_char;
        if !libc::getenv(key).is_null() {
            QUARANTINE_DISABLED.store(true, Ordering::Relaxed);
        }
    }
}

pub fn quarantine_capacity() -> usize {
    QUARANTINE_CAPACITY.load(Ordering::Relaxed)
}

pub fn quarantine_disabled() -> bool {
    QUARANTINE_DISABLED.load(Ordering::Relaxed)
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv, which must not race with setenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually; no allocation.
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
