use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED_UNCONTENDED: u32 = 1;
const LOCKED_CONTENDED: u32 = 2;

/// Hold times under these locks are short (a bitmap scan, a list splice), so
/// contenders spin this many rounds before handing the wait to the kernel.
const SPIN_COUNT: u32 = 64;

/// A spinning futex mutex. std::sync::Mutex is off limits here because it
/// may allocate; this one is a single word and never does.
///
/// Contended acquisition runs in two phases: a bounded user-space spin, then
/// a kernel wait. The state word distinguishes "locked, nobody waiting" from
/// "locked, sleepers present" so the unlock fast path can skip the wake
/// syscall entirely.
pub struct RawMutex {
    state: AtomicU32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        self.lock_slow();
    }

    /// Try to lock without blocking. Returns true if lock was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(
                UNLOCKED,
                LOCKED_UNCONTENDED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[cold]
    fn lock_slow(&self) {
        // Spin phase: the holder is usually gone within a few rounds.
        for _ in 0..SPIN_COUNT {
            if self.try_lock() {
                return;
            }
            core::hint::spin_loop();
        }

        // Sleep phase. From here on the lock is marked contended, so the
        // eventual unlock issues a wake. The swap re-marks contention every
        // time we come back from the kernel, even if we took the lock over
        // from another sleeper.
        while self.state.swap(LOCKED_CONTENDED, Ordering::Acquire) != UNLOCKED {
            self.futex_wait();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == LOCKED_CONTENDED {
            self.futex_wake_one();
        }
    }

    #[cfg(target_os = "linux")]
    fn futex_wait(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicU32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                LOCKED_CONTENDED as libc::c_int,
                core::ptr::null::<libc::timespec>(),
            );
        }
    }

    /// No futex outside Linux; fall back to yielding the spin.
    #[cfg(not(target_os = "linux"))]
    fn futex_wait(&self) {
        core::hint::spin_loop();
    }

    #[cfg(target_os = "linux")]
    #[cold]
    fn futex_wake_one(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1 as libc::c_int,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn futex_wake_one(&self) {}
}

/// `RawMutex` plus the data it guards; the usual allocation-free stand-in
/// for std::sync::Mutex.
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

/// Lock policy for quarantine branches. The multi-thread branch uses the real
/// futex mutex; the thread-bound branch substitutes `NoopLock` so the hot
/// path carries no atomic RMW at all.
pub trait BranchLock {
    const REAL: bool;

    fn new() -> Self;
    fn acquire(&self);
    fn release(&self);
}

impl BranchLock for RawMutex {
    const REAL: bool = true;

    fn new() -> Self {
        RawMutex::new()
    }

    #[inline]
    fn acquire(&self) {
        self.lock();
    }

    #[inline]
    fn release(&self) {
        self.unlock();
    }
}

/// Single-thread stand-in for `RawMutex`. Acquire/release compile to nothing.
pub struct NoopLock;

impl BranchLock for NoopLock {
    const REAL: bool = false;

    fn new() -> Self {
        NoopLock
    }

    #[inline(always)]
    fn acquire(&self) {}

    #[inline(always)]
    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mutex_mutual_exclusion() {
        let m = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 80_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn contended_unlock_wakes_a_sleeper() {
        // Hold the lock long enough that the contender exhausts its spin
        // phase and has to sleep in the kernel, then release and make sure
        // it comes back.
        let m = Arc::new(Mutex::new(false));
        let g = m.lock();
        let waiter = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                *m.lock() = true;
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(g);
        waiter.join().unwrap();
        assert!(*m.lock());
    }
}
