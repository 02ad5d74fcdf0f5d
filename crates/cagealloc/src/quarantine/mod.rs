//! Deferred-free quarantine.
//!
//! A `QuarantineRoot` is a statistics and configuration aggregate, one per
//! allocator root; it never owns slots. A `QuarantineBranch` owns a shuffled
//! list of `(slot_start, usable_size)` pairs and enforces the capacity bound.
//! There can be many branches per root (e.g. one per thread); a thread-bound
//! branch elides its lock entirely, which is why the two variants are two
//! concrete types over one lock trait rather than a runtime flag.
//!
//! The multi-thread branch purges in two phases to keep the lock short: with
//! the lock held it only *unlinks* victims into a scratch array, and the
//! actual deallocations run unlocked afterwards.

pub mod runtime_stats;

use crate::root::{AllocatorRoot, SlotSpanMetadata};
use crate::sync::{BranchLock, NoopLock, RawMutex};
use crate::util::{secure_memset, InsecureRandom, ZAP_BYTE};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use runtime_stats::QuarantinePhaseTimes;
use std::time::Instant;

/// Upper bound on deallocations done per purge phase; also the scratch
/// array size. Phase 1 must not allocate, so the array is fixed-size and
/// reused across calls.
pub const MAX_FREE_TIMES_PER_PURGE: usize = 1024;

type ToBeFreedArray = [usize; MAX_FREE_TIMES_PER_PURGE];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuarantineConfig {
    /// Capacity for a branch in bytes.
    pub capacity_in_bytes: usize,
    pub enable_quarantine: bool,
    pub enable_zapping: bool,
    /// Leak quarantined allocations at branch destruction.
    pub leak_on_destruction: bool,
}

/// Snapshot of a root's counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuarantineStats {
    pub size_in_bytes: usize,
    pub count: usize,
    pub cumulative_count: usize,
    pub cumulative_size_in_bytes: usize,
    pub quarantine_miss_count: usize,
}

/// Per-allocator aggregate counters. All counters accumulate with relaxed
/// ordering; the decrements of `size_in_bytes` on purge use release so they
/// pair with the acquire read in `accumulate_stats`, which observers use
/// after memory has been handed back.
pub struct QuarantineRoot {
    size_in_bytes: AtomicUsize,
    count: AtomicUsize,
    cumulative_count: AtomicUsize,
    cumulative_size_in_bytes: AtomicUsize,
    quarantine_miss_count: AtomicUsize,
}

impl QuarantineRoot {
    pub const fn new() -> Self {
        QuarantineRoot {
            size_in_bytes: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            cumulative_count: AtomicUsize::new(0),
            cumulative_size_in_bytes: AtomicUsize::new(0),
            quarantine_miss_count: AtomicUsize::new(0),
        }
    }

    pub fn accumulate_stats(&self, stats: &mut QuarantineStats) {
        stats.size_in_bytes += self.size_in_bytes.load(Ordering::Acquire);
        stats.count += self.count.load(Ordering::Relaxed);
        stats.cumulative_count += self.cumulative_count.load(Ordering::Relaxed);
        stats.cumulative_size_in_bytes += self.cumulative_size_in_bytes.load(Ordering::Relaxed);
        stats.quarantine_miss_count += self.quarantine_miss_count.load(Ordering::Relaxed);
    }
}

#[derive(Clone, Copy)]
struct QuarantineSlot {
    slot_start: usize,
    usable_size: usize,
}

struct BranchInner {
    /// Quarantined entries. Kept shuffled, so popping the back is popping a
    /// random entry.
    slots: Vec<QuarantineSlot>,
    branch_size_in_bytes: usize,
    /// Non-cryptographic; shuffling only needs unpredictability.
    rng: InsecureRandom,
    config_for_testing: QuarantineConfig,
}

/// A holding area for just-freed slots, belonging to one `QuarantineRoot`.
///
/// `L = RawMutex` is the shared, multi-thread variant;
/// `L = NoopLock` (`ThreadBoundQuarantineBranch`) is the single-thread
/// variant with the lock compiled out.
pub struct QuarantineBranch<L: BranchLock> {
    lock: L,
    inner: UnsafeCell<BranchInner>,
    /// Write-once at `configure`; the allocator root is a leaky singleton
    /// and outlives every branch.
    allocator: AtomicPtr<AllocatorRoot>,
    root: AtomicPtr<QuarantineRoot>,
    enable_quarantine: AtomicBool,
    enable_zapping: AtomicBool,
    leak_on_destruction: AtomicBool,
    /// When positive, this branch temporarily stops accepting entries.
    pause_quarantine: AtomicI32,
    branch_capacity_in_bytes: AtomicUsize,
    /// One reusable scratch array, borrowed by exchanging null in. A thread
    /// that loses the race allocates privately and tries to park its array
    /// here afterwards, keeping the common case allocation-free.
    to_be_freed_working_memory: AtomicPtr<ToBeFreedArray>,
}

pub type GlobalQuarantineBranch = QuarantineBranch<RawMutex>;
pub type ThreadBoundQuarantineBranch = QuarantineBranch<NoopLock>;

unsafe impl Send for QuarantineBranch<RawMutex> {}
unsafe impl Sync for QuarantineBranch<RawMutex> {}

struct Guard<'a, L: BranchLock>(&'a L);

impl<'a, L: BranchLock> Guard<'a, L> {
    fn new(lock: &'a L) -> Self {
        lock.acquire();
        Guard(lock)
    }
}

impl<L: BranchLock> Drop for Guard<'_, L> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl<L: BranchLock> QuarantineBranch<L> {
    pub fn new() -> Self {
        QuarantineBranch {
            lock: L::new(),
            inner: UnsafeCell::new(BranchInner {
                slots: Vec::new(),
                branch_size_in_bytes: 0,
                rng: InsecureRandom::new(0),
                config_for_testing: QuarantineConfig::default(),
            }),
            allocator: AtomicPtr::new(core::ptr::null_mut()),
            root: AtomicPtr::new(core::ptr::null_mut()),
            enable_quarantine: AtomicBool::new(false),
            enable_zapping: AtomicBool::new(false),
            leak_on_destruction: AtomicBool::new(false),
            pause_quarantine: AtomicI32::new(0),
            branch_capacity_in_bytes: AtomicUsize::new(0),
            to_be_freed_working_memory: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Bind this branch to a root and apply `config`. A configured branch
    /// that is reconfigured purges its held entries first.
    pub fn configure(
        &self,
        allocator: &'static AllocatorRoot,
        root: &'static QuarantineRoot,
        config: QuarantineConfig,
    ) {
        assert_eq!(self.pause_quarantine.load(Ordering::Relaxed), 0);
        // Root and branch must agree on the underlying allocator.
        assert!(core::ptr::eq(root, allocator.quarantine_root()));

        let _guard = Guard::new(&self.lock);
        let inner = unsafe { &mut *self.inner.get() };
        inner.config_for_testing = config;

        if self.enable_quarantine.load(Ordering::Relaxed)
            && !self.allocator.load(Ordering::Relaxed).is_null()
        {
            // Already enabled: explicitly drain the existing instance.
            unsafe { self.purge_internal(inner, 0) };
            assert!(inner.slots.is_empty());
            inner.slots.shrink_to_fit();
        }

        inner.rng = InsecureRandom::new(self as *const _ as u64);
        self.allocator.store(
            allocator as *const AllocatorRoot as *mut AllocatorRoot,
            Ordering::Relaxed,
        );
        self.root.store(
            root as *const QuarantineRoot as *mut QuarantineRoot,
            Ordering::Relaxed,
        );
        self.enable_quarantine
            .store(config.enable_quarantine, Ordering::Relaxed);
        self.enable_zapping
            .store(config.enable_zapping, Ordering::Relaxed);
        self.leak_on_destruction
            .store(config.leak_on_destruction, Ordering::Relaxed);
        self.branch_capacity_in_bytes
            .store(config.capacity_in_bytes, Ordering::Relaxed);

        // The shared variant keeps one scratch array parked for the deferred
        // free; the thread-bound variant purges in-line and needs none.
        let fresh = if config.enable_quarantine && L::REAL {
            Box::into_raw(Box::new([0usize; MAX_FREE_TIMES_PER_PURGE]))
        } else {
            core::ptr::null_mut()
        };
        let old = self.to_be_freed_working_memory.swap(fresh, Ordering::Relaxed);
        if !old.is_null() {
            drop(unsafe { Box::from_raw(old) });
        }
    }

    pub fn root(&self) -> &QuarantineRoot {
        let root = self.root.load(Ordering::Relaxed);
        assert!(!root.is_null());
        unsafe { &*root }
    }

    fn allocator(&self) -> &'static AllocatorRoot {
        let allocator = self.allocator.load(Ordering::Relaxed);
        debug_assert!(!allocator.is_null());
        unsafe { &*allocator }
    }

    pub fn capacity_in_bytes(&self) -> usize {
        self.branch_capacity_in_bytes.load(Ordering::Relaxed)
    }

    /// Takes effect on the next `quarantine` call. Shrinking does not purge
    /// eagerly; a subsequent call or an explicit `purge()` brings the branch
    /// under the new limit.
    pub fn set_capacity_in_bytes(&self, capacity_in_bytes: usize) {
        self.branch_capacity_in_bytes
            .store(capacity_in_bytes, Ordering::Relaxed);
    }

    pub fn config_for_testing(&self) -> QuarantineConfig {
        let _guard = Guard::new(&self.lock);
        unsafe { &*self.inner.get() }.config_for_testing
    }

    /// Is `object` currently held by this branch?
    ///
    /// # Safety
    /// `object` must point into a live span of the configured root.
    pub unsafe fn is_quarantined_for_testing(&self, object: *mut u8) -> bool {
        let slot_start = self.allocator().object_to_slot_start_unchecked(object);
        let _guard = Guard::new(&self.lock);
        let inner = &*self.inner.get();
        inner.slots.iter().any(|slot| slot.slot_start == slot_start)
    }

    pub fn branch_size_in_bytes_for_testing(&self) -> usize {
        let _guard = Guard::new(&self.lock);
        unsafe { &*self.inner.get() }.branch_size_in_bytes
    }

    /// Dequarantine every entry held by this branch. Other branches of the
    /// same root remain untouched.
    pub fn purge(&self) {
        if self.allocator.load(Ordering::Relaxed).is_null() {
            return;
        }
        let _guard = Guard::new(&self.lock);
        let inner = unsafe { &mut *self.inner.get() };
        unsafe { self.purge_internal(inner, 0) };
        inner.slots.shrink_to_fit();
    }

    /// Accept a freed slot, or deallocate it immediately when the quarantine
    /// cannot hold it. `phase_times` is filled in when the caller is timing
    /// the purge and zap phases.
    ///
    /// # Safety
    /// `object`/`slot_span`/`slot_start` must describe a live allocation of
    /// the configured root, and for the thread-bound variant the caller must
    /// be the owning thread.
    pub unsafe fn quarantine(
        &self,
        object: *mut u8,
        slot_span: *mut SlotSpanMetadata,
        slot_start: usize,
        usable_size: usize,
        mut phase_times: Option<&mut QuarantinePhaseTimes>,
    ) {
        let allocator = self.allocator();
        if !self.enable_quarantine.load(Ordering::Relaxed)
            || self.pause_quarantine.load(Ordering::Relaxed) > 0
            || (*slot_span).is_direct_mapped()
        {
            return allocator.free_no_hooks_immediate(slot_start);
        }

        debug_assert_eq!(usable_size, allocator.slot_usable_size(&*slot_span));

        let capacity_in_bytes = self.branch_capacity_in_bytes.load(Ordering::Relaxed);
        if capacity_in_bytes < usable_size {
            // Even a fully drained branch cannot hold this entry.
            allocator.free_no_hooks_immediate(slot_start);
            self.root()
                .quarantine_miss_count
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if L::REAL {
            self.quarantine_shared(slot_start, usable_size, capacity_in_bytes, &mut phase_times);
        } else {
            self.quarantine_thread_bound(
                slot_start,
                usable_size,
                capacity_in_bytes,
                &mut phase_times,
            );
        }

        // Update stats (not locked).
        let root = self.root();
        root.count.fetch_add(1, Ordering::Relaxed);
        root.size_in_bytes.fetch_add(usable_size, Ordering::Relaxed);
        root.cumulative_count.fetch_add(1, Ordering::Relaxed);
        root.cumulative_size_in_bytes
            .fetch_add(usable_size, Ordering::Relaxed);

        self.quarantine_epilogue(object, slot_span, slot_start, usable_size, &mut phase_times);
    }

    /// Multi-thread path: phase 1 (unlink) under the lock, phase 2 (free)
    /// outside it.
    unsafe fn quarantine_shared(
        &self,
        slot_start: usize,
        usable_size: usize,
        capacity_in_bytes: usize,
        phase_times: &mut Option<&mut QuarantinePhaseTimes>,
    ) {
        // Borrow the parked working memory, leaving null to mark it in use.
        // Losing the race means paying for a private allocation.
        let borrowed = self
            .to_be_freed_working_memory
            .swap(core::ptr::null_mut(), Ordering::Relaxed);
        let mut to_be_freed: Box<ToBeFreedArray> = if borrowed.is_null() {
            Box::new([0usize; MAX_FREE_TIMES_PER_PURGE])
        } else {
            Box::from_raw(borrowed)
        };
        let mut num_of_slots = 0usize;

        {
            let _guard = Guard::new(&self.lock);
            let inner = &mut *self.inner.get();

            if let Some(times) = phase_times.as_deref_mut() {
                times.purge_start = Some(Instant::now());
            }

            // Dequarantine entries as required, saving the victims for
            // phase 2.
            self.purge_internal_with_deferred_free(
                inner,
                capacity_in_bytes - usable_size,
                &mut to_be_freed,
                &mut num_of_slots,
            );

            inner.branch_size_in_bytes += usable_size;
            inner.slots.push(QuarantineSlot {
                slot_start,
                usable_size,
            });

            // One Fisher-Yates step keeps the list shuffled, so "pop back"
            // stays "pop random".
            let random_index = inner.rng.next_u32() as usize % inner.slots.len();
            let last = inner.slots.len() - 1;
            inner.slots.swap(random_index, last);
        }

        // Phase 2: actually deallocate, without the lock.
        self.batch_free(&to_be_freed, num_of_slots);

        // Park the array again, whether it was borrowed or private; what
        // matters is that the slot is non-null for the next thread whenever
        // possible. Anything already parked there is simply dropped.
        let previous = self
            .to_be_freed_working_memory
            .swap(Box::into_raw(to_be_freed), Ordering::Relaxed);
        if !previous.is_null() {
            drop(Box::from_raw(previous));
        }
    }

    /// Thread-bound path: no deferred-free split; frees run in-line under
    /// the no-op guard.
    unsafe fn quarantine_thread_bound(
        &self,
        slot_start: usize,
        usable_size: usize,
        capacity_in_bytes: usize,
        phase_times: &mut Option<&mut QuarantinePhaseTimes>,
    ) {
        let _guard = Guard::new(&self.lock);
        let inner = &mut *self.inner.get();

        if let Some(times) = phase_times.as_deref_mut() {
            times.purge_start = Some(Instant::now());
        }

        self.purge_internal(inner, capacity_in_bytes - usable_size);

        inner.branch_size_in_bytes += usable_size;
        inner.slots.push(QuarantineSlot {
            slot_start,
            usable_size,
        });

        let random_index = inner.rng.next_u32() as usize % inner.slots.len();
        let last = inner.slots.len() - 1;
        inner.slots.swap(random_index, last);
    }

    unsafe fn quarantine_epilogue(
        &self,
        object: *mut u8,
        slot_span: *mut SlotSpanMetadata,
        slot_start: usize,
        usable_size: usize,
        phase_times: &mut Option<&mut QuarantinePhaseTimes>,
    ) {
        if self.enable_zapping.load(Ordering::Relaxed) {
            if let Some(times) = phase_times.as_deref_mut() {
                times.zap_start = Some(Instant::now());
            }
            secure_memset(object, ZAP_BYTE, usable_size);
        }

        #[cfg(feature = "brp")]
        if self.allocator().brp_enabled() {
            let ref_count = crate::brp::InSlotRefCount::from_slot_start_and_size(
                slot_start,
                (*slot_span).slot_size(),
            );
            ref_count.pre_release_from_allocator();
        }
        #[cfg(not(feature = "brp"))]
        {
            let _ = (slot_start, slot_span);
        }
    }

    /// Dequarantine entries until `branch_size_in_bytes <= target`, freeing
    /// in-line. Only what this branch holds is under its control; a
    /// root-wide bound requires purging every branch in sequence.
    unsafe fn purge_internal(&self, inner: &mut BranchInner, target_size_in_bytes: usize) {
        let allocator = self.allocator();
        let mut freed_count = 0usize;
        let mut freed_size_in_bytes = 0usize;

        while target_size_in_bytes < inner.branch_size_in_bytes {
            // The list is shuffled; the back is a random entry.
            let Some(to_free) = inner.slots.pop() else {
                debug_assert!(false, "branch size out of sync with held slots");
                break;
            };
            debug_assert!(to_free.slot_start != 0);
            allocator.free_no_hooks_immediate(to_free.slot_start);

            freed_count += 1;
            freed_size_in_bytes += to_free.usable_size;
            inner.branch_size_in_bytes -= to_free.usable_size;
        }

        let root = self.root();
        root.size_in_bytes
            .fetch_sub(freed_size_in_bytes, Ordering::Release);
        root.count.fetch_sub(freed_count, Ordering::Relaxed);
    }

    /// Phase 1 of the two-phase purge: unlink victims into `to_be_freed`
    /// (bounded by its capacity) and update the accounting; the caller frees
    /// them after releasing the lock.
    unsafe fn purge_internal_with_deferred_free(
        &self,
        inner: &mut BranchInner,
        target_size_in_bytes: usize,
        to_be_freed: &mut ToBeFreedArray,
        num_of_slots: &mut usize,
    ) {
        *num_of_slots = 0;
        let mut freed_size_in_bytes = 0usize;

        while target_size_in_bytes < inner.branch_size_in_bytes {
            let Some(to_free) = inner.slots.pop() else {
                debug_assert!(false, "branch size out of sync with held slots");
                break;
            };
            to_be_freed[*num_of_slots] = to_free.slot_start;
            *num_of_slots += 1;

            freed_size_in_bytes += to_free.usable_size;
            inner.branch_size_in_bytes -= to_free.usable_size;

            if *num_of_slots >= MAX_FREE_TIMES_PER_PURGE {
                break;
            }
        }

        let root = self.root();
        root.size_in_bytes
            .fetch_sub(freed_size_in_bytes, Ordering::Release);
        root.count.fetch_sub(*num_of_slots, Ordering::Relaxed);
    }

    /// Phase 2: deallocate the victims saved by phase 1.
    unsafe fn batch_free(&self, to_be_freed: &ToBeFreedArray, num_of_slots: usize) {
        let allocator = self.allocator();
        for &slot_start in to_be_freed.iter().take(num_of_slots) {
            debug_assert!(slot_start != 0);
            allocator.free_no_hooks_immediate(slot_start);
        }
    }
}

impl<L: BranchLock> Default for QuarantineBranch<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: BranchLock> Drop for QuarantineBranch<L> {
    fn drop(&mut self) {
        if !self.leak_on_destruction.load(Ordering::Relaxed) {
            self.purge();
        }
        let buffer = self
            .to_be_freed_working_memory
            .swap(core::ptr::null_mut(), Ordering::Relaxed);
        if !buffer.is_null() {
            drop(unsafe { Box::from_raw(buffer) });
        }
    }
}

/// While alive, the branch rejects incoming quarantine requests and routes
/// frees to the immediate path.
pub struct ScopedQuarantineExclusion<'a, L: BranchLock> {
    branch: &'a QuarantineBranch<L>,
}

impl<'a, L: BranchLock> ScopedQuarantineExclusion<'a, L> {
    pub fn new(branch: &'a QuarantineBranch<L>) -> Self {
        branch.pause_quarantine.fetch_add(1, Ordering::Relaxed);
        ScopedQuarantineExclusion { branch }
    }
}

impl<L: BranchLock> Drop for ScopedQuarantineExclusion<'_, L> {
    fn drop(&mut self) {
        self.branch.pause_quarantine.fetch_sub(1, Ordering::Relaxed);
    }
}
