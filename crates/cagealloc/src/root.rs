//! The allocator root: slot spans inside pool-owned super-pages, the
//! immediate-free path the quarantine drains into, and the direct-map path
//! for over-bucket sizes.
//!
//! Every super-page hosts one slot span. The span's metadata lives in the
//! first partition page; slots start right after it and are provisioned with
//! a watermark, so a fresh span never writes freelist entries for slots that
//! were never freed.

use crate::bucket::{bucket_index, bucket_slot_size, BucketDistribution, NUM_BUCKETS};
use crate::freelist::FreelistEntry;
use crate::oom::handle_out_of_memory;
use crate::platform;
use crate::pool::address_space;
use crate::pool::manager::AddressPoolManager;
use crate::pool::PoolHandle;
use crate::quarantine::runtime_stats::{QuarantinePhaseTimes, RuntimeStats};
use crate::quarantine::{GlobalQuarantineBranch, QuarantineConfig, QuarantineRoot};
use crate::sync::{Mutex, MutexGuard};
use crate::util::{
    align_up, PARTITION_PAGE_SIZE, PTR_TAG_MASK, SUPER_PAGE_BASE_MASK, SUPER_PAGE_SIZE,
};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How pointers are tagged on capable hardware. A policy knob threaded
/// through configuration; tagging itself happens in the platform layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MemoryTagging {
    #[default]
    Disabled,
    Synchronous,
}

/// Write-once per-root options.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub with_brp: bool,
    pub use_configurable_pool: bool,
    pub bucket_distribution: BucketDistribution,
    /// Zero slots when they return to the freelist rather than on the next
    /// allocation.
    pub zero_on_free: bool,
    /// Cross-check the size passed to sized frees against the slot.
    pub strict_size_check: bool,
    pub memory_tagging: MemoryTagging,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            with_brp: cfg!(feature = "brp"),
            use_configurable_pool: false,
            bucket_distribution: BucketDistribution::Neutral,
            zero_on_free: false,
            strict_size_check: false,
            memory_tagging: MemoryTagging::Disabled,
        }
    }
}

/// Slot-span metadata, at the base of its super-page (the whole first
/// partition page is reserved for it). For direct maps, `direct_map_size`
/// holds the total mapped bytes and the bucket fields are unused.
#[repr(C)]
pub struct SlotSpanMetadata {
    root: *const AllocatorRoot,
    bucket_index: u32,
    slot_size: u32,
    num_allocated: u32,
    /// Slots handed out at least once. Slots past the watermark are pristine
    /// and not on the freelist.
    num_provisioned: u32,
    /// Slot-start address of the freelist head, or 0.
    freelist_head: usize,
    /// Super-page base of the next span in this bucket's list, or 0.
    next_span: usize,
    direct_map_size: usize,
}

impl SlotSpanMetadata {
    #[inline]
    pub fn from_slot_start(slot_start: usize) -> *mut SlotSpanMetadata {
        (slot_start & SUPER_PAGE_BASE_MASK) as *mut SlotSpanMetadata
    }

    /// # Safety
    /// `object` must point into a live span of this allocator.
    #[inline]
    pub unsafe fn from_object(object: *mut u8) -> *mut SlotSpanMetadata {
        Self::from_slot_start(object as usize & !PTR_TAG_MASK)
    }

    #[inline]
    pub fn is_direct_mapped(&self) -> bool {
        self.direct_map_size != 0
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        if self.is_direct_mapped() {
            self.direct_map_size - PARTITION_PAGE_SIZE
        } else {
            self.slot_size as usize
        }
    }

    #[inline]
    pub fn bucket_index(&self) -> usize {
        debug_assert!(!self.is_direct_mapped());
        self.bucket_index as usize
    }

    /// The root that owns this span.
    ///
    /// # Safety
    /// The span must have been initialized by a live root.
    #[inline]
    pub unsafe fn owning_root(&self) -> &'static AllocatorRoot {
        debug_assert!(!self.root.is_null());
        &*self.root
    }

    #[inline]
    fn super_page_base(&self) -> usize {
        self as *const SlotSpanMetadata as usize
    }

    #[inline]
    fn payload_begin(super_page_base: usize) -> usize {
        super_page_base + PARTITION_PAGE_SIZE
    }

    #[inline]
    fn slot_capacity(slot_size: usize) -> u32 {
        ((SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE) / slot_size) as u32
    }
}

struct RootInner {
    /// Head super-page base per bucket, or 0.
    bucket_span_heads: [usize; NUM_BUCKETS],
}

/// Point-in-time accounting for one root, gathered by walking its spans.
#[derive(Clone, Copy, Debug, Default)]
pub struct RootMemoryStats {
    /// Bytes of committed super-pages backing slot spans.
    pub committed_bytes: usize,
    /// Slots currently handed out (live or quarantined).
    pub allocated_slot_count: usize,
    /// Slots touched at least once; the rest of each span is pristine.
    pub provisioned_slot_count: usize,
    pub span_count: usize,
    /// Bytes committed for direct-mapped allocations.
    pub direct_mapped_bytes: usize,
}

/// One allocator root. Roots are created as leaky singletons (one per
/// allocation token) and never destroyed in production.
pub struct AllocatorRoot {
    settings: Settings,
    pool: PoolHandle,
    inner: Mutex<RootInner>,
    quarantine_root: QuarantineRoot,
    quarantine: GlobalQuarantineBranch,
    runtime_stats: Mutex<RuntimeStats>,
    /// Cheap gate in front of the stats mutex on the free path.
    stats_enabled: AtomicBool,
    direct_mapped_bytes: AtomicUsize,
}

unsafe impl Send for AllocatorRoot {}
unsafe impl Sync for AllocatorRoot {}

impl AllocatorRoot {
    /// Create a root. Ensures the cage exists and binds the root to its
    /// pool: configurable if requested, else the BRP or non-BRP pool
    /// according to `with_brp`.
    pub fn new(settings: Settings) -> AllocatorRoot {
        address_space::init();
        let pool = if settings.use_configurable_pool {
            address_space::configurable_pool()
        } else if settings.with_brp && cfg!(feature = "brp") {
            address_space::brp_pool()
        } else {
            address_space::non_brp_pool()
        };
        assert!(!pool.is_none(), "root's pool is not initialized");

        AllocatorRoot {
            settings,
            pool,
            inner: Mutex::new(RootInner {
                bucket_span_heads: [0; NUM_BUCKETS],
            }),
            quarantine_root: QuarantineRoot::new(),
            quarantine: GlobalQuarantineBranch::new(),
            runtime_stats: Mutex::new(RuntimeStats::new()),
            stats_enabled: AtomicBool::new(false),
            direct_mapped_bytes: AtomicUsize::new(0),
        }
    }

    /// Create a root that lives for the rest of the process. Roots own
    /// committed super-pages and quarantine state; tearing one down safely
    /// is not supported outside test resets.
    pub fn new_leaked(settings: Settings) -> &'static AllocatorRoot {
        Box::leak(Box::new(AllocatorRoot::new(settings)))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[inline]
    pub fn brp_enabled(&self) -> bool {
        cfg!(feature = "brp") && self.settings.with_brp
    }

    pub fn quarantine_root(&self) -> &QuarantineRoot {
        &self.quarantine_root
    }

    pub fn quarantine_branch(&self) -> &GlobalQuarantineBranch {
        &self.quarantine
    }

    /// Apply a quarantine configuration to this root's global branch.
    pub fn configure_quarantine(&'static self, config: QuarantineConfig) {
        self.quarantine.configure(self, &self.quarantine_root, config);
    }

    /// Bytes of in-slot metadata at the end of every bucketed slot.
    #[inline]
    fn in_slot_overhead(&self) -> usize {
        #[cfg(feature = "brp")]
        if self.brp_enabled() {
            return crate::brp::InSlotRefCount::SIZE;
        }
        0
    }

    /// Usable bytes of a slot in `span`, excluding in-slot metadata.
    pub fn slot_usable_size(&self, span: &SlotSpanMetadata) -> usize {
        if span.is_direct_mapped() {
            span.slot_size()
        } else {
            span.slot_size() - self.in_slot_overhead()
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate; aborts through the OOM handler on exhaustion.
    pub fn alloc(&self, size: usize, zero_fill: bool) -> *mut u8 {
        let ptr = self.try_alloc(size, zero_fill);
        if ptr.is_null() {
            handle_out_of_memory(size);
        }
        ptr
    }

    /// Allocate; returns null on exhaustion.
    pub fn try_alloc(&self, size: usize, zero_fill: bool) -> *mut u8 {
        // Zero-size allocations still get a unique, freeable slot.
        let requested = if size == 0 { 1 } else { size };
        let Some(needed) = requested.checked_add(self.in_slot_overhead()) else {
            return core::ptr::null_mut();
        };

        match bucket_index(needed, self.settings.bucket_distribution) {
            Some(bucket) => {
                let slot_size = bucket_slot_size(bucket);
                let slot_start = {
                    let mut inner = self.inner.lock();
                    unsafe { self.alloc_from_bucket(&mut inner, bucket, slot_size) }
                };
                if slot_start == 0 {
                    return core::ptr::null_mut();
                }

                #[cfg(feature = "brp")]
                if self.brp_enabled() {
                    unsafe {
                        crate::brp::InSlotRefCount::from_slot_start_and_size(
                            slot_start, slot_size,
                        )
                        .init_for_allocation();
                    }
                }

                if zero_fill {
                    // Recycled slots may hold zap bytes or stale data.
                    unsafe { core::ptr::write_bytes(slot_start as *mut u8, 0, requested) };
                }
                slot_start as *mut u8
            }
            None => self.alloc_direct_mapped(requested),
        }
    }

    /// Pop a validated freelist entry, bump the provisioning watermark, or
    /// start a new span. Returns a slot-start address, 0 on exhaustion.
    unsafe fn alloc_from_bucket(
        &self,
        inner: &mut RootInner,
        bucket: usize,
        slot_size: usize,
    ) -> usize {
        let mut span_base = inner.bucket_span_heads[bucket];
        while span_base != 0 {
            let span = &mut *(span_base as *mut SlotSpanMetadata);
            if span.freelist_head != 0 {
                let entry = span.freelist_head as *mut FreelistEntry;
                let next = (*entry).get_next::<true>(slot_size);
                span.freelist_head = next as usize;
                span.num_allocated += 1;
                return (*entry).clear_for_allocation();
            }
            if span.num_provisioned < SlotSpanMetadata::slot_capacity(slot_size) {
                let slot_start = SlotSpanMetadata::payload_begin(span_base)
                    + span.num_provisioned as usize * slot_size;
                span.num_provisioned += 1;
                span.num_allocated += 1;
                return slot_start;
            }
            span_base = span.next_span;
        }

        // Every span is full: provision a new super-page from the pool.
        let chunk = AddressPoolManager::get().alloc(self.pool, SUPER_PAGE_SIZE);
        if chunk == 0 {
            return 0;
        }
        platform::commit(chunk as *mut u8, SUPER_PAGE_SIZE);

        let span = chunk as *mut SlotSpanMetadata;
        span.write(SlotSpanMetadata {
            root: self,
            bucket_index: bucket as u32,
            slot_size: slot_size as u32,
            num_allocated: 1,
            num_provisioned: 1,
            freelist_head: 0,
            next_span: inner.bucket_span_heads[bucket],
            direct_map_size: 0,
        });
        inner.bucket_span_heads[bucket] = chunk;

        SlotSpanMetadata::payload_begin(chunk)
    }

    /// Aligned allocation. Slots are 16-byte aligned by construction; larger
    /// alignments are served from the first bucket whose slot size is a
    /// multiple of the alignment (slot starts sit at
    /// `payload + k * slot_size` and the payload offset is a partition page,
    /// so that multiple makes every slot start aligned). Alignments above a
    /// partition page are not supported.
    pub fn try_alloc_aligned(&self, alignment: usize, size: usize, zero_fill: bool) -> *mut u8 {
        debug_assert!(alignment.is_power_of_two());
        if alignment <= crate::bucket::MIN_BUCKETED_SIZE {
            return self.try_alloc(size, zero_fill);
        }
        if alignment > PARTITION_PAGE_SIZE {
            return core::ptr::null_mut();
        }

        let requested = if size == 0 { 1 } else { size };
        let Some(needed) = requested.checked_add(self.in_slot_overhead()) else {
            return core::ptr::null_mut();
        };

        let mut bucket = bucket_index(needed, self.settings.bucket_distribution);
        while let Some(index) = bucket {
            if bucket_slot_size(index) % alignment == 0 {
                break;
            }
            bucket = if index + 1 < NUM_BUCKETS {
                Some(index + 1)
            } else {
                None
            };
        }

        let slot_start = match bucket {
            Some(index) => {
                let slot_size = bucket_slot_size(index);
                let slot_start = {
                    let mut inner = self.inner.lock();
                    unsafe { self.alloc_from_bucket(&mut inner, index, slot_size) }
                };
                if slot_start == 0 {
                    return core::ptr::null_mut();
                }
                #[cfg(feature = "brp")]
                if self.brp_enabled() {
                    unsafe {
                        crate::brp::InSlotRefCount::from_slot_start_and_size(
                            slot_start, slot_size,
                        )
                        .init_for_allocation();
                    }
                }
                if zero_fill {
                    unsafe { core::ptr::write_bytes(slot_start as *mut u8, 0, requested) };
                }
                slot_start
            }
            // Direct maps start a partition page into a super-page, which is
            // aligned for every supported alignment.
            None => self.alloc_direct_mapped(requested) as usize,
        };
        debug_assert!(slot_start == 0 || crate::util::is_aligned(slot_start, alignment));
        slot_start as *mut u8
    }

    /// One dedicated mapping per allocation, bypassing the buckets (and,
    /// downstream, the quarantine).
    fn alloc_direct_mapped(&self, size: usize) -> *mut u8 {
        let Some(with_metadata) = size.checked_add(PARTITION_PAGE_SIZE) else {
            return core::ptr::null_mut();
        };
        let mapped = align_up(with_metadata, SUPER_PAGE_SIZE);
        let chunk = AddressPoolManager::get().alloc(self.pool, mapped);
        if chunk == 0 {
            return core::ptr::null_mut();
        }
        unsafe {
            platform::commit(chunk as *mut u8, mapped);
            let span = chunk as *mut SlotSpanMetadata;
            span.write(SlotSpanMetadata {
                root: self,
                bucket_index: u32::MAX,
                slot_size: 0,
                num_allocated: 1,
                num_provisioned: 1,
                freelist_head: 0,
                next_span: 0,
                direct_map_size: mapped,
            });
        }
        self.direct_mapped_bytes.fetch_add(mapped, Ordering::Relaxed);
        // Freshly committed pages are zero-filled by the kernel.
        (SlotSpanMetadata::payload_begin(chunk)) as *mut u8
    }

    // ------------------------------------------------------------------
    // Deallocation
    // ------------------------------------------------------------------

    /// The `free` entry point: routes through the quarantine unless the
    /// runtime-stats controller has paused it, timing the phases when the
    /// controller is active.
    ///
    /// # Safety
    /// `object` must be a live allocation of this root, or null.
    pub unsafe fn free(&self, object: *mut u8) {
        if object.is_null() {
            return;
        }
        let span_ptr = SlotSpanMetadata::from_object(object);
        let slot_start = self.object_to_slot_start_unchecked(object);
        let (usable_size, direct_mapped, bucket) = {
            let span = &*span_ptr;
            let direct_mapped = span.is_direct_mapped();
            (
                self.slot_usable_size(span),
                direct_mapped,
                if direct_mapped { 0 } else { span.bucket_index() },
            )
        };

        if !self.stats_enabled.load(Ordering::Relaxed) {
            return self
                .quarantine
                .quarantine(object, span_ptr, slot_start, usable_size, None);
        }

        let start = Some(Instant::now());
        if self.runtime_stats.lock().should_pause(start) {
            // Zap latencies are anomalous; bypass the quarantine until the
            // pause deadline passes.
            return self.free_no_hooks_immediate(slot_start);
        }

        let mut times = QuarantinePhaseTimes::default();
        self.quarantine
            .quarantine(object, span_ptr, slot_start, usable_size, Some(&mut times));

        if !direct_mapped {
            let end = Some(Instant::now());
            self.runtime_stats.lock().add_stats(
                bucket,
                start,
                times.purge_start,
                times.zap_start,
                end,
            );
        }
    }

    /// The immediate-free path: return the slot to its span's freelist (or
    /// the whole mapping to the pool for direct maps). No quarantine, no
    /// hooks; this is what the quarantine itself drains into.
    ///
    /// # Safety
    /// `slot_start` must be a live slot start of this root.
    pub unsafe fn free_no_hooks_immediate(&self, slot_start: usize) {
        debug_assert!(slot_start != 0);
        let span_ptr = SlotSpanMetadata::from_slot_start(slot_start);
        let span = &mut *span_ptr;

        if span.is_direct_mapped() {
            let base = span.super_page_base();
            let mapped = span.direct_map_size;
            platform::decommit(base as *mut u8, mapped);
            AddressPoolManager::get().free(self.pool, base, mapped);
            self.direct_mapped_bytes.fetch_sub(mapped, Ordering::Relaxed);
            return;
        }

        let slot_size = span.slot_size();
        if self.settings.zero_on_free {
            core::ptr::write_bytes(slot_start as *mut u8, 0, slot_size);
        }

        let _guard = self.inner.lock();
        debug_assert!(span.num_allocated > 0);
        let head = span.freelist_head as *mut FreelistEntry;
        let entry = FreelistEntry::emplace_and_init_null(slot_start);
        if !head.is_null() {
            (*entry).set_next(head);
        }
        span.freelist_head = entry as usize;
        span.num_allocated -= 1;
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Map an object pointer to its slot start. Interior pointers round down
    /// to their slot.
    ///
    /// # Safety
    /// `object` must point into a live span of this root.
    pub unsafe fn object_to_slot_start_unchecked(&self, object: *mut u8) -> usize {
        let addr = object as usize & !PTR_TAG_MASK;
        let span_base = addr & SUPER_PAGE_BASE_MASK;
        let span = &*(span_base as *const SlotSpanMetadata);
        let payload = SlotSpanMetadata::payload_begin(span_base);
        if span.is_direct_mapped() {
            return payload;
        }
        let slot_size = span.slot_size();
        payload + (addr - payload) / slot_size * slot_size
    }

    /// Usable size of a live allocation.
    ///
    /// # Safety
    /// `object` must be a live allocation of this root.
    pub unsafe fn get_usable_size(&self, object: *mut u8) -> usize {
        let span = &*SlotSpanMetadata::from_object(object);
        self.slot_usable_size(span)
    }

    /// What `try_alloc(size)` would actually make usable.
    pub fn good_size(&self, size: usize) -> usize {
        let requested = if size == 0 { 1 } else { size };
        let overhead = self.in_slot_overhead();
        match requested
            .checked_add(overhead)
            .and_then(|needed| bucket_index(needed, self.settings.bucket_distribution))
        {
            Some(bucket) => bucket_slot_size(bucket) - overhead,
            None => {
                align_up(requested + PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE) - PARTITION_PAGE_SIZE
            }
        }
    }

    /// The slot-start address of the allocation containing `ptr`, if `ptr`
    /// points into this allocator's managed address space.
    ///
    /// # Safety
    /// A managed `ptr` must point into a live allocation (its span metadata
    /// is read).
    pub unsafe fn claimed_address(&self, ptr: *mut u8) -> Option<usize> {
        let addr = ptr as usize & !PTR_TAG_MASK;
        if !address_space::is_managed(addr) {
            return None;
        }
        Some(self.object_to_slot_start_unchecked(ptr))
    }

    /// Walk every span and total up the accounting.
    pub fn memory_stats(&self) -> RootMemoryStats {
        let inner = self.inner.lock();
        let mut stats = RootMemoryStats {
            direct_mapped_bytes: self.direct_mapped_bytes.load(Ordering::Relaxed),
            ..RootMemoryStats::default()
        };
        for &head in inner.bucket_span_heads.iter() {
            let mut span_base = head;
            while span_base != 0 {
                let span = unsafe { &*(span_base as *const SlotSpanMetadata) };
                stats.span_count += 1;
                stats.committed_bytes += SUPER_PAGE_SIZE;
                stats.allocated_slot_count += span.num_allocated as usize;
                stats.provisioned_slot_count += span.num_provisioned as usize;
                span_base = span.next_span;
            }
        }
        stats
    }

    /// Return fully-empty spans to the pool. Quarantined slots still count
    /// as allocated, so a span with entries in quarantine is never released.
    pub fn purge_empty_spans(&self) {
        let mut inner = self.inner.lock();
        for head in inner.bucket_span_heads.iter_mut() {
            let mut prev: usize = 0;
            let mut span_base = *head;
            while span_base != 0 {
                let span = unsafe { &*(span_base as *const SlotSpanMetadata) };
                let next = span.next_span;
                if span.num_allocated == 0 {
                    if prev == 0 {
                        *head = next;
                    } else {
                        unsafe { (*(prev as *mut SlotSpanMetadata)).next_span = next };
                    }
                    // The span's freelist lives inside the payload and
                    // vanishes with it.
                    unsafe {
                        platform::decommit(span_base as *mut u8, SUPER_PAGE_SIZE);
                    }
                    AddressPoolManager::get().free(self.pool, span_base, SUPER_PAGE_SIZE);
                } else {
                    prev = span_base;
                }
                span_base = next;
            }
        }
    }

    // ------------------------------------------------------------------
    // Runtime stats
    // ------------------------------------------------------------------

    /// Turn the runtime-stats controller on (or reset it in place).
    pub fn init_or_reset_runtime_stats(
        &self,
        pause_delay: Duration,
        max_above_avg_zap_delta: Duration,
    ) {
        self.runtime_stats
            .lock()
            .init_or_reset_stats(pause_delay, max_above_avg_zap_delta);
        self.stats_enabled.store(true, Ordering::Relaxed);
    }

    pub fn runtime_stats(&self) -> MutexGuard<'_, RuntimeStats> {
        self.runtime_stats.lock()
    }
}

/// The root that owns the span containing `object`.
///
/// # Safety
/// `object` must point into a live span.
pub unsafe fn root_of(object: *mut u8) -> &'static AllocatorRoot {
    (*SlotSpanMetadata::from_object(object)).owning_root()
}
