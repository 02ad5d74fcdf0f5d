//! The stable surface a symbol-interception shim calls into: a table of
//! function pointers plus the token-indexed allocator roots behind it.
//!
//! Roots are leaky singletons with double-checked publication over a spin
//! lock; the shim may call in before any runtime is up, so nothing here
//! relies on static constructors or std lazy types.

use crate::config;
use crate::oom::{abort_with_message, handle_out_of_memory};
use crate::pool::address_space;
use crate::quarantine::{QuarantineConfig, ThreadBoundQuarantineBranch};
use crate::root::{root_of, AllocatorRoot, MemoryTagging, Settings};
use crate::sync::Mutex;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Number of parallel allocator roots selectable by token.
pub const MAX_ALLOC_TOKENS: usize = 4;

/// Selects one of the pre-created allocator roots. Token 0 is the default.
/// Tokens segregate call sites without any per-object tag on the slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AllocToken(u8);

impl AllocToken {
    pub const DEFAULT: AllocToken = AllocToken(0);

    pub fn new(value: u8) -> AllocToken {
        assert!((value as usize) < MAX_ALLOC_TOKENS);
        AllocToken(value)
    }

    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }
}

struct SpinGuard<'a>(&'a AtomicBool);

impl<'a> SpinGuard<'a> {
    fn new(lock: &'a AtomicBool) -> Self {
        // Weak CAS in a retry loop; relaxed on failure since failure implies
        // no ordering.
        while lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinGuard(lock)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One-time allocator-root creation cannot use std lazy statics (the first
/// allocation may come from arbitrary early contexts), so: double-checked
/// publication with a spin-lock fallback.
struct LeakySingleton {
    instance: AtomicPtr<AllocatorRoot>,
    initialization_lock: AtomicBool,
}

impl LeakySingleton {
    const fn new() -> Self {
        LeakySingleton {
            instance: AtomicPtr::new(core::ptr::null_mut()),
            initialization_lock: AtomicBool::new(false),
        }
    }

    #[inline]
    fn get(&self) -> &'static AllocatorRoot {
        let instance = self.instance.load(Ordering::Acquire);
        if !instance.is_null() {
            return unsafe { &*instance };
        }
        self.get_slow()
    }

    #[cold]
    fn get_slow(&self) -> &'static AllocatorRoot {
        let _lock = SpinGuard::new(&self.initialization_lock);

        // Someone beat us.
        let instance = self.instance.load(Ordering::Relaxed);
        if !instance.is_null() {
            return unsafe { &*instance };
        }

        config::read_config();
        let root = AllocatorRoot::new_leaked(Settings::default());
        root.configure_quarantine(QuarantineConfig {
            capacity_in_bytes: config::quarantine_capacity(),
            enable_quarantine: !config::quarantine_disabled(),
            enable_zapping: true,
            leak_on_destruction: false,
        });
        self.instance.store(
            root as *const AllocatorRoot as *mut AllocatorRoot,
            Ordering::Release,
        );
        root
    }

    fn replace(&self, new_instance: &'static AllocatorRoot) {
        let _lock = SpinGuard::new(&self.initialization_lock);
        self.instance.store(
            new_instance as *const AllocatorRoot as *mut AllocatorRoot,
            Ordering::Release,
        );
    }
}

static ROOTS: [LeakySingleton; MAX_ALLOC_TOKENS] = [
    LeakySingleton::new(),
    LeakySingleton::new(),
    LeakySingleton::new(),
    LeakySingleton::new(),
];

static ORIGINAL_ROOTS: [AtomicPtr<AllocatorRoot>; MAX_ALLOC_TOKENS] = [
    AtomicPtr::new(core::ptr::null_mut()),
    AtomicPtr::new(core::ptr::null_mut()),
    AtomicPtr::new(core::ptr::null_mut()),
    AtomicPtr::new(core::ptr::null_mut()),
];

static ROOTS_FINALIZED: AtomicBool = AtomicBool::new(false);

/// The root behind `token`, creating it on first use.
#[inline]
pub fn allocator(token: AllocToken) -> &'static AllocatorRoot {
    ROOTS[token.value() as usize].get()
}

/// The pre-`configure_partitions` root for `token`, if it was replaced. The
/// replaced roots remain queryable for late-binding statistics.
pub fn original_allocator(token: AllocToken) -> Option<&'static AllocatorRoot> {
    let instance = ORIGINAL_ROOTS[token.value() as usize].load(Ordering::Acquire);
    if instance.is_null() {
        None
    } else {
        Some(unsafe { &*instance })
    }
}

pub fn allocator_configuration_finalized() -> bool {
    ROOTS_FINALIZED.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

/// The ABI the shim sees. Checked entry points abort on failure; the
/// `*_unchecked` variants return null instead.
pub struct AllocatorDispatch {
    pub alloc: unsafe fn(size: usize, token: AllocToken, ctx: *mut c_void) -> *mut u8,
    pub alloc_unchecked: unsafe fn(size: usize, token: AllocToken, ctx: *mut c_void) -> *mut u8,
    pub alloc_zero_initialized:
        unsafe fn(n: usize, size: usize, token: AllocToken, ctx: *mut c_void) -> *mut u8,
    pub alloc_aligned:
        unsafe fn(alignment: usize, size: usize, token: AllocToken, ctx: *mut c_void) -> *mut u8,
    pub realloc:
        unsafe fn(ptr: *mut u8, size: usize, token: AllocToken, ctx: *mut c_void) -> *mut u8,
    pub realloc_unchecked:
        unsafe fn(ptr: *mut u8, size: usize, token: AllocToken, ctx: *mut c_void) -> *mut u8,
    pub aligned_realloc: unsafe fn(
        ptr: *mut u8,
        size: usize,
        alignment: usize,
        token: AllocToken,
        ctx: *mut c_void,
    ) -> *mut u8,
    pub aligned_realloc_unchecked: unsafe fn(
        ptr: *mut u8,
        size: usize,
        alignment: usize,
        token: AllocToken,
        ctx: *mut c_void,
    ) -> *mut u8,
    pub free: unsafe fn(ptr: *mut u8, ctx: *mut c_void),
    pub free_with_size: unsafe fn(ptr: *mut u8, size: usize, ctx: *mut c_void),
    pub free_with_alignment: unsafe fn(ptr: *mut u8, alignment: usize, ctx: *mut c_void),
    pub free_with_size_and_alignment:
        unsafe fn(ptr: *mut u8, size: usize, alignment: usize, ctx: *mut c_void),
    pub get_size_estimate: unsafe fn(ptr: *mut u8, ctx: *mut c_void) -> usize,
    pub batch_malloc: unsafe fn(
        size: usize,
        results: *mut *mut u8,
        num_requested: usize,
        token: AllocToken,
        ctx: *mut c_void,
    ) -> usize,
    pub batch_free: unsafe fn(ptrs: *const *mut u8, num: usize, ctx: *mut c_void),
    pub good_size: unsafe fn(size: usize, token: AllocToken, ctx: *mut c_void) -> usize,
    pub claimed_address: unsafe fn(ptr: *mut u8, ctx: *mut c_void) -> *mut u8,
    pub try_free_default: unsafe fn(ptr: *mut u8, ctx: *mut c_void),
}

pub static DEFAULT_DISPATCH: AllocatorDispatch = AllocatorDispatch {
    alloc,
    alloc_unchecked,
    alloc_zero_initialized,
    alloc_aligned,
    realloc,
    realloc_unchecked,
    aligned_realloc,
    aligned_realloc_unchecked,
    free,
    free_with_size,
    free_with_alignment,
    free_with_size_and_alignment,
    get_size_estimate,
    batch_malloc,
    batch_free,
    good_size,
    claimed_address,
    try_free_default,
};

static DISPATCH: AtomicPtr<AllocatorDispatch> = AtomicPtr::new(core::ptr::null_mut());

/// The currently installed dispatch table.
#[inline]
pub fn dispatch() -> &'static AllocatorDispatch {
    // Relaxed: callers tolerate observing either the old or the new table
    // for a brief window around install time.
    let table = DISPATCH.load(Ordering::Relaxed);
    if table.is_null() {
        &DEFAULT_DISPATCH
    } else {
        unsafe { &*table }
    }
}

pub fn install_dispatch(table: &'static AllocatorDispatch) {
    DISPATCH.store(
        table as *const AllocatorDispatch as *mut AllocatorDispatch,
        Ordering::Relaxed,
    );
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// # Safety
/// Standard allocator contract; returned memory is uninitialized.
pub unsafe fn alloc(size: usize, token: AllocToken, _ctx: *mut c_void) -> *mut u8 {
    allocator(token).alloc(size, false)
}

/// # Safety
/// Standard allocator contract.
pub unsafe fn alloc_unchecked(size: usize, token: AllocToken, _ctx: *mut c_void) -> *mut u8 {
    allocator(token).try_alloc(size, false)
}

/// # Safety
/// Standard allocator contract. The `n * size` product is overflow-checked.
pub unsafe fn alloc_zero_initialized(
    n: usize,
    size: usize,
    token: AllocToken,
    _ctx: *mut c_void,
) -> *mut u8 {
    let Some(total) = n.checked_mul(size) else {
        handle_out_of_memory(usize::MAX);
    };
    allocator(token).alloc(total, true)
}

/// # Safety
/// Standard allocator contract. `alignment` must be a power of two.
pub unsafe fn alloc_aligned(
    alignment: usize,
    size: usize,
    token: AllocToken,
    _ctx: *mut c_void,
) -> *mut u8 {
    if !alignment.is_power_of_two() {
        abort_with_message("cagealloc: alloc_aligned with non-power-of-two alignment\n");
    }
    let ptr = allocator(token).try_alloc_aligned(alignment, size, false);
    if ptr.is_null() {
        handle_out_of_memory(size);
    }
    ptr
}

unsafe fn realloc_impl(
    ptr: *mut u8,
    size: usize,
    token: AllocToken,
    checked: bool,
) -> *mut u8 {
    #[cfg(target_os = "macos")]
    if !ptr.is_null() && !address_space::is_managed(ptr as usize) {
        // A zone-dispatched platform handed us a foreign region; forward to
        // the system allocator, which routes it to the right zone.
        return libc::realloc(ptr as *mut c_void, size) as *mut u8;
    }

    if ptr.is_null() {
        return if checked {
            allocator(token).alloc(size, false)
        } else {
            allocator(token).try_alloc(size, false)
        };
    }
    if size == 0 {
        // realloc(p, 0) is a free.
        free(ptr, core::ptr::null_mut());
        return core::ptr::null_mut();
    }

    // The owning root comes from the address, not the token; the token only
    // matters when this degenerates to a fresh allocation.
    let old_root = root_of(ptr);
    let old_usable = old_root.get_usable_size(ptr);
    if size <= old_usable && old_root.good_size(size) == old_usable {
        // Still the best-fitting slot.
        return ptr;
    }

    let new_ptr = if checked {
        allocator(token).alloc(size, false)
    } else {
        allocator(token).try_alloc(size, false)
    };
    if new_ptr.is_null() {
        // The original block is unchanged on failure.
        return core::ptr::null_mut();
    }
    core::ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(size));
    old_root.free(ptr);
    new_ptr
}

/// # Safety
/// `ptr` must be null, a live allocation, or (on zone-dispatched platforms)
/// a foreign region.
pub unsafe fn realloc(ptr: *mut u8, size: usize, token: AllocToken, _ctx: *mut c_void) -> *mut u8 {
    realloc_impl(ptr, size, token, true)
}

/// # Safety
/// See `realloc`.
pub unsafe fn realloc_unchecked(
    ptr: *mut u8,
    size: usize,
    token: AllocToken,
    _ctx: *mut c_void,
) -> *mut u8 {
    realloc_impl(ptr, size, token, false)
}

unsafe fn aligned_realloc_impl(
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    token: AllocToken,
    checked: bool,
) -> *mut u8 {
    let mut new_ptr = core::ptr::null_mut();
    if size > 0 {
        if !alignment.is_power_of_two() {
            abort_with_message("cagealloc: aligned_realloc with non-power-of-two alignment\n");
        }
        new_ptr = allocator(token).try_alloc_aligned(alignment, size, false);
        if new_ptr.is_null() && checked {
            handle_out_of_memory(size);
        }
    } else if !ptr.is_null() {
        // size == 0 and a live pointer means just "free(ptr)".
        free(ptr, core::ptr::null_mut());
    }
    // The original block is unchanged on failure.
    if new_ptr.is_null() {
        return core::ptr::null_mut();
    }
    if !ptr.is_null() {
        let old_root = root_of(ptr);
        let old_usable = old_root.get_usable_size(ptr);
        core::ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(size));
        old_root.free(ptr);
    }
    new_ptr
}

/// Always allocates a new block and copies. The old block's alignment is not
/// compared with the new one; the returned block honors the *new* alignment
/// and no error is raised when they differ.
///
/// # Safety
/// `ptr` must be null or a live allocation.
pub unsafe fn aligned_realloc(
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    token: AllocToken,
    _ctx: *mut c_void,
) -> *mut u8 {
    aligned_realloc_impl(ptr, size, alignment, token, true)
}

/// # Safety
/// See `aligned_realloc`.
pub unsafe fn aligned_realloc_unchecked(
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    token: AllocToken,
    _ctx: *mut c_void,
) -> *mut u8 {
    aligned_realloc_impl(ptr, size, alignment, token, false)
}

#[cold]
unsafe fn free_foreign(ptr: *mut u8) {
    #[cfg(target_os = "macos")]
    {
        // Zone-dispatched platform: the region belongs to another zone.
        libc::free(ptr as *mut c_void);
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = ptr;
        abort_with_message("cagealloc: free() of a pointer we do not own\n");
    }
}

/// # Safety
/// `ptr` must be null, a live allocation, or (on zone-dispatched platforms)
/// a foreign region.
pub unsafe fn free(ptr: *mut u8, _ctx: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if !address_space::is_managed(ptr as usize) {
        return free_foreign(ptr);
    }
    root_of(ptr).free(ptr);
}

/// # Safety
/// See `free`. `size` must be the requested size of the allocation.
pub unsafe fn free_with_size(ptr: *mut u8, size: usize, _ctx: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if !address_space::is_managed(ptr as usize) {
        return free_foreign(ptr);
    }
    let root = root_of(ptr);
    if root.settings().strict_size_check && size > root.get_usable_size(ptr) {
        abort_with_message("cagealloc: free() size does not match the allocation\n");
    }
    root.free(ptr);
}

/// # Safety
/// See `free`. `alignment` must match the allocation's alignment.
pub unsafe fn free_with_alignment(ptr: *mut u8, alignment: usize, _ctx: *mut c_void) {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(ptr.is_null() || (ptr as usize) & (alignment - 1) == 0);
    free(ptr, _ctx);
}

/// # Safety
/// See `free_with_size` and `free_with_alignment`.
pub unsafe fn free_with_size_and_alignment(
    ptr: *mut u8,
    size: usize,
    alignment: usize,
    _ctx: *mut c_void,
) {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(ptr.is_null() || (ptr as usize) & (alignment - 1) == 0);
    free_with_size(ptr, size, _ctx);
}

/// Returns 0 for pointers the allocator does not own; zone dispatching
/// relies on that to probe ownership.
///
/// # Safety
/// A managed `ptr` must be a live allocation.
pub unsafe fn get_size_estimate(ptr: *mut u8, _ctx: *mut c_void) -> usize {
    if ptr.is_null() || !address_space::is_managed(ptr as usize) {
        return 0;
    }
    let root = root_of(ptr);
    root.get_usable_size(ptr)
}

/// Sequentially allocate `num_requested` blocks of `size` bytes. Aborts on
/// any allocation failure.
///
/// # Safety
/// `results` must have room for `num_requested` pointers.
pub unsafe fn batch_malloc(
    size: usize,
    results: *mut *mut u8,
    num_requested: usize,
    token: AllocToken,
    _ctx: *mut c_void,
) -> usize {
    let root = allocator(token);
    for i in 0..num_requested {
        results.add(i).write(root.alloc(size, false));
    }
    num_requested
}

/// Sequentially free `num` blocks.
///
/// # Safety
/// Every pointer must satisfy the `free` contract.
pub unsafe fn batch_free(ptrs: *const *mut u8, num: usize, _ctx: *mut c_void) {
    for i in 0..num {
        free(ptrs.add(i).read(), _ctx);
    }
}

/// # Safety
/// Standard allocator contract.
pub unsafe fn good_size(size: usize, token: AllocToken, _ctx: *mut c_void) -> usize {
    allocator(token).good_size(size)
}

/// # Safety
/// A managed `ptr` must point into a live allocation.
pub unsafe fn claimed_address(ptr: *mut u8, _ctx: *mut c_void) -> *mut u8 {
    if ptr.is_null() || !address_space::is_managed(ptr as usize) {
        return core::ptr::null_mut();
    }
    match root_of(ptr).claimed_address(ptr) {
        Some(slot_start) => slot_start as *mut u8,
        None => core::ptr::null_mut(),
    }
}

/// Free `ptr` if this allocator owns it; otherwise hand it to the system
/// allocator on zone-dispatched platforms, and ignore it elsewhere.
///
/// # Safety
/// `ptr` must be null, a live allocation, or a foreign region.
pub unsafe fn try_free_default(ptr: *mut u8, _ctx: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if address_space::is_managed(ptr as usize) {
        root_of(ptr).free(ptr);
        return;
    }
    #[cfg(target_os = "macos")]
    libc::free(ptr as *mut c_void);
}

// ---------------------------------------------------------------------------
// One-shot configuration
// ---------------------------------------------------------------------------

/// The embedder's one-shot configuration for all roots.
#[derive(Clone, Copy, Debug, Default)]
pub struct PartitionOptions {
    pub enable_brp: bool,
    pub memory_tagging: MemoryTagging,
    pub bucket_distribution: crate::bucket::BucketDistribution,
    pub scheduler_loop_quarantine_global: QuarantineConfig,
    pub scheduler_loop_quarantine_thread_local: QuarantineConfig,
    pub scheduler_loop_quarantine_advanced_checks: QuarantineConfig,
    /// Zero slots when they return to the freelist.
    pub eventual_zeroing: bool,
    /// The shim should prefer the sized free entry points.
    pub use_free_with_size: bool,
    pub strict_size_check: bool,
}

struct ExtraConfigs {
    thread_local_quarantine: QuarantineConfig,
    advanced_checks_quarantine: QuarantineConfig,
    use_free_with_size: bool,
}

static EXTRA_CONFIGS: Mutex<ExtraConfigs> = Mutex::new(ExtraConfigs {
    thread_local_quarantine: QuarantineConfig {
        capacity_in_bytes: 0,
        enable_quarantine: false,
        enable_zapping: false,
        leak_on_destruction: false,
    },
    advanced_checks_quarantine: QuarantineConfig {
        capacity_in_bytes: 0,
        enable_quarantine: false,
        enable_zapping: false,
        leak_on_destruction: false,
    },
    use_free_with_size: false,
});

/// Install fully-configured roots for every token. One-shot: a second call
/// is a fatal error. The replaced roots remain queryable through
/// `original_allocator`.
pub fn configure_partitions(options: PartitionOptions) {
    if ROOTS_FINALIZED.swap(true, Ordering::AcqRel) {
        abort_with_message("cagealloc: configure_partitions called twice\n");
    }

    {
        let mut extra = EXTRA_CONFIGS.lock();
        extra.thread_local_quarantine = options.scheduler_loop_quarantine_thread_local;
        extra.advanced_checks_quarantine = options.scheduler_loop_quarantine_advanced_checks;
        extra.use_free_with_size = options.use_free_with_size;
    }

    let settings = Settings {
        with_brp: options.enable_brp,
        use_configurable_pool: false,
        bucket_distribution: options.bucket_distribution,
        zero_on_free: options.eventual_zeroing,
        strict_size_check: options.strict_size_check,
        memory_tagging: options.memory_tagging,
    };

    for index in 0..MAX_ALLOC_TOKENS {
        let token = AllocToken::new(index as u8);
        // Force creation of the early root so it stays queryable.
        let original = allocator(token);
        ORIGINAL_ROOTS[index].store(
            original as *const AllocatorRoot as *mut AllocatorRoot,
            Ordering::Release,
        );

        let replacement = AllocatorRoot::new_leaked(settings);
        replacement.configure_quarantine(options.scheduler_loop_quarantine_global);
        ROOTS[index].replace(replacement);
    }
}

/// The quarantine configuration thread-bound branches should use.
pub fn thread_local_quarantine_config() -> QuarantineConfig {
    EXTRA_CONFIGS.lock().thread_local_quarantine
}

/// The quarantine configuration for advanced-checks mode.
pub fn advanced_checks_quarantine_config() -> QuarantineConfig {
    EXTRA_CONFIGS.lock().advanced_checks_quarantine
}

/// Whether the shim should route through the sized free entry points.
pub fn use_free_with_size() -> bool {
    EXTRA_CONFIGS.lock().use_free_with_size
}

/// Create a thread-bound quarantine branch for `token`'s root, configured
/// with the thread-local quarantine settings.
pub fn create_thread_bound_branch(token: AllocToken) -> ThreadBoundQuarantineBranch {
    let root = allocator(token);
    let branch = ThreadBoundQuarantineBranch::new();
    branch.configure(root, root.quarantine_root(), thread_local_quarantine_config());
    branch
}
