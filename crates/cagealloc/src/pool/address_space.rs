//! One-shot cage reservation and pool installation.
//!
//! The cage is a single large inaccessible reservation. Inside it, pools are
//! installed at pool-size-aligned addresses so that membership tests reduce
//! to one mask-and-compare. Before `init`, every stored base address is the
//! pool's offset mask -- a value no real address can match once masked -- so
//! membership tests return false deterministically.

use crate::oom::abort_with_message;
use crate::platform;
use crate::pool::manager::AddressPoolManager;
use crate::pool::PoolHandle;
use crate::util::{
    is_aligned, POOL_BASE_MASK, POOL_OFFSET_MASK, POOL_SIZE, RESERVED_ADDRESS_SPACE_SIZE,
    SUPER_PAGE_SIZE,
};
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Resolved pool for an address: handle, base, membership mask and the
/// address's offset within the pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolInfo {
    pub handle: PoolHandle,
    pub base: usize,
    pub base_mask: usize,
    pub offset: usize,
}

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// Post-init fields are write-once and frequently read afterwards. The
/// struct fills whole cache lines so the hot masks never share a line with
/// unrelated mutable data.
#[repr(C, align(64))]
struct CageSetup {
    non_brp_pool_base_address: AtomicUsize,
    brp_pool_base_address: AtomicUsize,
    configurable_pool_base_address: AtomicUsize,
    /// The configurable pool may be smaller than `POOL_SIZE`, so its mask is
    /// stored rather than derived from a constant.
    configurable_pool_base_mask: AtomicUsize,
    reserved_address_start: AtomicUsize,
    non_brp_pool: AtomicU32,
    brp_pool: AtomicU32,
    configurable_pool: AtomicU32,
    state: AtomicU8,
}

static SETUP: CageSetup = CageSetup {
    non_brp_pool_base_address: AtomicUsize::new(POOL_OFFSET_MASK),
    brp_pool_base_address: AtomicUsize::new(POOL_OFFSET_MASK),
    configurable_pool_base_address: AtomicUsize::new(POOL_OFFSET_MASK),
    configurable_pool_base_mask: AtomicUsize::new(POOL_BASE_MASK),
    reserved_address_start: AtomicUsize::new(0),
    non_brp_pool: AtomicU32::new(0),
    brp_pool: AtomicU32::new(0),
    configurable_pool: AtomicU32::new(0),
    state: AtomicU8::new(UNINIT),
};

/// Initialize the cage and the standard pools inside it.
///
/// The first call performs the reservation; later calls return once it is
/// complete. Initialization must finish before any thread allocates. The
/// configurable pool is installed separately via `init_configurable_pool`.
pub fn init() {
    match SETUP
        .state
        .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while SETUP.state.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    let start = unsafe { platform::reserve_inaccessible(RESERVED_ADDRESS_SPACE_SIZE) };
    if start.is_null() {
        abort_with_message("cagealloc: cage reservation failed\n");
    }
    let start = start as usize;
    SETUP.reserved_address_start.store(start, Ordering::Relaxed);

    let cage_base = crate::util::align_up(start, POOL_SIZE);
    debug_assert!(cage_base + 2 * POOL_SIZE <= start + RESERVED_ADDRESS_SPACE_SIZE);

    let manager = AddressPoolManager::get();

    // The non-BRP pool answers membership over the full pool-size range, but
    // its last super-page is withheld from the manager: it is the forbidden
    // zone preceding the BRP pool, so a pointer one past a non-BRP
    // allocation can never equal a BRP-pool address.
    let non_brp = manager.add(cage_base, POOL_SIZE - SUPER_PAGE_SIZE);
    SETUP.non_brp_pool.store(non_brp.0, Ordering::Relaxed);

    let brp_base = cage_base + POOL_SIZE;
    let brp = manager.add(brp_base, POOL_SIZE);
    SETUP.brp_pool.store(brp.0, Ordering::Relaxed);

    SETUP
        .non_brp_pool_base_address
        .store(cage_base, Ordering::Release);
    SETUP.brp_pool_base_address.store(brp_base, Ordering::Release);

    SETUP.state.store(READY, Ordering::Release);
}

/// Install the optional configurable pool inside an embedder-supplied,
/// pre-reserved region. `address` must be aligned to `size`; `size` must be
/// a power of two no larger than `POOL_SIZE`.
pub fn init_configurable_pool(address: usize, size: usize) {
    if !size.is_power_of_two() || size > POOL_SIZE || !is_aligned(address, size) {
        abort_with_message("cagealloc: bad configurable pool geometry\n");
    }
    if is_configurable_pool_initialized() {
        abort_with_message("cagealloc: configurable pool initialized twice\n");
    }

    let handle = AddressPoolManager::get().add(address, size);
    SETUP.configurable_pool.store(handle.0, Ordering::Relaxed);
    SETUP
        .configurable_pool_base_mask
        .store(!(size - 1), Ordering::Release);
    SETUP
        .configurable_pool_base_address
        .store(address, Ordering::Release);
}

pub fn is_initialized() -> bool {
    SETUP.state.load(Ordering::Acquire) == READY
}

pub fn is_configurable_pool_initialized() -> bool {
    SETUP.configurable_pool_base_address.load(Ordering::Acquire) != POOL_OFFSET_MASK
}

#[inline]
pub fn non_brp_pool() -> PoolHandle {
    PoolHandle(SETUP.non_brp_pool.load(Ordering::Relaxed))
}

#[inline]
pub fn brp_pool() -> PoolHandle {
    PoolHandle(SETUP.brp_pool.load(Ordering::Relaxed))
}

#[inline]
pub fn configurable_pool() -> PoolHandle {
    PoolHandle(SETUP.configurable_pool.load(Ordering::Relaxed))
}

/// Returns false for null and for any address outside the pool.
#[inline]
pub fn is_in_non_brp_pool(address: usize) -> bool {
    (address & POOL_BASE_MASK) == SETUP.non_brp_pool_base_address.load(Ordering::Acquire)
}

/// Returns false for null and for any address outside the pool.
#[inline]
pub fn is_in_brp_pool(address: usize) -> bool {
    (address & POOL_BASE_MASK) == SETUP.brp_pool_base_address.load(Ordering::Acquire)
}

/// Returns false for null and for any address outside the pool.
#[inline]
pub fn is_in_configurable_pool(address: usize) -> bool {
    (address & SETUP.configurable_pool_base_mask.load(Ordering::Acquire))
        == SETUP.configurable_pool_base_address.load(Ordering::Acquire)
}

/// Does this address lie in any pool the allocator manages?
#[inline]
pub fn is_managed(address: usize) -> bool {
    is_in_non_brp_pool(address) || is_in_brp_pool(address) || is_in_configurable_pool(address)
}

/// Which pool does `address` belong to? `PoolHandle::NONE` when unmanaged.
#[inline]
pub fn pool_of(address: usize) -> PoolHandle {
    if is_in_non_brp_pool(address) {
        non_brp_pool()
    } else if is_in_brp_pool(address) {
        brp_pool()
    } else if is_in_configurable_pool(address) {
        configurable_pool()
    } else {
        PoolHandle::NONE
    }
}

/// Resolve the pool and intra-pool offset for a managed address. One branch
/// per pool; this sits on the hot path of every freelist traversal.
#[inline]
pub fn get_pool_and_offset(address: usize) -> PoolInfo {
    if is_in_non_brp_pool(address) {
        let base = SETUP.non_brp_pool_base_address.load(Ordering::Relaxed);
        return PoolInfo {
            handle: non_brp_pool(),
            base,
            base_mask: POOL_BASE_MASK,
            offset: address - base,
        };
    }
    if is_in_brp_pool(address) {
        let base = SETUP.brp_pool_base_address.load(Ordering::Relaxed);
        return PoolInfo {
            handle: brp_pool(),
            base,
            base_mask: POOL_BASE_MASK,
            offset: address - base,
        };
    }
    if is_in_configurable_pool(address) {
        let base = SETUP.configurable_pool_base_address.load(Ordering::Relaxed);
        return PoolInfo {
            handle: configurable_pool(),
            base,
            base_mask: SETUP.configurable_pool_base_mask.load(Ordering::Relaxed),
            offset: address - base,
        };
    }
    abort_with_message("cagealloc: address not in any pool\n");
}

/// Tear the cage down. Only valid in tests, with no live allocations.
pub fn uninit_for_testing() {
    let start = SETUP.reserved_address_start.swap(0, Ordering::Relaxed);
    if start != 0 {
        unsafe { platform::release(start as *mut u8, RESERVED_ADDRESS_SPACE_SIZE) };
    }
    SETUP
        .non_brp_pool_base_address
        .store(POOL_OFFSET_MASK, Ordering::Release);
    SETUP
        .brp_pool_base_address
        .store(POOL_OFFSET_MASK, Ordering::Release);
    SETUP
        .configurable_pool_base_address
        .store(POOL_OFFSET_MASK, Ordering::Release);
    SETUP
        .configurable_pool_base_mask
        .store(POOL_BASE_MASK, Ordering::Release);
    SETUP.non_brp_pool.store(0, Ordering::Relaxed);
    SETUP.brp_pool.store(0, Ordering::Relaxed);
    SETUP.configurable_pool.store(0, Ordering::Relaxed);
    AddressPoolManager::get().reset_for_testing();
    SETUP.state.store(UNINIT, Ordering::Release);
}
