//! Sub-allocation of super-page-aligned chunks inside the registered pools.
//!
//! Each pool tracks its super-pages in a packed bitmap (bit set = allocated)
//! with a first-fit scan. `bit_hint` is a lower bound on the lowest free bit:
//! every bit strictly below it is known allocated, so allocation scans skip
//! the densely packed prefix that builds up in steady state.

use crate::oom::abort_with_message;
use crate::pool::{PoolHandle, NUM_POOLS};
use crate::sync::Mutex;
use crate::util::{is_aligned, MAX_SUPER_PAGES_PER_POOL, SUPER_PAGE_SHIFT, SUPER_PAGE_SIZE};

const BITMAP_WORDS: usize = MAX_SUPER_PAGES_PER_POOL / 64;

struct PoolState {
    /// Bit i set means super-page i is allocated.
    bitmap: [u64; BITMAP_WORDS],
    /// Number of super-pages this pool spans.
    total_bits: usize,
    address_begin: usize,
    /// All bits strictly below this are allocated.
    bit_hint: usize,
    in_use: bool,
}

impl PoolState {
    const fn empty() -> Self {
        PoolState {
            bitmap: [0; BITMAP_WORDS],
            total_bits: 0,
            address_begin: 0,
            bit_hint: 0,
            in_use: false,
        }
    }

    #[inline]
    fn test(&self, bit: usize) -> bool {
        self.bitmap[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    #[inline]
    fn set(&mut self, bit: usize) {
        self.bitmap[bit / 64] |= 1u64 << (bit % 64);
    }

    #[inline]
    fn clear(&mut self, bit: usize) {
        self.bitmap[bit / 64] &= !(1u64 << (bit % 64));
    }

    /// First-fit scan for a run of `need_bits` zero bits, starting at
    /// `bit_hint`. On success the run is marked allocated and its address
    /// returned; 0 signals exhaustion.
    fn find_chunk(&mut self, requested_size: usize) -> usize {
        let required_size = crate::util::align_up(requested_size, SUPER_PAGE_SIZE);
        let need_bits = required_size >> SUPER_PAGE_SHIFT;

        let mut beg_bit = self.bit_hint;
        let mut curr_bit = self.bit_hint;
        loop {
            // `end_bit` points one past the last bit that needs to be zero.
            // Past `total_bits` there is no free chunk to find.
            let end_bit = beg_bit + need_bits;
            if end_bit > self.total_bits {
                return 0;
            }

            let mut found = true;
            while curr_bit < end_bit {
                if self.test(curr_bit) {
                    // This candidate run contains an allocated page. Restart
                    // just past it, but keep advancing `curr_bit` to `end_bit`
                    // so the next pass does not re-check these bits.
                    beg_bit = curr_bit + 1;
                    found = false;
                    if self.bit_hint == curr_bit {
                        self.bit_hint += 1;
                    }
                }
                curr_bit += 1;
            }

            if found {
                for i in beg_bit..end_bit {
                    debug_assert!(!self.test(i));
                    self.set(i);
                }
                if self.bit_hint == beg_bit {
                    self.bit_hint = end_bit;
                }
                return self.address_begin + beg_bit * SUPER_PAGE_SIZE;
            }
        }
    }

    fn free_chunk(&mut self, address: usize, free_size: usize) {
        debug_assert!(is_aligned(address, SUPER_PAGE_SIZE));
        debug_assert!(address >= self.address_begin);

        let size = crate::util::align_up(free_size, SUPER_PAGE_SIZE);
        let beg_bit = (address - self.address_begin) >> SUPER_PAGE_SHIFT;
        let end_bit = beg_bit + (size >> SUPER_PAGE_SHIFT);
        debug_assert!(end_bit <= self.total_bits);

        for i in beg_bit..end_bit {
            debug_assert!(self.test(i), "freeing an unallocated super-page");
            self.clear(i);
        }
        self.bit_hint = self.bit_hint.min(beg_bit);
    }
}

/// Owns up to `NUM_POOLS` pools. All methods are safe to call concurrently;
/// each pool's bitmap is guarded by its own lock, so contention stays local
/// to one pool (expected mostly at slot-span provisioning, not per
/// allocation).
pub struct AddressPoolManager {
    pools: [Mutex<PoolState>; NUM_POOLS],
}

static POOL_MANAGER: AddressPoolManager = AddressPoolManager::new();

impl AddressPoolManager {
    const fn new() -> Self {
        const EMPTY: Mutex<PoolState> = Mutex::new(PoolState::empty());
        AddressPoolManager { pools: [EMPTY; NUM_POOLS] }
    }

    pub fn get() -> &'static AddressPoolManager {
        &POOL_MANAGER
    }

    /// Register a pool covering `[base, base + length)`. Both must be
    /// super-page multiples. Returns the pool's handle; a full table is a
    /// fatal setup error.
    pub fn add(&self, base: usize, length: usize) -> PoolHandle {
        debug_assert!(is_aligned(base, SUPER_PAGE_SIZE));
        debug_assert!(is_aligned(length, SUPER_PAGE_SIZE));

        let total_bits = length >> SUPER_PAGE_SHIFT;
        if total_bits > MAX_SUPER_PAGES_PER_POOL {
            abort_with_message("cagealloc: pool larger than bitmap capacity\n");
        }

        for (i, slot) in self.pools.iter().enumerate() {
            let mut pool = slot.lock();
            if !pool.in_use {
                *pool = PoolState {
                    bitmap: [0; BITMAP_WORDS],
                    total_bits,
                    address_begin: base,
                    bit_hint: 0,
                    in_use: true,
                };
                return PoolHandle(i as u32 + 1);
            }
        }
        abort_with_message("cagealloc: pool table full\n");
    }

    /// Drop a pool registration. Only used at shutdown/test reset.
    pub fn remove(&self, handle: PoolHandle) {
        let mut pool = self.pools[handle.table_index()].lock();
        debug_assert!(pool.in_use, "removing an unregistered pool");
        *pool = PoolState::empty();
    }

    /// Allocate `size` bytes (rounded up to a super-page multiple) of
    /// super-page-aligned address space from the pool. Returns 0 when no run
    /// of free super-pages is long enough.
    pub fn alloc(&self, handle: PoolHandle, size: usize) -> usize {
        let mut pool = self.pools[handle.table_index()].lock();
        debug_assert!(pool.in_use);
        pool.find_chunk(size)
    }

    /// Return `ceil(size / super_page)` contiguous super-pages starting at
    /// `address` to the pool.
    pub fn free(&self, handle: PoolHandle, address: usize, size: usize) {
        let mut pool = self.pools[handle.table_index()].lock();
        debug_assert!(pool.in_use);
        pool.free_chunk(address, size);
    }

    pub fn reset_for_testing(&self) {
        for slot in &self.pools {
            *slot.lock() = PoolState::empty();
        }
    }
}
