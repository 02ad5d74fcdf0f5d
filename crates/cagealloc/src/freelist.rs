//! The free list of a slot span, with tamper detection.
//!
//! Entries occupy the first bytes of each free slot and link to the next free
//! slot as an *intra-pool offset*, never a raw pointer: the stored word has
//! zeros in every pool-base bit, so a value planted by a use-after-free write
//! almost always fails validation before it is ever dereferenced. An optional
//! shadow field stores the bitwise complement of the offset as a second
//! tripwire.

use crate::oom::freelist_corruption_detected;
use crate::pool::address_space::{get_pool_and_offset, PoolInfo};
use crate::util::{PARTITION_PAGE_SIZE, PTR_TAG_MASK, SUPER_PAGE_BASE_MASK, SUPER_PAGE_OFFSET_MASK};

/// The next-entry link: an offset into the containing pool, carrying any
/// platform memory-tag bits. Zero encodes the end of the list.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EncodedPoolOffset(usize);

impl EncodedPoolOffset {
    const NULL: EncodedPoolOffset = EncodedPoolOffset(0);

    /// Represent `address` as a tagged offset into its containing pool.
    /// `address` must be managed; zero encodes null.
    #[inline]
    fn encode(address: usize) -> EncodedPoolOffset {
        if address == 0 {
            return Self::NULL;
        }
        let pool_info = get_pool_and_offset(address & !PTR_TAG_MASK);
        EncodedPoolOffset(address & (PTR_TAG_MASK | !pool_info.base_mask))
    }

    /// Rebuild the tagged address from this offset and the pool of the entry
    /// holding it.
    #[inline]
    fn decode(self, pool_info: &PoolInfo) -> usize {
        pool_info.base | self.0
    }

    #[inline]
    pub fn inverted(self) -> usize {
        !self.0
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A freelist entry, emplaced at the start of a free slot. Never constructed
/// as a value; always written in place over slot memory.
#[repr(C)]
pub struct FreelistEntry {
    encoded_next: EncodedPoolOffset,
    /// Complement of `encoded_next`; a UAF write over the slot is very
    /// unlikely to preserve the relation.
    #[cfg(feature = "shadow")]
    shadow: usize,
}

impl FreelistEntry {
    /// Emplace a null-terminated entry at `slot_start`.
    ///
    /// # Safety
    /// `slot_start` must be a writable slot start inside a registered pool.
    #[inline]
    pub unsafe fn emplace_and_init_null(slot_start: usize) -> *mut FreelistEntry {
        let entry = slot_start as *mut FreelistEntry;
        (*entry).encoded_next = EncodedPoolOffset::NULL;
        #[cfg(feature = "shadow")]
        {
            (*entry).shadow = EncodedPoolOffset::NULL.inverted();
        }
        entry
    }

    /// Emplace an entry at `slot_start` linking to `next`.
    ///
    /// This form exists for thread-cache provisioning, which may chain slots
    /// across super-pages; it therefore skips the same-super-page assertion
    /// that `set_next` performs.
    ///
    /// # Safety
    /// `slot_start` must be a writable slot start inside a registered pool;
    /// `next` null or a valid entry in the same pool.
    #[inline]
    pub unsafe fn emplace_with_next(
        slot_start: usize,
        next: *mut FreelistEntry,
    ) -> *mut FreelistEntry {
        let entry = slot_start as *mut FreelistEntry;
        (*entry).encoded_next = EncodedPoolOffset::encode(next as usize);
        #[cfg(feature = "shadow")]
        {
            (*entry).shadow = (*entry).encoded_next.inverted();
        }
        entry
    }

    #[inline]
    pub fn is_encoded_next_ptr_zero(&self) -> bool {
        self.encoded_next.is_null()
    }

    /// Update the link. Regular freelists always point within one super-page;
    /// violating that here is an allocator bug, not heap corruption.
    ///
    /// # Safety
    /// `entry` must be null or a valid entry in the same pool as `self`.
    #[inline]
    pub unsafe fn set_next(&mut self, entry: *mut FreelistEntry) {
        debug_assert!(
            entry.is_null()
                || (self as *mut _ as usize & SUPER_PAGE_BASE_MASK)
                    == (entry as usize & SUPER_PAGE_BASE_MASK)
        );
        self.encoded_next = EncodedPoolOffset::encode(entry as usize);
        #[cfg(feature = "shadow")]
        {
            self.shadow = self.encoded_next.inverted();
        }
    }

    /// Zero out the entry before the slot is handed to the caller of alloc;
    /// the caller must never see freelist metadata. Returns the slot address.
    #[inline]
    pub fn clear_for_allocation(&mut self) -> usize {
        self.encoded_next = EncodedPoolOffset::NULL;
        #[cfg(feature = "shadow")]
        {
            self.shadow = 0;
        }
        self as *mut FreelistEntry as usize
    }

    /// Validated traversal. Null-terminates cleanly; on a malformed link,
    /// aborts with the freelist-corruption signature when
    /// `CRASH_ON_CORRUPTION`, else returns null (for best-effort walkers).
    #[inline]
    pub fn get_next<const CRASH_ON_CORRUPTION: bool>(
        &self,
        slot_size: usize,
    ) -> *mut FreelistEntry {
        self.get_next_internal::<CRASH_ON_CORRUPTION, false>(slot_size)
    }

    /// Traversal for thread-cache lists, which legitimately chain entries
    /// across super-pages; the same-super-page check is skipped.
    #[inline]
    pub fn get_next_for_thread_cache<const CRASH_ON_CORRUPTION: bool>(
        &self,
        slot_size: usize,
    ) -> *mut FreelistEntry {
        self.get_next_internal::<CRASH_ON_CORRUPTION, true>(slot_size)
    }

    /// Walk the whole list, validating every link.
    pub fn check_free_list(&self, slot_size: usize) {
        let mut entry = self as *const FreelistEntry as *mut FreelistEntry;
        while !entry.is_null() {
            // `get_next` performs the validation.
            entry = unsafe { (*entry).get_next::<true>(slot_size) };
        }
    }

    pub fn check_free_list_for_thread_cache(&self, slot_size: usize) {
        let mut entry = self as *const FreelistEntry as *mut FreelistEntry;
        while !entry.is_null() {
            entry = unsafe { (*entry).get_next_for_thread_cache::<true>(slot_size) };
        }
    }

    #[inline]
    fn get_next_internal<const CRASH_ON_CORRUPTION: bool, const FOR_THREAD_CACHE: bool>(
        &self,
        slot_size: usize,
    ) -> *mut FreelistEntry {
        // Traversal can land on discarded memory, where the word is zero and
        // none of the checks apply.
        if self.encoded_next.is_null() {
            return core::ptr::null_mut();
        }

        let here = self as *const FreelistEntry as usize & !PTR_TAG_MASK;
        let pool_info = get_pool_and_offset(here);
        let next = self.encoded_next.decode(&pool_info);
        if !self.is_well_formed::<FOR_THREAD_CACHE>(&pool_info, here, next) {
            if CRASH_ON_CORRUPTION {
                #[cfg(feature = "shadow")]
                let shadow = self.shadow;
                #[cfg(not(feature = "shadow"))]
                let shadow = 0;
                freelist_corruption_detected(self.encoded_next.raw(), shadow, slot_size);
            }
            return core::ptr::null_mut();
        }
        next as *mut FreelistEntry
    }

    /// Constraints a trustworthy link satisfies:
    /// - the shadow matches the inverted offset (when present);
    /// - the decoded address has no bits in the pool base mask beyond a tag;
    /// - the decoded address does not point into the metadata partition page;
    /// - outside the thread cache, `here` and `next` share a super-page.
    #[inline]
    fn is_well_formed<const FOR_THREAD_CACHE: bool>(
        &self,
        pool_info: &PoolInfo,
        here_address: usize,
        next_address: usize,
    ) -> bool {
        #[cfg(feature = "shadow")]
        let shadow_ok = self.encoded_next.inverted() == self.shadow;
        #[cfg(not(feature = "shadow"))]
        let shadow_ok = true;

        let next_untagged = next_address & !PTR_TAG_MASK;

        let pool_base_mask_matches = (next_untagged & pool_info.base_mask) == pool_info.base;

        let not_in_metadata = (next_untagged & SUPER_PAGE_OFFSET_MASK) >= PARTITION_PAGE_SIZE;

        if FOR_THREAD_CACHE {
            return pool_base_mask_matches & shadow_ok & not_in_metadata;
        }

        let same_super_page =
            (here_address & SUPER_PAGE_BASE_MASK) == (next_untagged & SUPER_PAGE_BASE_MASK);

        pool_base_mask_matches & shadow_ok & same_super_page & not_in_metadata
    }
}
