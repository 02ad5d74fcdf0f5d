//! `core::alloc::GlobalAlloc` adapter over the dispatch table, for Rust
//! programs that want to opt in with `#[global_allocator]`.

use crate::dispatch::{self, AllocToken};
use core::alloc::{GlobalAlloc, Layout};

pub struct CageAlloc;

unsafe impl GlobalAlloc for CageAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        dispatch::allocator(AllocToken::DEFAULT).try_alloc_aligned(
            layout.align(),
            layout.size(),
            false,
        )
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        dispatch::free_with_size_and_alignment(
            ptr,
            layout.size(),
            layout.align(),
            core::ptr::null_mut(),
        );
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        dispatch::allocator(AllocToken::DEFAULT).try_alloc_aligned(
            layout.align(),
            layout.size(),
            true,
        )
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= crate::bucket::MIN_BUCKETED_SIZE {
            return dispatch::realloc_unchecked(
                ptr,
                new_size,
                AllocToken::DEFAULT,
                core::ptr::null_mut(),
            );
        }
        dispatch::aligned_realloc_unchecked(
            ptr,
            new_size,
            layout.align(),
            AllocToken::DEFAULT,
            core::ptr::null_mut(),
        )
    }
}
