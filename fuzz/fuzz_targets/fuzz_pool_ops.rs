//! Fuzz the pool manager's first-fit bitmap against a shadow model: a plain
//! vector of allocated runs. Every alloc/free sequence must keep the two in
//! agreement, and the bit-hint optimization must never change placement.

#![no_main]

use libfuzzer_sys::fuzz_target;

use cagealloc::util::SUPER_PAGE_SIZE;

const BASE: usize = 0x4000_0000;
const POOL_PAGES: usize = 256;

fuzz_target!(|data: &[u8]| {
    let manager = cagealloc::pool::manager::AddressPoolManager::get();
    manager.reset_for_testing();
    let pool = manager.add(BASE, POOL_PAGES * SUPER_PAGE_SIZE);

    // (start_page, num_pages) of live chunks.
    let mut live: Vec<(usize, usize)> = Vec::new();
    let mut shadow = [false; POOL_PAGES];

    let mut bytes = data.iter().copied();
    while let (Some(op), Some(arg)) = (bytes.next(), bytes.next()) {
        if op % 2 == 0 {
            // Allocate 1..=16 pages.
            let pages = (arg as usize % 16) + 1;
            let addr = manager.alloc(pool, pages * SUPER_PAGE_SIZE);

            // The shadow model computes the expected first fit.
            let expected = first_fit(&shadow, pages);
            match expected {
                Some(start) => {
                    assert_eq!(addr, BASE + start * SUPER_PAGE_SIZE);
                    for bit in &mut shadow[start..start + pages] {
                        *bit = true;
                    }
                    live.push((start, pages));
                }
                None => assert_eq!(addr, 0),
            }
        } else if !live.is_empty() {
            // Free an arbitrary live chunk.
            let (start, pages) = live.swap_remove(arg as usize % live.len());
            manager.free(pool, BASE + start * SUPER_PAGE_SIZE, pages * SUPER_PAGE_SIZE);
            for bit in &mut shadow[start..start + pages] {
                *bit = false;
            }
        }
    }
});

fn first_fit(shadow: &[bool], pages: usize) -> Option<usize> {
    let mut run = 0;
    for (i, &allocated) in shadow.iter().enumerate() {
        if allocated {
            run = 0;
        } else {
            run += 1;
            if run == pages {
                return Some(i + 1 - pages);
            }
        }
    }
    None
}
