//! Freelist tamper-detection tests.
//!
//! Entries are built inside real pool-owned, committed super-pages, and
//! corruption is injected by raw writes over the entry words (there are no
//! fault-injection hooks in production code).
//!
//! Tests that expect the process to abort run as subprocesses: we spawn the
//! test binary with a scenario name in the environment and check that the
//! child dies with the freelist-corruption diagnostic on stderr.

use std::sync::Once;

use cagealloc::freelist::FreelistEntry;
use cagealloc::pool::address_space;
use cagealloc::pool::manager::AddressPoolManager;
use cagealloc::util::{PARTITION_PAGE_SIZE, POOL_BASE_MASK, SUPER_PAGE_SIZE};

static INIT: Once = Once::new();

fn ensure_cage() {
    INIT.call_once(address_space::init);
}

/// Allocate and commit a fresh super-page from the non-BRP pool.
fn committed_super_page() -> usize {
    ensure_cage();
    let chunk = AddressPoolManager::get().alloc(address_space::non_brp_pool(), SUPER_PAGE_SIZE);
    assert_ne!(chunk, 0, "non-BRP pool exhausted");
    unsafe { cagealloc::platform::commit(chunk as *mut u8, SUPER_PAGE_SIZE) };
    chunk
}

const SLOT_SIZE: usize = 64;

fn slot(chunk: usize, index: usize) -> usize {
    chunk + PARTITION_PAGE_SIZE + index * SLOT_SIZE
}

// ---------------------------------------------------------------------------
// Well-formed traversal
// ---------------------------------------------------------------------------

#[test]
fn null_terminated_entry_traverses_to_null() {
    let chunk = committed_super_page();
    unsafe {
        let head = FreelistEntry::emplace_and_init_null(slot(chunk, 0));
        assert!((*head).is_encoded_next_ptr_zero());
        assert!((*head).get_next::<true>(SLOT_SIZE).is_null());
        assert!((*head).get_next_for_thread_cache::<true>(SLOT_SIZE).is_null());
    }
}

#[test]
fn linked_entries_round_trip() {
    let chunk = committed_super_page();
    unsafe {
        let second = FreelistEntry::emplace_and_init_null(slot(chunk, 1));
        let head = FreelistEntry::emplace_and_init_null(slot(chunk, 0));
        (*head).set_next(second);

        assert!(!(*head).is_encoded_next_ptr_zero());
        let decoded = (*head).get_next::<true>(SLOT_SIZE);
        assert_eq!(decoded, second);
        assert!((*decoded).get_next::<true>(SLOT_SIZE).is_null());

        // The whole chain validates.
        (*head).check_free_list(SLOT_SIZE);
    }
}

#[test]
fn clear_for_allocation_leaves_no_metadata() {
    let chunk = committed_super_page();
    unsafe {
        let second = FreelistEntry::emplace_and_init_null(slot(chunk, 1));
        let head = FreelistEntry::emplace_and_init_null(slot(chunk, 0));
        (*head).set_next(second);

        let slot_start = (*head).clear_for_allocation();
        assert_eq!(slot_start, slot(chunk, 0));
        // The caller must never observe freelist words in its allocation.
        let words = slot_start as *const usize;
        assert_eq!(words.read(), 0);
        assert_eq!(words.add(1).read(), 0);
    }
}

// ---------------------------------------------------------------------------
// Rejected links (crash_on_corruption = false returns null)
// ---------------------------------------------------------------------------

#[cfg(feature = "shadow")]
#[test]
fn shadow_mismatch_is_rejected() {
    let chunk = committed_super_page();
    unsafe {
        let second = FreelistEntry::emplace_and_init_null(slot(chunk, 1));
        let head = FreelistEntry::emplace_and_init_null(slot(chunk, 0));
        (*head).set_next(second);

        // A use-after-free write lands on the shadow word.
        let words = slot(chunk, 0) as *mut usize;
        words.add(1).write(0);

        assert!((*head).get_next::<false>(SLOT_SIZE).is_null());
        assert!((*head)
            .get_next_for_thread_cache::<false>(SLOT_SIZE)
            .is_null());
    }
}

#[test]
fn stray_pool_base_bits_are_rejected() {
    let chunk = committed_super_page();
    unsafe {
        FreelistEntry::emplace_and_init_null(slot(chunk, 0));

        // Plant an "offset" carrying pool-base bits, with a matching shadow
        // so only the mask check can catch it.
        let planted = POOL_BASE_MASK | (slot(chunk, 1) & !POOL_BASE_MASK);
        let words = slot(chunk, 0) as *mut usize;
        words.write(planted);
        words.add(1).write(!planted);

        let head = slot(chunk, 0) as *const FreelistEntry;
        assert!((*head).get_next::<false>(SLOT_SIZE).is_null());
    }
}

#[test]
fn links_into_the_metadata_area_are_rejected() {
    let chunk = committed_super_page();
    unsafe {
        FreelistEntry::emplace_and_init_null(slot(chunk, 0));

        // A pointer into the first partition page of the super-page, where
        // the slot-span metadata lives.
        let target = chunk + 64;
        let planted = target & !POOL_BASE_MASK;
        let words = slot(chunk, 0) as *mut usize;
        words.write(planted);
        words.add(1).write(!planted);

        let head = slot(chunk, 0) as *const FreelistEntry;
        assert!((*head).get_next::<false>(SLOT_SIZE).is_null());
        assert!((*head)
            .get_next_for_thread_cache::<false>(SLOT_SIZE)
            .is_null());
    }
}

#[test]
fn cross_super_page_links_only_pass_for_thread_cache() {
    let chunk_a = committed_super_page();
    let chunk_b = committed_super_page();
    assert_ne!(chunk_a, chunk_b);
    unsafe {
        let far_entry = FreelistEntry::emplace_and_init_null(slot(chunk_b, 0));
        let head = FreelistEntry::emplace_with_next(slot(chunk_a, 0), far_entry);

        // Regular traversal requires the same super-page.
        assert!((*head).get_next::<false>(SLOT_SIZE).is_null());
        // Thread-cache lists legitimately chain across super-pages.
        assert_eq!(
            (*head).get_next_for_thread_cache::<false>(SLOT_SIZE),
            far_entry
        );
        (*head).check_free_list_for_thread_cache(SLOT_SIZE);
    }
}

// ---------------------------------------------------------------------------
// Abort path (crash_on_corruption = true), exercised in a subprocess
// ---------------------------------------------------------------------------

fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env("CAGEALLOC_HARDENING_SCENARIO", scenario_name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have aborted. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("CAGEALLOC_HARDENING_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "shadow_corruption_crash" => scenario_shadow_corruption_crash(),
        "stray_bits_crash" => scenario_stray_bits_crash(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

fn scenario_shadow_corruption_crash() {
    let chunk = committed_super_page();
    unsafe {
        let second = FreelistEntry::emplace_and_init_null(slot(chunk, 1));
        let head = FreelistEntry::emplace_and_init_null(slot(chunk, 0));
        (*head).set_next(second);

        let words = slot(chunk, 0) as *mut usize;
        words.add(1).write(0);

        // Aborts with the freelist-corruption signature.
        let _ = (*head).get_next::<true>(SLOT_SIZE);
    }
    unreachable!("freelist corruption was not detected");
}

fn scenario_stray_bits_crash() {
    let chunk = committed_super_page();
    unsafe {
        FreelistEntry::emplace_and_init_null(slot(chunk, 0));
        let planted = POOL_BASE_MASK | 0x40;
        let words = slot(chunk, 0) as *mut usize;
        words.write(planted);
        words.add(1).write(!planted);

        let head = slot(chunk, 0) as *const FreelistEntry;
        let _ = (*head).get_next::<true>(SLOT_SIZE);
    }
    unreachable!("freelist corruption was not detected");
}

#[cfg(feature = "shadow")]
#[test]
fn shadow_corruption_aborts_when_crashing_is_requested() {
    expect_abort_subprocess("shadow_corruption_crash", "freelist corruption detected");
}

#[test]
fn stray_bits_abort_when_crashing_is_requested() {
    expect_abort_subprocess("stray_bits_crash", "freelist corruption detected");
}
