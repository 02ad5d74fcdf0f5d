//! Quarantine behavior tests, driven through real allocator roots.
//!
//! Each test creates its own leaked root (roots are process-lifetime
//! objects), so tests stay independent even though they share the cage.

use cagealloc::bucket::BucketDistribution;
use cagealloc::quarantine::{
    QuarantineConfig, QuarantineStats, ScopedQuarantineExclusion, ThreadBoundQuarantineBranch,
};
use cagealloc::root::{AllocatorRoot, Settings, SlotSpanMetadata};
use cagealloc::util::ZAP_BYTE;

fn test_root() -> &'static AllocatorRoot {
    // BRP off keeps usable sizes equal to slot sizes, which the arithmetic
    // below relies on.
    AllocatorRoot::new_leaked(Settings {
        with_brp: false,
        bucket_distribution: BucketDistribution::Denser,
        ..Settings::default()
    })
}

fn configured_root(capacity_in_bytes: usize, enable_zapping: bool) -> &'static AllocatorRoot {
    let root = test_root();
    root.configure_quarantine(QuarantineConfig {
        capacity_in_bytes,
        enable_quarantine: true,
        enable_zapping,
        leak_on_destruction: false,
    });
    root
}

fn stats(root: &AllocatorRoot) -> QuarantineStats {
    let mut stats = QuarantineStats::default();
    root.quarantine_root().accumulate_stats(&mut stats);
    stats
}

#[test]
fn entries_are_held_up_to_capacity() {
    let root = configured_root(1024, false);

    let mut objects = Vec::new();
    for _ in 0..10 {
        let p = root.try_alloc(64, false);
        assert!(!p.is_null());
        objects.push(p);
    }
    for &p in &objects {
        unsafe { root.free(p) };
    }

    // All ten 64-byte entries are held.
    assert_eq!(root.quarantine_branch().branch_size_in_bytes_for_testing(), 640);
    let s = stats(root);
    assert_eq!(s.count, 10);
    assert_eq!(s.size_in_bytes, 640);
    assert_eq!(s.cumulative_count, 10);
    assert_eq!(s.cumulative_size_in_bytes, 640);
    assert_eq!(s.quarantine_miss_count, 0);
    for &p in &objects {
        assert!(unsafe { root.quarantine_branch().is_quarantined_for_testing(p) });
    }
}

#[test]
fn over_capacity_entries_evict_older_ones() {
    let root = configured_root(1024, false);

    for _ in 0..10 {
        let p = root.try_alloc(64, false);
        unsafe { root.free(p) };
    }
    assert_eq!(stats(root).count, 10);

    // A 512-byte entry only fits next to at most 512 bytes of older ones:
    // two of the ten 64-byte entries must be released, in shuffled order.
    let big = root.try_alloc(512, false);
    unsafe { root.free(big) };

    let branch_size = root.quarantine_branch().branch_size_in_bytes_for_testing();
    assert_eq!(branch_size, 512 + 8 * 64);
    assert!(branch_size <= 1024);
    let s = stats(root);
    assert_eq!(s.count, 9);
    assert_eq!(s.size_in_bytes, branch_size);
    assert_eq!(s.cumulative_count, 11);
    assert!(unsafe { root.quarantine_branch().is_quarantined_for_testing(big) });
}

#[test]
fn oversized_entry_is_a_quarantine_miss() {
    let root = configured_root(100, false);

    let p = root.try_alloc(200, false);
    unsafe { root.free(p) };

    // Dropped straight to the immediate path; the branch is untouched.
    assert_eq!(root.quarantine_branch().branch_size_in_bytes_for_testing(), 0);
    let s = stats(root);
    assert_eq!(s.count, 0);
    assert_eq!(s.quarantine_miss_count, 1);
    assert!(!unsafe { root.quarantine_branch().is_quarantined_for_testing(p) });

    // The slot went back on its freelist.
    let q = root.try_alloc(200, false);
    assert_eq!(q, p);
}

#[test]
fn zapping_overwrites_quarantined_objects() {
    let root = configured_root(4096, true);

    let p = root.try_alloc(64, false);
    unsafe {
        core::ptr::write_bytes(p, 0xAB, 64);
        root.free(p);
    }

    assert!(unsafe { root.quarantine_branch().is_quarantined_for_testing(p) });
    // The quarantined object was overwritten with the zap pattern. The
    // memory stays committed while quarantined, so reading it is safe here.
    let contents = unsafe { std::slice::from_raw_parts(p, 64) };
    assert!(contents.iter().all(|&b| b == ZAP_BYTE));
}

#[test]
fn purge_drains_the_branch_and_is_idempotent() {
    let root = configured_root(4096, false);

    let mut objects = Vec::new();
    for _ in 0..8 {
        let p = root.try_alloc(128, false);
        unsafe { root.free(p) };
        objects.push(p);
    }
    assert_eq!(stats(root).count, 8);

    root.quarantine_branch().purge();
    assert_eq!(root.quarantine_branch().branch_size_in_bytes_for_testing(), 0);
    let s = stats(root);
    assert_eq!(s.count, 0);
    assert_eq!(s.size_in_bytes, 0);
    // Cumulative counters never move backwards.
    assert_eq!(s.cumulative_count, 8);

    // Purging an empty branch is a no-op.
    root.quarantine_branch().purge();
    assert_eq!(stats(root).count, 0);

    // Drained slots are allocatable again.
    let p = root.try_alloc(128, false);
    assert!(objects.contains(&p));
}

#[test]
fn shrinking_capacity_takes_effect_on_the_next_call() {
    let root = configured_root(4096, false);

    for _ in 0..4 {
        let p = root.try_alloc(256, false);
        unsafe { root.free(p) };
    }
    assert_eq!(root.quarantine_branch().branch_size_in_bytes_for_testing(), 1024);

    // Shrinking alone does not purge.
    root.quarantine_branch().set_capacity_in_bytes(512);
    assert_eq!(root.quarantine_branch().branch_size_in_bytes_for_testing(), 1024);

    // The next quarantine call enforces the new limit.
    let p = root.try_alloc(256, false);
    unsafe { root.free(p) };
    assert!(root.quarantine_branch().branch_size_in_bytes_for_testing() <= 512);
}

#[test]
fn paused_branch_frees_immediately() {
    let root = configured_root(4096, false);

    let p = root.try_alloc(64, false);
    {
        let _pause = ScopedQuarantineExclusion::new(root.quarantine_branch());
        unsafe { root.free(p) };
        assert_eq!(stats(root).count, 0);
        // Immediate free puts the slot straight back on the freelist.
        let q = root.try_alloc(64, false);
        assert_eq!(q, p);
        unsafe { root.free(q) };
    }

    // With the scope gone, quarantining resumes.
    let r = root.try_alloc(64, false);
    unsafe { root.free(r) };
    assert_eq!(stats(root).count, 1);
}

#[test]
fn direct_mapped_allocations_bypass_the_quarantine() {
    let root = configured_root(1 << 22, false);

    let p = root.try_alloc(600 * 1024, false);
    assert!(!p.is_null());
    unsafe { root.free(p) };

    let s = stats(root);
    assert_eq!(s.count, 0);
    assert_eq!(s.cumulative_count, 0);
    assert_eq!(s.quarantine_miss_count, 0);
}

#[test]
fn disabled_quarantine_frees_immediately() {
    let root = test_root();
    root.configure_quarantine(QuarantineConfig {
        capacity_in_bytes: 4096,
        enable_quarantine: false,
        enable_zapping: false,
        leak_on_destruction: false,
    });

    let p = root.try_alloc(64, false);
    unsafe { root.free(p) };
    assert_eq!(stats(root).count, 0);
    let q = root.try_alloc(64, false);
    assert_eq!(q, p);
}

#[test]
fn reconfiguring_clears_held_entries_first() {
    let root = configured_root(4096, false);

    for _ in 0..4 {
        let p = root.try_alloc(64, false);
        unsafe { root.free(p) };
    }
    assert_eq!(stats(root).count, 4);

    root.configure_quarantine(QuarantineConfig {
        capacity_in_bytes: 8192,
        enable_quarantine: true,
        enable_zapping: false,
        leak_on_destruction: false,
    });

    assert_eq!(root.quarantine_branch().branch_size_in_bytes_for_testing(), 0);
    assert_eq!(stats(root).count, 0);
    assert_eq!(root.quarantine_branch().capacity_in_bytes(), 8192);
    assert_eq!(
        root.quarantine_branch().config_for_testing().capacity_in_bytes,
        8192
    );
}

#[test]
fn release_order_is_shuffled() {
    const N: usize = 32;
    let root = configured_root(64 * N, false);

    // Quarantine N slots, then drain them. The purge frees entries onto the
    // span freelist one by one, so re-allocating afterwards returns slots in
    // reverse eviction order.
    let mut inserted = Vec::new();
    for _ in 0..N {
        let p = root.try_alloc(64, false);
        unsafe { root.free(p) };
        inserted.push(p as usize);
    }
    root.quarantine_branch().purge();

    let mut reuse_order = Vec::new();
    for _ in 0..N {
        reuse_order.push(root.try_alloc(64, false) as usize);
    }
    let mut eviction_order = reuse_order.clone();
    eviction_order.reverse();

    // Same set of slots...
    let mut sorted_inserted = inserted.clone();
    let mut sorted_evicted = eviction_order.clone();
    sorted_inserted.sort_unstable();
    sorted_evicted.sort_unstable();
    assert_eq!(sorted_inserted, sorted_evicted);

    // ...but the per-insert Fisher-Yates step makes replaying the insertion
    // order (or its reverse) astronomically unlikely.
    assert_ne!(eviction_order, inserted);
    let mut reversed_insertion = inserted.clone();
    reversed_insertion.reverse();
    assert_ne!(eviction_order, reversed_insertion);
}

// ---------------------------------------------------------------------------
// Thread-bound branch
// ---------------------------------------------------------------------------

#[test]
fn thread_bound_branch_holds_and_purges() {
    let root = test_root();
    // The root's own (global) branch stays disabled; we drive a
    // thread-bound branch directly.
    root.configure_quarantine(QuarantineConfig::default());

    let branch = ThreadBoundQuarantineBranch::new();
    branch.configure(
        root,
        root.quarantine_root(),
        QuarantineConfig {
            capacity_in_bytes: 1024,
            enable_quarantine: true,
            enable_zapping: true,
            leak_on_destruction: false,
        },
    );

    unsafe {
        let p = root.try_alloc(64, false);
        let span = SlotSpanMetadata::from_object(p);
        let slot_start = root.object_to_slot_start_unchecked(p);
        assert_eq!(slot_start, p as usize);

        branch.quarantine(p, span, slot_start, root.get_usable_size(p), None);
        assert!(branch.is_quarantined_for_testing(p));
        assert_eq!(branch.branch_size_in_bytes_for_testing(), 64);
        assert_eq!(stats(root).count, 1);

        // Zapped in place, like the shared variant.
        let contents = std::slice::from_raw_parts(p, 64);
        assert!(contents.iter().all(|&b| b == ZAP_BYTE));

        branch.purge();
        assert!(!branch.is_quarantined_for_testing(p));
        assert_eq!(stats(root).count, 0);
        let q = root.try_alloc(64, false);
        assert_eq!(q, p);
    }
}

#[test]
fn thread_bound_branch_enforces_capacity_inline() {
    let root = test_root();
    root.configure_quarantine(QuarantineConfig::default());

    let branch = ThreadBoundQuarantineBranch::new();
    branch.configure(
        root,
        root.quarantine_root(),
        QuarantineConfig {
            capacity_in_bytes: 256,
            enable_quarantine: true,
            enable_zapping: false,
            leak_on_destruction: false,
        },
    );

    unsafe {
        for _ in 0..8 {
            let p = root.try_alloc(64, false);
            let span = SlotSpanMetadata::from_object(p);
            branch.quarantine(p, span, p as usize, root.get_usable_size(p), None);
        }
        // Only capacity/64 = 4 entries can be held at once.
        assert_eq!(branch.branch_size_in_bytes_for_testing(), 256);
        assert_eq!(stats(root).count, 4);
        assert_eq!(stats(root).cumulative_count, 8);
    }
}
