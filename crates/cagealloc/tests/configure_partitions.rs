//! One-shot embedder configuration. Lives in its own test binary because
//! `configure_partitions` finalizes process-wide state.

use cagealloc::bucket::BucketDistribution;
use cagealloc::dispatch::{self, AllocToken, PartitionOptions};
use cagealloc::quarantine::{QuarantineConfig, QuarantineStats};
use core::ffi::c_void;
use std::ptr;

const NO_CTX: *mut c_void = ptr::null_mut();

#[test]
fn configure_partitions_replaces_all_roots() {
    assert!(!dispatch::allocator_configuration_finalized());

    // Allocate from the early root first, so a pre-configuration pointer is
    // live across the switch.
    let early = unsafe { dispatch::alloc(100, AllocToken::DEFAULT, NO_CTX) };
    let early_root = dispatch::allocator(AllocToken::DEFAULT) as *const _;

    dispatch::configure_partitions(PartitionOptions {
        enable_brp: cfg!(feature = "brp"),
        bucket_distribution: BucketDistribution::Denser,
        scheduler_loop_quarantine_global: QuarantineConfig {
            capacity_in_bytes: 8192,
            enable_quarantine: true,
            enable_zapping: true,
            leak_on_destruction: false,
        },
        scheduler_loop_quarantine_thread_local: QuarantineConfig {
            capacity_in_bytes: 2048,
            enable_quarantine: true,
            enable_zapping: false,
            leak_on_destruction: false,
        },
        eventual_zeroing: true,
        use_free_with_size: true,
        strict_size_check: true,
        ..PartitionOptions::default()
    });

    assert!(dispatch::allocator_configuration_finalized());
    assert!(dispatch::use_free_with_size());
    assert_eq!(dispatch::thread_local_quarantine_config().capacity_in_bytes, 2048);

    // Every token now resolves to a fresh root with the final options; the
    // originals remain queryable for late-binding statistics.
    for index in 0..dispatch::MAX_ALLOC_TOKENS {
        let token = AllocToken::new(index as u8);
        let root = dispatch::allocator(token);
        assert_eq!(root.settings().bucket_distribution, BucketDistribution::Denser);
        assert!(root.settings().zero_on_free);
        assert!(root.settings().strict_size_check);
        assert_eq!(root.quarantine_branch().capacity_in_bytes(), 8192);

        let original = dispatch::original_allocator(token).expect("original root must survive");
        assert!(!ptr::eq(root, original));
    }
    assert!(ptr::eq(
        dispatch::original_allocator(AllocToken::DEFAULT).unwrap(),
        early_root
    ));

    unsafe {
        // New allocations land in the replacement root's quarantine on free.
        let p = dispatch::alloc(64, AllocToken::DEFAULT, NO_CTX);
        dispatch::free(p, NO_CTX);
        let mut stats = QuarantineStats::default();
        dispatch::allocator(AllocToken::DEFAULT)
            .quarantine_root()
            .accumulate_stats(&mut stats);
        assert_eq!(stats.count, 1);

        // The pre-configuration pointer still frees correctly: the owning
        // root is derived from the address, not from the installed table.
        dispatch::free(early, NO_CTX);
        let mut old_stats = QuarantineStats::default();
        dispatch::original_allocator(AllocToken::DEFAULT)
            .unwrap()
            .quarantine_root()
            .accumulate_stats(&mut old_stats);
        assert_eq!(old_stats.count, 1);

        // A thread-bound branch created now picks up the configured
        // thread-local settings.
        let branch = dispatch::create_thread_bound_branch(AllocToken::DEFAULT);
        assert_eq!(branch.config_for_testing().capacity_in_bytes, 2048);
        assert!(branch.config_for_testing().enable_quarantine);
    }
}
