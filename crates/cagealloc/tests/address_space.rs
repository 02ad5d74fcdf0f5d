//! Cage lifecycle tests.
//!
//! Everything runs inside one test function: the cage is process-wide state,
//! and these checks exercise init, membership, offsets, the configurable
//! pool, and the test-only teardown in a fixed order.

use cagealloc::pool::address_space;
use cagealloc::pool::manager::AddressPoolManager;
use cagealloc::pool::PoolHandle;
use cagealloc::util::{POOL_SIZE, SUPER_PAGE_SIZE};

#[test]
fn cage_lifecycle() {
    // Before init, every membership test is deterministically false.
    assert!(!address_space::is_initialized());
    assert!(!address_space::is_managed(0));
    assert!(!address_space::is_managed(0x1234_5678));
    assert!(address_space::pool_of(0x1234_5678).is_none());

    address_space::init();
    assert!(address_space::is_initialized());
    // A second init is a no-op.
    address_space::init();

    let non_brp = address_space::non_brp_pool();
    let brp = address_space::brp_pool();
    assert!(!non_brp.is_none());
    assert!(!brp.is_none());
    assert_ne!(non_brp, brp);
    assert!(!address_space::is_configurable_pool_initialized());

    let manager = AddressPoolManager::get();

    // Chunks from each pool answer the right membership test.
    let a = manager.alloc(non_brp, SUPER_PAGE_SIZE);
    let b = manager.alloc(brp, SUPER_PAGE_SIZE);
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_eq!(a % SUPER_PAGE_SIZE, 0);
    assert_eq!(b % SUPER_PAGE_SIZE, 0);

    assert!(address_space::is_in_non_brp_pool(a));
    assert!(!address_space::is_in_brp_pool(a));
    assert!(address_space::is_in_brp_pool(b));
    assert!(!address_space::is_in_non_brp_pool(b));
    assert!(address_space::is_managed(a));
    assert!(address_space::is_managed(b));
    assert_eq!(address_space::pool_of(a), non_brp);
    assert_eq!(address_space::pool_of(b), brp);

    // Pools are adjacent, each aligned to its own size; the first non-BRP
    // chunk is the cage base and the first BRP chunk follows one pool later.
    assert_eq!(a % POOL_SIZE, 0);
    assert_eq!(b, a + POOL_SIZE);

    // Offsets are the low-order bits within the pool.
    let info_a = address_space::get_pool_and_offset(a);
    assert_eq!(info_a.handle, non_brp);
    assert_eq!(info_a.base, a);
    assert_eq!(info_a.offset, 0);
    let c = manager.alloc(non_brp, SUPER_PAGE_SIZE);
    let info_c = address_space::get_pool_and_offset(c);
    assert_eq!(info_c.offset, c - a);

    // The non-BRP pool withholds its last super-page, so a pointer one past
    // any non-BRP allocation can never land on the BRP pool base.
    let mut last = c;
    loop {
        let next = manager.alloc(non_brp, SUPER_PAGE_SIZE);
        if next == 0 {
            break;
        }
        last = next;
    }
    let total_non_brp_pages = (last - a) / SUPER_PAGE_SIZE + 1;
    assert_eq!(total_non_brp_pages, POOL_SIZE / SUPER_PAGE_SIZE - 1);
    assert_eq!(last + 2 * SUPER_PAGE_SIZE, b);
    // The withheld page is still cage address space, just never allocatable.
    assert!(address_space::is_in_non_brp_pool(last + SUPER_PAGE_SIZE));

    // Configurable pool: installed later, inside an embedder reservation.
    let configurable_size = 16 * SUPER_PAGE_SIZE; // 32 MiB, power of two
    let reservation = unsafe {
        cagealloc::platform::reserve_inaccessible(2 * configurable_size)
    };
    assert!(!reservation.is_null());
    let configurable_base =
        cagealloc::util::align_up(reservation as usize, configurable_size);
    address_space::init_configurable_pool(configurable_base, configurable_size);
    assert!(address_space::is_configurable_pool_initialized());

    let configurable = address_space::configurable_pool();
    assert!(!configurable.is_none());
    let d = manager.alloc(configurable, SUPER_PAGE_SIZE);
    assert_eq!(d, configurable_base);
    assert!(address_space::is_in_configurable_pool(d));
    assert!(!address_space::is_in_non_brp_pool(d));
    assert_eq!(address_space::pool_of(d), configurable);
    let info_d = address_space::get_pool_and_offset(d);
    assert_eq!(info_d.base, configurable_base);
    assert_eq!(info_d.base_mask, !(configurable_size - 1));

    // Teardown resets every membership test.
    address_space::uninit_for_testing();
    assert!(!address_space::is_initialized());
    assert!(!address_space::is_managed(a));
    assert!(!address_space::is_managed(b));
    assert!(!address_space::is_managed(d));
    assert_eq!(address_space::pool_of(a), PoolHandle::NONE);

    // The cage can be stood up again after a test reset.
    address_space::init();
    assert!(address_space::is_initialized());
    let e = manager.alloc(address_space::non_brp_pool(), SUPER_PAGE_SIZE);
    assert_ne!(e, 0);
    assert!(address_space::is_in_non_brp_pool(e));
}
