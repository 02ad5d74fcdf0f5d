//! Fuzz the size-to-bucket mapping: any size must land in a bucket that
//! holds it, never skip a smaller sufficient bucket (denser distribution),
//! and round-trip through `bucket_slot_size` consistently.

#![no_main]

use libfuzzer_sys::fuzz_target;

use cagealloc::bucket::{
    bucket_index, bucket_slot_size, BucketDistribution, MAX_BUCKETED_SIZE,
};

fuzz_target!(|data: &[u8]| {
    let mut bytes = [0u8; 8];
    let len = data.len().min(8);
    bytes[..len].copy_from_slice(&data[..len]);
    let size = usize::from_le_bytes(bytes);

    for dist in [BucketDistribution::Neutral, BucketDistribution::Denser] {
        match bucket_index(size, dist) {
            Some(index) => {
                assert!(size <= MAX_BUCKETED_SIZE);
                let slot = bucket_slot_size(index);
                assert!(slot >= size);
                if dist == BucketDistribution::Denser && index > 0 {
                    assert!(bucket_slot_size(index - 1) < size.max(1));
                }
            }
            None => assert!(size > MAX_BUCKETED_SIZE),
        }
    }
});
