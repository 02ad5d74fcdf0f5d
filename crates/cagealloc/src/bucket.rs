//! Size classes. Buckets run from 16 bytes to 512 KiB with four sub-buckets
//! per doubling above 64 bytes; anything larger is direct-mapped.

/// Largest size served from slot spans.
pub const MAX_BUCKETED_SIZE: usize = 512 * 1024;

/// Smallest slot; also the minimum alignment of every allocation.
pub const MIN_BUCKETED_SIZE: usize = 16;

pub const NUM_BUCKETS: usize = 56;

/// How densely sizes map onto the ladder. `Neutral` skips the odd
/// sub-buckets (fewer, larger classes, less metadata); `Denser` uses every
/// rung.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum BucketDistribution {
    #[default]
    Neutral,
    Denser,
}

const fn build_slot_sizes() -> [usize; NUM_BUCKETS] {
    let mut table = [0usize; NUM_BUCKETS];
    table[0] = 16;
    table[1] = 32;
    table[2] = 48;
    let mut i = 3;
    let mut base = 64;
    while base <= 256 * 1024 {
        table[i] = base;
        table[i + 1] = base + base / 4;
        table[i + 2] = base + base / 2;
        table[i + 3] = base + 3 * (base / 4);
        i += 4;
        base *= 2;
    }
    table[i] = 512 * 1024;
    table
}

static SLOT_SIZES: [usize; NUM_BUCKETS] = build_slot_sizes();

/// Slot size of a bucket.
#[inline]
pub fn bucket_slot_size(index: usize) -> usize {
    SLOT_SIZES[index]
}

/// Smallest bucket whose slots hold `size` bytes, under the given
/// distribution. `None` when the size must be direct-mapped.
#[inline]
pub fn bucket_index(size: usize, distribution: BucketDistribution) -> Option<usize> {
    if size > MAX_BUCKETED_SIZE {
        return None;
    }
    let mut index = smallest_fitting_bucket(size);
    if distribution == BucketDistribution::Neutral && index > 3 {
        // Sub-buckets cycle 0..4 within each doubling starting at index 3.
        let sub = (index - 3) % 4;
        if sub == 1 || sub == 3 {
            index += 1;
        }
    }
    Some(index)
}

#[inline]
fn smallest_fitting_bucket(size: usize) -> usize {
    match size {
        0..=16 => 0,
        17..=32 => 1,
        33..=48 => 2,
        49..=64 => 3,
        _ => {
            // `size` lies in (base, 2*base] with base a power of two >= 64.
            let order = usize::BITS - (size - 1).leading_zeros(); // 2^order >= size
            let base = 1usize << (order - 1);
            let step = base / 4;
            let sub = (size - base).div_ceil(step);
            3 + 4 * (order as usize - 7) + sub
        }
    }
}
