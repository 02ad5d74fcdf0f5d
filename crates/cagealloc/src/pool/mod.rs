pub mod address_space;
pub mod manager;

/// Identifies a registered pool. Handles are 1-based; `PoolHandle::NONE`
/// (zero) never names a pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PoolHandle(pub u32);

impl PoolHandle {
    pub const NONE: PoolHandle = PoolHandle(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Index into the pool table.
    #[inline]
    pub(crate) fn table_index(self) -> usize {
        debug_assert!(self.0 != 0);
        (self.0 - 1) as usize
    }
}

/// Number of pool table entries: non-BRP, BRP, configurable.
pub const NUM_POOLS: usize = 3;
