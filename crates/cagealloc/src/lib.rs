//! Core of a partition-style hardened allocator: a process-wide
//! address-space cage carved into pools, super-page chunks handed out by
//! bitmap, a corruption-detecting intra-pool-offset freelist, and a
//! randomized deferred-free quarantine.
//!
//! The `dispatch` module is the surface a `malloc`-interception shim calls
//! into; everything else is the machinery behind it.

extern crate libc;

#[cfg(feature = "brp")]
pub mod brp;
pub mod bucket;
pub mod config;
pub mod dispatch;
pub mod freelist;
pub mod global_alloc;
pub mod oom;
pub mod platform;
pub mod pool;
pub mod quarantine;
pub mod root;
pub mod sync;
pub mod util;
