//! Swaps `std`'s atomics for `loom`'s under `--cfg loom`, the way the
//! sibling crate `sparking-lot-core` does for its lock-free primitives
//! (see its `src/real/loom.rs`). Only `BucketMark`'s CAS loop needs this;
//! everything else in the crate uses `parking_lot`/`arc_swap` directly
//! since those aren't on the hot lock-free path this crate's loom model
//! exists to check.

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::AtomicU64;

#[cfg(loom)]
pub(crate) use loom::sync::atomic::AtomicU64;
