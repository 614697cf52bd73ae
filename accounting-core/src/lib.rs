//! Bucket-level space accounting for a copy-on-write block filesystem:
//! per-bucket marks, sharded live/gc usage counters, stripe tracking,
//! and disk-reservation admission control.
//!
//! This crate owns none of the on-disk format or btree walking; callers
//! decode keys and hand in their pointers via [`mark::mark_key`] and
//! friends, and read back aggregate usage through [`fs::Filesystem`].

pub mod bucket_mark;
pub mod bucket_seq;
pub mod bucket_table;
pub mod device;
pub mod error;
pub mod fs;
pub mod gc;
mod loom_compat;
pub mod mark;
pub mod reservation;
pub mod stripe;
pub mod usage;

pub use bucket_mark::{BucketMark, DataType, Mark};
pub use device::Device;
pub use error::{AccountingError, Result};
pub use fs::{Filesystem, FsHooks, NullFsHooks};
pub use gc::{dev_usage_from_buckets, GcCursor, LiveGc, NullGcCursor, Pos, SweepCursor};
pub use mark::{
    classify_overlap, mark_alloc_bucket, mark_extent_update, mark_key, mark_metadata_bucket,
    mark_stripe_key, mark_update_overwrite, ExtentKey, KeyKind, MarkContext, OverlapKind,
    PointerRef, StripeKey,
};
pub use reservation::{flags as reservation_flags, DiskReservation, ReservationPool};
pub use stripe::{NullStripeHooks, Stripe, StripeHooks, StripeMap};
pub use usage::{avail_factor, reserve_factor, UsageCounters, UsageDelta, UsageShort};
