//! A single block device: its bucket table (behind an `ArcSwap` so a
//! resize publishes atomically), freelist, and per-device usage shadow
//! pair.

use crate::bucket_mark::Mark;
use crate::bucket_table::BucketTable;
use crate::error::Result;
use crate::gc::LiveGc;
use crate::usage::UsageCounters;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

pub struct Device {
    pub idx: u8,
    table: ArcSwap<BucketTable>,
    /// Serializes resizes against each other and against readers that
    /// need a stable view across more than one table access.
    bucket_lock: RwLock<()>,
    freelist_lock: Mutex<VecDeque<u64>>,
    pub usage: LiveGc<UsageCounters>,
}

impl Device {
    pub fn new(idx: u8, first_bucket: u64, nr_buckets: u64, nr_shards: usize) -> Self {
        Device {
            idx,
            table: ArcSwap::from_pointee(BucketTable::new(first_bucket, nr_buckets)),
            bucket_lock: RwLock::new(()),
            freelist_lock: Mutex::new(VecDeque::new()),
            usage: LiveGc::new(UsageCounters::new(nr_shards), UsageCounters::new(nr_shards)),
        }
    }

    pub fn table(&self) -> Arc<BucketTable> {
        self.table.load_full()
    }

    pub fn nr_buckets(&self) -> u64 {
        self.table.load().nr_buckets
    }

    /// Read the current mark for a bucket, or `None` if it's outside the
    /// current table's range.
    pub fn read_mark(&self, bucket: u64) -> Option<Mark> {
        self.table.load().mark(bucket).map(|m| m.read())
    }

    /// CAS-update a bucket's mark in place. Returns `(old, new)`.
    pub fn update_mark<F>(&self, bucket: u64, f: F) -> Option<(Mark, Mark)>
    where
        F: FnMut(Mark) -> Mark,
    {
        self.table.load().mark(bucket).map(|m| m.update(f))
    }

    /// Grow (or shrink) the bucket table to `nr_buckets`. Builds the new
    /// table off to the side and only then publishes it, so concurrent
    /// readers never see a partially built array; on allocation failure
    /// the existing table is left completely untouched.
    pub fn resize(&self, nr_buckets: u64) -> Result<()> {
        let _guard = self.bucket_lock.write();
        let current = self.table.load();
        let next = current.resized(nr_buckets)?;
        self.table.store(Arc::new(next));
        Ok(())
    }

    pub fn push_free(&self, bucket: u64) {
        self.freelist_lock.lock().push_back(bucket);
    }

    pub fn pop_free(&self) -> Option<u64> {
        self.freelist_lock.lock().pop_front()
    }

    pub fn freelist_len(&self) -> usize {
        self.freelist_lock.lock().len()
    }

    /// Fold all live buckets' dirty/cached sectors into a fresh
    /// [`crate::usage::UsageShard`]-shaped recomputation, used after a
    /// gc sweep rebuilds the shadow world from the bucket table itself
    /// rather than trusting accumulated deltas.
    pub fn recompute_usage_from_buckets(&self) -> crate::usage::UsageShard {
        use crate::bucket_mark::DataType;
        let table = self.table.load();
        let mut shard = crate::usage::UsageShard::default();
        for (_, mark) in table.iter_live() {
            let dt = mark.data_type() as usize;
            shard.sectors[dt] = shard.sectors[dt].wrapping_add(mark.dirty_sectors() as u64);
            shard.sectors[DataType::Cached as usize] =
                shard.sectors[DataType::Cached as usize].wrapping_add(mark.cached_sectors() as u64);
            if mark.is_unavailable() {
                shard.buckets_unavailable = shard.buckets_unavailable.wrapping_add(1);
            }
            shard.buckets[dt] = shard.buckets[dt].wrapping_add(1);
        }
        shard
    }
}
