//! Per-CPU sharded usage counters: `fs_usage`/`dev_usage`, each existing as
//! a live and a gc instance. Readers sum every shard; writers only ever
//! touch their own shard, folding a signed delta into it as a wrapping
//! add of the delta's bit pattern — exactly two's complement addition
//! for the signed fields, so overflow from one field never carries into
//! its neighbor.

use crate::bucket_mark::DataType;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const MAX_REPLICAS: usize = 4;

/// Replication-level bucket of a usage snapshot: `replicas[r-1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaUsage {
    pub data: [u64; DataType::COUNT],
    pub persistent_reserved: u64,
    pub ec_data: u64,
}

impl ReplicaUsage {
    fn add_delta(&mut self, d: &ReplicaDelta) {
        for i in 0..DataType::COUNT {
            self.data[i] = self.data[i].wrapping_add(d.data[i] as u64);
        }
        self.persistent_reserved = self.persistent_reserved.wrapping_add(d.persistent_reserved as u64);
        self.ec_data = self.ec_data.wrapping_add(d.ec_data as u64);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaDelta {
    pub data: [i64; DataType::COUNT],
    pub persistent_reserved: i64,
    pub ec_data: i64,
}

/// A transient, per-transaction accumulator. The marking engine folds
/// per-pointer/per-key effects into one of these, and the caller commits
/// it with [`crate::fs::Filesystem::apply`] (fs_usage) or directly via
/// [`UsageCounters::add`] (dev_usage, applied immediately per pointer).
#[derive(Debug, Clone, Default)]
pub struct UsageDelta {
    pub hidden: i64,
    pub data: i64,
    pub cached: i64,
    pub reserved: i64,
    pub online_reserved: i64,
    pub nr_inodes: i64,
    pub buckets: [i64; DataType::COUNT],
    pub sectors: [i64; DataType::COUNT],
    pub buckets_unavailable: i64,
    pub replicas: [ReplicaDelta; MAX_REPLICAS],
}

impl UsageDelta {
    pub fn zero(&mut self) {
        *self = UsageDelta::default();
    }

    pub fn is_zero(&self) -> bool {
        self.hidden == 0
            && self.data == 0
            && self.cached == 0
            && self.reserved == 0
            && self.online_reserved == 0
            && self.nr_inodes == 0
            && self.buckets.iter().all(|&v| v == 0)
            && self.sectors.iter().all(|&v| v == 0)
            && self.buckets_unavailable == 0
    }
}

/// A summed, point-in-time view of a [`UsageCounters`] instance. Not
/// linearizable with concurrent updates — summing per-shard fields
/// one at a time means a writer can land between two fields being
/// read, so callers accept slight cross-field inconsistency in
/// exchange for never blocking a writer on a reader.
#[derive(Debug, Clone, Default)]
pub struct UsageShard {
    pub hidden: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub online_reserved: u64,
    pub nr_inodes: u64,
    pub buckets: [u64; DataType::COUNT],
    pub sectors: [u64; DataType::COUNT],
    pub buckets_unavailable: u64,
    pub replicas: [ReplicaUsage; MAX_REPLICAS],
}

impl UsageShard {
    fn add_delta(&mut self, d: &UsageDelta) {
        self.hidden = self.hidden.wrapping_add(d.hidden as u64);
        self.data = self.data.wrapping_add(d.data as u64);
        self.cached = self.cached.wrapping_add(d.cached as u64);
        self.reserved = self.reserved.wrapping_add(d.reserved as u64);
        self.online_reserved = self.online_reserved.wrapping_add(d.online_reserved as u64);
        self.nr_inodes = self.nr_inodes.wrapping_add(d.nr_inodes as u64);
        for i in 0..DataType::COUNT {
            self.buckets[i] = self.buckets[i].wrapping_add(d.buckets[i] as u64);
            self.sectors[i] = self.sectors[i].wrapping_add(d.sectors[i] as u64);
        }
        self.buckets_unavailable = self.buckets_unavailable.wrapping_add(d.buckets_unavailable as u64);
        for i in 0..MAX_REPLICAS {
            self.replicas[i].add_delta(&d.replicas[i]);
        }
    }

    fn sum(a: &UsageShard, b: &UsageShard) -> UsageShard {
        let mut out = a.clone();
        out.hidden = out.hidden.wrapping_add(b.hidden);
        out.data = out.data.wrapping_add(b.data);
        out.cached = out.cached.wrapping_add(b.cached);
        out.reserved = out.reserved.wrapping_add(b.reserved);
        out.online_reserved = out.online_reserved.wrapping_add(b.online_reserved);
        out.nr_inodes = out.nr_inodes.wrapping_add(b.nr_inodes);
        out.buckets_unavailable = out.buckets_unavailable.wrapping_add(b.buckets_unavailable);
        for i in 0..DataType::COUNT {
            out.buckets[i] = out.buckets[i].wrapping_add(b.buckets[i]);
            out.sectors[i] = out.sectors[i].wrapping_add(b.sectors[i]);
        }
        for i in 0..MAX_REPLICAS {
            for j in 0..DataType::COUNT {
                out.replicas[i].data[j] = out.replicas[i].data[j].wrapping_add(b.replicas[i].data[j]);
            }
            out.replicas[i].persistent_reserved =
                out.replicas[i].persistent_reserved.wrapping_add(b.replicas[i].persistent_reserved);
            out.replicas[i].ec_data = out.replicas[i].ec_data.wrapping_add(b.replicas[i].ec_data);
        }
        out
    }
}

/// Public `{capacity, used, nr_inodes}` view derived from a summed shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageShort {
    pub capacity: u64,
    pub used: u64,
    pub nr_inodes: u64,
}

/// `reserve_factor(r) = r + round_up(r, 2^6) >> 6` — the metadata-overhead
/// markup (~65/64) charged on reserved sectors.
pub fn reserve_factor(r: u64) -> u64 {
    let rounded = round_up_pow2(r, 64);
    r + (rounded >> 6)
}

/// `avail_factor(r) = r * 64 / 65`, the inverse translation from free
/// sectors to admissible reservable sectors.
pub fn avail_factor(r: u64) -> u64 {
    r.saturating_mul(64) / 65
}

fn round_up_pow2(x: u64, pow2: u64) -> u64 {
    debug_assert!(pow2.is_power_of_two());
    (x + pow2 - 1) & !(pow2 - 1)
}

const MAX_SHARDS: usize = 128;

/// Assigns each thread a stable shard index for the lifetime of the
/// process, the user-space stand-in for a kernel's per-CPU counter:
/// each thread sticks to one shard instead of migrating between them
/// on every update.
struct ShardPicker {
    nr_shards: usize,
    next: AtomicUsize,
}

thread_local! {
    static SHARD_ID: Cell<Option<usize>> = Cell::new(None);
}

impl ShardPicker {
    fn new(nr_shards: usize) -> Self {
        ShardPicker { nr_shards: nr_shards.max(1), next: AtomicUsize::new(0) }
    }

    fn current(&self) -> usize {
        SHARD_ID.with(|cell| {
            if let Some(id) = cell.get() {
                return id % self.nr_shards;
            }
            let id = self.next.fetch_add(1, Ordering::Relaxed) % self.nr_shards;
            cell.set(Some(id));
            id
        })
    }
}

/// Sharded counter block. One instance is `fs_usage` or `dev_usage`;
/// a [`crate::gc::LiveGc`] wraps a pair for the live/gc shadow worlds.
pub struct UsageCounters {
    shards: Vec<CachePadded<Mutex<UsageShard>>>,
    picker: ShardPicker,
}

/// Default shard count: the number of logical CPUs, capped. Approximates
/// per-CPU sharding without depending on an actual CPU-pinning facility.
pub fn default_nr_shards() -> usize {
    num_cpus::get().clamp(1, MAX_SHARDS)
}

impl UsageCounters {
    pub fn new(nr_shards: usize) -> Self {
        let nr_shards = nr_shards.clamp(1, MAX_SHARDS);
        UsageCounters {
            shards: (0..nr_shards).map(|_| CachePadded::new(Mutex::new(UsageShard::default()))).collect(),
            picker: ShardPicker::new(nr_shards),
        }
    }

    /// Fold `delta` into the calling thread's shard. Callers are expected
    /// to hold a read pin on the owning filesystem's `mark_lock`.
    pub fn add(&self, delta: &UsageDelta) {
        if delta.is_zero() {
            return;
        }
        let shard = self.picker.current();
        self.shards[shard].lock().add_delta(delta);
    }

    /// Point-in-time sum across all shards. Not linearizable with
    /// concurrent `add`s.
    pub fn read(&self) -> UsageShard {
        self.shards
            .iter()
            .map(|s| s.lock().clone())
            .fold(UsageShard::default(), |acc, s| UsageShard::sum(&acc, &s))
    }

    pub fn read_short(&self, capacity_sectors: u64, hidden: u64) -> UsageShort {
        let s = self.read();
        let capacity = capacity_sectors.saturating_sub(hidden);
        let used = (s.data + reserve_factor(s.reserved + s.online_reserved)).min(capacity);
        UsageShort { capacity, used, nr_inodes: s.nr_inodes }
    }

    pub fn nr_shards(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_factor_matches_65_over_64() {
        assert_eq!(reserve_factor(0), 0);
        assert_eq!(reserve_factor(64), 65);
        assert_eq!(reserve_factor(128), 130);
        // not a multiple of 64: rounds the overhead up, not down
        assert_eq!(reserve_factor(1), 1 + 1); // round_up(1,64)=64, >>6=1
        assert_eq!(reserve_factor(65), 65 + 2); // round_up(65,64)=128, >>6=2
    }

    #[test]
    fn avail_factor_is_never_an_overestimate() {
        for r in [0u64, 1, 63, 64, 65, 1_000_000, u32::MAX as u64] {
            let inverted = avail_factor(reserve_factor(r));
            assert!(inverted <= r, "avail_factor(reserve_factor({r})) = {inverted} > {r}");
        }
    }

    #[test]
    fn add_and_read_roundtrip() {
        let c = UsageCounters::new(4);
        let mut d = UsageDelta::default();
        d.data = 100;
        d.buckets[DataType::User as usize] = 1;
        c.add(&d);
        let s = c.read();
        assert_eq!(s.data, 100);
        assert_eq!(s.buckets[DataType::User as usize], 1);

        d.data = -100;
        d.buckets[DataType::User as usize] = -1;
        c.add(&d);
        let s = c.read();
        assert_eq!(s.data, 0);
        assert_eq!(s.buckets[DataType::User as usize], 0);
    }

    #[test]
    fn read_short_clamps_to_capacity() {
        let c = UsageCounters::new(2);
        let mut d = UsageDelta::default();
        d.data = 9000;
        c.add(&d);
        let short = c.read_short(8192, 0);
        assert_eq!(short.capacity, 8192);
        assert_eq!(short.used, 8192);
    }
}
