//! The filesystem-wide aggregate: the device set, fs-level usage, the
//! stripe map, the reservation pool, and the locks that order marking
//! against gc and against concurrent resizes.

use crate::device::Device;
use crate::error::Result;
use crate::gc::{GcCursor, LiveGc, NullGcCursor, Pos};
use crate::reservation::{DiskReservation, ReservationPool};
use crate::stripe::{NullStripeHooks, StripeHooks, StripeMap};
use crate::usage::{UsageCounters, UsageDelta, UsageShort};
use log::warn;
use parking_lot::RwLock;
use std::sync::Arc;

/// Callbacks the marking engine and gc sweep fire into, kept external so
/// `accounting-core` has no opinion on how allocation wakeups or
/// inconsistency reporting actually happen.
pub trait FsHooks: Send + Sync {
    /// An unavailable bucket became available again; the allocator
    /// should be nudged in case it's waiting for free space.
    fn wake_allocator(&self, _device: u8) {}

    /// A marking operation found the accounting in a state that should
    /// never happen. The core itself always keeps running (it raised
    /// this instead of panicking); callers typically log and set a
    /// "needs fsck" flag.
    fn on_inconsistency(&self, _msg: &str) {}
}

/// A hooks implementation that does nothing, for single-device test
/// setups with no external allocator/fsck integration.
pub struct NullFsHooks;

impl FsHooks for NullFsHooks {}

pub struct Filesystem {
    pub devices: Vec<Arc<Device>>,
    pub usage: LiveGc<UsageCounters>,
    pub stripes: LiveGc<StripeMap>,
    pub reservations: ReservationPool,
    /// Held for read by every ordinary marking operation, for write by
    /// anything that must see a consistent snapshot across the whole
    /// accounting state (e.g. recalculating the reservation pool).
    pub mark_lock: RwLock<()>,
    /// Held for write while a gc sweep owns the shadow world; ordinary
    /// marks take it for read so they can tell a sweep is in progress.
    pub gc_lock: RwLock<()>,
    pub gc_cursor: Box<dyn GcCursor>,
    pub hooks: Box<dyn FsHooks>,
    pub stripe_hooks: Box<dyn StripeHooks>,
    /// Clamp ceiling for the replica/redundancy index into
    /// `UsageDelta::replicas`/`UsageShard::replicas`, itself bounded by
    /// `usage::MAX_REPLICAS` (the array's fixed size).
    pub max_replicas: usize,
    /// Fixed size, in sectors, of every btree node; [`crate::mark::mark_key`]
    /// marks exactly this many sectors per pointer for [`crate::mark::KeyKind::BtreeNode`]
    /// keys, regardless of the caller-supplied sector magnitude.
    pub btree_node_size: u64,
    pub nr_shards: usize,
    /// Total admissible capacity in sectors, the baseline
    /// `recalculate_reservations` rebuilds the pool from; not itself
    /// protected by `mark_lock` since it never changes after construction
    /// (device resize would update it, but resize is out of this core's
    /// scope beyond the bucket table itself).
    pub capacity_sectors: u64,
}

impl Filesystem {
    pub fn new(devices: Vec<Arc<Device>>, capacity_sectors: u64, nr_shards: usize) -> Self {
        Filesystem {
            devices,
            usage: LiveGc::new(UsageCounters::new(nr_shards), UsageCounters::new(nr_shards)),
            stripes: LiveGc::new(StripeMap::new(), StripeMap::new()),
            reservations: ReservationPool::new(nr_shards, capacity_sectors),
            mark_lock: RwLock::new(()),
            gc_lock: RwLock::new(()),
            gc_cursor: Box::new(NullGcCursor),
            hooks: Box::new(NullFsHooks),
            stripe_hooks: Box::new(NullStripeHooks),
            max_replicas: crate::usage::MAX_REPLICAS,
            btree_node_size: 256 * 1024 / 512,
            nr_shards,
            capacity_sectors,
        }
    }

    pub fn device(&self, idx: u8) -> Option<&Arc<Device>> {
        self.devices.get(idx as usize)
    }

    /// Fold a transient delta into fs-level usage counters. Also folds
    /// into the gc shadow world when a sweep has already passed `pos`,
    /// per the live/gc pairing rule. `force_gc` additionally routes the
    /// update into the gc shadow even when the cursor hasn't swept this
    /// far — the caller's own marking context already knows it's
    /// operating in GC mode (flags bit `GC` on the call), which
    /// `gc_visited` alone can't see.
    ///
    /// Device-level usage is *not* touched here: a key's pointers can
    /// span several devices, so by the time their combined delta reaches
    /// this fs-wide call site it can no longer be attributed to any one
    /// device. [`crate::mark::mark_pointer`] folds each pointer's own
    /// delta into its own device's usage shard directly, as it resolves
    /// that pointer.
    pub fn apply(&self, delta: &UsageDelta, pos: crate::gc::Pos) {
        self.apply_ctx(delta, pos, false)
    }

    pub fn apply_ctx(&self, delta: &UsageDelta, pos: crate::gc::Pos, force_gc: bool) {
        let _pin = self.mark_lock.read();
        self.usage.live.add(delta);
        if force_gc || self.gc_cursor.visited(pos) {
            self.usage.gc.add(delta);
        }
    }

    pub fn usage_short(&self, capacity_sectors: u64, hidden: u64) -> UsageShort {
        self.usage.live.read_short(capacity_sectors, hidden)
    }

    /// Acquire a disk reservation, charged against the shard the calling
    /// thread is already using for fs_usage. On success, credits
    /// `online_reserved` by the granted sector count, so the outstanding
    /// reservation shows up in usage reports until it's released or
    /// folded into a commit.
    ///
    /// On a cache/pool miss, falls through to `recalculate`: the pool is
    /// rebuilt from the live usage snapshot and the acquire is retried
    /// exactly once. If it's still short and
    /// [`crate::reservation::flags::NOFAIL`] isn't set, `NoSpace` is
    /// returned with the freshly recomputed (still insufficient) pool
    /// left in place — recalculation isn't undone just because it didn't
    /// find enough.
    pub fn acquire_reservation(
        &self,
        shard_hint: usize,
        sectors: u64,
        flags: u32,
    ) -> Result<DiskReservation> {
        {
            let _pin = self.mark_lock.read();
            match self.reservations.acquire(shard_hint, sectors, flags) {
                Ok(res) => {
                    let mut d = UsageDelta::default();
                    d.online_reserved = res.sectors as i64;
                    self.usage.live.add(&d);
                    return Ok(res);
                }
                Err(crate::error::AccountingError::NoSpace { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let _gc_pin = (flags & crate::reservation::flags::GC_LOCK_HELD == 0)
            .then(|| self.gc_lock.read());
        self.recalculate_reservations(self.capacity_sectors);

        let _pin = self.mark_lock.read();
        let res = self.reservations.acquire(shard_hint, sectors, flags)?;
        let mut d = UsageDelta::default();
        d.online_reserved = res.sectors as i64;
        self.usage.live.add(&d);
        Ok(res)
    }

    /// Release a reservation that was never committed (e.g. a transaction
    /// aborted), crediting its sectors back to the shard cache and
    /// debiting `online_reserved` by the same amount.
    pub fn release_reservation(&self, shard_hint: usize, reservation: DiskReservation) {
        let _pin = self.mark_lock.read();
        let mut d = UsageDelta::default();
        d.online_reserved = -(reservation.sectors as i64);
        self.usage.live.add(&d);
        self.reservations.release(shard_hint, reservation);
    }

    /// Commit path: fold a transaction's
    /// accumulated usage delta into the live (and gc, if visited)
    /// counters, and repay `reservation` by however many sectors the
    /// transaction actually persisted.
    ///
    /// `added = delta.data + delta.reserved` is what the transaction
    /// ended up writing. If `added` exceeds what the reservation was
    /// actually charged for (`should_not_have_added`), that excess is a
    /// bug — warned about and repaid straight to the global pool — but
    /// the commit still proceeds, debiting only the reservation's own
    /// sectors from itself and from `online_reserved`. `reservation` is
    /// left holding whatever sectors remain after the legitimate debit
    /// (normally zero) and the delta is zeroed after folding.
    pub fn apply_reservation(
        &self,
        delta: &mut UsageDelta,
        reservation: &mut DiskReservation,
        pos: Pos,
    ) {
        self.apply_reservation_ctx(delta, reservation, pos, false)
    }

    pub fn apply_reservation_ctx(
        &self,
        delta: &mut UsageDelta,
        reservation: &mut DiskReservation,
        pos: Pos,
        force_gc: bool,
    ) {
        let added = delta.data + delta.reserved;
        let should_not_have_added = added - reservation.sectors as i64;
        if should_not_have_added > 0 {
            warn!(
                "reservation under-covered commit by {should_not_have_added} sectors, repaying to pool"
            );
            self.reservations.credit_global(should_not_have_added as u64);
        }
        let legitimate = added - should_not_have_added.max(0);
        reservation.sectors = reservation.sectors.saturating_sub(legitimate.max(0) as u64);

        let _pin = self.mark_lock.read();
        let mut debit = UsageDelta::default();
        debit.online_reserved = -legitimate;
        self.usage.live.add(&debit);
        if force_gc || self.gc_cursor.visited(pos) {
            self.usage.gc.add(&debit);
        }
        drop(_pin);

        self.apply_ctx(delta, pos, force_gc);
        delta.zero();
    }

    /// Recompute the reservation pool from the live usage snapshot.
    /// Called after a gc sweep publishes its recomputed fs usage, so
    /// long-run cache rounding in the per-shard reservation caches
    /// doesn't drift the pool away from the bucket-table ground truth.
    pub fn recalculate_reservations(&self, capacity_sectors: u64) {
        let _pin = self.mark_lock.write();
        let snapshot = self.usage.live.read();
        let used = snapshot.data + crate::usage::reserve_factor(snapshot.reserved + snapshot.online_reserved);
        self.reservations.recalculate(capacity_sectors, used);
    }
}
