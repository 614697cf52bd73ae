//! Disk-space reservation admission control: a per-CPU cache of
//! pre-charged sectors backed by one global pool, so the common case of
//! acquiring a small reservation never contends the global atomic.

use crate::usage::{avail_factor, reserve_factor};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sectors a shard pulls from the global pool at once, amortizing global
/// contention across many small reservation requests.
pub const SECTORS_CACHE: u64 = 1024;

/// Flags controlling reservation admission, mirrored as raw bits rather
/// than an enum since callers combine them freely.
pub mod flags {
    /// Succeed even if it pushes usage past the soft watermark; only a
    /// hard capacity check still applies.
    pub const NOFAIL: u32 = 1 << 0;
    /// Caller already holds the gc lock; skip attempting to take it.
    pub const GC_LOCK_HELD: u32 = 1 << 1;
    /// Caller already holds relevant btree locks.
    pub const BTREE_LOCKS_HELD: u32 = 1 << 2;
}

/// A granted reservation. Dropping it without calling
/// [`crate::fs::Filesystem::release_reservation`] leaks the charge until
/// process exit — callers are expected to always release explicitly, the
/// same discipline a C accounting layer with no RAII would demand.
#[derive(Debug)]
pub struct DiskReservation {
    pub sectors: u64,
}

impl DiskReservation {
    pub fn sectors(&self) -> u64 {
        self.sectors
    }
}

/// Global pool plus one cache per shard. `acquire` only touches the
/// global atomic when a shard's cache is exhausted; `release` only
/// touches it when a shard's cache would overflow `2 * SECTORS_CACHE`.
pub struct ReservationPool {
    /// Sectors still admissible fleet-wide, already expressed in
    /// reserve-factor terms (i.e. pre-inflated by ~65/64) so a shard can
    /// subtract straight from it without recomputing the factor.
    global: AtomicU64,
    shards: Vec<CachePadded<AtomicU64>>,
}

impl ReservationPool {
    pub fn new(nr_shards: usize, capacity_sectors: u64) -> Self {
        ReservationPool {
            global: AtomicU64::new(avail_factor(capacity_sectors)),
            shards: (0..nr_shards.max(1)).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
        }
    }

    fn shard_for(&self, shard_hint: usize) -> &AtomicU64 {
        &self.shards[shard_hint % self.shards.len()]
    }

    /// Try to admit `sectors` worth of reservation on behalf of
    /// `shard_hint`. With [`flags::NOFAIL`] set, draws straight from the
    /// global pool even past what would normally be refused, succeeding
    /// unless the pool is completely exhausted.
    pub fn acquire(
        &self,
        shard_hint: usize,
        sectors: u64,
        flags: u32,
    ) -> Result<DiskReservation, crate::error::AccountingError> {
        let inflated = reserve_factor(sectors);
        let shard = self.shard_for(shard_hint);

        let cached = shard.load(Ordering::Relaxed);
        if cached >= inflated {
            shard.fetch_sub(inflated, Ordering::Relaxed);
            return Ok(DiskReservation { sectors });
        }

        let need = inflated - cached;
        let topup = need.max(SECTORS_CACHE);
        let nofail = flags & flags::NOFAIL != 0;
        let mut global = self.global.load(Ordering::Relaxed);
        loop {
            let take = if global >= topup {
                topup
            } else if global >= need {
                need
            } else if nofail {
                // Overcommit: grant the full reservation anyway, draining
                // whatever the pool has left. The shard's cache ends up
                // short by `need - global`, which the next acquire on
                // this shard simply pays for by going back to the pool.
                global
            } else {
                return Err(crate::error::AccountingError::NoSpace {
                    requested: inflated,
                    available: global,
                });
            };
            match self.global.compare_exchange_weak(
                global,
                global - take,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let new_cache = (cached + take).saturating_sub(inflated);
                    shard.store(new_cache, Ordering::Relaxed);
                    return Ok(DiskReservation { sectors });
                }
                Err(actual) => global = actual,
            }
        }
    }

    /// Return a reservation's sectors to its shard's cache, flushing the
    /// surplus back to the global pool if the cache grows past twice its
    /// normal topup size.
    pub fn release(&self, shard_hint: usize, reservation: DiskReservation) {
        let inflated = reserve_factor(reservation.sectors);
        let shard = self.shard_for(shard_hint);
        let new_cached = shard.fetch_add(inflated, Ordering::Relaxed) + inflated;
        if new_cached > 2 * SECTORS_CACHE {
            let excess = new_cached - SECTORS_CACHE;
            shard.fetch_sub(excess, Ordering::Relaxed);
            self.global.fetch_add(excess, Ordering::Relaxed);
        }
    }

    /// Credit `sectors` worth of admissible capacity straight back to the
    /// global pool, bypassing any shard. Used to repay an over-charge
    /// discovered at commit time (`should_not_have_added` in
    /// [`crate::fs::Filesystem::apply_reservation`]) — a bug, not a
    /// normal release, so it never touches a shard cache.
    pub fn credit_global(&self, sectors: u64) {
        self.global.fetch_add(reserve_factor(sectors), Ordering::Relaxed);
    }

    /// Rebuild the global pool's count from scratch given the current
    /// live usage snapshot, discarding all shard caches. Called after a
    /// gc sweep recomputes fs usage so accumulated rounding in the caches
    /// doesn't drift the pool away from reality forever.
    pub fn recalculate(&self, capacity_sectors: u64, used_sectors: u64) {
        for shard in &self.shards {
            shard.store(0, Ordering::Relaxed);
        }
        let free = capacity_sectors.saturating_sub(used_sectors);
        self.global.store(avail_factor(free), Ordering::Relaxed);
    }

    pub fn global_available(&self) -> u64 {
        self.global.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_roundtrip() {
        let pool = ReservationPool::new(4, 10_000);
        let before = pool.global_available();
        let r = pool.acquire(0, 100, 0).unwrap();
        assert_eq!(r.sectors(), 100);
        pool.release(0, r);
        // shard cache now holds the charge; global is untouched until it overflows
        assert!(pool.global_available() <= before);
    }

    #[test]
    fn acquire_fails_without_nofail_when_pool_exhausted() {
        let pool = ReservationPool::new(1, 10);
        let err = pool.acquire(0, 1_000_000, 0).unwrap_err();
        assert!(matches!(err, crate::error::AccountingError::NoSpace { .. }));
    }

    #[test]
    fn acquire_with_nofail_drains_remaining_pool() {
        let pool = ReservationPool::new(1, 10);
        let r = pool.acquire(0, 1_000_000, flags::NOFAIL).unwrap();
        assert!(r.sectors() > 0);
    }

    #[test]
    fn recalculate_resets_shard_caches() {
        let pool = ReservationPool::new(2, 10_000);
        let _r = pool.acquire(0, 500, 0).unwrap();
        pool.recalculate(10_000, 200);
        assert_eq!(pool.global_available(), avail_factor(10_000 - 200));
    }
}
