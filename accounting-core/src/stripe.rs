//! Erasure-coded stripes. A stripe groups `nr_blocks` data/parity blocks
//! written across distinct buckets; `StripeMap` is the sparse, by-index
//! table the marking engine consults when a pointer references a stripe
//! rather than a plain replica.

use parking_lot::RwLock;
use std::collections::HashMap;

/// One erasure-coded stripe's live accounting state.
#[derive(Debug, Clone)]
pub struct Stripe {
    pub sectors: i64,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
    pub alive: bool,
    pub block_sectors: Vec<u32>,
}

impl Stripe {
    pub fn new(algorithm: u8, nr_blocks: u8, nr_redundant: u8) -> Self {
        Stripe {
            sectors: 0,
            algorithm,
            nr_blocks,
            nr_redundant,
            alive: true,
            block_sectors: vec![0; nr_blocks as usize],
        }
    }

    /// Number of data blocks that currently hold at least one live sector.
    pub fn nr_nonempty_blocks(&self) -> usize {
        self.block_sectors.iter().filter(|&&s| s != 0).count()
    }

    /// `ceil(|sectors| * nr_redundant / (nr_blocks - nr_redundant))`,
    /// signed to track the sign of `sectors` — a stripe that has been
    /// entirely deleted charges back the parity it had reserved.
    pub fn parity_sectors(&self) -> i64 {
        let data_blocks = (self.nr_blocks - self.nr_redundant) as i64;
        if data_blocks == 0 {
            return 0;
        }
        let redundant = self.nr_redundant as i64;
        let magnitude = self.sectors.unsigned_abs() as i64;
        let parity_magnitude = (magnitude * redundant + data_blocks - 1) / data_blocks;
        if self.sectors < 0 {
            -parity_magnitude
        } else {
            parity_magnitude
        }
    }
}

/// Hooks the marking engine calls out to when a stripe transitions in a
/// way that concerns an external collaborator (copygc's heap, the
/// allocator). Kept as a trait so `accounting-core` stays free of any
/// direct dependency on a garbage-collection or allocation crate.
pub trait StripeHooks: Send + Sync {
    /// A stripe's live-sector count changed; the copygc fragmentation
    /// heap should re-key its entry.
    fn update_copygc_heap(&self, _idx: u64, _stripe: &Stripe) {}

    /// A stripe died (its last live sector was freed).
    fn stripe_died(&self, _idx: u64) {}
}

/// A hooks implementation that does nothing, for callers (tests, simple
/// single-device setups) with no copygc/allocator integration.
pub struct NullStripeHooks;

impl StripeHooks for NullStripeHooks {}

/// Sparse table of stripes by index. Stripes are created on first write
/// and removed once dead, rather than living in a dense array like
/// buckets do — stripe indices are comparatively rare and unbounded.
#[derive(Default)]
pub struct StripeMap {
    inner: RwLock<HashMap<u64, Stripe>>,
}

impl StripeMap {
    pub fn new() -> Self {
        StripeMap { inner: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, idx: u64) -> Option<Stripe> {
        self.inner.read().get(&idx).cloned()
    }

    pub fn insert(&self, idx: u64, stripe: Stripe) {
        self.inner.write().insert(idx, stripe);
    }

    pub fn remove(&self, idx: u64) -> Option<Stripe> {
        self.inner.write().remove(&idx)
    }

    pub fn contains(&self, idx: u64) -> bool {
        self.inner.read().contains_key(&idx)
    }

    /// Apply `f` to the stripe at `idx`, inserting a fresh one built from
    /// `default_new` if absent. Returns whatever `f` returns alongside
    /// whether the stripe is now dead (all non-parity blocks empty and
    /// no sectors left), so the caller can fire [`StripeHooks::stripe_died`]
    /// outside the lock.
    pub fn update<F, R>(&self, idx: u64, default_new: impl FnOnce() -> Stripe, f: F) -> (R, bool)
    where
        F: FnOnce(&mut Stripe) -> R,
    {
        let mut guard = self.inner.write();
        let entry = guard.entry(idx).or_insert_with(default_new);
        let r = f(entry);
        let dead = entry.sectors == 0 && entry.nr_nonempty_blocks() == 0;
        if dead {
            entry.alive = false;
        }
        (r, dead)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
