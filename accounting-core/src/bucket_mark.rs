//! The per-bucket mark: a 64-bit packed state word updated lock-free via
//! compare-and-swap. The teacher accesses its C-side packed bitfields
//! through bindgen-generated accessors (`bch_bindgen/src/opts.rs`'s
//! `opt_set!`/`opt_defined!` macros, e.g. `.set_foo_defined(1)`); with no
//! C struct to bind against here, the same offset/width packing is
//! expressed directly as plain shift-and-mask accessors over a bare
//! `AtomicU64`. The CAS-retry-loop shape itself follows the lock-free
//! state-word pattern in the sibling `sparking-lot-core` example's
//! parking-state hashtable.

use crate::loom_compat::AtomicU64;
use std::sync::atomic::Ordering;

mod bits {
    pub const GEN_OFFSET: u32 = 0;
    pub const GEN_BITS: u32 = 8;
    pub const DATA_TYPE_OFFSET: u32 = GEN_OFFSET + GEN_BITS;
    pub const DATA_TYPE_BITS: u32 = 4;
    pub const OWNED_OFFSET: u32 = DATA_TYPE_OFFSET + DATA_TYPE_BITS;
    pub const OWNED_BITS: u32 = 1;
    pub const DIRTY_OFFSET: u32 = OWNED_OFFSET + OWNED_BITS;
    pub const DIRTY_BITS: u32 = 15;
    pub const CACHED_OFFSET: u32 = DIRTY_OFFSET + DIRTY_BITS;
    pub const CACHED_BITS: u32 = 15;
    pub const STRIPE_OFFSET: u32 = CACHED_OFFSET + CACHED_BITS;
    pub const STRIPE_BITS: u32 = 1;
    pub const SEQ_VALID_OFFSET: u32 = STRIPE_OFFSET + STRIPE_BITS;
    pub const SEQ_VALID_BITS: u32 = 1;
    pub const SEQ_OFFSET: u32 = SEQ_VALID_OFFSET + SEQ_VALID_BITS;
    pub const SEQ_BITS: u32 = 64 - SEQ_OFFSET;
}

pub const MAX_DIRTY_SECTORS: u32 = (1 << bits::DIRTY_BITS) - 1;
pub const MAX_CACHED_SECTORS: u32 = (1 << bits::CACHED_BITS) - 1;
pub const JOURNAL_SEQ_BITS: u32 = bits::SEQ_BITS;

#[inline]
fn bitmask_get(word: u64, offset: u32, width: u32) -> u64 {
    (word >> offset) & !(!0u64 << width)
}

#[inline]
fn bitmask_set(word: u64, offset: u32, width: u32, v: u64) -> u64 {
    let mask = !(!0u64 << width);
    (word & !(mask << offset)) | ((v & mask) << offset)
}

/// Wraparound-aware "is `a` after `b`" comparison over a `bits`-wide
/// circular counter (used for both the 8-bit bucket generation and the
/// `journal_seq` field). `a == b` is not "after".
pub fn wrapping_after(a: u64, b: u64, bits: u32) -> bool {
    let width_mask = (1u64 << bits) - 1;
    let half = 1u64 << (bits - 1);
    let diff = a.wrapping_sub(b) & width_mask;
    diff != 0 && diff < half
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    None = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
}

impl DataType {
    pub const COUNT: usize = 6;

    fn from_bits(v: u64) -> Self {
        match v {
            0 => DataType::None,
            1 => DataType::Sb,
            2 => DataType::Journal,
            3 => DataType::Btree,
            4 => DataType::User,
            5 => DataType::Cached,
            _ => DataType::None,
        }
    }
}

/// A decoded snapshot of a [`BucketMark`]. Cheap to copy; all mutation
/// goes through the builder-style `with_*` methods and is published via
/// [`BucketMark::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mark {
    raw: u64,
}

impl Mark {
    pub fn from_raw(raw: u64) -> Self {
        Mark { raw }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn gen(&self) -> u8 {
        bitmask_get(self.raw, bits::GEN_OFFSET, bits::GEN_BITS) as u8
    }

    pub fn data_type(&self) -> DataType {
        DataType::from_bits(bitmask_get(self.raw, bits::DATA_TYPE_OFFSET, bits::DATA_TYPE_BITS))
    }

    pub fn owned_by_allocator(&self) -> bool {
        bitmask_get(self.raw, bits::OWNED_OFFSET, bits::OWNED_BITS) != 0
    }

    pub fn dirty_sectors(&self) -> u32 {
        bitmask_get(self.raw, bits::DIRTY_OFFSET, bits::DIRTY_BITS) as u32
    }

    pub fn cached_sectors(&self) -> u32 {
        bitmask_get(self.raw, bits::CACHED_OFFSET, bits::CACHED_BITS) as u32
    }

    pub fn stripe(&self) -> bool {
        bitmask_get(self.raw, bits::STRIPE_OFFSET, bits::STRIPE_BITS) != 0
    }

    pub fn journal_seq_valid(&self) -> bool {
        bitmask_get(self.raw, bits::SEQ_VALID_OFFSET, bits::SEQ_VALID_BITS) != 0
    }

    pub fn journal_seq(&self) -> u32 {
        bitmask_get(self.raw, bits::SEQ_OFFSET, bits::SEQ_BITS) as u32
    }

    fn with_field(self, offset: u32, width: u32, v: u64) -> Self {
        Mark { raw: bitmask_set(self.raw, offset, width, v) }
    }

    pub fn with_gen(self, v: u8) -> Self {
        self.with_field(bits::GEN_OFFSET, bits::GEN_BITS, v as u64)
    }

    pub fn with_data_type(self, t: DataType) -> Self {
        self.with_field(bits::DATA_TYPE_OFFSET, bits::DATA_TYPE_BITS, t as u64)
    }

    pub fn with_owned_by_allocator(self, v: bool) -> Self {
        self.with_field(bits::OWNED_OFFSET, bits::OWNED_BITS, v as u64)
    }

    /// Panics (overflow trap) if `v` doesn't fit the packed width.
    pub fn with_dirty_sectors(self, v: u32) -> Self {
        assert!(v <= MAX_DIRTY_SECTORS, "dirty_sectors overflow: {v} > {MAX_DIRTY_SECTORS}");
        self.with_field(bits::DIRTY_OFFSET, bits::DIRTY_BITS, v as u64)
    }

    pub fn with_cached_sectors(self, v: u32) -> Self {
        assert!(v <= MAX_CACHED_SECTORS, "cached_sectors overflow: {v} > {MAX_CACHED_SECTORS}");
        self.with_field(bits::CACHED_OFFSET, bits::CACHED_BITS, v as u64)
    }

    pub fn with_stripe(self, v: bool) -> Self {
        self.with_field(bits::STRIPE_OFFSET, bits::STRIPE_BITS, v as u64)
    }

    pub fn with_journal_seq_valid(self, v: bool) -> Self {
        self.with_field(bits::SEQ_VALID_OFFSET, bits::SEQ_VALID_BITS, v as u64)
    }

    pub fn with_journal_seq(self, v: u32) -> Self {
        self.with_field(bits::SEQ_OFFSET, bits::SEQ_BITS, v as u64)
    }

    /// Checked-add a pointer's sectors into `dirty_sectors`, trapping on
    /// overflow of the packed field (never saturates or wraps silently).
    pub fn add_dirty_sectors(self, delta: i64) -> Self {
        let next = apply_signed(self.dirty_sectors(), delta, "dirty_sectors");
        self.with_dirty_sectors(next)
    }

    pub fn add_cached_sectors(self, delta: i64) -> Self {
        let next = apply_signed(self.cached_sectors(), delta, "cached_sectors");
        self.with_cached_sectors(next)
    }

    pub fn is_free(&self) -> bool {
        self.raw == 0
    }

    pub fn is_allocator_owned(&self) -> bool {
        self.owned_by_allocator()
    }

    pub fn is_cached(&self) -> bool {
        !self.owned_by_allocator() && self.dirty_sectors() == 0 && self.cached_sectors() > 0
    }

    pub fn is_dirty(&self) -> bool {
        !self.owned_by_allocator() && self.dirty_sectors() > 0
    }

    pub fn is_metadata(&self) -> bool {
        !self.owned_by_allocator()
            && matches!(self.data_type(), DataType::Sb | DataType::Journal | DataType::Btree)
    }

    pub fn is_available(&self) -> bool {
        self.is_free() || self.is_cached()
    }

    pub fn is_unavailable(&self) -> bool {
        !self.is_available()
    }
}

fn apply_signed(current: u32, delta: i64, field: &str) -> u32 {
    let next = current as i64 + delta;
    assert!(next >= 0, "{field} underflow: {current} + {delta} < 0");
    let next = next as u64;
    assert!(next <= u32::MAX as u64, "{field} overflow: {current} + {delta}");
    next as u32
}

/// Lock-free 64-bit per-bucket state word.
pub struct BucketMark(AtomicU64);

impl BucketMark {
    pub fn new() -> Self {
        BucketMark(AtomicU64::new(0))
    }

    pub fn from_mark(m: Mark) -> Self {
        BucketMark(AtomicU64::new(m.raw))
    }

    pub fn read(&self) -> Mark {
        Mark::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Non-atomic fast path, valid only during single-threaded bring-up
    /// before any concurrent access is possible.
    ///
    /// # Safety
    /// The caller must guarantee no other thread can observe or mutate
    /// this bucket concurrently.
    #[cfg(not(loom))]
    pub unsafe fn write_non_atomic(&self, m: Mark) {
        let ptr = self.0.as_ptr();
        *ptr = m.raw;
    }

    #[cfg(loom)]
    pub unsafe fn write_non_atomic(&self, m: Mark) {
        self.0.store(m.raw, Ordering::Relaxed);
    }

    /// CAS-loop a mark transformation: repeatedly load, transform, and
    /// compare-and-swap until it sticks. Returns `(old, new)`.
    pub fn update<F>(&self, mut f: F) -> (Mark, Mark)
    where
        F: FnMut(Mark) -> Mark,
    {
        let mut old_raw = self.0.load(Ordering::Acquire);
        loop {
            let old = Mark::from_raw(old_raw);
            let new = f(old);
            match self.0.compare_exchange_weak(
                old_raw,
                new.raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (old, new),
                Err(actual) => old_raw = actual,
            }
        }
    }
}

impl Default for BucketMark {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::thread;

    #[test]
    fn loom_concurrent_cas() {
        loom::model(|| {
            let bm = loom::sync::Arc::new(BucketMark::new());
            let bm2 = bm.clone();
            let t1 = thread::spawn(move || {
                bm.update(|m| m.add_dirty_sectors(1));
            });
            bm2.update(|m| m.add_dirty_sectors(1));
            t1.join().unwrap();
            assert_eq!(bm2.read().dirty_sectors(), 2);
        });
    }
}
