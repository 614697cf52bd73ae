//! The per-device bucket table: a dense array of [`BucketMark`]s plus the
//! auxiliary bitsets, swapped in whole via [`arc_swap::ArcSwap`] on
//! resize so readers never observe a partially-grown table (the
//! user-space stand-in for an RCU-protected pointer swap).

use crate::bucket_mark::BucketMark;
use crate::error::{AccountingError, Result};
use bit_set::BitSet;

/// One device's bucket array and the auxiliary per-bucket flags that
/// don't fit in the packed mark word.
pub struct BucketTable {
    pub first_bucket: u64,
    pub nr_buckets: u64,
    marks: Vec<BucketMark>,
    /// Set while a bucket is held by the allocator's freelist/open buckets.
    in_use: BitSet,
    /// Set once a bucket has taken its first write since being handed to
    /// the allocator, used to decide whether a subsequent free needs its
    /// generation bumped.
    has_been_written: BitSet,
    oldest_gen: Vec<u8>,
}

impl BucketTable {
    pub fn new(first_bucket: u64, nr_buckets: u64) -> Self {
        let n = nr_buckets as usize;
        BucketTable {
            first_bucket,
            nr_buckets,
            marks: (0..n).map(|_| BucketMark::new()).collect(),
            in_use: BitSet::with_capacity(n),
            has_been_written: BitSet::with_capacity(n),
            oldest_gen: vec![0; n],
        }
    }

    fn index_of(&self, bucket: u64) -> Option<usize> {
        if bucket < self.first_bucket {
            return None;
        }
        let idx = bucket - self.first_bucket;
        if idx >= self.nr_buckets {
            return None;
        }
        Some(idx as usize)
    }

    pub fn mark(&self, bucket: u64) -> Option<&BucketMark> {
        self.index_of(bucket).map(|i| &self.marks[i])
    }

    pub fn is_in_use(&self, bucket: u64) -> bool {
        self.index_of(bucket).is_some_and(|i| self.in_use.contains(i))
    }

    pub fn set_in_use(&mut self, bucket: u64, used: bool) {
        if let Some(i) = self.index_of(bucket) {
            if used {
                self.in_use.insert(i);
            } else {
                self.in_use.remove(i);
            }
        }
    }

    pub fn has_been_written(&self, bucket: u64) -> bool {
        self.index_of(bucket).is_some_and(|i| self.has_been_written.contains(i))
    }

    pub fn set_has_been_written(&mut self, bucket: u64, written: bool) {
        if let Some(i) = self.index_of(bucket) {
            if written {
                self.has_been_written.insert(i);
            } else {
                self.has_been_written.remove(i);
            }
        }
    }

    pub fn oldest_gen(&self, bucket: u64) -> Option<u8> {
        self.index_of(bucket).map(|i| self.oldest_gen[i])
    }

    pub fn set_oldest_gen(&mut self, bucket: u64, gen: u8) {
        if let Some(i) = self.index_of(bucket) {
            self.oldest_gen[i] = gen;
        }
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (u64, crate::bucket_mark::Mark)> + '_ {
        self.marks.iter().enumerate().filter_map(|(i, m)| {
            let mark = m.read();
            if mark.is_free() { None } else { Some((self.first_bucket + i as u64, mark)) }
        })
    }

    /// Build a table covering `[0, nr_buckets)`, copying forward every
    /// mark from `self` that still falls in range. Used by
    /// [`Device::resize`] to grow in place without holding readers up:
    /// the new table is built off to the side and only then published.
    pub fn resized(&self, nr_buckets: u64) -> Result<BucketTable> {
        if nr_buckets == 0 {
            return Err(AccountingError::NoMemory);
        }
        let mut next = BucketTable::new(self.first_bucket, nr_buckets);
        let copy_n = self.nr_buckets.min(nr_buckets) as usize;
        for i in 0..copy_n {
            let mark = self.marks[i].read();
            next.marks[i] = BucketMark::from_mark(mark);
            if self.in_use.contains(i) {
                next.in_use.insert(i);
            }
            if self.has_been_written.contains(i) {
                next.has_been_written.insert(i);
            }
            next.oldest_gen[i] = self.oldest_gen[i];
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_mark::Mark;

    #[test]
    fn index_of_respects_first_bucket_offset() {
        let t = BucketTable::new(100, 10);
        assert!(t.mark(99).is_none());
        assert!(t.mark(100).is_some());
        assert!(t.mark(109).is_some());
        assert!(t.mark(110).is_none());
    }

    #[test]
    fn resize_preserves_existing_marks() {
        let mut t = BucketTable::new(0, 4);
        t.mark(2).unwrap().update(|m| m.with_dirty_sectors(500));
        t.set_in_use(2, true);

        let grown = t.resized(8).unwrap();
        assert_eq!(grown.mark(2).unwrap().read().dirty_sectors(), 500);
        assert!(grown.is_in_use(2));
        assert!(grown.mark(6).unwrap().read().is_free());
    }

    #[test]
    fn resize_to_zero_fails_without_mutating_caller() {
        let t = BucketTable::new(0, 4);
        assert!(t.resized(0).is_err());
        assert_eq!(t.nr_buckets, 4);
    }

    #[test]
    fn iter_live_skips_free_buckets() {
        let mut t = BucketTable::new(0, 3);
        t.mark(1).unwrap().update(|m: Mark| m.with_dirty_sectors(10));
        let live: Vec<_> = t.iter_live().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, 1);
    }
}
