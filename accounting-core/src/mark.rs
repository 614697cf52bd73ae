//! The key marking engine: translates a btree key's pointers into
//! per-bucket mark updates, folding each pointer's effect into its own
//! device's usage shard immediately and aggregating an fs-wide
//! [`UsageDelta`] the caller commits via [`Filesystem::apply`]. Btree
//! walking itself is out of scope here — callers hand in the key's
//! decoded pointers directly.

use crate::bucket_mark::{DataType, Mark};
use crate::fs::Filesystem;
use crate::gc::Pos;
use crate::usage::UsageDelta;
use log::{trace, warn};

/// One replica pointer as decoded from a key: which device and bucket it
/// targets, the generation it was written against, and whether it's a
/// cached (vs. dirty) copy. `stripe` names the stripe (and block within
/// it) this pointer participates in, if any.
#[derive(Debug, Clone, Copy)]
pub struct PointerRef {
    pub dev: u8,
    pub bucket: u64,
    pub gen: u8,
    pub cached: bool,
    pub stripe: Option<(u64, u8)>,
}

impl PointerRef {
    pub fn new(dev: u8, bucket: u64, gen: u8, cached: bool) -> Self {
        PointerRef { dev, bucket, gen, cached, stripe: None }
    }
}

/// What kind of key is being marked, which decides which counters move
/// besides the per-bucket dirty/cached sector fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Extent,
    BtreeNode,
    InodeAlloc,
    Reservation,
}

/// Extra per-call context influencing staleness handling: `alloc_read_done`
/// is set once the allocator has finished its startup scan of every
/// bucket's real generation. Before that point a generation mismatch is
/// expected and silently ignored; after it, a mismatch means the
/// accounting itself is wrong. `journal_seq`, if supplied, is stamped
/// onto every bucket a pointer still leaves with live sectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkContext {
    pub alloc_read_done: bool,
    pub journal_seq: Option<u32>,
    /// The caller is gc itself (a sweep recomputing accounting for a key
    /// it's walking), rather than an ordinary writer. This alone is enough
    /// to route the resulting delta into the gc shadow world too,
    /// independent of whether `gc_visited(pos)` would also say so — the
    /// caller doesn't need the cursor's permission to account for a key
    /// it is, itself, the one sweeping.
    pub gc: bool,
}

fn data_type_for(kind: KeyKind, cached: bool) -> DataType {
    match kind {
        KeyKind::Extent => {
            if cached {
                DataType::Cached
            } else {
                DataType::User
            }
        }
        KeyKind::BtreeNode => DataType::Btree,
        KeyKind::InodeAlloc => DataType::User,
        KeyKind::Reservation => DataType::User,
    }
}

/// Extent-level description used by the overlap-aware [`mark_extent_update`]:
/// the key's logical `[start, end)` range (in sectors, inode-relative) and
/// its total attributed on-disk `sectors`, spread uniformly across that
/// range for the purpose of computing partial-overlap unmark amounts.
#[derive(Debug, Clone)]
pub struct ExtentKey {
    pub start: u64,
    pub end: u64,
    pub sectors: i64,
    pub ptrs: Vec<PointerRef>,
}

impl ExtentKey {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// The portion of `self.sectors` attributed to a `range_len`-sector
    /// slice of this key's full range, truncating the same way the
    /// source's compression/crc-scaled sector math does.
    fn sectors_for_range(&self, range_len: u64) -> i64 {
        let full = self.len();
        if full == 0 {
            return 0;
        }
        (self.sectors * range_len as i64) / full as i64
    }
}

/// Which portion of an existing key an inserted extent overlaps, decided
/// from the two ranges' endpoints alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapKind {
    /// The old key lies entirely inside the new key's range.
    All,
    /// The new key overwrites the old key's trailing (high-offset) end.
    Back,
    /// The new key overwrites the old key's leading (low-offset) end.
    Front,
    /// The new key's range sits strictly inside the old key's range,
    /// splitting it into an untouched left remainder and a right
    /// remainder that survives as a fresh key.
    Middle,
}

pub fn classify_overlap(old_start: u64, old_end: u64, new_start: u64, new_end: u64) -> OverlapKind {
    if new_start <= old_start && new_end >= old_end {
        OverlapKind::All
    } else if old_start < new_start && new_end < old_end {
        OverlapKind::Middle
    } else if new_start <= old_start {
        OverlapKind::Front
    } else {
        OverlapKind::Back
    }
}

/// Resolve one overlapping old key's unmark (and, for `Middle`, re-mark)
/// against an about-to-be-inserted extent's `[new_start, new_end)` range,
/// folding the effect into `delta`.
fn mark_overlap(
    fs: &Filesystem,
    old: &ExtentKey,
    new_start: u64,
    new_end: u64,
    ctx: MarkContext,
    pos: Pos,
    delta: &mut UsageDelta,
) -> crate::error::Result<()> {
    match classify_overlap(old.start, old.end, new_start, new_end) {
        OverlapKind::All => {
            let unmarked = mark_key(fs, KeyKind::Extent, -old.sectors, &old.ptrs, ctx, pos)?;
            merge_delta(delta, &unmarked);
        }
        OverlapKind::Front => {
            // new_start <= old.start < new_end < old.end: the new key
            // covers old's leading edge; unmark [old.start, new_end).
            let unmark_len = new_end.saturating_sub(old.start);
            let s = old.sectors_for_range(unmark_len);
            let unmarked = mark_key(fs, KeyKind::Extent, -s, &old.ptrs, ctx, pos)?;
            merge_delta(delta, &unmarked);
        }
        OverlapKind::Back => {
            // old.start < new_start < old.end <= new_end: the new key
            // covers old's trailing edge; unmark [new_start, old.end).
            let unmark_len = old.end.saturating_sub(new_start);
            let s = old.sectors_for_range(unmark_len);
            let unmarked = mark_key(fs, KeyKind::Extent, -s, &old.ptrs, ctx, pos)?;
            merge_delta(delta, &unmarked);
        }
        OverlapKind::Middle => {
            // The insert splits old in two. The right-hand remainder
            // survives as a freshly-written key, so it's re-marked as an
            // insertion before the left-hand remainder (and the gap the
            // new key occupies) is unmarked from the original.
            let right_len = old.end.saturating_sub(new_end);
            let right_sectors = old.sectors_for_range(right_len);
            let remarked = mark_key(fs, KeyKind::Extent, right_sectors, &old.ptrs, ctx, pos)?;
            merge_delta(delta, &remarked);

            let left_and_middle_len = new_end.saturating_sub(old.start);
            let unmark_sectors = old.sectors_for_range(left_and_middle_len);
            let unmarked = mark_key(fs, KeyKind::Extent, -unmark_sectors, &old.ptrs, ctx, pos)?;
            merge_delta(delta, &unmarked);
        }
    }
    Ok(())
}

/// Overlap-aware btree update for extent keys: walks the caller-supplied
/// list of existing keys the new key's range overlaps (btree traversal
/// itself is out of scope — the caller has already found them), unmarks
/// or splits each per [`OverlapKind`], then marks the new key in full.
pub fn mark_extent_update(
    fs: &Filesystem,
    new: &ExtentKey,
    overlaps: &[ExtentKey],
    ctx: MarkContext,
    pos: Pos,
) -> crate::error::Result<UsageDelta> {
    let mut delta = UsageDelta::default();
    for old in overlaps {
        mark_overlap(fs, old, new.start, new.end, ctx, pos, &mut delta)?;
    }
    let inserted = mark_key(fs, KeyKind::Extent, new.sectors, &new.ptrs, ctx, pos)?;
    merge_delta(&mut delta, &inserted);
    Ok(delta)
}

/// Mark (or unmark, for `sectors < 0`) a single pointer's effect on its
/// target bucket, folding the net effect into `delta`. Returns `Ok(())`
/// even when the pointer was silently skipped for being stale.
pub fn mark_pointer(
    fs: &Filesystem,
    ptr: &PointerRef,
    kind: KeyKind,
    sectors: i64,
    ctx: MarkContext,
    pos: Pos,
    delta: &mut UsageDelta,
) -> crate::error::Result<()> {
    let Some(dev) = fs.device(ptr.dev) else {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "pointer references unknown device {}",
            ptr.dev
        )));
    };

    let wanted_type = data_type_for(kind, ptr.cached);
    let mut was_stale = false;

    let Some((old, new)) = dev.update_mark(ptr.bucket, |m: Mark| {
        if crate::bucket_mark::wrapping_after(m.gen() as u64, ptr.gen as u64, 8) {
            was_stale = true;
            return m;
        }
        was_stale = false;
        let mut next = if ptr.cached {
            m.add_cached_sectors(sectors)
        } else {
            m.add_dirty_sectors(sectors)
        };
        next = if next.dirty_sectors() == 0 && next.cached_sectors() == 0 {
            next.with_data_type(DataType::None)
        } else {
            next.with_data_type(wanted_type)
        };
        if let Some(seq) = ctx.journal_seq {
            if next.dirty_sectors() > 0 || next.cached_sectors() > 0 {
                next = next.with_journal_seq(seq).with_journal_seq_valid(true);
            }
        }
        if let Some((_, _)) = ptr.stripe {
            next = next.with_stripe(sectors > 0 || m.stripe());
        }
        next
    }) else {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "bucket {} out of range on device {}",
            ptr.bucket, ptr.dev
        )));
    };

    if was_stale {
        if ctx.alloc_read_done {
            return Err(crate::error::AccountingError::Inconsistency(format!(
                "stale pointer: key gen {} != bucket gen {} on dev {} bucket {}",
                ptr.gen,
                old.gen(),
                ptr.dev,
                ptr.bucket
            )));
        }
        trace!("skipping stale pointer dev={} bucket={} gen={}", ptr.dev, ptr.bucket, ptr.gen);
        return Ok(());
    }

    trace!("marked dev={} bucket={} sectors={sectors:+}", ptr.dev, ptr.bucket);

    let was_available = old.is_available();
    let is_available = new.is_available();
    if !was_available && is_available {
        fs.hooks.wake_allocator(ptr.dev);
    }

    // Per-bucket delta, keyed by each mark's *own* data_type rather than
    // the incremental `sectors` this one call contributed — on a type
    // transition (e.g. a full unmark back to `None`) the old type's
    // contribution must come out of `sectors[old_dt]`, not be folded into
    // `sectors[new_dt]`, or the old type's total is left stranded while
    // the new type wraps on a negative delta (bch2_dev_usage_update).
    let mut dev_delta = UsageDelta::default();
    if was_available && !is_available {
        dev_delta.buckets_unavailable = 1;
    } else if !was_available && is_available {
        dev_delta.buckets_unavailable = -1;
    }

    let old_dt = old.data_type() as usize;
    let new_dt = new.data_type() as usize;
    if old_dt != new_dt {
        if !old.is_free() {
            dev_delta.buckets[old_dt] = dev_delta.buckets[old_dt].wrapping_sub(1);
        }
        if !new.is_free() {
            dev_delta.buckets[new_dt] = dev_delta.buckets[new_dt].wrapping_add(1);
        }
    }
    if !old.is_free() {
        dev_delta.sectors[old_dt] =
            dev_delta.sectors[old_dt].wrapping_sub(sectors_for_data_type(&old, old.data_type()));
    }
    if !new.is_free() {
        dev_delta.sectors[new_dt] =
            dev_delta.sectors[new_dt].wrapping_add(sectors_for_data_type(&new, new.data_type()));
    }

    // Fold straight into the resolved device's own usage shard — a key's
    // pointers can span several devices, so the fs-level `delta` returned
    // to the caller can't be attributed to any single device at apply
    // time. `delta` still gets the same per-bucket numbers, aggregated
    // fs-wide across every pointer.
    merge_delta(delta, &dev_delta);
    dev.usage.live.add(&dev_delta);
    if ctx.gc || fs.gc_cursor.visited(pos) {
        dev.usage.gc.add(&dev_delta);
    }

    if let Some((idx, block)) = ptr.stripe {
        mark_stripe_ptr(fs, idx, block, sectors, delta)?;
    }

    Ok(())
}

/// The portion of a mark's live sector count to attribute to its own
/// `data_type` in a per-type `sectors[]` aggregate: cached sectors for
/// the `Cached` type, dirty sectors for everything else. Never called on
/// a free mark (`data_type() == None`).
fn sectors_for_data_type(m: &Mark, dt: DataType) -> i64 {
    if dt == DataType::Cached {
        m.cached_sectors() as i64
    } else {
        m.dirty_sectors() as i64
    }
}

/// Side-accounting for a stripe-referencing pointer: attributes the
/// parity overhead of `sectors` more (or fewer) live data sectors to the
/// stripe's redundancy, folds that parity overhead into the adjusted
/// disk-sectors total (`delta.data`), and updates the stripe's per-block
/// sector tracking. Fails the whole key mark if the stripe is missing or
/// already dead.
fn mark_stripe_ptr(
    fs: &Filesystem,
    idx: u64,
    block: u8,
    sectors: i64,
    delta: &mut UsageDelta,
) -> crate::error::Result<()> {
    if !fs.stripes.live.contains(idx) {
        warn!("mark_stripe_ptr: stripe {idx} missing");
        return Err(crate::error::AccountingError::MissingStripe { idx });
    }
    let (alive, died) = fs.stripes.live.update(idx, || unreachable!("checked above"), |s| {
        if !s.alive {
            return false;
        }
        if (block as usize) < s.block_sectors.len() {
            s.block_sectors[block as usize] =
                (s.block_sectors[block as usize] as i64 + sectors).max(0) as u32;
        }
        s.sectors += sectors;
        true
    });
    if !alive {
        warn!("mark_stripe_ptr: stripe {idx} dead");
        return Err(crate::error::AccountingError::MissingStripe { idx });
    }
    let stripe = fs.stripes.live.get(idx).expect("just updated");
    let data_blocks = stripe.nr_blocks.saturating_sub(stripe.nr_redundant) as i64;
    if data_blocks > 0 {
        let redundant = stripe.nr_redundant as i64;
        let magnitude = sectors.unsigned_abs() as i64;
        let parity_magnitude = (magnitude * redundant + data_blocks - 1) / data_blocks;
        let parity_sectors = if sectors < 0 { -parity_magnitude } else { parity_magnitude };
        delta.data = delta.data.wrapping_add(parity_sectors);
    }
    fs.stripe_hooks.update_copygc_heap(idx, &stripe);
    if died {
        fs.stripe_hooks.stripe_died(idx);
    }
    Ok(())
}

/// Description of a stripe key being created or retired: the stripe's
/// own erasure-coding shape plus the bucket backing each of its blocks.
/// Kept separate from the [`PointerRef`] + signed-`sectors` shape the
/// rest of this module's keys share — a stripe key's `algorithm` and
/// `nr_redundant` don't fit that shape, and creating/retiring a stripe
/// doesn't mark any dirty/cached sectors itself (an extent pointing into
/// the stripe does that, via [`mark_stripe_ptr`]).
#[derive(Debug, Clone)]
pub struct StripeKey {
    pub idx: u64,
    pub algorithm: u8,
    pub nr_redundant: u8,
    /// One entry per block, in block order; `nr_blocks` is `blocks.len()`.
    pub blocks: Vec<PointerRef>,
}

/// Create (`inserting = true`) or retire (`inserting = false`) a stripe
/// record, and flip the `stripe` bit on every bucket backing one of its
/// blocks. Not reachable through [`mark_key`] — see [`StripeKey`] for why.
pub fn mark_stripe_key(fs: &Filesystem, key: &StripeKey, inserting: bool) -> crate::error::Result<()> {
    if inserting {
        fs.stripes.live.insert(
            key.idx,
            crate::stripe::Stripe::new(key.algorithm, key.blocks.len() as u8, key.nr_redundant),
        );
    } else {
        fs.stripes.live.remove(key.idx);
    }

    for block in &key.blocks {
        let Some(dev) = fs.device(block.dev) else {
            return Err(crate::error::AccountingError::Inconsistency(format!(
                "stripe {} references unknown device {}",
                key.idx, block.dev
            )));
        };
        dev.update_mark(block.bucket, |m| m.with_stripe(inserting)).ok_or_else(|| {
            crate::error::AccountingError::Inconsistency(format!(
                "stripe {} bucket {} out of range on device {}",
                key.idx, block.bucket, block.dev
            ))
        })?;
    }
    Ok(())
}

/// Mark every pointer of a key, aggregating into one [`UsageDelta`].
/// `sectors` is the key's own (signed) sector delta, applied identically
/// to each replica pointer — callers pass a negative value when
/// overwriting/removing a key. Stripe keys don't go through here; see
/// [`mark_stripe_key`].
///
/// For [`KeyKind::BtreeNode`], `sectors` only supplies the sign (insert
/// vs. remove) — btree nodes are fixed-size, so the magnitude actually
/// marked on each pointer is always [`Filesystem::btree_node_size`].
pub fn mark_key(
    fs: &Filesystem,
    kind: KeyKind,
    sectors: i64,
    ptrs: &[PointerRef],
    ctx: MarkContext,
    pos: Pos,
) -> crate::error::Result<UsageDelta> {
    let mut delta = UsageDelta::default();
    let ptr_sectors = match kind {
        KeyKind::BtreeNode => fs.btree_node_size as i64 * if sectors < 0 { -1 } else { 1 },
        _ => sectors,
    };
    for ptr in ptrs {
        mark_pointer(fs, ptr, kind, ptr_sectors, ctx, pos, &mut delta)?;
    }
    match kind {
        KeyKind::Reservation => {
            let nr_replicas = ptrs.len().max(1) as i64;
            delta.reserved = delta.reserved.wrapping_add(sectors * nr_replicas);
            let max_r = fs.max_replicas.clamp(1, crate::usage::MAX_REPLICAS) as i64;
            let r = (nr_replicas.clamp(1, max_r) - 1) as usize;
            delta.replicas[r].persistent_reserved =
                delta.replicas[r].persistent_reserved.wrapping_add(sectors * nr_replicas);
        }
        KeyKind::InodeAlloc => {
            delta.nr_inodes = delta.nr_inodes.wrapping_add(sectors.signum());
        }
        KeyKind::Extent => aggregate_extent(fs, ptrs, ptr_sectors, &mut delta),
        KeyKind::BtreeNode => {}
    }
    Ok(delta)
}

/// Fold an extent's pointers into the fs-wide replication-aware totals,
/// per the accumulation rule: cached pointers contribute to `s.cached`
/// and `replicas[0].data[cached]`; uncached replica pointers contribute
/// to `s.data` and `replicas[replicas-1].data[user]`; uncached
/// erasure-coded pointers contribute to `s.data` and
/// `replicas[ec_redundancy-1].ec_data`. `replicas`/`ec_redundancy` are
/// each clamped to `[1, MAX_REPLICAS]`.
fn aggregate_extent(fs: &Filesystem, ptrs: &[PointerRef], sectors: i64, delta: &mut UsageDelta) {
    let max_r = fs.max_replicas.clamp(1, crate::usage::MAX_REPLICAS) as i64;
    let mut cached_sectors: i64 = 0;
    let mut dirty_sectors: i64 = 0;
    let mut ec_sectors: i64 = 0;
    let mut nr_replicas: i64 = 0;
    let mut ec_redundancy: i64 = 0;

    for ptr in ptrs {
        if ptr.cached {
            cached_sectors = cached_sectors.wrapping_add(sectors);
            continue;
        }
        nr_replicas += 1;
        match ptr.stripe {
            Some((idx, _)) => {
                ec_sectors = ec_sectors.wrapping_add(sectors);
                if let Some(stripe) = fs.stripes.live.get(idx) {
                    ec_redundancy = ec_redundancy.max(stripe.nr_redundant as i64 + 1);
                }
            }
            None => dirty_sectors = dirty_sectors.wrapping_add(sectors),
        }
    }

    if cached_sectors != 0 {
        delta.cached = delta.cached.wrapping_add(cached_sectors);
        delta.replicas[0].data[DataType::Cached as usize] =
            delta.replicas[0].data[DataType::Cached as usize].wrapping_add(cached_sectors);
    }
    if dirty_sectors != 0 {
        let idx = (nr_replicas.clamp(1, max_r) - 1) as usize;
        delta.data = delta.data.wrapping_add(dirty_sectors);
        delta.replicas[idx].data[DataType::User as usize] =
            delta.replicas[idx].data[DataType::User as usize].wrapping_add(dirty_sectors);
    }
    if ec_sectors != 0 {
        let idx = (ec_redundancy.clamp(1, max_r) - 1) as usize;
        delta.data = delta.data.wrapping_add(ec_sectors);
        delta.replicas[idx].ec_data = delta.replicas[idx].ec_data.wrapping_add(ec_sectors);
    }
}

/// Non-extent btrees follow a simpler "same key slot → overwrite" rule:
/// no range splitting, just remove the old key's effect and add the
/// new one's. Used for btree-node, inode-alloc, and reservation updates;
/// extent updates go through [`mark_extent_update`] instead.
pub fn mark_update_overwrite(
    fs: &Filesystem,
    old_kind: KeyKind,
    old_sectors: i64,
    old_ptrs: &[PointerRef],
    new_kind: KeyKind,
    new_sectors: i64,
    new_ptrs: &[PointerRef],
    ctx: MarkContext,
    pos: Pos,
) -> crate::error::Result<UsageDelta> {
    let mut delta = mark_key(fs, old_kind, -old_sectors, old_ptrs, ctx, pos)?;
    let added = mark_key(fs, new_kind, new_sectors, new_ptrs, ctx, pos)?;
    merge_delta(&mut delta, &added);
    Ok(delta)
}

fn merge_delta(into: &mut UsageDelta, other: &UsageDelta) {
    into.hidden += other.hidden;
    into.data += other.data;
    into.cached += other.cached;
    into.reserved += other.reserved;
    into.online_reserved += other.online_reserved;
    into.nr_inodes += other.nr_inodes;
    into.buckets_unavailable += other.buckets_unavailable;
    for i in 0..DataType::COUNT {
        into.buckets[i] += other.buckets[i];
        into.sectors[i] += other.sectors[i];
    }
}

/// Invalidate a bucket: the allocator's reclaim-for-reuse operation.
/// Requires the current mark to be *available* (free or cached); sets
/// `owned_by_allocator`, clears `data_type`, zeroes both sector counts,
/// and bumps `gen`. Returns the pre-invalidation mark so the caller can
/// charge any `cached_sectors` it held back out of cache totals.
pub fn invalidate_bucket(fs: &Filesystem, dev_idx: u8, bucket: u64) -> crate::error::Result<Mark> {
    let Some(dev) = fs.device(dev_idx) else {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "invalidate on unknown device {dev_idx}"
        )));
    };
    let mut was_available = true;
    let Some((old, _new)) = dev.update_mark(bucket, |m: Mark| {
        was_available = m.is_available();
        if !was_available {
            return m;
        }
        Mark::default().with_gen(m.gen().wrapping_add(1)).with_owned_by_allocator(true)
    }) else {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "bucket {bucket} out of range on device {dev_idx}"
        )));
    };
    if !was_available {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "invalidate_bucket on unavailable bucket {dev_idx}/{bucket}"
        )));
    }
    Ok(old)
}

/// Flip `owned_by_allocator` on a bucket.
///
/// `owned = true` is the allocator handing a previously-invalidated
/// bucket out (no data yet, mark reset to just `gen` + the ownership
/// bit); `gen` is the generation to stamp, normally the one
/// `invalidate_bucket` just returned. `owned = false` is the allocator
/// giving ownership back (the bucket either returns to free or is about
/// to start holding data written through [`mark_pointer`], which itself
/// clears the bit once sectors are attributed) and otherwise leaves the
/// mark untouched.
///
/// Setting `owned = true` on a bucket that isn't already unavailable
/// (i.e. wasn't already owned by a previous allocation or mid
/// invalidation) outside of a gc sweep reconciling stale allocator state
/// is a double-allocation bug, not a recoverable condition.
pub fn mark_alloc_bucket(
    fs: &Filesystem,
    dev_idx: u8,
    bucket: u64,
    owned: bool,
    gen: u8,
) -> crate::error::Result<()> {
    let Some(dev) = fs.device(dev_idx) else {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "alloc-mark on unknown device {dev_idx}"
        )));
    };
    let Some((old, _new)) = dev.update_mark(bucket, |m: Mark| {
        if owned {
            Mark::default().with_gen(gen).with_owned_by_allocator(true)
        } else {
            m.with_owned_by_allocator(false)
        }
    }) else {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "bucket {bucket} out of range on device {dev_idx}"
        )));
    };
    if owned && old.is_unavailable() && !fs.gc_cursor.is_running() {
        panic!("bucket {dev_idx}/{bucket} double-allocated: was already unavailable");
    }
    Ok(())
}

/// Mark a bucket as holding superblock/journal/btree metadata, which the
/// allocator must never hand out.
pub fn mark_metadata_bucket(
    fs: &Filesystem,
    dev_idx: u8,
    bucket: u64,
    data_type: DataType,
    sectors: u32,
) -> crate::error::Result<()> {
    debug_assert!(matches!(data_type, DataType::Sb | DataType::Journal | DataType::Btree));
    let Some(dev) = fs.device(dev_idx) else {
        return Err(crate::error::AccountingError::Inconsistency(format!(
            "metadata-mark on unknown device {dev_idx}"
        )));
    };
    dev.update_mark(bucket, |m: Mark| {
        m.with_data_type(data_type).with_dirty_sectors(sectors)
    })
    .ok_or_else(|| {
        crate::error::AccountingError::Inconsistency(format!(
            "bucket {bucket} out of range on device {dev_idx}"
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use std::sync::Arc;

    fn one_device_fs() -> Filesystem {
        let dev = Arc::new(Device::new(0, 0, 16, 2));
        Filesystem::new(vec![dev], 16 * 1024, 2)
    }

    #[test]
    fn mark_key_updates_bucket_and_delta() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 3, 0, false)];
        let delta = mark_key(&fs, KeyKind::Extent, 100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert_eq!(delta.sectors[DataType::User as usize], 100);
        assert_eq!(delta.buckets[DataType::User as usize], 1);
        assert_eq!(fs.device(0).unwrap().read_mark(3).unwrap().dirty_sectors(), 100);
    }

    #[test]
    fn unmarking_to_zero_resets_data_type_to_none() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 3, 0, false)];
        mark_key(&fs, KeyKind::Extent, 100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        mark_key(&fs, KeyKind::Extent, -100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        let mark = fs.device(0).unwrap().read_mark(3).unwrap();
        assert_eq!(mark.dirty_sectors(), 0);
        assert_eq!(mark.data_type(), DataType::None);
        assert!(mark.is_free());
    }

    #[test]
    fn stale_pointer_before_alloc_read_done_is_silently_skipped() {
        let fs = one_device_fs();
        // Bump the bucket's gen past the pointer's: the bucket has since
        // been invalidated and reused beneath this (now stale) pointer.
        fs.device(0).unwrap().update_mark(3, |m: Mark| m.with_gen(10));
        let ptrs = [PointerRef::new(0, 3, 3, false)];
        let delta = mark_key(
            &fs,
            KeyKind::Extent,
            100,
            &ptrs,
            MarkContext { alloc_read_done: false, journal_seq: None, gc: false },
            Pos::MIN,
        )
        .unwrap();
        assert_eq!(delta.sectors[DataType::User as usize], 0);
    }

    #[test]
    fn stale_pointer_after_alloc_read_done_is_an_error() {
        let fs = one_device_fs();
        fs.device(0).unwrap().update_mark(3, |m: Mark| m.with_gen(10));
        let ptrs = [PointerRef::new(0, 3, 3, false)];
        let res = mark_key(
            &fs,
            KeyKind::Extent,
            100,
            &ptrs,
            MarkContext { alloc_read_done: true, journal_seq: None, gc: false },
            Pos::MIN,
        );
        assert!(res.is_err());
    }

    #[test]
    fn mark_update_overwrite_applies_symmetric_difference() {
        let fs = one_device_fs();
        let old_ptrs = [PointerRef::new(0, 1, 0, false)];
        mark_key(&fs, KeyKind::Extent, 100, &old_ptrs, MarkContext::default(), Pos::MIN).unwrap();

        let new_ptrs = [PointerRef::new(0, 2, 0, false)];
        mark_update_overwrite(
            &fs,
            KeyKind::Extent,
            100,
            &old_ptrs,
            KeyKind::Extent,
            100,
            &new_ptrs,
            MarkContext::default(),
            Pos::MIN,
        )
        .unwrap();

        assert_eq!(fs.device(0).unwrap().read_mark(1).unwrap().dirty_sectors(), 0);
        assert_eq!(fs.device(0).unwrap().read_mark(2).unwrap().dirty_sectors(), 100);
    }

    #[test]
    fn invalidate_bucket_requires_available_and_bumps_gen() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 4, 0, true)];
        mark_key(&fs, KeyKind::Extent, 50, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        let old = invalidate_bucket(&fs, 0, 4).unwrap();
        assert_eq!(old.cached_sectors(), 50);
        let mark = fs.device(0).unwrap().read_mark(4).unwrap();
        assert_eq!(mark.cached_sectors(), 0);
        assert_eq!(mark.gen(), 1);
        assert!(mark.is_allocator_owned());
    }

    #[test]
    fn invalidate_bucket_rejects_unavailable() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 4, 0, false)];
        mark_key(&fs, KeyKind::Extent, 50, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert!(invalidate_bucket(&fs, 0, 4).is_err());
    }

    #[test]
    #[should_panic(expected = "double-allocated")]
    fn double_allocation_outside_gc_panics() {
        let fs = one_device_fs();
        mark_alloc_bucket(&fs, 0, 7, true, 0).unwrap();
        mark_alloc_bucket(&fs, 0, 7, true, 0).unwrap();
    }

    #[test]
    fn first_allocation_of_a_free_bucket_succeeds() {
        let fs = one_device_fs();
        mark_alloc_bucket(&fs, 0, 7, true, 0).unwrap();
        assert!(fs.device(0).unwrap().read_mark(7).unwrap().is_allocator_owned());
    }

    #[test]
    fn clearing_allocator_ownership_flips_bit_without_touching_gen() {
        let fs = one_device_fs();
        mark_alloc_bucket(&fs, 0, 7, true, 3).unwrap();
        mark_alloc_bucket(&fs, 0, 7, false, 0).unwrap();
        let m = fs.device(0).unwrap().read_mark(7).unwrap();
        assert!(!m.is_allocator_owned());
        assert_eq!(m.gen(), 3);
    }

    /// S4: a bucket already holds 50 cached sectors from one pointer; a
    /// second, uncached pointer then marks its own 50 sectors dirty into
    /// the same bucket. The cached total from the first pointer is left
    /// alone — each pointer's own sectors land in the field its own
    /// `cached` bit selects, they don't get reinterpreted based on the
    /// bucket's resulting combined state.
    #[test]
    fn s4_cached_and_dirty_pointers_coexist_independently() {
        let fs = one_device_fs();
        let cached_ptr = [PointerRef::new(0, 6, 0, true)];
        mark_key(&fs, KeyKind::Extent, 50, &cached_ptr, MarkContext::default(), Pos::MIN).unwrap();

        let dirty_ptr = [PointerRef::new(0, 6, 0, false)];
        mark_key(&fs, KeyKind::Extent, 50, &dirty_ptr, MarkContext::default(), Pos::MIN).unwrap();

        let m = fs.device(0).unwrap().read_mark(6).unwrap();
        assert_eq!(m.cached_sectors(), 50);
        assert_eq!(m.dirty_sectors(), 50);
        // dirty_sectors > 0 so the bucket reads as dirty, not cached, even
        // though it still carries a cached pointer's sectors underneath.
        assert!(m.is_dirty());
    }

    #[test]
    fn mark_stripe_ptr_fails_when_stripe_missing() {
        let fs = one_device_fs();
        let ptrs = [PointerRef { stripe: Some((99, 0)), ..PointerRef::new(0, 5, 0, false) }];
        let res = mark_key(&fs, KeyKind::Extent, 10, &ptrs, MarkContext::default(), Pos::MIN);
        assert!(matches!(res, Err(crate::error::AccountingError::MissingStripe { idx: 99 })));
    }

    #[test]
    fn mark_stripe_ptr_updates_existing_stripe() {
        let fs = one_device_fs();
        fs.stripes.live.insert(1, crate::stripe::Stripe::new(0, 4, 2));
        let ptrs = [PointerRef { stripe: Some((1, 0)), ..PointerRef::new(0, 5, 0, false) }];
        mark_key(&fs, KeyKind::Extent, 10, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        let stripe = fs.stripes.live.get(1).unwrap();
        assert_eq!(stripe.sectors, 10);
        assert_eq!(stripe.block_sectors[0], 10);
    }

    #[test]
    fn extent_aggregation_folds_dirty_into_fs_data_and_replicas() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 1, 0, false), PointerRef::new(0, 2, 0, false)];
        let delta = mark_key(&fs, KeyKind::Extent, 100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert_eq!(delta.data, 200); // two replica pointers, each attributed the full 100
        assert_eq!(delta.replicas[1].data[DataType::User as usize], 200); // 2 replicas -> index 1
        assert_eq!(delta.cached, 0);
    }

    #[test]
    fn extent_aggregation_folds_cached_into_fs_cached() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 1, 0, true)];
        let delta = mark_key(&fs, KeyKind::Extent, 50, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert_eq!(delta.cached, 50);
        assert_eq!(delta.data, 0);
        assert_eq!(delta.replicas[0].data[DataType::Cached as usize], 50);
    }

    #[test]
    fn classify_overlap_matches_all_four_kinds() {
        assert_eq!(classify_overlap(0, 100, 0, 100), OverlapKind::All);
        assert_eq!(classify_overlap(0, 100, 0, 200), OverlapKind::All);
        assert_eq!(classify_overlap(10, 100, 0, 50), OverlapKind::Front);
        assert_eq!(classify_overlap(0, 100, 50, 200), OverlapKind::Back);
        assert_eq!(classify_overlap(0, 100, 20, 80), OverlapKind::Middle);
    }

    #[test]
    fn mark_extent_update_all_overlap_fully_unmarks_old() {
        let fs = one_device_fs();
        let old_ptrs = vec![PointerRef::new(0, 1, 0, false)];
        mark_key(&fs, KeyKind::Extent, 100, &old_ptrs, MarkContext::default(), Pos::MIN).unwrap();

        let old = ExtentKey { start: 0, end: 100, sectors: 100, ptrs: old_ptrs };
        let new = ExtentKey { start: 0, end: 100, sectors: 100, ptrs: vec![PointerRef::new(0, 2, 0, false)] };
        mark_extent_update(&fs, &new, &[old], MarkContext::default(), Pos::MIN).unwrap();

        assert!(fs.device(0).unwrap().read_mark(1).unwrap().is_free());
        assert_eq!(fs.device(0).unwrap().read_mark(2).unwrap().dirty_sectors(), 100);
    }

    #[test]
    fn mark_extent_update_front_overlap_unmarks_partial_prefix() {
        let fs = one_device_fs();
        let old_ptrs = vec![PointerRef::new(0, 1, 0, false)];
        mark_key(&fs, KeyKind::Extent, 100, &old_ptrs, MarkContext::default(), Pos::MIN).unwrap();

        // old spans [50,150) with 100 sectors; new spans [0,100), overlapping
        // old's leading half [50,100) — 50 sectors of old's 100 get unmarked.
        let old = ExtentKey { start: 50, end: 150, sectors: 100, ptrs: old_ptrs };
        let new = ExtentKey { start: 0, end: 100, sectors: 50, ptrs: vec![PointerRef::new(0, 2, 0, false)] };
        mark_extent_update(&fs, &new, &[old], MarkContext::default(), Pos::MIN).unwrap();

        assert_eq!(fs.device(0).unwrap().read_mark(1).unwrap().dirty_sectors(), 50);
        assert_eq!(fs.device(0).unwrap().read_mark(2).unwrap().dirty_sectors(), 50);
    }

    #[test]
    fn mark_extent_update_middle_overlap_splits_old_and_remarks_right_half() {
        let fs = one_device_fs();
        let old_ptrs = vec![PointerRef::new(0, 1, 0, false)];
        mark_key(&fs, KeyKind::Extent, 100, &old_ptrs, MarkContext::default(), Pos::MIN).unwrap();

        // old spans [0,100) with 100 sectors; new spans [25,75), splitting
        // old into a left remainder [0,25) and a right remainder [75,100)
        // that gets re-marked (both attributed to old's own bucket/pointer).
        let old = ExtentKey { start: 0, end: 100, sectors: 100, ptrs: old_ptrs };
        let new = ExtentKey { start: 25, end: 75, sectors: 50, ptrs: vec![PointerRef::new(0, 2, 0, false)] };
        mark_extent_update(&fs, &new, &[old], MarkContext::default(), Pos::MIN).unwrap();

        // Net on old's bucket: +100 initial, +25 right-half re-mark,
        // -75 unmark of [old.start, new_end) = left+middle => 50 left,
        // i.e. the untouched left and right quarters survive, the
        // overwritten middle half is gone.
        assert_eq!(fs.device(0).unwrap().read_mark(1).unwrap().dirty_sectors(), 50);
        assert_eq!(fs.device(0).unwrap().read_mark(2).unwrap().dirty_sectors(), 50);
    }

    /// A full unmark back to `DataType::None` must reverse the old type's
    /// own contribution to `sectors[]`, not add a negative delta into
    /// `sectors[None]` (which would wrap a would-be-huge u64 and leave
    /// `sectors[User]` stuck positive forever).
    #[test]
    fn unmark_to_zero_keeps_sectors_by_type_consistent() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 3, 0, false)];
        let marked = mark_key(&fs, KeyKind::Extent, 100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert_eq!(marked.sectors[DataType::User as usize], 100);

        let unmarked = mark_key(&fs, KeyKind::Extent, -100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert_eq!(unmarked.sectors[DataType::User as usize], -100);
        assert_eq!(unmarked.sectors[DataType::None as usize], 0);
    }

    #[test]
    fn mark_and_unmark_round_trips_fs_and_device_sectors_to_zero() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 3, 0, false)];
        let d1 = mark_key(&fs, KeyKind::Extent, 100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        fs.apply(&d1, Pos::MIN);
        let d2 = mark_key(&fs, KeyKind::Extent, -100, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        fs.apply(&d2, Pos::MIN);

        let fs_usage = fs.usage.live.read();
        assert_eq!(fs_usage.sectors[DataType::User as usize], 0);
        assert_eq!(fs_usage.sectors[DataType::None as usize], 0);
        assert_eq!(fs_usage.data, 0);

        let dev_usage = fs.device(0).unwrap().usage.live.read();
        assert_eq!(dev_usage.sectors[DataType::User as usize], 0);
        assert_eq!(dev_usage.buckets[DataType::User as usize], 0);
    }

    #[test]
    fn mark_pointer_updates_device_usage_directly() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 2, 0, false)];
        mark_key(&fs, KeyKind::Extent, 150, &ptrs, MarkContext::default(), Pos::MIN).unwrap();

        let dev_usage = fs.device(0).unwrap().usage.live.read();
        assert_eq!(dev_usage.sectors[DataType::User as usize], 150);
        assert_eq!(dev_usage.buckets[DataType::User as usize], 1);
    }

    /// A key's pointers spanning two devices must charge each device only
    /// its own bucket's sectors.
    #[test]
    fn mark_key_attributes_device_usage_per_pointer_device() {
        let dev0 = Arc::new(Device::new(0, 0, 16, 2));
        let dev1 = Arc::new(Device::new(1, 0, 16, 2));
        let fs = Filesystem::new(vec![dev0, dev1], 32 * 1024, 2);
        let ptrs = [PointerRef::new(0, 1, 0, false), PointerRef::new(1, 1, 0, false)];
        mark_key(&fs, KeyKind::Extent, 64, &ptrs, MarkContext::default(), Pos::MIN).unwrap();

        assert_eq!(fs.device(0).unwrap().usage.live.read().sectors[DataType::User as usize], 64);
        assert_eq!(fs.device(1).unwrap().usage.live.read().sectors[DataType::User as usize], 64);
    }

    #[test]
    fn btree_node_kind_marks_fixed_node_size_not_caller_sectors() {
        let fs = one_device_fs();
        let ptrs = [PointerRef::new(0, 5, 0, false)];
        // Caller passes an arbitrary sectors magnitude; only its sign is
        // used, the actual amount marked is fs.btree_node_size.
        let delta = mark_key(&fs, KeyKind::BtreeNode, 1, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert_eq!(delta.sectors[DataType::Btree as usize], fs.btree_node_size as i64);
        assert_eq!(
            fs.device(0).unwrap().read_mark(5).unwrap().dirty_sectors(),
            fs.btree_node_size as u32
        );

        let removed =
            mark_key(&fs, KeyKind::BtreeNode, -1, &ptrs, MarkContext::default(), Pos::MIN).unwrap();
        assert_eq!(removed.sectors[DataType::Btree as usize], -(fs.btree_node_size as i64));
        assert!(fs.device(0).unwrap().read_mark(5).unwrap().is_free());
    }

    #[test]
    fn mark_stripe_key_creates_record_and_flips_bucket_bit() {
        let fs = one_device_fs();
        let key = StripeKey {
            idx: 7,
            algorithm: 1,
            nr_redundant: 2,
            blocks: vec![PointerRef::new(0, 1, 0, false), PointerRef::new(0, 2, 0, false)],
        };

        mark_stripe_key(&fs, &key, true).unwrap();
        assert!(fs.stripes.live.contains(7));
        assert!(fs.device(0).unwrap().read_mark(1).unwrap().stripe());
        assert!(fs.device(0).unwrap().read_mark(2).unwrap().stripe());

        mark_stripe_key(&fs, &key, false).unwrap();
        assert!(!fs.stripes.live.contains(7));
        assert!(!fs.device(0).unwrap().read_mark(1).unwrap().stripe());
    }

    #[test]
    fn mark_stripe_key_rejects_unknown_device() {
        let fs = one_device_fs();
        let key = StripeKey {
            idx: 1,
            algorithm: 0,
            nr_redundant: 1,
            blocks: vec![PointerRef::new(9, 0, 0, false)],
        };
        assert!(mark_stripe_key(&fs, &key, true).is_err());
    }
}
