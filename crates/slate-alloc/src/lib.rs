#![forbid(unsafe_code)]
//! Block allocation.
//!
//! Allocation is split across two representations. The in-memory free view
//! answers `alloc`/`free` in O(1) and is the only structure the hot path
//! touches; the on-disk bitmap is updated lazily, at transaction commit,
//! through [`commit_bitmap`]. Blocks freed inside a transaction can be
//! withheld from the view (delayed free) so they cannot be reallocated until
//! that transaction commits.
//!
//! The view keeps both a per-block state vector and a free list: the vector
//! gives O(1) membership checks on free, the list gives O(1) pops on alloc.

use parking_lot::Mutex;
use slate_block::BufCache;
use slate_error::{FsError, Result};
use slate_journal::{AddToTransaction, Transaction};
use slate_types::{BPB, BlockNo, Inum, bblock};
use std::collections::VecDeque;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

// ── In-memory free view ─────────────────────────────────────────────────────

#[derive(Debug)]
struct ViewInner {
    /// Per-block free flag, indexed by absolute block number.
    free: Vec<bool>,
    /// Free block numbers, consumed from the front.
    freelist: VecDeque<u32>,
}

/// Process-wide view of which device blocks are free.
///
/// Starts with every block allocated; mount seeds it from the on-disk
/// bitmap via [`FreeBlockView::seed_free`].
#[derive(Debug)]
pub struct FreeBlockView {
    inner: Mutex<ViewInner>,
}

impl FreeBlockView {
    /// A view over a device of `size` blocks, all initially allocated.
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            inner: Mutex::new(ViewInner {
                free: vec![false; size as usize],
                freelist: VecDeque::new(),
            }),
        }
    }

    /// Mark `bno` free during the initial bitmap scan.
    pub fn seed_free(&self, bno: BlockNo) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.free[bno.0 as usize], "seed_free: block seeded twice");
        inner.free[bno.0 as usize] = true;
        inner.freelist.push_back(bno.0);
    }

    /// Reserve a free block, or `None` if the view is exhausted.
    #[must_use]
    pub fn alloc(&self) -> Option<BlockNo> {
        let mut inner = self.inner.lock();
        let bno = inner.freelist.pop_front()?;
        inner.free[bno as usize] = false;
        Some(BlockNo(bno))
    }

    /// Release `bno` back to the view.
    ///
    /// Releasing a block that is already free is a fatal invariant
    /// violation.
    pub fn free(&self, bno: BlockNo) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.free[bno.0 as usize],
            "free view: block {bno} already free"
        );
        inner.free[bno.0 as usize] = true;
        inner.freelist.push_back(bno.0);
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().freelist.len()
    }
}

// ── Allocate / free ─────────────────────────────────────────────────────────

/// Allocate a disk block.
///
/// Mutates only the in-memory view; the on-disk bitmap catches up at commit.
/// The reservation is recorded on `tx` when one is given, and the block's
/// cached contents are zeroed when `zero_on_alloc` is set.
pub fn alloc_block(
    view: &FreeBlockView,
    cache: &BufCache,
    dev: u32,
    tx: Option<&Transaction>,
    zero_on_alloc: bool,
) -> Result<BlockNo> {
    let bno = view.alloc().ok_or(FsError::OutOfBlocks)?;
    if let Some(tx) = tx {
        tx.add_allocated_block(bno);
    }
    if zero_on_alloc {
        cache.zero_block(dev, bno, false)?;
    }
    debug!(target: "slatefs::alloc", %bno, zero = zero_on_alloc, "block allocated");
    Ok(bno)
}

/// Free a disk block. Contents are never zeroed on free.
///
/// With `delayed` the view is left untouched; the block is only recorded on
/// the transaction's free list and becomes reusable after that transaction's
/// journal flush. This keeps blocks freed inside a transaction unavailable
/// until the transaction commits.
pub fn free_block(view: &FreeBlockView, bno: BlockNo, tx: Option<&Transaction>, delayed: bool) {
    debug_assert!(
        !delayed || tx.is_some(),
        "delayed free without a transaction would leak the block"
    );
    if !delayed {
        view.free(bno);
    }
    if let Some(tx) = tx {
        tx.add_free_block(bno, delayed);
    }
    debug!(target: "slatefs::alloc", %bno, delayed, "block freed");
}

// ── On-disk bitmap staging ──────────────────────────────────────────────────

/// Mark `blocks` as allocated (`alloc == true`) or freed in the on-disk
/// bitmap, staging the touched bitmap blocks into `tx`.
///
/// Blocks are sorted ascending and all updates falling into the same bitmap
/// block are coalesced: each bitmap block is fetched once, patched, and
/// attached to the transaction once. Flipping a bit to the state it already
/// has is a fatal invariant violation.
pub fn commit_bitmap(
    cache: &BufCache,
    dev: u32,
    ninodes: u32,
    mut blocks: Vec<BlockNo>,
    tx: &Transaction,
    alloc: bool,
) -> Result<()> {
    blocks.sort_unstable();

    let mut iter = blocks.iter().peekable();
    while let Some(&first) = iter.peek() {
        let bitmap_block = bblock(*first, ninodes);
        // Highest block number whose bit lives in this bitmap block.
        let max_bno = first.0 | (BPB as u32 - 1);

        let buf = cache.get(dev, bitmap_block, false)?;
        let mut guard = buf.write();

        while let Some(&bno) = iter.peek() {
            if bno.0 > max_bno {
                break;
            }
            let bi = bno.0 as usize % BPB;
            let mask = 1_u8 << (bi % 8);
            if alloc {
                assert!(
                    guard[bi / 8] & mask == 0,
                    "commit_bitmap: block {bno} already in use"
                );
                guard[bi / 8] |= mask;
            } else {
                assert!(
                    guard[bi / 8] & mask != 0,
                    "commit_bitmap: block {bno} already free"
                );
                guard[bi / 8] &= !mask;
            }
            iter.next();
        }

        guard.add_to_transaction(tx);
    }
    Ok(())
}

// ── Inum allocation hints ───────────────────────────────────────────────────

const HINT_SHARDS: usize = 16;

/// Sharded record of the last inum each thread allocated, so the next
/// `ialloc` scan starts just past it instead of from zero.
///
/// The kernel original keeps one hint per CPU; userspace threads migrate, so
/// the shard is picked by thread identity instead.
#[derive(Debug)]
pub struct InumHints {
    shards: Box<[AtomicU32]>,
    hasher: RandomState,
}

impl InumHints {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..HINT_SHARDS).map(|_| AtomicU32::new(0)).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self) -> &AtomicU32 {
        let mut h = self.hasher.build_hasher();
        std::thread::current().id().hash(&mut h);
        &self.shards[(h.finish() as usize) % self.shards.len()]
    }

    /// The inum this thread's scan should start after.
    #[must_use]
    pub fn last(&self) -> Inum {
        Inum(self.shard().load(Ordering::Relaxed))
    }

    /// Record a successful allocation.
    pub fn record(&self, inum: Inum) {
        self.shard().store(inum.0, Ordering::Relaxed);
    }
}

impl Default for InumHints {
    fn default() -> Self {
        Self::new()
    }
}
