#![forbid(unsafe_code)]
//! Transactions and the journal.
//!
//! A transaction is an ordered set of modified block snapshots plus the
//! block-free intents and new-inum records accumulated while the mutation
//! ran. Completed transactions are appended to the journal; `Journal::flush`
//! writes every snapshot to its home location in order. Blocks freed with
//! the delayed flag stay out of the allocator's free view until the flush
//! that makes their freeing transaction durable has returned.

use parking_lot::Mutex;
use slate_block::{BufCache, BufWriteGuard};
use slate_error::Result;
use slate_types::{BSIZE, BlockNo, Inum};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

// ── Transaction ─────────────────────────────────────────────────────────────

/// Process-wide logical clock for block captures.
///
/// Stamps are taken while the buffer's write lock is held, so for any one
/// block they increase with content version even when transactions from
/// different threads land in the log out of capture order.
static CAPTURE_CLOCK: AtomicU64 = AtomicU64::new(1);

fn next_stamp() -> u64 {
    CAPTURE_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// Snapshot of one modified block, captured under the buffer's write lock.
#[derive(Debug, Clone)]
pub struct DiskBlockCopy {
    pub bno: BlockNo,
    pub bytes: Box<[u8]>,
    /// Capture timestamp; flush skips a snapshot that is older than one
    /// already written for the same block.
    pub stamp: u64,
}

#[derive(Debug, Default)]
struct TxInner {
    blocks: Vec<DiskBlockCopy>,
    allocated: Vec<BlockNo>,
    freed: Vec<BlockNo>,
    deferred_free: Vec<BlockNo>,
    new_inums: Vec<Inum>,
}

/// An open transaction. Thread-safe: block snapshots and intents may be
/// recorded from any thread holding the relevant buffer or inode locks.
#[derive(Debug)]
pub struct Transaction {
    seq: u64,
    inner: Mutex<TxInner>,
}

impl Transaction {
    #[must_use]
    fn new(seq: u64) -> Self {
        Self {
            seq,
            inner: Mutex::new(TxInner::default()),
        }
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Record a snapshot of `bytes` as the committed contents of `bno`.
    ///
    /// Callers go through [`AddToTransaction::add_to_transaction`] so the
    /// copy is taken while the buffer's write lock is held.
    pub fn add_block(&self, bno: BlockNo, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), BSIZE);
        let mut inner = self.inner.lock();
        inner.blocks.push(DiskBlockCopy {
            bno,
            bytes: bytes.into(),
            stamp: next_stamp(),
        });
    }

    /// Record that `bno` was taken from the in-memory free view.
    pub fn add_allocated_block(&self, bno: BlockNo) {
        self.inner.lock().allocated.push(bno);
    }

    /// Record a free intent. With `delayed` the block must also be withheld
    /// from the free view until this transaction's flush returns.
    pub fn add_free_block(&self, bno: BlockNo, delayed: bool) {
        let mut inner = self.inner.lock();
        inner.freed.push(bno);
        if delayed {
            inner.deferred_free.push(bno);
        }
    }

    /// Record an inum newly allocated inside this transaction.
    pub fn log_new_file(&self, inum: Inum) {
        self.inner.lock().new_inums.push(inum);
    }

    /// Drain the allocated/freed block lists for the on-disk bitmap update
    /// at commit time.
    #[must_use]
    pub fn take_bitmap_intents(&self) -> (Vec<BlockNo>, Vec<BlockNo>) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.allocated),
            std::mem::take(&mut inner.freed),
        )
    }

    #[must_use]
    pub fn new_inums(&self) -> Vec<Inum> {
        self.inner.lock().new_inums.clone()
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

/// Capture a locked buffer's contents into a transaction.
///
/// Implemented on the buffer write guard so the snapshot is taken with the
/// write lock held and the buffer is marked clean at the same moment.
pub trait AddToTransaction {
    fn add_to_transaction(&self, tx: &Transaction);
}

impl AddToTransaction for BufWriteGuard<'_> {
    fn add_to_transaction(&self, tx: &Transaction) {
        tx.add_block(self.bno(), self.bytes());
        self.mark_clean();
    }
}

// ── Journal ─────────────────────────────────────────────────────────────────

/// Ordered log of completed transactions.
#[derive(Debug)]
pub struct Journal {
    next_seq: AtomicU64,
    log: Mutex<Vec<Transaction>>,
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(1),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Open a transaction with a fresh sequence stamp.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Append a completed transaction. All of its blocks must already have
    /// been captured.
    pub fn append(&self, tx: Transaction) {
        debug!(
            target: "slatefs::journal",
            seq = tx.seq(),
            blocks = tx.block_count(),
            "transaction appended"
        );
        self.log.lock().push(tx);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.log.lock().len()
    }

    /// Write every logged block snapshot to its home location, oldest
    /// transaction first, then sync the device. A snapshot older than one
    /// already written for the same block in this flush is stale (its
    /// transaction lost a capture-order race) and is skipped.
    ///
    /// Snapshots go straight to the device: the cache's live buffers are
    /// same-or-newer than any committed copy and must not be rolled back.
    ///
    /// Returns the blocks whose frees were delayed; only once this function
    /// has returned may the caller release them into the free view.
    pub fn flush(&self, cache: &BufCache) -> Result<Vec<BlockNo>> {
        let drained = std::mem::take(&mut *self.log.lock());
        let mut reusable = Vec::new();
        let mut written = 0_usize;
        let mut newest: std::collections::HashMap<BlockNo, u64> = std::collections::HashMap::new();

        for tx in &drained {
            let inner = tx.inner.lock();
            for copy in &inner.blocks {
                if newest.get(&copy.bno).is_some_and(|seen| *seen > copy.stamp) {
                    continue;
                }
                newest.insert(copy.bno, copy.stamp);
                cache.device().write_block(copy.bno, &copy.bytes)?;
                written += 1;
            }
            reusable.extend_from_slice(&inner.deferred_free);
        }

        cache.sync()?;
        info!(
            target: "slatefs::journal",
            transactions = drained.len(),
            blocks = written,
            "journal flushed"
        );
        Ok(reusable)
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}
