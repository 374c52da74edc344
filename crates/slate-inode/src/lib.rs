#![forbid(unsafe_code)]
//! The in-memory inode layer: cache, handles, locking, and the filesystem
//! context that ties the allocator, buffer cache, and journal together.
//!
//! An inode is a single, unnamed file. The on-disk records are laid out
//! densely after the superblock; this layer caches the in-use records so
//! access to an inode shared between threads has a single place to
//! synchronize.
//!
//! Each cached inode carries an explicit reference count (`Iref` handles).
//! References are typically kept by open files and working directories; when
//! the count falls to zero the inode is victimized: marked, removed from the
//! cache so later lookups miss, and left to be freed once the last `Arc`
//! drops. A lookup that races with victimization bumps the count first and
//! checks the victim flag second; if the flag is set it backs out and the
//! enclosing operation restarts with [`FsError::Retry`].
//!
//! Threads may read or write inode metadata and contents only while holding
//! the inode's lock, represented by the `busy` and `readbusy` flags. Inode
//! locks are held across disk accesses, so they are flags under a small
//! mutex plus a condvar rather than a plain rwlock; waiters for shared and
//! exclusive acquisition all wake together when a writer releases. Routines
//! here return *unlocked* inodes (except `ialloc`, which returns a locked
//! one to prevent races on freshly created inodes); callers lock them, which
//! lets a caller assemble arbitrarily large atomic operations.

pub mod data;

use parking_lot::{Condvar, Mutex, MutexGuard};
use slate_alloc::{FreeBlockView, InumHints};
use slate_block::{BlockDevice, BufCache};
use slate_error::{FsError, Result};
use slate_journal::Journal;
use slate_ondisk::{Dinode, Geometry, InodeType, Superblock};
use slate_types::{
    BPB, BSIZE, BlockNo, DirName, Inum, NDIRECT, NRECLAIM, ROOTINO, SUPERBLOCK_BLOCK, iblock,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, warn};

// ── Directory overlay ───────────────────────────────────────────────────────

/// Where a name lives: the inum it maps to and the byte offset of its
/// on-disk entry. `inum == 0` is a tombstone being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub inum: u32,
    pub offset: u32,
}

/// In-memory mirror of a directory's live entries.
///
/// Populated lazily from the on-disk entry stream; deletions tombstone the
/// disk slot and drop the name here, never compacting (entry offsets are
/// load-bearing).
#[derive(Debug, Default)]
pub struct DirEntries {
    map: HashMap<DirName, DirEntryInfo>,
}

impl DirEntries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping; fails if the name is already present.
    pub fn insert(&mut self, name: DirName, info: DirEntryInfo) -> bool {
        use std::collections::hash_map::Entry;
        match self.map.entry(name) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(info);
                true
            }
        }
    }

    /// Replace a mapping unconditionally (tombstone staging).
    pub fn replace(&mut self, name: DirName, info: DirEntryInfo) {
        self.map.insert(name, info);
    }

    #[must_use]
    pub fn lookup(&self, name: &DirName) -> Option<DirEntryInfo> {
        self.map.get(name).copied()
    }

    pub fn remove(&mut self, name: &DirName) -> bool {
        self.map.remove(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DirName, &DirEntryInfo)> {
        self.map.iter()
    }
}

// ── In-memory inode ─────────────────────────────────────────────────────────

/// Inode lock kind: shared readers, or one writer excluding everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Fields protected by the inode lock protocol.
#[derive(Debug)]
pub struct InodeMeta {
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u64,
    pub gen: u64,
    pub addrs: [u32; NDIRECT + 2],
    /// Directory overlay, populated on first access for directory inodes.
    pub dir: Option<DirEntries>,
    /// Byte offset at which the next directory entry will be appended.
    pub dir_offset: u32,
}

#[derive(Debug)]
struct LockState {
    busy: bool,
    readbusy: u32,
}

/// One cached inode. Identity `(dev, inum)` is immutable for the lifetime
/// of the object; everything else follows the locking rules above.
pub struct Inode {
    pub dev: u32,
    pub inum: Inum,
    /// On-disk type tag; the CAS from `Free` is how `ialloc` claims a slot.
    dtype: AtomicU16,
    /// False while the slot is inserted but its metadata is still loading.
    valid: AtomicBool,
    /// Set at the start of victimization; upgrades that observe it retry.
    victim: AtomicBool,
    /// Claimed by whichever zero-reference path completes victimization, so
    /// a retrying upgrade's back-out cannot run it twice.
    retired: AtomicBool,
    refs: AtomicU32,
    state: Mutex<LockState>,
    cv: Condvar,
    meta: Mutex<InodeMeta>,
    cache: Weak<CacheInner>,
}

impl Inode {
    fn new(dev: u32, inum: Inum, cache: Weak<CacheInner>) -> Self {
        Self {
            dev,
            inum,
            dtype: AtomicU16::new(InodeType::Free.to_raw()),
            valid: AtomicBool::new(false),
            victim: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            refs: AtomicU32::new(0),
            state: Mutex::new(LockState {
                busy: false,
                readbusy: 0,
            }),
            cv: Condvar::new(),
            meta: Mutex::new(InodeMeta {
                major: 0,
                minor: 0,
                nlink: 0,
                size: 0,
                gen: 0,
                addrs: [0; NDIRECT + 2],
                dir: None,
                dir_offset: 0,
            }),
            cache,
        }
    }

    #[must_use]
    pub fn itype(&self) -> InodeType {
        InodeType::from_raw(self.dtype.load(Ordering::SeqCst)).unwrap_or(InodeType::Free)
    }

    /// Set the type. Caller holds the write lock.
    pub fn set_itype(&self, itype: InodeType) {
        self.dtype.store(itype.to_raw(), Ordering::SeqCst);
    }

    /// Claim a free on-disk slot by swinging the type from `Free`.
    fn try_claim_type(&self, itype: InodeType) -> bool {
        self.itype() == InodeType::Free
            && self
                .dtype
                .compare_exchange(
                    InodeType::Free.to_raw(),
                    itype.to_raw(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_victim(&self) -> bool {
        self.victim.load(Ordering::SeqCst)
    }

    /// Metadata access. The returned guard is short-lived; long-duration
    /// exclusion is the job of the inode lock.
    pub fn meta(&self) -> MutexGuard<'_, InodeMeta> {
        self.meta.lock()
    }

    #[must_use]
    pub fn nlink(&self) -> u16 {
        self.meta.lock().nlink
    }

    /// Bump the link count. A non-zero link count holds one self-reference.
    /// Caller holds the write lock if the inode is shared.
    pub fn link(&self) {
        let mut meta = self.meta.lock();
        meta.nlink += 1;
        if meta.nlink == 1 {
            self.inc_ref();
        }
    }

    /// Drop the link count, releasing the self-reference at zero. The
    /// liveness reference guarantees this is never the last one.
    pub fn unlink(&self) {
        let mut meta = self.meta.lock();
        meta.nlink -= 1;
        if meta.nlink == 0 {
            drop(meta);
            self.dec_ref();
        }
    }

    /// Acquire the inode lock.
    pub fn lock(&self, kind: LockKind) {
        let mut st = self.state.lock();
        match kind {
            LockKind::Write => {
                while st.busy || st.readbusy > 0 {
                    self.cv.wait(&mut st);
                }
                st.busy = true;
            }
            LockKind::Read => {
                while st.busy {
                    self.cv.wait(&mut st);
                }
            }
        }
        st.readbusy += 1;
        drop(st);

        assert!(self.is_valid(), "ilock: inode metadata not loaded");
    }

    /// Release the inode lock (either kind) and wake all waiters.
    pub fn unlock(&self) {
        let mut st = self.state.lock();
        assert!(
            st.busy || st.readbusy > 0,
            "iunlock: inode {} not locked",
            self.inum
        );
        st.readbusy -= 1;
        st.busy = false;
        self.cv.notify_all();
    }

    fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.victimize();
        }
    }

    /// The refcount reached zero: publish the victim flag, re-check for a
    /// concurrent upgrade, and on success pull the entry out of the cache.
    ///
    /// The victim flag is published before the refcount re-check, and
    /// upgrades bump the refcount before reading the flag; under the total
    /// order of those four operations every interleaving ends either here
    /// (and the upgrade retries) or with the upgrade winning (and this
    /// aborts). An upgrade that loses backs its bump out through
    /// [`Inode::dec_ref`], so victimization re-triggers.
    fn victimize(&self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let mut map = cache.map.lock();

        self.victim.store(true, Ordering::SeqCst);
        if self.refs.load(Ordering::SeqCst) > 0 {
            self.victim.store(false, Ordering::SeqCst);
            return;
        }
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut st = self.state.lock();
            assert!(
                !st.busy && st.readbusy == 0,
                "victimize: inode {} is locked",
                self.inum
            );
            st.busy = true;
            st.readbusy = 1;
        }

        let key = (self.dev, self.inum);
        if map
            .get(&key)
            .is_some_and(|cur| std::ptr::eq(Arc::as_ptr(cur), std::ptr::from_ref(self)))
        {
            map.remove(&key);
        }
        debug!(target: "slatefs::inode", inum = %self.inum, "inode victimized");
    }

    /// Populate metadata from the on-disk record and publish the handle.
    ///
    /// Takes the self-references: one for a non-zero link count, and the
    /// liveness reference that keeps an unlinked-but-open inode alive until
    /// the deferred reclamation path releases it.
    fn load_from_disk(&self, fs: &FsContext) -> Result<()> {
        let buf = fs.cache.get(self.dev, iblock(self.inum), false)?;
        let di = {
            let data = buf.read();
            let off = Dinode::offset_in_block(self.inum);
            Dinode::parse(&data[off..off + slate_types::DINODE_SIZE], iblock(self.inum))?
        };

        self.dtype.store(di.itype.to_raw(), Ordering::SeqCst);
        {
            let mut meta = self.meta.lock();
            meta.major = di.major;
            meta.minor = di.minor;
            meta.nlink = di.nlink;
            meta.size = di.size;
            meta.gen = di.gen;
            meta.addrs = di.addrs;
        }

        if di.nlink > 0 {
            self.inc_ref();
        }
        // Liveness reference, released only by the deferred reclamation
        // path: open handles outlive the last unlink.
        self.inc_ref();

        let st = self.state.lock();
        self.valid.store(true, Ordering::Release);
        self.cv.notify_all();
        drop(st);
        Ok(())
    }

    /// Release the liveness self-reference taken at load. Called exactly
    /// once, from the deferred reclamation path.
    pub fn release_liveness(&self) {
        debug_assert!(self.is_valid());
        self.dec_ref();
    }

    #[cfg(test)]
    fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("dev", &self.dev)
            .field("inum", &self.inum)
            .field("type", &self.itype())
            .field("valid", &self.is_valid())
            .field("victim", &self.is_victim())
            .finish_non_exhaustive()
    }
}

// ── Handles ─────────────────────────────────────────────────────────────────

/// Counted reference to a cached inode.
///
/// Cloning bumps the count; dropping the last one victimizes the inode.
pub struct Iref {
    inner: Arc<Inode>,
}

impl Iref {
    /// Wrap a fresh or known-live inode without a victim check.
    fn adopt(inner: Arc<Inode>) -> Self {
        inner.inc_ref();
        Self { inner }
    }

    /// Upgrade an `Arc` obtained from the cache map: bump first, then check
    /// the victim flag; back out with `Retry` if victimization won.
    fn try_upgrade(inner: Arc<Inode>) -> Result<Self> {
        inner.inc_ref();
        let handle = Self { inner };
        if handle.inner.is_victim() {
            // Drop backs the bump out and re-triggers victimization if this
            // was the racing reference.
            return Err(FsError::Retry);
        }
        Ok(handle)
    }
}

impl Clone for Iref {
    fn clone(&self) -> Self {
        Self::adopt(Arc::clone(&self.inner))
    }
}

impl Drop for Iref {
    fn drop(&mut self) {
        self.inner.dec_ref();
    }
}

impl std::ops::Deref for Iref {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inner
    }
}

impl std::fmt::Debug for Iref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

// ── Cache & context ─────────────────────────────────────────────────────────

struct CacheInner {
    map: Mutex<HashMap<(u32, Inum), Arc<Inode>>>,
}

/// Hash table caching in-memory inodes by `(dev, inum)`.
///
/// The map entry is a locator, not an owner in the refcount's terms: the
/// entry pins the allocation (so a concurrent lookup never dereferences a
/// freed object) but only `Iref` handles and the nlink/liveness
/// self-references count toward victimization.
pub struct InodeCache {
    inner: Arc<CacheInner>,
}

impl InodeCache {
    #[must_use]
    fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                map: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `(dev, inum)` currently has a live cache entry.
    #[must_use]
    pub fn contains(&self, dev: u32, inum: Inum) -> bool {
        self.inner.map.lock().contains_key(&(dev, inum))
    }
}

/// Everything one mounted filesystem instance owns: superblock, buffer
/// cache, free view, allocation hints, journal, and the inode cache.
///
/// All core entry points take this explicitly, so two instances can coexist
/// in one process (and in one test).
pub struct FsContext {
    pub dev: u32,
    sb: Superblock,
    reclaim: Mutex<Vec<Inum>>,
    pub geo: Geometry,
    pub cache: BufCache,
    pub blocks: FreeBlockView,
    pub hints: InumHints,
    pub journal: Journal,
    pub icache: InodeCache,
    root: OnceLock<Iref>,
}

impl FsContext {
    /// Read the superblock from `device`, seed the in-memory free view from
    /// the on-disk bitmap, and install the root inode handle.
    pub fn open(device: Arc<dyn BlockDevice>, dev: u32) -> Result<Arc<Self>> {
        let mut raw = vec![0_u8; BSIZE];
        device.read_block(SUPERBLOCK_BLOCK, &mut raw)?;
        let sb = Superblock::parse(&raw)?;
        let geo = Geometry::from_superblock(&sb);

        let fs = Arc::new(Self {
            dev,
            sb,
            reclaim: Mutex::new(Vec::new()),
            geo,
            cache: BufCache::new(device),
            blocks: FreeBlockView::new(geo.size),
            hints: InumHints::new(),
            journal: Journal::new(),
            icache: InodeCache::new(),
            root: OnceLock::new(),
        });
        *fs.reclaim.lock() = fs.sb.reclaim_inodes.clone();

        fs.seed_free_view()?;

        let root = iget(&fs, dev, ROOTINO)?;
        if root.itype() != InodeType::Dir {
            return Err(FsError::Corruption {
                block: iblock(ROOTINO).0,
                detail: "root inode is not a directory".into(),
            });
        }
        fs.root
            .set(root)
            .map_err(|_| FsError::InvalidArgument("filesystem context opened twice"))?;

        info!(
            target: "slatefs::inode",
            size = fs.sb.size,
            ninodes = fs.sb.ninodes,
            free_blocks = fs.blocks.free_count(),
            "filesystem context opened"
        );
        Ok(fs)
    }

    /// Walk the on-disk bitmap and hand every clear bit to the free view.
    fn seed_free_view(&self) -> Result<()> {
        for index in 0..self.geo.bitmap_blocks {
            let buf = self.cache.get(self.dev, self.geo.bitmap_block(index), false)?;
            let data = buf.read();
            let bits = self.geo.bits_in_bitmap_block(index);
            for bi in 0..bits as usize {
                if data[bi / 8] & (1 << (bi % 8)) == 0 {
                    self.blocks
                        .seed_free(BlockNo(index * BPB as u32 + bi as u32));
                }
            }
        }
        Ok(())
    }

    /// A fresh handle to the root directory.
    #[must_use]
    pub fn root(&self) -> Iref {
        self.root.get().expect("root installed at open").clone()
    }

    #[must_use]
    pub fn ninodes(&self) -> u32 {
        self.sb.ninodes
    }

    /// Superblock copy; the reclaim queue is included only on request.
    #[must_use]
    pub fn superblock(&self, with_reclaim: bool) -> Superblock {
        Superblock {
            size: self.sb.size,
            nblocks: self.sb.nblocks,
            ninodes: self.sb.ninodes,
            reclaim_inodes: if with_reclaim {
                self.reclaim.lock().clone()
            } else {
                Vec::new()
            },
        }
    }

    /// Queue `inum` for deferred reclamation. Fails when the superblock
    /// array is full; the caller must reclaim inline instead.
    pub fn push_reclaim(&self, inum: Inum) -> bool {
        let mut queue = self.reclaim.lock();
        if queue.len() >= NRECLAIM {
            return false;
        }
        queue.push(inum);
        true
    }

    /// Drain the reclaim queue.
    #[must_use]
    pub fn take_reclaim(&self) -> Vec<Inum> {
        std::mem::take(&mut self.reclaim.lock())
    }
}

// ── iget / ialloc ───────────────────────────────────────────────────────────

/// Find or load the inode `(dev, inum)`.
///
/// On a hit the handle is upgraded (bump, then victim check — `Retry` if it
/// loses). On a miss a fresh slot is inserted locked-for-write, metadata is
/// read from disk, and only then does `valid` flip; hits on a loading peer
/// wait on its condvar.
pub fn iget(fs: &FsContext, dev: u32, inum: Inum) -> Result<Iref> {
    loop {
        let existing = fs.icache.inner.map.lock().get(&(dev, inum)).cloned();
        if let Some(arc) = existing {
            let ip = Iref::try_upgrade(arc)?;
            if !ip.is_valid() {
                let mut st = ip.state.lock();
                while !ip.valid.load(Ordering::Acquire) && !ip.is_victim() {
                    ip.cv.wait(&mut st);
                }
                drop(st);
                if ip.is_victim() && !ip.is_valid() {
                    return Err(FsError::Retry);
                }
            }
            return Ok(ip);
        }

        // Allocate a fresh cache slot, locked for write and not yet valid.
        let fresh = Arc::new(Inode::new(dev, inum, Arc::downgrade(&fs.icache.inner)));
        {
            let mut st = fresh.state.lock();
            st.busy = true;
            st.readbusy = 1;
        }

        {
            let mut map = fs.icache.inner.map.lock();
            if map.contains_key(&(dev, inum)) {
                // Lost the insertion race; the unreferenced slot just drops.
                continue;
            }
            map.insert((dev, inum), Arc::clone(&fresh));
        }

        let ip = Iref::adopt(fresh);
        if let Err(err) = ip.load_from_disk(fs) {
            // Poison the slot so waiting peers retry instead of hanging.
            let st = ip.state.lock();
            ip.victim.store(true, Ordering::SeqCst);
            ip.cv.notify_all();
            drop(st);
            fs.icache.inner.map.lock().remove(&(dev, inum));
            ip.unlock();
            return Err(err);
        }
        ip.unlock();
        return Ok(ip);
    }
}

/// Claim one candidate slot: load it and CAS its type from `Free`.
fn try_ialloc(fs: &FsContext, dev: u32, inum: Inum, itype: InodeType) -> Result<Option<Iref>> {
    let ip = iget(fs, dev, inum)?;
    if !ip.try_claim_type(itype) {
        return Ok(None);
    }

    ip.lock(LockKind::Write);
    {
        let mut meta = ip.meta();
        meta.gen += 1;
        assert!(
            meta.nlink == 0 && meta.size == 0 && meta.addrs.iter().all(|a| *a == 0),
            "ialloc: freshly claimed inode {inum} not zeroed"
        );
    }
    Ok(Some(ip))
}

/// Allocate a new inode of the given type. Returns a handle locked for
/// write, with `gen` already bumped.
///
/// Scans the inum space linearly starting just past this thread's last
/// allocation, wrapping once; inum 0 is reserved. A full scan without a free
/// slot reports `OutOfInodes`.
pub fn ialloc(fs: &FsContext, dev: u32, itype: InodeType) -> Result<Iref> {
    let ninodes = fs.ninodes();
    let start = (fs.hints.last().0 + 1) % ninodes;

    for step in 0..ninodes {
        let inum = Inum((start + step) % ninodes);
        if inum.0 == 0 {
            continue;
        }
        if let Some(ip) = try_ialloc(fs, dev, inum, itype)? {
            fs.hints.record(inum);
            debug!(target: "slatefs::inode", %inum, ?itype, gen = ip.meta().gen, "inode allocated");
            return Ok(ip);
        }
    }

    warn!(target: "slatefs::inode", ninodes, "inum space exhausted");
    Err(FsError::OutOfInodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_block::MemBlockDevice;
    use slate_types::{DINODE_SIZE, data_start};

    pub(crate) const TEST_BLOCKS: u32 = 2048;
    pub(crate) const TEST_NINODES: u32 = 64;

    /// Hand-format a minimal image: superblock, zeroed inode table, root
    /// directory inode, metadata blocks marked in the bitmap.
    pub(crate) fn format_minimal(device: &MemBlockDevice) {
        let dstart = data_start(TEST_BLOCKS, TEST_NINODES);

        let sb = Superblock {
            size: TEST_BLOCKS,
            nblocks: TEST_BLOCKS - dstart.0,
            ninodes: TEST_NINODES,
            reclaim_inodes: Vec::new(),
        };
        let mut block = vec![0_u8; BSIZE];
        sb.encode(&mut block);
        device.write_block(SUPERBLOCK_BLOCK, &block).unwrap();

        let mut root = Dinode::zeroed();
        root.itype = InodeType::Dir;
        root.nlink = 1;
        root.gen = 1;
        let mut block = vec![0_u8; BSIZE];
        let off = Dinode::offset_in_block(ROOTINO);
        root.encode(&mut block[off..off + DINODE_SIZE]);
        device.write_block(iblock(ROOTINO), &block).unwrap();

        // Metadata blocks are in use; everything at data_start and beyond is
        // free.
        let mut bitmap = vec![0_u8; BSIZE];
        for b in 0..dstart.0 as usize {
            bitmap[b / 8] |= 1 << (b % 8);
        }
        device
            .write_block(slate_types::bblock(BlockNo(0), TEST_NINODES), &bitmap)
            .unwrap();
    }

    pub(crate) fn open_test_fs() -> Arc<FsContext> {
        let device = MemBlockDevice::new(TEST_BLOCKS);
        format_minimal(&device);
        FsContext::open(Arc::new(device), 1).unwrap()
    }

    #[test]
    fn open_seeds_free_view_and_root() {
        let fs = open_test_fs();
        let dstart = data_start(TEST_BLOCKS, TEST_NINODES);
        assert_eq!(fs.blocks.free_count(), (TEST_BLOCKS - dstart.0) as usize);

        let root = fs.root();
        assert_eq!(root.inum, ROOTINO);
        assert_eq!(root.itype(), InodeType::Dir);
    }

    #[test]
    fn iget_is_idempotent_per_key() {
        let fs = open_test_fs();
        let a = iget(&fs, 1, Inum(5)).unwrap();
        let b = iget(&fs, 1, Inum(5)).unwrap();
        assert!(std::ptr::eq(
            std::ptr::from_ref::<Inode>(&a),
            std::ptr::from_ref::<Inode>(&b)
        ));
        assert_eq!(a.itype(), InodeType::Free);
    }

    #[test]
    fn lock_protocol_excludes_writers() {
        let fs = open_test_fs();
        let ip = iget(&fs, 1, Inum(3)).unwrap();

        ip.lock(LockKind::Read);
        ip.lock(LockKind::Read); // readers stack
        ip.unlock();
        ip.unlock();

        ip.lock(LockKind::Write);
        let writer_blocked = {
            let ip2 = ip.clone();
            std::thread::spawn(move || {
                ip2.lock(LockKind::Write);
                ip2.unlock();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!writer_blocked.is_finished());
        ip.unlock();
        writer_blocked.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn unlocking_an_unlocked_inode_is_fatal() {
        let fs = open_test_fs();
        let ip = iget(&fs, 1, Inum(3)).unwrap();
        ip.unlock();
    }

    #[test]
    fn ialloc_claims_bumps_gen_and_locks() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        assert_eq!(ip.itype(), InodeType::File);
        assert_eq!(ip.meta().gen, 1);
        // Returned locked for write.
        ip.unlock();
    }

    #[test]
    fn ialloc_skips_claimed_slots() {
        let fs = open_test_fs();
        let a = ialloc(&fs, 1, InodeType::File).unwrap();
        let b = ialloc(&fs, 1, InodeType::File).unwrap();
        assert_ne!(a.inum, b.inum);
        a.unlock();
        b.unlock();
    }

    #[test]
    fn ialloc_exhausts_cleanly() {
        let fs = open_test_fs();
        let mut held = Vec::new();
        // Claim every slot except inum 0 (reserved) and 1 (root, already a
        // directory on disk).
        for _ in 0..TEST_NINODES - 2 {
            let ip = ialloc(&fs, 1, InodeType::File).unwrap();
            ip.unlock();
            held.push(ip);
        }
        assert!(matches!(
            ialloc(&fs, 1, InodeType::File),
            Err(FsError::OutOfInodes)
        ));
    }

    #[test]
    fn link_count_carries_a_self_reference() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        ip.unlock();
        let before = ip.ref_count();
        ip.link();
        assert_eq!(ip.ref_count(), before + 1);
        ip.link();
        assert_eq!(ip.ref_count(), before + 1);
        ip.unlink();
        assert_eq!(ip.ref_count(), before + 1);
        ip.unlink();
        assert_eq!(ip.ref_count(), before);
    }

    #[test]
    fn victimization_removes_the_cache_entry() {
        let fs = open_test_fs();
        let inum = {
            let ip = iget(&fs, 1, Inum(9)).unwrap();
            assert!(fs.icache.contains(1, ip.inum));
            // A free inode holds only the liveness reference beyond ours.
            ip.release_liveness();
            ip.inum
        };
        // Handle dropped: the entry must be gone.
        assert!(!fs.icache.contains(1, inum));

        // A later iget builds a fresh, non-victim handle.
        let again = iget(&fs, 1, inum).unwrap();
        assert!(!again.is_victim());
    }

    #[test]
    fn concurrent_lookup_and_victimization_never_resurrect() {
        // Scenario: thread A drops the last reference while thread B looks
        // the inode up. B must either get a fresh handle or Retry.
        for _ in 0..200 {
            let fs = open_test_fs();
            let ip = iget(&fs, 1, Inum(7)).unwrap();
            ip.release_liveness();

            let fs2 = Arc::clone(&fs);
            let dropper = std::thread::spawn(move || drop(ip));
            let lookup = std::thread::spawn(move || -> Result<bool> {
                match iget(&fs2, 1, Inum(7)) {
                    Ok(h) => {
                        assert!(!h.is_victim(), "resurrected a victim handle");
                        Ok(true)
                    }
                    Err(FsError::Retry) => Ok(false),
                    Err(e) => Err(e),
                }
            });

            dropper.join().unwrap();
            lookup.join().unwrap().unwrap();
        }
    }

    #[test]
    fn dir_entries_overlay_semantics() {
        let mut dir = DirEntries::new();
        let foo = DirName::new(b"foo").unwrap();
        assert!(dir.insert(foo, DirEntryInfo { inum: 4, offset: 0 }));
        assert!(!dir.insert(foo, DirEntryInfo { inum: 5, offset: 16 }));
        assert_eq!(dir.lookup(&foo).unwrap().inum, 4);

        dir.replace(foo, DirEntryInfo { inum: 0, offset: 0 });
        assert_eq!(dir.lookup(&foo).unwrap().inum, 0);
        assert!(dir.remove(&foo));
        assert!(!dir.remove(&foo));
        assert!(dir.is_empty());
    }
}
