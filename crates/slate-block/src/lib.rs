#![forbid(unsafe_code)]
//! Block devices and the buffer cache.
//!
//! The buffer cache is a content-addressed map from `(dev, bno)` to
//! refcounted block buffers. Each buffer carries its own read/write lock, so
//! all I/O to a single block is serialized here and nowhere else. Dirty
//! buffers can be written back asynchronously through a background flusher
//! thread, or captured into a transaction under the buffer's write lock.

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use slate_error::{FsError, Result};
use slate_types::{BSIZE, BlockNo};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{error, trace};

// ── Block devices ───────────────────────────────────────────────────────────

/// Block-addressed I/O interface. Blocks are always `BSIZE` bytes.
pub trait BlockDevice: Send + Sync {
    /// Read block `bno` into `buf` (`buf.len()` must equal `BSIZE`).
    fn read_block(&self, bno: BlockNo, buf: &mut [u8]) -> Result<()>;

    /// Write `data` (`BSIZE` bytes) to block `bno`.
    fn write_block(&self, bno: BlockNo, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed device using `pread`/`pwrite` style positioned I/O, which is
/// thread-safe without a shared seek position.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    blocks: u32,
}

impl FileBlockDevice {
    /// Open an existing image file. Its length must be a whole number of
    /// blocks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BSIZE as u64 != 0 {
            return Err(FsError::InvalidArgument(
                "image length is not a multiple of the block size",
            ));
        }
        let blocks = u32::try_from(len / BSIZE as u64)
            .map_err(|_| FsError::InvalidArgument("image larger than 2^32 blocks"))?;
        Ok(Self { file, blocks })
    }

    /// Create (or truncate) an image file of `blocks` blocks.
    pub fn create(path: impl AsRef<Path>, blocks: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(blocks) * BSIZE as u64)?;
        Ok(Self { file, blocks })
    }

    fn byte_offset(&self, bno: BlockNo) -> Result<u64> {
        if bno.0 >= self.blocks {
            return Err(FsError::InvalidArgument("block number out of range"));
        }
        Ok(u64::from(bno.0) * BSIZE as u64)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, bno: BlockNo, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BSIZE);
        let off = self.byte_offset(bno)?;
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    fn write_block(&self, bno: BlockNo, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), BSIZE);
        let off = self.byte_offset(bno)?;
        self.file.write_all_at(data, off)?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sparse in-memory device. Unwritten blocks read as zeros.
///
/// Used by unit tests across the workspace and by the e2e harness.
#[derive(Debug)]
pub struct MemBlockDevice {
    blocks: Mutex<HashMap<u32, Box<[u8]>>>,
    count: u32,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            count,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, bno: BlockNo, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BSIZE);
        if bno.0 >= self.count {
            return Err(FsError::InvalidArgument("block number out of range"));
        }
        match self.blocks.lock().get(&bno.0) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, bno: BlockNo, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), BSIZE);
        if bno.0 >= self.count {
            return Err(FsError::InvalidArgument("block number out of range"));
        }
        self.blocks.lock().insert(bno.0, data.into());
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

/// One cached block. The embedded rwlock serializes all access to the
/// block's bytes; the dirty flag tracks divergence from the device.
pub struct Buf {
    dev: u32,
    bno: BlockNo,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    shared: Weak<CacheShared>,
}

impl Buf {
    #[must_use]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    #[must_use]
    pub fn bno(&self) -> BlockNo {
        self.bno
    }

    #[must_use]
    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Shared view of the block contents.
    pub fn read(&self) -> BufReadGuard<'_> {
        BufReadGuard {
            inner: self.data.read(),
        }
    }

    /// Exclusive view of the block contents. Acquiring it marks the buffer
    /// dirty; capturing the contents into a transaction marks it clean again.
    pub fn write(&self) -> BufWriteGuard<'_> {
        let inner = self.data.write();
        self.dirty.store(true, Ordering::Release);
        BufWriteGuard { buf: self, inner }
    }

    /// Write this buffer to its home location now, if dirty.
    pub fn writeback(&self) -> Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let data = self.data.read();
        if self.dirty.swap(false, Ordering::AcqRel) {
            trace!(target: "slatefs::block", bno = %self.bno, "writeback");
            shared.dev.write_block(self.bno, &data)?;
        }
        Ok(())
    }

    /// Queue this buffer for the background flusher. The write happens
    /// outside any transaction.
    pub fn writeback_async(self: &Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut queue = shared.flush.state.lock();
        queue.pending.push_back(Arc::clone(self));
        shared.flush.cv.notify_all();
    }

    /// Clear the dirty flag without writing. Used when the current contents
    /// have been captured into a transaction.
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

/// Shared guard over a buffer's bytes.
pub struct BufReadGuard<'a> {
    inner: RwLockReadGuard<'a, Box<[u8]>>,
}

impl BufReadGuard<'_> {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl std::ops::Deref for BufReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

/// Exclusive guard over a buffer's bytes.
///
/// Holding this guard is the only way to mutate a block, which is what makes
/// "capture the exact bytes just produced" possible for transactions.
pub struct BufWriteGuard<'a> {
    buf: &'a Buf,
    inner: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl BufWriteGuard<'_> {
    #[must_use]
    pub fn bno(&self) -> BlockNo {
        self.buf.bno()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Clear the owning buffer's dirty flag while still holding the lock.
    pub fn mark_clean(&self) {
        self.buf.mark_clean();
    }
}

impl std::ops::Deref for BufWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl std::ops::DerefMut for BufWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

struct FlushState {
    pending: VecDeque<Arc<Buf>>,
    inflight: usize,
    shutdown: bool,
}

struct Flusher {
    state: Mutex<FlushState>,
    cv: Condvar,
}

struct CacheShared {
    dev: Arc<dyn BlockDevice>,
    map: Mutex<HashMap<(u32, BlockNo), Arc<Buf>>>,
    flush: Flusher,
}

/// The buffer cache: at most one live buffer per `(dev, bno)`.
pub struct BufCache {
    shared: Arc<CacheShared>,
    flusher: Option<JoinHandle<()>>,
}

impl BufCache {
    /// Build a cache over `dev` and start its background flusher thread.
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let shared = Arc::new(CacheShared {
            dev,
            map: Mutex::new(HashMap::new()),
            flush: Flusher {
                state: Mutex::new(FlushState {
                    pending: VecDeque::new(),
                    inflight: 0,
                    shutdown: false,
                }),
                cv: Condvar::new(),
            },
        });

        let worker = Arc::clone(&shared);
        let flusher = std::thread::Builder::new()
            .name("slate-bflush".into())
            .spawn(move || flusher_main(&worker))
            .expect("spawn buffer-cache flusher");

        Self {
            shared,
            flusher: Some(flusher),
        }
    }

    /// Look up or load the buffer for `(dev, bno)`.
    ///
    /// With `skip_read` the block is not fetched from the device; the caller
    /// is about to overwrite the whole block (or just allocated it).
    pub fn get(&self, dev: u32, bno: BlockNo, skip_read: bool) -> Result<Arc<Buf>> {
        let mut map = self.shared.map.lock();
        if let Some(buf) = map.get(&(dev, bno)) {
            return Ok(Arc::clone(buf));
        }

        let buf = Arc::new(Buf {
            dev,
            bno,
            data: RwLock::new(vec![0_u8; BSIZE].into_boxed_slice()),
            dirty: AtomicBool::new(false),
            shared: Arc::downgrade(&self.shared),
        });

        // Populate under the buffer's own lock so concurrent getters block
        // on the contents, not on the whole map.
        let mut guard = buf.data.write();
        map.insert((dev, bno), Arc::clone(&buf));
        drop(map);

        if !skip_read {
            trace!(target: "slatefs::block", %bno, "cache miss, reading from device");
            if let Err(err) = self.shared.dev.read_block(bno, &mut guard) {
                // Do not leave a zeroed placeholder behind.
                drop(guard);
                self.shared.map.lock().remove(&(dev, bno));
                return Err(err);
            }
        }
        drop(guard);
        Ok(buf)
    }

    /// Non-blocking probe: is `(dev, bno)` currently cached?
    #[must_use]
    pub fn in_bufcache(&self, dev: u32, bno: BlockNo) -> bool {
        self.shared.map.lock().contains_key(&(dev, bno))
    }

    /// Forget the cache entry for `(dev, bno)` without writing anything
    /// back. Outstanding buffer handles stay usable but orphaned.
    pub fn put(&self, dev: u32, bno: BlockNo) {
        self.shared.map.lock().remove(&(dev, bno));
    }

    /// Zero the cached block, optionally scheduling an immediate writeback
    /// (used when clearing journal blocks on disk).
    pub fn zero_block(&self, dev: u32, bno: BlockNo, writeback: bool) -> Result<()> {
        let buf = self.get(dev, bno, true)?;
        buf.write().fill(0);
        if writeback {
            buf.writeback_async();
        }
        Ok(())
    }

    /// Wait for the flusher queue to drain, then sync the device.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.shared.flush.state.lock();
        while !state.pending.is_empty() || state.inflight > 0 {
            self.shared.flush.cv.wait(&mut state);
        }
        drop(state);
        self.shared.dev.sync()
    }

    /// The underlying device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.shared.dev
    }
}

impl Drop for BufCache {
    fn drop(&mut self) {
        {
            let mut state = self.shared.flush.state.lock();
            state.shutdown = true;
            self.shared.flush.cv.notify_all();
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

fn flusher_main(shared: &Arc<CacheShared>) {
    loop {
        let buf = {
            let mut state = shared.flush.state.lock();
            loop {
                if let Some(buf) = state.pending.pop_front() {
                    state.inflight += 1;
                    break buf;
                }
                if state.shutdown {
                    return;
                }
                shared.flush.cv.wait(&mut state);
            }
        };

        if let Err(err) = buf.writeback() {
            error!(target: "slatefs::block", bno = %buf.bno(), %err, "async writeback failed");
        }

        let mut state = shared.flush.state.lock();
        state.inflight -= 1;
        if state.pending.is_empty() && state.inflight == 0 {
            shared.flush.cv.notify_all();
        }
    }
}
