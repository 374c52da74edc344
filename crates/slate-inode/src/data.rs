//! Inode contents: block address resolution, truncation, byte-range I/O,
//! and metadata writeback.
//!
//! The data associated with an inode lives in a sequence of blocks. The
//! first `NDIRECT` are listed in `addrs` directly; the next `NINDIRECT` in
//! the block at `addrs[NDIRECT]`; the next `NINDIRECT²` doubly-indirect from
//! `addrs[NDIRECT + 1]`. The map is dense from block 0: sparsity beyond the
//! live size is prohibited, which is what lets truncation stop at the first
//! null pointer.

use crate::{FsContext, Iref};
use slate_alloc::{alloc_block, free_block};
use slate_error::{FsError, Result};
use slate_journal::{AddToTransaction, Transaction};
use slate_ondisk::Dinode;
use slate_types::{
    BSIZE, BlockNo, DINODE_SIZE, MAXFILE, NDIRECT, NINDIRECT, block_round_up, iblock, read_le_u32,
    write_le_u32,
};
use tracing::warn;

/// Maximum file size in bytes.
const MAXBYTES: u64 = MAXFILE as u64 * BSIZE as u64;

// ── bmap ────────────────────────────────────────────────────────────────────

/// Resolve the `bn`th logical block of `ip` to a physical block, allocating
/// on demand.
///
/// Index blocks are always zeroed on allocation (their contents are block
/// pointers); data blocks are zeroed only when `zero_on_alloc` asks for it.
/// An index block is attached to the transaction only when modified, and
/// only *after* the pointee it now references was recorded, so replay never
/// applies a pointer without its target.
///
/// The caller must hold the write lock when allocation may occur.
pub fn bmap(
    fs: &FsContext,
    ip: &Iref,
    bn: u32,
    tx: Option<&Transaction>,
    zero_on_alloc: bool,
) -> Result<BlockNo> {
    let mut bn = bn as usize;

    if bn < NDIRECT {
        let cur = ip.meta().addrs[bn];
        if cur != 0 {
            return Ok(BlockNo(cur));
        }
        let fresh = alloc_block(&fs.blocks, &fs.cache, ip.dev, tx, zero_on_alloc)?;
        ip.meta().addrs[bn] = fresh.0;
        return Ok(fresh);
    }
    bn -= NDIRECT;

    if bn < NINDIRECT {
        let ind = ensure_index_block(fs, ip, NDIRECT, tx)?;
        let buf = fs.cache.get(ip.dev, ind, false)?;
        let mut guard = buf.write();

        let slot = read_le_u32(&guard, bn * 4);
        if slot != 0 {
            return Ok(BlockNo(slot));
        }
        let fresh = alloc_block(&fs.blocks, &fs.cache, ip.dev, tx, zero_on_alloc)?;
        write_le_u32(&mut guard, bn * 4, fresh.0);
        if let Some(tx) = tx {
            guard.add_to_transaction(tx);
        }
        return Ok(fresh);
    }
    bn -= NINDIRECT;

    assert!(bn < NINDIRECT * NINDIRECT, "bmap: block {bn} out of range");

    let l1 = ensure_index_block(fs, ip, NDIRECT + 1, tx)?;
    let buf1 = fs.cache.get(ip.dev, l1, false)?;
    let mut guard1 = buf1.write();

    let mut l2 = read_le_u32(&guard1, (bn / NINDIRECT) * 4);
    if l2 == 0 {
        let fresh = alloc_block(&fs.blocks, &fs.cache, ip.dev, tx, true)?;
        write_le_u32(&mut guard1, (bn / NINDIRECT) * 4, fresh.0);
        if let Some(tx) = tx {
            guard1.add_to_transaction(tx);
        }
        l2 = fresh.0;
    }

    let buf2 = fs.cache.get(ip.dev, BlockNo(l2), false)?;
    let mut guard2 = buf2.write();

    let slot = read_le_u32(&guard2, (bn % NINDIRECT) * 4);
    if slot != 0 {
        return Ok(BlockNo(slot));
    }
    let fresh = alloc_block(&fs.blocks, &fs.cache, ip.dev, tx, zero_on_alloc)?;
    write_le_u32(&mut guard2, (bn % NINDIRECT) * 4, fresh.0);
    if let Some(tx) = tx {
        guard2.add_to_transaction(tx);
    }
    Ok(fresh)
}

/// Lazily allocate the index block in address slot `slot` (always zeroed).
fn ensure_index_block(
    fs: &FsContext,
    ip: &Iref,
    slot: usize,
    tx: Option<&Transaction>,
) -> Result<BlockNo> {
    let cur = ip.meta().addrs[slot];
    if cur != 0 {
        return Ok(BlockNo(cur));
    }
    let fresh = alloc_block(&fs.blocks, &fs.cache, ip.dev, tx, true)?;
    ip.meta().addrs[slot] = fresh.0;
    Ok(fresh)
}

// ── itrunc ──────────────────────────────────────────────────────────────────

/// Remove every block of `ip` beyond `offset` (rounded up to a block
/// boundary); blocks wholly inside `[0, offset)` survive.
///
/// Data blocks are freed in delayed mode so they stay unavailable until the
/// transaction commits. An index block is freed only when no pointer inside
/// it is retained; a retained index block is re-logged with its partly
/// zeroed contents. Sets `size = offset`; `iupdate` is the caller's job.
///
/// Caller holds the write lock.
pub fn itrunc(fs: &FsContext, ip: &Iref, offset: u64, tx: &Transaction) -> Result<()> {
    let mut meta = ip.meta();

    if meta.size <= offset || offset >= MAXBYTES {
        return Ok(());
    }

    // Everything from bn (inclusive) to the end of the file goes away;
    // appends will occur at `offset` afterwards.
    let bn = block_round_up(offset) as usize;

    #[derive(PartialEq, PartialOrd)]
    enum Stage {
        Direct,
        Indirect,
        DblIndirect,
    }

    let (stage, mut start_index) = if bn < NDIRECT {
        (Stage::Direct, bn)
    } else if bn < NDIRECT + NINDIRECT {
        (Stage::Indirect, bn - NDIRECT)
    } else {
        (Stage::DblIndirect, bn - NDIRECT - NINDIRECT)
    };

    'stages: {
        if stage == Stage::Direct {
            for i in start_index..NDIRECT {
                if meta.addrs[i] == 0 {
                    break;
                }
                free_block(&fs.blocks, BlockNo(meta.addrs[i]), Some(tx), true);
                meta.addrs[i] = 0;
            }
            start_index = 0;
        }

        if stage <= Stage::Indirect {
            if meta.addrs[NDIRECT] == 0 {
                // Dense map: no indirect block means nothing doubly-indirect
                // either.
                break 'stages;
            }

            let buf = fs.cache.get(ip.dev, BlockNo(meta.addrs[NDIRECT]), false)?;
            {
                let mut guard = buf.write();
                for i in start_index..NINDIRECT {
                    let a = read_le_u32(&guard, i * 4);
                    if a == 0 {
                        break;
                    }
                    free_block(&fs.blocks, BlockNo(a), Some(tx), true);
                    write_le_u32(&mut guard, i * 4, 0);
                }
                if start_index != 0 {
                    guard.add_to_transaction(tx);
                }
            }

            if start_index == 0 {
                free_block(&fs.blocks, BlockNo(meta.addrs[NDIRECT]), Some(tx), true);
                meta.addrs[NDIRECT] = 0;
            }
            start_index = 0;
        }

        if meta.addrs[NDIRECT + 1] == 0 {
            break 'stages;
        }

        let buf1 = fs.cache.get(ip.dev, BlockNo(meta.addrs[NDIRECT + 1]), false)?;
        {
            let mut guard1 = buf1.write();
            let mut begin = start_index;

            for i in (begin / NINDIRECT)..NINDIRECT {
                let l2 = read_le_u32(&guard1, i * 4);
                if l2 == 0 {
                    break;
                }

                let buf2 = fs.cache.get(ip.dev, BlockNo(l2), false)?;
                {
                    let mut guard2 = buf2.write();
                    for j in (begin % NINDIRECT)..NINDIRECT {
                        let a = read_le_u32(&guard2, j * 4);
                        if a == 0 {
                            break;
                        }
                        free_block(&fs.blocks, BlockNo(a), Some(tx), true);
                        write_le_u32(&mut guard2, j * 4, 0);
                    }
                    if begin % NINDIRECT != 0 {
                        guard2.add_to_transaction(tx);
                    }
                }

                if begin % NINDIRECT == 0 {
                    free_block(&fs.blocks, BlockNo(l2), Some(tx), true);
                    write_le_u32(&mut guard1, i * 4, 0);
                }

                // Only the first second-level block starts mid-way; later
                // ones are wiped from their beginning.
                begin = 0;
            }

            if start_index != 0 {
                guard1.add_to_transaction(tx);
            }
        }

        if start_index == 0 {
            free_block(&fs.blocks, BlockNo(meta.addrs[NDIRECT + 1]), Some(tx), true);
            meta.addrs[NDIRECT + 1] = 0;
        }
    }

    if offset == 0 {
        assert!(
            meta.addrs.iter().all(|a| *a == 0),
            "itrunc: residue after truncate to zero"
        );
    }

    meta.size = offset;
    Ok(())
}

// ── readi / writei ──────────────────────────────────────────────────────────

/// Read up to `dst.len()` bytes at byte offset `off`.
///
/// May be called without the write lock: a concurrent writer only touches
/// dirty blocks, and readers of dirty blocks are satisfied above this layer,
/// so a concurrent `readi`/`writei` pair touches disjoint block sets.
pub fn readi(fs: &FsContext, ip: &Iref, dst: &mut [u8], off: u64) -> Result<usize> {
    if ip.itype() == slate_ondisk::InodeType::Dev {
        return Err(FsError::InvalidArgument("readi on a device inode"));
    }

    let size = ip.meta().size;
    if off > size {
        return Err(FsError::InvalidArgument("readi offset beyond end of file"));
    }
    let n = dst.len().min((size - off) as usize);

    let mut tot = 0_usize;
    while tot < n {
        let pos = off + tot as u64;
        let bno = match bmap(fs, ip, (pos / BSIZE as u64) as u32, None, true) {
            Ok(bno) => bno,
            // Reads never legitimately exhaust the allocator.
            Err(FsError::OutOfBlocks) => panic!("readi: out of blocks"),
            Err(err) => return Err(err),
        };
        let buf = fs.cache.get(ip.dev, bno, false)?;

        let in_block = (pos % BSIZE as u64) as usize;
        let m = (n - tot).min(BSIZE - in_block);
        dst[tot..tot + m].copy_from_slice(&buf.read()[in_block..in_block + m]);
        tot += m;
    }
    Ok(n)
}

/// Write `src` at byte offset `off`, staging modified blocks into `tx` (or
/// writing them back asynchronously outside the journal when `writeback`).
///
/// Returns the number of bytes written: short when the allocator runs dry
/// mid-write, clamped at the maximum file size. The caller updates `size`
/// once via [`update_size`] after all data is staged.
///
/// Caller holds the write lock.
pub fn writei(
    fs: &FsContext,
    ip: &Iref,
    src: &[u8],
    off: u64,
    tx: Option<&Transaction>,
    writeback: bool,
) -> Result<usize> {
    if ip.itype() == slate_ondisk::InodeType::Dev {
        return Err(FsError::InvalidArgument("writei on a device inode"));
    }

    let n = src.len().min(MAXBYTES.saturating_sub(off) as usize);

    let mut tot = 0_usize;
    while tot < n {
        let pos = off + tot as u64;
        let in_block = (pos % BSIZE as u64) as usize;
        let m = (n - tot).min(BSIZE - in_block);

        // A whole-block overwrite never needs the old contents: skip the
        // disk read and the allocation-time zeroing alike.
        let skip_disk_read = in_block == 0 && m == BSIZE;

        let bno = match bmap(fs, ip, (pos / BSIZE as u64) as u32, tx, !skip_disk_read) {
            Ok(bno) => bno,
            Err(FsError::OutOfBlocks) => {
                warn!(target: "slatefs::inode", inum = %ip.inum, written = tot, "writei: out of blocks");
                if tot == 0 {
                    return Err(FsError::OutOfBlocks);
                }
                break;
            }
            Err(err) => return Err(err),
        };

        let buf = fs.cache.get(ip.dev, bno, skip_disk_read)?;
        {
            let mut guard = buf.write();
            guard[in_block..in_block + m].copy_from_slice(&src[tot..tot + m]);
            // Capture this exact version under the write lock so the
            // transaction logs the bytes just produced.
            if !writeback {
                if let Some(tx) = tx {
                    guard.add_to_transaction(tx);
                }
            }
        }
        if writeback {
            buf.writeback_async();
        }

        tot += m;
    }
    Ok(tot)
}

// ── Metadata writeback ──────────────────────────────────────────────────────

/// Serialize the in-memory inode fields into the inode table and stage the
/// block into `tx`.
///
/// Batch field changes and call this once; every call copies the record
/// under the table block's write lock.
pub fn iupdate(fs: &FsContext, ip: &Iref, tx: Option<&Transaction>) -> Result<()> {
    let di = {
        let meta = ip.meta();
        Dinode {
            itype: ip.itype(),
            major: meta.major,
            minor: meta.minor,
            nlink: meta.nlink,
            size: meta.size,
            gen: meta.gen,
            addrs: meta.addrs,
        }
    };

    let buf = fs.cache.get(ip.dev, iblock(ip.inum), false)?;
    let mut guard = buf.write();
    let off = Dinode::offset_in_block(ip.inum);
    di.encode(&mut guard[off..off + DINODE_SIZE]);

    if let Some(tx) = tx {
        guard.add_to_transaction(tx);
    }
    Ok(())
}

/// Record the final size after a batch of `writei` calls and flush the
/// inode record.
pub fn update_size(fs: &FsContext, ip: &Iref, size: u64, tx: Option<&Transaction>) -> Result<()> {
    ip.meta().size = size;
    iupdate(fs, ip, tx)
}

/// Drop the (clean) buffer-cache entries backing this inode's blocks.
///
/// Direct blocks are dropped unconditionally. An index block is walked only
/// if it is itself already cached: if it isn't, none of the blocks it points
/// to are either, and reading it in just to evict would defeat the point.
///
/// Caller holds at least the read lock.
pub fn drop_bufcache(fs: &FsContext, ip: &Iref) -> Result<()> {
    let addrs = ip.meta().addrs;

    for a in addrs.iter().take(NDIRECT) {
        if *a != 0 {
            fs.cache.put(ip.dev, BlockNo(*a));
        }
    }

    if addrs[NDIRECT] != 0 && fs.cache.in_bufcache(ip.dev, BlockNo(addrs[NDIRECT])) {
        let buf = fs.cache.get(ip.dev, BlockNo(addrs[NDIRECT]), false)?;
        {
            let guard = buf.read();
            for i in 0..NINDIRECT {
                let a = read_le_u32(&guard, i * 4);
                if a != 0 {
                    fs.cache.put(ip.dev, BlockNo(a));
                }
            }
        }
        fs.cache.put(ip.dev, BlockNo(addrs[NDIRECT]));
    }

    if addrs[NDIRECT + 1] != 0 && fs.cache.in_bufcache(ip.dev, BlockNo(addrs[NDIRECT + 1])) {
        let buf1 = fs.cache.get(ip.dev, BlockNo(addrs[NDIRECT + 1]), false)?;
        {
            let guard1 = buf1.read();
            for i in 0..NINDIRECT {
                let l2 = read_le_u32(&guard1, i * 4);
                if l2 == 0 || !fs.cache.in_bufcache(ip.dev, BlockNo(l2)) {
                    continue;
                }
                let buf2 = fs.cache.get(ip.dev, BlockNo(l2), false)?;
                {
                    let guard2 = buf2.read();
                    for j in 0..NINDIRECT {
                        let a = read_le_u32(&guard2, j * 4);
                        if a != 0 {
                            fs.cache.put(ip.dev, BlockNo(a));
                        }
                    }
                }
                fs.cache.put(ip.dev, BlockNo(l2));
            }
        }
        fs.cache.put(ip.dev, BlockNo(addrs[NDIRECT + 1]));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::open_test_fs;
    use crate::{LockKind, ialloc};
    use slate_ondisk::InodeType;

    #[test]
    fn bmap_is_stable() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        let a = bmap(&fs, &ip, 0, Some(&tx), true).unwrap();
        let b = bmap(&fs, &ip, 0, Some(&tx), true).unwrap();
        assert_eq!(a, b);
        ip.unlock();
    }

    #[test]
    fn last_direct_byte_stays_direct() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        let n = writei(
            &fs,
            &ip,
            b"x",
            NDIRECT as u64 * BSIZE as u64 - 1,
            Some(&tx),
            false,
        )
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(ip.meta().addrs[NDIRECT], 0);

        // One byte past it allocates the single-indirect index.
        let n = writei(&fs, &ip, b"y", NDIRECT as u64 * BSIZE as u64, Some(&tx), false).unwrap();
        assert_eq!(n, 1);
        assert_ne!(ip.meta().addrs[NDIRECT], 0);
        assert_eq!(ip.meta().addrs[NDIRECT + 1], 0);
        ip.unlock();
    }

    #[test]
    fn first_doubly_indirect_byte_allocates_the_top_index() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        let off = (NDIRECT + NINDIRECT) as u64 * BSIZE as u64;
        let n = writei(&fs, &ip, b"z", off, Some(&tx), false).unwrap();
        assert_eq!(n, 1);
        assert_ne!(ip.meta().addrs[NDIRECT + 1], 0);
        ip.unlock();
    }

    #[test]
    fn write_read_round_trip_after_update_size() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        let n = writei(&fs, &ip, b"hello", 0, Some(&tx), false).unwrap();
        assert_eq!(n, 5);
        update_size(&fs, &ip, 5, Some(&tx)).unwrap();
        ip.unlock();

        let mut out = [0_u8; 16];
        let n = readi(&fs, &ip, &mut out, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn readi_clamps_to_size_and_rejects_past_end() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();
        writei(&fs, &ip, b"abc", 0, Some(&tx), false).unwrap();
        update_size(&fs, &ip, 3, Some(&tx)).unwrap();
        ip.unlock();

        let mut out = [0_u8; 8];
        assert_eq!(readi(&fs, &ip, &mut out, 2).unwrap(), 1);
        assert_eq!(readi(&fs, &ip, &mut out, 3).unwrap(), 0);
        assert!(readi(&fs, &ip, &mut out, 4).is_err());
    }

    #[test]
    fn device_inodes_refuse_byte_io() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::Dev).unwrap();
        let mut out = [0_u8; 4];
        assert!(readi(&fs, &ip, &mut out, 0).is_err());
        assert!(writei(&fs, &ip, b"x", 0, None, false).is_err());
        ip.unlock();
    }

    #[test]
    fn writei_short_writes_when_blocks_run_out() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        // Leave exactly one free block.
        while fs.blocks.free_count() > 1 {
            fs.blocks.alloc().unwrap();
        }

        let data = vec![7_u8; 2 * BSIZE];
        let n = writei(&fs, &ip, &data, 0, Some(&tx), false).unwrap();
        assert_eq!(n, BSIZE);

        // Nothing left at all: the first block fails outright.
        let err = writei(&fs, &ip, &data, 2 * BSIZE as u64, Some(&tx), false).unwrap_err();
        assert!(matches!(err, FsError::OutOfBlocks));
        ip.unlock();
    }

    #[test]
    fn writei_clamps_at_maximum_file_size() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        assert_eq!(writei(&fs, &ip, b"x", MAXBYTES, None, false).unwrap(), 0);
        ip.unlock();
    }

    #[test]
    fn truncate_in_middle_frees_the_indirect_tier() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        let len = (NDIRECT + 2) * BSIZE;
        let data = vec![5_u8; len];
        assert_eq!(writei(&fs, &ip, &data, 0, Some(&tx), false).unwrap(), len);
        update_size(&fs, &ip, len as u64, Some(&tx)).unwrap();

        itrunc(&fs, &ip, NDIRECT as u64 * BSIZE as u64, &tx).unwrap();

        let meta = ip.meta();
        assert_eq!(meta.size, NDIRECT as u64 * BSIZE as u64);
        assert!(meta.addrs.iter().take(NDIRECT).all(|a| *a != 0));
        assert_eq!(meta.addrs[NDIRECT], 0);
        drop(meta);
        ip.unlock();
    }

    #[test]
    fn truncate_to_zero_leaves_no_residue() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        let len = (NDIRECT + NINDIRECT + 3) * BSIZE;
        let data = vec![1_u8; len];
        assert_eq!(writei(&fs, &ip, &data, 0, Some(&tx), false).unwrap(), len);
        update_size(&fs, &ip, len as u64, Some(&tx)).unwrap();

        let free_before = fs.blocks.free_count();
        itrunc(&fs, &ip, 0, &tx).unwrap();

        let meta = ip.meta();
        assert!(meta.addrs.iter().all(|a| *a == 0));
        assert_eq!(meta.size, 0);
        drop(meta);

        // Delayed frees: nothing is reusable until the journal flush.
        assert_eq!(fs.blocks.free_count(), free_before);
        fs.journal.append(tx);
        let reusable = fs.journal.flush(&fs.cache).unwrap();
        // Data blocks + index blocks (1 single-indirect, 1 top, 1 second
        // level) all came back.
        assert_eq!(reusable.len(), len / BSIZE + 3);
        ip.unlock();
    }

    #[test]
    fn truncation_is_a_no_op_at_or_past_size() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();
        writei(&fs, &ip, b"abcd", 0, Some(&tx), false).unwrap();
        update_size(&fs, &ip, 4, Some(&tx)).unwrap();

        itrunc(&fs, &ip, 4, &tx).unwrap();
        itrunc(&fs, &ip, 100, &tx).unwrap();
        assert_eq!(ip.meta().size, 4);
        assert_ne!(ip.meta().addrs[0], 0);
        ip.unlock();
    }

    #[test]
    fn iupdate_round_trips_through_the_inode_table() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        {
            let mut meta = ip.meta();
            meta.nlink = 3;
            meta.size = 1234;
            meta.addrs[0] = 99;
        }
        iupdate(&fs, &ip, None).unwrap();
        ip.unlock();

        let buf = fs.cache.get(1, iblock(ip.inum), false).unwrap();
        let data = buf.read();
        let off = Dinode::offset_in_block(ip.inum);
        let di = Dinode::parse(&data[off..off + DINODE_SIZE], iblock(ip.inum)).unwrap();
        assert_eq!(di.itype, InodeType::File);
        assert_eq!(di.nlink, 3);
        assert_eq!(di.size, 1234);
        assert_eq!(di.addrs[0], 99);
        assert_eq!(di.gen, 1);
    }

    #[test]
    fn repeated_iupdate_is_idempotent() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        iupdate(&fs, &ip, None).unwrap();
        let first = fs.cache.get(1, iblock(ip.inum), false).unwrap().read().to_vec();
        iupdate(&fs, &ip, None).unwrap();
        let second = fs.cache.get(1, iblock(ip.inum), false).unwrap().read().to_vec();
        assert_eq!(first, second);
        ip.unlock();
    }

    #[test]
    fn drop_bufcache_evicts_without_reading() {
        let fs = open_test_fs();
        let ip = ialloc(&fs, 1, InodeType::File).unwrap();
        let tx = fs.journal.begin();

        let len = (NDIRECT + 2) * BSIZE;
        let data = vec![9_u8; len];
        writei(&fs, &ip, &data, 0, Some(&tx), false).unwrap();
        update_size(&fs, &ip, len as u64, Some(&tx)).unwrap();
        ip.unlock();

        let direct0 = BlockNo(ip.meta().addrs[0]);
        let ind = BlockNo(ip.meta().addrs[NDIRECT]);
        assert!(fs.cache.in_bufcache(1, direct0));
        assert!(fs.cache.in_bufcache(1, ind));

        ip.lock(LockKind::Read);
        drop_bufcache(&fs, &ip).unwrap();
        ip.unlock();

        assert!(!fs.cache.in_bufcache(1, direct0));
        assert!(!fs.cache.in_bufcache(1, ind));

        // With the index block no longer cached, a second pass must not pull
        // it back in.
        ip.lock(LockKind::Read);
        drop_bufcache(&fs, &ip).unwrap();
        ip.unlock();
        assert!(!fs.cache.in_bufcache(1, ind));
    }
}
