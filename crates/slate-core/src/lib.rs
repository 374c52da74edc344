#![forbid(unsafe_code)]
//! Top of the core: formatting, mounting, transaction commit, and deferred
//! inode reclamation.
//!
//! The mutation protocol every caller follows: open a transaction with
//! `fs.journal.begin()`, run core operations against it, then [`commit_tx`]
//! (which stages the on-disk bitmap updates and appends to the journal) and
//! eventually [`flush_journal`] (which writes everything home in order and
//! only then releases delayed-freed blocks for reuse).

use slate_alloc::commit_bitmap;
use slate_block::BlockDevice;
use slate_error::{FsError, Result};
use slate_inode::data::{itrunc, iupdate};
use slate_inode::{FsContext, Iref, LockKind, ialloc, iget};
use slate_journal::Transaction;
use slate_ondisk::{Dinode, InodeType, Superblock};
use slate_types::{
    BSIZE, BlockNo, DINODE_SIZE, DirName, Inum, ROOTINO, SUPERBLOCK_BLOCK, bitmap_blocks,
    data_start, iblock, inode_table_blocks,
};
use std::sync::Arc;
use tracing::{debug, info};

pub use slate_inode::data;

// ── mkfs ────────────────────────────────────────────────────────────────────

/// Write a fresh filesystem onto `device`: superblock, zeroed inode table,
/// root directory inode, and a bitmap with the metadata blocks pre-marked.
pub fn format(device: &dyn BlockDevice, ninodes: u32) -> Result<()> {
    let size = device.block_count();
    let dstart = data_start(size, ninodes);
    if ninodes == 0 || dstart.0 >= size {
        return Err(FsError::InvalidArgument(
            "device too small for the requested inode count",
        ));
    }

    let sb = Superblock {
        size,
        nblocks: size - dstart.0,
        ninodes,
        reclaim_inodes: Vec::new(),
    };
    let mut block = vec![0_u8; BSIZE];
    sb.encode(&mut block);
    device.write_block(SUPERBLOCK_BLOCK, &block)?;

    // Inode table: all slots free, except the root directory.
    let zero = vec![0_u8; BSIZE];
    for b in 0..inode_table_blocks(ninodes) {
        device.write_block(BlockNo(2 + b), &zero)?;
    }
    let mut root = Dinode::zeroed();
    root.itype = InodeType::Dir;
    root.nlink = 1;
    root.gen = 1;
    let mut block = vec![0_u8; BSIZE];
    let off = Dinode::offset_in_block(ROOTINO);
    root.encode(&mut block[off..off + DINODE_SIZE]);
    device.write_block(iblock(ROOTINO), &block)?;

    // Bitmap: boot, superblock, inode table, and the bitmap itself are in
    // use; the data region is free.
    let bitmap_start = 2 + inode_table_blocks(ninodes);
    for index in 0..bitmap_blocks(size) {
        let mut block = vec![0_u8; BSIZE];
        let base = index * (BSIZE as u32 * 8);
        for bi in 0..(BSIZE * 8) {
            let bno = base + bi as u32;
            if bno >= dstart.0 {
                break;
            }
            block[bi / 8] |= 1 << (bi % 8);
        }
        device.write_block(BlockNo(bitmap_start + index), &block)?;
    }

    device.sync()?;
    info!(
        target: "slatefs::core",
        size,
        ninodes,
        data_start = dstart.0,
        "device formatted"
    );
    Ok(())
}

/// Open the filesystem on `device` and drain any deferred-reclaim queue
/// left by a previous mount.
pub fn mount(device: Arc<dyn BlockDevice>, dev: u32) -> Result<Arc<FsContext>> {
    let fs = FsContext::open(device, dev)?;
    let reclaimed = process_reclaim_queue(&fs)?;
    if reclaimed > 0 {
        info!(target: "slatefs::core", reclaimed, "drained reclaim queue at mount");
    }
    Ok(fs)
}

// ── Transaction commit ──────────────────────────────────────────────────────

/// Prepare and commit a transaction: fold its allocated/freed block lists
/// into on-disk bitmap updates (sorted, one buffer per bitmap block), then
/// append it to the journal.
pub fn commit_tx(fs: &FsContext, tx: Transaction) -> Result<()> {
    let (allocated, freed) = tx.take_bitmap_intents();
    if !allocated.is_empty() {
        commit_bitmap(&fs.cache, fs.dev, fs.ninodes(), allocated, &tx, true)?;
    }
    if !freed.is_empty() {
        commit_bitmap(&fs.cache, fs.dev, fs.ninodes(), freed, &tx, false)?;
    }
    fs.journal.append(tx);
    Ok(())
}

/// Flush the journal (the fsync path) and release the blocks whose frees
/// were delayed until their transactions became durable.
pub fn flush_journal(fs: &FsContext) -> Result<()> {
    let reusable = fs.journal.flush(&fs.cache)?;
    for bno in reusable {
        fs.blocks.free(bno);
    }
    Ok(())
}

// ── Deferred inode reclamation ──────────────────────────────────────────────

/// Rewrite the superblock block (reclaim queue included) through the cache.
fn write_superblock(fs: &FsContext) -> Result<()> {
    let sb = fs.superblock(true);
    let buf = fs.cache.get(fs.dev, SUPERBLOCK_BLOCK, false)?;
    sb.encode(&mut buf.write());
    buf.writeback()
}

/// Queue an unlinked-but-open inode for reclamation by a later mount.
///
/// Returns `false` when the superblock array is full; the caller must then
/// reclaim inline instead of deferring.
pub fn defer_inode_reclaim(fs: &FsContext, inum: Inum) -> Result<bool> {
    if !fs.push_reclaim(inum) {
        return Ok(false);
    }
    write_superblock(fs)?;
    debug!(target: "slatefs::core", %inum, "inode queued for deferred reclaim");
    Ok(true)
}

/// Free one on-disk inode: truncate its data away, clear its type, flush
/// the record, and release the in-memory liveness reference so the cache
/// entry can victimize once the last handle drops.
pub fn reclaim_inode(fs: &FsContext, inum: Inum, tx: &Transaction) -> Result<()> {
    let ip = iget(fs, fs.dev, inum)?;
    ip.lock(LockKind::Write);
    itrunc(fs, &ip, 0, tx)?;
    ip.set_itype(InodeType::Free);
    iupdate(fs, &ip, Some(tx))?;
    ip.unlock();
    ip.release_liveness();
    debug!(target: "slatefs::core", %inum, "inode reclaimed");
    Ok(())
}

/// Reclaim every inode in the superblock queue inside one transaction,
/// then persist the emptied queue.
pub fn process_reclaim_queue(fs: &FsContext) -> Result<usize> {
    let queue = fs.take_reclaim();
    if queue.is_empty() {
        return Ok(0);
    }

    let tx = fs.journal.begin();
    for inum in &queue {
        reclaim_inode(fs, *inum, &tx)?;
    }
    commit_tx(fs, tx)?;
    flush_journal(fs)?;
    write_superblock(fs)?;
    Ok(queue.len())
}

// ── Namespace glue ──────────────────────────────────────────────────────────

/// Allocate an inode of `itype` and link it into `dp` under `name`.
///
/// This is the minimal create path: claim the slot, record the new inum on
/// the transaction, persist the claimed record, then add the directory
/// entry (which takes the link count to one).
pub fn create(
    fs: &FsContext,
    dp: &Iref,
    name: DirName,
    itype: InodeType,
    tx: &Transaction,
) -> Result<Iref> {
    let ip = ialloc(fs, fs.dev, itype)?;
    tx.log_new_file(ip.inum);
    iupdate(fs, &ip, Some(tx))?;
    ip.unlock();

    dp.lock(LockKind::Write);
    let linked = slate_dir::dirlink(fs, dp, name, ip.inum, false, tx);
    dp.unlock();
    linked?;

    // The link count changed after the first record write.
    iupdate(fs, &ip, Some(tx))?;
    Ok(ip)
}

/// Remove `name` from `dp`, dropping the target's link count. Returns the
/// target handle so the caller can decide between inline and deferred
/// reclamation when the count reached zero.
pub fn remove(fs: &FsContext, dp: &Iref, name: DirName, tx: &Transaction) -> Result<Iref> {
    dp.lock(LockKind::Write);
    let result: Result<Iref> = (|| {
        let ip = slate_dir::dirlookup(fs, dp, name)?
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        slate_dir::dirunlink(fs, dp, name, ip.inum, false, tx)?;
        iupdate(fs, &ip, Some(tx))?;
        Ok(ip)
    })();
    dp.unlock();
    result
}
