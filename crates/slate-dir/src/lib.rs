#![forbid(unsafe_code)]
//! Directories: an inode whose contents are an array of fixed-size entries.
//!
//! Every directory inode carries an in-memory overlay mapping names to
//! `(inum, offset)`, loaded lazily from the on-disk entry stream. Mutations
//! go through the overlay first and are then flushed as single-entry writes:
//! inserts append at the cursor, deletes overwrite the entry's inum with 0
//! in place. Tombstoned slots are never compacted — the offsets stored in
//! the overlay would go stale.

pub mod path;

pub use path::{namei, nameiparent, skipelem};

use slate_error::{FsError, Result};
use slate_inode::data::{iupdate, readi, writei};
use slate_inode::{DirEntries, DirEntryInfo, FsContext, Iref, iget};
use slate_journal::Transaction;
use slate_ondisk::{DIRENTS_PER_BLOCK, Dirent};
use slate_types::{BSIZE, DIRENT_SIZE, DirName, Inum};
use tracing::debug;

// ── Initial load ────────────────────────────────────────────────────────────

/// Populate the directory overlay from disk. Idempotent; a second call on
/// an initialized directory returns immediately.
///
/// Walks the on-disk entry stream in block-sized chunks, recording every
/// slot with a non-zero inum. The cursor ends at the total scanned length,
/// which is where the next entry will be appended.
pub fn dir_init(fs: &FsContext, dp: &Iref) -> Result<()> {
    if dp.meta().dir.is_some() {
        return Ok(());
    }
    assert!(
        dp.itype().is_dir(),
        "dir_init: inode {} is not a directory",
        dp.inum
    );

    let size = dp.meta().size;
    let mut entries = DirEntries::new();
    let mut dir_offset = 0_u32;

    let mut off = 0_u64;
    while off < size {
        debug_assert_eq!(u64::from(dir_offset), off);
        let bno = match slate_inode::data::bmap(fs, dp, (off / BSIZE as u64) as u32, None, true) {
            Ok(bno) => bno,
            // Scanning existing contents never legitimately allocates.
            Err(FsError::OutOfBlocks) => panic!("dir_init: out of blocks"),
            Err(err) => return Err(err),
        };
        let buf = fs.cache.get(dp.dev, bno, false)?;
        let data = buf.read();

        for slot in 0..DIRENTS_PER_BLOCK {
            if u64::from(dir_offset) >= size {
                break;
            }
            let start = slot * DIRENT_SIZE;
            let de = Dirent::parse(&data[start..start + DIRENT_SIZE], bno)?;
            if !de.is_tombstone() {
                entries.insert(
                    de.name,
                    DirEntryInfo {
                        inum: de.inum,
                        offset: dir_offset,
                    },
                );
            }
            dir_offset += DIRENT_SIZE as u32;
        }
        off += BSIZE as u64;
    }

    let mut meta = dp.meta();
    // A peer may have finished the same scan while this one ran.
    if meta.dir.is_none() {
        debug!(
            target: "slatefs::dir",
            inum = %dp.inum,
            entries = entries.len(),
            cursor = dir_offset,
            "directory overlay loaded"
        );
        meta.dir = Some(entries);
        meta.dir_offset = dir_offset;
    }
    Ok(())
}

// ── Lookup / link / unlink ──────────────────────────────────────────────────

/// Look a name up in a directory. A tombstone counts as absent.
pub fn dirlookup(fs: &FsContext, dp: &Iref, name: DirName) -> Result<Option<Iref>> {
    dir_init(fs, dp)?;

    let info = dp
        .meta()
        .dir
        .as_ref()
        .expect("overlay initialized above")
        .lookup(&name);

    match info {
        None => Ok(None),
        Some(info) if info.inum == 0 => Ok(None),
        Some(info) => Ok(Some(iget(fs, dp.dev, Inum(info.inum))?)),
    }
}

/// Write the overlay's current record for `name` to its on-disk slot and
/// flush the directory inode.
///
/// Caller must hold the write lock on `dp`.
fn dir_flush_entry(fs: &FsContext, dp: &Iref, name: DirName, tx: &Transaction) -> Result<()> {
    let info = dp
        .meta()
        .dir
        .as_ref()
        .and_then(|dir| dir.lookup(&name))
        .unwrap_or_else(|| panic!("dir_flush_entry: {name} not in overlay"));

    let de = Dirent {
        inum: info.inum,
        name,
    };
    let n = writei(fs, dp, &de.to_bytes(), u64::from(info.offset), Some(tx), false)?;
    assert_eq!(n, DIRENT_SIZE, "dir_flush_entry: short entry write");

    {
        let mut meta = dp.meta();
        let end = u64::from(info.offset) + DIRENT_SIZE as u64;
        if meta.size < end {
            meta.size = end;
        }
    }
    iupdate(fs, dp, Some(tx))
}

/// Add the entry `(name, inum)` to directory `dp`, at the append cursor.
///
/// Link accounting: the target's link count rises unless the entry is `..`,
/// and `inc_link` additionally bumps the directory's own count (a child's
/// `..` pointing back at it). The `..` entry itself never touches counts.
///
/// Caller must hold the write lock on `dp`.
pub fn dirlink(
    fs: &FsContext,
    dp: &Iref,
    name: DirName,
    inum: Inum,
    inc_link: bool,
    tx: &Transaction,
) -> Result<()> {
    dir_init(fs, dp)?;

    let inserted = {
        let mut meta = dp.meta();
        let offset = meta.dir_offset;
        let dir = meta.dir.as_mut().expect("overlay initialized above");
        if dir.insert(
            name,
            DirEntryInfo {
                inum: inum.0,
                offset,
            },
        ) {
            meta.dir_offset += DIRENT_SIZE as u32;
            true
        } else {
            false
        }
    };
    if !inserted {
        return Err(FsError::Exists);
    }

    if !name.is_dotdot() {
        let ip = iget(fs, dp.dev, inum)?;
        ip.link();
        if inc_link {
            dp.link();
        }
    }

    dir_flush_entry(fs, dp, name, tx)?;
    debug!(target: "slatefs::dir", dir = %dp.inum, %name, %inum, "entry linked");
    Ok(())
}

/// Remove the entry `name` from directory `dp`, tombstoning its on-disk
/// slot so later entries keep their offsets.
///
/// Mirrors `dirlink`'s accounting: the target's link count drops unless the
/// entry is `..`, and `dec_link` additionally drops the directory's own.
/// The name leaves the overlay only after the tombstone write, keeping disk
/// and memory consistent throughout.
///
/// Caller must hold the write lock on `dp`.
pub fn dirunlink(
    fs: &FsContext,
    dp: &Iref,
    name: DirName,
    inum: Inum,
    dec_link: bool,
    tx: &Transaction,
) -> Result<()> {
    dir_init(fs, dp)?;

    {
        let mut meta = dp.meta();
        let dir = meta.dir.as_mut().expect("overlay initialized above");
        let Some(info) = dir.lookup(&name) else {
            return Err(FsError::NotFound(name.to_string()));
        };
        dir.replace(
            name,
            DirEntryInfo {
                inum: 0,
                offset: info.offset,
            },
        );
    }

    if !name.is_dotdot() {
        let ip = iget(fs, dp.dev, inum)?;
        ip.unlink();
        if dec_link {
            dp.unlink();
        }
    }

    dir_flush_entry(fs, dp, name, tx)?;
    dp.meta()
        .dir
        .as_mut()
        .expect("overlay initialized above")
        .remove(&name);
    debug!(target: "slatefs::dir", dir = %dp.inum, %name, "entry unlinked");
    Ok(())
}

/// Read the raw on-disk entry at byte offset `offset` (test and tooling
/// support; the hot path goes through the overlay).
pub fn read_raw_entry(fs: &FsContext, dp: &Iref, offset: u32) -> Result<Dirent> {
    let mut raw = [0_u8; DIRENT_SIZE];
    let n = readi(fs, dp, &mut raw, u64::from(offset))?;
    if n != DIRENT_SIZE {
        return Err(FsError::InvalidArgument("entry offset beyond directory end"));
    }
    Dirent::parse(&raw, slate_types::BlockNo(0))
}
