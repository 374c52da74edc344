//! End-to-end scenarios across the whole stack: namespace, inode data
//! engine, allocator, journal, and reclamation, driven the way the syscall
//! layer would drive them.

use slate_block::{BlockDevice, FileBlockDevice};
use slate_core::{commit_tx, create, flush_journal, reclaim_inode, remove};
use slate_dir::{dirlookup, namei, nameiparent};
use slate_error::FsError;
use slate_harness::{assert_block_ownership, dname, fresh_default, remount};
use slate_inode::data::{itrunc, readi, update_size, writei};
use slate_inode::{LockKind, ialloc};
use slate_ondisk::{InodeType, Superblock};
use slate_types::{BSIZE, BlockNo, NDIRECT, NINDIRECT, SUPERBLOCK_BLOCK, read_le_u32};
use std::sync::Arc;

#[test]
fn create_write_read_unlink_reuse() {
    let t = fresh_default();
    let fs = &t.fs;
    let root = fs.root();

    // Create and populate.
    let tx = fs.journal.begin();
    let file = create(fs, &root, dname("greeting"), InodeType::File, &tx).unwrap();
    let inum = file.inum;
    let gen = file.meta().gen;

    file.lock(LockKind::Write);
    assert_eq!(writei(fs, &file, b"hello", 0, Some(&tx), false).unwrap(), 5);
    update_size(fs, &file, 5, Some(&tx)).unwrap();
    file.unlock();
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();

    let mut out = [0_u8; 8];
    assert_eq!(readi(fs, &file, &mut out, 0).unwrap(), 5);
    assert_eq!(&out[..5], b"hello");

    // Unlink: the open handle keeps the inode cached past nlink == 0.
    let tx = fs.journal.begin();
    let removed = remove(fs, &root, dname("greeting"), &tx).unwrap();
    assert_eq!(removed.nlink(), 0);
    drop(removed);
    assert!(fs.icache.contains(1, inum));

    // Reclaim the disk slot, then drop the last handle: victimization pulls
    // the entry out of the cache.
    reclaim_inode(fs, inum, &tx).unwrap();
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();
    drop(file);
    assert!(!fs.icache.contains(1, inum));

    // The inum comes back around with a bumped generation.
    let mut held = Vec::new();
    loop {
        let ip = ialloc(fs, 1, InodeType::File).unwrap();
        ip.unlock();
        if ip.inum == inum {
            assert_eq!(ip.meta().gen, gen + 1);
            break;
        }
        held.push(ip);
    }
}

#[test]
fn one_byte_in_the_doubly_indirect_tier() {
    let t = fresh_default();
    let fs = &t.fs;
    let root = t.fs.root();

    let tx = fs.journal.begin();
    let file = create(fs, &root, dname("deep"), InodeType::File, &tx).unwrap();

    // Logical block NDIRECT + NINDIRECT + 1: first-level index 0, second
    // level index 1.
    let off = (NDIRECT + NINDIRECT + 1) as u64 * BSIZE as u64;
    file.lock(LockKind::Write);
    assert_eq!(writei(fs, &file, b"Z", off, Some(&tx), false).unwrap(), 1);
    update_size(fs, &file, off + 1, Some(&tx)).unwrap();
    file.unlock();
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();

    let top = file.meta().addrs[NDIRECT + 1];
    assert_ne!(top, 0);

    let l1 = fs.cache.get(1, BlockNo(top), false).unwrap();
    let l2_block = read_le_u32(&l1.read(), 0);
    assert_ne!(l2_block, 0);

    let l2 = fs.cache.get(1, BlockNo(l2_block), false).unwrap();
    assert_eq!(read_le_u32(&l2.read(), 0), 0);
    let data_block = read_le_u32(&l2.read(), 4);
    assert_ne!(data_block, 0);

    let data = fs.cache.get(1, BlockNo(data_block), false).unwrap();
    assert_eq!(data.read()[0], b'Z');

    // Reading it back through the byte interface agrees.
    let mut out = [0_u8; 1];
    assert_eq!(readi(fs, &file, &mut out, off).unwrap(), 1);
    assert_eq!(&out, b"Z");
}

#[test]
fn truncate_in_middle_returns_blocks_after_flush() {
    let t = fresh_default();
    let fs = &t.fs;
    let root = t.fs.root();

    let tx = fs.journal.begin();
    let file = create(fs, &root, dname("trunc"), InodeType::File, &tx).unwrap();
    let len = (NDIRECT + 2) * BSIZE;
    file.lock(LockKind::Write);
    assert_eq!(
        writei(fs, &file, &vec![3_u8; len], 0, Some(&tx), false).unwrap(),
        len
    );
    update_size(fs, &file, len as u64, Some(&tx)).unwrap();
    file.unlock();
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();

    let free_before = fs.blocks.free_count();

    let tx = fs.journal.begin();
    file.lock(LockKind::Write);
    itrunc(fs, &file, NDIRECT as u64 * BSIZE as u64, &tx).unwrap();
    update_size(fs, &file, NDIRECT as u64 * BSIZE as u64, Some(&tx)).unwrap();
    file.unlock();

    // Delayed frees: nothing is reusable before the flush.
    assert_eq!(fs.blocks.free_count(), free_before);
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();

    // Two data blocks plus the single-indirect index came back.
    assert_eq!(fs.blocks.free_count(), free_before + 3);
    assert!(file.meta().addrs.iter().take(NDIRECT).all(|a| *a != 0));
    assert_eq!(file.meta().addrs[NDIRECT], 0);
}

#[test]
fn directory_link_lookup_unlink_preserves_size() {
    let t = fresh_default();
    let fs = &t.fs;
    let root = t.fs.root();

    let tx = fs.journal.begin();
    let file = create(fs, &root, dname("foo"), InodeType::File, &tx).unwrap();
    let found = dirlookup(fs, &root, dname("foo")).unwrap().unwrap();
    assert_eq!(found.inum, file.inum);

    let size_before = root.meta().size;
    remove(fs, &root, dname("foo"), &tx).unwrap();
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();

    assert!(dirlookup(fs, &root, dname("foo")).unwrap().is_none());
    assert_eq!(root.meta().size, size_before, "tombstones preserve layout");
}

#[test]
fn path_resolution_over_a_small_tree() {
    let t = fresh_default();
    let fs = &t.fs;
    let root = t.fs.root();

    let tx = fs.journal.begin();
    let a = create(fs, &root, dname("a"), InodeType::Dir, &tx).unwrap();
    let b = create(fs, &a, dname("b"), InodeType::Dir, &tx).unwrap();
    let c = create(fs, &b, dname("c"), InodeType::File, &tx).unwrap();
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();

    assert_eq!(namei(fs, &root, "/a/b/c").unwrap().inum, c.inum);
    assert_eq!(namei(fs, &root, "/a/b").unwrap().inum, b.inum);
    assert_eq!(namei(fs, &root, "//a///b//c").unwrap().inum, c.inum);
    assert!(matches!(
        namei(fs, &root, "/a/x"),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        namei(fs, &root, "/a/b/c/d"),
        Err(FsError::NotADirectory)
    ));

    let (parent, last) = nameiparent(fs, &root, "/a/b/c").unwrap();
    assert_eq!(parent.inum, b.inum);
    assert_eq!(last, dname("c"));

    // Relative resolution starts at the given working directory.
    assert_eq!(namei(fs, &a, "b/c").unwrap().inum, c.inum);
}

#[test]
fn concurrent_creators_share_one_directory() {
    let t = fresh_default();
    let fs = Arc::clone(&t.fs);

    let mut workers = Vec::new();
    for th in 0..4_u32 {
        let fs = Arc::clone(&fs);
        workers.push(std::thread::spawn(move || {
            let root = fs.root();
            for i in 0..8_u32 {
                let tx = fs.journal.begin();
                let name = dname(&format!("t{th}f{i}"));
                create(&fs, &root, name, InodeType::File, &tx).unwrap();
                commit_tx(&fs, tx).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    flush_journal(&fs).unwrap();

    let root = fs.root();
    let mut seen = std::collections::HashSet::new();
    for th in 0..4_u32 {
        for i in 0..8_u32 {
            let ip = namei(&fs, &root, &format!("/t{th}f{i}")).unwrap();
            assert!(seen.insert(ip.inum), "two names share an inum");
        }
    }
    assert_block_ownership(&fs);
}

#[test]
fn workload_keeps_block_ownership_disjoint() {
    let t = fresh_default();
    let fs = &t.fs;
    let root = t.fs.root();

    let tx = fs.journal.begin();
    for (name, blocks) in [("tiny", 1_usize), ("mid", NDIRECT + 4), ("big", NDIRECT + 40)] {
        let file = create(fs, &root, dname(name), InodeType::File, &tx).unwrap();
        let len = blocks * BSIZE;
        file.lock(LockKind::Write);
        assert_eq!(
            writei(fs, &file, &vec![7_u8; len], 0, Some(&tx), false).unwrap(),
            len
        );
        update_size(fs, &file, len as u64, Some(&tx)).unwrap();
        file.unlock();
    }
    commit_tx(fs, tx).unwrap();
    flush_journal(fs).unwrap();

    let owned = assert_block_ownership(fs);
    // Three files' data plus two single-indirect index blocks plus the
    // root directory's entry block.
    let expected = 1 + (NDIRECT + 4) + (NDIRECT + 40) + 2 + 1;
    assert_eq!(owned.len(), expected);
}

#[test]
fn everything_survives_on_a_file_backed_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slate.img");

    {
        let device = Arc::new(FileBlockDevice::create(&path, 512).unwrap());
        slate_core::format(device.as_ref(), 64).unwrap();
        let fs = slate_core::mount(device as Arc<dyn BlockDevice>, 1).unwrap();

        let root = fs.root();
        let tx = fs.journal.begin();
        let file = create(&fs, &root, dname("persisted"), InodeType::File, &tx).unwrap();
        file.lock(LockKind::Write);
        writei(&fs, &file, b"image bytes", 0, Some(&tx), false).unwrap();
        update_size(&fs, &file, 11, Some(&tx)).unwrap();
        file.unlock();
        commit_tx(&fs, tx).unwrap();
        flush_journal(&fs).unwrap();
    }

    // Geometry is readable straight off the image, as the CLI reports it.
    {
        let device = FileBlockDevice::open(&path).unwrap();
        let mut raw = vec![0_u8; BSIZE];
        device.read_block(SUPERBLOCK_BLOCK, &mut raw).unwrap();
        let sb = Superblock::parse(&raw).unwrap();
        assert_eq!(sb.size, 512);
        assert_eq!(sb.ninodes, 64);
    }

    let device = Arc::new(FileBlockDevice::open(&path).unwrap());
    let fs = slate_core::mount(device as Arc<dyn BlockDevice>, 1).unwrap();
    let file = namei(&fs, &fs.root(), "/persisted").unwrap();
    let mut out = [0_u8; 16];
    assert_eq!(readi(&fs, &file, &mut out, 0).unwrap(), 11);
    assert_eq!(&out[..11], b"image bytes");
}

#[test]
fn remount_preserves_the_namespace() {
    let mut t = fresh_default();
    {
        let fs = &t.fs;
        let root = fs.root();
        let tx = fs.journal.begin();
        let dir = create(fs, &root, dname("docs"), InodeType::Dir, &tx).unwrap();
        create(fs, &dir, dname("readme"), InodeType::File, &tx).unwrap();
        commit_tx(fs, tx).unwrap();
        flush_journal(fs).unwrap();
    }
    t = remount(t);
    let fs = &t.fs;
    let file = namei(fs, &fs.root(), "/docs/readme").unwrap();
    assert_eq!(file.itype(), InodeType::File);
}
