#![forbid(unsafe_code)]
//! Test support: formatted in-memory filesystems and whole-tree walkers for
//! cross-crate scenario suites.

use slate_block::{BlockDevice, MemBlockDevice};
use slate_inode::{FsContext, iget};
use slate_ondisk::InodeType;
use slate_types::{BlockNo, DirName, Inum, NDIRECT, NINDIRECT, read_le_u32};
use std::collections::HashSet;
use std::sync::Arc;

/// A mounted filesystem over a shared in-memory device.
pub struct TestFs {
    pub device: Arc<MemBlockDevice>,
    pub fs: Arc<FsContext>,
}

/// Format and mount a fresh in-memory filesystem.
#[must_use]
pub fn fresh_fs(blocks: u32, ninodes: u32) -> TestFs {
    let device = Arc::new(MemBlockDevice::new(blocks));
    slate_core::format(device.as_ref(), ninodes).expect("format");
    let fs = slate_core::mount(Arc::clone(&device) as Arc<dyn BlockDevice>, 1).expect("mount");
    TestFs { device, fs }
}

/// The default scenario geometry: 4096 blocks, 128 inodes.
#[must_use]
pub fn fresh_default() -> TestFs {
    fresh_fs(4096, 128)
}

/// Tear the context down and mount the same device again.
#[must_use]
pub fn remount(t: TestFs) -> TestFs {
    let TestFs { device, fs } = t;
    drop(fs);
    let fs = slate_core::mount(Arc::clone(&device) as Arc<dyn BlockDevice>, 1).expect("remount");
    TestFs { device, fs }
}

/// Shorthand for building a directory-entry name.
#[must_use]
pub fn dname(s: &str) -> DirName {
    DirName::new(s.as_bytes()).expect("valid test name")
}

/// Walk every allocated inode and collect the set of blocks it references,
/// directly or through index blocks.
///
/// Panics if any block is referenced twice (within or across inodes) or if
/// a referenced block is simultaneously in the free view — the allocation
/// invariants of the whole tree.
pub fn assert_block_ownership(fs: &FsContext) -> HashSet<u32> {
    let mut owned: HashSet<u32> = HashSet::new();
    let mut claim = |bno: u32, inum: Inum| {
        assert!(bno != 0);
        assert!(
            owned.insert(bno),
            "block {bno} referenced twice (second owner: inode {inum})"
        );
    };

    for raw_inum in 1..fs.ninodes() {
        let inum = Inum(raw_inum);
        let ip = iget(fs, fs.dev, inum).expect("iget");
        if ip.itype() == InodeType::Free {
            continue;
        }
        let addrs = ip.meta().addrs;

        for a in addrs.iter().take(NDIRECT) {
            if *a != 0 {
                claim(*a, inum);
            }
        }

        if addrs[NDIRECT] != 0 {
            claim(addrs[NDIRECT], inum);
            let buf = fs.cache.get(fs.dev, BlockNo(addrs[NDIRECT]), false).unwrap();
            let data = buf.read();
            for i in 0..NINDIRECT {
                let a = read_le_u32(&data, i * 4);
                if a != 0 {
                    claim(a, inum);
                }
            }
        }

        if addrs[NDIRECT + 1] != 0 {
            claim(addrs[NDIRECT + 1], inum);
            let buf1 = fs.cache.get(fs.dev, BlockNo(addrs[NDIRECT + 1]), false).unwrap();
            let l2_blocks: Vec<u32> = {
                let data = buf1.read();
                (0..NINDIRECT)
                    .map(|i| read_le_u32(&data, i * 4))
                    .filter(|a| *a != 0)
                    .collect()
            };
            for l2 in l2_blocks {
                claim(l2, inum);
                let buf2 = fs.cache.get(fs.dev, BlockNo(l2), false).unwrap();
                let data = buf2.read();
                for j in 0..NINDIRECT {
                    let a = read_le_u32(&data, j * 4);
                    if a != 0 {
                        claim(a, inum);
                    }
                }
            }
        }
    }

    // Nothing owned may also be free.
    let mut probe = Vec::new();
    while let Some(b) = fs.blocks.alloc() {
        assert!(
            !owned.contains(&b.0),
            "block {b} is both owned by an inode and in the free view"
        );
        probe.push(b);
    }
    for b in probe {
        fs.blocks.free(b);
    }

    owned
}
