#![forbid(unsafe_code)]
//! On-disk record formats.
//!
//! All records are little-endian with fixed field offsets. The decoders take
//! a byte slice positioned at the start of the record; the encoders patch a
//! caller-provided slice in place so a record can be rewritten inside a
//! larger block without disturbing its neighbors.

use slate_error::{FsError, Result};
use slate_types::{
    BPB, BSIZE, BlockNo, DIRENT_SIZE, DINODE_SIZE, DIRSIZ, DirName, Inum, NDIRECT, NRECLAIM,
    bitmap_blocks, inode_table_blocks, read_le_u16, read_le_u32, read_le_u64, write_le_u16,
    write_le_u32, write_le_u64,
};

// ── Inode type ──────────────────────────────────────────────────────────────

/// On-disk inode type tag. `Free` (0) marks an unallocated slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    Free = 0,
    File = 1,
    Dir = 2,
    Dev = 3,
    Sock = 4,
}

impl InodeType {
    #[must_use]
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::File),
            2 => Some(Self::Dir),
            3 => Some(Self::Dev),
            4 => Some(Self::Sock),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        self == Self::Dir
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Superblock record at block 1.
///
/// Read once at mount and treated as read-only thereafter, except for the
/// small deferred-reclaim inum array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Total blocks on the device.
    pub size: u32,
    /// Data blocks.
    pub nblocks: u32,
    /// Inode table capacity.
    pub ninodes: u32,
    /// Inums queued for deferred reclamation (at most `NRECLAIM`).
    pub reclaim_inodes: Vec<Inum>,
}

const SB_SIZE_OFF: usize = 0;
const SB_NBLOCKS_OFF: usize = 4;
const SB_NINODES_OFF: usize = 8;
const SB_NRECLAIM_OFF: usize = 12;
const SB_RECLAIM_OFF: usize = 16;

impl Superblock {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SB_RECLAIM_OFF + NRECLAIM * 4 {
            return Err(FsError::Corruption {
                block: 1,
                detail: format!("superblock record truncated at {} bytes", data.len()),
            });
        }

        let size = read_le_u32(data, SB_SIZE_OFF);
        let nblocks = read_le_u32(data, SB_NBLOCKS_OFF);
        let ninodes = read_le_u32(data, SB_NINODES_OFF);
        let num_reclaim = read_le_u32(data, SB_NRECLAIM_OFF) as usize;

        if size == 0 || ninodes == 0 {
            return Err(FsError::Corruption {
                block: 1,
                detail: "superblock has zero size or zero ninodes".into(),
            });
        }
        if num_reclaim > NRECLAIM {
            return Err(FsError::Corruption {
                block: 1,
                detail: format!("reclaim count {num_reclaim} exceeds {NRECLAIM}"),
            });
        }

        let reclaim_inodes = (0..num_reclaim)
            .map(|i| Inum(read_le_u32(data, SB_RECLAIM_OFF + i * 4)))
            .collect();

        Ok(Self {
            size,
            nblocks,
            ninodes,
            reclaim_inodes,
        })
    }

    /// Serialize into the head of a block-sized buffer.
    pub fn encode(&self, data: &mut [u8]) {
        write_le_u32(data, SB_SIZE_OFF, self.size);
        write_le_u32(data, SB_NBLOCKS_OFF, self.nblocks);
        write_le_u32(data, SB_NINODES_OFF, self.ninodes);
        let n = self.reclaim_inodes.len().min(NRECLAIM);
        write_le_u32(data, SB_NRECLAIM_OFF, n as u32);
        for (i, inum) in self.reclaim_inodes.iter().take(NRECLAIM).enumerate() {
            write_le_u32(data, SB_RECLAIM_OFF + i * 4, inum.0);
        }
        // Clear stale tail entries so repeated encodes are identical.
        for i in n..NRECLAIM {
            write_le_u32(data, SB_RECLAIM_OFF + i * 4, 0);
        }
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Block ranges derived from the superblock.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub size: u32,
    pub ninodes: u32,
    pub inode_table_start: u32,
    pub inode_table_blocks: u32,
    pub bitmap_start: u32,
    pub bitmap_blocks: u32,
    pub data_start: u32,
}

impl Geometry {
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        let itab = inode_table_blocks(sb.ninodes);
        let bmap = bitmap_blocks(sb.size);
        Self {
            size: sb.size,
            ninodes: sb.ninodes,
            inode_table_start: 2,
            inode_table_blocks: itab,
            bitmap_start: 2 + itab,
            bitmap_blocks: bmap,
            data_start: 2 + itab + bmap,
        }
    }

    #[must_use]
    pub fn is_data_block(&self, bno: BlockNo) -> bool {
        bno.0 >= self.data_start && bno.0 < self.size
    }

    /// Sanity bound: a bitmap block index inside the bitmap region.
    #[must_use]
    pub fn bitmap_block(&self, index: u32) -> BlockNo {
        debug_assert!(index < self.bitmap_blocks);
        BlockNo(self.bitmap_start + index)
    }

    /// How many bits of the bitmap block at `index` are in range.
    #[must_use]
    pub fn bits_in_bitmap_block(&self, index: u32) -> u32 {
        let covered = index * BPB as u32;
        (self.size - covered).min(BPB as u32)
    }
}

// ── On-disk inode ───────────────────────────────────────────────────────────

/// One 128-byte slot in the inode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dinode {
    pub itype: InodeType,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u64,
    pub gen: u64,
    pub addrs: [u32; NDIRECT + 2],
}

const DI_TYPE_OFF: usize = 0;
const DI_MAJOR_OFF: usize = 2;
const DI_MINOR_OFF: usize = 4;
const DI_NLINK_OFF: usize = 6;
const DI_SIZE_OFF: usize = 8;
const DI_GEN_OFF: usize = 16;
const DI_ADDRS_OFF: usize = 24;

impl Dinode {
    /// An all-zero (free) slot.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            itype: InodeType::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            gen: 0,
            addrs: [0; NDIRECT + 2],
        }
    }

    /// Decode the record at the start of `data`. `block` is only used for
    /// error reporting.
    pub fn parse(data: &[u8], block: BlockNo) -> Result<Self> {
        if data.len() < DINODE_SIZE {
            return Err(FsError::Corruption {
                block: block.0,
                detail: "inode record extends beyond block boundary".into(),
            });
        }

        let raw_type = read_le_u16(data, DI_TYPE_OFF);
        let itype = InodeType::from_raw(raw_type).ok_or_else(|| FsError::Corruption {
            block: block.0,
            detail: format!("unknown inode type {raw_type}"),
        })?;

        let mut addrs = [0_u32; NDIRECT + 2];
        for (i, slot) in addrs.iter_mut().enumerate() {
            *slot = read_le_u32(data, DI_ADDRS_OFF + i * 4);
        }

        Ok(Self {
            itype,
            major: read_le_u16(data, DI_MAJOR_OFF),
            minor: read_le_u16(data, DI_MINOR_OFF),
            nlink: read_le_u16(data, DI_NLINK_OFF),
            size: read_le_u64(data, DI_SIZE_OFF),
            gen: read_le_u64(data, DI_GEN_OFF),
            addrs,
        })
    }

    /// Patch this record into its slot within a block buffer.
    pub fn encode(&self, data: &mut [u8]) {
        write_le_u16(data, DI_TYPE_OFF, self.itype.to_raw());
        write_le_u16(data, DI_MAJOR_OFF, self.major);
        write_le_u16(data, DI_MINOR_OFF, self.minor);
        write_le_u16(data, DI_NLINK_OFF, self.nlink);
        write_le_u64(data, DI_SIZE_OFF, self.size);
        write_le_u64(data, DI_GEN_OFF, self.gen);
        for (i, slot) in self.addrs.iter().enumerate() {
            write_le_u32(data, DI_ADDRS_OFF + i * 4, *slot);
        }
        // Reserved tail stays untouched; mkfs zeroes the whole table.
    }

    /// Byte offset of inode `inum` inside its table block.
    #[must_use]
    pub fn offset_in_block(inum: Inum) -> usize {
        (inum.0 as usize % slate_types::IPB) * DINODE_SIZE
    }
}

// ── Directory entry ─────────────────────────────────────────────────────────

/// One 16-byte directory entry: u32 inum + NUL-padded name.
///
/// `inum == 0` is a tombstone: the slot keeps its place in the byte stream
/// (offsets of later entries must not move) but names nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent {
    pub inum: u32,
    pub name: DirName,
}

impl Dirent {
    #[must_use]
    pub fn new(inum: Inum, name: DirName) -> Self {
        Self { inum: inum.0, name }
    }

    #[must_use]
    pub fn tombstone(name: DirName) -> Self {
        Self { inum: 0, name }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.inum == 0
    }

    pub fn parse(data: &[u8], block: BlockNo) -> Result<Self> {
        if data.len() < DIRENT_SIZE {
            return Err(FsError::Corruption {
                block: block.0,
                detail: "directory entry extends beyond block boundary".into(),
            });
        }
        let inum = read_le_u32(data, 0);
        let mut raw = [0_u8; DIRSIZ];
        raw.copy_from_slice(&data[4..4 + DIRSIZ]);
        Ok(Self {
            inum,
            name: DirName::from_padded(raw),
        })
    }

    pub fn encode(&self, data: &mut [u8]) {
        write_le_u32(data, 0, self.inum);
        data[4..4 + DIRSIZ].copy_from_slice(self.name.as_bytes());
    }

    /// Serialize into a fresh fixed-size record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut raw = [0_u8; DIRENT_SIZE];
        self.encode(&mut raw);
        raw
    }
}

/// Entries per directory block.
pub const DIRENTS_PER_BLOCK: usize = BSIZE / DIRENT_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_round_trip_with_reclaim_queue() {
        let sb = Superblock {
            size: 4096,
            nblocks: 4000,
            ninodes: 256,
            reclaim_inodes: vec![Inum(7), Inum(19)],
        };
        let mut block = vec![0_u8; BSIZE];
        sb.encode(&mut block);
        let parsed = Superblock::parse(&block).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn superblock_rejects_garbage() {
        let block = vec![0_u8; BSIZE];
        // size == 0
        assert!(Superblock::parse(&block).is_err());

        let mut block = vec![0_u8; BSIZE];
        Superblock {
            size: 100,
            nblocks: 90,
            ninodes: 32,
            reclaim_inodes: Vec::new(),
        }
        .encode(&mut block);
        write_le_u32(&mut block, SB_NRECLAIM_OFF, NRECLAIM as u32 + 1);
        assert!(Superblock::parse(&block).is_err());
    }

    #[test]
    fn dinode_slot_addressing() {
        assert_eq!(Dinode::offset_in_block(Inum(0)), 0);
        assert_eq!(Dinode::offset_in_block(Inum(1)), DINODE_SIZE);
        assert_eq!(Dinode::offset_in_block(Inum(32)), 0);
    }

    #[test]
    fn dinode_encode_patches_in_place() {
        let mut block = vec![0xAA_u8; BSIZE];
        let mut di = Dinode::zeroed();
        di.itype = InodeType::File;
        di.nlink = 1;
        di.size = 5;
        di.gen = 3;
        di.addrs[0] = 77;

        let off = Dinode::offset_in_block(Inum(2));
        di.encode(&mut block[off..off + DINODE_SIZE]);

        let parsed = Dinode::parse(&block[off..off + DINODE_SIZE], BlockNo(2)).unwrap();
        assert_eq!(parsed, di);
        // Neighboring slots untouched.
        assert_eq!(block[off - 1], 0xAA);
        assert_eq!(block[off + DINODE_SIZE], 0xAA);
    }

    #[test]
    fn dinode_rejects_unknown_type() {
        let mut raw = vec![0_u8; DINODE_SIZE];
        write_le_u16(&mut raw, DI_TYPE_OFF, 9);
        assert!(Dinode::parse(&raw, BlockNo(2)).is_err());
    }

    #[test]
    fn dirent_tombstone_keeps_name() {
        let name = DirName::new(b"victim").unwrap();
        let de = Dirent::tombstone(name);
        assert!(de.is_tombstone());
        let raw = de.to_bytes();
        let parsed = Dirent::parse(&raw, BlockNo(0)).unwrap();
        assert_eq!(parsed.inum, 0);
        assert_eq!(parsed.name, name);
    }

    #[test]
    fn geometry_ranges() {
        let sb = Superblock {
            size: 70000,
            nblocks: 69000,
            ninodes: 64,
            reclaim_inodes: Vec::new(),
        };
        let geo = Geometry::from_superblock(&sb);
        // 64 inodes -> 2 table blocks; 70000 blocks -> 3 bitmap blocks.
        assert_eq!(geo.inode_table_blocks, 2);
        assert_eq!(geo.bitmap_start, 4);
        assert_eq!(geo.bitmap_blocks, 3);
        assert_eq!(geo.data_start, 7);
        assert!(geo.is_data_block(BlockNo(7)));
        assert!(!geo.is_data_block(BlockNo(6)));
        assert!(!geo.is_data_block(BlockNo(70000)));
        assert_eq!(geo.bits_in_bitmap_block(0), BPB as u32);
        assert_eq!(geo.bits_in_bitmap_block(2), 70000 - 2 * BPB as u32);
    }
}
