#![forbid(unsafe_code)]
//! Shared identifiers, on-disk layout constants, and block math.
//!
//! The disk is carved up in a fixed order from sector 0: boot block,
//! superblock, inode table, free-block bitmap, data region. Everything here
//! is derived from `BSIZE` and the record sizes; the helpers at the bottom
//! compute where a given inode or bitmap bit lives.

use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk block size in bytes.
pub const BSIZE: usize = 4096;

/// Direct address slots in an inode.
pub const NDIRECT: usize = 10;

/// Block-pointer entries per index block.
pub const NINDIRECT: usize = BSIZE / 4;

/// Maximum addressable block count in one inode.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Size of one on-disk inode record in bytes.
pub const DINODE_SIZE: usize = 128;

/// Inode records per inode-table block.
pub const IPB: usize = BSIZE / DINODE_SIZE;

/// Bitmap bits per bitmap block.
pub const BPB: usize = BSIZE * 8;

/// Maximum length (in bytes) of a single path component.
pub const DIRSIZ: usize = 12;

/// Size of one on-disk directory entry (u32 inum + `DIRSIZ` name bytes).
pub const DIRENT_SIZE: usize = 4 + DIRSIZ;

/// Capacity of the superblock's deferred-reclaim inum array.
pub const NRECLAIM: usize = 32;

/// Device number of the root device.
pub const ROOTDEV: u32 = 1;

/// Inum of the root directory. Inum 0 is reserved and never allocated.
pub const ROOTINO: Inum = Inum(1);

/// Block number of the superblock.
pub const SUPERBLOCK_BLOCK: BlockNo = BlockNo(1);

/// Physical block number on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNo(pub u32);

/// Index of an inode within the inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Inum(pub u32);

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Inum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Layout math ─────────────────────────────────────────────────────────────

/// Number of blocks occupied by an inode table of `ninodes` records.
#[must_use]
pub fn inode_table_blocks(ninodes: u32) -> u32 {
    ninodes.div_ceil(IPB as u32)
}

/// Number of bitmap blocks needed to cover a device of `size` blocks.
#[must_use]
pub fn bitmap_blocks(size: u32) -> u32 {
    size.div_ceil(BPB as u32)
}

/// Block containing the on-disk record of inode `inum`.
///
/// The inode table starts right after the superblock, at block 2.
#[must_use]
pub fn iblock(inum: Inum) -> BlockNo {
    BlockNo(2 + inum.0 / IPB as u32)
}

/// Bitmap block containing the free bit of block `bno`.
#[must_use]
pub fn bblock(bno: BlockNo, ninodes: u32) -> BlockNo {
    BlockNo(2 + inode_table_blocks(ninodes) + bno.0 / BPB as u32)
}

/// First block of the data region.
#[must_use]
pub fn data_start(size: u32, ninodes: u32) -> BlockNo {
    BlockNo(2 + inode_table_blocks(ninodes) + bitmap_blocks(size))
}

/// Round a byte offset up to the next block boundary, in blocks.
///
/// An offset inside a block claims that whole block: truncating to `offset`
/// must preserve every block wholly or partly inside `[0, offset)`.
#[must_use]
pub fn block_round_up(offset: u64) -> u32 {
    let bsize = BSIZE as u64;
    let blocks = if offset % bsize != 0 {
        offset / bsize + 1
    } else {
        offset / bsize
    };
    // MAXFILE fits comfortably in u32; callers clamp offsets before this.
    u32::try_from(blocks).unwrap_or(u32::MAX)
}

// ── Little-endian field helpers ─────────────────────────────────────────────

#[inline]
#[must_use]
pub fn read_le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
#[must_use]
pub fn read_le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
#[must_use]
pub fn read_le_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// ── Fixed-size path component ───────────────────────────────────────────────

/// A directory-entry name: at most `DIRSIZ` bytes, NUL-padded when shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirName([u8; DIRSIZ]);

impl DirName {
    /// Build a name from raw bytes. Returns `None` if `bytes` exceeds
    /// `DIRSIZ` or contains an interior NUL.
    #[must_use]
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > DIRSIZ || bytes.contains(&0) {
            return None;
        }
        let mut raw = [0_u8; DIRSIZ];
        raw[..bytes.len()].copy_from_slice(bytes);
        Some(Self(raw))
    }

    /// Build a name from a NUL-padded on-disk slot.
    #[must_use]
    pub fn from_padded(raw: [u8; DIRSIZ]) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIRSIZ] {
        &self.0
    }

    /// The name without its NUL padding.
    #[must_use]
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        &self.0[..end]
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.trimmed() == b".."
    }
}

impl fmt::Display for DirName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}
