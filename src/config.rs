use static_assertions::const_assert;

use crate::structs::{DirEntry, DiskSuperBlock, Inode, InodeData};

pub const MAGIC: u32 = 0x48434957;

pub const BLOCK_SIZE: usize = 4096;
pub const SUPERBLOCK_ID: u32 = 0; // Block ID for the superblock
pub const ROOT_INODE_ID: u32 = 1; // Inode ID for the root directory

/// Maximal number of concurrently existing snapshots. Slot 0 is the live
/// state and never expires, so at most MAX_SNAPSHOTS - 1 are user-visible.
pub const MAX_SNAPSHOTS: usize = 32;
/// Slot index of the live (writable) snapshot.
pub const LIVE_SLOT: usize = 0;

pub const FILENAME_LEN: usize = 28;
pub const MAX_SUBFILES: usize = 128; // How many files a directory can hold

/// Number of data blocks a single index block can reference.
pub const INDEX_BLOCK_LEN: usize = BLOCK_SIZE / 4;
/// Number of data blocks a single metadata block holds refcounts for.
pub const META_BLOCK_LEN: usize = BLOCK_SIZE;
pub const MAX_FILESIZE: usize = INDEX_BLOCK_LEN * BLOCK_SIZE; // 4 MiB

pub const INODE_SIZE: usize = core::mem::size_of::<Inode>();
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

pub const INODE_DATA_SIZE: usize = core::mem::size_of::<InodeData>();
/// Inode-data entries per hosting data block.
pub const IDE_PER_BLOCK: usize = BLOCK_SIZE / INODE_DATA_SIZE;
/// Inode-data entries addressable through a single inode-data index block.
pub const IDE_PER_INDEX_BLOCK: usize = IDE_PER_BLOCK * INDEX_BLOCK_LEN;

// On-disk records are #[repr(C)] and copied to/from block buffers verbatim;
// multi-byte fields are little-endian, i.e. supported hosts are LE.
// Sanity checks on the layout: every record must fit in one block.
const_assert!(core::mem::size_of::<DiskSuperBlock>() <= BLOCK_SIZE);
const_assert!(core::mem::size_of::<Inode>() <= BLOCK_SIZE);
const_assert!(INODE_DATA_SIZE == 80);
const_assert!(core::mem::size_of::<DirEntry>() * MAX_SUBFILES == BLOCK_SIZE);
const_assert!(INDEX_BLOCK_LEN * core::mem::size_of::<u32>() == BLOCK_SIZE);
const_assert!(META_BLOCK_LEN == BLOCK_SIZE);
const_assert!(MAX_SNAPSHOTS <= u8::MAX as usize + 1);
const_assert!(MAX_FILESIZE >= 1 << 22);
