//! Superblock handling: the on-disk record in block 0, the in-memory
//! superblock handle (`SbInfo`), volume formatting and sync.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::debug;
use spin::Mutex;

use crate::bitmap::Bitmap;
use crate::config::*;
use crate::error::FsError;
use crate::structs::*;
use crate::{BlockDevice, Result};

/// In-memory superblock: geometry, snapshot table, the three bitmaps and the
/// per-metadata-block locks. This is the core's only process-wide state; the
/// `FileSystem` facade owns exactly one behind its freeze lock and every
/// other component receives it by reference.
pub struct SbInfo {
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_inode_data_entries: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_idfree_blocks: u32,
    pub nr_ididx_blocks: u32,
    pub nr_meta_blocks: u32,
    pub snapshots: [SnapshotInfo; MAX_SNAPSHOTS],
    pub ifree: Bitmap,
    pub bfree: Bitmap,
    pub idfree: Bitmap,
    /// One lock per metadata block, held only across a refcount
    /// read-modify-write and released before any cascaded operation.
    meta_locks: Vec<Mutex<()>>,
}

impl SbInfo {
    // Layout helpers. Region order is fixed: superblock | inode store |
    // ifree | bfree | idfree | inode-data index | metadata | data.

    pub fn istore_start(&self) -> u32 {
        1
    }

    pub fn ifree_start(&self) -> u32 {
        self.istore_start() + self.nr_istore_blocks
    }

    pub fn bfree_start(&self) -> u32 {
        self.ifree_start() + self.nr_ifree_blocks
    }

    pub fn idfree_start(&self) -> u32 {
        self.bfree_start() + self.nr_bfree_blocks
    }

    pub fn ididx_start(&self) -> u32 {
        self.idfree_start() + self.nr_idfree_blocks
    }

    pub fn meta_start(&self) -> u32 {
        self.ididx_start() + self.nr_ididx_blocks
    }

    pub fn data_start(&self) -> u32 {
        self.meta_start() + self.nr_meta_blocks
    }

    /// Inode store block holding inode `ino`.
    pub fn inode_block(&self, ino: u32) -> u32 {
        self.istore_start() + ino / INODES_PER_BLOCK as u32
    }

    /// Byte offset of inode `ino` inside its store block.
    pub fn inode_shift(&self, ino: u32) -> usize {
        (ino as usize % INODES_PER_BLOCK) * INODE_SIZE
    }

    /// Metadata block holding the refcount of data block `bno`.
    pub fn meta_block(&self, bno: u32) -> u32 {
        self.meta_start() + (bno - self.data_start()) / META_BLOCK_LEN as u32
    }

    /// Refcount slot of data block `bno` inside its metadata block.
    pub fn meta_shift(&self, bno: u32) -> usize {
        (bno - self.data_start()) as usize % META_BLOCK_LEN
    }

    pub fn meta_lock(&self, bno: u32) -> &Mutex<()> {
        &self.meta_locks[((bno - self.data_start()) / META_BLOCK_LEN as u32) as usize]
    }

    /// Inode-data index block resolving entry `idx`.
    pub fn ididx_block(&self, idx: u32) -> u32 {
        self.ididx_start() + (idx / IDE_PER_BLOCK as u32) / INDEX_BLOCK_LEN as u32
    }

    /// Slot of entry `idx`'s host block inside its index block.
    pub fn ididx_slot(&self, idx: u32) -> usize {
        (idx as usize / IDE_PER_BLOCK) % INDEX_BLOCK_LEN
    }

    /// Byte offset of entry `idx` inside its host data block.
    pub fn ide_shift(&self, idx: u32) -> usize {
        (idx as usize % IDE_PER_BLOCK) * INODE_DATA_SIZE
    }

    pub fn is_data_block(&self, bno: u32) -> bool {
        bno >= self.data_start() && bno < self.nr_blocks
    }

    pub fn live_snapshot(&self) -> &SnapshotInfo {
        &self.snapshots[LIVE_SLOT]
    }
}

fn meta_locks(nr_meta_blocks: u32) -> Vec<Mutex<()>> {
    (0..nr_meta_blocks).map(|_| Mutex::new(())).collect()
}

pub fn read_superblock(device: &impl BlockDevice) -> Result<DiskSuperBlock> {
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(SUPERBLOCK_ID, buf.as_mut())?;
    let sb: DiskSuperBlock =
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const DiskSuperBlock) };

    if sb.magic != MAGIC {
        return Err(FsError::InvalidMagic);
    }
    if sb.nr_blocks == 0 || sb.nr_inodes == 0 {
        return Err(FsError::InvalidSuperBlock);
    }
    Ok(sb)
}

/// Write the managed superblock fields back to block 0, preserving whatever
/// the record does not cover.
pub fn write_superblock(device: &impl BlockDevice, sb: &DiskSuperBlock) -> Result<()> {
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(SUPERBLOCK_ID, buf.as_mut())?;
    unsafe {
        core::ptr::write_unaligned(buf.as_mut_ptr() as *mut DiskSuperBlock, *sb);
    }
    device.write_block(SUPERBLOCK_ID, buf.as_ref())
}

/// Load the in-memory superblock from a mounted device.
pub fn load(device: &impl BlockDevice) -> Result<SbInfo> {
    let sb = read_superblock(device)?;

    let sbi = SbInfo {
        nr_blocks: sb.nr_blocks,
        nr_inodes: sb.nr_inodes,
        nr_inode_data_entries: sb.nr_inode_data_entries,
        nr_istore_blocks: sb.nr_istore_blocks,
        nr_ifree_blocks: sb.nr_ifree_blocks,
        nr_bfree_blocks: sb.nr_bfree_blocks,
        nr_idfree_blocks: sb.nr_idfree_blocks,
        nr_ididx_blocks: sb.nr_ididx_blocks,
        nr_meta_blocks: sb.nr_meta_blocks,
        snapshots: sb.snapshots,
        // Bitmaps are loaded below once the geometry is known.
        ifree: Bitmap::new_free(0, 0, 0),
        bfree: Bitmap::new_free(0, 0, 0),
        idfree: Bitmap::new_free(0, 0, 0),
        meta_locks: meta_locks(sb.nr_meta_blocks),
    };

    let ifree = Bitmap::load(
        device,
        sbi.ifree_start(),
        sbi.nr_ifree_blocks,
        sbi.nr_inodes,
        sb.nr_free_inodes,
    )?;
    let bfree = Bitmap::load(
        device,
        sbi.bfree_start(),
        sbi.nr_bfree_blocks,
        sbi.nr_blocks,
        sb.nr_free_blocks,
    )?;
    let idfree = Bitmap::load(
        device,
        sbi.idfree_start(),
        sbi.nr_idfree_blocks,
        sbi.nr_inode_data_entries,
        sb.nr_free_inode_data_entries,
    )?;

    let sbi = SbInfo {
        ifree,
        bfree,
        idfree,
        ..sbi
    };

    debug!(
        "loaded superblock: nr_blocks={} nr_inodes={} nr_ide={} data_start={} free: i={} b={} id={}",
        sbi.nr_blocks,
        sbi.nr_inodes,
        sbi.nr_inode_data_entries,
        sbi.data_start(),
        sbi.ifree.nr_free(),
        sbi.bfree.nr_free(),
        sbi.idfree.nr_free(),
    );

    Ok(sbi)
}

/// Flush the superblock record and the three bitmap regions.
pub fn sync(device: &impl BlockDevice, sbi: &SbInfo, wait: bool) -> Result<()> {
    let sb = DiskSuperBlock {
        magic: MAGIC,
        nr_blocks: sbi.nr_blocks,
        nr_inodes: sbi.nr_inodes,
        nr_istore_blocks: sbi.nr_istore_blocks,
        nr_ifree_blocks: sbi.nr_ifree_blocks,
        nr_bfree_blocks: sbi.nr_bfree_blocks,
        nr_free_inodes: sbi.ifree.nr_free(),
        nr_free_blocks: sbi.bfree.nr_free(),
        nr_inode_data_entries: sbi.nr_inode_data_entries,
        nr_free_inode_data_entries: sbi.idfree.nr_free(),
        nr_idfree_blocks: sbi.nr_idfree_blocks,
        nr_ididx_blocks: sbi.nr_ididx_blocks,
        nr_meta_blocks: sbi.nr_meta_blocks,
        snapshots: sbi.snapshots,
    };
    write_superblock(device, &sb)?;
    sbi.ifree.sync(device)?;
    sbi.bfree.sync(device)?;
    sbi.idfree.sync(device)?;
    if wait {
        device.flush()?;
    }
    Ok(())
}

fn idiv_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Write an empty volume onto `device`: superblock, root inode (ino 1,
/// entry idx 1), bitmaps with index 0 reserved, the first inode-data index
/// block, the first metadata block and the root directory block.
///
/// The device is assumed zero-filled beyond the blocks written here, which
/// holds for fresh images; the block store keeps that invariant afterwards
/// by zeroing every block it frees.
pub fn format_volume(
    device: &impl BlockDevice,
    nr_blocks: u32,
    nr_inodes: u32,
    now: i64,
) -> Result<SbInfo> {
    if nr_blocks == 0 || nr_inodes == 0 || nr_blocks > device.num_blocks() {
        return Err(FsError::InvalidSuperBlock);
    }

    let nr_ide = nr_inodes
        .checked_mul(MAX_SNAPSHOTS as u32)
        .ok_or(FsError::InvalidSuperBlock)?;
    let nr_istore_blocks = idiv_ceil(nr_inodes, INODES_PER_BLOCK as u32);
    let nr_ifree_blocks = idiv_ceil(nr_inodes, (BLOCK_SIZE * 8) as u32);
    let nr_bfree_blocks = idiv_ceil(nr_blocks, (BLOCK_SIZE * 8) as u32);
    let nr_idfree_blocks = idiv_ceil(nr_ide, (BLOCK_SIZE * 8) as u32);
    let nr_ididx_blocks = idiv_ceil(nr_ide, IDE_PER_INDEX_BLOCK as u32);

    let fixed = 1 + nr_istore_blocks + nr_ifree_blocks + nr_bfree_blocks + nr_idfree_blocks
        + nr_ididx_blocks;
    let remaining = nr_blocks.checked_sub(fixed).ok_or(FsError::InvalidSuperBlock)?;
    // Partition the rest so that every data block has a refcount byte.
    let nr_meta_blocks = idiv_ceil(remaining, META_BLOCK_LEN as u32 + 1);
    let nr_data_blocks = remaining - nr_meta_blocks;
    if nr_data_blocks < 3 {
        return Err(FsError::InvalidSuperBlock);
    }

    let mut snapshots = [SnapshotInfo::EMPTY; MAX_SNAPSHOTS];
    snapshots[LIVE_SLOT] = SnapshotInfo { created: 0, id: 0 };

    let mut sbi = SbInfo {
        nr_blocks,
        nr_inodes,
        nr_inode_data_entries: nr_ide,
        nr_istore_blocks,
        nr_ifree_blocks,
        nr_bfree_blocks,
        nr_idfree_blocks,
        nr_ididx_blocks,
        nr_meta_blocks,
        snapshots,
        ifree: Bitmap::new_free(0, 0, 0),
        bfree: Bitmap::new_free(0, 0, 0),
        idfree: Bitmap::new_free(0, 0, 0),
        meta_locks: meta_locks(nr_meta_blocks),
    };

    let data_start = sbi.data_start();
    let root_dir_block = data_start;
    let root_host_block = data_start + 1;

    // Bitmaps: index 0 reserved everywhere; ino 1 / entry 1 are the root;
    // every non-data block plus the two initial data blocks are in use.
    let ifree = Bitmap::new_free(sbi.ifree_start(), nr_ifree_blocks, nr_inodes);
    ifree.mark_allocated(0)?;
    ifree.mark_allocated(ROOT_INODE_ID)?;
    let bfree = Bitmap::new_free(sbi.bfree_start(), nr_bfree_blocks, nr_blocks);
    for bno in 0..=root_host_block {
        bfree.mark_allocated(bno)?;
    }
    let idfree = Bitmap::new_free(sbi.idfree_start(), nr_idfree_blocks, nr_ide);
    idfree.mark_allocated(0)?;
    idfree.mark_allocated(1)?;

    sbi.ifree = ifree;
    sbi.bfree = bfree;
    sbi.idfree = idfree;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);

    // Inode store: all dead except the root, which maps slot 0 to entry 1.
    for i in 0..nr_istore_blocks {
        buf.fill(0);
        if i == 0 {
            let root = Inode {
                i_data: {
                    let mut d = [0u32; MAX_SNAPSHOTS];
                    d[LIVE_SLOT] = 1;
                    d
                },
            };
            unsafe {
                core::ptr::write_unaligned(
                    buf.as_mut_ptr().add(sbi.inode_shift(ROOT_INODE_ID)) as *mut Inode,
                    root,
                );
            }
        }
        device.write_block(sbi.istore_start() + i, buf.as_ref())?;
    }

    // Inode-data index: entry 1 lives in the first host block.
    for i in 0..nr_ididx_blocks {
        buf.fill(0);
        if i == 0 {
            let slots = unsafe {
                core::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u32, INDEX_BLOCK_LEN)
            };
            slots[0] = root_host_block;
        }
        device.write_block(sbi.ididx_start() + i, buf.as_ref())?;
    }

    // Metadata: the root directory block and its inode-data host block each
    // carry one reference.
    for i in 0..nr_meta_blocks {
        buf.fill(0);
        if i == 0 {
            buf[0] = 1;
            buf[1] = 1;
        }
        device.write_block(sbi.meta_start() + i, buf.as_ref())?;
    }

    // Root directory block: empty.
    buf.fill(0);
    device.write_block(root_dir_block, buf.as_ref())?;

    // Root inode-data, at entry index 1 inside the first host block.
    buf.fill(0);
    let mut root_data = InodeData::new(
        FileKind::Directory,
        0o755,
        Timespec {
            sec: now as u32,
            nsec: 0,
        },
    );
    root_data.size = BLOCK_SIZE as u32;
    root_data.blocks = 1;
    root_data.index_block = root_dir_block;
    unsafe {
        core::ptr::write_unaligned(
            buf.as_mut_ptr().add(sbi.ide_shift(1)) as *mut InodeData,
            root_data,
        );
    }
    device.write_block(root_host_block, buf.as_ref())?;

    sync(device, &sbi, true)?;

    debug!(
        "formatted volume: nr_blocks={} nr_inodes={} nr_ide={} istore={} ifree={} bfree={} idfree={} ididx={} meta={} data_start={}",
        nr_blocks, nr_inodes, nr_ide, nr_istore_blocks, nr_ifree_blocks, nr_bfree_blocks,
        nr_idfree_blocks, nr_ididx_blocks, nr_meta_blocks, data_start,
    );

    Ok(sbi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_contiguous() {
        let sbi = SbInfo {
            nr_blocks: 12800,
            nr_inodes: 12800,
            nr_inode_data_entries: 12800 * MAX_SNAPSHOTS as u32,
            nr_istore_blocks: 400,
            nr_ifree_blocks: 1,
            nr_bfree_blocks: 1,
            nr_idfree_blocks: 13,
            nr_ididx_blocks: 8,
            nr_meta_blocks: 4,
            snapshots: [SnapshotInfo::EMPTY; MAX_SNAPSHOTS],
            ifree: Bitmap::new_free(0, 0, 0),
            bfree: Bitmap::new_free(0, 0, 0),
            idfree: Bitmap::new_free(0, 0, 0),
            meta_locks: meta_locks(4),
        };
        assert_eq!(sbi.istore_start(), 1);
        assert_eq!(sbi.ifree_start(), 401);
        assert_eq!(sbi.bfree_start(), 402);
        assert_eq!(sbi.idfree_start(), 403);
        assert_eq!(sbi.ididx_start(), 416);
        assert_eq!(sbi.meta_start(), 424);
        assert_eq!(sbi.data_start(), 428);

        let first = sbi.data_start();
        assert_eq!(sbi.meta_block(first), sbi.meta_start());
        assert_eq!(sbi.meta_shift(first), 0);
        assert_eq!(sbi.meta_shift(first + 4097), 1);
        assert_eq!(sbi.meta_block(first + 4097), sbi.meta_start() + 1);
    }

    #[test]
    fn inode_data_addressing() {
        let sbi = SbInfo {
            nr_blocks: 1024,
            nr_inodes: 1024,
            nr_inode_data_entries: 1024 * MAX_SNAPSHOTS as u32,
            nr_istore_blocks: 32,
            nr_ifree_blocks: 1,
            nr_bfree_blocks: 1,
            nr_idfree_blocks: 1,
            nr_ididx_blocks: 1,
            nr_meta_blocks: 1,
            snapshots: [SnapshotInfo::EMPTY; MAX_SNAPSHOTS],
            ifree: Bitmap::new_free(0, 0, 0),
            bfree: Bitmap::new_free(0, 0, 0),
            idfree: Bitmap::new_free(0, 0, 0),
            meta_locks: meta_locks(1),
        };
        // Entries 0..IDE_PER_BLOCK share the first host block.
        assert_eq!(sbi.ididx_slot(0), 0);
        assert_eq!(sbi.ididx_slot(IDE_PER_BLOCK as u32 - 1), 0);
        assert_eq!(sbi.ididx_slot(IDE_PER_BLOCK as u32), 1);
        assert_eq!(sbi.ide_shift(1), INODE_DATA_SIZE);
        assert_eq!(sbi.ide_shift(IDE_PER_BLOCK as u32), 0);
    }
}
