//! The inode-data store: 80-byte metadata records placed in data blocks and
//! addressed by a dense index through the inode-data index table.
//!
//! Entries are reference-counted: `refcount` equals the number of inode
//! slots (snapshot table positions) naming the entry. Sharing an entry also
//! shares its `index_block`, whose own refcount moves in lockstep via
//! `link_inode_data` / `put_inode_data`.

use alloc::boxed::Box;

use log::{debug, warn};

use crate::block::{alloc_block, get_block, put_block, BlockKind};
use crate::config::*;
use crate::error::FsError;
use crate::inode::{read_inode, write_inode};
use crate::structs::InodeData;
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

/// Resolve entry `idx` to the data block hosting it (0 = not yet mapped).
fn ididx_lookup(device: &impl BlockDevice, sbi: &SbInfo, idx: u32) -> Result<u32> {
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(sbi.ididx_block(idx), buf.as_mut())?;
    let slots = unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const u32, INDEX_BLOCK_LEN) };
    Ok(slots[sbi.ididx_slot(idx)])
}

fn ididx_set(device: &impl BlockDevice, sbi: &SbInfo, idx: u32, bno: u32) -> Result<()> {
    let block = sbi.ididx_block(idx);
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(block, buf.as_mut())?;
    let slots =
        unsafe { core::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u32, INDEX_BLOCK_LEN) };
    slots[sbi.ididx_slot(idx)] = bno;
    device.write_block(block, buf.as_ref())
}

/// Read entry `idx`. Returns the record and the data block hosting it.
pub(crate) fn read_entry(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    idx: u32,
) -> Result<(InodeData, u32)> {
    let bno = ididx_lookup(device, sbi, idx)?;
    if !sbi.is_data_block(bno) {
        warn!("illegal access to bno={} (idx={})", bno, idx);
        return Err(FsError::Corrupted);
    }
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(bno, buf.as_mut())?;
    let entry = unsafe {
        core::ptr::read_unaligned(buf.as_ptr().add(sbi.ide_shift(idx)) as *const InodeData)
    };
    Ok((entry, bno))
}

pub(crate) fn write_entry(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    idx: u32,
    entry: &InodeData,
) -> Result<()> {
    let bno = ididx_lookup(device, sbi, idx)?;
    if !sbi.is_data_block(bno) {
        warn!("illegal access to bno={} (idx={})", bno, idx);
        return Err(FsError::Corrupted);
    }
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(bno, buf.as_mut())?;
    unsafe {
        core::ptr::write_unaligned(
            buf.as_mut_ptr().add(sbi.ide_shift(idx)) as *mut InodeData,
            *entry,
        );
    }
    device.write_block(bno, buf.as_ref())
}

/// Load the live inode-data of `ino`, allocating a fresh entry if `allocate`
/// is set. With `cow` set, an entry shared with a snapshot is released and
/// replaced by a private copy the caller may write through.
///
/// Returns the entry and its index. Accessing an inode that does not exist
/// in the live snapshot is an error.
pub fn get_inode_data(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    ino: u32,
    allocate: bool,
    cow: bool,
) -> Result<(InodeData, u32)> {
    let mut inode = read_inode(device, sbi, ino)?;
    let idx = inode.i_data[LIVE_SLOT];

    if allocate {
        if idx != 0 && !cow {
            warn!("residual idx {} in new inode {}", idx, ino);
        }
        let new_idx = sbi.idfree.alloc()?;

        // Map the entry to a host block, allocating one for the first entry
        // in its group.
        let mut host = match ididx_lookup(device, sbi, new_idx) {
            Ok(host) => host,
            Err(e) => {
                sbi.idfree.free(new_idx)?;
                return Err(e);
            }
        };
        if host == 0 {
            host = match alloc_block(device, sbi) {
                Ok(bno) => bno,
                Err(e) => {
                    sbi.idfree.free(new_idx)?;
                    return Err(e);
                }
            };
            if let Err(e) = ididx_set(device, sbi, new_idx, host) {
                put_block(device, sbi, host, BlockKind::Data)?;
                sbi.idfree.free(new_idx)?;
                return Err(e);
            }
            debug!("mapped inode-data host block {} (idx={})", host, new_idx);
        }

        let entry = InodeData {
            refcount: 1,
            ..InodeData::ZERO
        };
        if let Err(e) = write_entry(device, sbi, new_idx, &entry) {
            sbi.idfree.free(new_idx)?;
            return Err(e);
        }

        inode.i_data[LIVE_SLOT] = new_idx;
        if let Err(e) = write_inode(device, sbi, ino, &inode) {
            sbi.idfree.free(new_idx)?;
            return Err(e);
        }
        debug!("mapped idx={} (ino={})", new_idx, ino);
        return Ok((entry, new_idx));
    }

    if idx == 0 || idx >= sbi.nr_inode_data_entries {
        warn!("illegal access to idx={} (ino={})", idx, ino);
        return Err(FsError::InvalidArgument);
    }
    let (mut entry, _) = read_entry(device, sbi, idx)?;
    if entry.refcount == 0 {
        warn!("refcount is 0 (idx={}, ino={})", idx, ino);
        return Err(FsError::Corrupted);
    }

    // The entry is shared with a snapshot and we want to write. Release this
    // slot's claim and move the contents into a fresh private entry. The
    // index block stays untouched: the number of slots referencing it does
    // not change here.
    if cow && entry.refcount > 1 {
        debug!(
            "ino={}, idx={}, refcount={}: copying inode-data",
            ino, idx, entry.refcount
        );
        let (_, new_idx) = get_inode_data(device, sbi, ino, true, true)?;
        let mut copy = entry;
        copy.refcount = 1;
        write_entry(device, sbi, new_idx, &copy)?;

        entry.refcount -= 1;
        write_entry(device, sbi, idx, &entry)?;
        return Ok((copy, new_idx));
    }

    Ok((entry, idx))
}

/// Share the inode-data of slot `from` into slot `to`. Both the entry and
/// its index block gain one reference; a previous entry in `to` is put.
pub fn link_inode_data(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    ino: u32,
    from: usize,
    to: usize,
) -> Result<()> {
    let inode = read_inode(device, sbi, ino)?;
    let idx = inode.i_data[from];

    if idx == inode.i_data[to] {
        return Ok(());
    }
    if idx == 0 || idx >= sbi.nr_inode_data_entries {
        warn!("illegal access to idx={} (ino={})", idx, ino);
        return Err(FsError::InvalidArgument);
    }

    let (mut entry, _) = read_entry(device, sbi, idx)?;
    if entry.refcount == 0 {
        warn!("refcount is 0 (idx={}, ino={})", idx, ino);
        entry.refcount = 1;
    }
    entry.refcount = entry
        .refcount
        .checked_add(1)
        .ok_or(FsError::Corrupted)?;
    write_entry(device, sbi, idx, &entry)?;

    // The index block must not be reclaimed while this slot lives.
    if entry.index_block != 0 {
        get_block(device, sbi, entry.index_block)?;
    }

    if inode.i_data[to] != 0 {
        put_inode_data(device, sbi, ino, to)?;
    }
    let mut inode = read_inode(device, sbi, ino)?;
    inode.i_data[to] = idx;
    write_inode(device, sbi, ino, &inode)
}

/// Unlink slot `snap` of `ino` from its inode-data. Drops one reference from
/// the entry and from its index block; the last reference frees the entry,
/// possibly its now-empty host block, and finally the inode number itself
/// once no snapshot references the inode anymore.
pub fn put_inode_data(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    ino: u32,
    snap: usize,
) -> Result<()> {
    let mut inode = read_inode(device, sbi, ino)?;
    let idx = inode.i_data[snap];

    // Unlink the data from the inode, then try to reclaim.
    inode.i_data[snap] = 0;
    write_inode(device, sbi, ino, &inode)?;

    if idx == 0 || idx >= sbi.nr_inode_data_entries {
        warn!("illegal access to idx={} (ino={})", idx, ino);
    } else {
        reclaim_entry(device, sbi, ino, idx)?;
    }

    if inode.is_dead() {
        sbi.ifree.free(ino)?;
        debug!("freed inode {}", ino);
    }
    Ok(())
}

fn reclaim_entry(device: &impl BlockDevice, sbi: &SbInfo, ino: u32, idx: u32) -> Result<()> {
    let (mut entry, host) = read_entry(device, sbi, idx)?;
    if entry.refcount == 0 {
        warn!("refcount is 0 (idx={}, ino={})", idx, ino);
        return Ok(());
    }

    // One slot stops referencing this entry, so the entry's index block also
    // loses one reference (the inverse of link_inode_data).
    if entry.index_block != 0 {
        let kind = if entry.is_directory() {
            BlockKind::Dir
        } else {
            BlockKind::Index
        };
        put_block(device, sbi, entry.index_block, kind)?;
    }

    entry.refcount -= 1;
    if entry.refcount > 0 {
        return write_entry(device, sbi, idx, &entry);
    }

    // Last reference: clear the entry, and if its host block holds no other
    // live entry, release the block and unmap it from the index.
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(host, buf.as_mut())?;
    unsafe {
        core::ptr::write_unaligned(
            buf.as_mut_ptr().add(sbi.ide_shift(idx)) as *mut InodeData,
            InodeData::ZERO,
        );
    }
    let host_empty = (0..IDE_PER_BLOCK).all(|i| {
        let other = unsafe {
            core::ptr::read_unaligned(buf.as_ptr().add(i * INODE_DATA_SIZE) as *const InodeData)
        };
        other.refcount == 0
    });

    if host_empty {
        // The block is zeroed by put_block anyway, skip writing it back.
        put_block(device, sbi, host, BlockKind::InodeData)?;
        ididx_set(device, sbi, idx, 0)?;
        debug!("unmapped inode-data host block {}", host);
    } else {
        device.write_block(host, buf.as_ref())?;
    }

    sbi.idfree.free(idx)?;
    Ok(())
}
