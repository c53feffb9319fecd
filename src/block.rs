//! Reference-counted block store and the copy-on-write primitive.
//!
//! Every data block has a single-byte refcount at a fixed slot inside the
//! metadata region. The refcount equals the number of live on-disk
//! references to the block: file-index entries, inode-data `index_block`
//! fields and inode-data-index entries. A freed block is zeroed before its
//! bitmap bit is returned, so free blocks are always zero-filled.

use alloc::boxed::Box;

use log::{debug, warn};

use crate::config::*;
use crate::error::FsError;
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

/// Data blocks come in four kinds that differ only in how `put_block` and
/// `cow_block` cascade. A directory block holds names and inode numbers, not
/// block numbers, so it cascades like plain data; the inodes it names are
/// cleaned up per inode by the callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    /// File index block: an array of data block numbers.
    Index,
    /// Directory block: an array of (inode, name) entries.
    Dir,
    /// A block hosting inode-data entries.
    InodeData,
}

/// Read the current refcount of `bno`.
pub fn read_refcount(device: &impl BlockDevice, sbi: &SbInfo, bno: u32) -> Result<u8> {
    if !sbi.is_data_block(bno) {
        warn!("invalid data block number: {}", bno);
        return Err(FsError::InvalidArgument);
    }
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(sbi.meta_block(bno), buf.as_mut())?;
    Ok(buf[sbi.meta_shift(bno)])
}

/// Apply `delta` to the refcount of `bno` under its metadata-block lock.
/// Returns the new value. No partial change is persisted on a read error.
fn update_refcount(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    bno: u32,
    delta: i8,
) -> Result<u8> {
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    let meta = sbi.meta_block(bno);
    let shift = sbi.meta_shift(bno);

    let guard = sbi.meta_lock(bno).lock();
    device.read_block(meta, buf.as_mut())?;
    let old = buf[shift];
    let new = match old.checked_add_signed(delta) {
        Some(new) => new,
        None => {
            warn!("refcount of block {} would leave 0..=255 (was {})", bno, old);
            return Err(FsError::Corrupted);
        }
    };
    buf[shift] = new;
    device.write_block(meta, buf.as_ref())?;
    drop(guard);

    debug!("refcount of {}: {} -> {}", bno, old, new);
    Ok(new)
}

/// Allocate a new, free data block: marks it used in the block bitmap and
/// sets its refcount to one.
pub fn alloc_block(device: &impl BlockDevice, sbi: &SbInfo) -> Result<u32> {
    let bno = sbi.bfree.alloc()?;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    let meta = sbi.meta_block(bno);
    let shift = sbi.meta_shift(bno);

    let guard = sbi.meta_lock(bno).lock();
    if let Err(e) = device.read_block(meta, buf.as_mut()) {
        drop(guard);
        sbi.bfree.free(bno)?;
        return Err(e);
    }
    buf[shift] = 1;
    if let Err(e) = device.write_block(meta, buf.as_ref()) {
        drop(guard);
        sbi.bfree.free(bno)?;
        return Err(e);
    }
    drop(guard);

    debug!("allocated block {} (meta {})", bno, meta);
    Ok(bno)
}

/// Increment the refcount of an already used data block.
pub fn get_block(device: &impl BlockDevice, sbi: &SbInfo, bno: u32) -> Result<()> {
    if !sbi.is_data_block(bno) {
        warn!("invalid data block number: {}", bno);
        return Err(FsError::InvalidArgument);
    }
    update_refcount(device, sbi, bno, 1).map(|_| ())
}

/// Decrement the refcount of `bno`. When the last reference goes away the
/// block is dereferenced according to its kind, zeroed and returned to the
/// bitmap.
pub fn put_block(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    bno: u32,
    kind: BlockKind,
) -> Result<()> {
    if !sbi.is_data_block(bno) {
        warn!("invalid data block number: {}", bno);
        return Err(FsError::InvalidArgument);
    }

    if update_refcount(device, sbi, bno, -1)? > 0 {
        return Ok(());
    }

    // Last reference. An index block still holds one reference to each of
    // its data blocks; drop those before the block itself disappears.
    if kind == BlockKind::Index {
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        device.read_block(bno, buf.as_mut())?;
        let slots =
            unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const u32, INDEX_BLOCK_LEN) };
        for &entry in slots.iter() {
            if entry != 0 {
                put_block(device, sbi, entry, BlockKind::Data)?;
            }
        }
    }

    let zeroes = Box::new([0u8; BLOCK_SIZE]);
    device.write_block(bno, zeroes.as_ref())?;
    sbi.bfree.free(bno)?;
    debug!("freed block {}", bno);
    Ok(())
}

/// Copy-on-write helper. If `bno` has a single reference it may be mutated
/// in place and is returned unchanged. Otherwise a copy is allocated, the
/// original loses one reference, and (for index blocks) every referenced
/// data block gains one reference through the copy. The returned block is
/// private to the caller.
pub fn cow_block(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    bno: u32,
    kind: BlockKind,
) -> Result<u32> {
    if !sbi.is_data_block(bno) {
        warn!("invalid data block number: {}", bno);
        return Err(FsError::InvalidArgument);
    }

    if read_refcount(device, sbi, bno)? == 1 {
        // Sole owner; the caller may modify the block directly.
        return Ok(bno);
    }

    let copy = alloc_block(device, sbi)?;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    if let Err(e) = device.read_block(bno, buf.as_mut()) {
        put_block(device, sbi, copy, BlockKind::Data)?;
        return Err(e);
    }
    if let Err(e) = device.write_block(copy, buf.as_ref()) {
        put_block(device, sbi, copy, BlockKind::Data)?;
        return Err(e);
    }

    update_refcount(device, sbi, bno, -1)?;

    if kind == BlockKind::Index {
        let slots =
            unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const u32, INDEX_BLOCK_LEN) };
        for &entry in slots.iter() {
            if entry != 0 {
                get_block(device, sbi, entry)?;
            }
        }
    }

    debug!("cow: block {} copied to {} ({:?})", bno, copy, kind);
    Ok(copy)
}
