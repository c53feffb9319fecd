//! Directory blocks: flat name-to-inode tables, at most 128 entries, kept
//! contiguous from the front. Every mutation copies the parent's directory
//! block first so that snapshots keep seeing the original.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::block::{cow_block, BlockKind};
use crate::config::*;
use crate::error::FsError;
use crate::inode_data::{get_inode_data, write_entry};
use crate::structs::{DirEntry, InodeData, Timespec};
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

fn entry_at(buf: &[u8; BLOCK_SIZE], slot: usize) -> DirEntry {
    unsafe {
        core::ptr::read_unaligned(
            buf.as_ptr().add(slot * core::mem::size_of::<DirEntry>()) as *const DirEntry
        )
    }
}

fn set_entry(buf: &mut [u8; BLOCK_SIZE], slot: usize, entry: &DirEntry) {
    unsafe {
        core::ptr::write_unaligned(
            buf.as_mut_ptr().add(slot * core::mem::size_of::<DirEntry>()) as *mut DirEntry,
            *entry,
        );
    }
}

/// Load the directory's live inode-data read-only.
fn dir_inode_data(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    dir_ino: u32,
) -> Result<(InodeData, u32)> {
    let (entry, idx) = get_inode_data(device, sbi, dir_ino, false, false)?;
    if !entry.is_directory() {
        return Err(FsError::NotDirectory);
    }
    Ok((entry, idx))
}

/// Load the directory's inode-data for writing and make its directory block
/// private (copy-on-write). Returns the inode-data (with the possibly new
/// block already recorded) and its entry index.
fn dir_prepare_write(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    dir_ino: u32,
) -> Result<(InodeData, u32)> {
    let (mut entry, idx) = get_inode_data(device, sbi, dir_ino, false, true)?;
    if !entry.is_directory() {
        return Err(FsError::NotDirectory);
    }
    let block = cow_block(device, sbi, entry.index_block, BlockKind::Dir)?;
    if block != entry.index_block {
        entry.index_block = block;
        write_entry(device, sbi, idx, &entry)?;
    }
    Ok((entry, idx))
}

/// Search a directory for `name`. Returns the inode number.
pub fn lookup(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    dir_ino: u32,
    name: &[u8],
) -> Result<u32> {
    if name.is_empty() || name.len() > FILENAME_LEN {
        return Err(FsError::InvalidFileName);
    }
    let (dir, _) = dir_inode_data(device, sbi, dir_ino)?;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(dir.index_block, buf.as_mut())?;
    for slot in 0..MAX_SUBFILES {
        let entry = entry_at(&buf, slot);
        if entry.inode == 0 {
            break;
        }
        if entry.name_matches(name) {
            return Ok(entry.inode);
        }
    }
    Err(FsError::NotFound)
}

/// Insert `(name, child_ino)` into the first vacant slot of the directory.
pub fn add_entry(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    dir_ino: u32,
    name: &[u8],
    child_ino: u32,
    now: Timespec,
) -> Result<()> {
    let new_entry = DirEntry::new(child_ino, name)?;
    let (mut dir, idx) = dir_prepare_write(device, sbi, dir_ino)?;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(dir.index_block, buf.as_mut())?;

    let mut free_slot = None;
    for slot in 0..MAX_SUBFILES {
        let entry = entry_at(&buf, slot);
        if entry.inode == 0 {
            free_slot = Some(slot);
            break;
        }
        if entry.name_matches(name) {
            return Err(FsError::AlreadyExists);
        }
    }
    let slot = free_slot.ok_or(FsError::DirectoryFull)?;

    set_entry(&mut buf, slot, &new_entry);
    device.write_block(dir.index_block, buf.as_ref())?;

    dir.touch_modified(now);
    write_entry(device, sbi, idx, &dir)
}

/// Remove `name` from the directory, shifting the tail left so entries stay
/// contiguous. Returns the inode number that was removed.
pub fn remove_entry(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    dir_ino: u32,
    name: &[u8],
    now: Timespec,
) -> Result<u32> {
    if name.is_empty() || name.len() > FILENAME_LEN {
        return Err(FsError::InvalidFileName);
    }
    let (mut dir, idx) = dir_prepare_write(device, sbi, dir_ino)?;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(dir.index_block, buf.as_mut())?;

    let mut pos = None;
    let mut nr_subs = 0;
    for slot in 0..MAX_SUBFILES {
        let entry = entry_at(&buf, slot);
        if entry.inode == 0 {
            break;
        }
        if entry.name_matches(name) {
            pos = Some((slot, entry.inode));
        }
        nr_subs += 1;
    }
    let (pos, removed_ino) = pos.ok_or(FsError::NotFound)?;

    for slot in pos..nr_subs - 1 {
        let next = entry_at(&buf, slot + 1);
        set_entry(&mut buf, slot, &next);
    }
    set_entry(&mut buf, nr_subs - 1, &DirEntry::NULL);
    device.write_block(dir.index_block, buf.as_ref())?;

    dir.touch_modified(now);
    write_entry(device, sbi, idx, &dir)?;
    Ok(removed_ino)
}

/// Rename within one directory: an in-place name overwrite in the copied
/// block. Cross-directory renames are an insert/remove pair at the caller.
pub fn rename_entry(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    dir_ino: u32,
    old_name: &[u8],
    new_name: &[u8],
    now: Timespec,
) -> Result<()> {
    if new_name.is_empty() || new_name.len() > FILENAME_LEN {
        return Err(FsError::InvalidFileName);
    }
    let (mut dir, idx) = dir_prepare_write(device, sbi, dir_ino)?;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(dir.index_block, buf.as_mut())?;

    let mut pos = None;
    for slot in 0..MAX_SUBFILES {
        let entry = entry_at(&buf, slot);
        if entry.inode == 0 {
            break;
        }
        if entry.name_matches(new_name) {
            return Err(FsError::AlreadyExists);
        }
        if entry.name_matches(old_name) {
            pos = Some((slot, entry.inode));
        }
    }
    let (slot, ino) = pos.ok_or(FsError::NotFound)?;

    set_entry(&mut buf, slot, &DirEntry::new(ino, new_name)?);
    device.write_block(dir.index_block, buf.as_ref())?;

    dir.touch_modified(now);
    write_entry(device, sbi, idx, &dir)
}

/// List the directory's entries in slot order.
pub fn read_dir(device: &impl BlockDevice, sbi: &SbInfo, dir_ino: u32) -> Result<Vec<DirEntry>> {
    let (dir, _) = dir_inode_data(device, sbi, dir_ino)?;

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(dir.index_block, buf.as_mut())?;

    let mut entries = Vec::new();
    for slot in 0..MAX_SUBFILES {
        let entry = entry_at(&buf, slot);
        if entry.inode == 0 {
            break;
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub fn is_empty(device: &impl BlockDevice, sbi: &SbInfo, dir_ino: u32) -> Result<bool> {
    let (dir, _) = dir_inode_data(device, sbi, dir_ino)?;
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(dir.index_block, buf.as_mut())?;
    Ok(entry_at(&buf, 0).inode == 0)
}
