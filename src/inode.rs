//! Access to the inode store: fixed-size records mapping snapshot slots to
//! inode-data entries.

use alloc::boxed::Box;

use crate::config::*;
use crate::error::FsError;
use crate::structs::Inode;
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

pub fn read_inode(device: &impl BlockDevice, sbi: &SbInfo, ino: u32) -> Result<Inode> {
    if ino == 0 || ino >= sbi.nr_inodes {
        return Err(FsError::InvalidArgument);
    }
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(sbi.inode_block(ino), buf.as_mut())?;
    let inode =
        unsafe { core::ptr::read_unaligned(buf.as_ptr().add(sbi.inode_shift(ino)) as *const Inode) };
    Ok(inode)
}

/// Write an inode record to the inode store. The inode number must have been
/// drawn from the inode bitmap; this only updates existing records.
pub fn write_inode(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    ino: u32,
    inode: &Inode,
) -> Result<()> {
    if ino == 0 || ino >= sbi.nr_inodes {
        return Err(FsError::InvalidArgument);
    }
    let block = sbi.inode_block(ino);
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(block, buf.as_mut())?;
    unsafe {
        core::ptr::write_unaligned(
            buf.as_mut_ptr().add(sbi.inode_shift(ino)) as *mut Inode,
            *inode,
        );
    }
    device.write_block(block, buf.as_ref())
}
