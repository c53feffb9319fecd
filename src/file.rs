//! File content access through index blocks.
//!
//! A regular file maps its logical blocks through a single index block of
//! 1024 entries (zero = hole), capping files at 4 MiB. Writers run a two
//! step copy-on-write ladder: first the index block, then the touched data
//! block, so snapshots sharing either keep seeing the original bytes.

use alloc::boxed::Box;

use log::debug;

use crate::block::{alloc_block, cow_block, get_block, put_block, BlockKind};
use crate::config::*;
use crate::error::FsError;
use crate::inode_data::{get_inode_data, write_entry};
use crate::structs::{InodeData, Timespec};
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

fn index_slots(buf: &[u8; BLOCK_SIZE]) -> &[u32] {
    unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const u32, INDEX_BLOCK_LEN) }
}

fn index_slots_mut(buf: &mut [u8; BLOCK_SIZE]) -> &mut [u32] {
    unsafe { core::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u32, INDEX_BLOCK_LEN) }
}

/// Map the `iblk`-th logical block of the file described by `data`.
///
/// With `create`, an unallocated slot gets a fresh block. With `cow`, the
/// index block and the resolved data block are made private first; the
/// caller must write `data` back if `data.index_block` changed. Returns the
/// physical block number, 0 for a hole read.
pub fn file_get_block(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    data: &mut InodeData,
    iblk: u32,
    create: bool,
    cow: bool,
) -> Result<u32> {
    if iblk >= INDEX_BLOCK_LEN as u32 {
        return Err(FsError::TooBig);
    }

    if cow {
        let block = cow_block(device, sbi, data.index_block, BlockKind::Index)?;
        if block != data.index_block {
            data.index_block = block;
        }
    }

    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(data.index_block, buf.as_mut())?;

    let mut bno = index_slots(&buf)[iblk as usize];
    if bno == 0 {
        if !create {
            return Ok(0);
        }
        bno = alloc_block(device, sbi)?;
        index_slots_mut(&mut buf)[iblk as usize] = bno;
        device.write_block(data.index_block, buf.as_ref())?;
    } else if cow {
        let copy = cow_block(device, sbi, bno, BlockKind::Data)?;
        if copy != bno {
            bno = copy;
            index_slots_mut(&mut buf)[iblk as usize] = bno;
            device.write_block(data.index_block, buf.as_ref())?;
        }
    }

    debug!("mapped iblock {} to block {} (cow={})", iblk, bno, cow);
    Ok(bno)
}

/// Read up to `buffer.len()` bytes starting at `offset`. Reads past the end
/// of file are shortened; holes read as zeroes. Never allocates or copies.
pub fn fread(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    ino: u32,
    offset: usize,
    buffer: &mut [u8],
) -> Result<usize> {
    let (mut data, _) = get_inode_data(device, sbi, ino, false, false)?;
    if !data.is_regular_file() {
        return Err(FsError::NotFile);
    }

    let size = data.size as usize;
    if offset >= size || buffer.is_empty() {
        return Ok(0);
    }
    let to_read = buffer.len().min(size - offset);

    let mut bytes_read = 0;
    let mut current_offset = offset;
    let mut block_buf = Box::new([0u8; BLOCK_SIZE]);

    while bytes_read < to_read {
        let start = current_offset % BLOCK_SIZE;
        let chunk = (BLOCK_SIZE - start).min(to_read - bytes_read);
        let iblk = (current_offset / BLOCK_SIZE) as u32;

        let bno = file_get_block(device, sbi, &mut data, iblk, false, false)?;
        if bno == 0 {
            buffer[bytes_read..bytes_read + chunk].fill(0);
        } else {
            device.read_block(bno, block_buf.as_mut())?;
            buffer[bytes_read..bytes_read + chunk].copy_from_slice(&block_buf[start..start + chunk]);
        }

        bytes_read += chunk;
        current_offset += chunk;
    }

    Ok(bytes_read)
}

/// Write `buffer` at `offset`, growing the file as needed. Shared metadata
/// and blocks are copied before the first byte lands.
pub fn fwrite(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    ino: u32,
    offset: usize,
    buffer: &[u8],
    now: Timespec,
) -> Result<usize> {
    if buffer.is_empty() {
        return Ok(0);
    }
    let end = offset
        .checked_add(buffer.len())
        .filter(|&end| end <= MAX_FILESIZE)
        .ok_or(FsError::TooBig)?;

    let (mut data, idx) = get_inode_data(device, sbi, ino, false, true)?;
    if !data.is_regular_file() {
        return Err(FsError::NotFile);
    }

    // Make sure the write can complete before allocating anything.
    let nr_allocs = (end.max(data.size as usize).div_ceil(BLOCK_SIZE) as u32)
        .saturating_sub(data.blocks.saturating_sub(1));
    if nr_allocs > sbi.bfree.nr_free() {
        return Err(FsError::NoSpace);
    }

    let mut bytes_written = 0;
    let mut current_offset = offset;
    let mut block_buf = Box::new([0u8; BLOCK_SIZE]);

    while bytes_written < buffer.len() {
        let start = current_offset % BLOCK_SIZE;
        let chunk = (BLOCK_SIZE - start).min(buffer.len() - bytes_written);
        let iblk = (current_offset / BLOCK_SIZE) as u32;

        let bno = file_get_block(device, sbi, &mut data, iblk, true, true)?;
        device.read_block(bno, block_buf.as_mut())?;
        block_buf[start..start + chunk]
            .copy_from_slice(&buffer[bytes_written..bytes_written + chunk]);
        device.write_block(bno, block_buf.as_ref())?;

        bytes_written += chunk;
        current_offset += chunk;
    }

    if end > data.size as usize {
        data.size = end as u32;
    }
    // The extra block is the index block.
    data.blocks = 1 + (data.size as usize).div_ceil(BLOCK_SIZE) as u32;
    data.touch_modified(now);
    write_entry(device, sbi, idx, &data)?;

    Ok(bytes_written)
}

/// Put every allocated block from logical index `start` to capacity and
/// clear the slots. The index block must be private to the caller. Holes do
/// not stop the scan.
pub(crate) fn truncate_index_block(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    index_block: u32,
    start: u32,
) -> Result<()> {
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(index_block, buf.as_mut())?;

    let slots = index_slots_mut(&mut buf);
    let mut dirty = false;
    for i in start as usize..INDEX_BLOCK_LEN {
        if slots[i] != 0 {
            let bno = slots[i];
            slots[i] = 0;
            dirty = true;
            put_block(device, sbi, bno, BlockKind::Data)?;
        }
    }

    if dirty {
        device.write_block(index_block, buf.as_ref())?;
    }
    Ok(())
}

/// Truncate the file to `new_size` bytes. Shrinking releases every block
/// past the cut; growing just extends the size (reads of the gap see a
/// hole).
pub fn truncate(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    ino: u32,
    new_size: usize,
    now: Timespec,
) -> Result<()> {
    if new_size > MAX_FILESIZE {
        return Err(FsError::TooBig);
    }
    let (mut data, idx) = get_inode_data(device, sbi, ino, false, true)?;
    if !data.is_regular_file() {
        return Err(FsError::NotFile);
    }

    if new_size < data.size as usize {
        let block = cow_block(device, sbi, data.index_block, BlockKind::Index)?;
        data.index_block = block;
        let keep = new_size.div_ceil(BLOCK_SIZE) as u32;
        truncate_index_block(device, sbi, block, keep)?;
    }

    data.size = new_size as u32;
    data.blocks = 1 + new_size.div_ceil(BLOCK_SIZE) as u32;
    data.touch_modified(now);
    write_entry(device, sbi, idx, &data)
}

/// Share the whole content of `src` into `dst` by swapping `dst`'s index
/// block for `src`'s. `dst`'s previous content is put. Returns the number of
/// bytes now shared.
pub fn reflink(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    src_ino: u32,
    dst_ino: u32,
    now: Timespec,
) -> Result<u32> {
    let (src, _) = get_inode_data(device, sbi, src_ino, false, false)?;
    if !src.is_regular_file() {
        return Err(FsError::NotFile);
    }
    let (mut dst, dst_idx) = get_inode_data(device, sbi, dst_ino, false, true)?;
    if !dst.is_regular_file() {
        return Err(FsError::NotFile);
    }

    debug!("reflinking inode {} into {}", src_ino, dst_ino);

    if src.index_block != dst.index_block {
        get_block(device, sbi, src.index_block)?;
        put_block(device, sbi, dst.index_block, BlockKind::Index)?;
        dst.index_block = src.index_block;
    }

    dst.size = src.size;
    dst.blocks = src.blocks;
    dst.touch_modified(now);
    write_entry(device, sbi, dst_idx, &dst)?;
    Ok(src.size)
}

/// Share `len` bytes of blocks between two files. Offsets and length must be
/// block-aligned; `dst` must reach at least to `dst_off`. Blocks already
/// shared are skipped. Returns the number of bytes reflinked.
pub fn reflink_range(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    src_ino: u32,
    src_off: usize,
    dst_ino: u32,
    dst_off: usize,
    len: usize,
    now: Timespec,
) -> Result<u32> {
    if src_off % BLOCK_SIZE != 0 || dst_off % BLOCK_SIZE != 0 || len % BLOCK_SIZE != 0 {
        return Err(FsError::InvalidArgument);
    }
    if dst_off + len > MAX_FILESIZE {
        return Err(FsError::TooBig);
    }

    let (src, _) = get_inode_data(device, sbi, src_ino, false, false)?;
    if !src.is_regular_file() {
        return Err(FsError::NotFile);
    }
    if src_off + len > src.size as usize {
        return Err(FsError::InvalidArgument);
    }
    let (mut dst, dst_idx) = get_inode_data(device, sbi, dst_ino, false, true)?;
    if !dst.is_regular_file() {
        return Err(FsError::NotFile);
    }
    if dst_off > dst.size as usize {
        return Err(FsError::InvalidArgument);
    }

    let len_b = len / BLOCK_SIZE;
    let s_off_b = src_off / BLOCK_SIZE;
    let d_off_b = dst_off / BLOCK_SIZE;
    debug!(
        "reflinking {} blocks, src={} (at {}), dst={} (at {})",
        len_b, src_ino, s_off_b, dst_ino, d_off_b
    );

    let mut src_buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(src.index_block, src_buf.as_mut())?;

    let block = cow_block(device, sbi, dst.index_block, BlockKind::Index)?;
    dst.index_block = block;

    let mut dst_buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(dst.index_block, dst_buf.as_mut())?;

    let mut reflinked = 0usize;
    let mut dirty = false;
    for i in 0..len_b {
        let src_bno = index_slots(&src_buf)[s_off_b + i];
        let dst_bno = index_slots(&dst_buf)[d_off_b + i];

        // Holes stay holes; already shared blocks are counted as done.
        if src_bno == dst_bno {
            reflinked += BLOCK_SIZE;
            continue;
        }
        if src_bno == 0 {
            continue;
        }

        get_block(device, sbi, src_bno)?;
        if dst_bno != 0 {
            put_block(device, sbi, dst_bno, BlockKind::Data)?;
        }
        index_slots_mut(&mut dst_buf)[d_off_b + i] = src_bno;
        dirty = true;
        reflinked += BLOCK_SIZE;
    }

    if dirty {
        device.write_block(dst.index_block, dst_buf.as_ref())?;
    }

    if dst_off + reflinked > dst.size as usize {
        dst.size = (dst_off + reflinked) as u32;
    }
    dst.blocks = 1 + (dst.size as usize).div_ceil(BLOCK_SIZE) as u32;
    dst.touch_modified(now);
    write_entry(device, sbi, dst_idx, &dst)?;

    Ok(reflinked as u32)
}
