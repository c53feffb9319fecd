//! Online consistency checker.
//!
//! Recomputes every reference count from the inode table and compares it
//! against the metadata region, and verifies that the free counters match
//! the bitmap popcounts. Run on a quiescent volume (the facade takes the
//! freeze lock).

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};

use log::error;

use crate::config::*;
use crate::error::FsError;
use crate::inode::read_inode;
use crate::inode_data::read_entry;
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

/// Verify the volume's global invariants:
/// - free counters equal bitmap popcounts;
/// - every refcount in the metadata region equals the number of live
///   references reachable from the inode table;
/// - allocated objects are referenced and referenced objects are allocated;
/// - free data blocks are zeroed.
pub fn check(device: &impl BlockDevice, sbi: &SbInfo) -> Result<()> {
    check_counters(sbi)?;

    // How many inode slots name each inode-data entry.
    let mut slot_counts: BTreeMap<u32, u32> = BTreeMap::new();

    for ino in 1..sbi.nr_inodes {
        let inode = read_inode(device, sbi, ino)?;
        if !sbi.ifree.is_allocated(ino) {
            if !inode.is_dead() {
                error!("free inode {} still maps inode-data", ino);
                return Err(FsError::Corrupted);
            }
            continue;
        }
        if inode.is_dead() {
            error!("allocated inode {} is dead", ino);
            return Err(FsError::Corrupted);
        }
        for &idx in inode.i_data.iter() {
            if idx == 0 {
                continue;
            }
            if !sbi.idfree.is_allocated(idx) {
                error!("inode {} references free inode-data entry {}", ino, idx);
                return Err(FsError::Corrupted);
            }
            *slot_counts.entry(idx).or_insert(0) += 1;
        }
    }

    // Every allocated entry must be named by some slot.
    for idx in sbi.idfree.allocated() {
        if !slot_counts.contains_key(&idx) {
            error!("inode-data entry {} is allocated but unreferenced", idx);
            return Err(FsError::Corrupted);
        }
    }

    // Expected refcount per data block.
    let mut expected: BTreeMap<u32, u32> = BTreeMap::new();

    // Inode-data host blocks are referenced by their index slot.
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    for i in 0..sbi.nr_ididx_blocks {
        device.read_block(sbi.ididx_start() + i, buf.as_mut())?;
        let slots =
            unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const u32, INDEX_BLOCK_LEN) };
        for &bno in slots.iter() {
            if bno != 0 {
                *expected.entry(bno).or_insert(0) += 1;
            }
        }
    }

    // Index blocks are referenced once per slot naming their entry; the data
    // blocks of a file are referenced once per index block listing them.
    let mut seen_index_blocks: BTreeSet<u32> = BTreeSet::new();
    for (&idx, &count) in slot_counts.iter() {
        let (entry, _) = read_entry(device, sbi, idx)?;
        if entry.refcount as u32 != count {
            error!(
                "inode-data entry {} has refcount {}, expected {}",
                idx, entry.refcount, count
            );
            return Err(FsError::Corrupted);
        }
        if entry.index_block == 0 {
            continue;
        }
        *expected.entry(entry.index_block).or_insert(0) += count;
        if entry.is_regular_file() && seen_index_blocks.insert(entry.index_block) {
            device.read_block(entry.index_block, buf.as_mut())?;
            let slots =
                unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const u32, INDEX_BLOCK_LEN) };
            for &bno in slots.iter() {
                if bno != 0 {
                    *expected.entry(bno).or_insert(0) += 1;
                }
            }
        }
    }

    check_data_region(device, sbi, &expected)
}

fn check_counters(sbi: &SbInfo) -> Result<()> {
    for (name, bitmap) in [
        ("inode", &sbi.ifree),
        ("block", &sbi.bfree),
        ("inode-data", &sbi.idfree),
    ] {
        if bitmap.nr_free() != bitmap.count_free() {
            error!(
                "{} bitmap: counter {} != popcount {}",
                name,
                bitmap.nr_free(),
                bitmap.count_free()
            );
            return Err(FsError::Corrupted);
        }
    }
    Ok(())
}

fn check_data_region(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    expected: &BTreeMap<u32, u32>,
) -> Result<()> {
    let mut meta = Box::new([0u8; BLOCK_SIZE]);
    let mut buf = Box::new([0u8; BLOCK_SIZE]);

    for bno in sbi.data_start()..sbi.nr_blocks {
        if sbi.meta_shift(bno) == 0 {
            device.read_block(sbi.meta_block(bno), meta.as_mut())?;
        }
        let actual = meta[sbi.meta_shift(bno)] as u32;
        let want = expected.get(&bno).copied().unwrap_or(0);
        let allocated = sbi.bfree.is_allocated(bno);

        if actual != want {
            error!("block {}: refcount {}, expected {}", bno, actual, want);
            return Err(FsError::Corrupted);
        }
        if want > 0 && !allocated {
            error!("block {} is referenced but marked free", bno);
            return Err(FsError::Corrupted);
        }
        if want == 0 {
            if allocated {
                error!("block {} is allocated but unreferenced", bno);
                return Err(FsError::Corrupted);
            }
            device.read_block(bno, buf.as_mut())?;
            if buf.iter().any(|&b| b != 0) {
                error!("free block {} is not zeroed", bno);
                return Err(FsError::Corrupted);
            }
        }
    }
    Ok(())
}
