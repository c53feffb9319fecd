//! Snapshot management: a bounded table of descriptors in the superblock,
//! sharing live blocks with snapshots until divergence.
//!
//! Every function here runs with the filesystem frozen: the caller holds the
//! write side of the freeze lock and has flushed all dirty state, so this
//! module is the only writer for the duration of an operation.

use core::fmt::Write;

use log::{debug, error, info};

use crate::config::*;
use crate::error::FsError;
use crate::inode::read_inode;
use crate::inode_data::{link_inode_data, put_inode_data};
use crate::structs::SnapshotInfo;
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

fn find_slot(sbi: &SbInfo, id: u32) -> Option<usize> {
    (1..MAX_SNAPSHOTS).find(|&k| sbi.snapshots[k].id == id)
}

/// Smallest positive id absent from the table.
fn pick_id(sbi: &SbInfo) -> u32 {
    let mut id = 1;
    while sbi.snapshots.iter().any(|s| s.id == id) {
        id += 1;
    }
    id
}

/// Capture the live state into the lowest free snapshot slot. With a
/// non-zero `id_hint` the snapshot gets that id, otherwise the smallest
/// positive id not present in the table.
///
/// On an I/O error the slot is not published; reference counts already
/// taken stay behind as lost capacity, not corruption.
pub fn create(
    device: &impl BlockDevice,
    sbi: &mut SbInfo,
    id_hint: u32,
    now: i64,
) -> Result<u32> {
    let slot = match (1..MAX_SNAPSHOTS).find(|&k| sbi.snapshots[k].is_empty()) {
        Some(slot) => slot,
        None => return Err(FsError::NoSpace),
    };

    let id = if id_hint != 0 {
        if sbi.snapshots.iter().any(|s| s.id == id_hint) {
            return Err(FsError::AlreadyExists);
        }
        id_hint
    } else {
        pick_id(sbi)
    };

    // Share every live inode into the new slot. The on-disk inode table is
    // the authority; there is no in-memory inode list to consult.
    for ino in sbi.ifree.allocated() {
        let inode = read_inode(device, sbi, ino)?;
        if inode.i_data[LIVE_SLOT] != 0 {
            link_inode_data(device, sbi, ino, LIVE_SLOT, slot)?;
            debug!("shared ino={} into slot {}", ino, slot);
        }
    }

    sbi.snapshots[slot] = SnapshotInfo { created: now, id };
    info!("created snapshot {} in slot {}", id, slot);
    Ok(id)
}

/// Drop the snapshot with the given id, releasing its claim on every inode.
pub fn delete(device: &impl BlockDevice, sbi: &mut SbInfo, id: u32) -> Result<()> {
    if id == 0 {
        return Err(FsError::InvalidArgument);
    }
    let slot = find_slot(sbi, id).ok_or(FsError::NotFound)?;

    for ino in sbi.ifree.allocated() {
        let inode = read_inode(device, sbi, ino)?;
        if inode.i_data[slot] != 0 {
            put_inode_data(device, sbi, ino, slot)?;
            debug!("put ino={} from slot {}", ino, slot);
        }
    }

    sbi.snapshots[slot] = SnapshotInfo::EMPTY;
    info!("deleted snapshot {} (slot {})", id, slot);
    Ok(())
}

/// Make the live state a writable copy of the given snapshot. The snapshot
/// itself survives: the live slot drops its current claim per inode and
/// re-links the snapshot's inode-data, sharing until the next write.
///
/// An I/O error mid-restore leaves the volume half-switched; the embedder
/// must treat that as fatal for this mount.
pub fn restore(device: &impl BlockDevice, sbi: &mut SbInfo, id: u32) -> Result<()> {
    if id == 0 {
        return Err(FsError::InvalidArgument);
    }
    let slot = find_slot(sbi, id).ok_or(FsError::NotFound)?;

    for ino in sbi.ifree.allocated() {
        let inode = read_inode(device, sbi, ino)?;
        if inode.i_data[LIVE_SLOT] != 0 {
            if let Err(e) = put_inode_data(device, sbi, ino, LIVE_SLOT) {
                error!("restore of snapshot {} failed mid-way on ino {}", id, ino);
                return Err(e);
            }
        }
        // Inodes absent from the snapshot stay dead; their numbers were
        // released by the put above.
        let inode = read_inode(device, sbi, ino)?;
        if inode.i_data[slot] != 0 {
            if let Err(e) = link_inode_data(device, sbi, ino, slot, LIVE_SLOT) {
                error!("restore of snapshot {} failed mid-way on ino {}", id, ino);
                return Err(e);
            }
        }
    }

    info!("restored snapshot {} (slot {})", id, slot);
    Ok(())
}

struct ListWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Write for ListWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        if self.pos + bytes.len() > self.buf.len() {
            return Err(core::fmt::Error);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

/// Format one line per snapshot, in slot order, skipping the live slot and
/// empty slots: `"<id>: DD.MM.YY HH:MM:SS\n"`. Output is truncated to the
/// buffer (one page); returns the number of bytes written.
pub fn list(sbi: &SbInfo, buf: &mut [u8]) -> usize {
    let mut w = ListWriter { buf, pos: 0 };
    for snap in sbi.snapshots[1..].iter().filter(|s| !s.is_empty()) {
        let (year, month, day, hour, min, sec) = broken_down_utc(snap.created);
        let line = write!(
            w,
            "{}: {:02}.{:02}.{:02} {:02}:{:02}:{:02}\n",
            snap.id,
            day,
            month,
            year.rem_euclid(100),
            hour,
            min,
            sec
        );
        if line.is_err() {
            break;
        }
    }
    w.pos
}

/// Broken-down UTC representation of an epoch timestamp.
fn broken_down_utc(secs: i64) -> (i64, u32, u32, u32, u32, u32) {
    let days = secs.div_euclid(86400);
    let rem = secs.rem_euclid(86400);
    let hour = (rem / 3600) as u32;
    let min = (rem % 3600 / 60) as u32;
    let sec = (rem % 60) as u32;

    // Civil-from-days on the proleptic Gregorian calendar.
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);

    (year, month, day, hour, min, sec)
}
