//! The `FileSystem` facade: mount/format/sync, the namespace and file
//! operations, and the snapshot control surface.
//!
//! Concurrency model: the in-memory superblock sits behind a reader-writer
//! lock. Every ordinary operation holds the read side for its full duration;
//! snapshot operations and sync take the write side, which is the freeze —
//! while held, snapshot code is the only writer and the device has been
//! flushed. Callers that can issue concurrent operations against the *same*
//! file or directory must serialize those themselves; per-inode locking is
//! the embedder's job.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write as _;

use log::warn;
use spin::RwLock;

use crate::block::{alloc_block, put_block, BlockKind};
use crate::config::*;
use crate::error::FsError;
use crate::inode_data::{get_inode_data, put_inode_data, write_entry};
use crate::path::{resolve, split};
use crate::structs::*;
use crate::superblock::{self, SbInfo};
use crate::{check, directory, file, snapshot, BlockDevice, Result};

/// Counters describing the volume, as of the last observed state.
#[derive(Debug, Clone, Copy)]
pub struct FsStat {
    pub nr_blocks: u32,
    pub nr_free_blocks: u32,
    pub nr_inodes: u32,
    pub nr_free_inodes: u32,
    pub nr_inode_data_entries: u32,
    pub nr_free_inode_data_entries: u32,
    /// Snapshots currently held, not counting the live slot.
    pub nr_snapshots: u32,
}

pub struct FileSystem<D: BlockDevice> {
    device: Arc<D>,
    sbi: RwLock<SbInfo>,
}

fn now() -> Timespec {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Timespec {
        sec: since_epoch.as_secs() as u32,
        nsec: since_epoch.subsec_nanos() as u64,
    }
}

impl<D: BlockDevice> FileSystem<D> {
    /// Write an empty volume onto the device and mount it.
    pub fn format(device: Arc<D>, nr_blocks: u32, nr_inodes: u32) -> Result<Self> {
        let sbi = superblock::format_volume(&*device, nr_blocks, nr_inodes, now().sec as i64)?;
        Ok(Self {
            device,
            sbi: RwLock::new(sbi),
        })
    }

    /// Mount an existing volume: load the superblock and bitmaps and check
    /// that the live root resolves to a directory.
    pub fn mount(device: Arc<D>) -> Result<Self> {
        let sbi = superblock::load(&*device)?;
        let (root, _) = get_inode_data(&*device, &sbi, ROOT_INODE_ID, false, false)?;
        if !root.is_directory() {
            warn!("root inode is not a directory, mode {:#o}", root.mode);
            return Err(FsError::Corrupted);
        }
        Ok(Self {
            device,
            sbi: RwLock::new(sbi),
        })
    }

    /// Flush the superblock and bitmaps; with `wait`, also flush the device.
    pub fn sync(&self, wait: bool) -> Result<()> {
        let sbi = self.sbi.write();
        superblock::sync(&*self.device, &sbi, wait)
    }

    /// Create a regular file or directory. Returns the new inode number.
    pub fn creat(&self, path: &str, kind: FileKind, perm: u32) -> Result<u32> {
        let sbi = self.sbi.read();
        let (parent_path, name) = split(path)?;
        if name.is_empty() {
            return Err(FsError::InvalidFileName);
        }
        let (_, parent_ino) = resolve(&*self.device, &sbi, &parent_path)?;
        let now = now();

        if directory::lookup(&*self.device, &sbi, parent_ino, name.as_bytes()).is_ok() {
            return Err(FsError::AlreadyExists);
        }
        if sbi.ifree.nr_free() == 0 || sbi.bfree.nr_free() == 0 {
            return Err(FsError::NoSpace);
        }

        let ino = sbi.ifree.alloc()?;
        if let Err(e) = get_inode_data(&*self.device, &sbi, ino, true, false) {
            let _ = sbi.ifree.free(ino);
            return Err(e);
        }

        // From here on `put_inode_data` unwinds everything: the entry, its
        // host block if now empty, the index block once the entry records
        // it, and the inode number.
        let unwind = |e: FsError| {
            if let Err(cleanup) = put_inode_data(&*self.device, &sbi, ino, LIVE_SLOT) {
                warn!("failed to unwind inode {}: {:?}", ino, cleanup);
            }
            Err(e)
        };

        if let Err(e) = self.creat_init(&sbi, ino, kind, perm, now) {
            return unwind(e);
        }
        if let Err(e) =
            directory::add_entry(&*self.device, &sbi, parent_ino, name.as_bytes(), ino, now)
        {
            return unwind(e);
        }
        if kind == FileKind::Directory {
            if let Err(e) = self.adjust_parent_links(&sbi, parent_ino, 1, now) {
                warn!("failed to bump link count of inode {}: {:?}", parent_ino, e);
            }
        }
        Ok(ino)
    }

    /// Give the fresh inode its index block and a fully initialized
    /// inode-data entry.
    fn creat_init(
        &self,
        sbi: &SbInfo,
        ino: u32,
        kind: FileKind,
        perm: u32,
        now: Timespec,
    ) -> Result<()> {
        let index_block = alloc_block(&*self.device, sbi)?;

        let res = (|| {
            // Scrub the block: a directory block full of stale entries or an
            // index block of stale pointers would resurrect old data.
            let zeroes = alloc::boxed::Box::new([0u8; BLOCK_SIZE]);
            self.device.write_block(index_block, zeroes.as_ref())?;

            let mut data = InodeData::new(kind, perm, now);
            data.index_block = index_block;
            data.blocks = 1;
            if kind == FileKind::Directory {
                data.size = BLOCK_SIZE as u32;
            }
            let (_, idx) = get_inode_data(&*self.device, sbi, ino, false, false)?;
            write_entry(&*self.device, sbi, idx, &data)
        })();

        if let Err(e) = res {
            // The entry may not reference the block yet; drop it directly.
            if let Err(cleanup) = put_block(&*self.device, sbi, index_block, BlockKind::Data) {
                warn!("failed to unwind block {}: {:?}", index_block, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    fn adjust_parent_links(
        &self,
        sbi: &SbInfo,
        parent_ino: u32,
        delta: i32,
        now: Timespec,
    ) -> Result<()> {
        let (mut parent, idx) = get_inode_data(&*self.device, sbi, parent_ino, false, true)?;
        parent.nlink = parent.nlink.saturating_add_signed(delta);
        parent.touch_modified(now);
        write_entry(&*self.device, sbi, idx, &parent)
    }

    /// Unlink a file or remove an empty directory. `kind` must match the
    /// object being removed.
    pub fn remove(&self, path: &str, kind: FileKind) -> Result<()> {
        let sbi = self.sbi.read();
        let (parent_path, name) = split(path)?;
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let (_, parent_ino) = resolve(&*self.device, &sbi, &parent_path)?;
        let ino = directory::lookup(&*self.device, &sbi, parent_ino, name.as_bytes())?;
        let (data, _) = get_inode_data(&*self.device, &sbi, ino, false, false)?;
        let now = now();

        match kind {
            FileKind::Directory => {
                if !data.is_directory() {
                    return Err(FsError::NotDirectory);
                }
                if !directory::is_empty(&*self.device, &sbi, ino)? {
                    return Err(FsError::NotEmpty);
                }
            }
            FileKind::Regular => {
                if !data.is_regular_file() {
                    return Err(FsError::NotFile);
                }
            }
        }

        directory::remove_entry(&*self.device, &sbi, parent_ino, name.as_bytes(), now)?;
        put_inode_data(&*self.device, &sbi, ino, LIVE_SLOT)?;
        if kind == FileKind::Directory {
            self.adjust_parent_links(&sbi, parent_ino, -1, now)?;
        }
        Ok(())
    }

    /// Rename within a directory or move across directories. When moving,
    /// the new entry is inserted before the old one is removed.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let sbi = self.sbi.read();
        let (old_parent_path, old_name) = split(old_path)?;
        let (new_parent_path, new_name) = split(new_path)?;
        if old_name.is_empty() || new_name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let (_, old_parent) = resolve(&*self.device, &sbi, &old_parent_path)?;
        let (_, new_parent) = resolve(&*self.device, &sbi, &new_parent_path)?;
        let now = now();

        if old_parent == new_parent {
            return directory::rename_entry(
                &*self.device,
                &sbi,
                old_parent,
                old_name.as_bytes(),
                new_name.as_bytes(),
                now,
            );
        }

        let ino = directory::lookup(&*self.device, &sbi, old_parent, old_name.as_bytes())?;
        let (data, _) = get_inode_data(&*self.device, &sbi, ino, false, false)?;

        directory::add_entry(&*self.device, &sbi, new_parent, new_name.as_bytes(), ino, now)?;
        directory::remove_entry(&*self.device, &sbi, old_parent, old_name.as_bytes(), now)?;
        if data.is_directory() {
            self.adjust_parent_links(&sbi, new_parent, 1, now)?;
            self.adjust_parent_links(&sbi, old_parent, -1, now)?;
        }
        Ok(())
    }

    pub fn lookup(&self, path: &str) -> Result<(u32, FileKind)> {
        let sbi = self.sbi.read();
        let (_, ino) = resolve(&*self.device, &sbi, path)?;
        let (data, _) = get_inode_data(&*self.device, &sbi, ino, false, false)?;
        Ok((ino, data.kind()?))
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let sbi = self.sbi.read();
        let (_, ino) = resolve(&*self.device, &sbi, path)?;
        let (data, _) = get_inode_data(&*self.device, &sbi, ino, false, false)?;
        Ok(Stat {
            ino,
            kind: data.kind()?,
            mode: data.mode,
            uid: data.uid,
            gid: data.gid,
            size: data.size,
            blocks: data.blocks,
            nlink: data.nlink,
        })
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let sbi = self.sbi.read();
        let (_, ino) = resolve(&*self.device, &sbi, path)?;
        directory::read_dir(&*self.device, &sbi, ino)
    }

    pub fn fread(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let sbi = self.sbi.read();
        let (_, ino) = resolve(&*self.device, &sbi, path)?;
        file::fread(&*self.device, &sbi, ino, offset, buf)
    }

    pub fn fwrite(&self, path: &str, offset: usize, buf: &[u8]) -> Result<usize> {
        let sbi = self.sbi.read();
        let (_, ino) = resolve(&*self.device, &sbi, path)?;
        file::fwrite(&*self.device, &sbi, ino, offset, buf, now())
    }

    pub fn truncate(&self, path: &str, new_size: usize) -> Result<()> {
        let sbi = self.sbi.read();
        let (_, ino) = resolve(&*self.device, &sbi, path)?;
        file::truncate(&*self.device, &sbi, ino, new_size, now())
    }

    /// Share the whole content of `src_path` into `dst_path` without
    /// copying. Both files become copy-on-write. Returns the shared length.
    pub fn reflink(&self, src_path: &str, dst_path: &str) -> Result<u32> {
        let sbi = self.sbi.read();
        let (_, src_ino) = resolve(&*self.device, &sbi, src_path)?;
        let (_, dst_ino) = resolve(&*self.device, &sbi, dst_path)?;
        if src_ino == dst_ino {
            return Err(FsError::InvalidArgument);
        }
        file::reflink(&*self.device, &sbi, src_ino, dst_ino, now())
    }

    /// Share `len` bytes of blocks between two files at block-aligned
    /// offsets. Returns the number of bytes reflinked.
    pub fn reflink_range(
        &self,
        src_path: &str,
        src_off: usize,
        dst_path: &str,
        dst_off: usize,
        len: usize,
    ) -> Result<u32> {
        let sbi = self.sbi.read();
        let (_, src_ino) = resolve(&*self.device, &sbi, src_path)?;
        let (_, dst_ino) = resolve(&*self.device, &sbi, dst_path)?;
        file::reflink_range(
            &*self.device,
            &sbi,
            src_ino,
            src_off,
            dst_ino,
            dst_off,
            len,
            now(),
        )
    }

    /// Capture the live state as a new snapshot. With `id_hint == 0` the
    /// smallest positive id not in use is assigned. The volume is frozen for
    /// the duration: in-flight operations drain, dirty buffers are flushed,
    /// and the snapshot table is persisted before thaw.
    pub fn snapshot_create(&self, id_hint: u32) -> Result<u32> {
        let mut sbi = self.sbi.write();
        self.device.flush()?;
        let id = snapshot::create(&*self.device, &mut sbi, id_hint, now().sec as i64)?;
        superblock::sync(&*self.device, &sbi, true)?;
        Ok(id)
    }

    /// Delete the snapshot with the given id. The live state is unaffected.
    pub fn snapshot_delete(&self, id: u32) -> Result<()> {
        let mut sbi = self.sbi.write();
        self.device.flush()?;
        snapshot::delete(&*self.device, &mut sbi, id)?;
        superblock::sync(&*self.device, &sbi, true)
    }

    /// Replace the live state with a writable copy of the given snapshot.
    /// The snapshot itself is preserved. Inode numbers cached by the caller
    /// are invalid afterwards and must be re-resolved.
    pub fn snapshot_restore(&self, id: u32) -> Result<()> {
        let mut sbi = self.sbi.write();
        self.device.flush()?;
        snapshot::restore(&*self.device, &mut sbi, id)?;
        superblock::sync(&*self.device, &sbi, true)
    }

    /// Write one line per snapshot into `buf`, in slot order. Returns the
    /// number of bytes written.
    pub fn snapshot_list(&self, buf: &mut [u8; BLOCK_SIZE]) -> usize {
        let sbi = self.sbi.read();
        snapshot::list(&sbi, buf)
    }

    /// Verify the volume's invariants (refcounts, bitmaps, zeroed free
    /// blocks). Freezes the volume while checking.
    pub fn check(&self) -> Result<()> {
        let sbi = self.sbi.write();
        check::check(&*self.device, &sbi)
    }

    pub fn stat_fs(&self) -> FsStat {
        let sbi = self.sbi.read();
        FsStat {
            nr_blocks: sbi.nr_blocks,
            nr_free_blocks: sbi.bfree.nr_free(),
            nr_inodes: sbi.nr_inodes,
            nr_free_inodes: sbi.ifree.nr_free(),
            nr_inode_data_entries: sbi.nr_inode_data_entries,
            nr_free_inode_data_entries: sbi.idfree.nr_free(),
            nr_snapshots: sbi.snapshots[1..].iter().filter(|s| !s.is_empty()).count() as u32,
        }
    }

    pub fn root_inode_id(&self) -> u32 {
        ROOT_INODE_ID
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    pub fn dump(&self) -> String {
        let sbi = self.sbi.read();
        let mut out = String::new();
        let _ = write!(
            out,
            "blocks {}/{} inodes {}/{} inode-data {}/{} snapshots:",
            sbi.bfree.nr_free(),
            sbi.nr_blocks,
            sbi.ifree.nr_free(),
            sbi.nr_inodes,
            sbi.idfree.nr_free(),
            sbi.nr_inode_data_entries,
        );
        for (slot, snap) in sbi.snapshots.iter().enumerate() {
            if slot == LIVE_SLOT || !snap.is_empty() {
                let _ = write!(out, " [{}]={}", slot, snap.id);
            }
        }
        out
    }
}
