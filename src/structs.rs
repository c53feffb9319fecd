use crate::config::*;
use crate::Error;
use crate::Result;

/// On-disk superblock record, stored in block 0. Region sizes written here
/// are authoritative; the free counters must match the bitmap popcounts at
/// every sync point.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiskSuperBlock {
    pub magic: u32,            // Magic number to identify the filesystem
    pub nr_blocks: u32,        // Total number of blocks (incl sb & inodes)
    pub nr_inodes: u32,        // Total number of inodes
    pub nr_istore_blocks: u32, // Number of inode store blocks
    pub nr_ifree_blocks: u32,  // Number of inode free bitmap blocks
    pub nr_bfree_blocks: u32,  // Number of block free bitmap blocks
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
    pub nr_inode_data_entries: u32, // Maximal number of inode data entries
    pub nr_free_inode_data_entries: u32,
    pub nr_idfree_blocks: u32, // Number of inode data free bitmap blocks
    pub nr_ididx_blocks: u32,  // Number of inode data index blocks
    pub nr_meta_blocks: u32,   // Number of metadata blocks
    pub snapshots: [SnapshotInfo; MAX_SNAPSHOTS],
}

/// Snapshot descriptor. Slot 0 always holds the live snapshot with `id = 0`;
/// any other slot with a non-zero id is an immutable snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub created: i64, // Creation time (sec, UTC)
    pub id: u32,      // Unique identifier, 0 = empty slot / live
}

impl SnapshotInfo {
    pub const EMPTY: Self = Self { created: 0, id: 0 };

    pub fn is_empty(&self) -> bool {
        self.id == 0
    }
}

/// On-disk inode record: a mapping from snapshot slot to inode-data entry.
/// The inode number is stable across snapshots; the metadata it resolves to
/// is snapshot-local. `i_data[k] == 0` means the inode does not exist in
/// slot k.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub i_data: [u32; MAX_SNAPSHOTS],
}

impl Inode {
    pub const ZERO: Self = Self {
        i_data: [0; MAX_SNAPSHOTS],
    };

    /// An inode is dead once no snapshot references it anymore.
    pub fn is_dead(&self) -> bool {
        self.i_data.iter().all(|&idx| idx == 0)
    }
}

pub const S_IFMT: u32 = 0xf000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFREG: u32 = 0x8000;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular = S_IFREG,
    Directory = S_IFDIR,
}

/// Inode metadata for one snapshot slot, 80 bytes on disk. `refcount` counts
/// how many inode slots (across all snapshots of the same inode) name this
/// entry; `index_block` is the file index block of a regular file or the
/// directory block of a directory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InodeData {
    pub mode: u32, // File type and permission bits
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub ctime: u32,
    pub nctime: u64,
    pub atime: u32,
    pub natime: u64,
    pub mtime: u32,
    pub nmtime: u64,
    pub blocks: u32, // Block count, including the index block
    pub nlink: u32,
    pub index_block: u32,
    pub refcount: u8,
    pub reserved: [u8; 3],
}

impl InodeData {
    pub const ZERO: Self = Self {
        mode: 0,
        uid: 0,
        gid: 0,
        size: 0,
        ctime: 0,
        nctime: 0,
        atime: 0,
        natime: 0,
        mtime: 0,
        nmtime: 0,
        blocks: 0,
        nlink: 0,
        index_block: 0,
        refcount: 0,
        reserved: [0; 3],
    };

    pub fn new(kind: FileKind, perm: u32, now: Timespec) -> Self {
        let mut data = Self::ZERO;
        data.mode = kind as u32 | (perm & !S_IFMT);
        data.nlink = match kind {
            FileKind::Directory => 2,
            FileKind::Regular => 1,
        };
        data.refcount = 1;
        data.touch(now);
        data
    }

    pub fn kind(&self) -> Result<FileKind> {
        match self.mode & S_IFMT {
            S_IFDIR => Ok(FileKind::Directory),
            S_IFREG => Ok(FileKind::Regular),
            _ => Err(Error::Corrupted),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Stamp all three timestamps.
    pub fn touch(&mut self, now: Timespec) {
        self.atime = now.sec;
        self.natime = now.nsec;
        self.touch_modified(now);
    }

    /// Stamp mtime and ctime, the way a content change does.
    pub fn touch_modified(&mut self, now: Timespec) {
        self.mtime = now.sec;
        self.nmtime = now.nsec;
        self.ctime = now.sec;
        self.nctime = now.nsec;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Timespec {
    pub sec: u32,
    pub nsec: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub inode: u32,
    /// Name of the file or directory, zero-padded to FILENAME_LEN.
    pub name: [u8; FILENAME_LEN],
}

impl DirEntry {
    pub const NULL: Self = Self {
        inode: 0,
        name: [0; FILENAME_LEN],
    };

    pub fn new(inode: u32, name: &[u8]) -> Result<Self> {
        if name.is_empty() || name.len() > FILENAME_LEN {
            return Err(Error::InvalidFileName);
        }
        Ok(Self {
            inode,
            name: {
                let mut arr = [0; FILENAME_LEN];
                arr[..name.len()].copy_from_slice(name);
                arr
            },
        })
    }

    pub fn name_matches(&self, name: &[u8]) -> bool {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
        len == name.len() && self.name[..len] == name[..]
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
        &self.name[..len]
    }
}

/// Metadata snapshot of one file, as returned by `FileSystem::stat`.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub ino: u32,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blocks: u32,
    pub nlink: u32,
}
