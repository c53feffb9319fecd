#![allow(unused)]

mod common;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use common::LruCache;
use gluon::{BlockDevice, Cached, Error, FileKind, FileSystem, Result, BLOCK_SIZE};

const DISK_BLOCKS: u32 = 1024;
const DISK_INODES: u32 = 256;

/// A disk image backed by a regular file.
pub struct VirtDisk {
    inner: Mutex<File>,
    num_blocks: u32,
}

impl VirtDisk {
    pub fn create(path: &Path, num_blocks: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|_| Error::IoError)?;
        file.set_len(num_blocks as u64 * BLOCK_SIZE as u64)
            .map_err(|_| Error::IoError)?;
        Ok(VirtDisk {
            inner: Mutex::new(file),
            num_blocks,
        })
    }

    pub fn open(path: &Path, num_blocks: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| Error::IoError)?;
        Ok(VirtDisk {
            inner: Mutex::new(file),
            num_blocks,
        })
    }
}

impl BlockDevice for VirtDisk {
    fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn read_block(&self, block_id: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        if block_id >= self.num_blocks {
            return Err(Error::InvalidBlockId);
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .seek(SeekFrom::Start(block_id as u64 * BLOCK_SIZE as u64))
            .map_err(|_| Error::IoError)?;
        inner.read_exact(buf).map_err(|_| Error::IoError)
    }

    fn write_block(&self, block_id: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        if block_id >= self.num_blocks {
            return Err(Error::InvalidBlockId);
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .seek(SeekFrom::Start(block_id as u64 * BLOCK_SIZE as u64))
            .map_err(|_| Error::IoError)?;
        inner.write_all(buf).map_err(|_| Error::IoError)
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush().map_err(|_| Error::IoError)
    }
}

#[test]
fn disk_format_and_mount() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.img");

    let disk = VirtDisk::create(&image, DISK_BLOCKS).unwrap();
    let fs = FileSystem::format(Arc::new(disk), DISK_BLOCKS, DISK_INODES).unwrap();
    log!("File System initialized: {}", fs.dump());
    fs.creat("/dir", FileKind::Directory, 0o755).unwrap();
    fs.creat("/dir/file.txt", FileKind::Regular, 0o644).unwrap();
    fs.fwrite("/dir/file.txt", 0, b"on real storage").unwrap();
    fs.sync(true).unwrap();
    drop(fs);

    let disk = VirtDisk::open(&image, DISK_BLOCKS).unwrap();
    let fs = FileSystem::mount(Arc::new(disk)).unwrap();
    log!("File System mounted: {}", fs.dump());
    let mut buf = vec![0u8; 15];
    fs.fread("/dir/file.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"on real storage");
    fs.check().unwrap();
}

#[test]
fn disk_snapshots_survive_remount() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.img");

    let disk = VirtDisk::create(&image, DISK_BLOCKS).unwrap();
    let fs = FileSystem::format(Arc::new(disk), DISK_BLOCKS, DISK_INODES).unwrap();
    fs.creat("/f", FileKind::Regular, 0o644).unwrap();
    fs.fwrite("/f", 0, b"first").unwrap();
    let id = fs.snapshot_create(0).unwrap();
    fs.fwrite("/f", 0, b"later").unwrap();
    fs.sync(true).unwrap();
    drop(fs);

    let disk = VirtDisk::open(&image, DISK_BLOCKS).unwrap();
    let fs = FileSystem::mount(Arc::new(disk)).unwrap();
    let mut buf = [0u8; BLOCK_SIZE];
    let n = fs.snapshot_list(&mut buf);
    let listing = std::str::from_utf8(&buf[..n]).unwrap();
    log!("snapshots after remount:\n{}", listing);
    assert_eq!(listing.lines().count(), 1);
    assert!(listing.starts_with(&format!("{}: ", id)));

    fs.snapshot_restore(id).unwrap();
    let mut buf = vec![0u8; 8];
    let n = fs.fread("/f", 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"first");
    fs.check().unwrap();
}

#[test]
fn disk_cached_stack() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.img");

    let disk = VirtDisk::create(&image, DISK_BLOCKS).unwrap();
    let cached = Cached::new(disk, LruCache::new(8));
    let fs = FileSystem::format(Arc::new(cached), DISK_BLOCKS, DISK_INODES).unwrap();
    fs.creat("/x", FileKind::Regular, 0o644).unwrap();
    fs.fwrite("/x", 0, &vec![0xabu8; BLOCK_SIZE * 2]).unwrap();
    fs.sync(true).unwrap();
    fs.check().unwrap();
    drop(fs);

    let disk = VirtDisk::open(&image, DISK_BLOCKS).unwrap();
    let fs = FileSystem::mount(Arc::new(disk)).unwrap();
    let mut buf = vec![0u8; BLOCK_SIZE * 2];
    fs.fread("/x", 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xab));
    fs.check().unwrap();
}
