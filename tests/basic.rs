#![allow(unused)]

use std::sync::Arc;

mod common;

use common::RamDisk;
use gluon::{Error, FileKind, FileSystem, BLOCK_SIZE, MAX_SUBFILES};

const BLOCKS: u32 = 1024;
const INODES: u32 = 256;

fn fresh_fs() -> FileSystem<RamDisk> {
    let rd = RamDisk::new(BLOCKS);
    FileSystem::format(Arc::new(rd), BLOCKS, INODES).unwrap()
}

#[test]
fn test_format() {
    let fs = fresh_fs();
    log!("{}", fs.dump());
    let stat = fs.stat_fs();
    // Reserved index 0 plus the root.
    assert_eq!(stat.nr_free_inodes, INODES - 2);
    assert_eq!(stat.nr_free_inode_data_entries, stat.nr_inode_data_entries - 2);
    assert_eq!(stat.nr_snapshots, 0);
    fs.check().unwrap();
}

#[test]
fn test_root_dir() {
    let fs = fresh_fs();
    let (ino, kind) = fs.lookup("/").unwrap();
    assert_eq!(ino, fs.root_inode_id());
    assert_eq!(kind, FileKind::Directory);
    let root = fs.stat("/").unwrap();
    assert_eq!(root.nlink, 2);
    assert_eq!(root.size, BLOCK_SIZE as u32);
    assert!(fs.read_dir("/").unwrap().is_empty());
}

#[test]
fn test_create_file() {
    let fs = fresh_fs();
    let ino = fs.creat("/test.txt", FileKind::Regular, 0o644).unwrap();
    let stat = fs.stat("/test.txt").unwrap();
    assert_eq!(stat.ino, ino);
    assert_eq!(stat.kind, FileKind::Regular);
    assert_eq!(stat.size, 0);
    assert_eq!(stat.blocks, 1); // the index block
    assert_eq!(stat.nlink, 1);

    let entries = fs.read_dir("/").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name_bytes(), b"test.txt");
    assert_eq!(entries[0].inode, ino);

    // Creating a file with an existing name must fail.
    let result = fs.creat("/test.txt", FileKind::Regular, 0o644);
    assert_eq!(result, Err(Error::AlreadyExists));
    fs.check().unwrap();
}

#[test]
fn test_lookup() {
    let fs = fresh_fs();
    fs.creat("/test.txt", FileKind::Regular, 0o644).unwrap();
    fs.creat("/test_dir", FileKind::Directory, 0o755).unwrap();

    let (_, kind) = fs.lookup("/test.txt").unwrap();
    assert_eq!(kind, FileKind::Regular);
    let (_, kind) = fs.lookup("/test_dir").unwrap();
    assert_eq!(kind, FileKind::Directory);

    assert_eq!(fs.lookup("/missing"), Err(Error::NotFound));
    assert_eq!(fs.lookup("relative"), Err(Error::InvalidPath));
    // Dot components are not part of this format.
    assert_eq!(fs.lookup("/test_dir/."), Err(Error::InvalidPath));
}

#[test]
fn test_remove_file() {
    let fs = fresh_fs();
    let stat0 = fs.stat_fs();

    let ino = fs.creat("/test.txt", FileKind::Regular, 0o644).unwrap();
    assert_eq!(fs.stat_fs().nr_free_inodes, stat0.nr_free_inodes - 1);
    fs.remove("/test.txt", FileKind::Regular).unwrap();
    assert_eq!(fs.stat_fs().nr_free_inodes, stat0.nr_free_inodes);
    assert_eq!(fs.stat_fs().nr_free_blocks, stat0.nr_free_blocks);
    assert!(fs.read_dir("/").unwrap().is_empty());

    // The inode number is reused.
    let ino2 = fs.creat("/test2.txt", FileKind::Regular, 0o644).unwrap();
    assert_eq!(ino, ino2);
    fs.check().unwrap();
}

#[test]
fn test_remove_keeps_entries_contiguous() {
    let fs = fresh_fs();
    for i in 0..5 {
        fs.creat(&format!("/file_{}", i), FileKind::Regular, 0o644)
            .unwrap();
    }
    fs.remove("/file_2", FileKind::Regular).unwrap();
    let names: Vec<_> = fs
        .read_dir("/")
        .unwrap()
        .iter()
        .map(|e| e.name_bytes().to_vec())
        .collect();
    assert_eq!(
        names,
        vec![
            b"file_0".to_vec(),
            b"file_1".to_vec(),
            b"file_3".to_vec(),
            b"file_4".to_vec()
        ]
    );
    fs.check().unwrap();
}

#[test]
fn test_mkdir() {
    let fs = fresh_fs();
    fs.creat("/dir", FileKind::Directory, 0o755).unwrap();
    assert_eq!(fs.stat("/").unwrap().nlink, 3);

    fs.creat("/dir/file1", FileKind::Regular, 0o644).unwrap();
    fs.creat("/dir/sub", FileKind::Directory, 0o755).unwrap();
    fs.creat("/dir/sub/deep.txt", FileKind::Regular, 0o644)
        .unwrap();

    let (_, kind) = fs.lookup("/dir/sub/deep.txt").unwrap();
    assert_eq!(kind, FileKind::Regular);
    assert_eq!(fs.read_dir("/dir").unwrap().len(), 2);

    // A file is not a directory.
    assert_eq!(
        fs.creat("/dir/file1/x", FileKind::Regular, 0o644),
        Err(Error::NotDirectory)
    );
    fs.check().unwrap();
}

#[test]
fn test_rmdir() {
    let fs = fresh_fs();
    fs.creat("/dir", FileKind::Directory, 0o755).unwrap();
    fs.creat("/dir/file.txt", FileKind::Regular, 0o644).unwrap();

    // Removing a non-empty directory must fail.
    assert_eq!(fs.remove("/dir", FileKind::Directory), Err(Error::NotEmpty));
    // Removing a directory as a file must fail.
    assert_eq!(
        fs.remove("/dir", FileKind::Regular),
        Err(Error::NotFile)
    );

    fs.remove("/dir/file.txt", FileKind::Regular).unwrap();
    fs.remove("/dir", FileKind::Directory).unwrap();
    assert_eq!(fs.stat("/").unwrap().nlink, 2);
    assert!(fs.read_dir("/").unwrap().is_empty());
    fs.check().unwrap();
}

#[test]
fn test_directory_full() {
    let fs = fresh_fs();
    for i in 0..MAX_SUBFILES {
        fs.creat(&format!("/f{}", i), FileKind::Regular, 0o644)
            .unwrap();
    }
    assert_eq!(
        fs.creat("/one_too_many", FileKind::Regular, 0o644),
        Err(Error::DirectoryFull)
    );
    fs.check().unwrap();
}

#[test]
fn test_file_rw() {
    let fs = fresh_fs();
    fs.creat("/test.txt", FileKind::Regular, 0o644).unwrap();

    let data = b"Hello, world!";
    assert_eq!(fs.fwrite("/test.txt", 0, data).unwrap(), data.len());
    assert_eq!(fs.stat("/test.txt").unwrap().size, data.len() as u32);
    assert_eq!(fs.stat("/test.txt").unwrap().blocks, 2);

    let mut buf = vec![0u8; data.len()];
    assert_eq!(fs.fread("/test.txt", 0, &mut buf).unwrap(), data.len());
    assert_eq!(&buf, data);
    fs.check().unwrap();
}

#[test]
fn test_file_rw_multi_block() {
    let fs = fresh_fs();
    fs.creat("/big", FileKind::Regular, 0o644).unwrap();

    let huge: Vec<u8> = (0..BLOCK_SIZE * 5 + 64).map(|i| (i % 251) as u8).collect();
    assert_eq!(fs.fwrite("/big", 0, &huge).unwrap(), huge.len());
    assert_eq!(fs.stat("/big").unwrap().blocks, 7); // 6 data + index

    let mut buf = vec![0u8; huge.len()];
    assert_eq!(fs.fread("/big", 0, &mut buf).unwrap(), huge.len());
    assert_eq!(buf, huge);

    // Unaligned read and write in the middle.
    let patch = b"Hello, Gluon!";
    fs.fwrite("/big", 100, patch).unwrap();
    let mut buf = vec![0u8; patch.len()];
    fs.fread("/big", 100, &mut buf).unwrap();
    assert_eq!(&buf, patch);

    // Reads at EOF are shortened.
    let size = fs.stat("/big").unwrap().size as usize;
    let mut buf = vec![0u8; 128];
    assert_eq!(fs.fread("/big", size - 10, &mut buf).unwrap(), 10);
    assert_eq!(fs.fread("/big", size, &mut buf).unwrap(), 0);

    // Resources come back after removal.
    let free_before = fs.stat_fs().nr_free_blocks;
    fs.remove("/big", FileKind::Regular).unwrap();
    assert!(fs.stat_fs().nr_free_blocks > free_before);
    fs.check().unwrap();
}

#[test]
fn test_file_holes() {
    let fs = fresh_fs();
    fs.creat("/holey", FileKind::Regular, 0o644).unwrap();

    let tail = b"Hollow World...";
    fs.fwrite("/holey", 7 * BLOCK_SIZE, tail).unwrap();
    assert_eq!(
        fs.stat("/holey").unwrap().size as usize,
        7 * BLOCK_SIZE + tail.len()
    );

    // The hole reads as zeroes.
    let mut buf = vec![0xffu8; 32];
    assert_eq!(fs.fread("/holey", 0, &mut buf).unwrap(), 32);
    assert!(buf.iter().all(|&b| b == 0));

    let mut buf = vec![0u8; tail.len()];
    fs.fread("/holey", 7 * BLOCK_SIZE, &mut buf).unwrap();
    assert_eq!(&buf, tail);

    // The block counter follows the size, index block included.
    assert_eq!(fs.stat("/holey").unwrap().blocks, 9);
    fs.check().unwrap();
}

#[test]
fn test_file_too_big() {
    let fs = fresh_fs();
    fs.creat("/max", FileKind::Regular, 0o644).unwrap();
    let res = fs.fwrite("/max", gluon::MAX_FILESIZE, b"x");
    assert_eq!(res, Err(Error::TooBig));
}

#[test]
fn test_truncate() {
    let fs = fresh_fs();
    fs.creat("/t", FileKind::Regular, 0o644).unwrap();
    let data: Vec<u8> = (0..BLOCK_SIZE * 3).map(|i| (i % 13) as u8).collect();
    fs.fwrite("/t", 0, &data).unwrap();
    let free_full = fs.stat_fs().nr_free_blocks;

    fs.truncate("/t", BLOCK_SIZE + 1).unwrap();
    assert_eq!(fs.stat("/t").unwrap().size as usize, BLOCK_SIZE + 1);
    assert_eq!(fs.stat("/t").unwrap().blocks, 3);
    assert_eq!(fs.stat_fs().nr_free_blocks, free_full + 1);

    // The kept prefix is intact.
    let mut buf = vec![0u8; BLOCK_SIZE + 1];
    assert_eq!(fs.fread("/t", 0, &mut buf).unwrap(), BLOCK_SIZE + 1);
    assert_eq!(&buf[..], &data[..BLOCK_SIZE + 1]);

    // Growing just extends with a hole.
    fs.truncate("/t", 2 * BLOCK_SIZE).unwrap();
    let mut buf = vec![0xffu8; 16];
    fs.fread("/t", 2 * BLOCK_SIZE - 16, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    fs.truncate("/t", 0).unwrap();
    assert_eq!(fs.stat("/t").unwrap().blocks, 1);
    fs.check().unwrap();
}

#[test]
fn test_rename() {
    let fs = fresh_fs();
    fs.creat("/a.txt", FileKind::Regular, 0o644).unwrap();
    fs.creat("/dir", FileKind::Directory, 0o755).unwrap();
    fs.fwrite("/a.txt", 0, b"payload").unwrap();

    // Same directory: in-place rename.
    fs.rename("/a.txt", "/b.txt").unwrap();
    assert_eq!(fs.lookup("/a.txt"), Err(Error::NotFound));
    let mut buf = vec![0u8; 7];
    fs.fread("/b.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");

    // Across directories.
    fs.rename("/b.txt", "/dir/c.txt").unwrap();
    assert_eq!(fs.lookup("/b.txt"), Err(Error::NotFound));
    fs.fread("/dir/c.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");

    // Target name collision fails.
    fs.creat("/d.txt", FileKind::Regular, 0o644).unwrap();
    assert_eq!(
        fs.rename("/d.txt", "/dir/c.txt"),
        Err(Error::AlreadyExists)
    );

    // Moving a directory updates the parents' link counts.
    fs.creat("/sub", FileKind::Directory, 0o755).unwrap();
    let root_links = fs.stat("/").unwrap().nlink;
    let dir_links = fs.stat("/dir").unwrap().nlink;
    fs.rename("/sub", "/dir/sub").unwrap();
    assert_eq!(fs.stat("/").unwrap().nlink, root_links - 1);
    assert_eq!(fs.stat("/dir").unwrap().nlink, dir_links + 1);
    fs.check().unwrap();
}

#[test]
fn test_mount_round_trip() {
    let rd = Arc::new(RamDisk::new(BLOCKS));
    let fs = FileSystem::format(rd.clone(), BLOCKS, INODES).unwrap();
    fs.creat("/dir", FileKind::Directory, 0o755).unwrap();
    fs.creat("/dir/keep.txt", FileKind::Regular, 0o644).unwrap();
    fs.fwrite("/dir/keep.txt", 0, b"persistent").unwrap();
    fs.sync(true).unwrap();
    drop(fs);

    let fs = FileSystem::mount(rd).unwrap();
    log!("mounted: {}", fs.dump());
    let (_, kind) = fs.lookup("/dir/keep.txt").unwrap();
    assert_eq!(kind, FileKind::Regular);
    let mut buf = vec![0u8; 10];
    fs.fread("/dir/keep.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"persistent");
    fs.check().unwrap();
}

#[test]
fn test_mount_rejects_bad_magic() {
    let rd = Arc::new(RamDisk::new(64));
    assert_eq!(
        FileSystem::mount(rd).map(|_| ()).unwrap_err(),
        Error::InvalidMagic
    );
}
