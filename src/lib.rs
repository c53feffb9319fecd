//! Gluon is a small snapshotting file system. It keeps a directory tree of
//! small files on a fixed-size block device and lets the embedder create,
//! list, delete and restore whole-filesystem snapshots while mounted.
//! Snapshots are read-only views that share blocks with the live state
//! through per-block reference counters; restore produces a writable copy.
//!
//! Gluon's linear layout:
//! - Superblock
//! - Inode store
//! - Inode free bitmap
//! - Block free bitmap
//! - Inode-data free bitmap
//! - Inode-data index
//! - Metadata blocks (one refcount byte per data block)
//! - Data blocks
//!
//! Gluon's layers (from bottom to top):
//! 1. Block Device: Abstraction for low level devices.                   | User implemented (hardware-specific)
//! 2. Cache: Optional write-back caching layer.                          | User implemented (sync, strategy, etc.)
//! 3. Bitmaps: First-fit allocation of inodes, blocks, inode-data.       | Fs implemented
//! 4. Block store: Per-block refcounts and the copy-on-write primitive.  | Fs implemented
//! 5. Inode data: Snapshot-local metadata records, shared by refcount.   | Fs implemented
//! 6. Directory/File: Name tables and file index blocks, CoW on write.   | Fs implemented
//! 7. Snapshots: Bounded snapshot table, create/delete/restore/list.     | Fs implemented
//! 8. FileSystem: The main interface for users.                          | Fs implemented

extern crate alloc;

mod config;
mod block_dev;
mod cache;
mod structs;
mod bitmap;
mod superblock;
mod block;
mod inode;
mod inode_data;
mod directory;
mod file;
mod path;
mod snapshot;
mod check;
mod fs;
mod error;

pub use bitmap::Bitmap;
pub use block_dev::BlockDevice;
pub use cache::{Cache, Cached};
pub use config::*;
pub use superblock::SbInfo;
pub use structs::*;
pub use inode::{read_inode, write_inode};
pub use inode_data::{get_inode_data, link_inode_data, put_inode_data};
pub use block::{alloc_block, cow_block, get_block, put_block, read_refcount, BlockKind};
pub use path::{resolve, split};
pub use fs::{FileSystem, FsStat};
pub use check::check;
pub use error::FsError as Error;
pub use error::Result;
