//! Path resolution and manipulation utilities.
//!
//! Paths are absolute; repeated slashes collapse. Directories carry no
//! `.`/`..` entries in this format, so dot components are rejected rather
//! than interpreted.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::config::ROOT_INODE_ID;
use crate::directory;
use crate::error::FsError;
use crate::superblock::SbInfo;
use crate::{BlockDevice, Result};

/// Resolves a path to inode ids.
/// Returns a tuple of (parent inode id, file inode id).
pub fn resolve(
    device: &impl BlockDevice,
    sbi: &SbInfo,
    path: &str,
) -> Result<(u32, u32)> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath);
    }

    let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if components.is_empty() {
        return Ok((ROOT_INODE_ID, ROOT_INODE_ID));
    }

    let mut parent = ROOT_INODE_ID;
    let mut current = ROOT_INODE_ID;
    for (i, &component) in components.iter().enumerate() {
        if component == "." || component == ".." {
            return Err(FsError::InvalidPath);
        }
        parent = current;
        current = directory::lookup(device, sbi, parent, component.as_bytes())?;
        if i == components.len() - 1 {
            return Ok((parent, current));
        }
    }

    Err(FsError::NotFound)
}

/// Splits a path into its directory and file name components.
/// Always absolute paths are expected.
/// If multiple slashes are present, they are treated as a single separator.
/// eg. "/home/user/file.txt" -> ("/home/user", "file.txt")
///     "/file.txt" -> ("/", "file.txt")
pub fn split(path: &str) -> Result<(String, String)> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath);
    }

    let mut components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if components.is_empty() {
        return Ok(("/".to_string(), String::new()));
    }

    let file_name = components.pop().unwrap_or("");
    let dir_path = components.join("/");

    if dir_path.is_empty() {
        Ok(("/".to_string(), file_name.to_string()))
    } else {
        Ok((alloc::format!("/{}", dir_path), file_name.to_string()))
    }
}
