#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    IoError,
    InvalidMagic,
    InvalidSuperBlock,
    InvalidBlockId,
    InvalidArgument,
    InvalidPath,
    InvalidFileName,
    NoSpace,
    NotFound,
    AlreadyExists,
    NotDirectory,
    NotFile,
    NotEmpty,
    DirectoryFull,
    TooBig,
    /// The volume could not be frozen for a snapshot operation.
    Busy,
    /// An on-disk invariant does not hold (bad refcount, dead-inode access).
    Corrupted,
    CacheMiss,
    CacheEvict(u32),
}

pub type Result<T> = core::result::Result<T, FsError>;
