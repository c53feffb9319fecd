use crate::config::BLOCK_SIZE;
use crate::error::FsError;

pub trait BlockDevice: Send + Sync {
    /// Returns the number of blocks in the block device.
    fn num_blocks(&self) -> u32;

    /// Reads a block of data from the block device.
    fn read_block(&self, block_id: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), FsError>;

    /// Writes a block of data to the block device.
    fn write_block(&self, block_id: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), FsError>;

    /// Flushes any buffered data to the block device.
    /// Returns only once all previous writes are persisted; the snapshot
    /// freeze protocol relies on this barrier.
    fn flush(&self) -> Result<(), FsError>;

    /// Returns the size of each block in bytes.
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }
}
