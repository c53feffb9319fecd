//! In-memory free bitmaps for inodes, data blocks and inode-data entries.
//!
//! Each bitmap mirrors a contiguous range of on-disk blocks, loaded at mount
//! and written back on sync. Convention: 1 = free. Index 0 is reserved as
//! "no such object" in all three bitmaps and is never handed out.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use spin::Mutex;

use crate::config::BLOCK_SIZE;
use crate::error::FsError;
use crate::{BlockDevice, Result};

const WORD_BITS: usize = 64;
const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 8;

pub struct Bitmap {
    /// First block of the on-disk region.
    start: u32,
    /// Length of the region in blocks.
    blocks: u32,
    /// Number of tracked objects.
    size: u32,
    words: Vec<AtomicU64>,
    /// Guards bit commits and the free counter. The first-fit scan itself
    /// runs without it and re-checks the bit before committing.
    lock: Mutex<u32>,
}

impl Bitmap {
    /// A fresh bitmap with every index in `[0, size)` free.
    pub fn new_free(start: u32, blocks: u32, size: u32) -> Self {
        let nr_words = blocks as usize * WORDS_PER_BLOCK;
        let words: Vec<AtomicU64> = (0..nr_words)
            .map(|w| {
                let base = (w * WORD_BITS) as u64;
                let mut val = 0u64;
                for bit in 0..WORD_BITS as u64 {
                    if base + bit < size as u64 {
                        val |= 1 << bit;
                    }
                }
                AtomicU64::new(val)
            })
            .collect();
        Self {
            start,
            blocks,
            size,
            words,
            lock: Mutex::new(size),
        }
    }

    /// Load the bitmap region from disk. `nr_free` comes from the superblock
    /// and must equal the popcount of the region.
    pub fn load(
        device: &impl BlockDevice,
        start: u32,
        blocks: u32,
        size: u32,
        nr_free: u32,
    ) -> Result<Self> {
        let mut words = Vec::with_capacity(blocks as usize * WORDS_PER_BLOCK);
        let mut buf = alloc::boxed::Box::new([0u8; BLOCK_SIZE]);
        for i in 0..blocks {
            device.read_block(start + i, buf.as_mut())?;
            for chunk in buf.chunks_exact(8) {
                words.push(AtomicU64::new(u64::from_le_bytes(
                    chunk.try_into().unwrap(),
                )));
            }
        }
        Ok(Self {
            start,
            blocks,
            size,
            words,
            lock: Mutex::new(nr_free),
        })
    }

    /// Write the bitmap region back to disk.
    pub fn sync(&self, device: &impl BlockDevice) -> Result<()> {
        let mut buf = alloc::boxed::Box::new([0u8; BLOCK_SIZE]);
        for i in 0..self.blocks {
            let base = i as usize * WORDS_PER_BLOCK;
            for (w, chunk) in buf.chunks_exact_mut(8).enumerate() {
                chunk.copy_from_slice(&self.words[base + w].load(Ordering::Relaxed).to_le_bytes());
            }
            device.write_block(self.start + i, buf.as_ref())?;
        }
        Ok(())
    }

    /// Allocate the lowest free index. First-fit: scan without the lock,
    /// re-check under it and retry if a racing allocator took the bit.
    pub fn alloc(&self) -> Result<u32> {
        'again: loop {
            let idx = match self.find_first_set() {
                Some(idx) => idx,
                None => return Err(FsError::NoSpace),
            };

            let mut nr_free = self.lock.lock();
            let (word, mask) = Self::locate(idx);
            let cur = self.words[word].load(Ordering::Relaxed);
            if cur & mask == 0 {
                // Someone else already got that bit, get a new one.
                drop(nr_free);
                continue 'again;
            }
            self.words[word].store(cur & !mask, Ordering::Relaxed);
            *nr_free -= 1;
            return Ok(idx);
        }
    }

    /// Mark index `idx` as free again.
    pub fn free(&self, idx: u32) -> Result<()> {
        if idx >= self.size {
            return Err(FsError::InvalidArgument);
        }
        let mut nr_free = self.lock.lock();
        let (word, mask) = Self::locate(idx);
        let cur = self.words[word].load(Ordering::Relaxed);
        if cur & mask != 0 {
            warn!("bitmap: double free of index {}", idx);
            return Err(FsError::Corrupted);
        }
        self.words[word].store(cur | mask, Ordering::Relaxed);
        *nr_free += 1;
        Ok(())
    }

    /// Claim a specific index; used by the formatter for reserved objects.
    pub fn mark_allocated(&self, idx: u32) -> Result<()> {
        if idx >= self.size {
            return Err(FsError::InvalidArgument);
        }
        let mut nr_free = self.lock.lock();
        let (word, mask) = Self::locate(idx);
        let cur = self.words[word].load(Ordering::Relaxed);
        if cur & mask == 0 {
            return Err(FsError::AlreadyExists);
        }
        self.words[word].store(cur & !mask, Ordering::Relaxed);
        *nr_free -= 1;
        Ok(())
    }

    pub fn is_allocated(&self, idx: u32) -> bool {
        if idx >= self.size {
            return false;
        }
        let (word, mask) = Self::locate(idx);
        self.words[word].load(Ordering::Relaxed) & mask == 0
    }

    pub fn nr_free(&self) -> u32 {
        *self.lock.lock()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Popcount of the whole region; must equal `nr_free` at any quiescent
    /// point (invariant P2).
    pub fn count_free(&self) -> u32 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones())
            .sum()
    }

    /// All currently allocated indices, excluding the reserved index 0.
    pub fn allocated(&self) -> Vec<u32> {
        (1..self.size).filter(|&i| self.is_allocated(i)).collect()
    }

    fn locate(idx: u32) -> (usize, u64) {
        (idx as usize / WORD_BITS, 1u64 << (idx as usize % WORD_BITS))
    }

    fn find_first_set(&self) -> Option<u32> {
        for (w, word) in self.words.iter().enumerate() {
            let val = word.load(Ordering::Relaxed);
            if val != 0 {
                let idx = (w * WORD_BITS) as u32 + val.trailing_zeros();
                if idx < self.size {
                    return Some(idx);
                }
                return None;
            }
        }
        None
    }
}
