// fs/src/bitmap.rs

use crate::error::{Result, RfsError};
use crate::file_system::FileSystem;

// ----- Bitmap -----
// A group bitmap lives in a single block: bit `n` is byte `n / 8`, mask
// `1 << (n % 8)`. A set bit means allocated.

/// In-memory view of one on-disk bitmap block.
pub struct Bitmap {
    block: u32,
    size: u32,
}

impl Bitmap {
    // ----- constructor -----
    /// `size` is the number of bits tracked, at most block_size * 8.
    pub fn new(block: u32, size: u32) -> Self {
        Self { block, size }
    }

    // ----- methods -----
    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Clear every bit.
    pub fn initialise(&self, fs: &FileSystem) -> Result<()> {
        fs.block_cache(self.block, false)?
            .lock()
            .modify(|data| data.fill(0));
        Ok(())
    }

    /// Allocate the first free bit at or after `seed`, wrapping to the start
    /// of the map. Returns `None` when the map is full.
    pub fn alloc(&self, fs: &FileSystem, seed: u32) -> Result<Option<u32>> {
        let seed = if seed < self.size { seed } else { 0 };
        let cache = fs.block_cache(self.block, true)?;
        let mut cache = cache.lock();
        let found = (seed..self.size)
            .chain(0..seed)
            .find(|&bit| !is_set(cache.data(), bit));
        if let Some(bit) = found {
            cache.modify(|data| data[(bit / 8) as usize] |= mask(bit));
        }
        Ok(found)
    }

    /// Mark a bit allocated.
    pub fn set(&self, fs: &FileSystem, bit: u32) -> Result<()> {
        self.check(bit)?;
        fs.block_cache(self.block, true)?
            .lock()
            .modify(|data| data[(bit / 8) as usize] |= mask(bit));
        Ok(())
    }

    /// Release a bit. Freeing a bit that is not allocated is an error.
    pub fn clear(&self, fs: &FileSystem, bit: u32) -> Result<()> {
        self.check(bit)?;
        let cache = fs.block_cache(self.block, true)?;
        let mut cache = cache.lock();
        if !is_set(cache.data(), bit) {
            return Err(RfsError::AlreadyFree(bit));
        }
        cache.modify(|data| data[(bit / 8) as usize] &= !mask(bit));
        Ok(())
    }

    /// Number of allocated bits.
    pub fn used(&self, fs: &FileSystem) -> Result<u32> {
        Ok(fs.block_cache(self.block, true)?.lock().read(|data| {
            (0..self.size).filter(|&bit| is_set(data, bit)).count() as u32
        }))
    }

    fn check(&self, bit: u32) -> Result<()> {
        if bit >= self.size {
            return Err(RfsError::Internal("bitmap bit out of range"));
        }
        Ok(())
    }
}

fn mask(bit: u32) -> u8 {
    1u8 << (bit % 8)
}

fn is_set(data: &[u8], bit: u32) -> bool {
    data[(bit / 8) as usize] & mask(bit) != 0
}
