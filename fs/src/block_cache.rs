// fs/src/block_cache.rs

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{error, trace};
use spin::{Mutex, MutexGuard};

use crate::block_dev::BlockDevice;
use crate::config::BLOCK_NUMBER_SIZE;
use crate::error::{Result, RfsError};
use crate::file_system::FileSystem;

// ----- BlockCache -----

/// One cached file system block.
pub struct BlockCache {
    cache: Vec<u8>,
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl BlockCache {
    // ----- constructor -----
    /// Load a block from disk, or start from zeroes when `read` is false and
    /// the caller is about to fill the whole block anyway.
    pub fn new(
        block_id: usize,
        block_device: Arc<dyn BlockDevice>,
        block_size: usize,
        read: bool,
    ) -> Result<Self> {
        let mut cache = vec![0u8; block_size];
        if read {
            block_device.read_block(block_id, &mut cache)?;
        }
        Ok(Self {
            cache,
            block_id,
            block_device,
            modified: false,
        })
    }

    // ----- methods -----
    pub fn data(&self) -> &[u8] {
        &self.cache
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        &mut self.cache
    }

    /// Write the block back if it was modified.
    pub fn sync(&mut self) -> Result<()> {
        if self.modified {
            self.block_device.write_block(self.block_id, &self.cache)?;
            self.modified = false;
        }
        Ok(())
    }

    pub fn read<V>(&self, f: impl FnOnce(&[u8]) -> V) -> V {
        f(self.data())
    }

    pub fn modify<V>(&mut self, f: impl FnOnce(&mut [u8]) -> V) -> V {
        f(self.data_mut())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            error!("block cache: lost write of block {}: {}", self.block_id, err);
        }
    }
}

// ----- BlockCacheManager -----

/// Fixed-capacity set of cached blocks. A block stays cached while any
/// buffer handle holds it; only unreferenced blocks are evicted.
pub struct BlockCacheManager {
    queue: Vec<(usize, Arc<Mutex<BlockCache>>)>,
    capacity: usize,
    block_size: usize,
}

impl BlockCacheManager {
    // ----- constructor -----
    pub fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            queue: Vec::with_capacity(capacity),
            capacity,
            block_size,
        }
    }

    // ----- methods -----
    /// Get the cache of a block, loading it if it is not cached yet.
    pub fn get_block_cache(
        &mut self,
        block_id: usize,
        block_device: &Arc<dyn BlockDevice>,
        read: bool,
    ) -> Result<Arc<Mutex<BlockCache>>> {
        if let Some((_, cache)) = self.queue.iter().find(|pair| pair.0 == block_id) {
            return Ok(Arc::clone(cache));
        }

        if self.queue.len() == self.capacity {
            // only the manager references the victim
            let victim = self
                .queue
                .iter()
                .position(|pair| Arc::strong_count(&pair.1) == 1)
                .ok_or(RfsError::Internal("block cache exhausted"))?;
            self.queue[victim].1.lock().sync()?;
            self.queue.remove(victim);
        }

        let block_cache = Arc::new(Mutex::new(BlockCache::new(
            block_id,
            Arc::clone(block_device),
            self.block_size,
            read,
        )?));
        self.queue.push((block_id, Arc::clone(&block_cache)));
        Ok(block_cache)
    }

    /// Write every modified block back to the device.
    pub fn sync_all(&self) -> Result<()> {
        for (_, cache) in self.queue.iter() {
            cache.lock().sync()?;
        }
        Ok(())
    }
}

// ----- BufferHandle -----

/// A handle holding at most one cached block at a time.
///
/// Requesting a different block releases the current one first. The dirty
/// flag records whether the holder changed the block since it was requested.
pub struct BufferHandle {
    buffer: Option<Arc<Mutex<BlockCache>>>,
    bnum: u32,
    dirty: bool,
}

impl BufferHandle {
    // ----- constructor -----
    pub const fn new() -> Self {
        Self {
            buffer: None,
            bnum: 0,
            dirty: false,
        }
    }

    // ----- methods -----
    pub fn has_block(&self) -> bool {
        self.buffer.is_some()
    }

    /// Block number held, 0 when empty.
    pub fn bnum(&self) -> u32 {
        self.bnum
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Make `block` the held block. `read` false skips the device read for
    /// blocks the caller is about to overwrite.
    pub fn request(&mut self, fs: &FileSystem, block: u32, read: bool) -> Result<()> {
        if self.has_block() {
            if self.bnum == block {
                return Ok(());
            }
            self.release();
        }
        trace!("buffer: request block={} read={}", block, read);
        self.buffer = Some(fs.block_cache(block, read)?);
        self.bnum = block;
        Ok(())
    }

    /// Drop the held block. Changes stay in the cache and reach the device
    /// on eviction or sync.
    pub fn release(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if self.dirty {
                trace!("buffer: release dirty block={}", self.bnum);
                buffer.lock().data_mut();
            }
        }
        self.bnum = 0;
        self.dirty = false;
    }

    pub fn close(&mut self) {
        self.release();
    }

    pub(crate) fn lock(&self) -> Option<MutexGuard<'_, BlockCache>> {
        self.buffer.as_ref().map(|buffer| buffer.lock())
    }

    fn held(&self) -> Result<&Arc<Mutex<BlockCache>>> {
        self.buffer
            .as_ref()
            .ok_or(RfsError::Internal("buffer handle holds no block"))
    }

    pub fn read<V>(&self, f: impl FnOnce(&[u8]) -> V) -> Result<V> {
        Ok(self.held()?.lock().read(f))
    }

    pub fn modify<V>(&mut self, f: impl FnOnce(&mut [u8]) -> V) -> Result<V> {
        let value = self.held()?.lock().modify(f);
        self.dirty = true;
        Ok(value)
    }

    /// Read entry `index` of the held block viewed as a block number table.
    pub fn get_number(&self, index: u32) -> Result<u32> {
        self.read(|data| get_be32(data, index as usize * BLOCK_NUMBER_SIZE))
    }

    pub fn set_number(&mut self, index: u32, value: u32) -> Result<()> {
        self.modify(|data| put_be32(data, index as usize * BLOCK_NUMBER_SIZE, value))
    }
}

impl Default for BufferHandle {
    fn default() -> Self {
        Self::new()
    }
}

// on-disk integers are big-endian

pub(crate) fn get_be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

pub(crate) fn put_be16(data: &mut [u8], at: usize, value: u16) {
    data[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn get_be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub(crate) fn put_be32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_be_bytes());
}
