// fs/src/block_dev.rs

use core::any::Any;

use crate::error::Result;

/// Trait for block devices
pub trait BlockDevice: Send + Sync + Any {
    /// read a block from block to buffer, `buf` is one file system block long
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<()>;
    /// write a block from buffer to block
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<()>;
}
