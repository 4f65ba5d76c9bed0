//! RAM-backed device, a settable clock and a small formatted volume.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rfs::{BlockDevice, Clock, FileSystem, FsConfig, RfsError};

pub const BLOCK_SIZE: u32 = 128;

pub struct RamDisk {
    inner: Mutex<Vec<u8>>,
    block_size: usize,
    num_blocks: usize,
}

impl RamDisk {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        RamDisk {
            inner: Mutex::new(vec![0u8; num_blocks * block_size]),
            block_size,
            num_blocks,
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), RfsError> {
        if block_id >= self.num_blocks || buf.len() != self.block_size {
            return Err(RfsError::Io(block_id as u32));
        }
        let start = block_id * self.block_size;
        let data = self.inner.lock().unwrap();
        buf.copy_from_slice(&data[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), RfsError> {
        if block_id >= self.num_blocks || buf.len() != self.block_size {
            return Err(RfsError::Io(block_id as u32));
        }
        let start = block_id * self.block_size;
        let mut data = self.inner.lock().unwrap();
        data[start..start + self.block_size].copy_from_slice(buf);
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct TestClock(AtomicU32);

impl TestClock {
    pub fn new(now: u32) -> Arc<Self> {
        Arc::new(TestClock(AtomicU32::new(now)))
    }

    pub fn set(&self, now: u32) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Two groups of 1024 blocks, 64 inodes each, 128 byte blocks.
pub fn config() -> FsConfig {
    FsConfig {
        block_size: BLOCK_SIZE,
        blocks: 1 + 2 * 1024,
        group_blocks: 1024,
        group_inodes: 64,
        cache_size: 32,
    }
}

pub struct TestFs {
    pub fs: FileSystem,
    pub disk: Arc<RamDisk>,
    pub clock: Arc<TestClock>,
}

pub fn mkfs() -> TestFs {
    let config = config();
    let disk = Arc::new(RamDisk::new(config.blocks as usize, BLOCK_SIZE as usize));
    let clock = TestClock::new(1000);
    let fs = FileSystem::format(disk.clone(), config, clock.clone()).unwrap();
    TestFs { fs, disk, clock }
}
