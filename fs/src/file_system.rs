// fs/src/file_system.rs

use alloc::sync::Arc;
use alloc::vec::Vec;
use log::debug;
use spin::Mutex;

use crate::block_cache::{BlockCache, BlockCacheManager};
use crate::block_dev::BlockDevice;
use crate::config::{
    BLOCK_NUMBER_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_SIZE, GROUP_INODE_BLOCK, INODE_BLOCKS,
    INODE_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, ROOT_INO, SUPERBLOCK_BLOCKS,
};
use crate::dir;
use crate::error::{Result, RfsError};
use crate::file::FileShared;
use crate::group::Group;
use crate::inode::{InodeHandle, S_IFDIR};

/// Source of "now" for inode time stamps, in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u32;
}

/// Volume layout chosen when the file system is formatted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsConfig {
    pub block_size: u32,
    /// Total blocks on the device, superblock included.
    pub blocks: u32,
    pub group_blocks: u32,
    pub group_inodes: u32,
    /// Blocks kept in the cache.
    pub cache_size: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            blocks: 1 + 2 * DEFAULT_BLOCK_SIZE * 8,
            group_blocks: DEFAULT_BLOCK_SIZE * 8,
            group_inodes: 128,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

/// Layout values derived from an [`FsConfig`], fixed for the mount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks: u32,
    pub group_blocks: u32,
    pub group_inodes: u32,
    pub group_count: u32,
    pub inodes: u32,
    pub inodes_per_block: u32,
    /// Inode table blocks in each group.
    pub group_inode_blocks: u32,
    /// Block numbers held by one indirect block.
    pub blocks_per_block: u32,
    /// Blocks reachable with one level of indirection.
    pub block_map_singly_blocks: u32,
    /// Blocks reachable with two levels of indirection; no file maps more.
    pub block_map_doubly_blocks: u32,
}

impl Geometry {
    pub fn new(config: &FsConfig) -> Result<Self> {
        let block_size = config.block_size;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || block_size % BLOCK_NUMBER_SIZE as u32 != 0
        {
            return Err(RfsError::InvalidGeometry("unsupported block size"));
        }
        let bits = block_size * 8;
        if config.group_blocks == 0 || config.group_blocks > bits {
            return Err(RfsError::InvalidGeometry("group blocks do not fit a bitmap block"));
        }
        if config.group_inodes == 0 || config.group_inodes > bits {
            return Err(RfsError::InvalidGeometry("group inodes do not fit a bitmap block"));
        }
        if config.cache_size < 8 {
            return Err(RfsError::InvalidGeometry("cache too small"));
        }

        let inodes_per_block = block_size / INODE_SIZE as u32;
        let group_inode_blocks = config.group_inodes.div_ceil(inodes_per_block);
        let metadata = GROUP_INODE_BLOCK + group_inode_blocks;
        if config.blocks <= SUPERBLOCK_BLOCKS {
            return Err(RfsError::InvalidGeometry("no room for a group"));
        }
        let group_count = (config.blocks - SUPERBLOCK_BLOCKS).div_ceil(config.group_blocks);
        let last_group = config.blocks - SUPERBLOCK_BLOCKS - (group_count - 1) * config.group_blocks;
        if config.group_blocks.min(last_group) <= metadata {
            return Err(RfsError::InvalidGeometry("group has no room for data blocks"));
        }

        let blocks_per_block = block_size / BLOCK_NUMBER_SIZE as u32;
        let block_map_singly_blocks = blocks_per_block * INODE_BLOCKS as u32;
        let block_map_doubly_blocks = blocks_per_block * blocks_per_block * INODE_BLOCKS as u32;

        Ok(Self {
            block_size,
            blocks: config.blocks,
            group_blocks: config.group_blocks,
            group_inodes: config.group_inodes,
            group_count,
            inodes: group_count * config.group_inodes,
            inodes_per_block,
            group_inode_blocks,
            blocks_per_block,
            block_map_singly_blocks,
            block_map_doubly_blocks,
        })
    }

    pub fn max_block_map_blocks(&self) -> u32 {
        self.block_map_doubly_blocks
    }

    /// Largest byte size a file may reach.
    pub fn max_file_size(&self) -> u64 {
        self.block_map_doubly_blocks as u64 * self.block_size as u64
    }
}

/// A mounted RFS volume.
///
/// Every operation takes the file system explicitly. Callers serialise
/// access to one instance; the locks inside only make the type shareable.
pub struct FileSystem {
    block_device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    groups: Vec<Group>,
    cache: Mutex<BlockCacheManager>,
    file_shares: Mutex<Vec<Arc<Mutex<FileShared>>>>,
    clock: Arc<dyn Clock>,
}

impl FileSystem {
    // ----- constructor -----
    /// Mount a device that already holds a volume laid out with `config`.
    pub fn open(
        block_device: Arc<dyn BlockDevice>,
        config: FsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let geometry = Geometry::new(&config)?;
        let groups = (0..geometry.group_count)
            .map(|index| Group::new(&geometry, index))
            .collect();
        debug!(
            "rfs: open: blocks={} block-size={} groups={} inodes={}",
            geometry.blocks, geometry.block_size, geometry.group_count, geometry.inodes
        );
        Ok(Self {
            block_device,
            geometry,
            groups,
            cache: Mutex::new(BlockCacheManager::new(
                config.cache_size,
                geometry.block_size as usize,
            )),
            file_shares: Mutex::new(Vec::new()),
            clock,
        })
    }

    /// Lay out empty groups on the device and create the root directory.
    pub fn format(
        block_device: Arc<dyn BlockDevice>,
        config: FsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let fs = Self::open(block_device, config, clock)?;
        for group in fs.groups.iter() {
            group.initialise(&fs)?;
        }

        let ino = fs.bitmap_alloc(ROOT_INO, true)?;
        if ino != ROOT_INO {
            return Err(RfsError::Internal("root inode not allocated first"));
        }
        let mut root = InodeHandle::open(&fs, ino, true)?;
        // "." and ".." both refer to the root itself
        root.initialise(&fs, 2, S_IFDIR | 0o755, 0, 0)?;
        dir::add_entry(&fs, &mut root, ".", ino)?;
        dir::add_entry(&fs, &mut root, "..", ino)?;
        root.close(&fs)?;

        fs.sync()?;
        Ok(fs)
    }

    // ----- methods -----
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn now(&self) -> u32 {
        self.clock.now()
    }

    /// Flush all modified blocks to the device.
    pub fn sync(&self) -> Result<()> {
        self.cache.lock().sync_all()
    }

    pub(crate) fn block_cache(&self, block: u32, read: bool) -> Result<Arc<Mutex<BlockCache>>> {
        if block >= self.geometry.blocks {
            return Err(RfsError::InvalidBlock(block));
        }
        self.cache
            .lock()
            .get_block_cache(block as usize, &self.block_device, read)
    }

    pub(crate) fn file_shares(&self) -> &Mutex<Vec<Arc<Mutex<FileShared>>>> {
        &self.file_shares
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FsConfig {
        FsConfig {
            block_size: 128,
            blocks: 1 + 1024 + 500,
            group_blocks: 1024,
            group_inodes: 64,
            cache_size: 16,
        }
    }

    #[test]
    fn geometry_derives_map_ceilings() {
        let geometry = Geometry::new(&config()).unwrap();
        assert_eq!(geometry.blocks_per_block, 32);
        assert_eq!(geometry.block_map_singly_blocks, 32 * 5);
        assert_eq!(geometry.block_map_doubly_blocks, 32 * 32 * 5);
        assert_eq!(geometry.max_file_size(), 32 * 32 * 5 * 128);
        assert_eq!(geometry.inodes_per_block, 2);
        assert_eq!(geometry.group_inode_blocks, 32);
        assert_eq!(geometry.group_count, 2);
        assert_eq!(geometry.inodes, 128);
    }

    #[test]
    fn geometry_rejects_bad_layouts() {
        let mut bad = config();
        bad.block_size = 130;
        assert!(matches!(Geometry::new(&bad), Err(RfsError::InvalidGeometry(_))));

        let mut bad = config();
        bad.group_blocks = 128 * 8 + 1;
        assert!(Geometry::new(&bad).is_err());

        // last group too small to hold its own inode table
        let mut bad = config();
        bad.blocks = 1 + 1024 + 10;
        assert!(Geometry::new(&bad).is_err());
    }
}
