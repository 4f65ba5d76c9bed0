// fs/src/group.rs

use log::trace;

use crate::bitmap::Bitmap;
use crate::config::{
    GROUP_BLOCK_BITMAP_BLOCK, GROUP_INODE_BITMAP_BLOCK, GROUP_INODE_BLOCK, ROOT_INO,
    SUPERBLOCK_BLOCKS,
};
use crate::error::{Result, RfsError};
use crate::file_system::{FileSystem, Geometry};

// ----- Group -----

/// One block group: a block bitmap, an inode bitmap, the inode table, then
/// data blocks. Bit `n` of the block bitmap is block `base + n`; bit `n` of
/// the inode bitmap is inode `index * group_inodes + n + 1`.
pub struct Group {
    base: u32,
    size: u32,
    block_bitmap: Bitmap,
    inode_bitmap: Bitmap,
}

impl Group {
    // ----- constructor -----
    pub fn new(geometry: &Geometry, index: u32) -> Self {
        let base = SUPERBLOCK_BLOCKS + index * geometry.group_blocks;
        let size = geometry.group_blocks.min(geometry.blocks - base);
        Self {
            base,
            size,
            block_bitmap: Bitmap::new(base + GROUP_BLOCK_BITMAP_BLOCK, size),
            inode_bitmap: Bitmap::new(base + GROUP_INODE_BITMAP_BLOCK, geometry.group_inodes),
        }
    }

    // ----- methods -----
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Absolute block number of the group-relative block `index`.
    pub fn block(&self, index: u32) -> u32 {
        self.base + index
    }

    pub fn block_bitmap(&self) -> &Bitmap {
        &self.block_bitmap
    }

    pub fn inode_bitmap(&self) -> &Bitmap {
        &self.inode_bitmap
    }

    /// Clear both bitmaps and mark the group's metadata blocks allocated.
    pub fn initialise(&self, fs: &FileSystem) -> Result<()> {
        self.block_bitmap.initialise(fs)?;
        self.inode_bitmap.initialise(fs)?;
        let metadata = GROUP_INODE_BLOCK + fs.geometry().group_inode_blocks;
        for bit in 0..metadata {
            self.block_bitmap.set(fs, bit)?;
        }
        // unused inode records read as all ones
        for index in GROUP_INODE_BLOCK..metadata {
            fs.block_cache(self.block(index), false)?
                .lock()
                .modify(|data| data.fill(0xff));
        }
        Ok(())
    }
}

/// Groups to try for an allocation starting at `start`: the start group,
/// then alternately above and below it.
fn search_order(start: u32, count: u32) -> impl Iterator<Item = u32> {
    core::iter::once(start).chain((1..count).flat_map(move |offset| {
        let up = start.checked_add(offset).filter(|&group| group < count);
        let down = start.checked_sub(offset);
        up.into_iter().chain(down)
    }))
}

impl FileSystem {
    /// Allocate a block (or an inode when `inode` is set) as close to `goal`
    /// as the bitmaps allow. For inodes `goal` and the result are inode
    /// numbers, for blocks they are block numbers.
    pub fn bitmap_alloc(&self, goal: u32, inode: bool) -> Result<u32> {
        let geometry = self.geometry();
        let (size, goal) = if inode {
            (geometry.group_inodes, goal.saturating_sub(ROOT_INO))
        } else {
            (geometry.group_blocks, goal.saturating_sub(SUPERBLOCK_BLOCKS))
        };
        let start = (goal / size).min(geometry.group_count - 1);
        let seed = goal % size;

        for group_index in search_order(start, geometry.group_count) {
            let group = &self.groups()[group_index as usize];
            let bitmap = if inode {
                group.inode_bitmap()
            } else {
                group.block_bitmap()
            };
            let seed = if group_index == start { seed } else { 0 };
            if let Some(bit) = bitmap.alloc(self, seed)? {
                let result = if inode {
                    group_index * geometry.group_inodes + bit + ROOT_INO
                } else {
                    group.block(bit)
                };
                trace!("group: alloc {} goal={} -> {}", kind(inode), goal, result);
                return Ok(result);
            }
        }

        Err(if inode {
            RfsError::NoInodes
        } else {
            RfsError::NoSpace
        })
    }

    /// Return a block (or inode) to its group bitmap.
    pub fn bitmap_free(&self, inode: bool, no: u32) -> Result<()> {
        let geometry = self.geometry();
        let (group_index, bit) = if inode {
            if no < ROOT_INO || no - ROOT_INO >= geometry.inodes {
                return Err(RfsError::InvalidInode(no));
            }
            let index = no - ROOT_INO;
            (index / geometry.group_inodes, index % geometry.group_inodes)
        } else {
            if no < SUPERBLOCK_BLOCKS || no >= geometry.blocks {
                return Err(RfsError::InvalidBlock(no));
            }
            let index = no - SUPERBLOCK_BLOCKS;
            (index / geometry.group_blocks, index % geometry.group_blocks)
        };
        trace!("group: free {} {}", kind(inode), no);
        let group = &self.groups()[group_index as usize];
        if inode {
            group.inode_bitmap().clear(self, bit)
        } else {
            group.block_bitmap().clear(self, bit)
        }
    }

    /// Allocated blocks and inodes across all groups.
    pub fn usage(&self) -> Result<(u32, u32)> {
        let mut blocks = SUPERBLOCK_BLOCKS;
        let mut inodes = 0;
        for group in self.groups() {
            blocks += group.block_bitmap().used(self)?;
            inodes += group.inode_bitmap().used(self)?;
        }
        Ok((blocks, inodes))
    }
}

fn kind(inode: bool) -> &'static str {
    if inode { "inode" } else { "block" }
}
