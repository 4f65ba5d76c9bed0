// fs/src/block.rs

//! Logical to physical block translation for one file.
//!
//! An inode holds [`INODE_BLOCKS`] block-number slots. How they are read
//! depends on how many blocks the file has:
//!
//! * up to `INODE_BLOCKS` blocks, each slot is a data block;
//! * up to `block_map_singly_blocks`, each slot points at a table of
//!   `blocks_per_block` data block numbers;
//! * below `block_map_doubly_blocks`, each slot points at a table of
//!   singly-indirect tables.
//!
//! Moving up a level copies the five slots into a freshly allocated table
//! and anchors that table in slot 0. Moving down copies them back.

use log::{trace, warn};

use crate::block_cache::{put_be32, BufferHandle};
use crate::config::{BLOCK_NUMBER_SIZE, INODE_BLOCKS};
use crate::error::{Result, RfsError};
use crate::file_system::{FileSystem, Geometry};
use crate::inode::InodeHandle;

// ----- BlockSize -----

/// Size of a map in whole blocks plus the bytes used in the last one.
/// `offset == 0` with `count > 0` means the last block is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSize {
    pub count: u32,
    pub offset: u32,
}

impl BlockSize {
    pub const fn zero() -> Self {
        Self { count: 0, offset: 0 }
    }

    /// The block size of a file `pos` bytes long.
    pub fn from_pos(block_size: u32, pos: u64) -> Self {
        if pos == 0 {
            return Self::zero();
        }
        let block_size = block_size as u64;
        Self {
            count: ((pos - 1) / block_size + 1) as u32,
            offset: (pos % block_size) as u32,
        }
    }

    /// Length in bytes.
    pub fn bytes(&self, block_size: u32) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let last = if self.offset == 0 {
            block_size
        } else {
            self.offset
        };
        (self.count as u64 - 1) * block_size as u64 + last as u64
    }

    /// The position just past the last byte.
    pub fn to_bpos(&self) -> BlockPos {
        let mut bpos = BlockPos {
            bno: self.count,
            boff: self.offset,
            block: 0,
        };
        if bpos.boff != 0 {
            bpos.bno -= 1;
        }
        bpos
    }
}

// ----- BlockPos -----

/// A position as a logical block index and a byte offset inside it.
/// `block` caches the physical block once resolved, 0 when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockPos {
    pub bno: u32,
    pub boff: u32,
    pub block: u32,
}

impl BlockPos {
    /// The block index must fit a `u32`; callers bound `pos` by the largest
    /// file size first.
    pub fn from_pos(block_size: u32, pos: u64) -> Self {
        Self {
            bno: (pos / block_size as u64) as u32,
            boff: (pos % block_size as u64) as u32,
            block: 0,
        }
    }

    /// Byte position.
    pub fn pos(&self, block_size: u32) -> u64 {
        self.bno as u64 * block_size as u64 + self.boff as u64
    }

    /// True when the position lies beyond the last byte of `size`.
    pub fn past_end(&self, size: &BlockSize, block_size: u32) -> bool {
        self.pos(block_size) > size.bytes(block_size)
    }

    /// True when the block of this position is not part of `size`.
    pub fn block_past_end(&self, size: &BlockSize) -> bool {
        self.bno >= size.count
    }
}

// ----- BlockMap -----

#[derive(Clone, Copy)]
enum Level {
    Singly,
    Doubly,
}

/// In-memory copy of an inode's block map.
///
/// Opened from an inode with [`BlockMap::open`] and written back by
/// [`BlockMap::close`]. The map keeps the indirect tables it last walked in
/// two buffer handles.
pub struct BlockMap {
    dirty: bool,
    size: BlockSize,
    bpos: BlockPos,
    last_map_block: u32,
    last_data_block: u32,
    blocks: [u32; INODE_BLOCKS],
    singly_buffer: BufferHandle,
    doubly_buffer: BufferHandle,
}

impl BlockMap {
    // ----- constructor -----
    /// Copy the block slots and size out of `inode`. The inode is loaded for
    /// the copy and left with the load count it came in with.
    pub fn open(fs: &FileSystem, inode: &mut InodeHandle) -> Result<Self> {
        inode.load(fs)?;
        let map = inode.node().map(|node| {
            let mut blocks = [0; INODE_BLOCKS];
            for (index, slot) in blocks.iter_mut().enumerate() {
                *slot = node.block(index);
            }
            Self {
                dirty: false,
                size: BlockSize {
                    count: node.block_count(),
                    offset: node.block_offset() as u32,
                },
                bpos: BlockPos::default(),
                last_map_block: node.last_map_block(),
                last_data_block: node.last_data_block(),
                blocks,
                singly_buffer: BufferHandle::new(),
                doubly_buffer: BufferHandle::new(),
            }
        });
        inode.unload(fs, false)?;
        map
    }

    /// Write the map back into `inode` if it changed and release the
    /// indirect tables. The map must not be used afterwards.
    pub fn close(&mut self, fs: &FileSystem, inode: &mut InodeHandle) -> Result<()> {
        let mut rc = Ok(());

        if self.dirty {
            rc = inode.load(fs);
            if rc.is_ok() {
                if let Ok(mut node) = inode.node_mut() {
                    for (index, &block) in self.blocks.iter().enumerate() {
                        node.set_block(index, block);
                    }
                    node.set_block_count(self.size.count);
                    node.set_block_offset(self.size.offset as u16);
                    node.set_last_map_block(self.last_map_block);
                    node.set_last_data_block(self.last_data_block);
                }
                rc = inode.unload(fs, true);
                self.dirty = false;
            }
        }

        self.singly_buffer.close();
        self.doubly_buffer.close();
        rc
    }

    // ----- accessors -----
    pub fn size(&self) -> BlockSize {
        self.size
    }

    pub fn count(&self) -> u32 {
        self.size.count
    }

    pub fn bpos(&self) -> BlockPos {
        self.bpos
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn blocks(&self) -> &[u32; INODE_BLOCKS] {
        &self.blocks
    }

    pub fn last_map_block(&self) -> u32 {
        self.last_map_block
    }

    pub fn last_data_block(&self) -> u32 {
        self.last_data_block
    }

    pub fn set_size(&mut self, size: BlockSize) {
        self.size = size;
        self.dirty = true;
    }

    pub fn set_size_offset(&mut self, offset: u32) {
        self.size.offset = offset;
        self.dirty = true;
    }

    /// True when `bpos` is in the map's last block.
    pub fn is_last(&self, bpos: &BlockPos) -> bool {
        (bpos.bno == 0 && self.size.count == 0) || bpos.bno + 1 == self.size.count
    }

    // ----- translation -----
    /// Resolve `bpos` to a physical block. Fails with `OutOfRange` when the
    /// block is not in the map; the map is left untouched on failure.
    pub fn find(&mut self, fs: &FileSystem, bpos: &BlockPos) -> Result<u32> {
        if bpos.block_past_end(&self.size) {
            return Err(RfsError::OutOfRange);
        }

        let block = if bpos.bno == self.bpos.bno && self.bpos.block != 0 {
            self.bpos.block
        } else {
            self.resolve(fs, bpos.bno)?
        };

        self.bpos = BlockPos { block, ..*bpos };
        Ok(block)
    }

    fn resolve(&mut self, fs: &FileSystem, bno: u32) -> Result<u32> {
        let geometry = fs.geometry();

        if self.size.count <= INODE_BLOCKS as u32 {
            return match self.blocks[bno as usize] {
                0 | u32::MAX => Err(RfsError::CorruptMap { block: 0, index: bno }),
                block => Ok(block),
            };
        }

        let direct = bno % geometry.blocks_per_block;
        let singly = bno / geometry.blocks_per_block;

        if self.size.count <= geometry.block_map_singly_blocks {
            find_indirect(fs, &mut self.singly_buffer, self.blocks[singly as usize], direct)
        } else if self.size.count < geometry.block_map_doubly_blocks {
            let doubly = singly / geometry.blocks_per_block;
            let singly = singly % geometry.blocks_per_block;
            let table = find_indirect(
                fs,
                &mut self.doubly_buffer,
                self.blocks[doubly as usize],
                singly,
            )?;
            find_indirect(fs, &mut self.singly_buffer, table, direct)
        } else {
            Err(RfsError::OutOfRange)
        }
    }

    /// Move the map position by `offset` bytes and resolve the block there.
    pub fn seek(&mut self, fs: &FileSystem, offset: i64) -> Result<u32> {
        let block_size = fs.block_size();
        let pos = (self.bpos.pos(block_size) as i64)
            .checked_add(offset)
            .filter(|&pos| pos >= 0)
            .ok_or(RfsError::OutOfRange)?;
        if pos as u64 / block_size as u64 >= fs.geometry().block_map_doubly_blocks as u64 {
            return Err(RfsError::OutOfRange);
        }
        let bpos = BlockPos::from_pos(block_size, pos as u64);
        self.find(fs, &bpos)
    }

    /// Resolve the block after the current map position.
    pub fn next_block(&mut self, fs: &FileSystem) -> Result<u32> {
        let bpos = BlockPos {
            bno: self.bpos.bno + 1,
            boff: 0,
            block: 0,
        };
        self.find(fs, &bpos)
    }

    // ----- growth -----
    /// Allocate `blocks` data blocks at the end of the map and return the
    /// first one. Blocks added before a failure stay in the map.
    pub fn grow(&mut self, fs: &FileSystem, blocks: usize) -> Result<u32> {
        let geometry = *fs.geometry();
        trace!("block-map: grow: blocks={} count={}", blocks, self.size.count);

        if self.size.count as u64 + blocks as u64 >= geometry.max_block_map_blocks() as u64 {
            return Err(RfsError::FileTooBig);
        }

        let mut first = 0;
        for b in 0..blocks {
            let block = fs.bitmap_alloc(self.last_data_block, false)?;
            if let Err(err) = self.link_block(fs, &geometry, block) {
                // the failed link cannot have stored the block
                let _ = fs.bitmap_free(false, block);
                return Err(err);
            }
            self.size.count += 1;
            self.size.offset = 0;
            if b == 0 {
                first = block;
            }
            self.last_data_block = block;
            self.dirty = true;
        }
        Ok(first)
    }

    /// Store `block` as logical block `size.count`, adding tables as needed.
    fn link_block(&mut self, fs: &FileSystem, geometry: &Geometry, block: u32) -> Result<()> {
        let count = self.size.count;
        let inode_blocks = INODE_BLOCKS as u32;

        if count < inode_blocks {
            self.blocks[count as usize] = block;
            return Ok(());
        }

        let direct = count % geometry.blocks_per_block;
        let singly = count / geometry.blocks_per_block;

        if count < geometry.block_map_singly_blocks {
            if direct == 0 || (singly == 0 && direct == inode_blocks) {
                let upping = count == inode_blocks;
                let table = self.indirect_alloc(fs, Level::Singly, upping)?;
                self.blocks[singly as usize] = table;
            } else {
                self.singly_buffer
                    .request(fs, self.blocks[singly as usize], true)?;
            }
        } else {
            let doubly = singly / geometry.blocks_per_block;
            let singly = singly % geometry.blocks_per_block;

            if direct == 0 {
                let singly_block = self.indirect_alloc(fs, Level::Singly, false)?;

                let linked = if singly == 0 || (doubly == 0 && singly == inode_blocks) {
                    let upping = count == geometry.block_map_singly_blocks;
                    match self.indirect_alloc(fs, Level::Doubly, upping) {
                        Ok(table) => {
                            self.blocks[doubly as usize] = table;
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                } else {
                    self.doubly_buffer
                        .request(fs, self.blocks[doubly as usize], true)
                };
                let linked =
                    linked.and_then(|()| self.doubly_buffer.set_number(singly, singly_block));
                if let Err(err) = linked {
                    let _ = fs.bitmap_free(false, singly_block);
                    return Err(err);
                }
            } else {
                self.doubly_buffer
                    .request(fs, self.blocks[doubly as usize], true)?;
                let singly_block = self.doubly_buffer.get_number(singly)?;
                self.singly_buffer.request(fs, singly_block, true)?;
            }
        }

        self.singly_buffer.set_number(direct, block)
    }

    /// Allocate a new indirect table into the buffer of `level`. When
    /// `upping`, the inode slots move into the table and are cleared.
    fn indirect_alloc(&mut self, fs: &FileSystem, level: Level, upping: bool) -> Result<u32> {
        let new_block = fs.bitmap_alloc(self.last_map_block, false)?;
        let slots = self.blocks;
        let count = self.size.count;
        let buffer = self.buffer(level);

        if let Err(err) = buffer.request(fs, new_block, false) {
            let _ = fs.bitmap_free(false, new_block);
            return Err(err);
        }
        buffer.modify(|data| {
            data.fill(0xff);
            if upping {
                for (index, &slot) in slots.iter().enumerate() {
                    put_be32(data, index * BLOCK_NUMBER_SIZE, slot);
                }
            }
        })?;

        if upping {
            trace!("block-map: grow: upping: block-count={}", count);
            self.blocks = [0; INODE_BLOCKS];
        }
        self.last_map_block = new_block;
        Ok(new_block)
    }

    fn buffer(&mut self, level: Level) -> &mut BufferHandle {
        match level {
            Level::Singly => &mut self.singly_buffer,
            Level::Doubly => &mut self.doubly_buffer,
        }
    }

    // ----- shrinking -----
    /// Free the last `blocks` blocks of the map, and any tables left empty.
    /// Asking for more blocks than the map holds empties it.
    pub fn shrink(&mut self, fs: &FileSystem, blocks: usize) -> Result<()> {
        let geometry = *fs.geometry();
        trace!("block-map: shrink: blocks={} count={}", blocks, self.size.count);

        if self.size.count == 0 {
            return Ok(());
        }

        let mut blocks = blocks.min(self.size.count as usize);
        while blocks > 0 {
            let block = self.size.count - 1;
            let block_to_free = self.unlink_block(fs, &geometry, block)?;
            fs.bitmap_free(false, block_to_free)?;
            self.size.count -= 1;
            self.size.offset = 0;
            self.last_data_block = block_to_free;
            self.dirty = true;
            blocks -= 1;
        }

        if self.size.count == 0 {
            self.last_map_block = 0;
            self.last_data_block = 0;
        }

        // keep the position inside the map
        if self.bpos.block_past_end(&self.size) {
            self.bpos = self.size.to_bpos();
        }
        Ok(())
    }

    /// Take logical block `block`, the last one, out of the map and return
    /// its physical number. Tables it leaves empty are freed here.
    fn unlink_block(&mut self, fs: &FileSystem, geometry: &Geometry, block: u32) -> Result<u32> {
        if block < INODE_BLOCKS as u32 {
            let block_to_free = self.blocks[block as usize];
            self.blocks[block as usize] = 0;
            return Ok(block_to_free);
        }

        let direct = block % geometry.blocks_per_block;
        let singly = block / geometry.blocks_per_block;

        if block < geometry.block_map_singly_blocks {
            self.singly_buffer
                .request(fs, self.blocks[singly as usize], true)?;
            let block_to_free = self.singly_buffer.get_number(direct)?;
            self.indirect_shrink(fs, Level::Singly, singly, direct)?;
            Ok(block_to_free)
        } else if block < geometry.block_map_doubly_blocks {
            let doubly = singly / geometry.blocks_per_block;
            let doubly_singly = singly % geometry.blocks_per_block;

            self.doubly_buffer
                .request(fs, self.blocks[doubly as usize], true)?;
            let singly_table = self.doubly_buffer.get_number(doubly_singly)?;
            self.singly_buffer.request(fs, singly_table, true)?;
            let block_to_free = self.singly_buffer.get_number(direct)?;

            if direct == 0 {
                fs.bitmap_free(false, singly_table)?;
                self.last_map_block = singly_table;
                self.indirect_shrink(fs, Level::Doubly, doubly, doubly_singly)?;
            }
            Ok(block_to_free)
        } else {
            Err(RfsError::OutOfRange)
        }
    }

    /// Free the table in slot `indirect` once entry `index` was its last
    /// user. When only `INODE_BLOCKS` entries remain in the first table they
    /// move back into the inode slots.
    fn indirect_shrink(
        &mut self,
        fs: &FileSystem,
        level: Level,
        indirect: u32,
        index: u32,
    ) -> Result<()> {
        let inode_blocks = INODE_BLOCKS as u32;
        if index != 0 && !(indirect == 0 && index == inode_blocks) {
            return Ok(());
        }

        let block_to_free = self.blocks[indirect as usize];
        if indirect == 0 && index == inode_blocks {
            let buffer = self.buffer(level);
            let mut slots = [0; INODE_BLOCKS];
            for (b, slot) in slots.iter_mut().enumerate() {
                *slot = buffer.get_number(b as u32)?;
            }
            trace!("block-map: shrink: downing: table={}", block_to_free);
            self.blocks = slots;
        } else {
            self.blocks[indirect as usize] = 0;
        }

        fs.bitmap_free(false, block_to_free)?;
        self.last_map_block = block_to_free;
        Ok(())
    }

    /// Free every block the map holds.
    pub fn free_all(&mut self, fs: &FileSystem) -> Result<()> {
        self.shrink(fs, self.size.count as usize)
    }
}

/// Read entry `offset` of the table in `block`. An all-ones entry was never
/// written; like 0 it cannot name a block of this map.
fn find_indirect(
    fs: &FileSystem,
    buffer: &mut BufferHandle,
    block: u32,
    offset: u32,
) -> Result<u32> {
    buffer.request(fs, block, true)?;
    let result = buffer.get_number(offset)?;
    if result == 0 || result == u32::MAX || result >= fs.geometry().blocks {
        warn!(
            "block-map: find: invalid block in table: block={}, indirect={}/{}",
            result, block, offset
        );
        return Err(RfsError::CorruptMap { block, index: offset });
    }
    Ok(result)
}
