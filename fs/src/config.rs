// fs/src/config.rs

/// Block-number slots held directly in an inode record.
pub const INODE_BLOCKS: usize = 5;
/// Size of one on-disk inode record in bytes.
pub const INODE_SIZE: usize = 56;
/// Size of one block number inside an indirect table.
pub const BLOCK_NUMBER_SIZE: usize = 4;

pub const EMPTY_INO: u32 = 0;
pub const ROOT_INO: u32 = 1;

// block 0 of the volume holds the superblock, groups follow
pub const SUPERBLOCK_BLOCKS: u32 = 1;

// group layout, relative to the group base block
pub const GROUP_BLOCK_BITMAP_BLOCK: u32 = 0;
pub const GROUP_INODE_BITMAP_BLOCK: u32 = 1;
pub const GROUP_INODE_BLOCK: u32 = 2;

// directory entry: ino(4) hash(4) length(2) name
pub const DIR_ENTRY_SIZE: usize = 10;
pub const DIR_ENTRY_EMPTY: u16 = 0xffff;

pub const MIN_BLOCK_SIZE: u32 = 128;
pub const MAX_BLOCK_SIZE: u32 = 32768;
pub const DEFAULT_BLOCK_SIZE: u32 = 512;
pub const DEFAULT_CACHE_SIZE: usize = 32;
