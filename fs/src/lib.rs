#![cfg_attr(not(test), no_std)]

pub mod bitmap;
pub mod block;
pub mod block_cache;
pub mod block_dev;
pub mod config;
pub mod dir;
pub mod error;
pub mod file;
pub mod file_system;
pub mod group;
pub mod inode;

extern crate alloc;

pub use block::{BlockMap, BlockPos, BlockSize};
pub use block_cache::BufferHandle;
pub use block_dev::BlockDevice;
pub use error::{Result, RfsError};
pub use file::{FileFlags, FileHandle, FileShared};
pub use file_system::{Clock, FileSystem, FsConfig, Geometry};
pub use inode::{FileType, InodeHandle};
