// fs/src/error.rs

use thiserror::Error;

/// Errors reported by the block map, inode and file layers.
///
/// `Internal` is reserved for protocol violations by the caller (an unload
/// without a matching load, a close with loads outstanding). Everything else
/// is an ordinary condition the caller is expected to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RfsError {
    #[error("invalid inode number {0}")]
    InvalidInode(u32),
    #[error("invalid block number {0}")]
    InvalidBlock(u32),
    #[error("invalid mode {0:#o}")]
    InvalidMode(u16),
    #[error("inode {0} is not loaded")]
    NotLoaded(u32),
    #[error("invalid file system geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("no free blocks")]
    NoSpace,
    #[error("no free inodes")]
    NoInodes,
    #[error("position outside the block map")]
    OutOfRange,
    #[error("file too big")]
    FileTooBig,
    #[error("device I/O error at block {0}")]
    Io(u32),
    /// `block` is the table holding the bad entry, 0 for the inode's own slots.
    #[error("corrupt block number table {block}, entry {index}")]
    CorruptMap { block: u32, index: u32 },
    #[error("corrupt directory entry in inode {ino} at offset {offset}")]
    CorruptEntry { ino: u32, offset: u32 },
    #[error("name too long")]
    NameTooLong,
    #[error("bit {0} is already free")]
    AlreadyFree(u32),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl RfsError {
    /// POSIX errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            RfsError::InvalidInode(_) => 22,    // EINVAL
            RfsError::InvalidBlock(_) => 22,    // EINVAL
            RfsError::InvalidMode(_) => 22,     // EINVAL
            RfsError::NotLoaded(_) => 6,        // ENXIO
            RfsError::InvalidGeometry(_) => 22, // EINVAL
            RfsError::NoSpace => 28,            // ENOSPC
            RfsError::NoInodes => 28,           // ENOSPC
            RfsError::OutOfRange => 6,          // ENXIO
            RfsError::FileTooBig => 27,         // EFBIG
            RfsError::Io(_) => 5,               // EIO
            RfsError::CorruptMap { .. } => 5,   // EIO
            RfsError::CorruptEntry { .. } => 5, // EIO
            RfsError::NameTooLong => 36,        // ENAMETOOLONG
            RfsError::AlreadyFree(_) => 22,     // EINVAL
            RfsError::Internal(_) => 5,         // EIO
        }
    }
}

pub type Result<T> = core::result::Result<T, RfsError>;
