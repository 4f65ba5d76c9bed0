// fs/src/inode.rs

use core::ops::Deref;

use log::{debug, trace, warn};
use spin::MutexGuard;

use crate::block::{BlockMap, BlockSize};
use crate::block_cache::{get_be16, get_be32, put_be16, put_be32, BlockCache, BufferHandle};
use crate::config::{EMPTY_INO, GROUP_INODE_BLOCK, INODE_BLOCKS, INODE_SIZE, ROOT_INO};
use crate::dir;
use crate::error::{Result, RfsError};
use crate::file_system::FileSystem;

// mode type bits
pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;

/// The kinds of node an inode may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Directory,
    CharDevice,
    BlockDevice,
    Regular,
    Symlink,
}

impl FileType {
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(FileType::Directory),
            S_IFCHR => Some(FileType::CharDevice),
            S_IFBLK => Some(FileType::BlockDevice),
            S_IFREG => Some(FileType::Regular),
            S_IFLNK => Some(FileType::Symlink),
            _ => None,
        }
    }
}

// ----- on-disk record -----
// links(2) mode(2) owner(4) flags(2) block_offset(2) block_count(4)
// atime(4) mtime(4) ctime(4) data[5](20) last_map_block(4) last_data_block(4)
const LINKS: usize = 0;
const MODE: usize = 2;
const OWNER: usize = 4;
const FLAGS: usize = 8;
const BLOCK_OFFSET: usize = 10;
const BLOCK_COUNT: usize = 12;
const ATIME: usize = 16;
const MTIME: usize = 20;
const CTIME: usize = 24;
const DATA: usize = 28;
const LAST_MAP_BLOCK: usize = DATA + INODE_BLOCKS * 4;
const LAST_DATA_BLOCK: usize = LAST_MAP_BLOCK + 4;

/// Read view of a loaded inode record. It borrows the handle, so the
/// handle cannot be unloaded while a `Node` is alive.
pub struct Node<'a> {
    cache: MutexGuard<'a, BlockCache>,
    offset: usize,
}

impl Node<'_> {
    fn u16_at(&self, field: usize) -> u16 {
        get_be16(self.cache.data(), self.offset + field)
    }

    fn u32_at(&self, field: usize) -> u32 {
        get_be32(self.cache.data(), self.offset + field)
    }

    /// Link count; a never-written record reads as 0.
    pub fn links(&self) -> u16 {
        match self.u16_at(LINKS) {
            0xffff => 0,
            links => links,
        }
    }

    pub fn mode(&self) -> u16 {
        self.u16_at(MODE)
    }

    pub fn uid(&self) -> u16 {
        (self.u32_at(OWNER) & 0xffff) as u16
    }

    pub fn gid(&self) -> u16 {
        (self.u32_at(OWNER) >> 16) as u16
    }

    pub fn flags(&self) -> u16 {
        self.u16_at(FLAGS)
    }

    pub fn block_offset(&self) -> u16 {
        self.u16_at(BLOCK_OFFSET)
    }

    pub fn block_count(&self) -> u32 {
        self.u32_at(BLOCK_COUNT)
    }

    pub fn atime(&self) -> u32 {
        self.u32_at(ATIME)
    }

    pub fn mtime(&self) -> u32 {
        self.u32_at(MTIME)
    }

    pub fn ctime(&self) -> u32 {
        self.u32_at(CTIME)
    }

    pub fn block(&self, index: usize) -> u32 {
        self.u32_at(DATA + index * 4)
    }

    pub fn last_map_block(&self) -> u32 {
        self.u32_at(LAST_MAP_BLOCK)
    }

    pub fn last_data_block(&self) -> u32 {
        self.u32_at(LAST_DATA_BLOCK)
    }

    pub fn block_size(&self) -> BlockSize {
        BlockSize {
            count: self.block_count(),
            offset: self.block_offset() as u32,
        }
    }

    /// The raw record bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.cache.data()[self.offset..self.offset + INODE_SIZE]
    }
}

/// Write view of a loaded inode record.
pub struct NodeMut<'a> {
    node: Node<'a>,
}

impl<'a> Deref for NodeMut<'a> {
    type Target = Node<'a>;

    fn deref(&self) -> &Node<'a> {
        &self.node
    }
}

impl NodeMut<'_> {
    fn put_u16(&mut self, field: usize, value: u16) {
        let at = self.node.offset + field;
        put_be16(self.node.cache.data_mut(), at, value);
    }

    fn put_u32(&mut self, field: usize, value: u32) {
        let at = self.node.offset + field;
        put_be32(self.node.cache.data_mut(), at, value);
    }

    pub fn set_links(&mut self, links: u16) {
        self.put_u16(LINKS, links);
    }

    pub fn set_mode(&mut self, mode: u16) {
        self.put_u16(MODE, mode);
    }

    pub fn set_uid_gid(&mut self, uid: u16, gid: u16) {
        self.put_u32(OWNER, ((gid as u32) << 16) | uid as u32);
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.put_u16(FLAGS, flags);
    }

    pub fn set_block_offset(&mut self, offset: u16) {
        self.put_u16(BLOCK_OFFSET, offset);
    }

    pub fn set_block_count(&mut self, count: u32) {
        self.put_u32(BLOCK_COUNT, count);
    }

    pub fn set_atime(&mut self, atime: u32) {
        self.put_u32(ATIME, atime);
    }

    pub fn set_mtime(&mut self, mtime: u32) {
        self.put_u32(MTIME, mtime);
    }

    pub fn set_ctime(&mut self, ctime: u32) {
        self.put_u32(CTIME, ctime);
    }

    pub fn set_block(&mut self, index: usize, block: u32) {
        self.put_u32(DATA + index * 4, block);
    }

    pub fn set_last_map_block(&mut self, block: u32) {
        self.put_u32(LAST_MAP_BLOCK, block);
    }

    pub fn set_last_data_block(&mut self, block: u32) {
        self.put_u32(LAST_DATA_BLOCK, block);
    }

    /// Fill the record with ones, the pattern of a never-written inode.
    pub fn wipe(&mut self) {
        let at = self.node.offset;
        self.node.cache.data_mut()[at..at + INODE_SIZE].fill(0xff);
    }
}

// ----- InodeHandle -----

/// Handle on one on-disk inode.
///
/// The record is resident while the load count is above zero; loads nest
/// and each must be matched by an unload.
pub struct InodeHandle {
    ino: u32,
    block: u32,
    offset: usize,
    loads: u32,
    buffer: BufferHandle,
}

impl InodeHandle {
    // ----- constructor -----
    /// Locate inode `ino` on disk, loading it when `load` is set.
    pub fn open(fs: &FileSystem, ino: u32, load: bool) -> Result<Self> {
        let geometry = fs.geometry();
        trace!("inode-open: ino={}", ino);
        if ino == EMPTY_INO || ino - ROOT_INO >= geometry.inodes {
            return Err(RfsError::InvalidInode(ino));
        }

        let gino = ino - ROOT_INO;
        let group = gino / geometry.group_inodes;
        let gino = gino % geometry.group_inodes;
        let index = gino / geometry.inodes_per_block + GROUP_INODE_BLOCK;

        let mut handle = Self {
            ino,
            block: fs.groups()[group as usize].block(index),
            offset: (gino % geometry.inodes_per_block) as usize * INODE_SIZE,
            loads: 0,
            buffer: BufferHandle::new(),
        };
        if load {
            handle.load(fs)?;
        }
        Ok(handle)
    }

    // ----- accessors -----
    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// Block holding the record.
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Byte offset of the record in its block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn loads(&self) -> u32 {
        self.loads
    }

    pub fn is_loaded(&self) -> bool {
        self.buffer.has_block()
    }

    pub fn node(&self) -> Result<Node<'_>> {
        let cache = self.buffer.lock().ok_or(RfsError::NotLoaded(self.ino))?;
        Ok(Node {
            cache,
            offset: self.offset,
        })
    }

    /// Writable record; marks the backing buffer dirty.
    pub fn node_mut(&mut self) -> Result<NodeMut<'_>> {
        if !self.is_loaded() {
            return Err(RfsError::NotLoaded(self.ino));
        }
        self.buffer.mark_dirty();
        Ok(NodeMut { node: self.node()? })
    }

    // ----- residency -----
    pub fn load(&mut self, fs: &FileSystem) -> Result<()> {
        if !self.is_loaded() {
            self.buffer.request(fs, self.block, true)?;
        }
        self.loads += 1;
        Ok(())
    }

    /// Drop one load. The last unload releases the record, stamping ctime
    /// first if the record changed and `update_ctime` is set.
    pub fn unload(&mut self, fs: &FileSystem, update_ctime: bool) -> Result<()> {
        if self.loads == 0 {
            return Err(RfsError::Internal("inode unload without a matching load"));
        }
        self.loads -= 1;
        if self.loads == 0 {
            if self.buffer.is_dirty() && update_ctime {
                let now = fs.now();
                self.node_mut()?.set_ctime(now);
            }
            self.buffer.release();
        }
        Ok(())
    }

    /// Drop the load taken by `open` and check none are left.
    pub fn close(&mut self, fs: &FileSystem) -> Result<()> {
        trace!("inode-close: ino={}", self.ino);
        let rc = if self.is_loaded() {
            self.unload(fs, true)
        } else {
            Ok(())
        };
        if self.loads > 0 {
            self.loads = 0;
            self.buffer.release();
            return Err(RfsError::Internal("inode closed with loads outstanding"));
        }
        rc
    }

    // ----- record -----
    /// Reset the record for a new node and stamp atime and mtime.
    pub fn initialise(
        &mut self,
        fs: &FileSystem,
        links: u16,
        mode: u16,
        uid: u16,
        gid: u16,
    ) -> Result<()> {
        {
            let mut node = self.node_mut()?;
            node.set_links(links);
            node.set_flags(0);
            node.set_mode(mode);
            node.set_uid_gid(uid, gid);
            node.set_block_offset(0);
            node.set_block_count(0);
            for index in 0..INODE_BLOCKS {
                node.set_block(index, 0);
            }
            node.set_last_map_block(0);
            node.set_last_data_block(0);
        }
        self.time_stamp_now(fs, true, true)
    }

    pub fn time_stamp_now(&mut self, fs: &FileSystem, atime: bool, mtime: bool) -> Result<()> {
        let now = fs.now();
        let mut node = self.node_mut()?;
        if atime {
            node.set_atime(now);
        }
        if mtime {
            node.set_mtime(now);
        }
        Ok(())
    }

    /// File length in bytes as recorded in the inode.
    pub fn get_size(&self, fs: &FileSystem) -> Result<u64> {
        Ok(self.node()?.block_size().bytes(fs.block_size()))
    }

    /// Free the inode and every block it maps, then wipe the record. The
    /// handle ends up unloaded whatever its load count was.
    pub fn delete(&mut self, fs: &FileSystem) -> Result<()> {
        debug!("inode-delete: ino={}", self.ino);
        if !self.is_loaded() {
            return Err(RfsError::NotLoaded(self.ino));
        }

        free(fs, self.ino)?;

        let mut map = BlockMap::open(fs, self)?;
        let freed = map.free_all(fs);
        let closed = map.close(fs, self);

        if let Ok(mut node) = self.node_mut() {
            node.wipe();
        }
        // the record is gone, no ctime update
        self.loads = 0;
        self.buffer.release();

        freed.and(closed)
    }
}

// ----- allocation -----

/// Allocate an inode number near `goal`.
pub fn alloc(fs: &FileSystem, goal: u32) -> Result<u32> {
    fs.bitmap_alloc(goal, true)
}

pub fn free(fs: &FileSystem, ino: u32) -> Result<()> {
    fs.bitmap_free(true, ino)
}

// ----- create -----

/// A node part way through `create`. Dropping it without `commit` undoes
/// the steps done so far, newest first.
struct PendingInode<'fs> {
    fs: &'fs FileSystem,
    ino: u32,
    handle: Option<InodeHandle>,
    initialised: bool,
    committed: bool,
}

impl<'fs> PendingInode<'fs> {
    fn alloc(fs: &'fs FileSystem, parent: u32) -> Result<Self> {
        Ok(Self {
            fs,
            ino: alloc(fs, parent)?,
            handle: None,
            initialised: false,
            committed: false,
        })
    }

    fn handle(&mut self) -> Result<&mut InodeHandle> {
        self.handle
            .as_mut()
            .ok_or(RfsError::Internal("pending inode not open"))
    }

    fn open(&mut self) -> Result<()> {
        self.handle = Some(InodeHandle::open(self.fs, self.ino, true)?);
        Ok(())
    }

    fn initialise(&mut self, links: u16, mode: u16, uid: u16, gid: u16) -> Result<()> {
        let fs = self.fs;
        self.handle()?.initialise(fs, links, mode, uid, gid)?;
        self.initialised = true;
        Ok(())
    }

    fn add_entry(&mut self, name: &str, ino: u32) -> Result<()> {
        let fs = self.fs;
        dir::add_entry(fs, self.handle()?, name, ino)
    }

    fn commit(mut self) -> Result<u32> {
        let fs = self.fs;
        let closed = self.handle()?.close(fs);
        // on failure only the number is left to free
        self.handle = None;
        closed?;
        self.committed = true;
        Ok(self.ino)
    }
}

impl Drop for PendingInode<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let fs = self.fs;
        let ino = self.ino;
        warn!("inode-create: unwinding ino={}", ino);
        match self.handle.as_mut() {
            Some(handle) if self.initialised => {
                if let Err(err) = handle.delete(fs) {
                    warn!("inode-create: delete of ino={} failed: {}", ino, err);
                }
                if let Err(err) = handle.close(fs) {
                    warn!("inode-create: close of ino={} failed: {}", ino, err);
                }
            }
            Some(handle) => {
                let _ = handle.close(fs);
                if let Err(err) = free(fs, ino) {
                    warn!("inode-create: free of ino={} failed: {}", ino, err);
                }
            }
            None => {
                if let Err(err) = free(fs, ino) {
                    warn!("inode-create: free of ino={} failed: {}", ino, err);
                }
            }
        }
    }
}

/// Create a node called `name` in directory `parent` and return its inode
/// number. A new directory gets `.` and `..` entries, one extra link for
/// its own `.`, and adds a link to the parent. Any failure after the
/// number is allocated undoes everything done so far.
pub fn create(
    fs: &FileSystem,
    parent: u32,
    name: &str,
    mode: u16,
    links: u16,
    uid: u16,
    gid: u16,
) -> Result<u32> {
    debug!("inode-create: parent={} name={} mode={:#o}", parent, name, mode);

    let file_type = FileType::from_mode(mode).ok_or(RfsError::InvalidMode(mode))?;
    let is_dir = file_type == FileType::Directory;

    let mut pending = PendingInode::alloc(fs, parent)?;
    pending.open()?;
    pending.initialise(links, mode, uid, gid)?;

    if is_dir {
        let ino = pending.ino;
        pending.add_entry(".", ino)?;
        {
            let mut node = pending.handle()?.node_mut()?;
            let links = node.links();
            node.set_links(links + 1);
        }
        pending.add_entry("..", parent)?;
    }

    let mut parent_inode = InodeHandle::open(fs, parent, true)?;
    let linked = dir::add_entry(fs, &mut parent_inode, name, pending.ino).and_then(|()| {
        if is_dir {
            let mut node = parent_inode.node_mut()?;
            let links = node.links();
            node.set_links(links + 1);
        }
        Ok(())
    });
    let closed = parent_inode.close(fs);
    linked.and(closed)?;

    pending.commit()
}
