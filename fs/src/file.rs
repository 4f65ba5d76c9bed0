// fs/src/file.rs

use alloc::sync::Arc;
use bitflags::bitflags;
use log::{debug, trace, warn};
use spin::Mutex;

use crate::block::{BlockMap, BlockPos, BlockSize};
use crate::block_cache::BufferHandle;
use crate::error::{Result, RfsError};
use crate::file_system::FileSystem;
use crate::inode::InodeHandle;

bitflags! {
    /// Per-open switches for the metadata `io_end` maintains.
    pub struct FileFlags: u32 {
        const NO_ATIME = 1 << 0;
        const NO_MTIME = 1 << 1;
        const NO_LENGTH = 1 << 2;
    }
}

// ----- FileShared -----

/// State shared by every open of one inode: the loaded inode, its block
/// map and cached times. The map's size is the file size.
pub struct FileShared {
    references: u32,
    inode: InodeHandle,
    map: BlockMap,
    atime: u32,
    mtime: u32,
    ctime: u32,
}

impl FileShared {
    fn open(fs: &FileSystem, ino: u32) -> Result<Self> {
        let mut inode = InodeHandle::open(fs, ino, true)?;
        let opened = BlockMap::open(fs, &mut inode).and_then(|map| {
            let node = inode.node()?;
            Ok((map, node.atime(), node.mtime(), node.ctime()))
        });
        match opened {
            Ok((map, atime, mtime, ctime)) => Ok(Self {
                references: 1,
                inode,
                map,
                atime,
                mtime,
                ctime,
            }),
            Err(err) => {
                let _ = inode.close(fs);
                Err(err)
            }
        }
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn ino(&self) -> u32 {
        self.inode.ino()
    }

    pub fn inode(&self) -> &InodeHandle {
        &self.inode
    }

    pub fn map(&self) -> &BlockMap {
        &self.map
    }

    pub fn atime(&self) -> u32 {
        self.atime
    }

    pub fn mtime(&self) -> u32 {
        self.mtime
    }

    pub fn ctime(&self) -> u32 {
        self.ctime
    }

    /// File length in bytes.
    pub fn size(&self, fs: &FileSystem) -> u64 {
        self.map.size().bytes(fs.block_size())
    }

    pub fn block_count(&self) -> u32 {
        self.map.size().count
    }

    pub fn block_offset(&self) -> u32 {
        self.map.size().offset
    }

    /// Write the cached times and the map back into the inode and close it.
    fn finish(&mut self, fs: &FileSystem) -> Result<()> {
        let mut rc = self.inode.load(fs);
        if rc.is_ok() {
            let stale = self.inode.node().map(|node| {
                node.atime() != self.atime
                    || node.mtime() != self.mtime
                    || node.ctime() != self.ctime
            });
            if let Ok(true) = stale {
                if let Ok(mut node) = self.inode.node_mut() {
                    node.set_atime(self.atime);
                    node.set_mtime(self.mtime);
                    node.set_ctime(self.ctime);
                }
            }
            rc = self.inode.unload(fs, false);
        }

        let closed = self.map.close(fs, &mut self.inode);
        let inode_closed = self.inode.close(fs);
        rc.and(closed).and(inode_closed)
    }
}

impl FileSystem {
    /// The shared state of `ino` if some handle has it open. The reference
    /// count is left alone; only opens and closes change it.
    pub fn file_get_shared(&self, ino: u32) -> Option<Arc<Mutex<FileShared>>> {
        self.file_shares()
            .lock()
            .iter()
            .find(|shared| shared.lock().ino() == ino)
            .cloned()
    }

    /// Open inode `ino`, joining its shared state when another handle has
    /// it open already.
    pub fn file_open(&self, ino: u32, flags: FileFlags) -> Result<FileHandle> {
        debug!("file-open: ino={} flags={:?}", ino, flags);
        let shared = match self.file_get_shared(ino) {
            Some(shared) => {
                shared.lock().references += 1;
                shared
            }
            None => {
                let shared = Arc::new(Mutex::new(FileShared::open(self, ino)?));
                self.file_shares().lock().push(Arc::clone(&shared));
                shared
            }
        };
        Ok(FileHandle {
            flags,
            shared,
            buffer: BufferHandle::new(),
            bpos: BlockPos::default(),
            closed: false,
        })
    }
}

// ----- FileHandle -----

/// One open of a file: its own position and I/O buffer over the shared
/// state.
///
/// I/O goes one block at a time: [`FileHandle::io_start`] pins the block at
/// the position, the caller moves data with [`FileHandle::with_data`] or
/// [`FileHandle::with_data_mut`], and [`FileHandle::io_end`] advances.
pub struct FileHandle {
    flags: FileFlags,
    shared: Arc<Mutex<FileShared>>,
    buffer: BufferHandle,
    bpos: BlockPos,
    closed: bool,
}

impl FileHandle {
    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    pub fn shared(&self) -> &Arc<Mutex<FileShared>> {
        &self.shared
    }

    pub fn ino(&self) -> u32 {
        self.shared.lock().ino()
    }

    pub fn bpos(&self) -> BlockPos {
        self.bpos
    }

    /// Byte position of the handle.
    pub fn position(&self, fs: &FileSystem) -> u64 {
        self.bpos.pos(fs.block_size())
    }

    /// Drop this open. The last close of an inode writes its state back and
    /// removes it from the file system's list.
    pub fn close(mut self, fs: &FileSystem) -> Result<()> {
        self.closed = true;
        self.buffer.close();

        let mut shared = self.shared.lock();
        trace!(
            "file-close: ino={} references={}",
            shared.ino(),
            shared.references
        );
        shared.references = shared.references.saturating_sub(1);
        if shared.references > 0 {
            return Ok(());
        }

        let rc = shared.finish(fs);
        drop(shared);
        fs.file_shares()
            .lock()
            .retain(|other| !Arc::ptr_eq(other, &self.shared));
        rc
    }

    // ----- block I/O -----
    /// Pin the block at the position and return how many bytes can move
    /// before the end of the block, or for a read the end of the file.
    ///
    /// Fails with `OutOfRange` for a read at or past the end of the file and
    /// for a write into a block the map does not hold yet.
    pub fn io_start(&mut self, fs: &FileSystem, read: bool) -> Result<usize> {
        let block_size = fs.block_size();
        let mut shared = self.shared.lock();
        let size = shared.map.size();
        trace!(
            "file-io: start: {} pos={}:{}",
            if read { "read" } else { "write" },
            self.bpos.bno,
            self.bpos.boff
        );

        if read && self.bpos.pos(block_size) >= size.bytes(block_size) {
            return Err(RfsError::OutOfRange);
        }
        let block = shared.map.find(fs, &self.bpos)?;
        self.buffer.request(fs, block, true)?;
        self.bpos.block = block;

        let end = if read && shared.map.is_last(&self.bpos) && size.offset != 0 {
            size.offset
        } else {
            block_size
        };
        Ok((end - self.bpos.boff) as usize)
    }

    /// Finish I/O of `size` bytes on the pinned block and advance. Unless
    /// the handle's flags say otherwise a read stamps atime, a write stamps
    /// mtime and extends the length when it wrote past the end.
    pub fn io_end(&mut self, fs: &FileSystem, size: usize, read: bool) -> Result<()> {
        let block_size = fs.block_size();
        trace!(
            "file-io: end: {} size={}",
            if read { "read" } else { "write" },
            size
        );

        if !self.buffer.has_block() {
            return Err(RfsError::Internal("file io_end without io_start"));
        }
        if !read {
            self.buffer.mark_dirty();
        }
        self.buffer.release();

        let pos = self.bpos.pos(block_size) + size as u64;
        self.bpos = BlockPos::from_pos(block_size, pos);

        let mut shared = self.shared.lock();
        if !read
            && !self.flags.contains(FileFlags::NO_LENGTH)
            && self.bpos.past_end(&shared.map.size(), block_size)
        {
            shared.map.set_size_offset(self.bpos.boff);
        }

        if read && !self.flags.contains(FileFlags::NO_ATIME) {
            shared.atime = fs.now();
        }
        if !read && !self.flags.contains(FileFlags::NO_MTIME) {
            shared.mtime = fs.now();
        }
        Ok(())
    }

    /// Drop the pinned block without advancing or touching metadata.
    pub fn io_release(&mut self) {
        self.buffer.release();
    }

    /// The pinned block from the position to the end of the block.
    pub fn with_data<V>(&self, f: impl FnOnce(&[u8]) -> V) -> Result<V> {
        let boff = self.bpos.boff as usize;
        self.buffer.read(|data| f(&data[boff..]))
    }

    pub fn with_data_mut<V>(&mut self, f: impl FnOnce(&mut [u8]) -> V) -> Result<V> {
        let boff = self.bpos.boff as usize;
        self.buffer.modify(|data| f(&mut data[boff..]))
    }

    // ----- positioning -----
    /// Move to byte `pos`, which may lie past the end of the file. Inside
    /// the file the block is resolved through the shared map and the pinned
    /// buffer is kept when it still holds that block.
    pub fn seek(&mut self, fs: &FileSystem, pos: u64) -> Result<u64> {
        let block_size = fs.block_size();
        if pos > fs.geometry().max_file_size() {
            return Err(RfsError::OutOfRange);
        }
        let bpos = BlockPos::from_pos(block_size, pos);

        let mut shared = self.shared.lock();
        trace!("file-seek: ino={} pos={}", shared.ino(), pos);
        let size = shared.map.size();
        if bpos.past_end(&size, block_size) || bpos.block_past_end(&size) {
            self.buffer.release();
            self.bpos = bpos;
            return Ok(pos);
        }

        let block = shared.map.find(fs, &bpos)?;
        if self.buffer.has_block() && self.buffer.bnum() != block {
            self.buffer.release();
        }
        self.bpos = BlockPos { block, ..bpos };
        Ok(pos)
    }

    /// Truncate or extend the file to `new_size` bytes. Added space reads as
    /// zeroes.
    pub fn set_size(&mut self, fs: &FileSystem, new_size: u64) -> Result<()> {
        let block_size = fs.block_size();
        if new_size > fs.geometry().max_file_size() {
            return Err(RfsError::FileTooBig);
        }

        let mut shared = self.shared.lock();
        let size = shared.map.size().bytes(block_size);
        trace!("file-set-size: ino={} size={} new={}", shared.ino(), size, new_size);

        if new_size < size {
            let target = BlockSize::from_pos(block_size, new_size);
            let blocks = shared.map.count() - target.count;
            shared.map.shrink(fs, blocks as usize)?;
            shared.map.set_size_offset(target.offset);
            if self.bpos.past_end(&target, block_size) || self.bpos.block_past_end(&target) {
                self.buffer.release();
                self.bpos = target.to_bpos();
            }
        } else if new_size > size {
            extend(fs, &mut shared.map, new_size - size)?;
        }

        if !self.flags.contains(FileFlags::NO_MTIME) {
            shared.mtime = fs.now();
        }
        Ok(())
    }

    // ----- byte I/O -----
    /// Read into `buf` from the position. Returns the bytes read, short at
    /// the end of the file.
    pub fn read(&mut self, fs: &FileSystem, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let available = match self.io_start(fs, true) {
                Ok(available) => available,
                Err(RfsError::OutOfRange) => break,
                Err(err) => return Err(err),
            };
            let n = available.min(buf.len() - done);
            let chunk = &mut buf[done..done + n];
            self.with_data(|data| chunk.copy_from_slice(&data[..n]))?;
            self.io_end(fs, n, true)?;
            done += n;
        }
        Ok(done)
    }

    /// Write `buf` at the position, extending the file first when the write
    /// ends past it. A `NO_LENGTH` handle never extends the file: it writes
    /// only into blocks the file already has and returns a short count at
    /// the first missing one.
    pub fn write(&mut self, fs: &FileSystem, buf: &[u8]) -> Result<usize> {
        let fixed = self.flags.contains(FileFlags::NO_LENGTH);
        let end = self.position(fs) + buf.len() as u64;
        let size = self.shared.lock().size(fs);
        if end > size && !fixed {
            self.set_size(fs, end)?;
        }

        let mut done = 0;
        while done < buf.len() {
            let available = match self.io_start(fs, false) {
                Ok(available) => available,
                Err(RfsError::OutOfRange) if fixed => break,
                Err(err) => return Err(err),
            };
            let n = available.min(buf.len() - done);
            let chunk = &buf[done..done + n];
            self.with_data_mut(|data| data[..n].copy_from_slice(chunk))?;
            self.io_end(fs, n, false)?;
            done += n;
        }
        Ok(done)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed {
            // the shared state keeps this open's reference until the mount goes
            warn!(
                "file-drop: ino={} dropped without close, shared state leaked",
                self.shared.lock().ino()
            );
        }
    }
}

/// Add `count` zeroed bytes at the end of `map`.
fn extend(fs: &FileSystem, map: &mut BlockMap, count: u64) -> Result<()> {
    let mut buffer = BufferHandle::new();
    let rc = zero_fill(fs, map, &mut buffer, count);
    buffer.close();
    rc
}

fn zero_fill(
    fs: &FileSystem,
    map: &mut BlockMap,
    buffer: &mut BufferHandle,
    mut count: u64,
) -> Result<()> {
    let block_size = fs.block_size();
    while count > 0 {
        let bpos = map.size().to_bpos();
        let (block, fresh) = match map.find(fs, &bpos) {
            Ok(block) => (block, false),
            Err(RfsError::OutOfRange) => (map.grow(fs, 1)?, true),
            Err(err) => return Err(err),
        };
        let boff = bpos.boff as usize;
        let length = count.min((block_size - bpos.boff) as u64) as usize;

        buffer.request(fs, block, !fresh)?;
        buffer.modify(|data| {
            if fresh {
                data.fill(0);
            } else {
                data[boff..boff + length].fill(0);
            }
        })?;
        map.set_size_offset((bpos.boff + length as u32) % block_size);
        count -= length as u64;
    }
    Ok(())
}
