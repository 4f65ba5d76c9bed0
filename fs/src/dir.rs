// fs/src/dir.rs

//! Directory entries.
//!
//! A directory's data blocks hold variable-length records: `ino` (4),
//! `hash` (4), `length` (2, header included), then the name. Unused space
//! reads as all ones. A record never spans two blocks.

use alloc::string::String;
use alloc::vec::Vec;
use log::{trace, warn};

use crate::block::{BlockMap, BlockPos};
use crate::block_cache::{get_be16, get_be32, put_be16, put_be32, BufferHandle};
use crate::config::{DIR_ENTRY_EMPTY, DIR_ENTRY_SIZE, EMPTY_INO};
use crate::error::{Result, RfsError};
use crate::file_system::FileSystem;
use crate::inode::InodeHandle;

const ENTRY_INO: usize = 0;
const ENTRY_HASH: usize = 4;
const ENTRY_LEN: usize = 8;

/// One record read back from a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u32,
    pub name: String,
}

/// 32-bit FNV-1a of the name, stored to skip name compares on lookup.
pub fn name_hash(name: &[u8]) -> u32 {
    name.iter().fold(0x811c_9dc5u32, |hash, &byte| {
        (hash ^ byte as u32).wrapping_mul(0x0100_0193)
    })
}

/// Add `name -> ino` to directory `dir`, growing it by a block when no
/// existing block has room.
pub fn add_entry(fs: &FileSystem, dir: &mut InodeHandle, name: &str, ino: u32) -> Result<()> {
    trace!("dir-add-entry: dir={} name={} ino={}", dir.ino(), name, ino);
    if name.len() + DIR_ENTRY_SIZE > fs.block_size() as usize {
        return Err(RfsError::NameTooLong);
    }

    let mut map = BlockMap::open(fs, dir)?;
    let mut buffer = BufferHandle::new();
    let rc = insert(fs, dir.ino(), &mut map, &mut buffer, name.as_bytes(), ino);
    buffer.close();
    let closed = map.close(fs, dir);
    rc.and(closed)
}

fn insert(
    fs: &FileSystem,
    dir: u32,
    map: &mut BlockMap,
    buffer: &mut BufferHandle,
    name: &[u8],
    ino: u32,
) -> Result<()> {
    let block_size = fs.block_size() as usize;
    let length = name.len() + DIR_ENTRY_SIZE;
    let mut bpos = BlockPos::default();

    loop {
        let (block, read) = match map.find(fs, &bpos) {
            Ok(block) => (block, true),
            Err(RfsError::OutOfRange) => (map.grow(fs, 1)?, false),
            Err(err) => return Err(err),
        };

        buffer.request(fs, block, read)?;
        if !read {
            buffer.modify(|data| data.fill(0xff))?;
        }

        let free = buffer.read(|data| free_offset(fs, dir, data))??;
        if let Some(offset) = free.filter(|&offset| offset + length <= block_size) {
            buffer.modify(|data| {
                put_be32(data, offset + ENTRY_INO, ino);
                put_be32(data, offset + ENTRY_HASH, name_hash(name));
                put_be16(data, offset + ENTRY_LEN, length as u16);
                data[offset + DIR_ENTRY_SIZE..offset + length].copy_from_slice(name);
            })?;
            return Ok(());
        }

        bpos.bno += 1;
    }
}

/// Offset of the unused tail of a directory block, `None` if the block is
/// full of records.
fn free_offset(fs: &FileSystem, dir: u32, data: &[u8]) -> Result<Option<usize>> {
    let mut offset = 0;
    while offset + DIR_ENTRY_SIZE <= data.len() {
        let elength = get_be16(data, offset + ENTRY_LEN);
        if elength == DIR_ENTRY_EMPTY {
            return Ok(Some(offset));
        }
        check_entry(fs, dir, data, offset)?;
        offset += elength as usize;
    }
    Ok(None)
}

fn check_entry(fs: &FileSystem, dir: u32, data: &[u8], offset: usize) -> Result<()> {
    let elength = get_be16(data, offset + ENTRY_LEN) as usize;
    let eino = get_be32(data, offset + ENTRY_INO);
    if elength <= DIR_ENTRY_SIZE
        || offset + elength > data.len()
        || eino == EMPTY_INO
        || eino > fs.geometry().inodes
    {
        warn!(
            "dir: bad entry: dir={} offset={} length={} ino={}",
            dir, offset, elength, eino
        );
        return Err(RfsError::CorruptEntry { ino: dir, offset: offset as u32 });
    }
    Ok(())
}

/// Visit every record of `dir` until `f` returns `true`.
fn scan(
    fs: &FileSystem,
    dir: &mut InodeHandle,
    mut f: impl FnMut(u32, u32, &[u8]) -> bool,
) -> Result<()> {
    let ino = dir.ino();
    let mut map = BlockMap::open(fs, dir)?;
    let mut buffer = BufferHandle::new();

    let mut rc = Ok(());
    for bno in 0..map.count() {
        let bpos = BlockPos { bno, boff: 0, block: 0 };
        let stop = map
            .find(fs, &bpos)
            .and_then(|block| buffer.request(fs, block, true))
            .and_then(|()| {
                buffer.read(|data| {
                    let mut offset = 0;
                    while offset + DIR_ENTRY_SIZE <= data.len() {
                        let elength = get_be16(data, offset + ENTRY_LEN);
                        if elength == DIR_ENTRY_EMPTY {
                            break;
                        }
                        check_entry(fs, ino, data, offset)?;
                        let elength = elength as usize;
                        let name = &data[offset + DIR_ENTRY_SIZE..offset + elength];
                        if f(
                            get_be32(data, offset + ENTRY_INO),
                            get_be32(data, offset + ENTRY_HASH),
                            name,
                        ) {
                            return Ok(true);
                        }
                        offset += elength;
                    }
                    Ok(false)
                })?
            });
        match stop {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => {
                rc = Err(err);
                break;
            }
        }
    }

    buffer.close();
    let closed = map.close(fs, dir);
    rc.and(closed)
}

/// Inode number `name` refers to in `dir`.
pub fn lookup_ino(fs: &FileSystem, dir: &mut InodeHandle, name: &str) -> Result<Option<u32>> {
    let hash = name_hash(name.as_bytes());
    let mut found = None;
    scan(fs, dir, |ino, ehash, ename| {
        if ehash == hash && ename == name.as_bytes() {
            found = Some(ino);
            true
        } else {
            false
        }
    })?;
    Ok(found)
}

/// Every record of `dir` in on-disk order.
pub fn read_entries(fs: &FileSystem, dir: &mut InodeHandle) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    scan(fs, dir, |ino, _, name| {
        entries.push(DirEntry {
            ino,
            name: String::from_utf8_lossy(name).into_owned(),
        });
        false
    })?;
    Ok(entries)
}
