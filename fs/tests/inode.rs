mod common;

use common::mkfs;
use rfs::config::{INODE_BLOCKS, ROOT_INO};
use rfs::dir;
use rfs::inode::{self, FileType, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use rfs::{BlockMap, FileSystem, InodeHandle, RfsError};

fn links(fs: &FileSystem, ino: u32) -> u16 {
    let mut handle = InodeHandle::open(fs, ino, true).unwrap();
    let links = handle.node().unwrap().links();
    handle.close(fs).unwrap();
    links
}

#[test]
fn format_creates_root_directory() {
    let t = mkfs();
    let mut root = InodeHandle::open(&t.fs, ROOT_INO, true).unwrap();
    {
        let node = root.node().unwrap();
        assert_eq!(node.mode() & S_IFMT, S_IFDIR);
        assert_eq!(node.links(), 2);
        assert_eq!(node.block_count(), 1);
    }
    let entries = dir::read_entries(&t.fs, &mut root).unwrap();
    let names: Vec<(&str, u32)> = entries.iter().map(|e| (e.name.as_str(), e.ino)).collect();
    assert_eq!(names, vec![(".", ROOT_INO), ("..", ROOT_INO)]);
    root.close(&t.fs).unwrap();
    assert_eq!(t.fs.usage().unwrap().1, 1);
}

#[test]
fn open_rejects_out_of_range_numbers() {
    let t = mkfs();
    let inodes = t.fs.geometry().inodes;
    assert!(matches!(
        InodeHandle::open(&t.fs, 0, false),
        Err(RfsError::InvalidInode(0))
    ));
    assert!(matches!(
        InodeHandle::open(&t.fs, inodes + 1, false),
        Err(RfsError::InvalidInode(_))
    ));
    let last = InodeHandle::open(&t.fs, inodes, false).unwrap();
    assert!(!last.is_loaded());
}

#[test]
fn open_locates_the_record() {
    let t = mkfs();
    let geometry = *t.fs.geometry();
    // second inode shares the root's table block
    let second = InodeHandle::open(&t.fs, 2, false).unwrap();
    let root = InodeHandle::open(&t.fs, ROOT_INO, false).unwrap();
    assert_eq!(second.block(), root.block());
    assert_eq!(second.offset(), 56);

    // first inode of the second group
    let ino = geometry.group_inodes + 1;
    let handle = InodeHandle::open(&t.fs, ino, false).unwrap();
    assert_eq!(handle.block(), t.fs.groups()[1].block(2));
    assert_eq!(handle.offset(), 0);
}

#[test]
fn groups_lay_out_their_bitmaps_first() {
    let t = mkfs();
    let geometry = *t.fs.geometry();
    let groups = t.fs.groups();
    assert_eq!(groups.len(), 2);

    for (index, group) in groups.iter().enumerate() {
        let base = 1 + index as u32 * geometry.group_blocks;
        assert_eq!(group.size(), geometry.group_blocks);
        assert_eq!(group.block_bitmap().block(), base);
        assert_eq!(group.block_bitmap().size(), group.size());
        assert_eq!(group.inode_bitmap().block(), base + 1);
        assert_eq!(group.inode_bitmap().size(), geometry.group_inodes);
    }
}

#[test]
fn loads_nest_and_unbalanced_unload_fails() {
    let t = mkfs();
    let mut handle = InodeHandle::open(&t.fs, ROOT_INO, false).unwrap();
    assert!(matches!(handle.node(), Err(RfsError::NotLoaded(1))));

    for _ in 0..3 {
        handle.load(&t.fs).unwrap();
    }
    assert_eq!(handle.loads(), 3);
    assert!(handle.is_loaded());
    for _ in 0..3 {
        handle.unload(&t.fs, false).unwrap();
    }
    assert_eq!(handle.loads(), 0);
    assert!(!handle.is_loaded());

    let err = handle.unload(&t.fs, false).unwrap_err();
    assert!(matches!(err, RfsError::Internal(_)));
    assert_eq!(handle.loads(), 0);
}

#[test]
fn close_with_outstanding_loads_is_an_internal_error() {
    let t = mkfs();
    let mut handle = InodeHandle::open(&t.fs, ROOT_INO, true).unwrap();
    handle.load(&t.fs).unwrap();
    let err = handle.close(&t.fs).unwrap_err();
    assert!(matches!(err, RfsError::Internal(_)));
    assert_eq!(handle.loads(), 0);
    assert!(!handle.is_loaded());
}

#[test]
fn unload_stamps_ctime_only_when_changed() {
    let t = mkfs();
    let mut handle = InodeHandle::open(&t.fs, ROOT_INO, true).unwrap();
    let ctime = handle.node().unwrap().ctime();
    t.clock.set(5000);
    handle.unload(&t.fs, true).unwrap();

    handle.load(&t.fs).unwrap();
    assert_eq!(handle.node().unwrap().ctime(), ctime);
    handle.node_mut().unwrap().set_flags(0);
    handle.unload(&t.fs, true).unwrap();

    handle.load(&t.fs).unwrap();
    assert_eq!(handle.node().unwrap().ctime(), 5000);
    handle.close(&t.fs).unwrap();
}

#[test]
fn initialise_requires_a_loaded_handle() {
    let t = mkfs();
    let mut handle = InodeHandle::open(&t.fs, 2, false).unwrap();
    assert!(matches!(
        handle.initialise(&t.fs, 1, S_IFREG | 0o644, 0, 0),
        Err(RfsError::NotLoaded(2))
    ));
    assert!(matches!(
        handle.time_stamp_now(&t.fs, true, true),
        Err(RfsError::NotLoaded(2))
    ));
}

#[test]
fn initialise_resets_the_record() {
    let t = mkfs();
    t.clock.set(77);
    let mut handle = InodeHandle::open(&t.fs, 3, true).unwrap();
    handle.initialise(&t.fs, 1, S_IFREG | 0o600, 1000, 2000).unwrap();
    {
        let node = handle.node().unwrap();
        assert_eq!(node.links(), 1);
        assert_eq!(node.mode(), S_IFREG | 0o600);
        assert_eq!(node.uid(), 1000);
        assert_eq!(node.gid(), 2000);
        assert_eq!(node.flags(), 0);
        assert_eq!(node.block_count(), 0);
        assert_eq!(node.block_offset(), 0);
        assert_eq!(node.atime(), 77);
        assert_eq!(node.mtime(), 77);
        assert_eq!(node.last_map_block(), 0);
        assert_eq!(node.last_data_block(), 0);
        for slot in 0..INODE_BLOCKS {
            assert_eq!(node.block(slot), 0);
        }
    }
    assert_eq!(handle.get_size(&t.fs).unwrap(), 0);
    handle.close(&t.fs).unwrap();
}

#[test]
fn create_directory_links_it_into_the_parent() {
    let t = mkfs();
    let root_links = links(&t.fs, ROOT_INO);

    let sub = inode::create(&t.fs, ROOT_INO, "sub", S_IFDIR | 0o755, 1, 0, 0).unwrap();
    assert_ne!(sub, ROOT_INO);

    let mut handle = InodeHandle::open(&t.fs, sub, true).unwrap();
    {
        let node = handle.node().unwrap();
        assert_eq!(FileType::from_mode(node.mode()), Some(FileType::Directory));
        assert!(node.links() >= 2);
    }
    assert_eq!(dir::lookup_ino(&t.fs, &mut handle, ".").unwrap(), Some(sub));
    assert_eq!(dir::lookup_ino(&t.fs, &mut handle, "..").unwrap(), Some(ROOT_INO));
    handle.close(&t.fs).unwrap();

    assert_eq!(links(&t.fs, ROOT_INO), root_links + 1);
    let mut root = InodeHandle::open(&t.fs, ROOT_INO, true).unwrap();
    assert_eq!(dir::lookup_ino(&t.fs, &mut root, "sub").unwrap(), Some(sub));
    assert_eq!(dir::lookup_ino(&t.fs, &mut root, "other").unwrap(), None);
    root.close(&t.fs).unwrap();
}

#[test]
fn create_regular_file_leaves_parent_links_alone() {
    let t = mkfs();
    let root_links = links(&t.fs, ROOT_INO);
    let ino = inode::create(&t.fs, ROOT_INO, "file", S_IFREG | 0o644, 1, 7, 8).unwrap();
    assert_eq!(links(&t.fs, ROOT_INO), root_links);
    assert_eq!(links(&t.fs, ino), 1);

    let link = inode::create(&t.fs, ROOT_INO, "link", S_IFLNK | 0o777, 1, 0, 0).unwrap();
    assert_ne!(link, ino);
}

#[test]
fn create_rejects_unknown_mode_types() {
    let t = mkfs();
    let usage = t.fs.usage().unwrap();
    let err = inode::create(&t.fs, ROOT_INO, "bad", 0o644, 1, 0, 0).unwrap_err();
    assert_eq!(err, RfsError::InvalidMode(0o644));
    assert_eq!(err.errno(), 22);
    assert_eq!(t.fs.usage().unwrap(), usage);
}

#[test]
fn failed_create_is_unwound() {
    let t = mkfs();
    let usage = t.fs.usage().unwrap();
    let root_links = links(&t.fs, ROOT_INO);
    let long = "n".repeat(200);

    let err = inode::create(&t.fs, ROOT_INO, &long, S_IFREG | 0o644, 1, 0, 0).unwrap_err();
    assert_eq!(err, RfsError::NameTooLong);
    assert_eq!(t.fs.usage().unwrap(), usage);

    // a directory also gets its "." and ".." block back
    let err = inode::create(&t.fs, ROOT_INO, &long, S_IFDIR | 0o755, 1, 0, 0).unwrap_err();
    assert_eq!(err, RfsError::NameTooLong);
    assert_eq!(t.fs.usage().unwrap(), usage);
    assert_eq!(links(&t.fs, ROOT_INO), root_links);

    // the number is free again
    let ino = inode::create(&t.fs, ROOT_INO, "ok", S_IFREG | 0o644, 1, 0, 0).unwrap();
    assert_eq!(ino, 2);
}

#[test]
fn delete_frees_everything_and_wipes_the_record() {
    let t = mkfs();
    let usage = t.fs.usage().unwrap();
    let ino = inode::create(&t.fs, ROOT_INO, "doomed", S_IFREG | 0o644, 1, 0, 0).unwrap();

    let mut handle = InodeHandle::open(&t.fs, ino, true).unwrap();
    let mut map = BlockMap::open(&t.fs, &mut handle).unwrap();
    map.grow(&t.fs, 9).unwrap();
    map.close(&t.fs, &mut handle).unwrap();
    let (blocks, inodes) = t.fs.usage().unwrap();
    assert_eq!(inodes, usage.1 + 1);
    // nine data blocks and one table
    assert_eq!(blocks, usage.0 + 10);

    handle.load(&t.fs).unwrap();
    handle.delete(&t.fs).unwrap();
    assert_eq!(handle.loads(), 0);
    assert!(!handle.is_loaded());
    assert_eq!(t.fs.usage().unwrap(), (usage.0, usage.1));

    let mut handle = InodeHandle::open(&t.fs, ino, true).unwrap();
    {
        let node = handle.node().unwrap();
        assert_eq!(node.links(), 0);
        assert_eq!(node.mode(), 0xffff);
        assert!(node.bytes().iter().all(|&b| b == 0xff));
    }
    handle.close(&t.fs).unwrap();
}

#[test]
fn delete_requires_a_loaded_handle() {
    let t = mkfs();
    let ino = inode::create(&t.fs, ROOT_INO, "f", S_IFREG | 0o644, 1, 0, 0).unwrap();
    let mut handle = InodeHandle::open(&t.fs, ino, false).unwrap();
    assert!(matches!(handle.delete(&t.fs), Err(RfsError::NotLoaded(_))));
    assert_eq!(t.fs.usage().unwrap().1, 2);
}

#[test]
fn volume_reopens_from_the_device() {
    let t = mkfs();
    let sub = inode::create(&t.fs, ROOT_INO, "keep", S_IFDIR | 0o700, 1, 0, 0).unwrap();
    t.fs.sync().unwrap();
    let config = common::config();
    let usage = t.fs.usage().unwrap();
    drop(t.fs);

    let fs = FileSystem::open(t.disk.clone(), config, t.clock.clone()).unwrap();
    assert_eq!(fs.usage().unwrap(), usage);
    let mut root = InodeHandle::open(&fs, ROOT_INO, true).unwrap();
    assert_eq!(dir::lookup_ino(&fs, &mut root, "keep").unwrap(), Some(sub));
    root.close(&fs).unwrap();
}
