//! Rename semantics and crash atomicity of the journaled update.

mod common;

use common::{mount, small_cfg};
use pmufs::kfs::Kfs;
use pmufs::layout::DirEntryHead;
use pmufs::libfs::mnode::tombstone_entry;
use pmufs::pm::PmOffset;

const CR: i32 = libc::O_CREAT;
const RW: i32 = libc::O_RDWR;

#[test]
fn rename_moves_a_file_between_directories() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let fs = mount(&kfs, 1);
    let p = fs.proc();

    p.sys_mkdir("/d1", 0o755).unwrap();
    p.sys_mkdir("/d2", 0o755).unwrap();
    let fd = p.sys_open("/d1/f", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"data1").unwrap();
    let ino = p.sys_fstat(fd).unwrap().ino;
    p.sys_close(fd).unwrap();

    p.sys_rename("/d1/f", "/d2/g").unwrap();

    assert!(p.sys_open("/d1/f", RW, 0).is_err());
    let fd = p.sys_open("/d2/g", RW, 0).unwrap();
    assert_eq!(p.sys_fstat(fd).unwrap().ino, ino);
    let mut buf = [0u8; 5];
    assert_eq!(p.sys_read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"data1");
    p.sys_close(fd).unwrap();
}

#[test]
fn rename_over_matching_roadblock_succeeds() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let fs = mount(&kfs, 1);
    let p = fs.proc();

    let fd = p.sys_open("/src", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"fresh").unwrap();
    let src_ino = p.sys_fstat(fd).unwrap().ino;
    p.sys_close(fd).unwrap();

    let fd = p.sys_open("/dst", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"stale").unwrap();
    p.sys_close(fd).unwrap();

    // File over file: allowed, and the name now resolves to the source.
    p.sys_rename("/src", "/dst").unwrap();
    assert!(p.sys_open("/src", RW, 0).is_err());
    let fd = p.sys_open("/dst", RW, 0).unwrap();
    assert_eq!(p.sys_fstat(fd).unwrap().ino, src_ino);
    let mut buf = [0u8; 5];
    p.sys_read(fd, &mut buf).unwrap();
    assert_eq!(&buf, b"fresh");
    p.sys_close(fd).unwrap();
}

#[test]
fn rename_with_mismatched_types_fails() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let fs = mount(&kfs, 1);
    let p = fs.proc();

    p.sys_mkdir("/dir", 0o755).unwrap();
    let fd = p.sys_open("/file", CR | RW, 0o644).unwrap();
    p.sys_close(fd).unwrap();

    assert!(p.sys_rename("/file", "/dir").is_err());
    assert!(p.sys_rename("/dir", "/file").is_err());

    // Both survive untouched.
    assert!(p.sys_lstat("/dir").is_ok());
    assert!(p.sys_lstat("/file").is_ok());
}

#[test]
fn rename_to_itself_is_a_no_op() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let fs = mount(&kfs, 1);
    let p = fs.proc();

    let fd = p.sys_open("/same", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"abc").unwrap();
    p.sys_close(fd).unwrap();

    p.sys_rename("/same", "/same").unwrap();
    let fd = p.sys_open("/same", RW, 0).unwrap();
    assert_eq!(p.sys_fstat(fd).unwrap().size, 3);
    p.sys_close(fd).unwrap();
}

#[test]
fn rename_of_a_directory_carries_its_content() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let fs = mount(&kfs, 1);
    let p = fs.proc();

    p.sys_mkdir("/olddir", 0o755).unwrap();
    let fd = p.sys_open("/olddir/inner", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"inner-data").unwrap();
    p.sys_close(fd).unwrap();
    p.sys_mkdir("/olddir/sub", 0o755).unwrap();
    let fd = p.sys_open("/olddir/sub/deep", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"deep").unwrap();
    p.sys_close(fd).unwrap();

    // Warm the full-path cache for every nested name before the move.
    assert!(p.sys_lstat("/olddir/inner").is_ok());
    assert!(p.sys_lstat("/olddir/sub/deep").is_ok());

    p.sys_rename("/olddir", "/newdir").unwrap();
    assert!(p.sys_lstat("/olddir").is_err());

    // The old paths are gone to their roots: no descendant survives in
    // the cache.
    assert!(p.sys_lstat("/olddir/inner").is_err());
    assert!(p.sys_open("/olddir/inner", RW, 0).is_err());
    assert!(p.sys_lstat("/olddir/sub").is_err());
    assert!(p.sys_lstat("/olddir/sub/deep").is_err());

    let fd = p.sys_open("/newdir/inner", RW, 0).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(p.sys_read(fd, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"inner-data");
    p.sys_close(fd).unwrap();

    let fd = p.sys_open("/newdir/sub/deep", RW, 0).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(p.sys_read(fd, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"deep");
    p.sys_close(fd).unwrap();
}

/// A client dies after journaling and tombstoning but before commit: the
/// replay at the next mount puts the pre-image back.
#[test]
fn uncommitted_tombstone_is_rolled_back() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let fs = mount(&kfs, 1);
    let p = fs.proc();

    let fd = p.sys_open("/victim", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"survives").unwrap();
    let ino = p.sys_fstat(fd).unwrap().ino;
    p.sys_close(fd).unwrap();

    // The entry's location in PM.
    let (map_ino, de) = fs.dir_map.lookup(b"/victim").expect("warm entry");
    assert_eq!(map_ino as u32, ino);
    let de = PmOffset(de);

    // Open a transaction over the ino word, apply the tombstone, and die
    // without committing.
    let cpu = fs.journal_cpu();
    {
        let _g = fs.journal.lock(cpu);
        let _tail = fs
            .journal
            .create_transaction(cpu, &[PmOffset(de.0 + 4)])
            .unwrap();
        tombstone_entry(&fs, de);
        // No commit: the client is gone.
    }

    // The on-media entry is dead right now.
    let arena = fs.arena().clone();
    // SAFETY: reading a directory entry this test just located.
    let dead = unsafe { (*arena.at::<DirEntryHead>(de)).ino_num };
    assert_eq!(dead, 1);

    // Recovery replays the pre-image.
    fs.journal.recover();
    // SAFETY: as above.
    let live = unsafe { (*arena.at::<DirEntryHead>(de)).ino_num };
    assert_eq!(live, ino);

    // A fresh client sees the file alive with its content.
    fs.unmount();
    let fs2 = mount(&kfs, 2);
    let p2 = fs2.proc();
    let fd = p2.sys_open("/victim", RW, 0).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(p2.sys_read(fd, &mut buf).unwrap(), 8);
    assert_eq!(&buf, b"survives");
    p2.sys_close(fd).unwrap();
}

/// After a committed rename the old name is tombstoned on media and the
/// new name resolves to the same inode.
#[test]
fn committed_rename_tombstones_the_old_entry() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let fs = mount(&kfs, 1);
    let p = fs.proc();

    let fd = p.sys_open("/from", CR | RW, 0o644).unwrap();
    p.sys_write(fd, b"x").unwrap();
    let ino = p.sys_fstat(fd).unwrap().ino;
    p.sys_close(fd).unwrap();

    let (_, old_de) = fs.dir_map.lookup(b"/from").unwrap();
    p.sys_rename("/from", "/to").unwrap();

    let arena = fs.arena().clone();
    // SAFETY: the old entry's storage is still a valid record.
    let head = unsafe { &*arena.at::<DirEntryHead>(PmOffset(old_de)) };
    assert_eq!(head.ino_num, 1);

    let (new_ino, _) = fs.dir_map.lookup(b"/to").unwrap();
    assert_eq!(new_ino as u32, ino);
}
