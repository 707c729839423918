//! Allocator behavior through the command surface.

mod common;

use std::collections::HashSet;

use common::{cred, mount, small_cfg};
use pmufs::kfs::Kfs;

#[test]
fn block_alloc_free_restores_the_list() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let _fs = mount(&kfs, 1);
    let c = cred(1);

    let before = kfs.free_blocks_on(2, 0);
    let (block, num) = kfs.alloc_blocks(&c, 64, 2, 0).unwrap();
    assert_eq!(num, 64);
    assert_eq!(kfs.free_blocks_on(2, 0), before - 64);

    kfs.free_blocks(&c, block, num).unwrap();
    assert_eq!(kfs.free_blocks_on(2, 0), before);
}

#[test]
fn allocated_ranges_never_overlap() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let _fs = mount(&kfs, 1);
    let c = cred(1);

    let mut seen: HashSet<u64> = HashSet::new();
    let mut ranges = Vec::new();
    for i in 0..32u64 {
        let (block, num) = kfs.alloc_blocks(&c, 8 + (i % 5), i as usize % 8, 0).unwrap();
        for b in block..block + num {
            assert!(seen.insert(b), "block {} allocated twice", b);
        }
        ranges.push((block, num));
    }
    for (block, num) in ranges {
        kfs.free_blocks(&c, block, num).unwrap();
    }
}

#[test]
fn exhausted_list_borrows_from_candidates() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let _fs = mount(&kfs, 1);
    let c = cred(1);

    // Drain cpu 5's list completely, then keep asking on cpu 5.
    let whole = kfs.free_blocks_on(5, 0);
    let (first, _) = kfs.alloc_blocks(&c, whole, 5, 0).unwrap();
    assert_eq!(kfs.free_blocks_on(5, 0), 0);

    let (second, num) = kfs.alloc_blocks(&c, 128, 5, 0).unwrap();
    assert_eq!(num, 128);
    let (owner, _) = kfs.block_to_cpu_node(second);
    assert_ne!(owner, 5);

    kfs.free_blocks(&c, first, whole).unwrap();
    kfs.free_blocks(&c, second, num).unwrap();
}

#[test]
fn inode_ranges_partition_by_cpu() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let _fs = mount(&kfs, 1);

    let mut seen: HashSet<u32> = HashSet::new();
    for cpu in 0..8 {
        let (start, num) = kfs.alloc_inodes(16, cpu).unwrap();
        assert_eq!(num, 16);
        for ino in start..start + num {
            assert!(seen.insert(ino), "inode {} allocated twice", ino);
        }
        kfs.free_inodes(start, num).unwrap();
    }
}

#[test]
fn freed_blocks_zeroed_on_next_allocation() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let _fs = mount(&kfs, 1);
    let c = cred(1);

    let (block, num) = kfs.alloc_blocks(&c, 4, 0, 0).unwrap();
    // Dirty the pages, give them back, take them again.
    let arena = kfs.arena().clone();
    for b in block..block + num {
        // SAFETY: this range was just allocated to us.
        unsafe {
            *arena.at::<u64>(pmufs::pm::PmOffset::from_block(b)) = 0xdeadbeef;
        }
    }
    kfs.free_blocks(&c, block, num).unwrap();

    let (again, num2) = kfs.alloc_blocks(&c, 4, 0, 0).unwrap();
    for b in again..again + num2 {
        // SAFETY: as above.
        let v = unsafe { *arena.at::<u64>(pmufs::pm::PmOffset::from_block(b)) };
        assert_eq!(v, 0, "block {} not zeroed on allocation", b);
    }
    kfs.free_blocks(&c, again, num2).unwrap();
}

#[test]
fn client_unmount_returns_unused_chunks() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let baseline = kfs.count_free_blocks();

    let fs = mount(&kfs, 7);
    let p = fs.proc();
    let fd = p
        .sys_open("/keep", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    p.sys_write(fd, &vec![1u8; 3 * 1024 * 1024]).unwrap();
    p.sys_close(fd).unwrap();

    // The client holds refilled chunks beyond the file's needs.
    assert!(kfs.count_free_blocks() < baseline);
    fs.unmount();

    // After unmount, what stays out is the live file (2 extents + index
    // page), the root directory's entry block, and the journal area.
    let kept = baseline - kfs.count_free_blocks();
    let file_pages = 2 * 512 + 1;
    let root_dir_pages = 512;
    assert!(kept >= file_pages);
    assert!(
        kept <= file_pages + root_dir_pages + 32,
        "unmount kept {} pages beyond the live data",
        kept
    );
}
