//! Bulk I/O through the agents.

mod common;

use common::{client_opts, cred, small_cfg};
use pmufs::kfs::{Kfs, KfsConfig};
use pmufs::libfs::LibFs;

/// Two delegation threads on the socket, 64-KiB thresholds.
fn delegation_cfg() -> KfsConfig {
    KfsConfig {
        dele_threads_per_socket: 2,
        write_delegation_limit: 64 * 1024,
        read_delegation_limit: 64 * 1024,
        ..small_cfg()
    }
}

#[test]
fn two_mib_write_is_delegated_and_reads_back() {
    let kfs = Kfs::new(delegation_cfg()).unwrap();
    let fs = LibFs::mount_with(&kfs, cred(1), client_opts()).unwrap();
    let p = fs.proc();
    assert!(fs.delegation());

    let fd = p
        .sys_open("/bulk", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let data: Vec<u8> = (0..2 * 1024 * 1024usize).map(|i| (i * 7 % 251) as u8).collect();
    assert_eq!(p.sys_pwrite(fd, &data, 0).unwrap(), data.len());
    assert_eq!(p.sys_fstat(fd).unwrap().size, data.len() as u64);

    let mut back = vec![0u8; data.len()];
    assert_eq!(p.sys_pread(fd, &mut back, 0).unwrap(), data.len());
    assert_eq!(back, data);
    p.sys_close(fd).unwrap();
}

#[test]
fn small_and_bulk_writes_interleave() {
    let kfs = Kfs::new(delegation_cfg()).unwrap();
    let fs = LibFs::mount_with(&kfs, cred(1), client_opts()).unwrap();
    let p = fs.proc();

    let fd = p
        .sys_open("/mix", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();

    // Below the threshold: the inline path.
    let small = vec![0x11u8; 4096];
    assert_eq!(p.sys_pwrite(fd, &small, 0).unwrap(), small.len());

    // Above it: the delegated path, overlapping the same extent.
    let bulk = vec![0x22u8; 512 * 1024];
    assert_eq!(p.sys_pwrite(fd, &bulk, 4096).unwrap(), bulk.len());

    let mut back = vec![0u8; 4096 + 512 * 1024];
    assert_eq!(p.sys_pread(fd, &mut back, 0).unwrap(), back.len());
    assert!(back[..4096].iter().all(|b| *b == 0x11));
    assert!(back[4096..].iter().all(|b| *b == 0x22));
    p.sys_close(fd).unwrap();
}

#[test]
fn bulk_zeroing_goes_through_clear_requests() {
    let kfs = Kfs::new(delegation_cfg()).unwrap();
    let _fs = LibFs::mount_with(&kfs, cred(1), client_opts()).unwrap();
    let c = cred(1);

    // 512 pages is 2 MiB: over the threshold, so the supervisor clears
    // through an agent rather than inline.
    let (block, num) = kfs.alloc_blocks(&c, 512, 0, 0).unwrap();
    assert_eq!(num, 512);
    let arena = kfs.arena().clone();
    for b in (block..block + num).step_by(64) {
        // SAFETY: the range was just allocated to this caller.
        let v = unsafe { *arena.at::<u64>(pmufs::pm::PmOffset::from_block(b)) };
        assert_eq!(v, 0);
    }
    kfs.free_blocks(&c, block, num).unwrap();
}

#[test]
fn concurrent_bulk_writers_share_the_rings() {
    let kfs = Kfs::new(delegation_cfg()).unwrap();
    let fs = LibFs::mount_with(&kfs, cred(1), client_opts()).unwrap();

    let mut joins = Vec::new();
    for t in 0..4u8 {
        let fs = fs.clone();
        joins.push(std::thread::spawn(move || {
            let p = fs.proc();
            let path = format!("/w{}", t);
            let fd = p
                .sys_open(&path, libc::O_CREAT | libc::O_RDWR, 0o644)
                .unwrap();
            let data = vec![t ^ 0x5a; 1024 * 1024];
            assert_eq!(p.sys_pwrite(fd, &data, 0).unwrap(), data.len());
            let mut back = vec![0u8; data.len()];
            assert_eq!(p.sys_pread(fd, &mut back, 0).unwrap(), data.len());
            assert_eq!(back, data);
            p.sys_close(fd).unwrap();
        }));
    }
    for j in joins {
        j.join().unwrap();
    }
}
