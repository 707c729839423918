//! Lease acquisition, sharing, release, renewal, and expiry hand-off
//! across trust groups.

mod common;

use common::{client_opts, cred, mount, small_cfg};
use pmufs::kfs::{Kfs, LeaseState};
use pmufs::libfs::LibFs;

/// Create `/f` from one client and unmount it, committing the shadow
/// state; returns the inode number.
fn seed_file(kfs: &std::sync::Arc<Kfs>, pid: u32, path: &str, data: &[u8]) -> u32 {
    let fs = mount(kfs, pid);
    let p = fs.proc();
    let fd = p
        .sys_open(path, libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    p.sys_write(fd, data).unwrap();
    let ino = p.sys_fstat(fd).unwrap().ino;
    p.sys_close(fd).unwrap();
    fs.unmount();
    ino
}

#[test]
fn write_acquire_then_release_returns_to_unowned() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let ino = seed_file(&kfs, 1, "/f", b"data");

    let fs_b = mount(&kfs, 2);
    let c = cred(2);
    kfs.map_file(&c, ino, true).unwrap();
    assert_eq!(kfs.lease_state(ino), LeaseState::WriteOwned);
    assert_eq!(kfs.lease_owners(ino), vec![fs_b.tgid()]);
    assert!(kfs.map_ring_test(fs_b.tgid(), ino));

    kfs.unmap_file(&c, ino).unwrap();
    assert_eq!(kfs.lease_state(ino), LeaseState::Unowned);
    assert!(!kfs.map_ring_test(fs_b.tgid(), ino));
}

#[test]
fn writer_has_exactly_one_owner() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let ino = seed_file(&kfs, 1, "/w", b"w");

    let _fs_b = mount(&kfs, 2);
    kfs.map_file(&cred(2), ino, true).unwrap();
    assert_eq!(kfs.lease_owners(ino).len(), 1);

    // A second group bounces off the live writer.
    let _fs_c = mount(&kfs, 3);
    assert!(kfs.map_file(&cred(3), ino, true).is_err());
    assert!(kfs.map_file(&cred(3), ino, false).is_err());
}

#[test]
fn readers_share_until_capacity() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let ino = seed_file(&kfs, 1, "/r", b"r");

    let mut clients = Vec::new();
    for pid in 10..26 {
        let fs = mount(&kfs, pid);
        kfs.map_file(&cred(pid), ino, false).unwrap();
        clients.push(fs);
    }
    assert_eq!(kfs.lease_state(ino), LeaseState::ReadOwned);
    assert_eq!(kfs.lease_owners(ino).len(), 16);

    // One more reader is over capacity.
    let _extra = mount(&kfs, 99);
    assert_eq!(
        kfs.map_file(&cred(99), ino, false),
        Err(pmufs::Error::NoSpace)
    );

    // Every mapped reader satisfies the map-ring implication.
    for fs in &clients {
        assert!(kfs.map_ring_test(fs.tgid(), ino));
        assert!(kfs.lease_owners(ino).contains(&fs.tgid()));
    }

    // Drain readers; the last release drops the lease to Unowned.
    for (i, fs) in clients.iter().enumerate() {
        kfs.unmap_file(&cred(10 + i as u32), ino).unwrap();
    }
    assert_eq!(kfs.lease_state(ino), LeaseState::Unowned);
}

#[test]
fn renew_is_owner_only() {
    let kfs = Kfs::new(small_cfg()).unwrap();
    let ino = seed_file(&kfs, 1, "/n", b"n");

    let _fs_b = mount(&kfs, 2);
    kfs.map_file(&cred(2), ino, true).unwrap();
    kfs.renew_lease(&cred(2), ino).unwrap();

    let _fs_c = mount(&kfs, 3);
    assert!(kfs.renew_lease(&cred(3), ino).is_err());
}

#[test]
fn expiry_hand_off_between_groups() {
    let mut cfg = small_cfg();
    // A short lease so a stalled owner expires quickly.
    cfg.lease_period = 50_000_000;
    let kfs = Kfs::new(cfg).unwrap();
    let _ino = seed_file(&kfs, 1, "/b", b"hello");

    // Group A opens the file read-write and then goes quiet: the fd close
    // clears its critical-section bit while the lease stays held.
    let fs_a = LibFs::mount_with(&kfs, cred(2), client_opts()).unwrap();
    let pa = fs_a.proc();
    let fd = pa.sys_open("/b", libc::O_RDWR, 0).unwrap();
    let ino = pa.sys_fstat(fd).unwrap().ino;
    pa.sys_close(fd).unwrap();
    let tg_a = fs_a.tgid();
    assert_eq!(kfs.lease_owners(ino), vec![tg_a]);
    assert!(kfs.map_ring_test(tg_a, ino));

    std::thread::sleep(std::time::Duration::from_millis(500));

    // Group B takes the file over; A's mapping marks are scrubbed.
    let fs_b = LibFs::mount_with(&kfs, cred(3), client_opts()).unwrap();
    let pb = fs_b.proc();
    let fd = pb.sys_open("/b", libc::O_RDWR, 0).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(pb.sys_read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    pb.sys_close(fd).unwrap();

    assert_eq!(kfs.lease_owners(ino), vec![fs_b.tgid()]);
    assert!(!kfs.map_ring_test(tg_a, ino));
    assert!(kfs.map_ring_test(fs_b.tgid(), ino));
}

#[test]
fn live_critical_section_blocks_takeover() {
    let mut cfg = small_cfg();
    cfg.lease_period = 50_000_000;
    let kfs = Kfs::new(cfg).unwrap();
    let ino = seed_file(&kfs, 1, "/cs", b"cs");

    // A holds the lease and stays inside its critical section.
    let fs_a = LibFs::mount_with(&kfs, cred(2), client_opts()).unwrap();
    let pa = fs_a.proc();
    let _fd = pa.sys_open("/cs", libc::O_RDWR, 0).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(300));

    // The stamp is stale but the bit is set: no takeover.
    let _fs_b = mount(&kfs, 3);
    assert_eq!(kfs.map_file(&cred(3), ino, true), Err(pmufs::Error::Again));
}
