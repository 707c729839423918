//! Trust groups: sets of cooperating processes that share leases and one
//! mount window. The pid map is a dense array; group ids fit in a byte and
//! id 0 means "no trust group".

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use spin::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::kfs::ioctl::Cred;
use crate::kfs::vma::MountVma;
use crate::params::{MAX_INODE_NUM, MAX_PROCESS, MAX_PROCESS_PER_TGROUP, MAX_TGROUP};

/// One page-sized bitmap indexed by inode number. Backs both the lease
/// ring (owner is inside a critical section) and the map ring (inode is
/// mapped in the group's window).
pub struct BitmapPage {
    words: Box<[AtomicU64]>,
}

impl BitmapPage {
    pub fn new() -> BitmapPage {
        let words = (0..MAX_INODE_NUM / 64)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BitmapPage { words }
    }

    #[inline]
    pub fn set(&self, ino: u32) {
        let _ = self.words[ino as usize / 64].fetch_or(1 << (ino % 64), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self, ino: u32) {
        let _ = self.words[ino as usize / 64].fetch_and(!(1 << (ino % 64)), Ordering::AcqRel);
    }

    #[inline]
    pub fn test(&self, ino: u32) -> bool {
        self.words[ino as usize / 64].load(Ordering::Acquire) & (1 << (ino % 64)) != 0
    }
}

impl Default for BitmapPage {
    fn default() -> BitmapPage {
        BitmapPage::new()
    }
}

pub struct TgroupSlot {
    pub used: bool,
    /// Member pids; removed entries are zeroed in place and compacted only
    /// when the array fills.
    pids: ArrayVec<u32, MAX_PROCESS_PER_TGROUP>,
    pub lease_ring: Arc<BitmapPage>,
    pub map_ring: Arc<BitmapPage>,
    pub vma: Option<Arc<MountVma>>,
}

impl TgroupSlot {
    fn empty() -> TgroupSlot {
        TgroupSlot {
            used: false,
            pids: ArrayVec::new(),
            lease_ring: Arc::new(BitmapPage::new()),
            map_ring: Arc::new(BitmapPage::new()),
            vma: None,
        }
    }

    fn reset(&mut self) {
        self.used = false;
        self.pids.clear();
        self.lease_ring = Arc::new(BitmapPage::new());
        self.map_ring = Arc::new(BitmapPage::new());
        self.vma = None;
    }

    fn gc(&mut self) {
        self.pids.retain(|p| *p != 0);
    }

    pub fn member_count(&self) -> usize {
        self.pids.iter().filter(|p| **p != 0).count()
    }
}

pub struct TgroupTable {
    /// Serializes slot allocation and pid-map writes.
    lock: Mutex<()>,
    groups: Vec<RwLock<TgroupSlot>>,
    pid_map: Vec<AtomicU8>,
}

impl TgroupTable {
    pub fn new() -> TgroupTable {
        let groups = (0..MAX_TGROUP + 1)
            .map(|_| RwLock::new(TgroupSlot::empty()))
            .collect();
        let pid_map = (0..MAX_PROCESS).map(|_| AtomicU8::new(0)).collect();
        TgroupTable {
            lock: Mutex::new(()),
            groups,
            pid_map,
        }
    }

    fn can_modify(cred: &Cred) -> bool {
        cred.uid == 0
    }

    /// Allocate a slot; called with the table lock held. A nonzero `pid`
    /// seeds the group with that member.
    fn alloc_locked(&self, pid: u32) -> Result<u8> {
        for id in 1..=MAX_TGROUP {
            let mut g = self.groups[id].write();
            if g.used {
                continue;
            }
            g.reset();
            g.used = true;
            if pid != 0 {
                g.pids.push(pid);
                self.pid_map[pid as usize].store(id as u8, Ordering::Release);
            }
            return Ok(id as u8);
        }
        log::warn!("trust group table exhausted");
        Err(Error::NoSpace)
    }

    /// Allocate an empty group for later membership changes; root only.
    pub fn alloc_tgroup(&self, cred: &Cred) -> Result<u8> {
        if !TgroupTable::can_modify(cred) {
            return Err(Error::Permission);
        }
        let _g = self.lock.lock();
        self.alloc_locked(0)
    }

    pub fn free_tgroup(&self, tgid: u8, cred: &Cred) -> Result<()> {
        if !TgroupTable::can_modify(cred) {
            return Err(Error::Permission);
        }
        let _g = self.lock.lock();
        self.free_locked(tgid)
    }

    fn free_locked(&self, tgid: u8) -> Result<()> {
        let mut g = self.groups[tgid as usize].write();
        if !g.used {
            return Err(Error::InvalidArgument);
        }
        for pid in g.pids.iter() {
            if *pid != 0 {
                self.pid_map[*pid as usize].store(0, Ordering::Release);
            }
        }
        g.reset();
        Ok(())
    }

    pub fn add_process(&self, tgid: u8, pid: u32, cred: &Cred) -> Result<()> {
        if !TgroupTable::can_modify(cred) {
            return Err(Error::Permission);
        }
        if pid as usize >= MAX_PROCESS {
            return Err(Error::InvalidArgument);
        }
        let _g = self.lock.lock();
        let mut g = self.groups[tgid as usize].write();
        if !g.used {
            return Err(Error::InvalidArgument);
        }
        if g.pids.is_full() {
            g.gc();
            if g.pids.is_full() {
                log::warn!("trust group {} is at its process limit", tgid);
                return Err(Error::NoSpace);
            }
        }
        g.pids.push(pid);
        self.pid_map[pid as usize].store(tgid, Ordering::Release);
        Ok(())
    }

    pub fn remove_process(&self, tgid: u8, pid: u32, cred: &Cred) -> Result<()> {
        if !TgroupTable::can_modify(cred) {
            return Err(Error::Permission);
        }
        let _g = self.lock.lock();
        let mut g = self.groups[tgid as usize].write();
        if !g.used {
            return Err(Error::InvalidArgument);
        }
        let idx = match g.pids.iter().position(|p| *p == pid) {
            Some(i) => i,
            None => {
                log::warn!("pid {} not found in tgroup {}", pid, tgid);
                return Err(Error::InvalidArgument);
            }
        };
        if idx == g.pids.len() - 1 {
            let _ = g.pids.pop();
        } else {
            g.pids[idx] = 0;
        }
        self.pid_map[pid as usize].store(0, Ordering::Release);
        Ok(())
    }

    /// The hot lookup. With `alloc`, a first-time pid gets its own
    /// single-member group.
    pub fn pid_to_tgid(&self, pid: u32, alloc: bool) -> Result<u8> {
        if pid as usize >= MAX_PROCESS {
            return Err(Error::InvalidArgument);
        }
        let cur = self.pid_map[pid as usize].load(Ordering::Acquire);
        if cur != 0 {
            return Ok(cur);
        }
        if !alloc {
            return Err(Error::NoDevice);
        }
        let _g = self.lock.lock();
        let cur = self.pid_map[pid as usize].load(Ordering::Acquire);
        if cur != 0 {
            return Ok(cur);
        }
        self.alloc_locked(pid)
    }

    pub fn group(&self, tgid: u8) -> &RwLock<TgroupSlot> {
        &self.groups[tgid as usize]
    }

    /// Lease ring of `tgid`, if the group is live.
    pub fn lease_ring(&self, tgid: u8) -> Option<Arc<BitmapPage>> {
        let g = self.groups[tgid as usize].read();
        if g.used {
            Some(g.lease_ring.clone())
        } else {
            None
        }
    }

    /// Map ring of `tgid`, if the group is live.
    pub fn map_ring(&self, tgid: u8) -> Option<Arc<BitmapPage>> {
        let g = self.groups[tgid as usize].read();
        if g.used {
            Some(g.map_ring.clone())
        } else {
            None
        }
    }

    pub fn vma(&self, tgid: u8) -> Option<Arc<MountVma>> {
        let g = self.groups[tgid as usize].read();
        if g.used {
            g.vma.clone()
        } else {
            None
        }
    }

    pub fn set_vma(&self, tgid: u8, vma: Option<Arc<MountVma>>) -> Result<()> {
        let mut g = self.groups[tgid as usize].write();
        if !g.used {
            return Err(Error::InvalidArgument);
        }
        g.vma = vma;
        Ok(())
    }

    /// Drop `pid` from its group on unmount; frees the group when the last
    /// member leaves.
    pub fn leave(&self, pid: u32) -> Result<()> {
        let _g = self.lock.lock();
        let tgid = self.pid_map[pid as usize].load(Ordering::Acquire);
        if tgid == 0 {
            return Err(Error::NoDevice);
        }
        let empty = {
            let mut g = self.groups[tgid as usize].write();
            if let Some(idx) = g.pids.iter().position(|p| *p == pid) {
                if idx == g.pids.len() - 1 {
                    let _ = g.pids.pop();
                } else {
                    g.pids[idx] = 0;
                }
            }
            self.pid_map[pid as usize].store(0, Ordering::Release);
            g.member_count() == 0
        };
        if empty {
            self.free_locked(tgid)?;
        }
        Ok(())
    }
}

impl Default for TgroupTable {
    fn default() -> TgroupTable {
        TgroupTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Cred {
        Cred {
            pid: 100,
            uid: 0,
            gid: 0,
        }
    }

    #[test]
    fn auto_alloc_is_stable() {
        let t = TgroupTable::new();
        let a = t.pid_to_tgid(41, true).unwrap();
        let b = t.pid_to_tgid(41, true).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, 0);
        let c = t.pid_to_tgid(42, true).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn membership_is_root_only() {
        let t = TgroupTable::new();
        let user = Cred {
            pid: 7,
            uid: 1000,
            gid: 1000,
        };
        assert_eq!(t.alloc_tgroup(&user), Err(Error::Permission));
        let id = t.alloc_tgroup(&root()).unwrap();
        assert_eq!(t.add_process(id, 9, &user), Err(Error::Permission));
        t.add_process(id, 9, &root()).unwrap();
        assert_eq!(t.pid_to_tgid(9, false).unwrap(), id);
        t.remove_process(id, 9, &root()).unwrap();
        assert!(t.pid_to_tgid(9, false).is_err());
    }

    #[test]
    fn leave_frees_empty_group() {
        let t = TgroupTable::new();
        let id = t.pid_to_tgid(55, true).unwrap();
        t.leave(55).unwrap();
        assert!(!t.group(id).read().used);
    }

    #[test]
    fn bitmap_page_ops() {
        let b = BitmapPage::new();
        assert!(!b.test(100));
        b.set(100);
        assert!(b.test(100));
        b.clear(100);
        assert!(!b.test(100));
    }
}
