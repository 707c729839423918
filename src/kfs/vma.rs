//! The per-group mount window.
//!
//! At mount the supervisor reserves one large window covering the PM
//! devices in the client's address space; it never demand-pages. Mapping a
//! file installs its page frames at window addresses derived from their PM
//! offsets, so install/zap bookkeeping is keyed by window address. A fault
//! on a non-installed page is fatal to the offending process; the access
//! helpers assert that in debug builds.

use std::collections::BTreeMap;

use spin::Mutex;

use crate::params::{MOUNT_ADDR, PAGE_SHIFT, PAGE_SIZE};
use crate::pm::PmOffset;

bitflags::bitflags! {
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const SHARED = 4;
    }
}

/// Window address of the page at PM offset `off`.
#[inline]
pub fn mount_vaddr(off: PmOffset) -> u64 {
    MOUNT_ADDR + off.0
}

pub struct MountVma {
    /// vaddr -> (page count, protection); ranges never overlap.
    installed: Mutex<BTreeMap<u64, (u64, Prot)>>,
}

impl MountVma {
    pub fn new() -> MountVma {
        MountVma {
            installed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Install `count` frames starting at `vaddr` with `prot`, replacing
    /// anything previously installed there.
    pub fn install(&self, vaddr: u64, pfn: u64, prot: Prot, count: u64) {
        debug_assert_eq!(vaddr % PAGE_SIZE as u64, 0);
        debug_assert_eq!(vaddr, mount_vaddr(PmOffset::from_block(pfn)));
        let mut map = self.installed.lock();
        Self::remove_range(&mut map, vaddr, count << PAGE_SHIFT);
        let _ = map.insert(vaddr, (count, prot));
    }

    /// Remove installed frames intersecting `[vaddr, vaddr + bytes)`.
    pub fn zap(&self, vaddr: u64, bytes: u64) {
        let mut map = self.installed.lock();
        Self::remove_range(&mut map, vaddr, bytes);
    }

    fn remove_range(map: &mut BTreeMap<u64, (u64, Prot)>, vaddr: u64, bytes: u64) {
        let end = vaddr + bytes;
        // A range starting below vaddr may reach into the zapped region.
        let mut doomed = Vec::new();
        let mut splits = Vec::new();
        for (start, (count, prot)) in map.range(..end) {
            let rstart = *start;
            let rend = rstart + (*count << PAGE_SHIFT);
            if rend <= vaddr {
                continue;
            }
            doomed.push(rstart);
            if rstart < vaddr {
                splits.push((rstart, ((vaddr - rstart) >> PAGE_SHIFT, *prot)));
            }
            if rend > end {
                splits.push((end, ((rend - end) >> PAGE_SHIFT, *prot)));
            }
        }
        for k in doomed {
            let _ = map.remove(&k);
        }
        for (k, v) in splits {
            let _ = map.insert(k, v);
        }
    }

    /// Is the whole of `[vaddr, vaddr + bytes)` installed?
    pub fn covered(&self, vaddr: u64, bytes: u64) -> bool {
        let map = self.installed.lock();
        let mut pos = vaddr;
        let end = vaddr + bytes;
        while pos < end {
            let found = map.range(..=pos).next_back().and_then(|(s, (c, _))| {
                let rend = *s + (*c << PAGE_SHIFT);
                if pos < rend {
                    Some(rend)
                } else {
                    None
                }
            });
            match found {
                Some(rend) => pos = rend,
                None => return false,
            }
        }
        true
    }

    /// Protection of the page containing `vaddr`, if installed.
    pub fn prot_of(&self, vaddr: u64) -> Option<Prot> {
        let map = self.installed.lock();
        map.range(..=vaddr).next_back().and_then(|(s, (c, p))| {
            if vaddr < *s + (*c << PAGE_SHIFT) {
                Some(*p)
            } else {
                None
            }
        })
    }

    /// Tear the window down (unmount).
    pub fn clear(&self) {
        self.installed.lock().clear();
    }

    /// Installed page count; diagnostics only.
    pub fn installed_pages(&self) -> u64 {
        self.installed.lock().values().map(|(c, _)| *c).sum()
    }
}

impl Default for MountVma {
    fn default() -> MountVma {
        MountVma::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: Prot = Prot::from_bits_truncate(Prot::READ.bits() | Prot::WRITE.bits());

    #[test]
    fn install_zap_roundtrip() {
        let vma = MountVma::new();
        let base = mount_vaddr(PmOffset::from_block(16));
        vma.install(base, 16, RW, 8);
        assert!(vma.covered(base, 8 * PAGE_SIZE as u64));
        assert_eq!(vma.prot_of(base + PAGE_SIZE as u64), Some(RW));

        // Punch out the middle two pages.
        vma.zap(base + 2 * PAGE_SIZE as u64, 2 * PAGE_SIZE as u64);
        assert!(vma.covered(base, 2 * PAGE_SIZE as u64));
        assert!(!vma.covered(base, 8 * PAGE_SIZE as u64));
        assert!(vma.covered(base + 4 * PAGE_SIZE as u64, 4 * PAGE_SIZE as u64));
        assert_eq!(vma.prot_of(base + 3 * PAGE_SIZE as u64), None);
    }

    #[test]
    fn reinstall_changes_protection() {
        let vma = MountVma::new();
        let base = mount_vaddr(PmOffset::from_block(4));
        vma.install(base, 4, Prot::READ | Prot::SHARED, 4);
        vma.install(base, 4, RW, 4);
        assert_eq!(vma.prot_of(base), Some(RW));
        assert_eq!(vma.installed_pages(), 4);
    }
}
