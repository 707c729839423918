//! Client-side inode numbers: per-CPU chunk lists refilled from the
//! supervisor, a free-number stack for fast pop, and an allocation bitmap
//! consulted by the unmount sweep and the mapped-file checks.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{Error, Result};
use crate::libfs::cmd::Dev;
use crate::params::{INODE_CHUNK, MAX_INODE_NUM};
use crate::pmem;

struct InodeList {
    /// Each supervisor allocation batch, for the unmount return walk.
    chunks: Vec<(u32, u32)>,
    /// Individual free numbers, popped on create.
    free: Vec<u32>,
}

pub struct ClientInodeAlloc {
    lists: Vec<Mutex<InodeList>>,
    alloc_map: Vec<AtomicU64>,
    cpus: usize,
}

impl ClientInodeAlloc {
    pub fn new(cpus: usize) -> ClientInodeAlloc {
        let lists = (0..cpus)
            .map(|_| {
                Mutex::new(InodeList {
                    chunks: Vec::new(),
                    free: Vec::new(),
                })
            })
            .collect();
        let alloc_map = (0..(MAX_INODE_NUM + 63) / 64)
            .map(|_| AtomicU64::new(0))
            .collect();
        ClientInodeAlloc {
            lists,
            alloc_map,
            cpus,
        }
    }

    pub fn set_allocated(&self, ino: u32) {
        let _ = self.alloc_map[ino as usize / 64].fetch_or(1 << (ino % 64), Ordering::AcqRel);
    }

    pub fn clear_allocated(&self, ino: u32) {
        let _ = self.alloc_map[ino as usize / 64].fetch_and(!(1 << (ino % 64)), Ordering::AcqRel);
    }

    pub fn is_allocated(&self, ino: u32) -> bool {
        self.alloc_map[ino as usize / 64].load(Ordering::Acquire) & (1 << (ino % 64)) != 0
    }

    fn refill(&self, dev: &Dev, list: &mut InodeList, cpu: usize) {
        match dev.alloc_inodes(INODE_CHUNK as u32, cpu as i32) {
            Ok((start, num)) => {
                list.chunks.push((start, num));
                for ino in (start..start + num).rev() {
                    list.free.push(ino);
                }
            }
            Err(e) => log::warn!("inode refill on cpu {} failed: {}", cpu, e),
        }
    }

    pub fn new_inode(&self, dev: &Dev, cpu: usize) -> Result<u32> {
        let cpu = cpu % self.cpus;
        let mut list = self.lists[cpu].lock();
        if list.free.is_empty() {
            self.refill(dev, &mut list, cpu);
            if list.free.is_empty() {
                return Err(Error::NoSpace);
            }
        }
        let ino = list.free.pop().expect("checked non-empty");
        drop(list);
        self.set_allocated(ino);
        Ok(ino)
    }

    /// Freed numbers land on a random CPU's stack.
    pub fn free_inode(&self, ino: u32) {
        let cpu = pmem::xor_random() as usize % self.cpus;
        self.lists[cpu].lock().free.push(ino);
        self.clear_allocated(ino);
    }

    /// Unmount: return every number we still hold. Within each batch the
    /// still-allocated numbers (live files) are skipped, and the gaps go
    /// back range by range.
    pub fn return_all(&self, dev: &Dev) {
        for list in self.lists.iter() {
            let mut list = list.lock();
            list.free.clear();
            for (start, num) in list.chunks.drain(..) {
                let end = start + num;
                let mut i = start;
                while i < end {
                    while i < end && self.is_allocated(i) {
                        i += 1;
                    }
                    let run_start = i;
                    while i < end && !self.is_allocated(i) {
                        i += 1;
                    }
                    if i > run_start {
                        if let Err(e) = dev.free_inodes(run_start, i - run_start) {
                            log::warn!(
                                "returning inodes [{}, {}) failed: {}",
                                run_start,
                                i,
                                e
                            );
                        }
                    }
                }
            }
        }
    }
}
