//! Supervisor inode pools: the inode number space is carved into disjoint
//! contiguous per-CPU slices, managed with the same interval trees and the
//! same candidate-retry policy as the block pools.

use spin::Mutex;

use crate::error::{Error, Result};
use crate::kfs::balloc::{alloc_in_list, free_into_list, not_enough, FreeInner};
use crate::params::{FIRST_CLIENT_INO, MAX_INODE_NUM};
use crate::range_tree::RangeTree;

pub struct InodeAlloc {
    lists: Vec<Mutex<FreeInner>>,
    cpus: usize,
    per_list: u32,
}

impl InodeAlloc {
    pub fn new(cpus: usize) -> InodeAlloc {
        let per_list = (MAX_INODE_NUM / cpus) as u32;
        let lists: Vec<Mutex<FreeInner>> = (0..cpus)
            .map(|cpu| {
                let start = if cpu == 0 {
                    FIRST_CLIENT_INO
                } else {
                    per_list * cpu as u32
                };
                let end = if cpu == cpus - 1 {
                    MAX_INODE_NUM as u32 - 1
                } else {
                    per_list * cpu as u32 + per_list - 1
                };
                let mut tree = RangeTree::new();
                tree.insert(start as u64, end as u64)
                    .expect("fresh list is empty");
                Mutex::new(FreeInner {
                    tree,
                    block_start: start as u64,
                    block_end: end as u64,
                    num_free: (end - start + 1) as u64,
                })
            })
            .collect();
        InodeAlloc {
            lists,
            cpus,
            per_list,
        }
    }

    pub fn ino_to_cpu(&self, ino: u32) -> usize {
        core::cmp::min((ino / self.per_list) as usize, self.cpus - 1)
    }

    fn candidate_cpu(&self) -> usize {
        let mut best = 0;
        let mut best_free = 0;
        for (cpu, list) in self.lists.iter().enumerate() {
            let free = list.lock().num_free;
            if free > best_free {
                best = cpu;
                best_free = free;
            }
        }
        best
    }

    /// Allocate a run of `num` inode numbers near `cpu`.
    pub fn alloc(&self, num: u32, mut cpu: usize) -> Result<(u32, u32)> {
        if num == 0 {
            return Err(Error::InvalidArgument);
        }
        cpu %= self.cpus;
        let mut retried = 0;
        loop {
            let mut inner = self.lists[cpu].lock();
            if not_enough(&inner, num as u64) && retried < 2 {
                drop(inner);
                cpu = self.candidate_cpu();
                retried += 1;
                continue;
            }
            let start = alloc_in_list(&mut inner, num as u64)?;
            return Ok((start as u32, num));
        }
    }

    /// Return `[ino, ino + num)`; the run must lie inside one CPU's slice.
    pub fn free(&self, ino: u32, num: u32) -> Result<()> {
        if num == 0 || ino < FIRST_CLIENT_INO {
            return Err(Error::InvalidArgument);
        }
        let cpu = self.ino_to_cpu(ino);
        let mut inner = self.lists[cpu].lock();
        free_into_list(&mut inner, ino as u64, (ino + num - 1) as u64)
    }

    pub fn free_inodes_on(&self, cpu: usize) -> u64 {
        self.lists[cpu % self.cpus].lock().num_free
    }

    pub fn count_free(&self) -> u64 {
        self.lists.iter().map(|l| l.lock().num_free).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_disjoint_and_cover_the_space() {
        let a = InodeAlloc::new(8);
        let total: u64 = a.count_free();
        assert_eq!(total, (MAX_INODE_NUM as u64) - FIRST_CLIENT_INO as u64);
        assert_eq!(a.ino_to_cpu(FIRST_CLIENT_INO), 0);
        assert_eq!(a.ino_to_cpu(MAX_INODE_NUM as u32 - 1), 7);
    }

    #[test]
    fn alloc_free_roundtrip() {
        let a = InodeAlloc::new(4);
        let (start, num) = a.alloc(64, 2).unwrap();
        assert_eq!(num, 64);
        assert_eq!(a.ino_to_cpu(start), 2);
        a.free(start, num).unwrap();
        assert_eq!(a.free_inodes_on(2), (MAX_INODE_NUM / 4) as u64);
    }

    #[test]
    fn reserved_numbers_never_allocated() {
        let a = InodeAlloc::new(1);
        let (start, _) = a.alloc(16, 0).unwrap();
        assert!(start >= FIRST_CLIENT_INO);
        assert!(a.free(0, 1).is_err());
    }
}
