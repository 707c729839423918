//! Client-side block pools: per-CPU mirrors fed by supervisor chunks.
//!
//! A per-block ownership bitmap records which blocks this client received
//! from the supervisor; only owned blocks may be freed locally (a truncate
//! of blocks some other group allocated leaves them for their owner).

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::kfs::balloc::{alloc_in_list, free_into_list, FreeInner};
use crate::libfs::cmd::Dev;
use crate::params::PAGE_SIZE;
use crate::pm::{PmArena, PmNodeInfo, PmOffset};
use crate::pmem;
use crate::range_tree::RangeTree;

pub struct ClientBlockAlloc {
    arena: Arc<PmArena>,
    lists: Vec<Mutex<FreeInner>>,
    owned: Vec<AtomicU64>,
    nodes: Vec<PmNodeInfo>,
    cpus: usize,
    pm_nodes: usize,
    refill_pages: u64,
}

impl ClientBlockAlloc {
    pub fn new(
        arena: Arc<PmArena>,
        nodes: Vec<PmNodeInfo>,
        cpus: usize,
        refill_pages: u64,
    ) -> ClientBlockAlloc {
        let pm_nodes = nodes.len();
        let total_blocks = arena.total_blocks();
        let lists = (0..cpus * pm_nodes)
            .map(|_| {
                Mutex::new(FreeInner {
                    tree: RangeTree::new(),
                    // Chunks arrive from anywhere in the arena.
                    block_start: 0,
                    block_end: u64::MAX,
                    num_free: 0,
                })
            })
            .collect();
        let owned = (0..(total_blocks as usize + 63) / 64)
            .map(|_| AtomicU64::new(0))
            .collect();
        ClientBlockAlloc {
            arena,
            lists,
            owned,
            nodes,
            cpus,
            pm_nodes,
            refill_pages,
        }
    }

    fn list(&self, cpu: usize, pm_node: usize) -> &Mutex<FreeInner> {
        &self.lists[(cpu % self.cpus) * self.pm_nodes + (pm_node % self.pm_nodes)]
    }

    pub fn node_of(&self, block: u64) -> usize {
        for (i, n) in self.nodes.iter().enumerate() {
            if block >= n.start_block && block <= n.end_block {
                return i;
            }
        }
        self.nodes.len() - 1
    }

    fn mark_owned(&self, block: u64, num: u64) {
        for b in block..block + num {
            let _ = self.owned[b as usize / 64].fetch_or(1 << (b % 64), Ordering::AcqRel);
        }
    }

    fn clear_owned(&self, block: u64, num: u64) {
        for b in block..block + num {
            let _ = self.owned[b as usize / 64].fetch_and(!(1 << (b % 64)), Ordering::AcqRel);
        }
    }

    pub fn is_owned(&self, block: u64) -> bool {
        self.owned[block as usize / 64].load(Ordering::Acquire) & (1 << (block % 64)) != 0
    }

    /// Allocate `num` pages from the caller's list, pulling a fresh chunk
    /// from the supervisor on underflow. `zero` scrubs the range (chunks
    /// arrive zeroed, recycled blocks do not).
    pub fn alloc(
        &self,
        dev: &Dev,
        num: u64,
        cpu: usize,
        pm_node: usize,
        zero: bool,
    ) -> Result<u64> {
        let list = self.list(cpu, pm_node);
        let block = {
            let mut inner = list.lock();
            match alloc_in_list(&mut inner, num) {
                Ok(b) => b,
                Err(Error::NoSpace) => {
                    let want = core::cmp::max(num, self.refill_pages);
                    let (chunk, got) = dev.alloc_blocks(want, cpu as i32, pm_node)?;
                    self.mark_owned(chunk, got);
                    free_into_list(&mut inner, chunk, chunk + got - 1)?;
                    alloc_in_list(&mut inner, num)?
                }
                Err(e) => return Err(e),
            }
        };
        if zero {
            // SAFETY: the range was just allocated and is unreferenced.
            unsafe {
                pmem::memset_nt(
                    self.arena.at::<u8>(PmOffset::from_block(block)),
                    (num as usize) * PAGE_SIZE,
                )
            };
            pmem::sfence();
        }
        Ok(block)
    }

    /// Free locally-owned blocks back onto the caller's list.
    pub fn free(&self, block: u64, num: u64, cpu: usize) -> Result<()> {
        debug_assert!(self.is_owned(block));
        let node = self.node_of(block);
        let mut inner = self.list(cpu, node).lock();
        free_into_list(&mut inner, block, block + num - 1)
    }

    /// Hand every free range back to the supervisor (unmount path).
    pub fn return_all(&self, dev: &Dev) {
        for list in self.lists.iter() {
            let ranges: Vec<(u64, u64)> = {
                let inner = list.lock();
                inner.tree.iter().collect()
            };
            let mut inner = list.lock();
            for (low, high) in ranges {
                let _ = inner.tree.remove(low);
                inner.num_free = inner.num_free.saturating_sub(high - low + 1);
                drop(inner);
                self.clear_owned(low, high - low + 1);
                if let Err(e) = dev.free_blocks(low, high - low + 1) {
                    log::warn!("returning blocks [{}, {}] failed: {}", low, high, e);
                }
                inner = list.lock();
            }
        }
    }

    pub fn free_on(&self, cpu: usize, pm_node: usize) -> u64 {
        self.list(cpu, pm_node).lock().num_free
    }

    pub fn count_free(&self) -> u64 {
        self.lists.iter().map(|l| l.lock().num_free).sum()
    }
}
