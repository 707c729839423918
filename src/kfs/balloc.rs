//! Supervisor block pools.
//!
//! The block space is partitioned cpu-major x pm-node-minor; each list owns
//! a tree of free intervals plus counters. Allocation prefers the caller's
//! list, retries at most twice onto the fullest candidate when the
//! fragmentation heuristic says the local list looks short, and then
//! allocates anyway — the heuristic must never manufacture a spurious
//! out-of-space.

use itertools::iproduct;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::pm::PmNodeInfo;
use crate::range_tree::RangeTree;

pub struct FreeInner {
    pub tree: RangeTree,
    pub block_start: u64,
    pub block_end: u64,
    pub num_free: u64,
}

pub struct FreeList {
    pub inner: Mutex<FreeInner>,
}

impl FreeList {
    fn new() -> FreeList {
        FreeList {
            inner: Mutex::new(FreeInner {
                tree: RangeTree::new(),
                block_start: 0,
                block_end: 0,
                num_free: 0,
            }),
        }
    }
}

/// `num_free / num_nodes < requested` guesses that fragmentation would make
/// the walk fail; it is only a guess, see `alloc`.
pub fn not_enough(inner: &FreeInner, num: u64) -> bool {
    if inner.tree.is_empty() || inner.num_free == 0 {
        return true;
    }
    inner.num_free / (inner.tree.len() as u64) < num
}

/// First-fit walk in address order: an exactly-sized interval is erased, a
/// larger one is shrunk upward from its low edge.
pub fn alloc_in_list(inner: &mut FreeInner, num: u64) -> Result<u64> {
    if inner.tree.is_empty() || inner.num_free == 0 {
        log::warn!("empty free list on allocation of {}", num);
        return Err(Error::NoSpace);
    }
    let mut choice = None;
    for (low, high) in inner.tree.iter() {
        let size = high - low + 1;
        if num > size {
            continue;
        }
        choice = Some((low, high, size == num));
        break;
    }
    let (low, high, exact) = choice.ok_or(Error::NoSpace)?;
    let _ = inner.tree.remove(low);
    if !exact {
        inner
            .tree
            .insert(low + num, high)
            .expect("shrunk interval re-insert cannot overlap");
    }
    debug_assert!(inner.num_free >= num);
    inner.num_free -= num;
    Ok(low)
}

/// Merge `[low, high]` back: into the left neighbor, the right neighbor,
/// both (closing a hole), or as a fresh interval.
pub fn free_into_list(inner: &mut FreeInner, low: u64, high: u64) -> Result<()> {
    let num = high - low + 1;
    if low < inner.block_start || high > inner.block_end {
        log::warn!(
            "free of [{}, {}] outside list [{}, {}]",
            low,
            high,
            inner.block_start,
            inner.block_end
        );
        return Err(Error::Io);
    }
    let (prev, next) = inner.tree.neighbors(low, high).map_err(|_| {
        log::warn!("free of [{}, {}] overlaps the free tree", low, high);
        Error::InvalidArgument
    })?;

    match (prev, next) {
        (Some((pl, ph)), Some((nl, nh))) if low == ph + 1 && high + 1 == nl => {
            let _ = inner.tree.remove(nl);
            inner.tree.set_high(pl, nh);
        }
        (Some((pl, ph)), _) if low == ph + 1 => {
            inner.tree.set_high(pl, high);
        }
        (_, Some((nl, nh))) if high + 1 == nl => {
            let _ = inner.tree.remove(nl);
            inner
                .tree
                .insert(low, nh)
                .expect("right-merged interval cannot overlap");
        }
        _ => {
            inner
                .tree
                .insert(low, high)
                .expect("checked by neighbors()");
        }
    }
    inner.num_free += num;
    Ok(())
}

pub struct BlockAlloc {
    lists: Vec<FreeList>,
    cpus: usize,
    pm_nodes: usize,
    node_info: Vec<PmNodeInfo>,
}

impl BlockAlloc {
    /// Carve each PM node evenly across the CPUs; the remainder goes to the
    /// last CPU, and CPU 0 of the head node loses the head-reserved blocks.
    pub fn new(
        nodes: &[PmNodeInfo],
        cpus: usize,
        head_node: usize,
        head_reserved: u64,
    ) -> BlockAlloc {
        let pm_nodes = nodes.len();
        let lists: Vec<FreeList> = (0..cpus * pm_nodes).map(|_| FreeList::new()).collect();

        for (cpu, node) in iproduct!(0..cpus, 0..pm_nodes) {
            let info = &nodes[node];
            let size = info.end_block - info.start_block + 1;
            let per_list = size / cpus as u64;
            let mut start = info.start_block + per_list * cpu as u64;
            let end = if cpu == cpus - 1 {
                info.end_block
            } else {
                start + per_list - 1
            };
            if cpu == 0 && node == head_node {
                start += head_reserved;
                if start >= end {
                    log::warn!("head node overflow; reserved region swallows cpu 0");
                    start = end;
                }
            }
            let mut inner = lists[cpu * pm_nodes + node].inner.lock();
            inner.block_start = start;
            inner.block_end = end;
            inner.num_free = end - start + 1;
            inner.tree.insert(start, end).expect("fresh list is empty");
        }

        BlockAlloc {
            lists,
            cpus,
            pm_nodes,
            node_info: nodes.to_vec(),
        }
    }

    pub fn list(&self, cpu: usize, pm_node: usize) -> &FreeList {
        &self.lists[(cpu % self.cpus) * self.pm_nodes + (pm_node % self.pm_nodes)]
    }

    /// CPU and node owning `block`.
    pub fn block_to_cpu_node(&self, block: u64) -> (usize, usize) {
        let mut node = self.pm_nodes - 1;
        for (i, info) in self.node_info.iter().enumerate() {
            if block >= info.start_block && block <= info.end_block {
                node = i;
                break;
            }
        }
        let info = &self.node_info[node];
        let size = info.end_block - info.start_block + 1;
        let per_list = size / self.cpus as u64;
        let mut cpu = if per_list == 0 {
            0
        } else {
            ((block - info.start_block) / per_list) as usize
        };
        if cpu >= self.cpus {
            // The remainder of the last cpu.
            cpu = self.cpus - 1;
        }
        (cpu, node)
    }

    /// The list with the most free blocks on `pm_node`.
    fn candidate_cpu(&self, pm_node: usize) -> usize {
        let mut best = 0;
        let mut best_free = 0;
        for cpu in 0..self.cpus {
            let free = self.list(cpu, pm_node).inner.lock().num_free;
            if free > best_free {
                best = cpu;
                best_free = free;
            }
        }
        best
    }

    /// Allocate `num` blocks near (`cpu`, `pm_node`); returns the range
    /// start. Retries at most twice on candidate lists, then allocates
    /// anyway on whatever list it holds.
    pub fn alloc(&self, num: u64, mut cpu: usize, pm_node: usize) -> Result<u64> {
        if num == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut retried = 0;
        loop {
            let list = self.list(cpu, pm_node);
            let mut inner = list.inner.lock();
            if not_enough(&inner, num) && retried < 2 {
                drop(inner);
                cpu = self.candidate_cpu(pm_node);
                retried += 1;
                continue;
            }
            return alloc_in_list(&mut inner, num);
        }
    }

    /// Return `[block, block + num)` to its owning list. The freed chunk
    /// must fall inside a single CPU's partition.
    pub fn free(&self, block: u64, num: u64) -> Result<()> {
        if num == 0 {
            return Err(Error::InvalidArgument);
        }
        let (cpu, node) = self.block_to_cpu_node(block);
        let mut inner = self.list(cpu, node).inner.lock();
        free_into_list(&mut inner, block, block + num - 1)
    }

    pub fn free_blocks_on(&self, cpu: usize, pm_node: usize) -> u64 {
        self.list(cpu, pm_node).inner.lock().num_free
    }

    pub fn count_free(&self) -> u64 {
        self.lists.iter().map(|l| l.inner.lock().num_free).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes_one(blocks: u64) -> Vec<PmNodeInfo> {
        vec![PmNodeInfo {
            start_block: 0,
            end_block: blocks - 1,
        }]
    }

    #[test]
    fn partition_excludes_head_reserved() {
        let a = BlockAlloc::new(&nodes_one(1024), 4, 0, 16);
        assert_eq!(a.list(0, 0).inner.lock().block_start, 16);
        assert_eq!(a.list(0, 0).inner.lock().num_free, 240);
        assert_eq!(a.list(3, 0).inner.lock().block_end, 1023);
        assert_eq!(a.count_free(), 1024 - 16);
    }

    #[test]
    fn alloc_free_restores_count() {
        let a = BlockAlloc::new(&nodes_one(1024), 4, 0, 0);
        let before = a.free_blocks_on(1, 0);
        let b = a.alloc(32, 1, 0).unwrap();
        assert_eq!(a.free_blocks_on(1, 0), before - 32);
        a.free(b, 32).unwrap();
        assert_eq!(a.free_blocks_on(1, 0), before);
        // Merged back into a single interval.
        assert_eq!(a.list(1, 0).inner.lock().tree.len(), 1);
    }

    #[test]
    fn candidate_retry_borrows_from_fullest_list() {
        let a = BlockAlloc::new(&nodes_one(1024), 4, 0, 0);
        // Drain cpu 0 completely.
        let whole = a.free_blocks_on(0, 0);
        let _ = a.alloc(whole, 0, 0).unwrap();
        // cpu 0 asks again; the candidate walk serves it from elsewhere.
        let b = a.alloc(8, 0, 0).unwrap();
        let (owner, _) = a.block_to_cpu_node(b);
        assert_ne!(owner, 0);
    }

    #[test]
    fn hole_merge_left_right_middle() {
        let a = BlockAlloc::new(&nodes_one(256), 1, 0, 0);
        let base = a.alloc(64, 0, 0).unwrap();
        // Free two ends, then the middle: the tree collapses to one node.
        a.free(base, 16).unwrap();
        a.free(base + 48, 16).unwrap();
        assert!(a.list(0, 0).inner.lock().tree.len() >= 2);
        a.free(base + 16, 32).unwrap();
        assert_eq!(a.list(0, 0).inner.lock().tree.len(), 1);
        assert_eq!(a.count_free(), 256);
    }

    #[test]
    fn double_free_detected() {
        let a = BlockAlloc::new(&nodes_one(256), 1, 0, 0);
        let b = a.alloc(8, 0, 0).unwrap();
        a.free(b, 8).unwrap();
        assert!(a.free(b, 8).is_err());
    }
}
