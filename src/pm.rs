//! The PM arena.
//!
//! All persistent state lives in one shared anonymous mapping that stands in
//! for the DAX device array; the region is partitioned into PM nodes. On
//! media we never store virtual addresses: everything is a byte offset from
//! the arena base, translated at use sites.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::params::{PAGE_SHIFT, PAGE_SIZE};

/// Identification word at the head of a formatted arena.
pub const PM_MAGIC: u64 = 0x31_5346_554d_50; // "PMUFS1"

/// A byte offset from the arena base. Offset zero is never a valid
/// location of file-system data (the super page lives there), so it doubles
/// as the null value in index slots and chain links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PmOffset(pub u64);

impl PmOffset {
    pub const NULL: PmOffset = PmOffset(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn block(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub fn from_block(block: u64) -> PmOffset {
        PmOffset(block << PAGE_SHIFT)
    }

    #[inline]
    pub fn add(self, delta: u64) -> PmOffset {
        PmOffset(self.0 + delta)
    }
}

/// `[start_block, end_block]`, inclusive, of one PM node.
#[derive(Debug, Clone, Copy, Default)]
pub struct PmNodeInfo {
    pub start_block: u64,
    pub end_block: u64,
}

/// Journal replay policy recorded in the super page. Only the undo form is
/// produced; the field exists so a mount can observe what it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    Undo,
    Redo,
}

/// Head-of-arena persistent record.
#[repr(C)]
pub struct SuperPage {
    magic: AtomicU64,
    /// Offset of the journal pointer-pair array; 0 until a client claims
    /// journal initialization.
    journal_off: AtomicU64,
    replay: AtomicU8,
}

impl SuperPage {
    pub fn magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }

    pub fn journal_off(&self) -> &AtomicU64 {
        &self.journal_off
    }

    pub fn replay_policy(&self) -> ReplayPolicy {
        if self.replay.load(Ordering::Relaxed) == 1 {
            ReplayPolicy::Redo
        } else {
            ReplayPolicy::Undo
        }
    }
}

pub struct PmArena {
    base: *mut u8,
    len: usize,
    nodes: Vec<PmNodeInfo>,
}

// SAFETY: the arena is plain shared memory; every mutation of its contents
// is serialized by the ownership protocol (allocator locks, leases, ring
// valid flags) of the layers above.
unsafe impl Send for PmArena {}
unsafe impl Sync for PmArena {}

impl PmArena {
    /// Map an anonymous arena partitioned into `node_sizes` PM nodes.
    /// Each size must be a whole number of pages.
    pub fn new(node_sizes: &[usize]) -> Result<PmArena> {
        if node_sizes.is_empty() || node_sizes.iter().any(|s| s % PAGE_SIZE != 0 || *s == 0) {
            return Err(Error::InvalidArgument);
        }
        let len: usize = node_sizes.iter().sum();

        // SAFETY: requesting a fresh shared anonymous mapping; the result is
        // checked before use.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::NoDevice);
        }

        let mut nodes = Vec::with_capacity(node_sizes.len());
        let mut start = 0u64;
        for size in node_sizes {
            let blocks = (*size >> PAGE_SHIFT) as u64;
            nodes.push(PmNodeInfo {
                start_block: start,
                end_block: start + blocks - 1,
            });
            start += blocks;
        }

        Ok(PmArena {
            base: base as *mut u8,
            len,
            nodes,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn total_blocks(&self) -> u64 {
        (self.len >> PAGE_SHIFT) as u64
    }

    #[inline]
    pub fn nodes(&self) -> &[PmNodeInfo] {
        &self.nodes
    }

    /// PM node owning `block`.
    pub fn block_to_pm_node(&self, block: u64) -> usize {
        for (i, n) in self.nodes.iter().enumerate() {
            if block >= n.start_block && block <= n.end_block {
                return i;
            }
        }
        log::warn!("block {} maps to no pm node", block);
        self.nodes.len() - 1
    }

    /// Raw pointer at `off`. The offset must be inside the arena.
    #[inline]
    pub fn at<T>(&self, off: PmOffset) -> *mut T {
        debug_assert!((off.0 as usize) + core::mem::size_of::<T>() <= self.len);
        // Arena contents are at most page aligned; records keep 8-byte
        // alignment by construction.
        debug_assert_eq!(off.0 as usize % core::mem::align_of::<T>(), 0);
        // SAFETY: in-bounds offset arithmetic on the mapping.
        unsafe { self.base.add(off.0 as usize) as *mut T }
    }

    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> PmOffset {
        let addr = ptr as usize;
        let base = self.base as usize;
        debug_assert!(addr >= base && addr < base + self.len);
        PmOffset((addr - base) as u64)
    }

    pub fn contains(&self, off: PmOffset, len: usize) -> bool {
        (off.0 as usize).checked_add(len).map_or(false, |end| end <= self.len)
    }

    /// The persistent super record at offset zero.
    pub fn super_page(&self) -> &SuperPage {
        // SAFETY: offset 0 is always mapped and the record is initialized
        // (zeroed by the anonymous mapping, then formatted).
        unsafe { &*(self.base as *const SuperPage) }
    }

    /// Stamp a fresh arena: magic plus the undo replay policy.
    pub fn format_super(&self) {
        let sp = self.super_page();
        sp.replay.store(0, Ordering::Relaxed);
        sp.journal_off.store(0, Ordering::Relaxed);
        sp.magic.store(PM_MAGIC, Ordering::Release);
        crate::pmem::clwb_buffer(self.base as *const u8, core::mem::size_of::<SuperPage>());
        crate::pmem::sfence();
    }
}

impl Drop for PmArena {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region returned by mmap.
        unsafe {
            let _ = libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_partition() {
        let arena = PmArena::new(&[8 * PAGE_SIZE, 4 * PAGE_SIZE]).unwrap();
        assert_eq!(arena.total_blocks(), 12);
        assert_eq!(arena.nodes()[0].start_block, 0);
        assert_eq!(arena.nodes()[0].end_block, 7);
        assert_eq!(arena.nodes()[1].start_block, 8);
        assert_eq!(arena.block_to_pm_node(3), 0);
        assert_eq!(arena.block_to_pm_node(9), 1);
    }

    #[test]
    fn format_marks_magic() {
        let arena = PmArena::new(&[4 * PAGE_SIZE]).unwrap();
        assert_ne!(arena.super_page().magic(), PM_MAGIC);
        arena.format_super();
        assert_eq!(arena.super_page().magic(), PM_MAGIC);
        assert_eq!(arena.super_page().replay_policy(), ReplayPolicy::Undo);
    }
}
