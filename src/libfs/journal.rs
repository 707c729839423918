//! The lite journal: crash atomicity for multi-word metadata updates.
//!
//! Per CPU there is one cache line of head/tail offsets in PM and one
//! 4-KiB circular page of 16-byte undo entries `{target, pre-image}`.
//! A transaction appends its pre-images, flushes them, publishes the tail,
//! performs the word-sized in-place updates, and commits by advancing the
//! head over the window. `head == tail` means no transaction is in flight;
//! recovery at mount replays any open window newest-first and resets it.

use std::sync::Arc;

use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use crate::error::{Error, Result};
use crate::libfs::cmd::Dev;
use crate::params::{page_round_up, CACHELINE, PAGE_SIZE};
use crate::pm::{PmArena, PmOffset};
use crate::pmem;

#[repr(C)]
#[derive(Clone, Copy)]
struct JournalEntry {
    /// 8-byte-aligned target offset.
    data1: u64,
    /// The word's value before the transaction.
    data2: u64,
}

const_assert!(core::mem::size_of::<JournalEntry>() == 16);

#[repr(C)]
struct JournalPtrPair {
    head: u64,
    tail: u64,
}

const_assert!(core::mem::size_of::<JournalPtrPair>() <= CACHELINE);

/// Entries live in a one-page circular buffer.
fn next_entry(curr: u64) -> u64 {
    let size = core::mem::size_of::<JournalEntry>() as u64;
    if (curr & (PAGE_SIZE as u64 - 1)) + size >= PAGE_SIZE as u64 {
        curr & !(PAGE_SIZE as u64 - 1)
    } else {
        curr + size
    }
}

/// Lay out the persistent journal area: the pointer-pair pages plus one
/// content page per CPU, each allocated on that CPU's node. Returns the
/// offset of the pointer-pair array.
pub fn hard_init(
    dev: &Dev,
    arena: &PmArena,
    cpus: usize,
    cpus_per_socket: usize,
    pm_nodes: usize,
) -> Result<PmOffset> {
    let ptr_pages = page_round_up((cpus * CACHELINE) as u64) / PAGE_SIZE as u64;
    let (block, got) = dev.alloc_blocks(ptr_pages, -1, 0)?;
    if got != ptr_pages {
        return Err(Error::NoSpace);
    }
    let base = PmOffset::from_block(block);

    for cpu in 0..cpus {
        let node = core::cmp::min(cpu / cpus_per_socket, pm_nodes - 1);
        let (content, got) = dev.alloc_blocks(1, cpu as i32, node)?;
        if got != 1 {
            return Err(Error::NoSpace);
        }
        let pair_off = base.add((cpu * CACHELINE) as u64);
        // SAFETY: freshly allocated journal area, not shared yet.
        unsafe {
            let pair = arena.at::<JournalPtrPair>(pair_off);
            (*pair).head = PmOffset::from_block(content).0;
            (*pair).tail = PmOffset::from_block(content).0;
            pmem::clwb_buffer(pair as *const u8, core::mem::size_of::<JournalPtrPair>());
        }
    }
    pmem::sfence();
    Ok(base)
}

pub struct Journal {
    arena: Arc<PmArena>,
    base: PmOffset,
    locks: Vec<Mutex<()>>,
    cpus: usize,
}

impl Journal {
    pub fn new(arena: Arc<PmArena>, base: PmOffset, cpus: usize) -> Journal {
        let locks = (0..cpus).map(|_| Mutex::new(())).collect();
        Journal {
            arena,
            base,
            locks,
            cpus,
        }
    }

    fn pair(&self, cpu: usize) -> *mut JournalPtrPair {
        self.arena
            .at::<JournalPtrPair>(self.base.add((cpu * CACHELINE) as u64))
    }

    /// The journal lock is held from transaction creation through commit.
    pub fn lock(&self, cpu: usize) -> MutexGuard<'_, ()> {
        self.locks[cpu % self.cpus].lock()
    }

    pub fn cpu_of(&self, cpu: usize) -> usize {
        cpu % self.cpus
    }

    /// Append one undo entry; the target is captured as its containing
    /// 8-byte word.
    fn append_entry(&self, curr: u64, target: PmOffset) -> u64 {
        let aligned = target.0 & !7u64;
        // SAFETY: journal entries live in this CPU's content page; the
        // target word is read under the caller's lease.
        unsafe {
            let e = self.arena.at::<JournalEntry>(PmOffset(curr));
            (*e).data1 = aligned;
            (*e).data2 = *self.arena.at::<u64>(PmOffset(aligned));
        }
        next_entry(curr)
    }

    /// Flush the entry window, wrap included.
    fn flush_window(&self, head: u64, tail: u64) {
        if head == tail {
            return;
        }
        if head < tail {
            pmem::clwb_buffer(self.arena.at::<u8>(PmOffset(head)), (tail - head) as usize);
        } else {
            let page = head & !(PAGE_SIZE as u64 - 1);
            let head_len = PAGE_SIZE as u64 - (head - page);
            pmem::clwb_buffer(self.arena.at::<u8>(PmOffset(head)), head_len as usize);
            pmem::clwb_buffer(self.arena.at::<u8>(PmOffset(page)), (tail - page) as usize);
        }
    }

    /// Open a transaction over `targets` on `cpu`'s journal: append the
    /// pre-images, flush, publish the tail. The caller holds the cpu's
    /// journal lock and commits with the returned tail.
    pub fn create_transaction(&self, cpu: usize, targets: &[PmOffset]) -> Result<u64> {
        let pair = self.pair(cpu);
        // SAFETY: pair is this CPU's pointer cache line; the journal lock
        // serializes access.
        let (head, tail) = unsafe { ((*pair).head, (*pair).tail) };
        if head == 0 || head != tail {
            log::error!("journal cpu {} has an open window at transaction start", cpu);
            return Err(Error::Io);
        }
        let mut temp = head;
        for t in targets {
            temp = self.append_entry(temp, *t);
        }
        self.flush_window(head, temp);
        // SAFETY: as above.
        unsafe {
            (*pair).tail = temp;
            pmem::clwb_buffer(pair as *const u8, core::mem::size_of::<JournalPtrPair>());
        }
        pmem::sfence();
        Ok(temp)
    }

    /// Drop the journal entries: the transaction's in-place updates are
    /// now the truth.
    pub fn commit(&self, cpu: usize, tail: u64) {
        let pair = self.pair(cpu);
        // SAFETY: as in `create_transaction`.
        unsafe {
            if (*pair).tail != tail {
                log::error!("journal cpu {} commit with mismatched tail", cpu);
                return;
            }
            (*pair).head = tail;
            pmem::clwb_buffer(pair as *const u8, core::mem::size_of::<JournalPtrPair>());
        }
        pmem::sfence();
    }

    /// Mount-time recovery: write every open window's pre-images back,
    /// newest entry first, then close the window.
    pub fn recover(&self) {
        for cpu in 0..self.cpus {
            let pair = self.pair(cpu);
            // SAFETY: recovery runs before the journal is handed out.
            let (head, tail) = unsafe { ((*pair).head, (*pair).tail) };
            if head == 0 || head == tail {
                continue;
            }
            log::warn!("replaying uncommitted journal window on cpu {}", cpu);
            let mut entries = Vec::new();
            let mut p = head;
            while p != tail {
                // SAFETY: entries inside the cpu's content page.
                entries.push(unsafe { *self.arena.at::<JournalEntry>(PmOffset(p)) });
                p = next_entry(p);
            }
            for e in entries.iter().rev() {
                // SAFETY: data1 was captured as an aligned in-arena word.
                unsafe {
                    *self.arena.at::<u64>(PmOffset(e.data1)) = e.data2;
                }
                pmem::clwb_buffer(self.arena.at::<u8>(PmOffset(e.data1)), 8);
            }
            pmem::sfence();
            // SAFETY: as above.
            unsafe {
                (*pair).tail = head;
                pmem::clwb_buffer(pair as *const u8, core::mem::size_of::<JournalPtrPair>());
            }
            pmem::sfence();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PAGE_SIZE;

    /// A one-CPU journal over a bare arena: pair line on block 1, content
    /// page on block 2, scratch words on block 3.
    fn raw_journal() -> (Arc<PmArena>, Journal) {
        let arena = Arc::new(PmArena::new(&[8 * PAGE_SIZE]).unwrap());
        let base = PmOffset::from_block(1);
        unsafe {
            let pair = arena.at::<JournalPtrPair>(base);
            (*pair).head = PmOffset::from_block(2).0;
            (*pair).tail = PmOffset::from_block(2).0;
        }
        let j = Journal::new(arena.clone(), base, 1);
        (arena, j)
    }

    fn write_word(arena: &PmArena, off: PmOffset, v: u64) {
        unsafe { *arena.at::<u64>(off) = v }
    }

    fn read_word(arena: &PmArena, off: PmOffset) -> u64 {
        unsafe { *arena.at::<u64>(off) }
    }

    #[test]
    fn uncommitted_window_is_undone() {
        let (arena, j) = raw_journal();
        let a = PmOffset::from_block(3);
        let b = a.add(64);
        write_word(&arena, a, 0x1111);
        write_word(&arena, b, 0x2222);

        {
            let _g = j.lock(0);
            let _tail = j.create_transaction(0, &[a, b]).unwrap();
            // Updates land, but the client dies before commit.
            write_word(&arena, a, 0xaaaa);
            write_word(&arena, b, 0xbbbb);
        }

        j.recover();
        assert_eq!(read_word(&arena, a), 0x1111);
        assert_eq!(read_word(&arena, b), 0x2222);

        // The window is closed; a new transaction can start.
        let _g = j.lock(0);
        let tail = j.create_transaction(0, &[a]).unwrap();
        j.commit(0, tail);
    }

    #[test]
    fn committed_window_survives_recovery() {
        let (arena, j) = raw_journal();
        let a = PmOffset::from_block(3);
        write_word(&arena, a, 7);

        {
            let _g = j.lock(0);
            let tail = j.create_transaction(0, &[a]).unwrap();
            write_word(&arena, a, 9);
            j.commit(0, tail);
        }

        j.recover();
        assert_eq!(read_word(&arena, a), 9);
    }

    #[test]
    fn window_wraps_within_its_page() {
        let (arena, j) = raw_journal();
        let a = PmOffset::from_block(3);
        // Fill most of the content page so the next window wraps.
        for _ in 0..(PAGE_SIZE / 16 - 1) {
            let _g = j.lock(0);
            let tail = j.create_transaction(0, &[a]).unwrap();
            j.commit(0, tail);
        }
        write_word(&arena, a, 0x5050);
        let _g = j.lock(0);
        let _tail = j.create_transaction(0, &[a, a, a]).unwrap();
        write_word(&arena, a, 0x6060);
        drop(_g);
        j.recover();
        assert_eq!(read_word(&arena, a), 0x5050);
    }
}
