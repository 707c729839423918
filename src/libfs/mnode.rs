//! In-memory inode nodes.
//!
//! An mnode mirrors one inode for this client: the embedded PM inode it
//! borrows from its directory entry (the root carries a DRAM record
//! instead), the file-index cursors with the flat page mirror, and — for
//! directories — the leaf-name map plus the PM entry allocator.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::layout::{
    dentry_name, dir_rec_len, inode_of_dentry, is_norm_fidx, DirEntryHead, PmInode,
    DIR_ENTRY_BASE,
};
use crate::libfs::chainhash::ChainHash;
use crate::libfs::LibFs;
use crate::params::{
    DIR_INIT_HASH_IDX, FILE_BLOCK_PAGE_CNT, FILE_BLOCK_SIZE, INODE_TOMBSTONE, NAME_MAX,
};
use crate::pm::PmOffset;
use crate::pmem;
use crate::stat::{FileStat, FileType};

/// Where an mnode's inode record lives. Every file borrows the record
/// embedded in its directory entry; only the root owns a DRAM one.
pub enum InodeRef {
    Pm(PmOffset),
    Dram(Mutex<PmInode>),
}

pub struct DirData {
    /// leaf name -> (ino, dir-entry offset)
    pub map: ChainHash,
    /// Serializes PM dir-entry allocation in this directory's blocks.
    pub pm_lock: Mutex<()>,
}

pub struct Mnode {
    pub ino: u32,
    pub typ: FileType,
    pub parent: AtomicU32,
    inode: RwLock<InodeRef>,
    index_start: AtomicU64,
    index_end: AtomicU64,
    /// Slot offset of each extent's index entry, in extent order.
    pages: Mutex<Vec<PmOffset>>,
    size: AtomicU64,
    /// File read/write lock: growth takes it exclusively.
    pub rw: RwLock<()>,
    pub dir: Option<DirData>,
}

impl Mnode {
    pub fn new(typ: FileType, ino: u32, parent: u32, inode: InodeRef) -> Arc<Mnode> {
        let dir = if typ == FileType::Directory {
            Some(DirData {
                map: ChainHash::new(DIR_INIT_HASH_IDX),
                pm_lock: Mutex::new(()),
            })
        } else {
            None
        };
        Arc::new(Mnode {
            ino,
            typ,
            parent: AtomicU32::new(parent),
            inode: RwLock::new(inode),
            index_start: AtomicU64::new(0),
            index_end: AtomicU64::new(0),
            pages: Mutex::new(Vec::new()),
            size: AtomicU64::new(0),
            rw: RwLock::new(()),
            dir,
        })
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, v: u64) {
        self.size.store(v, Ordering::Release);
    }

    pub fn index_start(&self) -> PmOffset {
        PmOffset(self.index_start.load(Ordering::Acquire))
    }

    pub(crate) fn set_index_start(&self, off: PmOffset) {
        self.index_start.store(off.0, Ordering::Release);
    }

    pub fn index_end(&self) -> PmOffset {
        PmOffset(self.index_end.load(Ordering::Acquire))
    }

    pub(crate) fn set_index_end(&self, off: PmOffset) {
        self.index_end.store(off.0, Ordering::Release);
    }

    pub fn extent_count(&self) -> usize {
        self.pages.lock().len()
    }

    // ---- the borrowed inode record -----------------------------------

    pub fn with_inode<T>(&self, fs: &LibFs, f: impl FnOnce(&PmInode) -> T) -> T {
        match &*self.inode.read() {
            // SAFETY: the offset names a live dir entry's embedded inode;
            // the caller's lease covers reads of it.
            InodeRef::Pm(off) => f(unsafe { &*fs.arena().at::<PmInode>(*off) }),
            InodeRef::Dram(m) => f(&m.lock()),
        }
    }

    /// Mutate and persist the inode record.
    pub fn update_inode(&self, fs: &LibFs, f: impl FnOnce(&mut PmInode)) {
        match &*self.inode.read() {
            InodeRef::Pm(off) => {
                // SAFETY: as in `with_inode`; the write lease serializes
                // metadata updates.
                let inode = unsafe { &mut *fs.arena().at::<PmInode>(*off) };
                f(inode);
                pmem::clwb_buffer(
                    inode as *const PmInode as *const u8,
                    core::mem::size_of::<PmInode>(),
                );
                pmem::sfence();
            }
            InodeRef::Dram(m) => f(&mut m.lock()),
        }
    }

    /// Rebind to another dir entry's record (rename).
    pub fn set_inode_ref(&self, r: InodeRef) {
        *self.inode.write() = r;
    }

    /// PM offset of the inode record, or zero for a DRAM one.
    pub fn inode_pm_offset(&self) -> u64 {
        match &*self.inode.read() {
            InodeRef::Pm(off) => off.0,
            InodeRef::Dram(_) => 0,
        }
    }

    pub fn stat(&self, fs: &LibFs) -> FileStat {
        let mut st = self.with_inode(fs, |i| FileStat {
            ino: self.ino,
            ftype: self.typ,
            mode: i.mode,
            uid: i.uid,
            gid: i.gid,
            size: i.size,
            atime: i.atime,
            ctime: i.ctime,
            mtime: i.mtime,
        });
        if self.typ == FileType::Regular {
            st.size = self.size();
        }
        st
    }

    // ---- the file index ----------------------------------------------

    /// Extent offset of page `idx`, from the DRAM mirror.
    pub fn get_page(&self, fs: &LibFs, idx: usize) -> Option<PmOffset> {
        let slot = *self.pages.lock().get(idx)?;
        // SAFETY: mirror slots point into mapped index pages.
        let v = unsafe { *fs.arena().at::<u64>(slot) };
        if v == 0 {
            None
        } else {
            Some(PmOffset(v))
        }
    }

    /// Index-entry slot of page `idx`.
    pub fn get_idx_slot(&self, idx: usize) -> Option<PmOffset> {
        self.pages.lock().get(idx).copied()
    }

    /// Record the slot for page `idx` while building the mirror.
    pub fn fill_index(&self, idx: usize, slot: PmOffset) {
        let mut pages = self.pages.lock();
        if idx == pages.len() {
            pages.push(slot);
        } else {
            if idx >= pages.len() {
                pages.resize(idx + 1, PmOffset::NULL);
            }
            pages[idx] = slot;
        }
    }

    pub(crate) fn pages_truncate(&self, len: usize) {
        self.pages.lock().truncate(len);
    }

    pub(crate) fn pages_clear(&self) {
        self.pages.lock().clear();
    }

    /// Link one more extent: write its offset into the next free slot,
    /// chaining in a fresh index page when the reserved slot is reached.
    /// The final store to the previously-zero slot publishes the extent.
    pub fn index_append(&self, fs: &LibFs, data_off: PmOffset) -> Result<PmOffset> {
        let arena = fs.arena();
        let mut end = self.index_end();

        if self.index_start().is_null() {
            let blk = fs.new_file_data_blocks(1, true)?;
            let page = PmOffset::from_block(blk);
            self.set_index_start(page);
            self.update_inode(fs, |i| i.offset = page.0);
            end = page;
        }

        if !is_norm_fidx(end) {
            // The reserved chain slot: hang a fresh page off it first.
            let blk = fs.new_file_data_blocks(1, true)?;
            let page = PmOffset::from_block(blk);
            // SAFETY: index slots are 8-byte words in pages this client
            // allocated under its lease.
            unsafe { *arena.at::<u64>(end) = page.0 };
            pmem::clwb_buffer(arena.at::<u8>(end), 8);
            end = page;
        }

        // SAFETY: as above; `end` was zero until this store.
        unsafe { *arena.at::<u64>(end) = data_off.0 };
        pmem::clwb_buffer(arena.at::<u8>(end), 8);
        pmem::sfence();

        self.set_index_end(end.add(8));
        Ok(end)
    }

    /// Append an extent and grow to `newsize`.
    pub fn resize_append(&self, fs: &LibFs, newsize: u64, data_off: PmOffset) -> Result<()> {
        let slot = self.index_append(fs, data_off)?;
        let idx = self.pages.lock().len();
        self.fill_index(idx, slot);
        self.resize_nogrow(fs, newsize);
        Ok(())
    }

    /// Size change without new extents.
    pub fn resize_nogrow(&self, fs: &LibFs, newsize: u64) {
        self.set_size(newsize);
        self.update_inode(fs, |i| i.size = newsize);
    }

    /// Release everything: publish the empty index first, then free each
    /// extent and index page that this client owns.
    pub fn truncate_zero(&self, fs: &LibFs) {
        let start = self.index_start();
        if start.is_null() {
            self.resize_nogrow(fs, 0);
            return;
        }

        let arena = fs.arena();
        let mut extents: Vec<PmOffset> = Vec::new();
        let mut index_pages: Vec<PmOffset> = vec![start];
        let mut slot = start;
        loop {
            // SAFETY: walking this file's own index under its lease.
            let v = unsafe { *arena.at::<u64>(slot) };
            if v == 0 {
                break;
            }
            if is_norm_fidx(slot) {
                extents.push(PmOffset(v));
                slot = slot.add(8);
            } else {
                index_pages.push(PmOffset(v));
                slot = PmOffset(v);
            }
        }

        // The atomic truncate publish.
        self.update_inode(fs, |i| {
            i.offset = 0;
            i.size = 0;
        });
        self.set_index_start(PmOffset::NULL);
        self.set_index_end(PmOffset::NULL);
        self.pages_clear();
        self.set_size(0);

        for e in extents {
            let block = e.block();
            if fs.balloc.is_owned(block) {
                fs.free_data_blocks(block, FILE_BLOCK_PAGE_CNT as u64);
            }
        }
        for p in index_pages {
            let block = p.block();
            if fs.balloc.is_owned(block) {
                fs.free_data_blocks(block, 1);
            }
        }
    }

    // ---- directory content -------------------------------------------

    fn dir_data(&self) -> &DirData {
        self.dir.as_ref().expect("directory mnode")
    }

    pub fn dir_lookup(&self, name: &[u8]) -> Option<(u32, PmOffset)> {
        self.dir_data()
            .map
            .lookup(name)
            .map(|(v, v2)| (v as u32, PmOffset(v2)))
    }

    pub fn dir_exists(&self, name: &[u8]) -> bool {
        self.dir_data().map.lookup(name).is_some()
    }

    pub fn dir_killed(&self) -> bool {
        self.dir_data().map.is_dead()
    }

    /// Mark an emptied directory dead; fails if entries remain.
    pub fn dir_kill(&self) -> bool {
        self.dir_data().map.remove_and_kill()
    }

    pub fn dir_enumerate(&self, prev: Option<&[u8]>) -> Option<Vec<u8>> {
        self.dir_data().map.enumerate(prev)
    }

    pub fn dir_len(&self) -> usize {
        self.dir_data().map.len()
    }

    /// Claim PM space for a new entry in this directory's blocks: a
    /// tombstone whose record is large enough is reused, otherwise the
    /// terminator of a block with room, otherwise a fresh block. The claim
    /// writes everything but `name_len`; the caller publishes it.
    pub fn dir_entry_alloc(&self, fs: &LibFs, name: &[u8], ino: u32) -> Result<PmOffset> {
        if name.is_empty() || name.len() > NAME_MAX - 1 {
            return Err(Error::InvalidArgument);
        }
        let arena = fs.arena();
        let name_len = name.len() + 1;
        let need = dir_rec_len(name_len) as u64;
        let _g = self.dir_data().pm_lock.lock();

        let slots: Vec<PmOffset> = self.pages.lock().clone();
        for slot in slots {
            // SAFETY: this directory's own index slots.
            let block_off = PmOffset(unsafe { *arena.at::<u64>(slot) });
            if block_off.is_null() {
                continue;
            }
            let mut pos = 0u64;
            while pos + DIR_ENTRY_BASE as u64 <= FILE_BLOCK_SIZE as u64 {
                let de = block_off.add(pos);
                // SAFETY: entry heads inside the directory's data block.
                let head = unsafe { &*arena.at::<DirEntryHead>(de) };
                if head.name_len == 0 {
                    if pos + need <= FILE_BLOCK_SIZE as u64 {
                        self.write_entry_body(fs, de, ino, Some(need as u16), name);
                        return Ok(de);
                    }
                    break;
                }
                if head.ino_num == INODE_TOMBSTONE && head.rec_len as u64 >= need {
                    self.write_entry_body(fs, de, ino, None, name);
                    return Ok(de);
                }
                let rec = head.rec_len as u64;
                if rec == 0 {
                    break;
                }
                pos += rec;
            }
        }

        // No room anywhere: hang a fresh block off the index.
        let blk = fs.new_file_data_blocks(FILE_BLOCK_PAGE_CNT as u64, true)?;
        let data = PmOffset::from_block(blk);
        let slot = self.index_append(fs, data)?;
        let idx = self.pages.lock().len();
        self.fill_index(idx, slot);
        self.write_entry_body(fs, data, ino, Some(need as u16), name);
        Ok(data)
    }

    /// Everything but the publication word.
    fn write_entry_body(
        &self,
        fs: &LibFs,
        de: PmOffset,
        ino: u32,
        rec_len: Option<u16>,
        name: &[u8],
    ) {
        let arena = fs.arena();
        // SAFETY: `de` was claimed under the directory's pm lock and is
        // invisible until name_len is published.
        unsafe {
            let head = &mut *arena.at::<DirEntryHead>(de);
            head.ino_num = ino;
            if let Some(r) = rec_len {
                head.rec_len = r;
            }
            let dst: *mut u8 = arena.at::<u8>(de.add(DIR_ENTRY_BASE as u64));
            core::ptr::copy_nonoverlapping(name.as_ptr(), dst, name.len());
            *dst.add(name.len()) = 0;
        }
    }

    /// Bind `name` to a freshly created child: the map entry first, then
    /// the PM record. Publication of `name_len` stays with the caller, who
    /// fills the embedded inode in between.
    pub fn dir_insert(&self, fs: &LibFs, name: &[u8], child_ino: u32) -> Result<PmOffset> {
        if !self.dir_data().map.insert(name, child_ino as u64, 0) {
            return Err(Error::InvalidArgument);
        }
        match self.dir_entry_alloc(fs, name, child_ino) {
            Ok(de) => {
                let _ = self.dir_data().map.set_val2(name, de.0);
                Ok(de)
            }
            Err(e) => {
                let _ = self.dir_data().map.remove(name);
                Err(e)
            }
        }
    }

    /// Unbind `name`: tombstone the PM entry, drop the map entry.
    pub fn dir_remove(&self, fs: &LibFs, name: &[u8]) -> Option<(u32, PmOffset)> {
        let (ino, de) = self.dir_data().map.remove(name)?;
        let de = PmOffset(de);
        tombstone_entry(fs, de);
        Some((ino as u32, de))
    }

    /// Walk a directory data block, calling `f` for each live entry as
    /// `(entry offset, head)`. Stops at the terminator sentinel.
    pub fn walk_block_entries(
        fs: &LibFs,
        block_off: PmOffset,
        mut f: impl FnMut(PmOffset, &DirEntryHead),
    ) {
        let arena = fs.arena();
        let mut pos = 0u64;
        while pos + DIR_ENTRY_BASE as u64 <= FILE_BLOCK_SIZE as u64 {
            let de = block_off.add(pos);
            // SAFETY: published entries inside a mapped directory block.
            let head = unsafe { &*arena.at::<DirEntryHead>(de) };
            if head.name_len == 0 {
                break;
            }
            if head.ino_num != INODE_TOMBSTONE {
                f(de, head);
            }
            let rec = head.rec_len as u64;
            if rec == 0 {
                break;
            }
            pos += rec;
        }
    }
}

/// Transition an entry's ino word to the tombstone and persist it.
pub fn tombstone_entry(fs: &LibFs, de: PmOffset) {
    let arena = fs.arena();
    // SAFETY: word-sized store to a live entry under the directory lease.
    unsafe {
        let head = &mut *arena.at::<DirEntryHead>(de);
        head.ino_num = INODE_TOMBSTONE;
        pmem::clwb_buffer(&head.ino_num as *const u32 as *const u8, 4);
    }
    pmem::sfence();
}

/// Publish a claimed entry: fill the embedded inode, then let the
/// name_len store make it visible, flushed as one record.
pub fn publish_entry(fs: &LibFs, de: PmOffset, inode: PmInode, name_len: usize) {
    let arena = fs.arena();
    // SAFETY: the entry body was claimed and written by the caller; this
    // is the final visibility store.
    unsafe {
        let head = &mut *arena.at::<DirEntryHead>(de);
        head.inode = inode;
        head.name_len = name_len as u8;
    }
    pmem::clwb_buffer(arena.at::<u8>(de), DIR_ENTRY_BASE + name_len);
    pmem::sfence();
}

/// Name bytes of a live entry.
pub fn entry_name(fs: &LibFs, de: PmOffset) -> Vec<u8> {
    // SAFETY: published entry under the caller's lease.
    unsafe { dentry_name(fs.arena(), de) }
}

/// Offset of the embedded inode of the entry at `de`.
pub fn entry_inode_off(de: PmOffset) -> PmOffset {
    inode_of_dentry(de)
}
