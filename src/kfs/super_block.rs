//! The supervisor context: arena, pools, trust groups, shadow inodes,
//! delegation rings and agents, plus the typed bodies of every command.

use std::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::kfs::agent::AgentPool;
use crate::kfs::balloc::BlockAlloc;
use crate::kfs::ialloc::InodeAlloc;
use crate::kfs::ioctl::{Cred, SysInfo};
use crate::kfs::lease::LeaseState;
use crate::kfs::sinode::{ShadowInode, SinodeStore};
use crate::kfs::tgroup::{BitmapPage, TgroupTable};
use crate::kfs::vma::{mount_vaddr, MountVma, Prot};
use crate::layout::{is_norm_fidx, DirEntryHead, PmInode, DIR_ENTRY_BASE};
use crate::params::{
    APP_CHECK_COUNT, FILE_BLOCK_PAGE_CNT, FILE_BLOCK_SIZE, INODE_TOMBSTONE, LEASE_PERIOD,
    MAX_INODE_NUM, PAGE_SHIFT, PAGE_SIZE, READ_DELEGATION_LIMIT, RING_BYTES, ROOT_INO, ROOT_PERM,
    WRITE_DELEGATION_LIMIT,
};
use crate::pm::{PmArena, PmNodeInfo, PmOffset};
use crate::pmem;
use crate::ring_buffer::{
    ring_channel, DelegationRequest, Notifier, NotifierRegion, RingSender, REQUEST_CLEAR,
};
use crate::stat::FileType;

/// Nominal on-media footprint of one shadow-inode record, used to size the
/// head-reserved region.
const SINODE_MEDIA_BYTES: usize = 64;

#[derive(Clone)]
pub struct KfsConfig {
    /// Byte size of each PM node; one node per socket.
    pub pm_node_sizes: Vec<usize>,
    pub sockets: usize,
    pub cpus_per_socket: usize,
    /// 0 disables delegation entirely.
    pub dele_threads_per_socket: usize,
    pub write_delegation_limit: usize,
    pub read_delegation_limit: usize,
    pub lease_period: u64,
}

impl Default for KfsConfig {
    fn default() -> KfsConfig {
        KfsConfig {
            pm_node_sizes: vec![256 * 1024 * 1024],
            sockets: 1,
            cpus_per_socket: 8,
            dele_threads_per_socket: 0,
            write_delegation_limit: WRITE_DELEGATION_LIMIT,
            read_delegation_limit: READ_DELEGATION_LIMIT,
            lease_period: LEASE_PERIOD,
        }
    }
}

/// Everything a mounted client shares with the supervisor: the arena view
/// plus its group's ring pages. Models the fixed-address region the mount
/// command installs.
pub struct ClientBundle {
    pub arena: Arc<PmArena>,
    pub tgid: u8,
    pub lease_ring: Arc<BitmapPage>,
    pub map_ring: Arc<BitmapPage>,
    pub notifiers: Arc<NotifierRegion>,
    /// node-major ring senders, `dele_ring_per_node` per node.
    pub rings: Vec<RingSender>,
    pub pm_nodes: Vec<PmNodeInfo>,
    pub sockets: usize,
    pub cpus_per_socket: usize,
    pub dele_ring_per_node: usize,
    pub write_delegation_limit: usize,
    pub read_delegation_limit: usize,
}

pub struct Kfs {
    arena: Arc<PmArena>,
    sockets: usize,
    cpus_per_socket: usize,
    dele_ring_per_node: usize,
    write_delegation_limit: usize,
    read_delegation_limit: usize,
    lease_period: u64,
    head_reserved_blocks: u64,
    balloc: BlockAlloc,
    ialloc: InodeAlloc,
    sinodes: SinodeStore,
    tgroups: TgroupTable,
    ring_senders: Vec<RingSender>,
    notifiers: Arc<NotifierRegion>,
    agents: Mutex<Option<AgentPool>>,
}

impl Kfs {
    /// Format the arena and bring up pools, the root directory, and — when
    /// delegation threads are configured — rings and agents.
    pub fn new(cfg: KfsConfig) -> Result<Arc<Kfs>> {
        if cfg.sockets == 0 || cfg.cpus_per_socket == 0 {
            return Err(Error::InvalidArgument);
        }
        if cfg.pm_node_sizes.len() > cfg.sockets {
            return Err(Error::InvalidArgument);
        }
        let arena = Arc::new(PmArena::new(&cfg.pm_node_sizes)?);
        let cpus = cfg.sockets * cfg.cpus_per_socket;

        let head_reserved_blocks =
            ((MAX_INODE_NUM * SINODE_MEDIA_BYTES) >> PAGE_SHIFT) as u64 + 2;
        let balloc = BlockAlloc::new(arena.nodes(), cpus, 0, head_reserved_blocks);
        let ialloc = InodeAlloc::new(cpus);
        let sinodes = SinodeStore::new();
        let tgroups = TgroupTable::new();

        arena.format_super();

        // The page just below the data region holds the root directory.
        let root_block = head_reserved_blocks - 1;
        let root_off = PmOffset::from_block(root_block);
        // SAFETY: the head-reserved region is mapped and owned by the
        // supervisor; nothing else references it yet.
        unsafe { pmem::memset_nt(arena.at::<u8>(root_off), PAGE_SIZE) };
        pmem::sfence();
        sinodes.set_inode(ROOT_INO, FileType::Directory, ROOT_PERM, 0, 0, root_off)?;

        let notifiers = Arc::new(NotifierRegion::new());
        let mut ring_senders = Vec::new();
        let mut receivers = Vec::new();
        if cfg.dele_threads_per_socket > 0 {
            for node in 0..arena.nodes().len() {
                for t in 0..cfg.dele_threads_per_socket {
                    let (tx, rx) = ring_channel(RING_BYTES);
                    ring_senders.push(tx);
                    receivers.push((node, t, rx));
                }
            }
        }

        let kfs = Kfs {
            arena: arena.clone(),
            sockets: cfg.sockets,
            cpus_per_socket: cfg.cpus_per_socket,
            dele_ring_per_node: cfg.dele_threads_per_socket,
            write_delegation_limit: cfg.write_delegation_limit,
            read_delegation_limit: cfg.read_delegation_limit,
            lease_period: cfg.lease_period,
            head_reserved_blocks,
            balloc,
            ialloc,
            sinodes,
            tgroups,
            ring_senders,
            notifiers: notifiers.clone(),
            agents: Mutex::new(None),
        };

        if !receivers.is_empty() {
            let pool = AgentPool::spawn(arena, notifiers, receivers, cfg.cpus_per_socket);
            *kfs.agents.lock() = Some(pool);
        }

        Ok(Arc::new(kfs))
    }

    pub fn arena(&self) -> &Arc<PmArena> {
        &self.arena
    }

    pub fn cpus(&self) -> usize {
        self.sockets * self.cpus_per_socket
    }

    pub fn delegation(&self) -> bool {
        self.dele_ring_per_node > 0
    }

    pub fn head_reserved_blocks(&self) -> u64 {
        self.head_reserved_blocks
    }

    pub fn sys_info(&self) -> SysInfo {
        SysInfo {
            pm_nodes: self.arena.nodes().to_vec(),
            sockets: self.sockets,
            cpus_per_socket: self.cpus_per_socket,
            dele_ring_per_node: self.dele_ring_per_node,
        }
    }

    fn tgid_of(&self, cred: &Cred) -> Result<u8> {
        self.tgroups.pid_to_tgid(cred.pid, false)
    }

    // ---- mount / umount ----------------------------------------------

    /// Join (or create) the caller's trust group and reserve its window.
    pub fn mount(&self, cred: &Cred) -> Result<()> {
        let tgid = self.tgroups.pid_to_tgid(cred.pid, true)?;
        if self.tgroups.vma(tgid).is_none() {
            self.tgroups.set_vma(tgid, Some(Arc::new(MountVma::new())))?;
        }
        Ok(())
    }

    /// Shared state handed to a mounted client.
    pub fn client_bundle(&self, cred: &Cred) -> Result<ClientBundle> {
        let tgid = self.tgid_of(cred)?;
        let lease_ring = self.tgroups.lease_ring(tgid).ok_or(Error::NoDevice)?;
        let map_ring = self.tgroups.map_ring(tgid).ok_or(Error::NoDevice)?;
        Ok(ClientBundle {
            arena: self.arena.clone(),
            tgid,
            lease_ring,
            map_ring,
            notifiers: self.notifiers.clone(),
            rings: self.ring_senders.clone(),
            pm_nodes: self.arena.nodes().to_vec(),
            sockets: self.sockets,
            cpus_per_socket: self.cpus_per_socket,
            dele_ring_per_node: self.dele_ring_per_node,
            write_delegation_limit: self.write_delegation_limit,
            read_delegation_limit: self.read_delegation_limit,
        })
    }

    pub fn umount(&self, cred: &Cred, _mount_addr: u64) -> Result<()> {
        let tgid = self.tgid_of(cred)?;
        if let Some(vma) = self.tgroups.vma(tgid) {
            vma.clear();
        }
        self.tgroups.leave(cred.pid)
    }

    // ---- map / unmap -------------------------------------------------

    /// Simplified permission derivation: owner, then group, then other.
    /// A request for write on a read-only file degrades to a read mapping.
    fn access_perm(meta_mode: u32, uid: u32, gid: u32, writable: bool, cred: &Cred) -> Prot {
        let mut ret = Prot::empty();
        let (r, w) = if uid == cred.uid {
            (0o400, 0o200)
        } else if gid == cred.gid {
            (0o040, 0o020)
        } else {
            (0o004, 0o002)
        };
        if meta_mode & r != 0 {
            ret |= Prot::READ;
            if writable && meta_mode & w != 0 {
                ret |= Prot::WRITE;
            }
        }
        if ret.is_empty() {
            ret
        } else {
            ret | Prot::SHARED
        }
    }

    /// Walk a file index: the head index page, then each extent, chaining
    /// through reserved slots. The callback receives
    /// `(offset, page_count, is_index_page)`.
    fn walk_index<F: FnMut(PmOffset, u64, bool)>(&self, index_off: PmOffset, mut f: F) {
        if index_off.is_null() {
            return;
        }
        f(index_off, 1, true);
        let mut slot = index_off;
        loop {
            // SAFETY: slots are 8-byte words inside mapped index pages.
            let val = unsafe { *self.arena.at::<u64>(slot) };
            if val == 0 {
                break;
            }
            if is_norm_fidx(slot) {
                f(PmOffset(val), FILE_BLOCK_PAGE_CNT as u64, false);
                slot = slot.add(8);
            } else {
                f(PmOffset(val), 1, true);
                slot = PmOffset(val);
            }
        }
    }

    /// Acquire the lease and install every indexed page of `ino` in the
    /// caller's window. Returns the index offset for the client mirror.
    pub fn map_file(&self, cred: &Cred, ino: u32, writable: bool) -> Result<u64> {
        let tgid = self.tgid_of(cred).map_err(|_| Error::NoDevice)?;
        let vma = self.tgroups.vma(tgid).ok_or(Error::NoDevice)?;
        let si = self.sinodes.get(ino)?;

        let (mode, uid, gid, index_off, ftype) = {
            let m = si.meta.lock();
            (m.mode, m.uid, m.gid, m.index_offset, m.file_type)
        };
        let perm = Kfs::access_perm(mode, uid, gid, writable, cred);
        if perm.is_empty() {
            log::warn!(
                "no access to ino {} for uid {} gid {} (mode {:o})",
                ino,
                cred.uid,
                cred.gid,
                mode
            );
            return Err(Error::Permission);
        }

        if writable {
            si.lease
                .acquire_write(ino, tgid, &self.tgroups, self.lease_period)?;
        } else {
            si.lease
                .acquire_read(ino, tgid, &self.tgroups, self.lease_period)?;
        }

        self.walk_index(index_off, |off, pages, _| {
            vma.install(mount_vaddr(off), off.block(), perm, pages);
        });

        if let Some(ring) = self.tgroups.map_ring(tgid) {
            ring.set(ino);
        }

        // A directory handed to a (possibly new) owner refreshes the
        // shadow array from its entries, so children created by the
        // previous owner become mappable.
        if ftype == FileType::Directory {
            self.dir_update_sinodes(si);
        }
        Ok(index_off.0)
    }

    /// Release the lease, zap the installed range, and — for directories —
    /// commit the embedded inodes of every live entry to the shadow array.
    pub fn unmap_file(&self, cred: &Cred, ino: u32) -> Result<()> {
        let tgid = self.tgid_of(cred).map_err(|_| Error::NoDevice)?;
        let vma = self.tgroups.vma(tgid).ok_or(Error::NoDevice)?;
        let si = self.sinodes.get(ino)?;

        si.lease.release(ino, tgid)?;

        let (ftype, index_off) = {
            let m = si.meta.lock();
            (m.file_type, m.index_offset)
        };
        self.walk_index(index_off, |off, pages, _| {
            vma.zap(mount_vaddr(off), pages << PAGE_SHIFT);
        });

        if let Some(ring) = self.tgroups.map_ring(tgid) {
            ring.clear(ino);
        }

        if ftype == FileType::Directory {
            self.dir_update_sinodes(si);
        }
        Ok(())
    }

    /// Rescan a directory's blocks and refresh the shadow array from each
    /// live entry's embedded inode.
    fn dir_update_sinodes(&self, si: &ShadowInode) {
        let index_off = si.meta.lock().index_offset;
        self.walk_index(index_off, |off, _, is_index| {
            if is_index {
                return;
            }
            let mut pos = 0u64;
            while pos + DIR_ENTRY_BASE as u64 <= FILE_BLOCK_SIZE as u64 {
                let de = off.add(pos);
                // SAFETY: entries inside a directory block the caller had
                // mapped; the name_len sentinel bounds the walk.
                let head = unsafe { &*self.arena.at::<DirEntryHead>(de) };
                if head.name_len == 0 {
                    break;
                }
                if head.ino_num != INODE_TOMBSTONE {
                    let _ = self.sinodes.set_inode(
                        head.ino_num,
                        FileType::from_raw(head.inode.file_type),
                        head.inode.mode,
                        head.inode.uid,
                        head.inode.gid,
                        PmOffset(head.inode.offset),
                    );
                }
                let rec = head.rec_len as u64;
                if rec == 0 {
                    break;
                }
                pos += rec;
            }
        });
    }

    // ---- allocation --------------------------------------------------

    pub fn alloc_inodes(&self, num: u32, cpu: usize) -> Result<(u32, u32)> {
        self.ialloc.alloc(num, cpu)
    }

    pub fn free_inodes(&self, ino: u32, num: u32) -> Result<()> {
        self.ialloc.free(ino, num)
    }

    /// Allocate, zero, and install blocks in the caller's window.
    pub fn alloc_blocks(
        &self,
        cred: &Cred,
        num: u64,
        cpu: usize,
        pm_node: usize,
    ) -> Result<(u64, u64)> {
        let tgid = self.tgid_of(cred).map_err(|_| Error::NoDevice)?;
        let vma = self.tgroups.vma(tgid).ok_or(Error::NoDevice)?;

        let block = self.balloc.alloc(num, cpu, pm_node)?;
        self.zero_blocks(block, num);

        let off = PmOffset::from_block(block);
        vma.install(
            mount_vaddr(off),
            block,
            Prot::READ | Prot::WRITE | Prot::SHARED,
            num,
        );
        Ok((block, num))
    }

    /// Zap and return a block range.
    pub fn free_blocks(&self, cred: &Cred, block: u64, num: u64) -> Result<()> {
        let tgid = self.tgid_of(cred).map_err(|_| Error::NoDevice)?;
        if let Some(vma) = self.tgroups.vma(tgid) {
            vma.zap(mount_vaddr(PmOffset::from_block(block)), num << PAGE_SHIFT);
        }
        self.balloc.free(block, num)
    }

    /// Zero freshly allocated blocks: directly below the delegation
    /// threshold, through a Clear request above it.
    fn zero_blocks(&self, block: u64, num: u64) {
        let bytes = (num as usize) << PAGE_SHIFT;
        if self.delegation() && bytes >= self.write_delegation_limit {
            let node = self.arena.block_to_pm_node(block);
            let done = Box::new(Notifier::new());
            let mut req = DelegationRequest::new(REQUEST_CLEAR);
            req.zero = 1;
            req.flush_cache = 1;
            req.offset = PmOffset::from_block(block).0;
            req.bytes = bytes as u64;
            req.notify_ptr = &*done as *const Notifier as u64;

            loop {
                let t = pmem::xor_random() as usize % self.dele_ring_per_node;
                let ring = &self.ring_senders[node * self.dele_ring_per_node + t];
                if ring.send(&req).is_ok() {
                    break;
                }
            }
            let mut spins: u64 = 0;
            while done.completed() < 1 {
                spins += 1;
                if spins >= APP_CHECK_COUNT {
                    pmem::cond_resched();
                    spins = 0;
                }
            }
        } else {
            for i in 0..num {
                let off = PmOffset::from_block(block + i);
                // SAFETY: a just-allocated range no one else references.
                unsafe { pmem::memset_nt(self.arena.at::<u8>(off), PAGE_SIZE) };
            }
            pmem::sfence();
        }
    }

    // ---- metadata ----------------------------------------------------

    /// Root only.
    pub fn chown(
        &self,
        cred: &Cred,
        ino: u32,
        owner: i32,
        group: i32,
        inode_offset: u64,
    ) -> Result<()> {
        if cred.uid != 0 {
            return Err(Error::Permission);
        }
        let si = self.sinodes.get(ino)?;
        let mut m = si.meta.lock();
        if owner > 0 {
            m.uid = owner as u32;
        }
        if group > 0 {
            m.gid = group as u32;
        }
        drop(m);
        self.update_pm_inode(inode_offset, |ino| {
            if owner > 0 {
                ino.uid = owner as u32;
            }
            if group > 0 {
                ino.gid = group as u32;
            }
        })
    }

    /// Root or the file's owner.
    pub fn chmod(&self, cred: &Cred, ino: u32, mode: u32, inode_offset: u64) -> Result<()> {
        let si = self.sinodes.get(ino)?;
        {
            let m = si.meta.lock();
            if cred.uid != 0 && m.uid != cred.uid {
                return Err(Error::Permission);
            }
        }
        si.meta.lock().mode = mode;
        self.update_pm_inode(inode_offset, |ino| ino.mode = mode)
    }

    fn update_pm_inode<F: FnOnce(&mut PmInode)>(&self, inode_offset: u64, f: F) -> Result<()> {
        if inode_offset == 0 {
            return Ok(());
        }
        let off = PmOffset(inode_offset);
        if !self.arena.contains(off, core::mem::size_of::<PmInode>()) || off.0 % 8 != 0 {
            return Err(Error::InvalidArgument);
        }
        // SAFETY: bounds-checked offset; the caller holds the lease that
        // serializes metadata writes to this inode.
        let inode = unsafe { &mut *self.arena.at::<PmInode>(off) };
        f(inode);
        pmem::clwb_buffer(inode as *const PmInode as *const u8, core::mem::size_of::<PmInode>());
        pmem::sfence();
        Ok(())
    }

    // ---- introspection (tests and diagnostics) -----------------------

    pub fn lease_state(&self, ino: u32) -> LeaseState {
        self.sinodes
            .get(ino)
            .map(|si| si.lease.state())
            .unwrap_or(LeaseState::Unowned)
    }

    pub fn lease_owners(&self, ino: u32) -> Vec<u8> {
        self.sinodes
            .get(ino)
            .map(|si| si.lease.owner_tgids())
            .unwrap_or_default()
    }

    pub fn shadow_type(&self, ino: u32) -> FileType {
        self.sinodes
            .get(ino)
            .map(|si| si.meta.lock().file_type)
            .unwrap_or(FileType::None)
    }

    pub fn map_ring_test(&self, tgid: u8, ino: u32) -> bool {
        self.tgroups
            .map_ring(tgid)
            .map(|r| r.test(ino))
            .unwrap_or(false)
    }

    pub fn free_blocks_on(&self, cpu: usize, pm_node: usize) -> u64 {
        self.balloc.free_blocks_on(cpu, pm_node)
    }

    pub fn count_free_blocks(&self) -> u64 {
        self.balloc.count_free()
    }

    pub fn block_to_cpu_node(&self, block: u64) -> (usize, usize) {
        self.balloc.block_to_cpu_node(block)
    }

    pub fn renew_lease(&self, cred: &Cred, ino: u32) -> Result<()> {
        let tgid = self.tgid_of(cred)?;
        self.sinodes.get(ino)?.lease.renew(tgid)
    }

    pub fn tgid_of_pid(&self, pid: u32) -> Result<u8> {
        self.tgroups.pid_to_tgid(pid, false)
    }
}

impl Drop for Kfs {
    fn drop(&mut self) {
        if let Some(mut pool) = self.agents.lock().take() {
            pool.shutdown();
        }
    }
}
