//! The client library: everything an application links to run the common
//! paths in user space over the mapped arena.

pub mod balloc;
pub mod chainhash;
pub mod cmd;
pub mod delegation;
pub mod filetable;
pub mod ialloc;
pub mod journal;
pub mod mfs;
pub mod mnode;
pub mod proc;
pub mod syscall;
pub mod tls;

use core::sync::atomic::Ordering;
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::error::Result;
use crate::kfs::{BitmapPage, Cred, Kfs};
use crate::layout::PmInode;
use crate::libfs::balloc::ClientBlockAlloc;
use crate::libfs::chainhash::ChainHash;
use crate::libfs::cmd::Dev;
use crate::libfs::ialloc::ClientInodeAlloc;
use crate::libfs::journal::Journal;
use crate::libfs::mnode::{InodeRef, Mnode};
use crate::libfs::proc::Proc;
use crate::params::{
    BLOCK_CHUNK, FILE_MAP_LOCK_SIZE, GDIR_INIT_HASH_IDX, MAX_INODE_NUM, ROOT_INO, ROOT_PERM,
};
use crate::pm::{PmArena, PmNodeInfo, PmOffset, ReplayPolicy};
use crate::pmem;
use crate::ring_buffer::{NotifierRegion, RingSender};
use crate::stat::FileType;

/// Environment knobs recognized at client start.
#[derive(Debug, Clone)]
pub struct ClientOpts {
    pub alloc_cpu: Option<usize>,
    pub alloc_numa: Option<usize>,
    /// Pages per supervisor block refill.
    pub init_alloc_size: u64,
    pub alloc_pin_cpu: bool,
    /// Paths mapped and indexed at startup.
    pub preload_files: Vec<String>,
}

impl ClientOpts {
    pub fn from_env() -> ClientOpts {
        fn num(name: &str) -> Option<u64> {
            std::env::var(name).ok()?.parse().ok()
        }
        ClientOpts {
            alloc_cpu: num("alloc_cpu").map(|v| v as usize),
            alloc_numa: num("alloc_numa").map(|v| v as usize),
            init_alloc_size: num("init_alloc_size").unwrap_or(BLOCK_CHUNK as u64),
            alloc_pin_cpu: num("alloc_pin_cpu").unwrap_or(0) != 0,
            preload_files: std::env::var("preload_file")
                .map(|v| {
                    v.split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn default_opts() -> ClientOpts {
        ClientOpts {
            alloc_cpu: None,
            alloc_numa: None,
            init_alloc_size: BLOCK_CHUNK as u64,
            alloc_pin_cpu: false,
            preload_files: Vec::new(),
        }
    }
}

pub struct LibFs {
    dev: Dev,
    arena: Arc<PmArena>,
    tgid: u8,
    lease_ring: Arc<BitmapPage>,
    map_ring: Arc<BitmapPage>,
    notifiers: Arc<NotifierRegion>,
    rings: Vec<RingSender>,
    pm_nodes: Vec<PmNodeInfo>,
    sockets: usize,
    cpus_per_socket: usize,
    dele_ring_per_node: usize,
    write_delegation_limit: usize,
    read_delegation_limit: usize,

    pub balloc: ClientBlockAlloc,
    pub ialloc: ClientInodeAlloc,
    pub journal: Journal,
    /// Full path -> (ino, dir entry).
    pub dir_map: ChainHash,

    mnodes: Vec<RwLock<Option<Arc<Mnode>>>>,
    root: Arc<Mnode>,

    /// Mapped read-write.
    mapped_attr: BitmapPage,
    /// Ever mapped by this client (the unmount sweep list is separate).
    has_mapped: BitmapPage,
    /// Index mirror built.
    has_index: BitmapPage,
    mapped_registry: Mutex<Vec<u32>>,
    map_locks: Vec<Mutex<()>>,

    opts: ClientOpts,
}

impl LibFs {
    /// Mount with options from the environment.
    pub fn mount(kfs: &Arc<Kfs>, cred: Cred) -> Result<Arc<LibFs>> {
        LibFs::mount_with(kfs, cred, ClientOpts::from_env())
    }

    pub fn mount_with(kfs: &Arc<Kfs>, cred: Cred, opts: ClientOpts) -> Result<Arc<LibFs>> {
        let dev = Dev::new(kfs.clone(), cred);
        dev.mount()?;
        let bundle = dev.bundle()?;
        let (pm_nodes, sockets, cpus_per_socket, dele_ring_per_node) = dev.sys_info()?;
        let cpus = sockets * cpus_per_socket;

        if opts.alloc_pin_cpu {
            if let Some(cpu) = opts.alloc_cpu {
                pmem::pin_to_cpu(cpu);
            }
        }

        let balloc = ClientBlockAlloc::new(
            bundle.arena.clone(),
            pm_nodes.clone(),
            cpus,
            opts.init_alloc_size,
        );
        let ialloc = ClientInodeAlloc::new(cpus);

        // Claim or adopt the persistent journal area, then replay any
        // window a dead client left open.
        let journal_base = {
            let sp = bundle.arena.super_page();
            loop {
                let cur = sp.journal_off().load(Ordering::Acquire);
                if cur == 0 {
                    if sp
                        .journal_off()
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let base = journal::hard_init(
                            &dev,
                            &bundle.arena,
                            cpus,
                            cpus_per_socket,
                            pm_nodes.len(),
                        )?;
                        sp.journal_off().store(base.0, Ordering::Release);
                        break base;
                    }
                } else if cur == 1 {
                    // Another client is laying it out.
                    core::hint::spin_loop();
                } else {
                    break PmOffset(cur);
                }
            }
        };
        let journal = Journal::new(bundle.arena.clone(), journal_base, cpus);
        if bundle.arena.super_page().replay_policy() == ReplayPolicy::Undo {
            journal.recover();
        } else {
            log::warn!("redo replay requested by the super page; not produced here");
            journal.recover();
        }

        let root = Mnode::new(
            FileType::Directory,
            ROOT_INO,
            ROOT_INO,
            InodeRef::Dram(Mutex::new(PmInode::init(
                FileType::Directory,
                ROOT_PERM,
                0,
                0,
                0,
            ))),
        );

        let mnodes = (0..MAX_INODE_NUM).map(|_| RwLock::new(None)).collect();
        let map_locks = (0..FILE_MAP_LOCK_SIZE).map(|_| Mutex::new(())).collect();

        let fs = Arc::new(LibFs {
            dev,
            arena: bundle.arena.clone(),
            tgid: bundle.tgid,
            lease_ring: bundle.lease_ring,
            map_ring: bundle.map_ring,
            notifiers: bundle.notifiers,
            rings: bundle.rings,
            pm_nodes,
            sockets,
            cpus_per_socket,
            dele_ring_per_node,
            write_delegation_limit: bundle.write_delegation_limit,
            read_delegation_limit: bundle.read_delegation_limit,
            balloc,
            ialloc,
            journal,
            dir_map: ChainHash::new(GDIR_INIT_HASH_IDX),
            mnodes,
            root: root.clone(),
            mapped_attr: BitmapPage::new(),
            has_mapped: BitmapPage::new(),
            has_index: BitmapPage::new(),
            mapped_registry: Mutex::new(Vec::new()),
            map_locks,
            opts,
        });

        fs.mnode_set(ROOT_INO, Some(root));
        let _ = fs.dir_map.insert(b"/", ROOT_INO as u64, 0);

        for path in fs.opts.preload_files.clone() {
            match mfs::namei(&fs, &path) {
                Some(m) if m.typ == FileType::Regular => {
                    let _ = mfs::map_file(&fs, &m, false, None);
                }
                Some(_) => {}
                None => log::warn!("preload path {} not found", path),
            }
        }

        Ok(fs)
    }

    /// Tear the client down: drop every mapping the ring still records,
    /// then hand unused inode and block chunks back.
    pub fn unmount(&self) {
        mfs::unmap_mapped_inodes(self);
        self.ialloc.return_all(&self.dev);
        self.balloc.return_all(&self.dev);
        if let Err(e) = self.dev.umount() {
            log::warn!("umount failed: {}", e);
        }
    }

    pub fn proc(self: &Arc<LibFs>) -> Proc {
        Proc::new(self.clone(), self.dev.cred)
    }

    pub fn proc_with(self: &Arc<LibFs>, cred: Cred) -> Proc {
        Proc::new(self.clone(), cred)
    }

    // ---- plumbing ----------------------------------------------------

    pub fn arena(&self) -> &Arc<PmArena> {
        &self.arena
    }

    pub fn dev(&self) -> &Dev {
        &self.dev
    }

    pub fn tgid(&self) -> u8 {
        self.tgid
    }

    pub fn root(&self) -> Arc<Mnode> {
        self.root.clone()
    }

    pub fn cpus(&self) -> usize {
        self.sockets * self.cpus_per_socket
    }

    pub fn current_cpu(&self) -> usize {
        pmem::current_cpu() % self.cpus()
    }

    pub fn journal_cpu(&self) -> usize {
        self.journal.cpu_of(self.current_cpu())
    }

    pub fn alloc_cpu(&self) -> usize {
        self.opts.alloc_cpu.unwrap_or_else(|| self.current_cpu()) % self.cpus()
    }

    fn alloc_node(&self, cpu: usize) -> usize {
        self.opts
            .alloc_numa
            .unwrap_or(cpu / self.cpus_per_socket)
            .min(self.pm_nodes.len() - 1)
    }

    pub fn mnode_get(&self, ino: u32) -> Option<Arc<Mnode>> {
        self.mnodes.get(ino as usize)?.read().clone()
    }

    pub fn mnode_set(&self, ino: u32, m: Option<Arc<Mnode>>) {
        if let Some(slot) = self.mnodes.get(ino as usize) {
            *slot.write() = m;
        }
    }

    /// Allocate zero-or-not file pages near the configured CPU and node.
    pub fn new_file_data_blocks(&self, pages: u64, zero: bool) -> Result<u64> {
        let cpu = self.alloc_cpu();
        let node = self.alloc_node(cpu);
        self.balloc.alloc(&self.dev, pages, cpu, node, zero)
    }

    /// Freed file pages land back on the allocating CPU's list.
    pub fn free_data_blocks(&self, block: u64, pages: u64) {
        if let Err(e) = self.balloc.free(block, pages, self.alloc_cpu()) {
            log::warn!("freeing blocks [{}, +{}) failed: {}", block, pages, e);
        }
    }

    pub fn delegation(&self) -> bool {
        self.dele_ring_per_node > 0 && !self.rings.is_empty()
    }

    pub fn dele_ring_per_node(&self) -> usize {
        self.dele_ring_per_node
    }

    pub fn ring(&self, pm_node: usize, thread: usize) -> &RingSender {
        &self.rings[pm_node * self.dele_ring_per_node + thread]
    }

    pub fn notifiers(&self) -> &NotifierRegion {
        &self.notifiers
    }

    pub fn pm_node_count(&self) -> usize {
        self.pm_nodes.len()
    }

    pub fn node_of_block(&self, block: u64) -> usize {
        self.balloc.node_of(block)
    }

    pub fn write_delegation_limit(&self) -> usize {
        self.write_delegation_limit
    }

    pub fn read_delegation_limit(&self) -> usize {
        self.read_delegation_limit
    }

    pub fn map_ring(&self) -> &BitmapPage {
        &self.map_ring
    }

    pub fn mapped_attr(&self) -> &BitmapPage {
        &self.mapped_attr
    }

    pub fn has_index(&self) -> &BitmapPage {
        &self.has_index
    }

    pub fn map_lock(&self, ino: u32) -> &Mutex<()> {
        &self.map_locks[ino as usize % FILE_MAP_LOCK_SIZE]
    }

    /// Record an inode for the unmount sweep, once.
    pub fn note_mapped(&self, ino: u32) {
        if self.has_mapped.test(ino) {
            return;
        }
        let mut reg = self.mapped_registry.lock();
        if !self.has_mapped.test(ino) {
            if reg.len() >= crate::params::MAX_MAP_FILE {
                log::warn!("mapped-inode registry full; ino {} not tracked", ino);
                return;
            }
            self.has_mapped.set(ino);
            reg.push(ino);
        }
    }

    pub fn mapped_inodes(&self) -> Vec<u32> {
        self.mapped_registry.lock().clone()
    }

    /// The caller is entering a lease-holding critical section on `ino`;
    /// the supervisor treats the set bit as proof of liveness.
    pub fn enter_cs(&self, ino: u32) {
        self.lease_ring.set(ino);
    }

    pub fn exit_cs(&self, ino: u32) {
        self.lease_ring.clear(ino);
    }
}
