//! Per-process descriptor table. Descriptors are per-CPU namespaces glued
//! into one integer as `(cpu << SHIFT) | slot`, so uncontended allocation
//! stays CPU-local.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::libfs::mnode::Mnode;
use crate::params::{FILETABLE_CPUSHIFT, FILETABLE_FDMASK, MAX_FD};
use crate::pmem;

/// One open file: the mnode plus this descriptor's cursor and modes.
pub struct FileHandle {
    pub m: Arc<Mnode>,
    pub off: AtomicU64,
    pub readable: bool,
    pub writable: bool,
    pub append: bool,
}

impl FileHandle {
    pub fn new(m: Arc<Mnode>, readable: bool, writable: bool, append: bool) -> Arc<FileHandle> {
        Arc::new(FileHandle {
            m,
            off: AtomicU64::new(0),
            readable,
            writable,
            append,
        })
    }
}

pub struct FileTable {
    slots: Vec<Vec<Mutex<Option<Arc<FileHandle>>>>>,
    cloexec: Vec<Vec<AtomicBool>>,
    cpus: usize,
}

impl FileTable {
    pub fn new(cpus: usize) -> FileTable {
        let slots = (0..cpus)
            .map(|_| (0..MAX_FD).map(|_| Mutex::new(None)).collect())
            .collect();
        let cloexec = (0..cpus)
            .map(|_| (0..MAX_FD).map(|_| AtomicBool::new(true)).collect())
            .collect();
        FileTable {
            slots,
            cloexec,
            cpus,
        }
    }

    fn split(&self, fd: i32) -> Option<(usize, usize)> {
        if fd < 0 {
            return None;
        }
        let cpu = (fd >> FILETABLE_CPUSHIFT) as usize;
        let slot = (fd & FILETABLE_FDMASK) as usize;
        if cpu >= self.cpus || slot >= MAX_FD {
            return None;
        }
        Some((cpu, slot))
    }

    /// Allocate a descriptor for `f`; `percpu` starts the scan on the
    /// caller's CPU namespace.
    pub fn alloc_fd(&self, f: Arc<FileHandle>, percpu: bool, cloexec: bool) -> i32 {
        let cpu = if percpu {
            pmem::current_cpu() % self.cpus
        } else {
            0
        };
        for slot in 0..MAX_FD {
            let mut g = self.slots[cpu][slot].lock();
            if g.is_none() {
                *g = Some(f);
                if !cloexec {
                    self.cloexec[cpu][slot].store(false, Ordering::Release);
                }
                return ((cpu << FILETABLE_CPUSHIFT) as i32) | slot as i32;
            }
        }
        log::warn!("descriptor table full on cpu {}", cpu);
        -1
    }

    pub fn get_file(&self, fd: i32) -> Option<Arc<FileHandle>> {
        let (cpu, slot) = self.split(fd)?;
        self.slots[cpu][slot].lock().clone()
    }

    /// Drop the descriptor, returning the handle for teardown.
    pub fn close(&self, fd: i32) -> Option<Arc<FileHandle>> {
        let (cpu, slot) = self.split(fd)?;
        let f = self.slots[cpu][slot].lock().take();
        self.cloexec[cpu][slot].store(true, Ordering::Release);
        f
    }
}
