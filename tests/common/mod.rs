//! Shared setup for the scenario tests.
#![allow(dead_code)]

use std::sync::Arc;

use pmufs::kfs::{Cred, Kfs, KfsConfig};
use pmufs::libfs::{ClientOpts, LibFs};

pub fn cred(pid: u32) -> Cred {
    Cred {
        pid,
        uid: 0,
        gid: 0,
    }
}

/// One PM node, eight CPUs, no delegation.
pub fn small_cfg() -> KfsConfig {
    KfsConfig {
        pm_node_sizes: vec![256 * 1024 * 1024],
        sockets: 1,
        cpus_per_socket: 8,
        dele_threads_per_socket: 0,
        ..KfsConfig::default()
    }
}

/// Pin allocation to cpu 0 so per-list accounting is deterministic.
pub fn client_opts() -> ClientOpts {
    let mut opts = ClientOpts::default_opts();
    opts.alloc_cpu = Some(0);
    opts
}

pub fn mount(kfs: &Arc<Kfs>, pid: u32) -> Arc<LibFs> {
    LibFs::mount_with(kfs, cred(pid), client_opts()).expect("mount")
}
