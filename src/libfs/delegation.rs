//! The client send side of the delegation transport.
//!
//! A bulk copy is split per extent and posted to a randomly chosen ring of
//! the owning PM node; the issuer counts what it sent per node and joins by
//! polling its per-thread completion counters.

use crate::libfs::LibFs;
use crate::params::{APP_CHECK_COUNT, PM_MAX_INS};
use crate::pm::PmOffset;
use crate::pmem;
use crate::ring_buffer::{DelegationRequest, REQUEST_READ, REQUEST_WRITE};

pub type IssuedCounts = [i64; PM_MAX_INS];

/// Clear this thread's completion counters before a batch.
pub fn reset_counters(fs: &LibFs, notify_idx: usize, level: usize) {
    for node in 0..fs.pm_node_count() {
        fs.notifiers().slot(notify_idx, level, node).reset();
    }
}

fn send(fs: &LibFs, req: &DelegationRequest, pm_node: usize) {
    loop {
        let t = pmem::xor_random() as usize % fs.dele_ring_per_node();
        if fs.ring(pm_node, t).send(req).is_ok() {
            return;
        }
        // Ring full; retry another ring of the same node.
        core::hint::spin_loop();
    }
}

pub fn do_read_delegation(
    fs: &LibFs,
    uaddr: u64,
    offset: PmOffset,
    bytes: u64,
    zero: bool,
    issued: &mut IssuedCounts,
    notify_idx: usize,
    level: usize,
) {
    let pm_node = fs.node_of_block(offset.block());
    issued[pm_node] += 1;

    let mut req = DelegationRequest::new(REQUEST_READ);
    req.zero = zero as i32;
    req.uaddr = uaddr;
    req.offset = offset.0;
    req.bytes = bytes;
    req.notify_idx = notify_idx as i32;
    req.level = level as i32;
    send(fs, &req, pm_node);
}

pub fn do_write_delegation(
    fs: &LibFs,
    uaddr: u64,
    offset: PmOffset,
    bytes: u64,
    zero: bool,
    flush_cache: bool,
    do_sfence: bool,
    issued: &mut IssuedCounts,
    notify_idx: usize,
    level: usize,
) {
    let pm_node = fs.node_of_block(offset.block());
    issued[pm_node] += 1;

    let mut req = DelegationRequest::new(REQUEST_WRITE);
    req.zero = zero as i32;
    req.flush_cache = flush_cache as i32;
    req.sfence = do_sfence as i32;
    req.uaddr = uaddr;
    req.offset = offset.0;
    req.bytes = bytes;
    req.notify_idx = notify_idx as i32;
    req.level = level as i32;
    send(fs, &req, pm_node);
}

/// Spin until every node's completions match what this thread issued,
/// yielding on a budget.
pub fn complete_delegation(fs: &LibFs, issued: &IssuedCounts, notify_idx: usize, level: usize) {
    for node in 0..fs.pm_node_count() {
        let target = issued[node];
        if target <= 0 {
            continue;
        }
        let n = fs.notifiers().slot(notify_idx, level, node);
        let mut spins: u64 = 0;
        while (n.completed() as i64) < target {
            spins += 1;
            if spins >= APP_CHECK_COUNT {
                pmem::cond_resched();
                spins = 0;
            }
        }
    }
}
