//! Agents: per-socket worker threads pinned next to their PM node. Each
//! owns one delegation ring and performs the bulk memcpy/memset the
//! clients hand off. Agents allocate nothing, take no file-system locks,
//! and only ever touch the PM arena and the requesting buffer.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use arrayvec::ArrayVec;

use crate::params::{
    AGENT_REQUEST_CHECK_COUNT, AGENT_RING_CHECK_COUNT, AGENT_TASK_MAX, PAGE_SIZE,
};
use crate::pm::{PmArena, PmOffset};
use crate::pmem;
use crate::ring_buffer::{
    DelegationRequest, Notifier, NotifierRegion, RingReceiver, REQUEST_CLEAR, REQUEST_READ,
    REQUEST_WRITE,
};

/// Contiguous spans of the requesting buffer, split at page boundaries and
/// re-merged when translation keeps them adjacent.
fn user_chunks(uaddr: u64, bytes: u64) -> Option<ArrayVec<(u64, u64), AGENT_TASK_MAX>> {
    let mut tasks: ArrayVec<(u64, u64), AGENT_TASK_MAX> = ArrayVec::new();
    let mut pos = uaddr;
    let mut left = bytes;
    while left > 0 {
        let next_page = (pos & !(PAGE_SIZE as u64 - 1)) + PAGE_SIZE as u64;
        let size = core::cmp::min(next_page - pos, left);
        match tasks.last_mut() {
            Some(last) if last.0 + last.1 == pos => last.1 += size,
            _ => {
                if tasks.try_push((pos, size)).is_err() {
                    log::error!("agent task list overflow: {} bytes at {:#x}", bytes, uaddr);
                    return None;
                }
            }
        }
        pos += size;
        left -= size;
    }
    Some(tasks)
}

/// PM -> user copy, or a user-side clear when `zero` is set.
fn do_read_request(arena: &PmArena, req: &DelegationRequest) {
    let tasks = match user_chunks(req.uaddr, req.bytes) {
        Some(t) => t,
        None => return,
    };
    let mut kaddr: *const u8 = arena.at(PmOffset(req.offset));
    for (ua, sz) in tasks.iter() {
        // SAFETY: the issuer owns `[uaddr, uaddr + bytes)` for the duration
        // of the request and polls the notifier before reusing it; the PM
        // range is covered by the issuer's lease.
        unsafe {
            if req.zero != 0 {
                core::ptr::write_bytes(*ua as *mut u8, 0, *sz as usize);
            } else {
                core::ptr::copy_nonoverlapping(kaddr, *ua as *mut u8, *sz as usize);
                kaddr = kaddr.add(*sz as usize);
            }
        }
    }
}

/// user -> PM copy with optional cache writeback, or a non-temporal clear
/// of the PM range when `zero` is set.
fn do_write_request(arena: &PmArena, req: &DelegationRequest) {
    let dst: *mut u8 = arena.at(PmOffset(req.offset));
    if req.zero != 0 {
        // SAFETY: the PM range belongs to the issuer (allocator or lease).
        unsafe {
            if req.flush_cache != 0 {
                pmem::memset_nt(dst, req.bytes as usize);
            } else {
                core::ptr::write_bytes(dst, 0, req.bytes as usize);
            }
        }
        return;
    }

    let tasks = match user_chunks(req.uaddr, req.bytes) {
        Some(t) => t,
        None => return,
    };
    let mut kaddr = dst;
    for (ua, sz) in tasks.iter() {
        // SAFETY: as in `do_read_request`.
        unsafe {
            core::ptr::copy_nonoverlapping(*ua as *const u8, kaddr, *sz as usize);
            kaddr = kaddr.add(*sz as usize);
        }
    }
    if req.flush_cache != 0 {
        pmem::clwb_buffer(dst as *const u8, req.bytes as usize);
    }
}

fn serve(arena: &PmArena, notifiers: &NotifierRegion, req: &DelegationRequest, pm_node: usize) {
    match req.kind {
        REQUEST_READ => do_read_request(arena, req),
        REQUEST_WRITE => do_write_request(arena, req),
        REQUEST_CLEAR => do_write_request(arena, req),
        other => {
            log::error!("unknown delegation request type {}", other);
            return;
        }
    }

    // The completion increment happens-after the data and its writeback.
    pmem::sfence();
    if req.kind == REQUEST_CLEAR {
        // SAFETY: the supervisor issuer passed a pointer to a notifier it
        // keeps alive until the completion count matches.
        let n = unsafe { &*(req.notify_ptr as *const Notifier) };
        n.complete_one();
    } else {
        notifiers
            .slot(req.notify_idx as usize, req.level as usize, pm_node)
            .complete_one();
    }
}

fn agent_main(
    arena: Arc<PmArena>,
    notifiers: Arc<NotifierRegion>,
    mut rx: RingReceiver,
    pm_node: usize,
    target_cpu: usize,
    stop: Arc<AtomicBool>,
) {
    pmem::pin_to_cpu(target_cpu);
    let mut req = DelegationRequest::new(REQUEST_READ);
    let mut cond: u64 = 0;
    loop {
        if rx.recv(&mut req).is_err() {
            cond += 1;
            if cond >= AGENT_RING_CHECK_COUNT {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                pmem::cond_resched();
                cond = 0;
            }
            continue;
        }

        serve(&arena, &notifiers, &req, pm_node);

        cond += 1;
        if cond >= AGENT_REQUEST_CHECK_COUNT {
            if stop.load(Ordering::Acquire) {
                break;
            }
            pmem::cond_resched();
            cond = 0;
        }
    }
}

pub struct AgentPool {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl AgentPool {
    /// One thread per (pm_node, delegation slot), pinned to the first CPUs
    /// of the node's socket.
    pub fn spawn(
        arena: Arc<PmArena>,
        notifiers: Arc<NotifierRegion>,
        receivers: Vec<(usize, usize, RingReceiver)>,
        cpus_per_socket: usize,
    ) -> AgentPool {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(receivers.len());
        for (pm_node, thread, rx) in receivers {
            let target_cpu = pm_node * cpus_per_socket + thread;
            let arena = arena.clone();
            let notifiers = notifiers.clone();
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("pmufs-agent-{}-{}", pm_node, thread))
                .spawn(move || agent_main(arena, notifiers, rx, pm_node, target_cpu, stop))
                .expect("spawning an agent thread");
            handles.push(handle);
        }
        AgentPool { stop, handles }
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for AgentPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_merge_adjacent_pages() {
        let t = user_chunks(0x1000, 3 * PAGE_SIZE as u64).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0], (0x1000, 3 * PAGE_SIZE as u64));
    }

    #[test]
    fn chunks_respect_unaligned_head_and_tail() {
        let t = user_chunks(0x1100, 100).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0], (0x1100, 100));

        let t = user_chunks(0x1f00, 0x300).unwrap();
        assert_eq!(t[0], (0x1f00, 0x300));
    }
}
