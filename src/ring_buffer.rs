//! Delegation transport: request records, per-node rings, notifiers.
//!
//! A ring is one allocation viewed through two typed handles split at
//! construction: any number of cloned `RingSender`s (client threads and the
//! supervisor's zeroing path) and exactly one `RingReceiver` (the agent).
//! Each slot carries the 128-byte request payload; its `valid` flag sits on
//! a separate cache line so publication is a single store.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::params::{DELE_LEVELS, DELE_REQUEST_SIZE, MAX_THREADS, PM_MAX_INS};

pub const REQUEST_READ: i32 = 0;
pub const REQUEST_WRITE: i32 = 1;
pub const REQUEST_CLEAR: i32 = 2;

/// One delegation request.
///
/// `uaddr` names the client buffer, `offset` the PM side. For `Read` with
/// `zero` set the user range is cleared instead of copied. For `Write`,
/// `zero` means a non-temporal clear of the PM range. `Clear` is the
/// supervisor-issued variant that notifies through `notify_ptr` directly
/// instead of a per-thread counter slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DelegationRequest {
    pub kind: i32,
    pub zero: i32,
    pub flush_cache: i32,
    pub sfence: i32,
    pub uaddr: u64,
    pub offset: u64,
    pub bytes: u64,
    pub notify_idx: i32,
    pub level: i32,
    pub notify_ptr: u64,
    _pad: [u8; 72],
}

const_assert_eq!(core::mem::size_of::<DelegationRequest>(), DELE_REQUEST_SIZE);

impl DelegationRequest {
    pub fn new(kind: i32) -> DelegationRequest {
        DelegationRequest {
            kind,
            zero: 0,
            flush_cache: 0,
            sfence: 0,
            uaddr: 0,
            offset: 0,
            bytes: 0,
            notify_idx: 0,
            level: 1,
            notify_ptr: 0,
            _pad: [0; 72],
        }
    }
}

#[repr(C, align(128))]
struct RingSlot {
    request: UnsafeCell<DelegationRequest>,
    valid: AtomicU32,
    _pad: [u8; 124],
}

const_assert_eq!(core::mem::size_of::<RingSlot>(), 256);

impl RingSlot {
    fn new() -> RingSlot {
        RingSlot {
            request: UnsafeCell::new(DelegationRequest::new(REQUEST_READ)),
            valid: AtomicU32::new(0),
            _pad: [0; 124],
        }
    }
}

struct RingShared {
    slots: Box<[RingSlot]>,
    /// Serializes multi-producer slot reservation.
    producer_idx: Mutex<usize>,
}

// SAFETY: a slot's payload cell is written only by the producer that
// reserved the slot index while `valid == 0`, and read only by the single
// consumer after observing `valid == 1` with acquire ordering.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

/// Producer view.
#[derive(Clone)]
pub struct RingSender {
    ring: Arc<RingShared>,
}

/// Consumer view; there is exactly one per ring.
pub struct RingReceiver {
    ring: Arc<RingShared>,
    consumer_idx: usize,
}

/// Build a ring spanning `bytes` of slot storage.
pub fn ring_channel(bytes: usize) -> (RingSender, RingReceiver) {
    let n = bytes / core::mem::size_of::<RingSlot>();
    assert!(n >= 2, "ring too small");
    let slots: Vec<RingSlot> = (0..n).map(|_| RingSlot::new()).collect();
    let shared = Arc::new(RingShared {
        slots: slots.into_boxed_slice(),
        producer_idx: Mutex::new(0),
    });
    (
        RingSender {
            ring: shared.clone(),
        },
        RingReceiver {
            ring: shared,
            consumer_idx: 0,
        },
    )
}

impl RingSender {
    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }

    /// Reserve the producer slot, copy the payload, publish. A still-valid
    /// slot at the producer index means the ring is full.
    pub fn send(&self, req: &DelegationRequest) -> Result<()> {
        let slot_idx = {
            let mut idx = self.ring.producer_idx.lock();
            let slot = &self.ring.slots[*idx];
            if slot.valid.load(Ordering::Acquire) != 0 {
                return Err(Error::Again);
            }
            let cur = *idx;
            *idx = (*idx + 1) % self.ring.slots.len();
            cur
        };

        let slot = &self.ring.slots[slot_idx];
        // SAFETY: this thread reserved `slot_idx` under the producer lock
        // while the slot was invalid; the consumer will not touch the
        // payload until `valid` is published below.
        unsafe {
            *slot.request.get() = *req;
        }
        slot.valid.store(1, Ordering::Release);
        Ok(())
    }
}

impl RingReceiver {
    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }

    /// Copy out the next request if one is published.
    pub fn recv(&mut self, out: &mut DelegationRequest) -> Result<()> {
        let slot = &self.ring.slots[self.consumer_idx];
        if slot.valid.load(Ordering::Acquire) == 0 {
            return Err(Error::Again);
        }
        // SAFETY: `valid == 1` was observed with acquire ordering, so the
        // producer's payload writes happen-before this read; the producer
        // will not reuse the slot until `valid` returns to 0.
        unsafe {
            *out = *slot.request.get();
        }
        slot.valid.store(0, Ordering::Release);
        self.consumer_idx = (self.consumer_idx + 1) % self.ring.slots.len();
        Ok(())
    }
}

/// Completion counter on a private cache line; the agent increments, the
/// issuer polls.
#[repr(align(64))]
pub struct Notifier {
    cnt: AtomicU64,
}

const_assert_eq!(core::mem::size_of::<Notifier>(), 64);

impl Notifier {
    pub fn new() -> Notifier {
        Notifier {
            cnt: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn complete_one(&self) {
        let _ = self.cnt.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn completed(&self) -> u64 {
        self.cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reset(&self) {
        self.cnt.store(0, Ordering::Release);
    }
}

impl Default for Notifier {
    fn default() -> Notifier {
        Notifier::new()
    }
}

/// Notifiers per thread slot: one per (level, PM node).
const NOTIFIERS_PER_THREAD: usize = DELE_LEVELS * PM_MAX_INS;

/// Per-thread completion counter pages: one row of
/// `DELE_LEVELS x PM_MAX_INS` notifiers per thread slot.
pub struct NotifierRegion {
    pages: Vec<Box<[Notifier; NOTIFIERS_PER_THREAD]>>,
}

impl NotifierRegion {
    pub fn new() -> NotifierRegion {
        let pages = (0..MAX_THREADS)
            .map(|_| Box::new(array_macro::array![_ => Notifier::new(); NOTIFIERS_PER_THREAD]))
            .collect();
        NotifierRegion { pages }
    }

    /// Counter for (`thread`, `level`, `pm_node`). `level` starts at 1.
    pub fn slot(&self, thread: usize, level: usize, pm_node: usize) -> &Notifier {
        debug_assert!(level >= 1 && level <= DELE_LEVELS);
        debug_assert!(pm_node < PM_MAX_INS);
        &self.pages[thread % MAX_THREADS][(level - 1) * PM_MAX_INS + pm_node]
    }
}

impl Default for NotifierRegion {
    fn default() -> NotifierRegion {
        NotifierRegion::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_until_full_then_drain() {
        let (tx, mut rx) = ring_channel(4 * 256);
        let mut req = DelegationRequest::new(REQUEST_WRITE);
        for i in 0..tx.capacity() {
            req.bytes = i as u64;
            tx.send(&req).unwrap();
        }
        assert_eq!(tx.send(&req), Err(Error::Again));

        let mut out = DelegationRequest::new(REQUEST_READ);
        for i in 0..tx.capacity() {
            rx.recv(&mut out).unwrap();
            assert_eq!(out.bytes, i as u64);
            assert_eq!(out.kind, REQUEST_WRITE);
        }
        assert_eq!(rx.recv(&mut out), Err(Error::Again));

        // Space opened up again.
        tx.send(&req).unwrap();
    }

    #[test]
    fn payload_not_torn_across_threads() {
        let (tx, mut rx) = ring_channel(16 * 256);
        let producer = std::thread::spawn(move || {
            let mut req = DelegationRequest::new(REQUEST_WRITE);
            for i in 0..1000u64 {
                req.uaddr = i;
                req.offset = i.wrapping_mul(3);
                req.bytes = i.wrapping_mul(7);
                while tx.send(&req).is_err() {
                    std::thread::yield_now();
                }
            }
        });
        let mut out = DelegationRequest::new(REQUEST_READ);
        let mut seen = 0;
        while seen < 1000 {
            if rx.recv(&mut out).is_ok() {
                assert_eq!(out.offset, out.uaddr.wrapping_mul(3));
                assert_eq!(out.bytes, out.uaddr.wrapping_mul(7));
                seen += 1;
            }
        }
        producer.join().unwrap();
    }
}
