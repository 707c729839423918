//! Persistence and CPU primitives.
//!
//! PM stores become durable once the touched cache lines are flushed and a
//! store fence has retired. Everything here takes raw addresses; callers own
//! the validity of the ranges they flush.

use crate::params::{cache_round_down, cache_round_up, CACHELINE};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Flush one cache line.
        #[inline]
        pub fn flush_line(addr: u64) {
            // SAFETY: clflush has no alignment or validity requirement beyond
            // the address being mapped, which callers guarantee.
            unsafe { core::arch::x86_64::_mm_clflush(addr as *const u8) }
        }

        /// Store fence; pairs with `flush_line` for durability points.
        #[inline]
        pub fn sfence() {
            // SAFETY: sfence is always safe to execute.
            unsafe { core::arch::x86_64::_mm_sfence() }
        }

        /// Monotonic cycle counter used to stamp leases.
        #[inline]
        pub fn rdtsc() -> u64 {
            // SAFETY: rdtsc is always safe to execute.
            unsafe { core::arch::x86_64::_rdtsc() }
        }
    } else {
        #[inline]
        pub fn flush_line(_addr: u64) {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }

        #[inline]
        pub fn sfence() {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }

        /// Nanosecond clock standing in for the cycle counter.
        #[inline]
        pub fn rdtsc() -> u64 {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        }
    }
}

/// Flush every cache line covering `[ptr, ptr + len)`.
#[inline]
pub fn clwb_buffer(ptr: *const u8, len: usize) {
    let start = cache_round_down(ptr as u64);
    let len = cache_round_up(len as u64 + (ptr as u64 - start));
    let mut off = 0;
    while off < len {
        flush_line(start + off);
        off += CACHELINE as u64;
    }
}

/// Zero `[ptr, ptr + len)` and push it out of the cache.
///
/// # Safety
///
/// `ptr` must be valid for writes of `len` bytes and not concurrently
/// accessed through any live reference.
#[inline]
pub unsafe fn memset_nt(ptr: *mut u8, len: usize) {
    unsafe { core::ptr::write_bytes(ptr, 0, len) };
    clwb_buffer(ptr as *const u8, len);
}

/// Identify the calling CPU.
#[cfg(target_os = "linux")]
pub fn current_cpu() -> usize {
    // SAFETY: sched_getcpu takes no arguments and cannot fault.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        cpu as usize
    } else {
        fallback_cpu()
    }
}

/// Identify the calling CPU.
#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> usize {
    fallback_cpu()
}

/// Stable per-thread id for platforms without a cheap cpu query.
fn fallback_cpu() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::cell::Cell;

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SLOT: Cell<usize> = Cell::new(usize::MAX);
    }
    SLOT.with(|s| {
        if s.get() == usize::MAX {
            s.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        s.get()
    })
}

/// Number of online CPUs.
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Best-effort pinning of the calling thread.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) {
    // SAFETY: the set is a properly initialized cpu_set_t and pid 0
    // targets the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        let _ = libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

/// Best-effort pinning of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu: usize) {}

/// Yield the calling thread once a spin budget runs out.
#[inline]
pub fn cond_resched() {
    std::thread::yield_now();
}

/// Cheap per-thread xorshift; used to spread delegation requests across a
/// node's rings.
pub fn xor_random() -> u32 {
    use std::cell::Cell;
    thread_local! {
        static SEED: Cell<u32> = Cell::new(0);
    }
    SEED.with(|s| {
        let mut v = s.get();
        if v == 0 {
            v = (rdtsc() as u32) | 1;
        }
        v ^= v << 6;
        v ^= v >> 21;
        v ^= v << 7;
        s.set(v);
        v
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clwb_buffer_covers_unaligned_ranges() {
        let buf = vec![0u8; 256];
        // Only checking for absence of faults on odd offsets and lengths.
        clwb_buffer(unsafe { buf.as_ptr().add(3) }, 129);
    }

    #[test]
    fn rdtsc_is_monotonic_enough() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }
}
