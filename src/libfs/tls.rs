//! Per-thread slots for the delegation completion counters.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::Cell;

use crate::params::MAX_THREADS;

static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static MY_INDEX: Cell<usize> = Cell::new(usize::MAX);
}

/// The calling thread's notifier slot, assigned on first use.
pub fn my_index() -> usize {
    MY_INDEX.with(|c| {
        if c.get() == usize::MAX {
            c.set(NEXT_INDEX.fetch_add(1, Ordering::Relaxed) % MAX_THREADS);
        }
        c.get()
    })
}
