//! Per-inode leases.
//!
//! A lease can be acquired for write when every previous owner is gone or
//! expired; "expired" requires both a stale timestamp and a cleared
//! lease-ring bit — either alone is not sufficient, since an owner inside a
//! critical section keeps its bit set however old its stamp is.

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::kfs::tgroup::TgroupTable;
use crate::params::LEASE_MAX_OWNER;
use crate::pmem::rdtsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unowned,
    WriteOwned,
    ReadOwned,
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    tgid: u8,
    tsc: u64,
}

struct LeaseInner {
    state: LeaseState,
    owners: ArrayVec<Owner, LEASE_MAX_OWNER>,
}

pub struct Lease {
    inner: Mutex<LeaseInner>,
}

impl Lease {
    pub fn new() -> Lease {
        Lease {
            inner: Mutex::new(LeaseInner {
                state: LeaseState::Unowned,
                owners: ArrayVec::new(),
            }),
        }
    }

    /// Drop all state; used when an inode number is recycled.
    pub fn reset(&self) {
        let mut l = self.inner.lock();
        l.state = LeaseState::Unowned;
        l.owners.clear();
    }

    pub fn state(&self) -> LeaseState {
        self.inner.lock().state
    }

    pub fn owner_tgids(&self) -> Vec<u8> {
        self.inner.lock().owners.iter().map(|o| o.tgid).collect()
    }

    fn is_expired(ino: u32, owner: &Owner, tgt: &TgroupTable, period: u64) -> bool {
        if owner.tsc.saturating_add(period) >= rdtsc() {
            return false;
        }
        match tgt.lease_ring(owner.tgid) {
            Some(ring) => !ring.test(ino),
            // The owning group is gone entirely.
            None => true,
        }
    }

    /// Evaluated under the lock. Write acquisition needs every previous
    /// owner expired; a further read under ReadOwned only needs a free
    /// slot. Reacquisition by an owning group is always an error.
    fn can_acquire(
        inner: &LeaseInner,
        ino: u32,
        tgid: u8,
        want: LeaseState,
        tgt: &TgroupTable,
        period: u64,
    ) -> Result<()> {
        if inner.state == LeaseState::Unowned {
            return Ok(());
        }

        let check_expire =
            want == LeaseState::WriteOwned || inner.state == LeaseState::WriteOwned;

        for o in inner.owners.iter() {
            if o.tgid == tgid {
                return Err(Error::InvalidArgument);
            }
            if check_expire && !Lease::is_expired(ino, o, tgt, period) {
                return Err(Error::Again);
            }
        }

        if want == LeaseState::ReadOwned
            && inner.state == LeaseState::ReadOwned
            && inner.owners.is_full()
        {
            return Err(Error::NoSpace);
        }

        Ok(())
    }

    /// Scrub the map-ring bit of every owner being displaced.
    fn clean_map_ring(inner: &LeaseInner, ino: u32, tgt: &TgroupTable) {
        for o in inner.owners.iter() {
            if let Some(ring) = tgt.map_ring(o.tgid) {
                ring.clear(ino);
            }
        }
    }

    pub fn acquire_write(&self, ino: u32, tgid: u8, tgt: &TgroupTable, period: u64) -> Result<()> {
        let mut l = self.inner.lock();
        Lease::can_acquire(&l, ino, tgid, LeaseState::WriteOwned, tgt, period)?;
        Lease::clean_map_ring(&l, ino, tgt);
        l.state = LeaseState::WriteOwned;
        l.owners.clear();
        l.owners.push(Owner {
            tgid,
            tsc: rdtsc(),
        });
        Ok(())
    }

    pub fn acquire_read(&self, ino: u32, tgid: u8, tgt: &TgroupTable, period: u64) -> Result<()> {
        let mut l = self.inner.lock();
        Lease::can_acquire(&l, ino, tgid, LeaseState::ReadOwned, tgt, period)?;
        if l.state != LeaseState::ReadOwned {
            Lease::clean_map_ring(&l, ino, tgt);
            l.owners.clear();
            l.state = LeaseState::ReadOwned;
        }
        l.owners.push(Owner {
            tgid,
            tsc: rdtsc(),
        });
        Ok(())
    }

    /// Release by an owner. WriteOwned drops straight to Unowned; a reader
    /// release compacts the owner slots and drops to Unowned when the last
    /// reader leaves.
    pub fn release(&self, _ino: u32, tgid: u8) -> Result<()> {
        let mut l = self.inner.lock();
        match l.state {
            LeaseState::Unowned => Err(Error::InvalidArgument),
            LeaseState::WriteOwned => {
                if l.owners.first().map(|o| o.tgid) != Some(tgid) {
                    return Err(Error::InvalidArgument);
                }
                l.state = LeaseState::Unowned;
                l.owners.clear();
                Ok(())
            }
            LeaseState::ReadOwned => {
                let before = l.owners.len();
                l.owners.retain(|o| o.tgid != tgid);
                if l.owners.len() == before {
                    return Err(Error::InvalidArgument);
                }
                if l.owners.is_empty() {
                    l.state = LeaseState::Unowned;
                }
                Ok(())
            }
        }
    }

    /// Refresh the caller's timestamp slot only.
    pub fn renew(&self, tgid: u8) -> Result<()> {
        let mut l = self.inner.lock();
        for o in l.owners.iter_mut() {
            if o.tgid == tgid {
                o.tsc = rdtsc();
                return Ok(());
            }
        }
        Err(Error::InvalidArgument)
    }
}

impl Default for Lease {
    fn default() -> Lease {
        Lease::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LEASE_PERIOD;

    fn table() -> TgroupTable {
        TgroupTable::new()
    }

    #[test]
    fn write_then_release_returns_to_unowned() {
        let t = table();
        let a = t.pid_to_tgid(10, true).unwrap();
        let l = Lease::new();
        l.acquire_write(5, a, &t, LEASE_PERIOD).unwrap();
        assert_eq!(l.state(), LeaseState::WriteOwned);
        assert_eq!(l.owner_tgids(), vec![a]);
        l.release(5, a).unwrap();
        assert_eq!(l.state(), LeaseState::Unowned);
    }

    #[test]
    fn same_group_reacquire_is_invalid() {
        let t = table();
        let a = t.pid_to_tgid(10, true).unwrap();
        let l = Lease::new();
        l.acquire_read(5, a, &t, LEASE_PERIOD).unwrap();
        assert_eq!(l.acquire_read(5, a, &t, LEASE_PERIOD), Err(Error::InvalidArgument));
        assert_eq!(l.acquire_write(5, a, &t, LEASE_PERIOD), Err(Error::InvalidArgument));
    }

    #[test]
    fn writer_blocks_unexpired_writer() {
        let t = table();
        let a = t.pid_to_tgid(10, true).unwrap();
        let b = t.pid_to_tgid(11, true).unwrap();
        let l = Lease::new();
        l.acquire_write(5, a, &t, LEASE_PERIOD).unwrap();
        assert_eq!(l.acquire_write(5, b, &t, LEASE_PERIOD), Err(Error::Again));
        assert_eq!(l.acquire_read(5, b, &t, LEASE_PERIOD), Err(Error::Again));
    }

    #[test]
    fn readers_share_up_to_capacity() {
        let t = table();
        let l = Lease::new();
        let mut ids = Vec::new();
        for pid in 0..LEASE_MAX_OWNER as u32 {
            let id = t.pid_to_tgid(100 + pid, true).unwrap();
            ids.push(id);
            l.acquire_read(5, id, &t, LEASE_PERIOD).unwrap();
        }
        let extra = t.pid_to_tgid(999, true).unwrap();
        assert_eq!(l.acquire_read(5, extra, &t, LEASE_PERIOD), Err(Error::NoSpace));
        // Drain all readers; the lease ends Unowned.
        for id in ids {
            l.release(5, id).unwrap();
        }
        assert_eq!(l.state(), LeaseState::Unowned);
    }

    #[test]
    fn expiry_needs_stale_stamp_and_clear_ring_bit() {
        let t = table();
        let a = t.pid_to_tgid(10, true).unwrap();
        let b = t.pid_to_tgid(11, true).unwrap();
        let l = Lease::new();
        l.acquire_write(5, a, &t, 0).unwrap();

        // Stamp is stale (period 0) but the owner still holds its CS bit.
        t.lease_ring(a).unwrap().set(5);
        assert_eq!(l.acquire_write(5, b, &t, 0), Err(Error::Again));

        // Bit cleared: the takeover goes through and scrubs a's map bit.
        t.lease_ring(a).unwrap().clear(5);
        t.map_ring(a).unwrap().set(5);
        l.acquire_write(5, b, &t, 0).unwrap();
        assert!(!t.map_ring(a).unwrap().test(5));
        assert_eq!(l.owner_tgids(), vec![b]);
    }

    #[test]
    fn non_owner_release_rejected() {
        let t = table();
        let a = t.pid_to_tgid(10, true).unwrap();
        let b = t.pid_to_tgid(11, true).unwrap();
        let l = Lease::new();
        l.acquire_write(5, a, &t, LEASE_PERIOD).unwrap();
        assert_eq!(l.release(5, b), Err(Error::InvalidArgument));
    }

    #[test]
    fn renew_refreshes_stamp() {
        let t = table();
        let a = t.pid_to_tgid(10, true).unwrap();
        let l = Lease::new();
        l.acquire_write(5, a, &t, LEASE_PERIOD).unwrap();
        l.renew(a).unwrap();
        assert_eq!(l.renew(7), Err(Error::InvalidArgument));
    }
}
