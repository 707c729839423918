//! Shadow inodes: the DRAM mirror of the subset of inode state the
//! supervisor needs for access checks and mapping, one record per inode
//! number, alive for the lifetime of the file-system instance.

use spin::Mutex;

use crate::error::{Error, Result};
use crate::kfs::lease::Lease;
use crate::params::MAX_INODE_NUM;
use crate::pm::PmOffset;
use crate::stat::FileType;

#[derive(Debug, Clone, Copy)]
pub struct ShadowMeta {
    pub file_type: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Where to find the first index page.
    pub index_offset: PmOffset,
}

pub struct ShadowInode {
    pub meta: Mutex<ShadowMeta>,
    pub lease: Lease,
}

impl ShadowInode {
    fn empty() -> ShadowInode {
        ShadowInode {
            meta: Mutex::new(ShadowMeta {
                file_type: FileType::None,
                mode: 0,
                uid: 0,
                gid: 0,
                index_offset: PmOffset::NULL,
            }),
            lease: Lease::new(),
        }
    }
}

pub struct SinodeStore {
    arr: Vec<ShadowInode>,
}

impl SinodeStore {
    pub fn new() -> SinodeStore {
        let arr = (0..MAX_INODE_NUM).map(|_| ShadowInode::empty()).collect();
        SinodeStore { arr }
    }

    pub fn get(&self, ino: u32) -> Result<&ShadowInode> {
        self.arr.get(ino as usize).ok_or(Error::InvalidArgument)
    }

    /// Create or refresh the shadow record. The lease is reinitialized only
    /// on the none -> allocated transition.
    pub fn set_inode(
        &self,
        ino: u32,
        ftype: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        index_offset: PmOffset,
    ) -> Result<()> {
        let si = self.get(ino)?;
        let already = {
            let mut m = si.meta.lock();
            let already = m.file_type != FileType::None;
            m.file_type = ftype;
            m.mode = mode;
            m.uid = uid;
            m.gid = gid;
            m.index_offset = index_offset;
            already
        };
        if !already {
            si.lease.reset();
        }
        Ok(())
    }

    /// Mark an inode dead again (final unlink observed by the supervisor).
    pub fn clear_inode(&self, ino: u32) -> Result<()> {
        let si = self.get(ino)?;
        let mut m = si.meta.lock();
        m.file_type = FileType::None;
        m.index_offset = PmOffset::NULL;
        Ok(())
    }
}

impl Default for SinodeStore {
    fn default() -> SinodeStore {
        SinodeStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_inode_initializes_lease_once() {
        let s = SinodeStore::new();
        s.set_inode(7, FileType::Regular, 0o644, 1, 1, PmOffset(4096))
            .unwrap();
        let si = s.get(7).unwrap();
        assert_eq!(si.meta.lock().mode, 0o644);

        // A second set must not wipe lease state.
        let t = crate::kfs::tgroup::TgroupTable::new();
        let tg = t.pid_to_tgid(3, true).unwrap();
        si.lease.acquire_write(7, tg, &t, u64::MAX).unwrap();
        s.set_inode(7, FileType::Regular, 0o600, 1, 1, PmOffset(8192))
            .unwrap();
        assert_eq!(si.lease.state(), crate::kfs::lease::LeaseState::WriteOwned);
    }
}
