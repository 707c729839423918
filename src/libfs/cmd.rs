//! Typed wrappers over the supervisor command surface. Every call goes
//! through the numeric dispatch so the wire shape stays honest.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kfs::ioctl::{
    BlockAllocEntry, ChmodEntry, ChownEntry, Cred, InodeAllocEntry, IoctlArg, MapEntry,
    SysInfoEntry, CMD_ALLOC_BLOCK, CMD_ALLOC_INODE, CMD_CHMOD, CMD_CHOWN, CMD_FREE_BLOCK,
    CMD_FREE_INODE, CMD_GET_PMNODES_INFO, CMD_MAP, CMD_MOUNT, CMD_UMOUNT, CMD_UNMAP,
};
use crate::kfs::{ClientBundle, Kfs};
use crate::params::MOUNT_ADDR;
use crate::pm::PmNodeInfo;

/// The client's handle on the supervisor: the device fd of the original
/// design, paired with the caller's identity.
pub struct Dev {
    kfs: Arc<Kfs>,
    pub cred: Cred,
}

fn check(ret: i64) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::from_neg(ret).unwrap_or(Error::Io))
    }
}

impl Dev {
    pub fn new(kfs: Arc<Kfs>, cred: Cred) -> Dev {
        Dev { kfs, cred }
    }

    pub fn kfs(&self) -> &Arc<Kfs> {
        &self.kfs
    }

    pub fn mount(&self) -> Result<()> {
        check(self.kfs.ioctl(&self.cred, CMD_MOUNT, IoctlArg::None))
    }

    pub fn umount(&self) -> Result<()> {
        check(self.kfs.ioctl(
            &self.cred,
            CMD_UMOUNT,
            IoctlArg::Umount {
                mount_addr: MOUNT_ADDR,
            },
        ))
    }

    /// The shared pages the mount installed.
    pub fn bundle(&self) -> Result<ClientBundle> {
        self.kfs.client_bundle(&self.cred)
    }

    pub fn map_file(&self, ino: u32, writable: bool) -> Result<u64> {
        let mut e = MapEntry {
            inode: ino as i32,
            perm: writable as i32,
            index_offset: 0,
        };
        check(self.kfs.ioctl(&self.cred, CMD_MAP, IoctlArg::Map(&mut e)))?;
        Ok(e.index_offset)
    }

    pub fn unmap_file(&self, ino: u32) -> Result<()> {
        let mut e = MapEntry {
            inode: ino as i32,
            perm: 0,
            index_offset: 0,
        };
        check(self.kfs.ioctl(&self.cred, CMD_UNMAP, IoctlArg::Unmap(&mut e)))
    }

    /// `cpu < 0` lets the supervisor pick the caller's CPU.
    pub fn alloc_inodes(&self, num: u32, cpu: i32) -> Result<(u32, u32)> {
        let mut e = InodeAllocEntry {
            inode: 0,
            num: num as i32,
            cpu,
        };
        check(
            self.kfs
                .ioctl(&self.cred, CMD_ALLOC_INODE, IoctlArg::AllocInode(&mut e)),
        )?;
        Ok((e.inode as u32, e.num as u32))
    }

    pub fn free_inodes(&self, ino: u32, num: u32) -> Result<()> {
        let mut e = InodeAllocEntry {
            inode: ino as i32,
            num: num as i32,
            cpu: -1,
        };
        check(
            self.kfs
                .ioctl(&self.cred, CMD_FREE_INODE, IoctlArg::FreeInode(&mut e)),
        )
    }

    pub fn sys_info(&self) -> Result<(Vec<PmNodeInfo>, usize, usize, usize)> {
        let mut e = SysInfoEntry::default();
        let mut nodes = Vec::new();
        check(self.kfs.ioctl(
            &self.cred,
            CMD_GET_PMNODES_INFO,
            IoctlArg::SysInfo(&mut e, &mut nodes),
        ))?;
        Ok((
            nodes,
            e.sockets as usize,
            e.cpus_per_socket as usize,
            e.dele_ring_per_node as usize,
        ))
    }

    pub fn alloc_blocks(&self, num: u64, cpu: i32, pm_node: usize) -> Result<(u64, u64)> {
        let mut e = BlockAllocEntry {
            block: 0,
            num,
            cpu,
            pmnode: pm_node as i32,
        };
        check(
            self.kfs
                .ioctl(&self.cred, CMD_ALLOC_BLOCK, IoctlArg::AllocBlock(&mut e)),
        )?;
        Ok((e.block, e.num))
    }

    pub fn free_blocks(&self, block: u64, num: u64) -> Result<()> {
        let mut e = BlockAllocEntry {
            block,
            num,
            cpu: -1,
            pmnode: -1,
        };
        check(
            self.kfs
                .ioctl(&self.cred, CMD_FREE_BLOCK, IoctlArg::FreeBlock(&mut e)),
        )
    }

    pub fn chown(&self, ino: u32, uid: i32, gid: i32, inode_offset: u64) -> Result<()> {
        let mut e = ChownEntry {
            inode: ino as i32,
            owner: uid,
            group: gid,
            inode_offset,
        };
        check(self.kfs.ioctl(&self.cred, CMD_CHOWN, IoctlArg::Chown(&mut e)))
    }

    pub fn chmod(&self, ino: u32, mode: u32, inode_offset: u64) -> Result<()> {
        let mut e = ChmodEntry {
            inode: ino as i32,
            mode,
            inode_offset,
        };
        check(self.kfs.ioctl(&self.cred, CMD_CHMOD, IoctlArg::Chmod(&mut e)))
    }
}
