//! The command surface between clients and the supervisor.
//!
//! Commands keep their numeric codes and C-layout payload records; the
//! dispatch returns 0 or a negative errno exactly as a device node would.
//! Caller identity travels as an explicit credential record.

use crate::error::{Error, Result};
use crate::kfs::super_block::Kfs;
use crate::pm::PmNodeInfo;
use crate::pmem;

pub const CMD_MOUNT: u32 = 0x1000;
pub const CMD_UMOUNT: u32 = 0x1001;
pub const CMD_MAP: u32 = 0x1002;
pub const CMD_UNMAP: u32 = 0x1003;
pub const CMD_ALLOC_INODE: u32 = 0x1004;
pub const CMD_FREE_INODE: u32 = 0x1005;
pub const CMD_GET_PMNODES_INFO: u32 = 0x1006;
pub const CMD_ALLOC_BLOCK: u32 = 0x1007;
pub const CMD_FREE_BLOCK: u32 = 0x1008;
pub const CMD_CHOWN: u32 = 0x1009;
pub const CMD_CHMOD: u32 = 0x100a;

/// Identity of the process behind a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MapEntry {
    pub inode: i32,
    pub perm: i32,
    pub index_offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InodeAllocEntry {
    pub inode: i32,
    pub num: i32,
    pub cpu: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SysInfoEntry {
    pub pmnode_num: i32,
    pub sockets: i32,
    pub cpus_per_socket: i32,
    pub dele_ring_per_node: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockAllocEntry {
    pub block: u64,
    pub num: u64,
    pub cpu: i32,
    pub pmnode: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ChownEntry {
    pub inode: i32,
    pub owner: i32,
    pub group: i32,
    pub inode_offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ChmodEntry {
    pub inode: i32,
    pub mode: u32,
    pub inode_offset: u64,
}

/// In/out payload of one command.
pub enum IoctlArg<'a> {
    None,
    Umount { mount_addr: u64 },
    Map(&'a mut MapEntry),
    Unmap(&'a mut MapEntry),
    AllocInode(&'a mut InodeAllocEntry),
    FreeInode(&'a mut InodeAllocEntry),
    SysInfo(&'a mut SysInfoEntry, &'a mut Vec<PmNodeInfo>),
    AllocBlock(&'a mut BlockAllocEntry),
    FreeBlock(&'a mut BlockAllocEntry),
    Chown(&'a mut ChownEntry),
    Chmod(&'a mut ChmodEntry),
}

impl Kfs {
    /// Numeric dispatch; 0 on success, negative errno on failure.
    pub fn ioctl(&self, cred: &Cred, cmd: u32, arg: IoctlArg<'_>) -> i64 {
        let res: Result<()> = match (cmd, arg) {
            (CMD_MOUNT, IoctlArg::None) => self.mount(cred),
            (CMD_UMOUNT, IoctlArg::Umount { mount_addr }) => self.umount(cred, mount_addr),
            (CMD_MAP, IoctlArg::Map(e)) => self
                .map_file(cred, e.inode as u32, e.perm != 0)
                .map(|off| e.index_offset = off),
            (CMD_UNMAP, IoctlArg::Unmap(e)) => self.unmap_file(cred, e.inode as u32),
            (CMD_ALLOC_INODE, IoctlArg::AllocInode(e)) => {
                let cpu = if e.cpu < 0 {
                    pmem::current_cpu() % self.cpus()
                } else {
                    e.cpu as usize
                };
                self.alloc_inodes(e.num as u32, cpu).map(|(ino, num)| {
                    e.inode = ino as i32;
                    e.num = num as i32;
                })
            }
            (CMD_FREE_INODE, IoctlArg::FreeInode(e)) => {
                self.free_inodes(e.inode as u32, e.num as u32)
            }
            (CMD_GET_PMNODES_INFO, IoctlArg::SysInfo(e, nodes)) => {
                let info = self.sys_info();
                *nodes = info.pm_nodes;
                e.pmnode_num = nodes.len() as i32;
                e.sockets = info.sockets as i32;
                e.cpus_per_socket = info.cpus_per_socket as i32;
                e.dele_ring_per_node = info.dele_ring_per_node as i32;
                Ok(())
            }
            (CMD_ALLOC_BLOCK, IoctlArg::AllocBlock(e)) => {
                let cpu = if e.cpu < 0 {
                    pmem::current_cpu() % self.cpus()
                } else {
                    e.cpu as usize
                };
                self.alloc_blocks(cred, e.num, cpu, e.pmnode as usize)
                    .map(|(block, num)| {
                        e.block = block;
                        e.num = num;
                    })
            }
            (CMD_FREE_BLOCK, IoctlArg::FreeBlock(e)) => self.free_blocks(cred, e.block, e.num),
            (CMD_CHOWN, IoctlArg::Chown(e)) => {
                self.chown(cred, e.inode as u32, e.owner, e.group, e.inode_offset)
            }
            (CMD_CHMOD, IoctlArg::Chmod(e)) => {
                self.chmod(cred, e.inode as u32, e.mode, e.inode_offset)
            }
            _ => Err(Error::InvalidArgument),
        };
        match res {
            Ok(()) => 0,
            Err(e) => e.to_neg(),
        }
    }
}

/// Description of the topology returned by `CMD_GET_PMNODES_INFO`.
pub struct SysInfo {
    pub pm_nodes: Vec<PmNodeInfo>,
    pub sockets: usize,
    pub cpus_per_socket: usize,
    pub dele_ring_per_node: usize,
}
