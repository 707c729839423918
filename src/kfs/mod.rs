//! The supervisor: owns the PM arena and everything privileged — pools,
//! trust groups, leases, the page mapper, delegation rings and agents.
//! Clients reach it only through the numbered command surface in `ioctl`.

mod agent;
// The interval-list primitives are shared with the client-side mirrors.
pub(crate) mod balloc;
mod ialloc;
pub mod ioctl;
mod lease;
mod sinode;
mod super_block;
mod tgroup;
mod vma;

pub use ioctl::{
    BlockAllocEntry, ChmodEntry, ChownEntry, Cred, InodeAllocEntry, IoctlArg, MapEntry,
    SysInfoEntry, CMD_ALLOC_BLOCK, CMD_ALLOC_INODE, CMD_CHMOD, CMD_CHOWN, CMD_FREE_BLOCK,
    CMD_FREE_INODE, CMD_GET_PMNODES_INFO, CMD_MAP, CMD_MOUNT, CMD_UMOUNT, CMD_UNMAP,
};
pub use lease::{Lease, LeaseState};
pub use super_block::{ClientBundle, Kfs, KfsConfig};
pub use tgroup::BitmapPage;
pub use vma::{MountVma, Prot};
