//! On-media record formats shared by the supervisor and the client.
//!
//! Records are addressed by `PmOffset` and accessed through the arena at
//! use sites. Nothing here stores a virtual address.

use static_assertions::const_assert_eq;

use crate::params::{NAME_MAX, PAGE_SIZE};
use crate::pm::{PmArena, PmOffset};
use crate::stat::FileType;

/// One slot of a file index page: the offset of a 2-MiB extent, or — in the
/// last slot of a page — the offset of the next index page. Zero terminates.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FidxEntry {
    pub offset: u64,
}

const_assert_eq!(core::mem::size_of::<FidxEntry>(), 8);

/// A slot is "normal" (points at data) unless it is the final slot of its
/// 4-KiB page, which is reserved for chaining.
#[inline]
pub fn is_norm_fidx(slot: PmOffset) -> bool {
    (slot.0 + core::mem::size_of::<FidxEntry>() as u64) % PAGE_SIZE as u64 != 0
}

/// The inode record embedded in a directory entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PmInode {
    pub file_type: u8,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// First index page, or zero.
    pub offset: u64,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
}

const_assert_eq!(core::mem::size_of::<PmInode>(), 56);

impl PmInode {
    pub fn init(ftype: FileType, mode: u32, uid: u32, gid: u32, index_offset: u64) -> PmInode {
        PmInode {
            file_type: ftype as u8,
            mode,
            uid,
            gid,
            size: 0,
            offset: index_offset,
            atime: 0,
            ctime: 0,
            mtime: 0,
        }
    }
}

/// Fixed head of a directory entry; the name bytes follow immediately.
/// `name_len == 0` is the block terminator sentinel, and `name_len` is the
/// publication word of a new entry. `ino_num` transitions to the tombstone
/// value on deletion.
#[repr(C)]
pub struct DirEntryHead {
    pub name_len: u8,
    pub ino_num: u32,
    pub rec_len: u16,
    pub inode: PmInode,
}

pub const DIR_ENTRY_BASE: usize = core::mem::size_of::<DirEntryHead>();

const_assert_eq!(DIR_ENTRY_BASE, 72);

/// Record length for a name of `name_len` bytes (terminator included),
/// 8-byte aligned so every embedded inode stays aligned.
pub fn dir_rec_len(name_len: usize) -> u16 {
    debug_assert!(name_len >= 1 && name_len <= NAME_MAX);
    (((DIR_ENTRY_BASE + name_len) + 7) & !7) as u16
}

/// Byte offset of the embedded inode within its directory entry.
pub const DIR_INODE_OFF: u64 = 16;

/// Directory entry owning the inode record at `inode_off`.
#[inline]
pub fn dentry_of_inode(inode_off: PmOffset) -> PmOffset {
    PmOffset(inode_off.0 - DIR_INODE_OFF)
}

/// Offset of the embedded inode record of the entry at `dentry_off`.
#[inline]
pub fn inode_of_dentry(dentry_off: PmOffset) -> PmOffset {
    PmOffset(dentry_off.0 + DIR_INODE_OFF)
}

/// Read the name bytes of the entry at `dentry`.
///
/// # Safety
///
/// `dentry` must reference a live directory entry whose `name_len` and name
/// bytes were fully published.
pub unsafe fn dentry_name(arena: &PmArena, dentry: PmOffset) -> Vec<u8> {
    let head = unsafe { &*arena.at::<DirEntryHead>(dentry) };
    let len = head.name_len as usize;
    debug_assert!(len >= 1);
    let mut out = vec![0u8; len - 1];
    let src: *const u8 = arena.at::<u8>(dentry.add(DIR_ENTRY_BASE as u64));
    unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len - 1) };
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rec_len_alignment() {
        assert_eq!(dir_rec_len(1) % 8, 0);
        assert_eq!(dir_rec_len(1), 80);
        assert_eq!(dir_rec_len(8), 80);
        assert_eq!(dir_rec_len(9), 88);
    }

    #[test]
    fn chain_slot_detection() {
        assert!(is_norm_fidx(PmOffset(0)));
        assert!(is_norm_fidx(PmOffset(4080)));
        assert!(!is_norm_fidx(PmOffset(4088)));
        assert!(!is_norm_fidx(PmOffset(8192 - 8)));
    }
}
