//! File metadata as reported by fstat/lstat.

/// On-media file type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    None = 0,
    Regular = 1,
    Directory = 2,
}

impl FileType {
    pub fn from_raw(v: u8) -> FileType {
        match v {
            1 => FileType::Regular,
            2 => FileType::Directory,
            _ => FileType::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u32,
    pub ftype: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
}
