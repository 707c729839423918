//! Error kinds shared by both halves of the file system.
//!
//! All failures are explicit values; nothing unwinds across the command
//! surface. Each kind carries a conventional errno so the dispatch layer
//! can report the negative-integer form.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Argument outside its domain, or a lease the caller already holds.
    InvalidArgument,
    /// Pools empty beyond retry, or a lease at its reader capacity.
    NoSpace,
    /// Transient: ring full or lease contended; callers retry.
    Again,
    /// mode/uid/gid check failed.
    Permission,
    /// Inode, trust group, or path missing.
    NotFound,
    /// No mount or no window for the calling trust group.
    NoDevice,
    /// Address translation or range check failed; not expected in practice.
    Io,
}

impl Error {
    /// Conventional errno value for this kind.
    pub fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::NoSpace => libc::ENOSPC,
            Error::Again => libc::EAGAIN,
            Error::Permission => libc::EACCES,
            Error::NotFound => libc::ENOENT,
            Error::NoDevice => libc::ENODEV,
            Error::Io => libc::EIO,
        }
    }

    /// Negative-errno form used by the command surface.
    pub fn to_neg(self) -> i64 {
        -(self.errno() as i64)
    }

    /// The inverse of `to_neg`, for callers of the raw dispatch.
    pub fn from_neg(v: i64) -> Option<Error> {
        let e = (-v) as i32;
        match e {
            x if x == libc::EINVAL => Some(Error::InvalidArgument),
            x if x == libc::ENOSPC => Some(Error::NoSpace),
            x if x == libc::EAGAIN => Some(Error::Again),
            x if x == libc::EACCES => Some(Error::Permission),
            x if x == libc::ENOENT => Some(Error::NotFound),
            x if x == libc::ENODEV => Some(Error::NoDevice),
            x if x == libc::EIO => Some(Error::Io),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::InvalidArgument => "invalid argument",
            Error::NoSpace => "no space",
            Error::Again => "try again",
            Error::Permission => "permission denied",
            Error::NotFound => "not found",
            Error::NoDevice => "no device",
            Error::Io => "i/o error",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}
