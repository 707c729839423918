//! The operation layer: POSIX-flavored calls over the client state.
//!
//! Paths under the file-system prefix belong here; everything else is the
//! host's business (`lib_path` draws the line). Directory mutations map
//! the parent first, and rename runs its three word-sized updates under a
//! journal transaction.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::layout::PmInode;
use crate::libfs::filetable::FileHandle;
use crate::libfs::mfs::{
    map_file, namei, nameiparent, normalized_key, path_elements, readm, truncatem, writem,
};
use crate::libfs::mnode::{
    entry_inode_off, publish_entry, tombstone_entry, InodeRef, Mnode,
};
use crate::libfs::proc::Proc;
use crate::params::{BASE_FD, ROOT_PATH};
use crate::pm::PmOffset;
use crate::stat::{FileStat, FileType};

/// xv6-style: any descriptor slot will do.
pub const O_ANYFD: i32 = 0x1000;

pub const AT_FDCWD: i32 = libc::AT_FDCWD;

/// Strip the file-system prefix; `None` means the path belongs to the
/// host file system.
pub fn lib_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(ROOT_PATH)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

pub fn is_lib_fd(fd: i32) -> bool {
    fd >= BASE_FD
}

pub fn fd_to_lib(fd: i32) -> i32 {
    fd - BASE_FD
}

pub fn fd_to_host(fd: i32) -> i32 {
    fd + BASE_FD
}

/// Full-path key of `path`'s parent, for global-map bookkeeping.
fn parent_key(path: &str) -> Option<String> {
    let mut elems = path_elements(path)?;
    let _ = elems.pop()?;
    let mut s = String::new();
    for e in &elems {
        s.push('/');
        s.push_str(e);
    }
    if s.is_empty() {
        s.push('/');
    }
    Some(s)
}

impl Proc {
    fn getfile(&self, fd: i32) -> Result<Arc<FileHandle>> {
        self.ftable.get_file(fd).ok_or(Error::InvalidArgument)
    }

    /// Create `path` as `ftype`, or return the existing regular file when
    /// the open allows it.
    fn create(&self, path: &str, ftype: FileType, mode: u32, excl: bool) -> Result<Arc<Mnode>> {
        let fs = &self.fs;
        let (md, name) = nameiparent(fs, path).ok_or(Error::NotFound)?;
        let pkey = parent_key(path).ok_or(Error::NotFound)?;
        map_file(fs, &md, true, Some(&pkey))?;

        if md.dir_killed() {
            return Err(Error::NotFound);
        }
        if name == "." || name == ".." {
            return Err(Error::InvalidArgument);
        }

        if let Some((ino, _)) = md.dir_lookup(name.as_bytes()) {
            if excl {
                return Err(Error::InvalidArgument);
            }
            let mf = fs.mnode_get(ino).ok_or(Error::NotFound)?;
            if ftype != FileType::Regular || mf.typ != FileType::Regular {
                return Err(Error::InvalidArgument);
            }
            return Ok(mf);
        }

        let ino = fs.ialloc.new_inode(fs.dev(), fs.alloc_cpu())?;
        let de = match md.dir_insert(fs, name.as_bytes(), ino) {
            Ok(de) => de,
            Err(e) => {
                fs.ialloc.free_inode(ino);
                return Err(e);
            }
        };

        let mf = Mnode::new(ftype, ino, md.ino, InodeRef::Pm(entry_inode_off(de)));
        fs.mnode_set(ino, Some(mf.clone()));

        // name_len is the final store that makes the entry live.
        publish_entry(
            fs,
            de,
            PmInode::init(ftype, mode, self.cred.uid, self.cred.gid, 0),
            name.len() + 1,
        );

        let key = normalized_key(path).ok_or(Error::InvalidArgument)?;
        let _ = fs.dir_map.insert(key.as_bytes(), ino as u64, de.0);
        Ok(mf)
    }

    pub fn sys_openat(&self, dirfd: i32, path: &str, flags: i32, mode: u32) -> Result<i32> {
        let fs = &self.fs;
        if dirfd != AT_FDCWD {
            let _ = self.getfile(dirfd)?;
        }

        let m = if flags & libc::O_CREAT != 0 {
            self.create(path, FileType::Regular, mode, flags & libc::O_EXCL != 0)?
        } else {
            namei(fs, path).ok_or(Error::NotFound)?
        };

        let rwmode = flags & libc::O_ACCMODE;
        if m.typ == FileType::Directory && rwmode != libc::O_RDONLY {
            return Err(Error::InvalidArgument);
        }

        let dir_key = if m.typ == FileType::Directory {
            normalized_key(path)
        } else {
            None
        };
        map_file(fs, &m, rwmode != libc::O_RDONLY, dir_key.as_deref())?;

        // Released on close: the supervisor reads this bit as "inside a
        // lease-holding critical section".
        fs.enter_cs(m.ino);

        if m.typ == FileType::Regular && flags & libc::O_TRUNC != 0 && m.size() > 0 {
            let _wl = m.rw.write();
            m.truncate_zero(fs);
        }

        let f = FileHandle::new(
            m,
            rwmode != libc::O_WRONLY,
            rwmode != libc::O_RDONLY,
            flags & libc::O_APPEND != 0,
        );
        let fd = self
            .ftable
            .alloc_fd(f, flags & O_ANYFD != 0, flags & libc::O_CLOEXEC != 0);
        if fd < 0 {
            return Err(Error::NoSpace);
        }
        Ok(fd)
    }

    pub fn sys_open(&self, path: &str, flags: i32, mode: u32) -> Result<i32> {
        self.sys_openat(AT_FDCWD, path, flags, mode)
    }

    pub fn sys_close(&self, fd: i32) -> Result<()> {
        let f = self.ftable.close(fd).ok_or(Error::InvalidArgument)?;
        self.fs.exit_cs(f.m.ino);
        Ok(())
    }

    pub fn sys_read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let f = self.getfile(fd)?;
        if !f.readable {
            return Err(Error::Permission);
        }
        let off = f.off.load(Ordering::Acquire);
        let n = readm(&self.fs, &f.m, buf, off);
        if n < 0 {
            return Err(Error::Io);
        }
        f.off.store(off + n as u64, Ordering::Release);
        Ok(n as usize)
    }

    pub fn sys_pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<usize> {
        let f = self.getfile(fd)?;
        if !f.readable {
            return Err(Error::Permission);
        }
        let n = readm(&self.fs, &f.m, buf, offset);
        if n < 0 {
            return Err(Error::Io);
        }
        Ok(n as usize)
    }

    pub fn sys_write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        let f = self.getfile(fd)?;
        if !f.writable {
            return Err(Error::Permission);
        }
        let off = if f.append {
            f.m.size()
        } else {
            f.off.load(Ordering::Acquire)
        };
        let n = writem(&self.fs, &f.m, buf, off);
        if n < 0 {
            return Err(Error::Io);
        }
        f.off.store(off + n as u64, Ordering::Release);
        Ok(n as usize)
    }

    pub fn sys_pwrite(&self, fd: i32, buf: &[u8], offset: u64) -> Result<usize> {
        let f = self.getfile(fd)?;
        if !f.writable {
            return Err(Error::Permission);
        }
        let n = writem(&self.fs, &f.m, buf, offset);
        if n < 0 {
            return Err(Error::Io);
        }
        Ok(n as usize)
    }

    pub fn sys_lseek(&self, fd: i32, offset: i64, whence: i32) -> Result<i64> {
        let f = self.getfile(fd)?;
        if f.m.typ != FileType::Regular {
            return Err(Error::InvalidArgument);
        }
        let base = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => f.off.load(Ordering::Acquire) as i64,
            libc::SEEK_END => f.m.size() as i64,
            _ => return Err(Error::InvalidArgument),
        };
        let pos = base + offset;
        if pos < 0 {
            return Err(Error::InvalidArgument);
        }
        f.off.store(pos as u64, Ordering::Release);
        Ok(pos)
    }

    pub fn sys_fstat(&self, fd: i32) -> Result<FileStat> {
        let f = self.getfile(fd)?;
        Ok(f.m.stat(&self.fs))
    }

    pub fn sys_lstat(&self, path: &str) -> Result<FileStat> {
        let m = namei(&self.fs, path).ok_or(Error::NotFound)?;
        Ok(m.stat(&self.fs))
    }

    pub fn sys_mkdirat(&self, dirfd: i32, path: &str, mode: u32) -> Result<()> {
        if dirfd != AT_FDCWD {
            let _ = self.getfile(dirfd)?;
        }
        if normalized_key(path).as_deref() == Some("/") {
            return Err(Error::InvalidArgument);
        }
        let _ = self.create(path, FileType::Directory, mode, true)?;
        Ok(())
    }

    pub fn sys_mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.sys_mkdirat(AT_FDCWD, path, mode)
    }

    pub fn sys_unlink(&self, path: &str) -> Result<()> {
        let fs = &self.fs;
        let (md, name) = nameiparent(fs, path).ok_or(Error::NotFound)?;
        if name == "." || name == ".." {
            return Err(Error::InvalidArgument);
        }
        let pkey = parent_key(path).ok_or(Error::NotFound)?;
        map_file(fs, &md, true, Some(&pkey))?;

        let (ino, _de) = md.dir_lookup(name.as_bytes()).ok_or(Error::NotFound)?;
        let mf = fs.mnode_get(ino).ok_or(Error::NotFound)?;

        if mf.typ == FileType::Directory {
            let key = normalized_key(path).ok_or(Error::InvalidArgument)?;
            map_file(fs, &mf, false, Some(&key))?;
            // Only an empty directory may die.
            if !mf.dir_kill() {
                return Err(Error::InvalidArgument);
            }
        }

        let _ = md.dir_remove(fs, name.as_bytes()).ok_or(Error::NotFound)?;
        {
            let _wl = mf.rw.write();
            mf.truncate_zero(fs);
        }

        if fs.ialloc.is_allocated(ino) {
            fs.ialloc.free_inode(ino);
        }
        fs.mnode_set(ino, None);

        if let Some(key) = normalized_key(path) {
            let _ = fs.dir_map.remove(key.as_bytes());
        }
        Ok(())
    }

    /// Rename: the destination entry is written invisible, the journal
    /// captures the three pre-image words, and the three publishing stores
    /// run inside that transaction.
    pub fn sys_rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let fs = &self.fs;
        let (mdold, oldname) = nameiparent(fs, old_path).ok_or(Error::NotFound)?;
        let (mdnew, newname) = nameiparent(fs, new_path).ok_or(Error::NotFound)?;
        for n in [oldname.as_str(), newname.as_str()] {
            if n == "." || n == ".." {
                return Err(Error::InvalidArgument);
            }
        }
        let old_pkey = parent_key(old_path).ok_or(Error::NotFound)?;
        let new_pkey = parent_key(new_path).ok_or(Error::NotFound)?;

        fs.enter_cs(mdold.ino);
        let _cs_old = scopeguard::guard((), |_| fs.exit_cs(mdold.ino));
        map_file(fs, &mdold, true, Some(&old_pkey))?;

        fs.enter_cs(mdnew.ino);
        let _cs_new = scopeguard::guard((), |_| fs.exit_cs(mdnew.ino));
        map_file(fs, &mdnew, true, Some(&new_pkey))?;

        let (old_ino, old_de) = mdold.dir_lookup(oldname.as_bytes()).ok_or(Error::NotFound)?;
        let mfold = fs.mnode_get(old_ino).ok_or(Error::NotFound)?;

        if Arc::ptr_eq(&mdold, &mdnew) && oldname == newname {
            return Ok(());
        }

        let roadblock = mdnew.dir_lookup(newname.as_bytes());
        if let Some((rb_ino, _)) = roadblock {
            let rb = fs.mnode_get(rb_ino).ok_or(Error::NotFound)?;
            // Directories replace directories, files replace files.
            if rb.typ != mfold.typ {
                return Err(Error::InvalidArgument);
            }
            if rb_ino == old_ino {
                return Ok(());
            }
        }

        if !mdnew.dir.as_ref().expect("directory mnode").map.replace_from(
            newname.as_bytes(),
            roadblock.is_some(),
            &mdold.dir.as_ref().expect("directory mnode").map,
            oldname.as_bytes(),
            old_ino as u64,
            old_de.0,
        ) {
            return Err(Error::InvalidArgument);
        }

        // Claim the destination entry; it stays invisible (name_len 0)
        // until published inside the transaction.
        let new_de = mdnew.dir_entry_alloc(fs, newname.as_bytes(), old_ino)?;
        // SAFETY: both records live in mapped directory blocks we hold
        // write leases on.
        let inode_copy = unsafe { *fs.arena().at::<PmInode>(entry_inode_off(old_de)) };

        let cpu = fs.journal_cpu();
        let guard = fs.journal.lock(cpu);
        let mut targets = vec![new_de, PmOffset(old_de.0 + 4)];
        if let Some((_, rb_de)) = roadblock {
            targets.push(PmOffset(rb_de.0 + 4));
        }
        let tail = fs.journal.create_transaction(cpu, &targets)?;

        publish_entry(fs, new_de, inode_copy, newname.len() + 1);
        tombstone_entry(fs, old_de);
        if let Some((_, rb_de)) = roadblock {
            tombstone_entry(fs, rb_de);
        }

        fs.journal.commit(cpu, tail);
        drop(guard);

        let _ = mdnew
            .dir
            .as_ref()
            .expect("directory mnode")
            .map
            .set_val2(newname.as_bytes(), new_de.0);
        mfold.set_inode_ref(InodeRef::Pm(entry_inode_off(new_de)));
        mfold.parent.store(mdnew.ino, Ordering::Release);

        if let Some(k) = normalized_key(old_path) {
            let _ = fs.dir_map.remove(k.as_bytes());
            // A moved directory strands every cached descendant path; the
            // leaf maps travel with the mnode, so purged keys resolve
            // again on demand.
            if mfold.typ == FileType::Directory {
                let mut prefix = k.into_bytes();
                prefix.push(b'/');
                let _ = fs.dir_map.remove_prefixed(&prefix);
            }
        }
        if let Some(k) = normalized_key(new_path) {
            let _ = fs.dir_map.remove(k.as_bytes());
            if mfold.typ == FileType::Directory {
                // Stale keys under the destination (a replaced roadblock's
                // children) must not shadow the moved directory's own.
                let mut prefix = k.clone().into_bytes();
                prefix.push(b'/');
                let _ = fs.dir_map.remove_prefixed(&prefix);
            }
            let _ = fs.dir_map.insert(k.as_bytes(), old_ino as u64, new_de.0);
        }
        Ok(())
    }

    pub fn sys_chown(&self, path: &str, uid: i32, gid: i32) -> Result<()> {
        let m = namei(&self.fs, path).ok_or(Error::NotFound)?;
        self.fs
            .dev()
            .chown(m.ino, uid, gid, m.inode_pm_offset())
    }

    pub fn sys_chmod(&self, path: &str, mode: u32) -> Result<()> {
        let m = namei(&self.fs, path).ok_or(Error::NotFound)?;
        self.fs.dev().chmod(m.ino, mode, m.inode_pm_offset())
    }

    pub fn sys_ftruncate(&self, fd: i32, length: u64) -> Result<()> {
        let f = self.getfile(fd)?;
        if !f.writable {
            return Err(Error::Permission);
        }
        truncatem(&self.fs, &f.m, length)
    }

    /// Directory cursor walk: the entry after `prev`, or the first one.
    pub fn sys_readdir(&self, dirfd: i32, prev: Option<&str>) -> Result<Option<String>> {
        let f = self.getfile(dirfd)?;
        if f.m.typ != FileType::Directory {
            return Err(Error::InvalidArgument);
        }
        Ok(f
            .m
            .dir_enumerate(prev.map(|p| p.as_bytes()))
            .map(|n| String::from_utf8_lossy(&n).into_owned()))
    }
}

/// Route a path to the library or the host: the entry layer's check.
pub fn dispatch_path(path: &str) -> Option<&str> {
    lib_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_namespacing() {
        assert_eq!(lib_path("/pmufs"), Some("/"));
        assert_eq!(lib_path("/pmufs/a/b"), Some("/a/b"));
        assert_eq!(lib_path("/pmufsx/a"), None);
        assert_eq!(lib_path("/etc/passwd"), None);
    }

    #[test]
    fn fd_namespacing() {
        let lib = 5;
        let host = fd_to_host(lib);
        assert!(is_lib_fd(host));
        assert_eq!(fd_to_lib(host), lib);
        assert!(!is_lib_fd(100));
    }

    #[test]
    fn parent_keys() {
        assert_eq!(parent_key("/a").as_deref(), Some("/"));
        assert_eq!(parent_key("/a/b/c").as_deref(), Some("/a/b"));
        assert_eq!(parent_key("/"), None);
    }
}
