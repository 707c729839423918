//! Path resolution, mapping, and the file data path.
//!
//! Lookups hit the global full-path map first; a miss walks from the root,
//! mapping and indexing each directory it crosses. File reads and writes
//! run over the DRAM index mirror, copying small spans inline and handing
//! large ones to the agents.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::layout::is_norm_fidx;
use crate::libfs::delegation::{
    complete_delegation, do_read_delegation, do_write_delegation, reset_counters, IssuedCounts,
};
use crate::libfs::mnode::{InodeRef, Mnode};
use crate::libfs::{tls, LibFs};
use crate::params::{
    file_block_round_down, file_block_round_up, FILE_BLOCK_PAGE_CNT, FILE_BLOCK_SIZE, NAME_MAX,
    PAGE_SIZE, PM_MAX_INS,
};
use crate::pm::PmOffset;
use crate::pmem;
use crate::stat::FileType;

// ---- paths -----------------------------------------------------------

/// Split an absolute path into its elements; rejects over-long names.
pub fn path_elements(path: &str) -> Option<Vec<&str>> {
    if !path.starts_with('/') {
        log::warn!("relative path rejected: {}", path);
        return None;
    }
    let mut out = Vec::new();
    for elem in path.split('/') {
        if elem.is_empty() {
            continue;
        }
        if elem.len() > NAME_MAX - 1 {
            log::warn!("path element longer than {} bytes", NAME_MAX - 1);
            return None;
        }
        out.push(elem);
    }
    Some(out)
}

fn join_key(elems: &[&str]) -> String {
    if elems.is_empty() {
        "/".to_string()
    } else {
        let mut s = String::new();
        for e in elems {
            s.push('/');
            s.push_str(e);
        }
        s
    }
}

fn child_key(prefix: &str, name: &str) -> String {
    if prefix == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Resolve `path` to an mnode, or — with `parent` — to its parent plus the
/// final element.
fn namex(fs: &LibFs, path: &str, parent: bool) -> Option<(Arc<Mnode>, String)> {
    let mut elems = path_elements(path)?;
    let leaf = if parent {
        if elems.is_empty() {
            return None;
        }
        elems.pop().map(|s| s.to_string())?
    } else {
        String::new()
    };

    // Fast path: the warm full-path map. The cache holds files too, so a
    // parent pulled from it still has to be a directory.
    let key = join_key(&elems);
    if let Some((ino, _)) = fs.dir_map.lookup(key.as_bytes()) {
        if let Some(m) = fs.mnode_get(ino as u32) {
            if parent && m.typ != FileType::Directory {
                return None;
            }
            return Some((m, leaf));
        }
    }

    // Slow path: walk from the root, mapping directories as we cross them.
    let mut m = fs.root();
    let mut prefix = "/".to_string();
    for name in elems {
        if m.typ != FileType::Directory {
            return None;
        }
        let pkey = prefix.clone();
        let ckey = child_key(&prefix, name);
        let next = match fs.dir_map.lookup(ckey.as_bytes()) {
            Some((ino, _)) => fs.mnode_get(ino as u32),
            None => {
                if map_file(fs, &m, false, Some(&pkey)).is_err() {
                    return None;
                }
                match fs.dir_map.lookup(ckey.as_bytes()) {
                    Some((ino, _)) => fs.mnode_get(ino as u32),
                    // A rename may have moved the directory under a new
                    // prefix; its leaf map is authoritative. Repair the
                    // full-path cache as we go.
                    None => m.dir_lookup(name.as_bytes()).and_then(|(ino, de)| {
                        let _ = fs.dir_map.insert(ckey.as_bytes(), ino as u64, de.0);
                        fs.mnode_get(ino)
                    }),
                }
            }
        }?;
        prefix = ckey;
        m = next;
    }

    // The walk only vets the directories it descends into; the node it
    // stops on can be anything. A parent lookup that lands on a file is a
    // miss, not a parent.
    if parent && m.typ != FileType::Directory {
        return None;
    }

    if m.typ == FileType::Directory {
        // Warm the target itself so the next lookup short-circuits.
        let _ = map_file(fs, &m, false, Some(&prefix));
    }
    Some((m, leaf))
}

pub fn namei(fs: &LibFs, path: &str) -> Option<Arc<Mnode>> {
    namex(fs, path, false).map(|(m, _)| m)
}

pub fn nameiparent(fs: &LibFs, path: &str) -> Option<(Arc<Mnode>, String)> {
    namex(fs, path, true)
}

/// The full-path key of `path`'s normalized form.
pub fn normalized_key(path: &str) -> Option<String> {
    path_elements(path).map(|e| join_key(&e))
}

// ---- mapping ---------------------------------------------------------

pub fn file_is_mapped(fs: &LibFs, m: &Mnode) -> bool {
    fs.ialloc.is_allocated(m.ino)
        || (fs.map_ring().test(m.ino) && fs.has_index().test(m.ino))
}

fn file_mapped_writable(fs: &LibFs, m: &Mnode) -> bool {
    fs.ialloc.is_allocated(m.ino) || fs.mapped_attr().test(m.ino)
}

/// Ask the supervisor to install the file and adopt its index offset.
/// Contended leases are retried until the holder releases or expires.
fn do_map_file(fs: &LibFs, m: &Mnode, writable: bool) -> Result<()> {
    let index_offset = loop {
        match fs.dev().map_file(m.ino, writable) {
            Ok(off) => break off,
            Err(Error::Again) => continue,
            Err(e) => {
                log::warn!("mapping ino {} writable {} failed: {}", m.ino, writable, e);
                return Err(e);
            }
        }
    };
    m.set_index_start(PmOffset(index_offset));
    if writable {
        fs.mapped_attr().set(m.ino);
    }
    fs.note_mapped(m.ino);
    Ok(())
}

/// Re-map read-write; the read->write lease upgrade stays disabled, so the
/// mapping is dropped and taken again.
fn remap_rw(fs: &LibFs, m: &Mnode) -> Result<()> {
    fs.dev().unmap_file(m.ino)?;
    do_map_file(fs, m, true)
}

/// Map `m` once for this client and build its index. Directory callers
/// pass the directory's own path so its children land in the global map.
///
/// Mappings are taken write-always; the upgrade path survives only as
/// `remap_rw`.
pub fn map_file(fs: &LibFs, m: &Mnode, writable: bool, dir_path: Option<&str>) -> Result<()> {
    let _ = writable;
    let writable = true;

    if file_is_mapped(fs, m) {
        if file_mapped_writable(fs, m) {
            return Ok(());
        }
        let _g = fs.map_lock(m.ino).lock();
        return remap_rw(fs, m);
    }

    let _g = fs.map_lock(m.ino).lock();
    if file_is_mapped(fs, m) {
        return Ok(());
    }
    do_map_file(fs, m, writable)?;
    if m.typ == FileType::Regular {
        file_build_index(fs, m);
    } else if let Some(path) = dir_path {
        dir_build_index(fs, m, path);
    }
    fs.has_index().set(m.ino);
    Ok(())
}

/// Build the flat page mirror by walking the on-media chain once.
pub fn file_build_index(fs: &LibFs, m: &Mnode) {
    let arena = fs.arena();
    let start = m.index_start();
    let mut slot = start;
    let mut idx = 0usize;
    if !start.is_null() {
        loop {
            // SAFETY: index slots of a file this client has mapped.
            let v = unsafe { *arena.at::<u64>(slot) };
            if v == 0 {
                break;
            }
            if is_norm_fidx(slot) {
                m.fill_index(idx, slot);
                idx += 1;
                slot = slot.add(8);
            } else {
                slot = PmOffset(v);
            }
        }
    }
    m.set_index_end(slot);
    let size = m.with_inode(fs, |i| i.size);
    m.set_size(size);
}

/// Build a directory's leaf map and register every child, both here and in
/// the global full-path map.
pub fn dir_build_index(fs: &LibFs, m: &Mnode, dir_path: &str) {
    let arena = fs.arena();
    let start = m.index_start();
    let mut slot = start;
    let mut idx = 0usize;
    if !start.is_null() {
        loop {
            // SAFETY: as in `file_build_index`.
            let v = unsafe { *arena.at::<u64>(slot) };
            if v == 0 {
                break;
            }
            if is_norm_fidx(slot) {
                m.fill_index(idx, slot);
                idx += 1;
                let block_off = PmOffset(v);
                Mnode::walk_block_entries(fs, block_off, |de, head| {
                    let name = crate::libfs::mnode::entry_name(fs, de);
                    let child_ino = head.ino_num;
                    let child = fs.mnode_get(child_ino).unwrap_or_else(|| {
                        let child = Mnode::new(
                            FileType::from_raw(head.inode.file_type),
                            child_ino,
                            m.ino,
                            InodeRef::Pm(crate::libfs::mnode::entry_inode_off(de)),
                        );
                        fs.mnode_set(child_ino, Some(child.clone()));
                        child
                    });
                    drop(child);
                    let _ = m
                        .dir
                        .as_ref()
                        .expect("directory mnode")
                        .map
                        .insert(&name, child_ino as u64, de.0);
                    let key = child_key(dir_path, &String::from_utf8_lossy(&name));
                    let _ = fs.dir_map.insert(key.as_bytes(), child_ino as u64, de.0);
                });
                slot = slot.add(8);
            } else {
                slot = PmOffset(v);
            }
        }
    }
    m.set_index_end(slot);
}

// ---- data path -------------------------------------------------------

/// Read up to `buf.len()` bytes at `start`; short reads stop at EOF or a
/// hole. Spans at or above the read threshold go to the agents.
pub fn readm(fs: &LibFs, m: &Mnode, buf: &mut [u8], start: u64) -> i64 {
    let mut end = m.size();
    if start + (buf.len() as u64) < end {
        end = start + buf.len() as u64;
    }

    let delegation = fs.delegation();
    let mut delegated = false;
    let mut issued: IssuedCounts = [0; PM_MAX_INS];
    let notify_idx = tls::my_index();
    if delegation {
        reset_counters(fs, notify_idx, 1);
    }

    let _rl = m.rw.read();
    let mut off = 0u64;
    while start + off < end {
        let pos = start + off;
        let pgbase = file_block_round_down(pos);
        let addr = match m.get_page(fs, (pgbase / FILE_BLOCK_SIZE as u64) as usize) {
            Some(a) => a,
            None => break,
        };
        let pgoff = pos - pgbase;
        let pgend = core::cmp::min(end - pgbase, FILE_BLOCK_SIZE as u64);
        let len = pgend - pgoff;

        if !delegation || (len as usize) < fs.read_delegation_limit() {
            // SAFETY: the extent is mapped under our lease; `buf` slices
            // are in bounds by construction.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    fs.arena().at::<u8>(addr.add(pgoff)),
                    buf.as_mut_ptr().add(off as usize),
                    len as usize,
                );
            }
        } else {
            delegated = true;
            do_read_delegation(
                fs,
                buf.as_ptr() as u64 + off,
                addr.add(pgoff),
                len,
                false,
                &mut issued,
                notify_idx,
                1,
            );
        }
        off += len;
    }

    if delegated {
        complete_delegation(fs, &issued, notify_idx, 1);
    }
    off as i64
}

/// Write `buf` at `start`, allocating extents as needed; gaps between the
/// old end and the write are densified with zeroed extents. Returns the
/// bytes written (short on allocation failure).
pub fn writem(fs: &LibFs, m: &Mnode, buf: &[u8], start: u64) -> i64 {
    let end = start + buf.len() as u64;

    let delegation = fs.delegation();
    let mut delegated = false;
    let mut issued: IssuedCounts = [0; PM_MAX_INS];
    let notify_idx = tls::my_index();
    if delegation {
        reset_counters(fs, notify_idx, 1);
    }

    // Growth takes the file lock exclusively; in-place writes share it.
    let whole_lock = end > m.size();
    let _wl;
    let _rl;
    if whole_lock {
        _wl = Some(m.rw.write());
        _rl = None;
    } else {
        _wl = None;
        _rl = Some(m.rw.read());
    }

    let mut off = 0u64;
    while start + off < end {
        let pos = start + off;
        let pgbase = file_block_round_down(pos);
        let pgoff = pos - pgbase;
        let pgend = core::cmp::min(end - pgbase, FILE_BLOCK_SIZE as u64);
        let len = pgend - pgoff;

        match m.get_page(fs, (pgbase / FILE_BLOCK_SIZE as u64) as usize) {
            Some(addr) => {
                let need_resize = pos + len > m.size();
                if !delegation || (len as usize) < fs.write_delegation_limit() {
                    // SAFETY: extent under our write lease.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            buf.as_ptr().add(off as usize),
                            fs.arena().at::<u8>(addr.add(pgoff)),
                            len as usize,
                        );
                    }
                    pmem::clwb_buffer(fs.arena().at::<u8>(addr.add(pgoff)), len as usize);
                } else {
                    delegated = true;
                    do_write_delegation(
                        fs,
                        buf.as_ptr() as u64 + off,
                        addr.add(pgoff),
                        len,
                        false,
                        true,
                        false,
                        &mut issued,
                        notify_idx,
                        1,
                    );
                }
                if need_resize {
                    m.resize_nogrow(fs, pos + len);
                }
            }
            None => {
                // Fill the hole up to this extent with zeroed blocks.
                let mut msize = m.size();
                let mut failed = false;
                while msize < pgbase {
                    if msize % FILE_BLOCK_SIZE as u64 != 0 {
                        let up = file_block_round_up(msize);
                        m.resize_nogrow(fs, up);
                        msize = up;
                    } else {
                        let blk = match fs.new_file_data_blocks(FILE_BLOCK_PAGE_CNT as u64, true)
                        {
                            Ok(b) => b,
                            Err(_) => {
                                failed = true;
                                break;
                            }
                        };
                        let addr = PmOffset::from_block(blk);
                        if m
                            .resize_append(fs, msize + FILE_BLOCK_SIZE as u64, addr)
                            .is_err()
                        {
                            failed = true;
                            break;
                        }
                        msize += FILE_BLOCK_SIZE as u64;
                    }
                }
                if failed {
                    break;
                }

                // The extent under the write itself; zero it only when the
                // write leaves a prefix exposed.
                let blk = match fs.new_file_data_blocks(FILE_BLOCK_PAGE_CNT as u64, pgoff != 0) {
                    Ok(b) => b,
                    Err(_) => break,
                };
                let addr = PmOffset::from_block(blk);
                if !delegation || (len as usize) < fs.write_delegation_limit() {
                    // SAFETY: freshly allocated extent, unreferenced.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            buf.as_ptr().add(off as usize),
                            fs.arena().at::<u8>(addr.add(pgoff)),
                            len as usize,
                        );
                    }
                    pmem::clwb_buffer(fs.arena().at::<u8>(addr.add(pgoff)), len as usize);
                } else {
                    delegated = true;
                    do_write_delegation(
                        fs,
                        buf.as_ptr() as u64 + off,
                        addr.add(pgoff),
                        len,
                        false,
                        true,
                        false,
                        &mut issued,
                        notify_idx,
                        1,
                    );
                }
                if m.resize_append(fs, pos + len, addr).is_err() {
                    break;
                }
            }
        }
        off += len;
    }

    if delegated {
        complete_delegation(fs, &issued, notify_idx, 1);
    }
    pmem::sfence();
    off as i64
}

/// Truncate to `length`: same size class is a pure size change, growth
/// densifies with zeroed extents, shrink publishes the boundary slot first
/// and then frees everything past it.
pub fn truncatem(fs: &LibFs, m: &Mnode, length: u64) -> Result<()> {
    let _wl = m.rw.write();
    let msize = m.size();
    let mbase = file_block_round_up(msize);
    let lbase = file_block_round_up(length);
    let arena = fs.arena();

    if mbase == lbase {
        m.resize_nogrow(fs, length);
    } else if mbase < lbase {
        let bcount = (lbase - mbase) / PAGE_SIZE as u64;
        let blk = fs.new_file_data_blocks(bcount, true)?;
        let mut i = 0u64;
        while i < bcount {
            let addr = PmOffset::from_block(blk + i);
            let grown = mbase + (i / FILE_BLOCK_PAGE_CNT as u64 + 1) * FILE_BLOCK_SIZE as u64;
            m.resize_append(fs, grown, addr)?;
            i += FILE_BLOCK_PAGE_CNT as u64;
        }
        m.resize_nogrow(fs, length);
    } else {
        if lbase == 0 {
            m.truncate_zero(fs);
            return Ok(());
        }
        let first_idx = (lbase / FILE_BLOCK_SIZE as u64) as usize;
        let slot0 = m.get_idx_slot(first_idx).ok_or(Error::InvalidArgument)?;

        // Record what lies past the boundary before tearing it down.
        let mut extents = Vec::new();
        let mut chain_pages = Vec::new();
        let mut slots = Vec::new();
        let mut slot = slot0;
        loop {
            // SAFETY: our own index under the write lock.
            let v = unsafe { *arena.at::<u64>(slot) };
            if v == 0 {
                break;
            }
            slots.push(slot);
            if is_norm_fidx(slot) {
                extents.push(PmOffset(v));
                slot = slot.add(8);
            } else {
                chain_pages.push(PmOffset(v));
                slot = PmOffset(v);
            }
        }

        // The boundary store is the atomic truncate publish.
        // SAFETY: as above.
        unsafe { *arena.at::<u64>(slot0) = 0 };
        pmem::clwb_buffer(arena.at::<u8>(slot0), 8);
        pmem::sfence();
        for s in slots.iter().skip(1) {
            // SAFETY: stale slots behind the published terminator.
            unsafe { *arena.at::<u64>(*s) = 0 };
        }

        for e in extents {
            if fs.balloc.is_owned(e.block()) {
                fs.free_data_blocks(e.block(), FILE_BLOCK_PAGE_CNT as u64);
            }
        }
        for p in chain_pages {
            if fs.balloc.is_owned(p.block()) {
                fs.free_data_blocks(p.block(), 1);
            }
        }

        m.pages_truncate(first_idx);
        m.set_index_end(slot0);
        m.resize_nogrow(fs, length);
    }
    Ok(())
}

/// Unmount sweep: drop whatever the map ring still records as installed.
pub fn unmap_mapped_inodes(fs: &LibFs) {
    let inos = fs.mapped_inodes();
    for ino in inos {
        if fs.map_ring().test(ino) {
            if let Err(e) = fs.dev().unmap_file(ino) {
                log::warn!("unmapping ino {} at unmount failed: {}", ino, e);
            }
        }
    }
}
