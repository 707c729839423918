//! Chained hash maps backing the directory caches: one global map keyed by
//! full path, one per directory keyed by leaf name.
//!
//! Buckets carry their own spinlocks and a dead flag; a resize is claimed
//! by a single thread through a CAS, moves every chain into a freshly
//! sized table while marking old buckets dead, and then swaps the table
//! pointer. Racing operations that land on a dead bucket redirect to the
//! resize target, or retry after the swap. Each bucket also keeps a
//! hash-keyed tree for fast absent checks; an equal-hash insert into the
//! tree is not an error, the chain resolves true collisions.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::range_tree::DirTree;

const HASH_SIZES: [u64; 15] = [
    1063, 2153, 4363, 8219, 16763, 32957, 64601, 128983, 256541, 512959, 1024921, 2048933,
    4096399, 8192003, 16384001,
];

fn hash_min_size() -> u64 {
    HASH_SIZES[0]
}

fn hash_max_size() -> u64 {
    HASH_SIZES[HASH_SIZES.len() - 1]
}

/// FNV-1a over the key bytes.
pub fn hash_bytes(key: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in key {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

struct ChItem {
    key: Box<[u8]>,
    val: u64,
    val2: u64,
}

struct BucketInner {
    items: Vec<ChItem>,
    /// hash -> occurrence count; a find miss proves absence without a
    /// chain walk.
    hashes: DirTree,
    dead: bool,
}

struct Bucket {
    inner: Mutex<BucketInner>,
}

impl Bucket {
    fn new() -> Bucket {
        Bucket {
            inner: Mutex::new(BucketInner {
                items: Vec::new(),
                hashes: DirTree::new(),
                dead: false,
            }),
        }
    }
}

impl BucketInner {
    fn note_hash(&mut self, h: u64) {
        match self.hashes.find(h) {
            Some(n) => self.hashes.update(h, n + 1),
            None => self.hashes.insert(h, 1).expect("fresh hash key"),
        }
    }

    fn drop_hash(&mut self, h: u64) {
        match self.hashes.find(h) {
            Some(1) | None => {
                let _ = self.hashes.erase(h);
            }
            Some(n) => self.hashes.update(h, n - 1),
        }
    }
}

struct Table {
    buckets: Box<[Bucket]>,
}

impl Table {
    fn new(n: u64) -> Arc<Table> {
        let buckets: Vec<Bucket> = (0..n).map(|_| Bucket::new()).collect();
        Arc::new(Table {
            buckets: buckets.into_boxed_slice(),
        })
    }

    fn index(&self, h: u64) -> usize {
        (h % self.buckets.len() as u64) as usize
    }
}

pub struct ChainHash {
    table: RwLock<Arc<Table>>,
    resize_target: Mutex<Option<Arc<Table>>>,
    /// 0 when idle; claimed by CAS to keep resizing single-threaded.
    resize_claim: AtomicU64,
    size: AtomicU64,
    dead: AtomicBool,
}

impl ChainHash {
    /// `size_idx` selects the initial bucket count from the prime ladder.
    pub fn new(size_idx: usize) -> ChainHash {
        let n = HASH_SIZES[size_idx.min(HASH_SIZES.len() - 1)];
        ChainHash {
            table: RwLock::new(Table::new(n)),
            resize_target: Mutex::new(None),
            resize_claim: AtomicU64::new(0),
            size: AtomicU64::new(0),
            dead: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn nbuckets(&self) -> u64 {
        self.table.read().buckets.len() as u64
    }

    /// Run `f` on the live bucket for `h`, following the dead-bucket
    /// redirect across a concurrent resize.
    fn with_bucket<R>(&self, h: u64, mut f: impl FnMut(&mut BucketInner) -> R) -> R {
        loop {
            let t = self.table.read().clone();
            {
                let mut g = t.buckets[t.index(h)].inner.lock();
                if !g.dead {
                    return f(&mut g);
                }
            }
            let rt = self.resize_target.lock().clone();
            if let Some(rt) = rt {
                let mut g = rt.buckets[rt.index(h)].inner.lock();
                if !g.dead {
                    return f(&mut g);
                }
            }
            // The swap completed while we looked; the main table is fresh.
            core::hint::spin_loop();
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<(u64, u64)> {
        let h = hash_bytes(key);
        self.with_bucket(h, |b| {
            b.hashes.find(h)?;
            b.items
                .iter()
                .find(|i| &*i.key == key)
                .map(|i| (i.val, i.val2))
        })
    }

    pub fn insert(&self, key: &[u8], val: u64, val2: u64) -> bool {
        if self.is_dead() {
            return false;
        }
        let h = hash_bytes(key);
        let inserted = self.with_bucket(h, |b| {
            if self.is_dead() {
                return false;
            }
            if b.hashes.find(h).is_some() && b.items.iter().any(|i| &*i.key == key) {
                return false;
            }
            b.items.push(ChItem {
                key: key.to_vec().into_boxed_slice(),
                val,
                val2,
            });
            b.note_hash(h);
            true
        });
        if inserted {
            let _ = self.size.fetch_add(1, Ordering::AcqRel);
            self.maybe_grow();
        }
        inserted
    }

    pub fn remove(&self, key: &[u8]) -> Option<(u64, u64)> {
        let h = hash_bytes(key);
        let removed = self.with_bucket(h, |b| {
            b.hashes.find(h)?;
            let idx = b.items.iter().position(|i| &*i.key == key)?;
            let item = b.items.remove(idx);
            b.drop_hash(h);
            Some((item.val, item.val2))
        });
        if removed.is_some() {
            let _ = self.size.fetch_sub(1, Ordering::AcqRel);
            self.maybe_shrink();
        }
        removed
    }

    /// Remove every entry whose key begins with `prefix`. A full-path map
    /// needs this when a directory moves: descendant keys cannot be found
    /// by hash, only by sweeping the chains. Returns how many went.
    pub fn remove_prefixed(&self, prefix: &[u8]) -> usize {
        let mut removed = 0usize;
        'retry: loop {
            let t = self.table.read().clone();
            for b in t.buckets.iter() {
                let mut g = b.inner.lock();
                if g.dead {
                    // A resize is migrating this chain; sweep the fresh
                    // table from the top. Entries already removed stay
                    // removed.
                    drop(g);
                    core::hint::spin_loop();
                    continue 'retry;
                }
                let mut i = 0;
                while i < g.items.len() {
                    if g.items[i].key.starts_with(prefix) {
                        let item = g.items.remove(i);
                        let h = hash_bytes(&item.key);
                        g.drop_hash(h);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            }
            break;
        }
        if removed > 0 {
            let _ = self.size.fetch_sub(removed as u64, Ordering::AcqRel);
            self.maybe_shrink();
        }
        removed
    }

    /// Point the existing entry's second value somewhere else.
    pub fn set_val2(&self, key: &[u8], val2: u64) -> bool {
        let h = hash_bytes(key);
        self.with_bucket(h, |b| {
            for i in b.items.iter_mut() {
                if &*i.key == key {
                    i.val2 = val2;
                    return true;
                }
            }
            false
        })
    }

    /// Rename's two-table atomic step: check the destination against
    /// `dst_exist`, move `ksrc` out of `src`, and bind `kdst` here to
    /// (`vsrc`, `vsrc2`) — all under both bucket locks, taken in address
    /// order.
    pub fn replace_from(
        &self,
        kdst: &[u8],
        dst_exist: bool,
        src: &ChainHash,
        ksrc: &[u8],
        vsrc: u64,
        vsrc2: u64,
    ) -> bool {
        let hd = hash_bytes(kdst);
        let hs = hash_bytes(ksrc);

        loop {
            if self.is_dead() {
                return false;
            }
            let td = self.table.read().clone();
            let ts = src.table.read().clone();
            let bd = &td.buckets[td.index(hd)];
            let bs = &ts.buckets[ts.index(hs)];

            // Both bucket locks, in address order; guards drop before any
            // resize this move may trigger.
            let outcome: Option<bool> = if core::ptr::eq(bd, bs) {
                let mut g = bd.inner.lock();
                if g.dead {
                    None
                } else {
                    Some(
                        Self::replace_in_one(&mut g, kdst, hd, dst_exist, ksrc, hs, vsrc, vsrc2)
                            .unwrap_or(false),
                    )
                }
            } else {
                let dst_first = (bd as *const Bucket) < (bs as *const Bucket);
                let (first, second) = if dst_first { (bd, bs) } else { (bs, bd) };
                let mut g1 = first.inner.lock();
                let mut g2 = second.inner.lock();
                if g1.dead || g2.dead {
                    None
                } else {
                    let (dst_b, src_b) = if dst_first {
                        (&mut *g1, &mut *g2)
                    } else {
                        (&mut *g2, &mut *g1)
                    };
                    Some(Self::replace_two(
                        dst_b, src_b, kdst, hd, dst_exist, ksrc, hs, vsrc, vsrc2,
                    ))
                }
            };

            match outcome {
                None => {
                    // A resize moved one of the buckets; take the fresh
                    // table on the next pass.
                    core::hint::spin_loop();
                }
                Some(true) => {
                    Self::replace_post(self, src);
                    return true;
                }
                Some(false) => return false,
            }
        }
    }

    fn replace_two(
        dst_b: &mut BucketInner,
        src_b: &mut BucketInner,
        kdst: &[u8],
        hd: u64,
        dst_exist: bool,
        ksrc: &[u8],
        hs: u64,
        vsrc: u64,
        vsrc2: u64,
    ) -> bool {
        let src_idx = match src_b.items.iter().position(|i| &*i.key == ksrc) {
            Some(i) => i,
            None => return false,
        };
        match dst_b.items.iter_mut().find(|i| &*i.key == kdst) {
            Some(d) => {
                if !dst_exist {
                    return false;
                }
                d.val = vsrc;
                d.val2 = vsrc2;
            }
            None => {
                if dst_exist {
                    return false;
                }
                dst_b.items.push(ChItem {
                    key: kdst.to_vec().into_boxed_slice(),
                    val: vsrc,
                    val2: vsrc2,
                });
                dst_b.note_hash(hd);
            }
        }
        let _ = src_b.items.remove(src_idx);
        src_b.drop_hash(hs);
        true
    }

    /// Both keys hash into one bucket.
    fn replace_in_one(
        b: &mut BucketInner,
        kdst: &[u8],
        hd: u64,
        dst_exist: bool,
        ksrc: &[u8],
        hs: u64,
        vsrc: u64,
        vsrc2: u64,
    ) -> Option<bool> {
        let src_idx = b.items.iter().position(|i| &*i.key == ksrc)?;
        let dst_idx = b.items.iter().position(|i| &*i.key == kdst);
        match dst_idx {
            Some(d) => {
                if !dst_exist {
                    return Some(false);
                }
                b.items[d].val = vsrc;
                b.items[d].val2 = vsrc2;
            }
            None => {
                if dst_exist {
                    return Some(false);
                }
                b.items.push(ChItem {
                    key: kdst.to_vec().into_boxed_slice(),
                    val: vsrc,
                    val2: vsrc2,
                });
                b.note_hash(hd);
            }
        }
        let _ = b.items.remove(src_idx);
        b.drop_hash(hs);
        Some(true)
    }

    fn replace_post(dst: &ChainHash, src: &ChainHash) {
        let _ = src.size.fetch_sub(1, Ordering::AcqRel);
        let _ = dst.size.fetch_add(1, Ordering::AcqRel);
        src.maybe_shrink();
        dst.maybe_grow();
    }

    /// Refuse unless the map is empty; an emptied directory dies exactly
    /// once.
    pub fn remove_and_kill(&self) -> bool {
        if self.is_dead() || self.size.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.dead.store(true, Ordering::Release);
        true
    }

    /// Unconditional teardown; `on_drop` sees every removed value.
    pub fn forced_kill(&self, mut on_drop: impl FnMut(u64)) {
        let t = self.table.read().clone();
        for b in t.buckets.iter() {
            let mut g = b.inner.lock();
            for item in g.items.drain(..) {
                on_drop(item.val);
                let _ = self.size.fetch_sub(1, Ordering::AcqRel);
            }
            g.hashes.clear();
        }
        self.dead.store(true, Ordering::Release);
    }

    /// Cursor walk in bucket order: the first key after `prev`, or the
    /// first key overall.
    pub fn enumerate(&self, prev: Option<&[u8]>) -> Option<Vec<u8>> {
        let t = self.table.read().clone();
        let n = t.buckets.len();
        let start = match prev {
            Some(p) => t.index(hash_bytes(p)),
            None => 0,
        };
        let mut skipping = prev.is_some();
        for i in start..n {
            let g = t.buckets[i].inner.lock();
            for item in g.items.iter() {
                if skipping {
                    if prev == Some(&*item.key) {
                        skipping = false;
                    }
                    continue;
                }
                return Some(item.key.to_vec());
            }
        }
        None
    }

    fn next_size(&self, enlarge: bool) -> Option<u64> {
        let cur = self.nbuckets();
        let idx = HASH_SIZES.iter().position(|s| *s == cur)?;
        if enlarge {
            HASH_SIZES.get(idx + 1).copied()
        } else {
            idx.checked_sub(1).map(|i| HASH_SIZES[i])
        }
    }

    fn maybe_grow(&self) {
        if self.nbuckets() != hash_max_size()
            && self.size.load(Ordering::Acquire) > self.nbuckets() * crate::params::DIR_REHASH_FACTOR
        {
            self.resize(true);
        }
    }

    fn maybe_shrink(&self) {
        if self.nbuckets() != hash_min_size()
            && self.size.load(Ordering::Acquire) * crate::params::DIR_REHASH_FACTOR
                < self.nbuckets()
        {
            self.resize(false);
        }
    }

    /// Single-threaded by the claim CAS; everyone else redirects via the
    /// dead flags until the table pointer swaps.
    fn resize(&self, enlarge: bool) {
        if self
            .resize_claim
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let new_size = match self.next_size(enlarge) {
            Some(s) => s,
            None => {
                self.resize_claim.store(0, Ordering::Release);
                return;
            }
        };
        self.resize_claim.store(new_size, Ordering::Release);

        let new_table = Table::new(new_size);
        *self.resize_target.lock() = Some(new_table.clone());

        let old = self.table.read().clone();
        for b in old.buckets.iter() {
            let mut g = b.inner.lock();
            g.dead = true;
            for item in g.items.drain(..) {
                let h = hash_bytes(&item.key);
                let nb = &new_table.buckets[new_table.index(h)];
                let mut ng = nb.inner.lock();
                ng.items.push(item);
                ng.note_hash(h);
            }
            g.hashes.clear();
        }

        *self.table.write() = new_table;
        *self.resize_target.lock() = None;
        self.resize_claim.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove() {
        let h = ChainHash::new(0);
        assert!(h.insert(b"alpha", 7, 100));
        assert!(!h.insert(b"alpha", 8, 200));
        assert_eq!(h.lookup(b"alpha"), Some((7, 100)));
        assert!(h.set_val2(b"alpha", 300));
        assert_eq!(h.lookup(b"alpha"), Some((7, 300)));
        assert_eq!(h.remove(b"alpha"), Some((7, 300)));
        assert_eq!(h.lookup(b"alpha"), None);
        assert!(h.is_empty());
    }

    #[test]
    fn replace_from_moves_between_maps() {
        let src = ChainHash::new(0);
        let dst = ChainHash::new(0);
        assert!(src.insert(b"old", 5, 50));

        // Destination must not exist when dst_exist is false.
        assert!(dst.replace_from(b"new", false, &src, b"old", 5, 50));
        assert_eq!(src.lookup(b"old"), None);
        assert_eq!(dst.lookup(b"new"), Some((5, 50)));

        // And must exist when dst_exist is true.
        assert!(src.insert(b"old2", 6, 60));
        assert!(!dst.replace_from(b"absent", true, &src, b"old2", 6, 60));
        assert!(dst.replace_from(b"new", true, &src, b"old2", 6, 60));
        assert_eq!(dst.lookup(b"new"), Some((6, 60)));
        assert_eq!(dst.len(), 1);
        assert_eq!(src.len(), 0);
    }

    #[test]
    fn remove_prefixed_sweeps_descendants_only() {
        let h = ChainHash::new(0);
        assert!(h.insert(b"/d", 1, 0));
        assert!(h.insert(b"/d/a", 2, 0));
        assert!(h.insert(b"/d/sub/deep", 3, 0));
        assert!(h.insert(b"/dx", 4, 0));
        assert_eq!(h.remove_prefixed(b"/d/"), 2);
        assert_eq!(h.lookup(b"/d"), Some((1, 0)));
        assert_eq!(h.lookup(b"/d/a"), None);
        assert_eq!(h.lookup(b"/d/sub/deep"), None);
        assert_eq!(h.lookup(b"/dx"), Some((4, 0)));
        assert_eq!(h.len(), 2);
        assert_eq!(h.remove_prefixed(b"/d/"), 0);
    }

    #[test]
    fn kill_requires_empty() {
        let h = ChainHash::new(0);
        assert!(h.insert(b"x", 1, 0));
        assert!(!h.remove_and_kill());
        let _ = h.remove(b"x");
        assert!(h.remove_and_kill());
        assert!(!h.insert(b"y", 2, 0));
    }

    #[test]
    fn resize_preserves_entries() {
        let h = ChainHash::new(0);
        let n = (hash_min_size() * crate::params::DIR_REHASH_FACTOR + 10) as u64;
        for i in 0..n {
            assert!(h.insert(format!("key-{}", i).as_bytes(), i, i * 2));
        }
        assert!(h.nbuckets() > hash_min_size());
        for i in 0..n {
            assert_eq!(
                h.lookup(format!("key-{}", i).as_bytes()),
                Some((i, i * 2)),
                "entry {} lost in resize",
                i
            );
        }
    }

    #[test]
    fn enumerate_visits_every_key_once() {
        let h = ChainHash::new(0);
        for i in 0..100u64 {
            assert!(h.insert(format!("k{}", i).as_bytes(), i, 0));
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor: Option<Vec<u8>> = None;
        while let Some(k) = h.enumerate(cursor.as_deref()) {
            assert!(seen.insert(k.clone()), "key visited twice");
            cursor = Some(k);
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn concurrent_insert_during_resize() {
        use std::sync::Arc;
        let h = Arc::new(ChainHash::new(0));
        let mut joins = Vec::new();
        for t in 0..4 {
            let h = h.clone();
            joins.push(std::thread::spawn(move || {
                for i in 0..2000u64 {
                    assert!(h.insert(format!("t{}-{}", t, i).as_bytes(), i, 0));
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(h.len(), 8000);
        for t in 0..4 {
            for i in 0..2000u64 {
                assert!(h.lookup(format!("t{}-{}", t, i).as_bytes()).is_some());
            }
        }
    }
}
