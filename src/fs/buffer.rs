//! Buffer cache.
//!
//! Caches fixed-size device clusters keyed by `(ino, logical block,
//! type)`. Every entry is discoverable through a hash table and linked on
//! exactly one of four lists: `UNUSED`, `CLEAN`, `DIRTY` or `FLUSHING`.
//! Eviction is LRU within `CLEAN`; dirty and flushing entries are never
//! evictable, and neither is any entry with a positive reference count.
//!
//! Buffer and inode-context back-references are arena indices: an entry
//! records the contexts whose inode slot it holds, a context records the
//! entry pinning its slot, and [`FileSystem::remove_bhs_in_bc`] walks the
//! relation to detach both sides before an entry is reused or flushed.

use core::ops::{Deref, DerefMut};

use hashbrown::HashMap;
use log::warn;

use crate::err::{FsError, IoResult};
use crate::fs::layout::{InodeNo, Lbno, Pbno, CLUSTER_SIZE};
use crate::fs::FileSystem;

/// Buffers handed back to the control plane per budget message.
pub const BUFFER_ALLOC_SIZE_PER_MSG: usize = 64;
/// `UNUSED` watermark beyond which a data plane returns buffers.
pub const BUFFER_IDLE_WATERMARK: usize = 4 * BUFFER_ALLOC_SIZE_PER_MSG;

/// A cluster-sized, cluster-aligned I/O buffer. The alignment makes the
/// buffer directly usable for kernel-bypass submission and lets on-disk
/// records be cast out of it.
#[repr(C, align(4096))]
pub struct ClusterBuf(pub [u8; CLUSTER_SIZE]);

impl ClusterBuf {
    pub fn new() -> Box<Self> {
        Box::new(ClusterBuf([0u8; CLUSTER_SIZE]))
    }
}

impl Deref for ClusterBuf {
    type Target = [u8; CLUSTER_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ClusterBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufType {
    Meta,
    Data,
}

/// Cache key. The buffer type is an attribute of the entry, not part of
/// the key: truncation must find a directory's clusters no matter which
/// path loaded them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufKey {
    pub ino: InodeNo,
    pub lblk: Lbno,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufList {
    Unused = 0,
    Clean = 1,
    Dirty = 2,
    Flushing = 3,
}

pub const BUFFER_LIST_NUM: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BhMode {
    /// Return the on-device content, reading it on a miss.
    Read,
    /// Return a zeroed buffer for a block about to be written whole.
    New,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertPos {
    Head,
    Tail,
}

/// A pinned reference to a cache entry.
#[derive(Clone, Copy, Debug)]
pub struct Bh {
    pub(crate) idx: usize,
}

pub(crate) struct BufferEntry {
    pub key: BufKey,
    pub btype: BufType,
    pub pno: Pbno,
    pub load: bool,
    pub dirty: bool,
    pub refcnt: u32,
    pub list: BufList,
    prev: Option<usize>,
    next: Option<usize>,
    /// Inode contexts whose slot lives in this buffer.
    pub ictxs: Vec<usize>,
    pub buf: Box<ClusterBuf>,
}

impl BufferEntry {
    fn new() -> Self {
        Self {
            key: BufKey { ino: 0, lblk: 0 },
            btype: BufType::Meta,
            pno: 0,
            load: false,
            dirty: false,
            refcnt: 0,
            list: BufList::Unused,
            prev: None,
            next: None,
            ictxs: Vec::new(),
            buf: ClusterBuf::new(),
        }
    }

    fn reset(&mut self) {
        self.key = BufKey { ino: 0, lblk: 0 };
        self.btype = BufType::Meta;
        self.pno = 0;
        self.load = false;
        self.dirty = false;
        self.refcnt = 0;
    }
}

#[derive(Clone, Copy, Default)]
struct ListState {
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
}

pub struct BufferCache {
    entries: Vec<BufferEntry>,
    map: HashMap<BufKey, usize>,
    lists: [ListState; BUFFER_LIST_NUM],
}

impl BufferCache {
    pub fn new(clusters: usize) -> Self {
        let mut cache = Self {
            entries: Vec::with_capacity(clusters),
            map: HashMap::with_capacity(clusters),
            lists: [ListState::default(); BUFFER_LIST_NUM],
        };
        cache.grow(clusters);
        cache
    }

    /// Adds `count` fresh buffers to the `UNUSED` list.
    pub fn grow(&mut self, count: usize) {
        for _ in 0..count {
            self.entries.push(BufferEntry::new());
            let idx = self.entries.len() - 1;
            self.push(BufList::Unused, idx, InsertPos::Head);
        }
    }

    /// Detaches up to `count` buffers from the `UNUSED` list, returning
    /// how many were actually removed. The slots stay allocated but are
    /// parked outside every list until re-grown.
    pub fn shrink_unused(&mut self, count: usize) -> usize {
        let mut removed = 0;
        while removed < count {
            let Some(idx) = self.lists[BufList::Unused as usize].head else {
                break;
            };
            self.unlink(idx);
            // Parked: not a member of any list, not discoverable.
            self.entries[idx].reset();
            removed += 1;
        }
        removed
    }

    pub fn list_count(&self, list: BufList) -> usize {
        self.lists[list as usize].count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn lookup(&self, key: &BufKey) -> Option<usize> {
        self.map.get(key).copied()
    }

    pub fn data(&self, bh: Bh) -> &[u8; CLUSTER_SIZE] {
        &self.entries[bh.idx].buf
    }

    pub fn data_mut(&mut self, bh: Bh) -> &mut [u8; CLUSTER_SIZE] {
        &mut self.entries[bh.idx].buf
    }

    pub(crate) fn entry(&self, idx: usize) -> &BufferEntry {
        &self.entries[idx]
    }

    pub(crate) fn entry_mut(&mut self, idx: usize) -> &mut BufferEntry {
        &mut self.entries[idx]
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next, list) = {
            let e = &self.entries[idx];
            (e.prev, e.next, e.list)
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.lists[list as usize].head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.lists[list as usize].tail = prev,
        }
        self.entries[idx].prev = None;
        self.entries[idx].next = None;
        self.lists[list as usize].count -= 1;
    }

    fn push(&mut self, list: BufList, idx: usize, pos: InsertPos) {
        match pos {
            InsertPos::Head => {
                let head = self.lists[list as usize].head;
                self.entries[idx].prev = None;
                self.entries[idx].next = head;
                match head {
                    Some(h) => self.entries[h].prev = Some(idx),
                    None => self.lists[list as usize].tail = Some(idx),
                }
                self.lists[list as usize].head = Some(idx);
            }
            InsertPos::Tail => {
                let tail = self.lists[list as usize].tail;
                self.entries[idx].next = None;
                self.entries[idx].prev = tail;
                match tail {
                    Some(t) => self.entries[t].next = Some(idx),
                    None => self.lists[list as usize].head = Some(idx),
                }
                self.lists[list as usize].tail = Some(idx);
            }
        }
        self.lists[list as usize].count += 1;
        self.entries[idx].list = list;
    }

    /// Attaches a detached entry to a list. Only valid straight after
    /// [`BufferCache::pop_head`].
    pub(crate) fn push_entry(&mut self, list: BufList, idx: usize, pos: InsertPos) {
        self.push(list, idx, pos);
    }

    /// Moves an entry between lists, keeping the one-list invariant.
    pub(crate) fn move_to(&mut self, idx: usize, list: BufList, pos: InsertPos) {
        self.unlink(idx);
        self.push(list, idx, pos);
    }

    /// Pops the head of a list, if any.
    pub(crate) fn pop_head(&mut self, list: BufList) -> Option<usize> {
        let idx = self.lists[list as usize].head?;
        self.unlink(idx);
        Some(idx)
    }

    /// LRU victim: the tail-most `CLEAN` entry with no holders.
    fn clean_victim(&self) -> Option<usize> {
        let mut cursor = self.lists[BufList::Clean as usize].tail;
        while let Some(idx) = cursor {
            if self.entries[idx].refcnt == 0 {
                return Some(idx);
            }
            cursor = self.entries[idx].prev;
        }
        None
    }

    pub(crate) fn insert_key(&mut self, key: BufKey, idx: usize) {
        self.map.insert(key, idx);
    }

    pub(crate) fn remove_key(&mut self, key: &BufKey) {
        self.map.remove(key);
    }
}

impl FileSystem {
    /// Returns a pinned buffer head for `(ino, lblk, btype)`.
    ///
    /// On a miss a slot is taken from `UNUSED` (or reclaimed from the
    /// `CLEAN` LRU tail), the physical block is resolved through the inode
    /// block map or the block group geometry for pseudo-inodes, and the
    /// cluster is read synchronously (`Read`) or zeroed (`New`).
    pub(crate) fn get_bh(
        &mut self,
        ictx: Option<usize>,
        ino: InodeNo,
        lblk: Lbno,
        mode: BhMode,
        btype: BufType,
    ) -> IoResult<Bh> {
        let key = BufKey { ino, lblk };

        if let Some(idx) = self.bc.lookup(&key) {
            let entry = self.bc.entry_mut(idx);
            entry.refcnt += 1;
            if mode == BhMode::New && !entry.load {
                entry.buf.fill(0);
                entry.load = true;
            }
            return Ok(Bh { idx });
        }

        let idx = self.take_slot()?;
        let pno = self.get_pbn(ictx, ino, lblk)?;

        {
            let entry = self.bc.entry_mut(idx);
            entry.key = key;
            entry.btype = btype;
            entry.pno = pno;
            entry.refcnt = 1;
            entry.dirty = false;
        }

        match mode {
            BhMode::New => {
                self.bc.entry_mut(idx).buf.fill(0);
            }
            BhMode::Read if pno == 0 => {
                warn!(target: "buffer", "read of unallocated block ino {ino} lblk {lblk}");
                self.bc.entry_mut(idx).buf.fill(0);
            }
            BhMode::Read => {
                self.dev.read_cluster(&mut self.bc.entry_mut(idx).buf.0, pno)?;
            }
        }
        self.bc.entry_mut(idx).load = true;

        self.bc.insert_key(key, idx);
        self.bc.move_to(idx, BufList::Clean, InsertPos::Head);
        Ok(Bh { idx })
    }

    /// Drops one pin. A dirty release moves the entry to `DIRTY`
    /// (idempotently); a clean release of the last pin repositions it in
    /// `CLEAN` at the chosen end.
    pub(crate) fn release_bh(&mut self, bh: Bh, pos: InsertPos, dirty: bool) {
        let entry = self.bc.entry_mut(bh.idx);
        assert!(entry.refcnt > 0, "release of an unpinned buffer");
        entry.refcnt -= 1;

        if dirty {
            entry.dirty = true;
        }

        let (is_dirty, list) = (entry.dirty, entry.list);
        if is_dirty {
            if list != BufList::Dirty && list != BufList::Flushing {
                self.bc.move_to(bh.idx, BufList::Dirty, InsertPos::Tail);
            }
        } else if list == BufList::Clean {
            self.bc.move_to(bh.idx, BufList::Clean, pos);
        }
    }

    /// Finds a recyclable slot: `UNUSED` first, then the `CLEAN` LRU tail
    /// (flushing dirty buffers once if both are exhausted). A data plane
    /// asks the control plane for more buffers before reclaiming.
    fn take_slot(&mut self) -> IoResult<usize> {
        if self.params.role == crate::fs::ProcessRole::Data
            && self.bc.list_count(BufList::Unused) == 0
            && self.request_buffers(BUFFER_ALLOC_SIZE_PER_MSG as u32).unwrap_or(false)
        {
            self.bc.grow(BUFFER_ALLOC_SIZE_PER_MSG);
        }

        if let Some(idx) = self.bc.pop_head(BufList::Unused) {
            // pop_head detached it; reattach so the entry is list-resident
            // until get_bh moves it to CLEAN.
            self.bc.push(BufList::Clean, idx, InsertPos::Head);
            return Ok(idx);
        }

        if let Some(idx) = self.evict_clean() {
            return Ok(idx);
        }

        self.check_flush_dirty(crate::fs::flush::FlushMode::Force)?;

        self.evict_clean()
            .ok_or(FsError::Fatal("buffer cache exhausted: every buffer pinned"))
    }

    fn evict_clean(&mut self) -> Option<usize> {
        let idx = self.bc.clean_victim()?;
        self.remove_bhs_in_bc(idx);
        let key = self.bc.entry(idx).key;
        self.bc.remove_key(&key);
        self.bc.entry_mut(idx).reset();
        self.bc.entry_mut(idx).refcnt = 0;
        Some(idx)
    }

    /// Detaches every inode-context back-reference from entry `idx`,
    /// unpinning once per context.
    pub(crate) fn remove_bhs_in_bc(&mut self, idx: usize) {
        let ids: Vec<usize> = self.bc.entry_mut(idx).ictxs.drain(..).collect();
        for ictx_id in ids {
            self.ictxc.detach(ictx_id);
            let entry = self.bc.entry_mut(idx);
            assert!(entry.refcnt > 0, "orphan inode-context reference");
            entry.refcnt -= 1;
        }
    }

    /// Discards the cached buffer for `(ino, lblk)` into `UNUSED`, if
    /// present. Used when truncation invalidates cached blocks.
    pub(crate) fn discard_buffer(&mut self, ino: InodeNo, lblk: Lbno) -> bool {
        let key = BufKey { ino, lblk };
        let Some(idx) = self.bc.lookup(&key) else {
            return false;
        };
        self.remove_bhs_in_bc(idx);
        self.bc.remove_key(&key);
        let entry = self.bc.entry_mut(idx);
        entry.reset();
        self.bc.move_to(idx, BufList::Unused, InsertPos::Head);
        true
    }

    /// Returns surplus `UNUSED` buffers to the control plane, a batch per
    /// message, while the idle watermark is exceeded.
    pub(crate) fn release_idle_buffers(&mut self) -> IoResult<()> {
        if self.params.role != crate::fs::ProcessRole::Data || self.params.preallocation {
            return Ok(());
        }
        while self.bc.list_count(BufList::Unused) >= BUFFER_IDLE_WATERMARK {
            let removed = self.bc.shrink_unused(BUFFER_ALLOC_SIZE_PER_MSG);
            if removed == 0 {
                break;
            }
            self.return_buffers(removed as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_live_on_exactly_one_list() {
        let mut bc = BufferCache::new(8);
        assert_eq!(bc.list_count(BufList::Unused), 8);

        let idx = bc.pop_head(BufList::Unused).unwrap();
        bc.push(BufList::Clean, idx, InsertPos::Head);
        assert_eq!(bc.list_count(BufList::Unused), 7);
        assert_eq!(bc.list_count(BufList::Clean), 1);

        bc.move_to(idx, BufList::Dirty, InsertPos::Tail);
        assert_eq!(bc.list_count(BufList::Clean), 0);
        assert_eq!(bc.list_count(BufList::Dirty), 1);
    }

    #[test]
    fn lru_victim_skips_pinned_entries() {
        let mut bc = BufferCache::new(4);
        let a = bc.pop_head(BufList::Unused).unwrap();
        let b = bc.pop_head(BufList::Unused).unwrap();
        bc.push(BufList::Clean, a, InsertPos::Head);
        bc.push(BufList::Clean, b, InsertPos::Head);
        // `a` is at the tail (inserted first); pin it.
        bc.entry_mut(a).refcnt = 1;
        assert_eq!(bc.clean_victim(), Some(b));
        bc.entry_mut(b).refcnt = 1;
        assert_eq!(bc.clean_victim(), None);
    }

    #[test]
    fn dirty_list_drains_in_insertion_order() {
        let mut bc = BufferCache::new(4);
        let a = bc.pop_head(BufList::Unused).unwrap();
        let b = bc.pop_head(BufList::Unused).unwrap();
        let c = bc.pop_head(BufList::Unused).unwrap();
        bc.push(BufList::Dirty, a, InsertPos::Tail);
        bc.push(BufList::Dirty, b, InsertPos::Tail);
        bc.push(BufList::Dirty, c, InsertPos::Tail);
        assert_eq!(bc.pop_head(BufList::Dirty), Some(a));
        assert_eq!(bc.pop_head(BufList::Dirty), Some(b));
        assert_eq!(bc.pop_head(BufList::Dirty), Some(c));
        assert_eq!(bc.pop_head(BufList::Dirty), None);
    }
}
