//! Inode-context cache.
//!
//! An inode context is the in-RAM decoded handle for one inode: the inode
//! record, a reference count, a dirty bit, and a back-reference to the
//! buffer holding the on-disk slot. While a context is attached, the
//! inode-table buffer stays pinned; a dirty release writes the record back
//! into the slot and releases the buffer dirty.
//!
//! Contexts for released inodes stay cached (bounded by
//! [`ICTX_CACHE_SIZE`]) so hot inodes skip the inode-table walk.

use bytemuck::bytes_of;
use hashbrown::HashMap;

use crate::err::{FsError, IoResult};
use crate::fs::buffer::{Bh, BhMode, BufType, InsertPos};
use crate::fs::layout::{
    InodeNo, RawInode, INODE_ENTRY_NUM, INODE_ENTRY_SIZE, ITABLE_INO, ROOT_INO,
};
use crate::fs::FileSystem;

pub const ICTX_CACHE_SIZE: usize = 128;

pub(crate) struct InodeCtx {
    pub ino: InodeNo,
    pub inode: RawInode,
    pub bh: Option<Bh>,
    pub refcnt: u32,
    pub dirty: bool,
    pub loaded: bool,
}

pub struct IctxCache {
    slots: Vec<Option<InodeCtx>>,
    map: HashMap<InodeNo, usize>,
    free: Vec<usize>,
}

impl IctxCache {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            map: HashMap::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn get(&self, id: usize) -> &InodeCtx {
        self.slots[id].as_ref().expect("stale inode context id")
    }

    pub(crate) fn get_mut(&mut self, id: usize) -> &mut InodeCtx {
        self.slots[id].as_mut().expect("stale inode context id")
    }

    fn insert(&mut self, ctx: InodeCtx) -> usize {
        let ino = ctx.ino;
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(ctx);
                id
            }
            None => {
                self.slots.push(Some(ctx));
                self.slots.len() - 1
            }
        };
        self.map.insert(ino, id);
        id
    }

    fn evict(&mut self, id: usize) {
        if let Some(ctx) = self.slots[id].take() {
            self.map.remove(&ctx.ino);
            self.free.push(id);
        }
    }

    /// Clears the buffer back-reference; called when the holding buffer is
    /// flushed or reused.
    pub(crate) fn detach(&mut self, id: usize) {
        if let Some(ctx) = self.slots[id].as_mut() {
            ctx.bh = None;
        }
    }

    fn lookup(&self, ino: InodeNo) -> Option<usize> {
        self.map.get(&ino).copied()
    }

    fn cached(&self) -> usize {
        self.map.len()
    }
}

impl Default for IctxCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    /// Returns an existing context for `ino` (bumping its reference count)
    /// or a fresh unloaded one.
    pub(crate) fn get_ictx(&mut self, ino: InodeNo) -> usize {
        if let Some(id) = self.ictxc.lookup(ino) {
            self.ictxc.get_mut(id).refcnt += 1;
            return id;
        }
        self.ictxc.insert(InodeCtx {
            ino,
            inode: RawInode::default(),
            bh: None,
            refcnt: 1,
            dirty: false,
            loaded: false,
        })
    }

    /// Resolves `ino` to its inode-table slot, pins the buffer holding it
    /// and returns the context id.
    pub(crate) fn read_inode(&mut self, ino: InodeNo) -> IoResult<usize> {
        if ino < ROOT_INO {
            return Err(FsError::Invalid("inode number in the reserved range"));
        }

        let id = self.get_ictx(ino);
        if self.ictxc.get(id).bh.is_some() {
            return Ok(id);
        }

        let block = ino / INODE_ENTRY_NUM;
        let offset = (ino % INODE_ENTRY_NUM) as usize;
        let bh = self.get_bh(Some(id), ITABLE_INO, block, BhMode::Read, BufType::Meta)?;

        if !self.ictxc.get(id).loaded {
            let raw = &self.bc.data(bh)[offset * INODE_ENTRY_SIZE..(offset + 1) * INODE_ENTRY_SIZE];
            let inode: RawInode = bytemuck::pod_read_unaligned(raw);
            if inode.i_ino != ino {
                self.release_bh(bh, InsertPos::Head, false);
                self.release_ictx_slot(id);
                return Err(FsError::Fatal("inode slot does not carry its own number"));
            }
            let ctx = self.ictxc.get_mut(id);
            ctx.inode = inode;
            ctx.loaded = true;
        }

        self.ictxc.get_mut(id).bh = Some(bh);
        self.bc.entry_mut(bh.idx).ictxs.push(id);
        Ok(id)
    }

    pub(crate) fn inode(&self, ictx: usize) -> &RawInode {
        &self.ictxc.get(ictx).inode
    }

    pub(crate) fn inode_mut(&mut self, ictx: usize) -> &mut RawInode {
        let ctx = self.ictxc.get_mut(ictx);
        ctx.dirty = true;
        &mut ctx.inode
    }

    pub(crate) fn mark_inode_dirty(&mut self, ictx: usize) {
        self.ictxc.get_mut(ictx).dirty = true;
    }

    /// Drops one reference. On the final release a dirty context is
    /// written back into its inode-table slot and the buffer is released
    /// dirty.
    pub(crate) fn release_inode(&mut self, ictx: usize, dirty: bool) -> IoResult<()> {
        if dirty {
            self.ictxc.get_mut(ictx).dirty = true;
        }

        let ctx = self.ictxc.get_mut(ictx);
        assert!(ctx.refcnt > 0, "release of an unreferenced inode context");
        ctx.refcnt -= 1;
        if ctx.refcnt > 0 {
            return Ok(());
        }

        let (ino, is_dirty, bh) = (ctx.ino, ctx.dirty, ctx.bh);
        if is_dirty {
            // The buffer may have been detached by a flush in between;
            // re-pin the slot to land the record.
            let bh = match bh {
                Some(bh) => bh,
                None => {
                    let block = ino / INODE_ENTRY_NUM;
                    self.get_bh(Some(ictx), ITABLE_INO, block, BhMode::Read, BufType::Meta)?
                }
            };
            let offset = (ino % INODE_ENTRY_NUM) as usize;
            let inode = self.ictxc.get(ictx).inode;
            self.bc.data_mut(bh)[offset * INODE_ENTRY_SIZE..(offset + 1) * INODE_ENTRY_SIZE]
                .copy_from_slice(bytes_of(&inode));
            self.detach_ictx_from_entry(bh, ictx);
            self.release_bh(bh, InsertPos::Head, true);
        } else if let Some(bh) = bh {
            self.detach_ictx_from_entry(bh, ictx);
            self.release_bh(bh, InsertPos::Head, false);
        }

        let ctx = self.ictxc.get_mut(ictx);
        ctx.bh = None;
        ctx.dirty = false;

        if self.ictxc.cached() > ICTX_CACHE_SIZE {
            self.ictxc.evict(ictx);
        }
        Ok(())
    }

    /// Marks the inode deleted, zeroes its identity, returns its blocksless
    /// record to the table and clears the inode bitmap bit.
    pub(crate) fn relocate_delete_inode(&mut self, ictx: usize) -> IoResult<()> {
        let ino = self.ictxc.get(ictx).ino;

        let inode = self.inode_mut(ictx);
        inode.i_deleted = 1;
        inode.i_ino = 0;
        inode.i_size = 0;

        self.release_inode(ictx, true)?;
        // The copy kept for hot lookup is now poison; drop it.
        if let Some(id) = self.ictxc.lookup(ino) {
            if self.ictxc.get(id).refcnt == 0 {
                self.ictxc.evict(id);
            }
        }

        self.inc_free_inodes(ino)?;
        let bg_id = ino / self.sb.sb_no_of_inodes_per_bg;
        self.release_ibitmap(bg_id, ino)
    }

    fn detach_ictx_from_entry(&mut self, bh: Bh, ictx: usize) {
        let entry = self.bc.entry_mut(bh.idx);
        if let Some(pos) = entry.ictxs.iter().position(|&id| id == ictx) {
            entry.ictxs.swap_remove(pos);
        }
    }

    fn release_ictx_slot(&mut self, id: usize) {
        let ctx = self.ictxc.get_mut(id);
        ctx.refcnt = ctx.refcnt.saturating_sub(1);
        if ctx.refcnt == 0 {
            self.ictxc.evict(id);
        }
    }
}
