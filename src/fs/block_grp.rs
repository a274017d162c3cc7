//! Block group management.
//!
//! A block group (the IPC-level "container") carries its own descriptor,
//! bitmaps and inode table, and is owned by exactly one process at a time.
//! This module covers descriptor I/O through the buffer cache, the free
//! inode/block searches over the bitmaps, the counter discipline tying
//! descriptor counters to the superblock and app-superblock, and the
//! per-process list of owned groups with its two rotating allocation
//! cursors.
//!
//! Counter updates and the bitmap flip they belong to share a release
//! path: the bitmap buffer is released dirty iff a bit actually changed,
//! and the descriptor buffer is released dirty in the same operation.

use bytemuck::{bytes_of, pod_read_unaligned};
use log::{debug, warn};

use crate::err::{FsError, IoResult};
use crate::fs::bitmap;
use crate::fs::buffer::{Bh, BhMode, BufType, InsertPos};
use crate::fs::layout::{
    BgDescriptor, InodeNo, Pbno, BD_INO, DBITMAP_INO, IBITMAP_INO,
};
use crate::fs::{FileSystem, ProcessRole};

/// Per-process list of owned block groups, with rotating cursors for
/// inode and data-block allocation.
#[derive(Debug, Default)]
pub struct BgList {
    ids: Vec<u32>,
    inode_cursor: usize,
    data_cursor: usize,
}

impl BgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, bg_id: u32) -> bool {
        self.ids.contains(&bg_id)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn add(&mut self, bg_id: u32) {
        self.ids.push(bg_id);
    }

    pub fn remove(&mut self, bg_id: u32) -> bool {
        let Some(pos) = self.ids.iter().position(|&id| id == bg_id) else {
            return false;
        };
        self.ids.remove(pos);
        for cursor in [&mut self.inode_cursor, &mut self.data_cursor] {
            if *cursor > pos {
                *cursor -= 1;
            }
            if !self.ids.is_empty() {
                *cursor %= self.ids.len();
            } else {
                *cursor = 0;
            }
        }
        true
    }

    /// The group the cursor currently rests on.
    pub fn curr(&self, is_inode: bool) -> Option<u32> {
        let cursor = if is_inode {
            self.inode_cursor
        } else {
            self.data_cursor
        };
        self.ids.get(cursor).copied()
    }

    /// Advances the cursor one step, wrapping past the end of the list.
    pub fn next(&mut self, is_inode: bool) -> Option<u32> {
        if self.ids.is_empty() {
            return None;
        }
        let cursor = if is_inode {
            &mut self.inode_cursor
        } else {
            &mut self.data_cursor
        };
        *cursor = (*cursor + 1) % self.ids.len();
        Some(self.ids[*cursor])
    }

    /// Parks the cursor on a named group, which must be on the list.
    pub fn move_curr(&mut self, bg_id: u32, is_inode: bool) {
        let pos = self
            .ids
            .iter()
            .position(|&id| id == bg_id)
            .expect("cursor moved to a group not on the list");
        if is_inode {
            self.inode_cursor = pos;
        } else {
            self.data_cursor = pos;
        }
    }
}

impl FileSystem {
    /// The pinned in-memory descriptor for `bg_id`. Region offsets are
    /// immutable after format; free counters must be read through the
    /// cache instead.
    pub(crate) fn get_bd(&self, bg_id: u32) -> &BgDescriptor {
        let bd = &self.bd_table[bg_id as usize];
        assert_eq!(bd.bd_id, bg_id, "pinned descriptor id mismatch");
        bd
    }

    /// Reads the live descriptor out of its cached cluster.
    pub(crate) fn bd_from_bh(&self, bh: Bh) -> BgDescriptor {
        pod_read_unaligned(&self.bc.data(bh)[..core::mem::size_of::<BgDescriptor>()])
    }

    pub(crate) fn write_bd(&mut self, bh: Bh, bd: &BgDescriptor) {
        self.bc.data_mut(bh)[..core::mem::size_of::<BgDescriptor>()]
            .copy_from_slice(bytes_of(bd));
    }

    fn get_bd_bh(&mut self, bg_id: u32) -> IoResult<(Bh, BgDescriptor)> {
        let bh = self.get_bh(None, BD_INO, bg_id, BhMode::Read, BufType::Meta)?;
        let bd = self.bd_from_bh(bh);
        if bd.bd_id != bg_id {
            self.release_bh(bh, InsertPos::Head, false);
            return Err(FsError::Fatal("descriptor id does not match its group"));
        }
        Ok((bh, bd))
    }

    /// Scans the inode bitmap of `bg_id` for the first clear bit at or
    /// after `hint`, sets it, and returns the absolute inode number.
    pub(crate) fn scan_free_ibitmap(
        &mut self,
        bg_id: u32,
        hint: u32,
    ) -> IoResult<Option<InodeNo>> {
        let (bd_bh, bd) = self.get_bd_bh(bg_id)?;
        let bh = self.get_bh(None, IBITMAP_INO, bg_id, BhMode::Read, BufType::Meta)?;

        let found = if bd.bd_free_inodes > 0 {
            bitmap::scan_clear_bit(&self.bc.data(bh)[..], hint, self.sb.sb_no_of_inodes_per_bg)
        } else {
            None
        };

        let ino = found.map(|idx| {
            bitmap::set_bit(&mut self.bc.data_mut(bh)[..], idx);
            bg_id * bd.bd_max_inodes + idx
        });

        self.release_bh(bd_bh, InsertPos::Head, false);
        self.release_bh(bh, InsertPos::Head, ino.is_some());
        Ok(ino)
    }

    /// Free-inode search: starts at the hint group (the owned-list cursor
    /// in the multi-process roles, the group of the last allocated inode
    /// standalone) and walks every reachable group once.
    pub(crate) fn find_free_inode(&mut self, last_ino: InodeNo) -> IoResult<Option<InodeNo>> {
        let start_bg = if self.params.role == ProcessRole::Standalone {
            last_ino / self.sb.sb_no_of_inodes_per_bg
        } else {
            match self.bg_list.curr(true) {
                Some(bg) => bg,
                None => return Ok(None),
            }
        };

        let mut bg_id = start_bg;
        let mut hint = last_ino % self.sb.sb_no_of_inodes_per_bg;

        loop {
            if let Some(ino) = self.scan_free_ibitmap(bg_id, hint)? {
                return Ok(Some(ino));
            }

            bg_id = if self.params.role == ProcessRole::Standalone {
                (bg_id + 1) % self.sb.sb_bg_num
            } else {
                self.bg_list.next(true).expect("group list emptied mid-scan")
            };
            hint = 0;

            if bg_id == start_bg {
                warn!(
                    target: "bg",
                    "no free inode in any reachable group (app free = {})",
                    self.asb.asb_free_inodes
                );
                return Ok(None);
            }
        }
    }

    /// Clears the inode bitmap bit of a released inode.
    pub(crate) fn release_ibitmap(&mut self, bg_id: u32, ino: InodeNo) -> IoResult<()> {
        let (bd_bh, bd) = self.get_bd_bh(bg_id)?;
        let bh = self.get_bh(None, IBITMAP_INO, bg_id, BhMode::Read, BufType::Meta)?;

        let nr = ino % bd.bd_max_inodes;
        let was_set = bitmap::clear_bit(&mut self.bc.data_mut(bh)[..], nr);
        if !was_set {
            warn!(target: "bg", "inode {ino} was already released");
        }

        self.release_bh(bd_bh, InsertPos::Head, false);
        self.release_bh(bh, InsertPos::Head, was_set);
        Ok(())
    }

    pub(crate) fn inc_free_inodes(&mut self, ino: InodeNo) -> IoResult<()> {
        let bg_id = ino / self.sb.sb_no_of_inodes_per_bg;
        let (bd_bh, mut bd) = self.get_bd_bh(bg_id)?;

        bd.bd_free_inodes += 1;
        self.sb.sb_free_inodes += 1;
        if !self.is_primary() {
            self.asb.asb_free_inodes += 1;
        }
        assert!(bd.bd_free_inodes <= bd.bd_max_inodes);
        let empty = bd.is_empty();
        self.write_bd(bd_bh, &bd);
        self.release_bh(bd_bh, InsertPos::Head, true);

        self.maybe_return_bg(bg_id, empty)
    }

    pub(crate) fn dec_free_inodes(&mut self, ino: InodeNo) -> IoResult<()> {
        let bg_id = ino / self.sb.sb_no_of_inodes_per_bg;
        let (bd_bh, mut bd) = self.get_bd_bh(bg_id)?;

        assert!(bd.bd_free_inodes > 0, "inode counter underflow");
        bd.bd_free_inodes -= 1;
        self.sb.sb_free_inodes -= 1;
        if !self.is_primary() {
            self.asb.asb_free_inodes -= 1;
        }
        self.write_bd(bd_bh, &bd);
        self.release_bh(bd_bh, InsertPos::Head, true);
        Ok(())
    }

    pub(crate) fn inc_free_blocks(&mut self, blockno: Pbno, cnt: u32) -> IoResult<()> {
        let bg_id = blockno / self.sb.sb_no_of_blocks_per_bg;
        let (bd_bh, mut bd) = self.get_bd_bh(bg_id)?;

        bd.bd_free_blocks += cnt;
        self.sb.sb_free_blocks += cnt as u64;
        self.sb.sb_no_of_used_blocks -= cnt as u64;
        if !self.is_primary() {
            self.asb.asb_free_blocks += cnt as u64;
        }
        assert!(bd.bd_free_blocks <= bd.bd_max_blocks);
        assert!(self.sb.sb_free_blocks <= self.sb.sb_no_of_blocks);

        let empty = bd.is_empty();
        self.write_bd(bd_bh, &bd);
        self.release_bh(bd_bh, InsertPos::Head, true);

        self.maybe_return_bg(bg_id, empty)
    }

    pub(crate) fn dec_free_blocks(&mut self, blockno: Pbno, cnt: u32) -> IoResult<()> {
        let bg_id = blockno / self.sb.sb_no_of_blocks_per_bg;
        let (bd_bh, mut bd) = self.get_bd_bh(bg_id)?;

        assert!(bd.bd_free_blocks >= cnt, "block counter underflow");
        bd.bd_free_blocks -= cnt;
        self.sb.sb_free_blocks -= cnt as u64;
        self.sb.sb_no_of_used_blocks += cnt as u64;
        if !self.is_primary() {
            assert!(self.asb.asb_free_blocks >= cnt as u64);
            self.asb.asb_free_blocks -= cnt as u64;
        }
        assert!(self.sb.sb_no_of_used_blocks <= self.sb.sb_no_of_blocks);

        self.write_bd(bd_bh, &bd);
        self.release_bh(bd_bh, InsertPos::Head, true);
        Ok(())
    }

    pub(crate) fn get_free_blocks(&mut self, bg_id: u32) -> IoResult<u32> {
        let (bd_bh, bd) = self.get_bd_bh(bg_id)?;
        self.release_bh(bd_bh, InsertPos::Head, false);
        Ok(bd.bd_free_blocks)
    }

    /// Whether this process can allocate one more inode without a
    /// container request.
    pub(crate) fn check_free_inode(&self) -> bool {
        if self.is_primary() {
            self.sb.sb_free_inodes > 0
        } else {
            self.asb.asb_free_inodes > 0
        }
    }

    pub(crate) fn check_free_block(&self, num_blocks: u32) -> bool {
        if self.is_primary() {
            self.sb.sb_free_blocks >= num_blocks as u64
        } else {
            self.asb.asb_free_blocks >= num_blocks as u64
        }
    }

    /// Stamps this process as the owner of `bg_id` in its descriptor.
    pub(crate) fn update_owner_in_bd_info(&mut self, bg_id: u32) -> IoResult<()> {
        let (bd_bh, mut bd) = self.get_bd_bh(bg_id)?;
        bd.bd_owner = self.asb.asb_core_id;
        self.write_bd(bd_bh, &bd);
        self.release_bh(bd_bh, InsertPos::Head, true);
        Ok(())
    }

    /// Folds a group's free counters into (or out of) the app-superblock
    /// mirror when the group joins or leaves this process.
    pub(crate) fn update_sb_with_bd_info(
        &mut self,
        bg_id: u32,
        is_root_container: bool,
        increment: bool,
    ) -> IoResult<()> {
        let (bd_bh, bd) = self.get_bd_bh(bg_id)?;
        self.release_bh(bd_bh, InsertPos::Head, false);

        let used = (self.sb.sb_no_of_blocks_per_bg - bd.bd_free_blocks) as u64;
        if increment {
            self.asb.asb_free_blocks += bd.bd_free_blocks as u64;
            self.asb.asb_free_inodes += bd.bd_free_inodes;
            if is_root_container {
                self.asb.asb_no_of_used_blocks += used;
            }
        } else {
            self.asb.asb_free_blocks -= bd.bd_free_blocks as u64;
            self.asb.asb_free_inodes -= bd.bd_free_inodes;
            if is_root_container {
                self.asb.asb_no_of_used_blocks -= used;
            }
        }
        Ok(())
    }

    /// Attaches a block group to this process.
    pub(crate) fn add_bg(&mut self, bg_id: u32) -> IoResult<()> {
        self.bg_list.add(bg_id);
        let root_container = self.bg_list.len() == 1;

        if self.is_dataplane_model() {
            if !self.is_primary() {
                self.update_sb_with_bd_info(bg_id, root_container, true)?;
            }
            self.update_owner_in_bd_info(bg_id)?;
        }
        debug!(target: "bg", "attached group {bg_id} (owned = {})", self.bg_list.len());
        Ok(())
    }

    /// Returns a fully empty group to the control plane. The root
    /// container is never released.
    pub(crate) fn remove_bg(&mut self, bg_id: u32) -> IoResult<()> {
        if bg_id == self.asb.asb_root_bg_id {
            return Ok(());
        }
        if !self.bg_list.remove(bg_id) {
            return Err(FsError::Fatal("release of a group not on the owned list"));
        }

        if !self.is_primary() {
            self.update_sb_with_bd_info(bg_id, false, false)?;
        }

        self.release_container(bg_id)?;
        debug!(target: "bg", "returned group {bg_id} (owned = {})", self.bg_list.len());
        Ok(())
    }

    /// In non-preallocation data-plane mode, a mutation that leaves a
    /// group completely empty sends it back to the free pool.
    fn maybe_return_bg(&mut self, bg_id: u32, empty: bool) -> IoResult<()> {
        if empty
            && self.params.role == ProcessRole::Data
            && !self.params.preallocation
            && self.bg_list.contains(bg_id)
        {
            self.remove_bg(bg_id)?;
        }
        Ok(())
    }

    /// Allocates up to `want` data clusters from `bg_id`, scanning from
    /// the descriptor's hint. Returns absolute cluster numbers.
    pub(crate) fn alloc_dbitmap(&mut self, bg_id: u32, want: u32) -> IoResult<Vec<Pbno>> {
        let (bd_bh, mut bd) = self.get_bd_bh(bg_id)?;
        let bh = self.get_bh(None, DBITMAP_INO, bg_id, BhMode::Read, BufType::Meta)?;

        let per_bg = self.sb.sb_no_of_blocks_per_bg;
        let mut allocated = Vec::new();
        let mut cursor = bd.bd_next_block % per_bg;

        if bd.bd_free_blocks > 0 {
            for _ in 0..per_bg {
                if !bitmap::test_bit(&self.bc.data(bh)[..], cursor) {
                    bitmap::set_bit(&mut self.bc.data_mut(bh)[..], cursor);
                    bd.bd_next_block = cursor;
                    allocated.push(bd.bd_bg_start + cursor);
                    if allocated.len() as u32 == want
                        || allocated.len() as u32 == bd.bd_free_blocks
                    {
                        break;
                    }
                }
                cursor = (cursor + 1) % per_bg;
            }
        }

        if allocated.is_empty() {
            self.release_bh(bh, InsertPos::Head, false);
            self.release_bh(bd_bh, InsertPos::Head, false);
            return Ok(allocated);
        }

        self.write_bd(bd_bh, &bd);
        self.release_bh(bh, InsertPos::Head, true);
        self.release_bh(bd_bh, InsertPos::Head, true);
        self.dec_free_blocks(bd.bd_bg_start, allocated.len() as u32)?;
        Ok(allocated)
    }

    /// Clears `count` data bitmap bits starting at group-relative
    /// `offset`. Double frees are an invariant violation.
    pub(crate) fn free_dbitmap(&mut self, bg_id: u32, offset: u32, count: u32) -> IoResult<()> {
        let (bd_bh, mut bd) = self.get_bd_bh(bg_id)?;
        let bh = self.get_bh(None, DBITMAP_INO, bg_id, BhMode::Read, BufType::Meta)?;

        for nr in offset..offset + count {
            if !bitmap::clear_bit(&mut self.bc.data_mut(bh)[..], nr) {
                self.release_bh(bh, InsertPos::Head, false);
                self.release_bh(bd_bh, InsertPos::Head, false);
                return Err(FsError::Fatal("double free of a data block"));
            }
        }
        bd.bd_next_block = offset;

        self.write_bd(bd_bh, &bd);
        self.release_bh(bh, InsertPos::Head, true);
        self.release_bh(bd_bh, InsertPos::Head, true);
        self.inc_free_blocks(bd.bd_bg_start + offset, count)
    }

    /// Frees the contiguous cluster run `[start, start + count)`,
    /// splitting it along block group boundaries.
    pub(crate) fn free_blocks_run(&mut self, start: Pbno, count: u32) -> IoResult<()> {
        let per_bg = self.sb.sb_no_of_blocks_per_bg;
        let mut blk = start;
        let end = start + count;
        while blk < end {
            let bg_id = blk / per_bg;
            let offset = blk % per_bg;
            let len = (end - blk).min(per_bg - offset);
            self.free_dbitmap(bg_id, offset, len)?;
            blk += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_rotate_over_the_owned_groups() {
        let mut list = BgList::new();
        for id in [3, 7, 9] {
            list.add(id);
        }
        assert_eq!(list.curr(true), Some(3));
        assert_eq!(list.next(true), Some(7));
        assert_eq!(list.next(true), Some(9));
        assert_eq!(list.next(true), Some(3));
        // The data cursor rotates independently.
        assert_eq!(list.curr(false), Some(3));
    }

    #[test]
    fn removal_fixes_up_the_cursors() {
        let mut list = BgList::new();
        for id in [3, 7, 9] {
            list.add(id);
        }
        list.next(false);
        list.next(false); // data cursor on 9
        assert!(list.remove(7));
        assert_eq!(list.curr(false), Some(9));
        assert!(list.remove(9));
        assert_eq!(list.curr(false), Some(3));
        assert!(!list.remove(42));
    }

    #[test]
    fn move_curr_parks_on_a_named_group() {
        let mut list = BgList::new();
        for id in [2, 4, 6] {
            list.add(id);
        }
        list.move_curr(6, true);
        assert_eq!(list.curr(true), Some(6));
        assert_eq!(list.next(true), Some(2));
    }
}
