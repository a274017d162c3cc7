//! Inode engine: allocation, release, truncation, and the logical-to-
//! physical block map.
//!
//! The block map carries 16 direct pointers plus single- and double-
//! indirect levels; indirect clusters are cached under the
//! [`BLOCK_IO_INO`] pseudo-inode, whose translation is the identity.
//! `get_pbn` is the central resolver: pseudo-inodes have closed-form
//! answers computed from block group geometry, real inodes walk the map.

use bytemuck::cast_slice;
use log::warn;

use crate::err::{FsError, IoResult};
use crate::fs::buffer::{BhMode, BufType, InsertPos};
use crate::fs::layout::{
    size_to_blocks, InodeNo, Lbno, Pbno, BD_INO, BD_OFFSET, BLOCK_IO_INO, CLUSTER_SIZE,
    CLUSTER_SIZE_BITS, DBITMAP_INO, DIRECT_BLOCKS, DOUBLE_INDIRECT_SLOT, IBITMAP_INO,
    INODE_ENTRY_NUM, INODE_ENTRY_SIZE, ITABLE_INO, MAX_FILE_BLOCKS, PTRS_PER_CLUSTER, ROOT_INO,
};
use crate::fs::{FileSystem, ProcessRole};

impl FileSystem {
    /// Allocates a fresh inode: finds and flips a bitmap bit, zeroes the
    /// table slot, stamps the number and bumps the version. A data plane
    /// with no visible free inode leases a new container first.
    pub(crate) fn alloc_new_inode(&mut self) -> IoResult<InodeNo> {
        if self.params.role == ProcessRole::Data && !self.check_free_inode() {
            let bg_id = self.alloc_container(crate::ipc::ContainerAllocKind::New)?;
            if bg_id == 0 {
                return Err(FsError::NoSpace);
            }
            self.add_bg(bg_id)?;
        }

        let last_ino = self.sb.sb_last_allocated_ino;
        let Some(ino) = self.find_free_inode(last_ino)? else {
            return Err(FsError::NoSpace);
        };

        self.dec_free_inodes(ino)?;

        let block = ino / INODE_ENTRY_NUM;
        let offset = (ino % INODE_ENTRY_NUM) as usize;
        let bh = self.get_bh(None, ITABLE_INO, block, BhMode::Read, BufType::Meta)?;
        let inode = crate::fs::layout::RawInode {
            i_ino: ino,
            i_version: 1,
            ..Default::default()
        };
        self.bc.data_mut(bh)[offset * INODE_ENTRY_SIZE..(offset + 1) * INODE_ENTRY_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&inode));
        self.release_bh(bh, InsertPos::Head, true);

        // The control plane's counter is the shared canonical value; only
        // standalone and data planes advance a local hint.
        if self.params.role != ProcessRole::Control {
            self.sb.sb_last_allocated_ino = ino + 1;
        }
        Ok(ino)
    }

    /// Allocates an inode and initializes its type and mode through a
    /// pinned context.
    pub(crate) fn create_inode(&mut self, itype: u32, mode: u32) -> IoResult<InodeNo> {
        let ino = self.alloc_new_inode()?;
        let ictx = self.read_inode(ino)?;
        {
            let inode = self.inode_mut(ictx);
            inode.i_type = itype;
            inode.i_mode = mode & 0o7777;
            inode.i_size = 0;
            inode.i_links_count = 0;
        }
        self.release_inode(ictx, true)?;
        Ok(ino)
    }

    /// Shrinks an inode's content to `new_size` bytes: discards cached
    /// data buffers beyond the new tail, then walks the block map freeing
    /// physical clusters into their source groups. Growing or equal sizes
    /// are a no-op.
    pub(crate) fn free_inode_size(&mut self, ictx: usize, new_size: u64) -> IoResult<()> {
        let inode = *self.inode(ictx);
        let old_blocks = size_to_blocks(inode.i_size);
        let keep_blocks = new_size >> CLUSTER_SIZE_BITS;

        if old_blocks == 0 || old_blocks <= keep_blocks {
            return Ok(());
        }

        let ino = inode.i_ino;
        for lblk in (keep_blocks..old_blocks).rev() {
            self.discard_buffer(ino, lblk as Lbno);
        }

        self.truncate_blocks(ictx, new_size)?;
        self.release_idle_buffers()
    }

    /// Frees every mapped cluster past `new_size`, including indirect
    /// clusters that become fully vacated.
    pub(crate) fn truncate_blocks(&mut self, ictx: usize, new_size: u64) -> IoResult<()> {
        let inode = *self.inode(ictx);
        let old_blocks = size_to_blocks(inode.i_size);
        let keep = new_size >> CLUSTER_SIZE_BITS;
        if old_blocks == 0 || old_blocks <= keep {
            return Ok(());
        }

        let mut freed: Vec<Pbno> = Vec::new();

        // Direct region.
        {
            let inode = self.inode_mut(ictx);
            for slot in (keep as usize)..DIRECT_BLOCKS.min(old_blocks as usize) {
                if inode.i_blocks[slot] != 0 {
                    freed.push(inode.i_blocks[slot]);
                    inode.i_blocks[slot] = 0;
                }
            }
        }

        // Single-indirect region.
        let single = self.inode(ictx).i_blocks[crate::fs::layout::SINGLE_INDIRECT_SLOT];
        if single != 0 {
            let first = DIRECT_BLOCKS as u64;
            let keep_in = keep.saturating_sub(first).min(PTRS_PER_CLUSTER as u64) as u32;
            let vacated = self.truncate_indirect(single, keep_in, &mut freed)?;
            if vacated {
                freed.push(single);
                self.inode_mut(ictx).i_blocks[crate::fs::layout::SINGLE_INDIRECT_SLOT] = 0;
            }
        }

        // Double-indirect region.
        let double = self.inode(ictx).i_blocks[DOUBLE_INDIRECT_SLOT];
        if double != 0 {
            let first = DIRECT_BLOCKS as u64 + PTRS_PER_CLUSTER as u64;
            let keep_in = keep.saturating_sub(first);
            let mut all_vacated = true;

            for l1 in 0..PTRS_PER_CLUSTER {
                let child = self.indirect_entry(double, l1)?;
                if child == 0 {
                    continue;
                }
                let child_first = l1 as u64 * PTRS_PER_CLUSTER as u64;
                let keep_child = keep_in
                    .saturating_sub(child_first)
                    .min(PTRS_PER_CLUSTER as u64) as u32;
                let vacated = self.truncate_indirect(child, keep_child, &mut freed)?;
                if vacated {
                    freed.push(child);
                    self.set_indirect_entry(double, l1, 0)?;
                } else {
                    all_vacated = false;
                }
            }

            if all_vacated && keep_in == 0 {
                freed.push(double);
                self.inode_mut(ictx).i_blocks[DOUBLE_INDIRECT_SLOT] = 0;
            }
        }

        self.mark_inode_dirty(ictx);
        self.free_collected(&mut freed)
    }

    /// Clears entries `[keep, PTRS_PER_CLUSTER)` of one indirect cluster,
    /// collecting the freed clusters. Returns whether the whole cluster is
    /// now vacant.
    fn truncate_indirect(
        &mut self,
        indirect_pno: Pbno,
        keep: u32,
        freed: &mut Vec<Pbno>,
    ) -> IoResult<bool> {
        let bh = self.get_bh(None, BLOCK_IO_INO, indirect_pno, BhMode::Read, BufType::Meta)?;
        let mut vacated = true;
        let mut dirtied = false;
        {
            let ptrs: &mut [u32] = cast_slice_mut_checked(&mut self.bc.data_mut(bh)[..]);
            for (slot, ptr) in ptrs.iter_mut().enumerate() {
                if *ptr == 0 {
                    continue;
                }
                if (slot as u32) < keep {
                    vacated = false;
                    continue;
                }
                freed.push(*ptr);
                *ptr = 0;
                dirtied = true;
            }
        }
        self.release_bh(bh, InsertPos::Head, dirtied && !vacated);

        if vacated {
            // The whole cluster goes away with its owner; its cached copy
            // must not survive the physical free.
            self.discard_buffer(BLOCK_IO_INO, indirect_pno);
        }
        Ok(vacated)
    }

    /// Frees a set of collected clusters, coalesced into contiguous runs.
    fn free_collected(&mut self, freed: &mut Vec<Pbno>) -> IoResult<()> {
        if freed.is_empty() {
            return Ok(());
        }
        freed.sort_unstable();

        let mut run_start = freed[0];
        let mut run_len = 1u32;
        for &pno in &freed[1..] {
            if pno == run_start + run_len {
                run_len += 1;
            } else {
                self.free_blocks_run(run_start, run_len)?;
                run_start = pno;
                run_len = 1;
            }
        }
        self.free_blocks_run(run_start, run_len)
    }

    /// The central logical-to-physical resolver.
    pub(crate) fn get_pbn(
        &mut self,
        ictx: Option<usize>,
        ino: InodeNo,
        lblk: Lbno,
    ) -> IoResult<Pbno> {
        match ino {
            BLOCK_IO_INO => Ok(lblk),
            ITABLE_INO => {
                let itable_per_bg = self.sb.sb_no_of_inodes_per_bg / INODE_ENTRY_NUM;
                let bg_id = lblk / itable_per_bg;
                let bd = self.get_bd(bg_id);
                Ok(bd.bd_itable_start + lblk % bd.bd_itable_size)
            }
            DBITMAP_INO => Ok(self.get_bd(lblk).bd_dbitmap_start),
            IBITMAP_INO => Ok(self.get_bd(lblk).bd_ibitmap_start),
            BD_INO => Ok(lblk * self.sb.sb_no_of_blocks_per_bg + BD_OFFSET),
            _ if ino < ROOT_INO => Err(FsError::Invalid("translation of a reserved inode")),
            _ => {
                let ictx = ictx.ok_or(FsError::Fatal(
                    "block map walk without an inode context",
                ))?;
                debug_assert_eq!(self.ictxc.get(ictx).ino, ino);
                self.map_lookup(ictx, lblk)
            }
        }
    }

    /// Looks up (and with `create` allocates) the physical cluster backing
    /// logical block `lblk` of a real inode. Returns 0 for a hole when not
    /// creating.
    pub(crate) fn get_block(&mut self, ictx: usize, lblk: Lbno, create: bool) -> IoResult<Pbno> {
        let pno = self.map_lookup(ictx, lblk)?;
        if pno != 0 || !create {
            return Ok(pno);
        }
        let pno = self.alloc_data_blocks(1)?[0];
        self.map_insert(ictx, lblk, pno)?;
        Ok(pno)
    }

    fn map_lookup(&mut self, ictx: usize, lblk: Lbno) -> IoResult<Pbno> {
        if (lblk as u64) >= MAX_FILE_BLOCKS {
            return Err(FsError::Invalid("logical block beyond the maximum file size"));
        }
        let blocks = self.inode(ictx).i_blocks;

        if (lblk as usize) < DIRECT_BLOCKS {
            return Ok(blocks[lblk as usize]);
        }

        let lblk = lblk - DIRECT_BLOCKS as u32;
        if lblk < PTRS_PER_CLUSTER {
            let single = blocks[crate::fs::layout::SINGLE_INDIRECT_SLOT];
            if single == 0 {
                return Ok(0);
            }
            return self.indirect_entry(single, lblk);
        }

        let lblk = lblk - PTRS_PER_CLUSTER;
        let double = blocks[DOUBLE_INDIRECT_SLOT];
        if double == 0 {
            return Ok(0);
        }
        let child = self.indirect_entry(double, lblk / PTRS_PER_CLUSTER)?;
        if child == 0 {
            return Ok(0);
        }
        self.indirect_entry(child, lblk % PTRS_PER_CLUSTER)
    }

    fn map_insert(&mut self, ictx: usize, lblk: Lbno, pno: Pbno) -> IoResult<()> {
        if (lblk as usize) < DIRECT_BLOCKS {
            self.inode_mut(ictx).i_blocks[lblk as usize] = pno;
            return Ok(());
        }

        let rel = lblk - DIRECT_BLOCKS as u32;
        if rel < PTRS_PER_CLUSTER {
            let single = self.ensure_indirect_slot(ictx, crate::fs::layout::SINGLE_INDIRECT_SLOT)?;
            return self.set_indirect_entry(single, rel, pno);
        }

        let rel = rel - PTRS_PER_CLUSTER;
        let double = self.ensure_indirect_slot(ictx, DOUBLE_INDIRECT_SLOT)?;
        let l1 = rel / PTRS_PER_CLUSTER;
        let mut child = self.indirect_entry(double, l1)?;
        if child == 0 {
            child = self.alloc_indirect_cluster()?;
            self.set_indirect_entry(double, l1, child)?;
        }
        self.set_indirect_entry(child, rel % PTRS_PER_CLUSTER, pno)
    }

    fn ensure_indirect_slot(&mut self, ictx: usize, slot: usize) -> IoResult<Pbno> {
        let existing = self.inode(ictx).i_blocks[slot];
        if existing != 0 {
            return Ok(existing);
        }
        let pno = self.alloc_indirect_cluster()?;
        self.inode_mut(ictx).i_blocks[slot] = pno;
        Ok(pno)
    }

    fn alloc_indirect_cluster(&mut self) -> IoResult<Pbno> {
        let pno = self.alloc_data_blocks(1)?[0];
        let bh = self.get_bh(None, BLOCK_IO_INO, pno, BhMode::New, BufType::Meta)?;
        self.release_bh(bh, InsertPos::Head, true);
        Ok(pno)
    }

    fn indirect_entry(&mut self, indirect_pno: Pbno, slot: u32) -> IoResult<Pbno> {
        let bh = self.get_bh(None, BLOCK_IO_INO, indirect_pno, BhMode::Read, BufType::Meta)?;
        let value = {
            let ptrs: &[u32] = cast_slice(&self.bc.data(bh)[..]);
            ptrs[slot as usize]
        };
        self.release_bh(bh, InsertPos::Head, false);
        Ok(value)
    }

    fn set_indirect_entry(&mut self, indirect_pno: Pbno, slot: u32, pno: Pbno) -> IoResult<()> {
        let bh = self.get_bh(None, BLOCK_IO_INO, indirect_pno, BhMode::Read, BufType::Meta)?;
        {
            let ptrs: &mut [u32] = cast_slice_mut_checked(&mut self.bc.data_mut(bh)[..]);
            ptrs[slot as usize] = pno;
        }
        self.release_bh(bh, InsertPos::Head, true);
        Ok(())
    }

    /// Allocates `count` data clusters from the groups this process can
    /// reach, advancing the data cursor on exhaustion. One container
    /// request is attempted before giving up; a partial allocation is
    /// rolled back before surfacing [`FsError::NoSpace`].
    pub(crate) fn alloc_data_blocks(&mut self, count: u32) -> IoResult<Vec<Pbno>> {
        if !self.check_free_block(count) && self.params.role == ProcessRole::Data {
            let bg_id = self.alloc_container(crate::ipc::ContainerAllocKind::New)?;
            if bg_id != 0 {
                self.add_bg(bg_id)?;
            }
        }
        if !self.check_free_block(count) {
            return Err(FsError::NoSpace);
        }
        if self.params.role == ProcessRole::Data && self.bg_list.is_empty() {
            return Err(FsError::NoSpace);
        }

        let mut allocated: Vec<Pbno> = Vec::with_capacity(count as usize);
        let mut retried_container = false;

        let mut bg_id = self.curr_data_bg();
        let start_bg = bg_id;
        loop {
            let want = count - allocated.len() as u32;
            let mut chunk = self.alloc_dbitmap(bg_id, want)?;
            allocated.append(&mut chunk);
            if allocated.len() as u32 == count {
                return Ok(allocated);
            }

            bg_id = self.next_data_bg();
            if bg_id == start_bg {
                if !retried_container && self.params.role == ProcessRole::Data {
                    retried_container = true;
                    let new_bg = self.alloc_container(crate::ipc::ContainerAllocKind::New)?;
                    if new_bg != 0 {
                        self.add_bg(new_bg)?;
                        self.bg_list.move_curr(new_bg, false);
                        bg_id = new_bg;
                        continue;
                    }
                }
                // Walked every reachable group; undo and report.
                warn!(target: "bg", "no free data blocks after full scan");
                let mut undo = core::mem::take(&mut allocated);
                self.free_collected(&mut undo)?;
                return Err(FsError::NoSpace);
            }
        }
    }

    fn curr_data_bg(&self) -> u32 {
        if self.params.role == ProcessRole::Standalone {
            self.cur_bg % self.sb.sb_bg_num
        } else {
            self.bg_list.curr(false).unwrap_or(0)
        }
    }

    fn next_data_bg(&mut self) -> u32 {
        if self.params.role == ProcessRole::Standalone {
            self.cur_bg = (self.cur_bg + 1) % self.sb.sb_bg_num;
            self.cur_bg
        } else {
            self.bg_list.next(false).unwrap_or(0)
        }
    }
}

/// `bytemuck::cast_slice_mut` with the cluster-alignment guarantee made
/// explicit at the call sites.
fn cast_slice_mut_checked(buf: &mut [u8]) -> &mut [u32] {
    debug_assert_eq!(buf.len(), CLUSTER_SIZE);
    bytemuck::cast_slice_mut(buf)
}
