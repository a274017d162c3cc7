//! Per-directory B+tree index.
//!
//! Maps 64-bit filename-hash keys to 32-bit directory-entry offsets. The
//! tree is persisted as the file content of a hidden index inode
//! (`i_bpino` of the directory): logical block 0 holds the master node,
//! every further block holds one tree node. Node clusters freed by
//! deletion are chained on the master's free list and reused before the
//! file grows.
//!
//! Deletion is lazy at the node level: keys are removed in place and
//! underfull nodes are left as they are, which keeps the key/value
//! contract while avoiding rebalancing.

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

use crate::err::{FsError, IoResult};
use crate::fs::buffer::{BhMode, BufType, InsertPos};
use crate::fs::layout::{
    InodeNo, Lbno, BP_NODE_SIGNATURE, CLUSTER_SIZE, INODE_TYPE_BPTREE,
};
use crate::fs::FileSystem;

/// Keys per node. A full node occupies 3080 of the 4096 cluster bytes.
pub const BP_FANOUT: usize = 255;

pub type BpKey = u64;
pub type BpValue = u32;

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BpMasterDisk {
    pub magic: u32,
    pub root: Lbno,
    pub free_head: Lbno,
    pub next_lblk: Lbno,
    pub height: u32,
    pub key_count: u32,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct BpNodeDisk {
    pub magic: u32,
    /// 0 for leaves, parent levels count up.
    pub level: u32,
    pub nkeys: u32,
    /// Right sibling for leaves, free-list chain for freed nodes.
    pub next: Lbno,
    pub keys: [BpKey; BP_FANOUT],
    /// Values for leaves; child block pointers (`nkeys + 1` of them) for
    /// internal nodes.
    pub ptrs: [u32; BP_FANOUT + 1],
}

const _: () = assert!(core::mem::size_of::<BpNodeDisk>() <= CLUSTER_SIZE);
const _: () = assert!(core::mem::size_of::<BpMasterDisk>() <= CLUSTER_SIZE);

impl BpNodeDisk {
    fn new(level: u32) -> Self {
        Self {
            magic: BP_NODE_SIGNATURE,
            level,
            nkeys: 0,
            next: 0,
            keys: [0; BP_FANOUT],
            ptrs: [0; BP_FANOUT + 1],
        }
    }

    fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Position of `key`, or the insertion point keeping keys sorted.
    fn search(&self, key: BpKey) -> Result<usize, usize> {
        self.keys[..self.nkeys as usize].binary_search(&key)
    }

    /// Child slot to descend into for `key`.
    fn child_slot(&self, key: BpKey) -> usize {
        match self.search(key) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        }
    }

    fn leaf_insert_at(&mut self, pos: usize, key: BpKey, value: BpValue) {
        let n = self.nkeys as usize;
        self.keys.copy_within(pos..n, pos + 1);
        self.ptrs.copy_within(pos..n, pos + 1);
        self.keys[pos] = key;
        self.ptrs[pos] = value;
        self.nkeys += 1;
    }

    fn leaf_remove_at(&mut self, pos: usize) {
        let n = self.nkeys as usize;
        self.keys.copy_within(pos + 1..n, pos);
        self.ptrs.copy_within(pos + 1..n, pos);
        self.nkeys -= 1;
    }

    /// Splits a full leaf, keeping the lower half here. Returns the upper
    /// half and its separator key.
    fn leaf_split(&mut self) -> (BpKey, BpNodeDisk) {
        let mid = self.nkeys as usize / 2;
        let mut right = BpNodeDisk::new(0);
        let moved = self.nkeys as usize - mid;
        right.keys[..moved].copy_from_slice(&self.keys[mid..self.nkeys as usize]);
        right.ptrs[..moved].copy_from_slice(&self.ptrs[mid..self.nkeys as usize]);
        right.nkeys = moved as u32;
        self.nkeys = mid as u32;
        (right.keys[0], right)
    }

    /// Inserts a separator and right-child after a child split.
    fn branch_insert_at(&mut self, pos: usize, sep: BpKey, right: Lbno) {
        let n = self.nkeys as usize;
        self.keys.copy_within(pos..n, pos + 1);
        self.ptrs.copy_within(pos + 1..n + 1, pos + 2);
        self.keys[pos] = sep;
        self.ptrs[pos + 1] = right;
        self.nkeys += 1;
    }

    /// Splits a full internal node; the middle key moves up.
    fn branch_split(&mut self) -> (BpKey, BpNodeDisk) {
        let mid = self.nkeys as usize / 2;
        let up = self.keys[mid];
        let mut right = BpNodeDisk::new(self.level);
        let moved = self.nkeys as usize - mid - 1;
        right.keys[..moved].copy_from_slice(&self.keys[mid + 1..self.nkeys as usize]);
        right.ptrs[..moved + 1].copy_from_slice(&self.ptrs[mid + 1..self.nkeys as usize + 1]);
        right.nkeys = moved as u32;
        self.nkeys = mid as u32;
        (up, right)
    }
}

/// Result of one insertion attempt.
pub enum BpInsert {
    Inserted,
    /// Key already present; carries the current value.
    Duplicate(BpValue),
}

enum Descend {
    Done,
    Split { sep: BpKey, right: Lbno },
    Duplicate(BpValue),
}

impl FileSystem {
    /// Creates the index inode for a directory and initializes the master
    /// and root nodes. Records the index inode in `i_bpino`.
    pub(crate) fn create_bptree(&mut self, dir_ictx: usize) -> IoResult<()> {
        let bpino = self.create_inode(INODE_TYPE_BPTREE, 0)?;
        let ictx = self.read_inode(bpino)?;

        let master = BpMasterDisk {
            magic: BP_NODE_SIGNATURE,
            root: 1,
            free_head: 0,
            next_lblk: 2,
            height: 1,
            key_count: 0,
        };
        self.write_index_block(ictx, bpino, 0, bytes_of(&master))?;
        let root = BpNodeDisk::new(0);
        self.write_index_block(ictx, bpino, 1, bytes_of(&root))?;

        self.inode_mut(ictx).i_size = 2 * CLUSTER_SIZE as u64;
        self.inode_mut(ictx).i_links_count = 1;
        self.release_inode(ictx, true)?;

        self.inode_mut(dir_ictx).i_bpino = bpino;
        Ok(())
    }

    pub(crate) fn bp_find(&mut self, bpino: InodeNo, key: BpKey) -> IoResult<Option<BpValue>> {
        let ictx = self.read_inode(bpino)?;
        let result = self.bp_find_inner(ictx, bpino, key);
        self.release_inode(ictx, false)?;
        result
    }

    fn bp_find_inner(
        &mut self,
        ictx: usize,
        bpino: InodeNo,
        key: BpKey,
    ) -> IoResult<Option<BpValue>> {
        let master = self.read_master(ictx, bpino)?;
        let mut lblk = master.root;
        loop {
            let node = self.read_node(ictx, bpino, lblk)?;
            if node.is_leaf() {
                return Ok(match node.search(key) {
                    Ok(pos) => Some(node.ptrs[pos]),
                    Err(_) => None,
                });
            }
            lblk = node.ptrs[node.child_slot(key)];
        }
    }

    /// Inserts `key -> value`; a duplicate key leaves the tree unchanged
    /// and reports the current value.
    pub(crate) fn bp_insert(
        &mut self,
        bpino: InodeNo,
        key: BpKey,
        value: BpValue,
    ) -> IoResult<BpInsert> {
        let ictx = self.read_inode(bpino)?;
        let result = self.bp_insert_inner(ictx, bpino, key, value);
        let dirty = matches!(&result, Ok(BpInsert::Inserted));
        self.release_inode(ictx, dirty)?;
        result
    }

    fn bp_insert_inner(
        &mut self,
        ictx: usize,
        bpino: InodeNo,
        key: BpKey,
        value: BpValue,
    ) -> IoResult<BpInsert> {
        let mut master = self.read_master(ictx, bpino)?;

        let root = master.root;
        match self.insert_descend(ictx, bpino, &mut master, root, key, value)? {
            Descend::Duplicate(cur) => return Ok(BpInsert::Duplicate(cur)),
            Descend::Done => {}
            Descend::Split { sep, right } => {
                // Root split: the tree grows one level.
                let new_root_lblk = self.alloc_node(ictx, bpino, &mut master)?;
                let mut new_root = BpNodeDisk::new(master.height);
                new_root.nkeys = 1;
                new_root.keys[0] = sep;
                new_root.ptrs[0] = master.root;
                new_root.ptrs[1] = right;
                self.write_node(ictx, bpino, new_root_lblk, &new_root)?;
                master.root = new_root_lblk;
                master.height += 1;
            }
        }

        master.key_count += 1;
        self.write_master(ictx, bpino, &master)?;
        Ok(BpInsert::Inserted)
    }

    fn insert_descend(
        &mut self,
        ictx: usize,
        bpino: InodeNo,
        master: &mut BpMasterDisk,
        lblk: Lbno,
        key: BpKey,
        value: BpValue,
    ) -> IoResult<Descend> {
        let mut node = self.read_node(ictx, bpino, lblk)?;

        if node.is_leaf() {
            match node.search(key) {
                Ok(pos) => return Ok(Descend::Duplicate(node.ptrs[pos])),
                Err(pos) => {
                    if (node.nkeys as usize) < BP_FANOUT {
                        node.leaf_insert_at(pos, key, value);
                        self.write_node(ictx, bpino, lblk, &node)?;
                        return Ok(Descend::Done);
                    }
                    let (sep, mut right) = node.leaf_split();
                    let right_lblk = self.alloc_node(ictx, bpino, master)?;
                    right.next = node.next;
                    node.next = right_lblk;
                    if key < sep {
                        let pos = node.search(key).unwrap_err();
                        node.leaf_insert_at(pos, key, value);
                    } else {
                        let pos = right.search(key).unwrap_err();
                        right.leaf_insert_at(pos, key, value);
                    }
                    self.write_node(ictx, bpino, lblk, &node)?;
                    self.write_node(ictx, bpino, right_lblk, &right)?;
                    return Ok(Descend::Split {
                        sep,
                        right: right_lblk,
                    });
                }
            }
        }

        let slot = node.child_slot(key);
        let child = node.ptrs[slot];
        match self.insert_descend(ictx, bpino, master, child, key, value)? {
            Descend::Done => Ok(Descend::Done),
            Descend::Duplicate(cur) => Ok(Descend::Duplicate(cur)),
            Descend::Split { sep, right } => {
                if (node.nkeys as usize) < BP_FANOUT {
                    node.branch_insert_at(slot, sep, right);
                    self.write_node(ictx, bpino, lblk, &node)?;
                    return Ok(Descend::Done);
                }
                let (up, mut upper) = node.branch_split();
                let upper_lblk = self.alloc_node(ictx, bpino, master)?;
                if sep < up {
                    let pos = node.search(sep).unwrap_err();
                    node.branch_insert_at(pos, sep, right);
                } else {
                    let pos = upper.search(sep).unwrap_err();
                    upper.branch_insert_at(pos, sep, right);
                }
                self.write_node(ictx, bpino, lblk, &node)?;
                self.write_node(ictx, bpino, upper_lblk, &upper)?;
                Ok(Descend::Split {
                    sep: up,
                    right: upper_lblk,
                })
            }
        }
    }

    /// Replaces the value of an existing key.
    pub(crate) fn bp_update(
        &mut self,
        bpino: InodeNo,
        key: BpKey,
        value: BpValue,
    ) -> IoResult<bool> {
        let ictx = self.read_inode(bpino)?;
        let master = self.read_master(ictx, bpino)?;

        let mut lblk = master.root;
        let updated = loop {
            let mut node = self.read_node(ictx, bpino, lblk)?;
            if node.is_leaf() {
                match node.search(key) {
                    Ok(pos) => {
                        node.ptrs[pos] = value;
                        self.write_node(ictx, bpino, lblk, &node)?;
                        break true;
                    }
                    Err(_) => break false,
                }
            }
            lblk = node.ptrs[node.child_slot(key)];
        };

        self.release_inode(ictx, updated)?;
        Ok(updated)
    }

    /// Removes a key from its leaf; internal separators are left alone.
    pub(crate) fn bp_remove(&mut self, bpino: InodeNo, key: BpKey) -> IoResult<bool> {
        let ictx = self.read_inode(bpino)?;
        let mut master = self.read_master(ictx, bpino)?;

        let mut lblk = master.root;
        let removed = loop {
            let mut node = self.read_node(ictx, bpino, lblk)?;
            if node.is_leaf() {
                match node.search(key) {
                    Ok(pos) => {
                        node.leaf_remove_at(pos);
                        self.write_node(ictx, bpino, lblk, &node)?;
                        break true;
                    }
                    Err(_) => break false,
                }
            }
            lblk = node.ptrs[node.child_slot(key)];
        };

        if removed {
            master.key_count -= 1;
            self.write_master(ictx, bpino, &master)?;
        }
        self.release_inode(ictx, removed)?;
        Ok(removed)
    }

    fn read_master(&mut self, ictx: usize, bpino: InodeNo) -> IoResult<BpMasterDisk> {
        let bh = self.get_bh(Some(ictx), bpino, 0, BhMode::Read, BufType::Meta)?;
        let master: BpMasterDisk =
            pod_read_unaligned(&self.bc.data(bh)[..core::mem::size_of::<BpMasterDisk>()]);
        self.release_bh(bh, InsertPos::Head, false);
        if master.magic != BP_NODE_SIGNATURE {
            return Err(FsError::Fatal("index master node signature mismatch"));
        }
        Ok(master)
    }

    fn write_master(&mut self, ictx: usize, bpino: InodeNo, master: &BpMasterDisk) -> IoResult<()> {
        self.write_index_block(ictx, bpino, 0, bytes_of(master))
    }

    fn read_node(&mut self, ictx: usize, bpino: InodeNo, lblk: Lbno) -> IoResult<BpNodeDisk> {
        let bh = self.get_bh(Some(ictx), bpino, lblk, BhMode::Read, BufType::Meta)?;
        let node: BpNodeDisk =
            pod_read_unaligned(&self.bc.data(bh)[..core::mem::size_of::<BpNodeDisk>()]);
        self.release_bh(bh, InsertPos::Head, false);
        if node.magic != BP_NODE_SIGNATURE {
            return Err(FsError::Fatal("index node signature mismatch"));
        }
        Ok(node)
    }

    fn write_node(&mut self, ictx: usize, bpino: InodeNo, lblk: Lbno, node: &BpNodeDisk) -> IoResult<()> {
        self.write_index_block(ictx, bpino, lblk, bytes_of(node))
    }

    fn write_index_block(
        &mut self,
        ictx: usize,
        bpino: InodeNo,
        lblk: Lbno,
        bytes: &[u8],
    ) -> IoResult<()> {
        self.get_block(ictx, lblk, true)?;
        let bh = self.get_bh(Some(ictx), bpino, lblk, BhMode::New, BufType::Meta)?;
        self.bc.data_mut(bh)[..bytes.len()].copy_from_slice(bytes);
        self.release_bh(bh, InsertPos::Head, true);
        Ok(())
    }

    /// Takes a node cluster from the free chain, or grows the index file
    /// by one cluster.
    fn alloc_node(
        &mut self,
        ictx: usize,
        bpino: InodeNo,
        master: &mut BpMasterDisk,
    ) -> IoResult<Lbno> {
        if master.free_head != 0 {
            let lblk = master.free_head;
            let node = self.read_node(ictx, bpino, lblk)?;
            master.free_head = node.next;
            return Ok(lblk);
        }
        let lblk = master.next_lblk;
        master.next_lblk += 1;
        self.get_block(ictx, lblk, true)?;
        let size = (lblk as u64 + 1) * CLUSTER_SIZE as u64;
        if self.inode(ictx).i_size < size {
            self.inode_mut(ictx).i_size = size;
        }
        Ok(lblk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_insert_keeps_keys_sorted() {
        let mut node = BpNodeDisk::new(0);
        for key in [40u64, 10, 30, 20] {
            let pos = node.search(key).unwrap_err();
            node.leaf_insert_at(pos, key, key as u32);
        }
        assert_eq!(&node.keys[..4], &[10, 20, 30, 40]);
        assert_eq!(&node.ptrs[..4], &[10, 20, 30, 40]);

        assert_eq!(node.search(30), Ok(2));
        node.leaf_remove_at(2);
        assert_eq!(&node.keys[..3], &[10, 20, 40]);
        assert_eq!(node.search(30), Err(2));
    }

    #[test]
    fn leaf_split_halves_the_keys() {
        let mut node = BpNodeDisk::new(0);
        for key in 0..BP_FANOUT as u64 {
            node.leaf_insert_at(key as usize, key, key as u32);
        }
        let (sep, right) = node.leaf_split();
        assert_eq!(node.nkeys as usize + right.nkeys as usize, BP_FANOUT);
        assert_eq!(sep, right.keys[0]);
        assert!(node.keys[node.nkeys as usize - 1] < sep);
    }

    #[test]
    fn branch_split_promotes_the_middle_key() {
        let mut node = BpNodeDisk::new(1);
        for i in 0..BP_FANOUT {
            node.keys[i] = (i as u64 + 1) * 10;
        }
        for i in 0..=BP_FANOUT {
            node.ptrs[i] = i as u32 + 100;
        }
        node.nkeys = BP_FANOUT as u32;

        let (up, right) = node.branch_split();
        assert_eq!(
            node.nkeys as usize + right.nkeys as usize + 1,
            BP_FANOUT
        );
        assert!(node.keys[node.nkeys as usize - 1] < up);
        assert!(up < right.keys[0]);
        // Child pointers stay contiguous across the split.
        assert_eq!(node.ptrs[node.nkeys as usize], 100 + node.nkeys);
        assert_eq!(right.ptrs[0], 100 + node.nkeys + 1);
    }

    #[test]
    fn child_slot_routes_around_separators() {
        let mut node = BpNodeDisk::new(1);
        node.nkeys = 2;
        node.keys[0] = 10;
        node.keys[1] = 20;
        assert_eq!(node.child_slot(5), 0);
        assert_eq!(node.child_slot(10), 1);
        assert_eq!(node.child_slot(15), 1);
        assert_eq!(node.child_slot(25), 2);
    }
}
