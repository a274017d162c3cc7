//! Directory engine.
//!
//! Directory content is a dense array of fixed-size entry records packed
//! into the directory inode's clusters. Name lookup is accelerated by the
//! per-directory B+tree index keyed on a 64-bit filename hash; colliding
//! keys degrade that name to a linear scan, tracked by a small collision
//! counter packed into the index value's high bits.

use bytemuck::{bytes_of, pod_read_unaligned};
use log::{debug, warn};
use modular_bitfield::prelude::*;

use crate::err::{FsError, IoResult};
use crate::fs::buffer::{Bh, BhMode, BufType, InsertPos};
use crate::fs::bptree::BpInsert;
use crate::fs::layout::{
    InodeNo, RawDirEntry, DIR_DELETED, DIR_ENTRY_NUM, DIR_ENTRY_SIZE, DIR_USED,
    FNAME_SIZE, INODE_TYPE_DIRECTORY, MAX_FILES_PER_DIR,
};
use crate::fs::{DirEntryInfo, FileSystem};

/// A directory-index value: the entry offset in the low bits, the
/// collision counter in the high bits. A non-zero collision counter means
/// the offset is unreliable and lookups fall back to a linear scan.
#[bitfield]
#[derive(Clone, Copy, Debug)]
pub struct IndexValue {
    pub offset: B28,
    pub collision: B4,
}

impl From<u32> for IndexValue {
    fn from(raw: u32) -> Self {
        Self::from_bytes(raw.to_le_bytes())
    }
}

impl From<IndexValue> for u32 {
    fn from(value: IndexValue) -> Self {
        u32::from_le_bytes(value.into_bytes())
    }
}

/// Two 32-bit hashes over the filename halves, concatenated into the
/// index key.
pub fn dir_hash(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let half = bytes.len() / 2;
    let h1 = crc32c_calc(&bytes[..half]);
    let h2 = crc32c_calc(&bytes[half..]);
    u64::from(h1) | (u64::from(h2) << 32)
}

impl FileSystem {
    /// Records `name -> offset` in the directory index. A key collision
    /// bumps the collision counter and blanks the offset, demoting the
    /// name to linear scans.
    pub(crate) fn set_dir_indexing(
        &mut self,
        bpino: InodeNo,
        name: &str,
        offset: u32,
    ) -> IoResult<()> {
        let key = dir_hash(name);
        let value = IndexValue::new().with_offset(offset & 0x0FFF_FFFF);
        match self.bp_insert(bpino, key, u32::from(value))? {
            BpInsert::Inserted => Ok(()),
            BpInsert::Duplicate(cur) => {
                let collisions = IndexValue::from(cur).collision().saturating_add(1);
                warn!(target: "dir", "filename hash collision {key:#018x} (count {collisions})");
                let marker = IndexValue::new().with_collision(collisions);
                self.bp_update(bpino, key, u32::from(marker))?;
                Ok(())
            }
        }
    }

    /// Looks `name` up in the index. `Some(0)` with a collision in play
    /// forces a linear scan; `None` means the key is absent.
    pub(crate) fn get_dir_indexing(
        &mut self,
        bpino: InodeNo,
        name: &str,
    ) -> IoResult<Option<u32>> {
        if name == "." || name == ".." {
            return Ok(Some(0));
        }
        let key = dir_hash(name);
        let Some(raw) = self.bp_find(bpino, key)? else {
            return Ok(None);
        };
        let value = IndexValue::from(raw);
        if value.collision() != 0 {
            Ok(Some(0))
        } else {
            Ok(Some(value.offset()))
        }
    }

    /// Unindexes `name`: removes the key, or steps the collision counter
    /// down while collided names remain.
    pub(crate) fn del_dir_indexing(&mut self, bpino: InodeNo, name: &str) -> IoResult<()> {
        let key = dir_hash(name);
        let Some(raw) = self.bp_find(bpino, key)? else {
            warn!(target: "dir", "unindexing a name whose key {key:#018x} is absent");
            return Ok(());
        };
        let value = IndexValue::from(raw);
        if value.collision() == 0 {
            self.bp_remove(bpino, key)?;
        } else {
            let marker = IndexValue::new().with_collision(value.collision() - 1);
            self.bp_update(bpino, key, u32::from(marker))?;
        }
        Ok(())
    }

    fn dentry_at(&self, bh: Bh, slot: usize) -> RawDirEntry {
        pod_read_unaligned(&self.bc.data(bh)[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE])
    }

    fn write_dentry_at(&mut self, bh: Bh, slot: usize, dent: &RawDirEntry) {
        self.bc.data_mut(bh)[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
            .copy_from_slice(bytes_of(dent));
    }

    /// Finds the entry offset of `name`, consulting the index first and
    /// scanning the entry array from the reported offset.
    pub(crate) fn find_existing_dentry(
        &mut self,
        dir_ictx: usize,
        name: &str,
    ) -> IoResult<Option<u32>> {
        let dir_inode = *self.inode(dir_ictx);
        let total = (dir_inode.i_size / DIR_ENTRY_SIZE as u64) as u32;
        if total == 0 {
            return Ok(None);
        }

        let mut start = 0u32;
        if dir_inode.i_bpino != 0 {
            match self.get_dir_indexing(dir_inode.i_bpino, name)? {
                Some(offset) if offset < total => start = offset,
                Some(_) | None => {
                    debug!(target: "dir", "name {name} not indexed, linear scan");
                }
            }
        }

        let mut offset = start;
        let mut bh: Option<Bh> = None;
        let mut cur_cluster = u32::MAX;
        while offset < total {
            let cluster = offset / DIR_ENTRY_NUM;
            if cluster != cur_cluster {
                if let Some(old) = bh.take() {
                    self.release_bh(old, InsertPos::Head, false);
                }
                bh = Some(self.get_bh(
                    Some(dir_ictx),
                    dir_inode.i_ino,
                    cluster,
                    BhMode::Read,
                    BufType::Meta,
                )?);
                cur_cluster = cluster;
            }

            let dent = self.dentry_at(bh.unwrap(), (offset % DIR_ENTRY_NUM) as usize);
            if dent.name_matches(name) {
                self.release_bh(bh.take().unwrap(), InsertPos::Head, false);
                return Ok(Some(offset));
            }
            offset += 1;
        }

        if let Some(old) = bh.take() {
            self.release_bh(old, InsertPos::Head, false);
        }
        Ok(None)
    }

    /// Finds a reusable entry slot, starting after the last-used pointer;
    /// grows the directory by one cluster when every slot is taken.
    pub(crate) fn find_empty_dentry(&mut self, dir_ictx: usize) -> IoResult<u32> {
        let dir_inode = *self.inode(dir_ictx);
        let total = (dir_inode.i_size / DIR_ENTRY_SIZE as u64) as u32;

        if total > 0 {
            let start = (dir_inode.i_ptr + 1) % total;
            let mut offset = start;
            let mut bh: Option<Bh> = None;
            let mut cur_cluster = u32::MAX;
            for _ in 0..total {
                let cluster = offset / DIR_ENTRY_NUM;
                if cluster != cur_cluster {
                    if let Some(old) = bh.take() {
                        self.release_bh(old, InsertPos::Head, false);
                    }
                    bh = Some(self.get_bh(
                        Some(dir_ictx),
                        dir_inode.i_ino,
                        cluster,
                        BhMode::Read,
                        BufType::Meta,
                    )?);
                    cur_cluster = cluster;
                }

                let dent = self.dentry_at(bh.unwrap(), (offset % DIR_ENTRY_NUM) as usize);
                if dent.is_invalid() {
                    self.release_bh(bh.take().unwrap(), InsertPos::Head, false);
                    return Ok(offset);
                }
                offset = (offset + 1) % total;
            }
            if let Some(old) = bh.take() {
                self.release_bh(old, InsertPos::Head, false);
            }
        }

        // Every slot taken: grow by one zero-initialized cluster.
        let lblk = total / DIR_ENTRY_NUM;
        self.get_block(dir_ictx, lblk, true)?;
        let bh = self.get_bh(Some(dir_ictx), dir_inode.i_ino, lblk, BhMode::New, BufType::Meta)?;
        self.release_bh(bh, InsertPos::Head, true);
        self.inode_mut(dir_ictx).i_size += DIR_ENTRY_SIZE as u64 * DIR_ENTRY_NUM as u64;
        Ok(total)
    }

    /// Fills an empty entry of `parent` with `name -> ino`, bumping both
    /// link counts and indexing the name.
    pub(crate) fn link_ino(&mut self, parent: InodeNo, name: &str, ino: InodeNo) -> IoResult<()> {
        if name.is_empty() || name.len() > FNAME_SIZE {
            return Err(FsError::Invalid("filename length out of range"));
        }

        let dir_ictx = self.read_inode(parent)?;
        if self.inode(dir_ictx).i_type != INODE_TYPE_DIRECTORY {
            self.release_inode(dir_ictx, false)?;
            return Err(FsError::Invalid("link target parent is not a directory"));
        }
        if self.inode(dir_ictx).i_links_count >= MAX_FILES_PER_DIR {
            self.release_inode(dir_ictx, false)?;
            return Err(FsError::NoSpace);
        }

        let offset = match self.find_empty_dentry(dir_ictx) {
            Ok(offset) => offset,
            Err(err) => {
                self.release_inode(dir_ictx, false)?;
                return Err(err);
            }
        };

        let dir_inode = self.inode_mut(dir_ictx);
        dir_inode.i_ptr = offset;
        dir_inode.i_links_count += 1;
        let bpino = dir_inode.i_bpino;
        let dir_ino = dir_inode.i_ino;

        let ictx = self.read_inode(ino)?;
        self.inode_mut(ictx).i_links_count += 1;
        let version = self.inode(ictx).i_version;

        let cluster = offset / DIR_ENTRY_NUM;
        let bh = self.get_bh(Some(dir_ictx), dir_ino, cluster, BhMode::Read, BufType::Meta)?;
        let mut dent = RawDirEntry::default();
        dent.d_flag = DIR_USED;
        dent.d_ino = ino;
        dent.d_version = version;
        dent.set_name(name);
        self.write_dentry_at(bh, (offset % DIR_ENTRY_NUM) as usize, &dent);

        if bpino != 0 {
            self.set_dir_indexing(bpino, name, offset)?;
        }

        self.release_bh(bh, InsertPos::Head, true);
        self.release_inode(ictx, true)?;
        self.release_inode(dir_ictx, true)?;
        Ok(())
    }

    /// Removes the entry `name` from `parent`, decrementing both link
    /// counts. Returns the unlinked inode number.
    pub(crate) fn rm_direntry(&mut self, parent: InodeNo, name: &str) -> IoResult<InodeNo> {
        let dir_ictx = self.read_inode(parent)?;

        let Some(offset) = self.find_existing_dentry(dir_ictx, name)? else {
            self.release_inode(dir_ictx, false)?;
            return Err(FsError::NotFound);
        };

        let dir_inode = *self.inode(dir_ictx);
        let cluster = offset / DIR_ENTRY_NUM;
        let bh = self.get_bh(
            Some(dir_ictx),
            dir_inode.i_ino,
            cluster,
            BhMode::Read,
            BufType::Meta,
        )?;
        let mut dent = self.dentry_at(bh, (offset % DIR_ENTRY_NUM) as usize);
        let ino = dent.d_ino;

        let ictx = self.read_inode(ino)?;
        self.inode_mut(ictx).i_links_count -= 1;

        if dir_inode.i_bpino != 0 {
            self.del_dir_indexing(dir_inode.i_bpino, name)?;
        }

        dent.d_flag = DIR_DELETED;
        self.write_dentry_at(bh, (offset % DIR_ENTRY_NUM) as usize, &dent);
        self.inode_mut(dir_ictx).i_links_count -= 1;

        self.release_bh(bh, InsertPos::Head, true);
        self.release_inode(dir_ictx, true)?;
        self.release_inode(ictx, true)?;
        Ok(ino)
    }

    /// Resolves `name` within the directory `parent`.
    pub(crate) fn lookup(&mut self, parent: InodeNo, name: &str) -> IoResult<DirEntryInfo> {
        let dir_ictx = self.read_inode(parent)?;
        let found = self.find_existing_dentry(dir_ictx, name)?;

        let result = match found {
            None => Err(FsError::NotFound),
            Some(offset) => {
                let dir_ino = self.inode(dir_ictx).i_ino;
                let cluster = offset / DIR_ENTRY_NUM;
                let bh = self.get_bh(
                    Some(dir_ictx),
                    dir_ino,
                    cluster,
                    BhMode::Read,
                    BufType::Meta,
                )?;
                let dent = self.dentry_at(bh, (offset % DIR_ENTRY_NUM) as usize);
                self.release_bh(bh, InsertPos::Head, false);
                Ok(DirEntryInfo {
                    name: String::from(dent.name()),
                    ino: dent.d_ino,
                })
            }
        };

        self.release_inode(dir_ictx, false)?;
        result
    }

    /// Iterates a directory, yielding its used entries.
    pub(crate) fn readdir(&mut self, dir_ino: InodeNo) -> IoResult<Vec<DirEntryInfo>> {
        let dir_ictx = self.read_inode(dir_ino)?;
        if self.inode(dir_ictx).i_type != INODE_TYPE_DIRECTORY {
            self.release_inode(dir_ictx, false)?;
            return Err(FsError::Invalid("readdir of a non-directory"));
        }
        let total = (self.inode(dir_ictx).i_size / DIR_ENTRY_SIZE as u64) as u32;

        let mut entries = Vec::new();
        let clusters = total.div_ceil(DIR_ENTRY_NUM);
        for cluster in 0..clusters {
            let bh = self.get_bh(Some(dir_ictx), dir_ino, cluster, BhMode::Read, BufType::Meta)?;
            let in_cluster = (total - cluster * DIR_ENTRY_NUM).min(DIR_ENTRY_NUM);
            for slot in 0..in_cluster as usize {
                let dent = self.dentry_at(bh, slot);
                if dent.d_flag == DIR_USED {
                    entries.push(DirEntryInfo {
                        name: String::from(dent.name()),
                        ino: dent.d_ino,
                    });
                }
            }
            self.release_bh(bh, InsertPos::Head, false);
        }

        self.release_inode(dir_ictx, false)?;
        Ok(entries)
    }

    pub(crate) fn dir_is_empty(&mut self, dir_ino: InodeNo) -> IoResult<bool> {
        Ok(self.readdir(dir_ino)?.is_empty())
    }
}

/// Bit-reflected Castagnoli polynomial (0x1EDC6F41 reversed).
const CRC32C_POLY_REFLECTED: u32 = 0x82F6_3B78;

/// Byte-at-a-time CRC-32C lookup table, generated at compile time.
const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut crc = byte as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[byte] = crc;
        byte += 1;
    }
    table
}

const CRC32C_TABLE: [u32; 256] = crc32c_table();

fn crc32c_calc(buf: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF;

    for &b in buf {
        crc = CRC32C_TABLE[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8);
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_value_packs_offset_and_collisions() {
        let value = IndexValue::new().with_offset(1234).with_collision(3);
        let raw = u32::from(value);
        let back = IndexValue::from(raw);
        assert_eq!(back.offset(), 1234);
        assert_eq!(back.collision(), 3);

        let clean = IndexValue::from(77u32);
        assert_eq!(clean.offset(), 77);
        assert_eq!(clean.collision(), 0);
    }

    #[test]
    fn generated_table_matches_published_crc32c_constants() {
        // Spot values of the standard reflected CRC-32C table.
        assert_eq!(CRC32C_TABLE[0], 0x0000_0000);
        assert_eq!(CRC32C_TABLE[1], 0xF26B_8303);
        assert_eq!(CRC32C_TABLE[128], 0x82F6_3B78);
        assert_eq!(CRC32C_TABLE[255], 0xAD7D_5351);
    }

    #[test]
    fn hash_differs_between_names() {
        let a = dir_hash("alpha.log");
        let b = dir_hash("bravo.log");
        assert_ne!(a, b);
        assert_eq!(a, dir_hash("alpha.log"));
    }

    #[test]
    fn hash_splits_the_name_in_halves() {
        // Keys concatenate two half-name hashes; names sharing one half
        // still get distinct keys.
        let a = dir_hash("aaaabbbb");
        let b = dir_hash("aaaacccc");
        assert_eq!(a as u32, b as u32);
        assert_ne!(a >> 32, b >> 32);
    }
}
