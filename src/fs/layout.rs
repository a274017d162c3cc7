//! On-disk record layout.
//!
//! Every persisted structure is a little-endian `#[repr(C)]` [`Pod`] record
//! serialized with `bytemuck` straight into 4 KiB cluster buffers. The
//! device is addressed exclusively in clusters; a block group is a
//! contiguous, power-of-two span of clusters carrying its own descriptor,
//! bitmaps and inode table.
//!
//! Block group internal layout, in cluster offsets from the group base:
//!
//! | offset | content |
//! |---|---|
//! | `0` | superblock (group 0) / reserved (other groups) |
//! | [`BD_OFFSET`] | group descriptor |
//! | `2` | data bitmap |
//! | `3` | inode bitmap |
//! | `4..4+itable` | inode table |
//! | `bd_dtable_start..` | data region |

use bytemuck::{Pod, Zeroable};

/// Unit of device I/O and on-disk addressing, in bytes.
pub const CLUSTER_SIZE: usize = 4096;
pub const CLUSTER_SIZE_BITS: u32 = 12;

/// Sector size assumed when converting device capacities.
pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_CLUSTER: u64 = (CLUSTER_SIZE / SECTOR_SIZE) as u64;

/// Superblock location, and descriptor offset inside every block group.
pub const SUPERBLOCK_CLUSTER: u32 = 0;
pub const BD_OFFSET: u32 = 1;
pub const DBITMAP_OFFSET: u32 = 2;
pub const IBITMAP_OFFSET: u32 = 3;
pub const ITABLE_OFFSET: u32 = 4;

pub const SB_SIGNATURE: u32 = 0x4E56_4653; // "NVFS"
pub const BD_SIGNATURE: u32 = 0x4E56_4244; // "NVBD"
pub const BP_NODE_SIGNATURE: u32 = 0x4E56_4250; // "NVBP"

/// Inode numbering.
///
/// Numbers below [`ROOT_INO`] are reserved. The pseudo-inodes have no
/// stored block map; their logical-to-physical translation is computed from
/// block group geometry (see `get_pbn`).
pub type InodeNo = u32;
pub type Lbno = u32;
pub type Pbno = u32;

/// Identity translation: logical block = physical block.
pub const BLOCK_IO_INO: InodeNo = 1;
/// Logical block k = k-th cluster of the inode table (device-wide).
pub const ITABLE_INO: InodeNo = 2;
/// Logical block k = data bitmap cluster of block group k.
pub const DBITMAP_INO: InodeNo = 3;
/// Logical block k = inode bitmap cluster of block group k.
pub const IBITMAP_INO: InodeNo = 4;
/// Logical block k = descriptor cluster of block group k.
pub const BD_INO: InodeNo = 5;
/// First allocatable inode number; the root directory.
pub const ROOT_INO: InodeNo = 16;

pub const INODE_ENTRY_SIZE: usize = 128;
pub const INODE_ENTRY_NUM: u32 = (CLUSTER_SIZE / INODE_ENTRY_SIZE) as u32;

pub const DIR_ENTRY_SIZE: usize = 128;
pub const DIR_ENTRY_NUM: u32 = (CLUSTER_SIZE / DIR_ENTRY_SIZE) as u32;
/// Maximum filename length, keeping one trailing NUL in the record.
pub const FNAME_SIZE: usize = 115;

/// Direct block pointers per inode; the last two slots of the block map
/// are the single- and double-indirect pointers.
pub const DIRECT_BLOCKS: usize = 16;
pub const SINGLE_INDIRECT_SLOT: usize = 16;
pub const DOUBLE_INDIRECT_SLOT: usize = 17;
pub const BLOCK_MAP_SLOTS: usize = 18;
/// Block pointers held by one indirect cluster.
pub const PTRS_PER_CLUSTER: u32 = (CLUSTER_SIZE / 4) as u32;

pub const MAX_FILE_BLOCKS: u64 = DIRECT_BLOCKS as u64
    + PTRS_PER_CLUSTER as u64
    + PTRS_PER_CLUSTER as u64 * PTRS_PER_CLUSTER as u64;
pub const MAX_FILE_SIZE: u64 = MAX_FILE_BLOCKS * CLUSTER_SIZE as u64;

pub const MAX_FILES_PER_DIR: u32 = 0x7FFF_FFFF;
pub const MAX_OPEN_FILE: usize = 256;

/// Application slots persisted in the control plane's superblock region.
pub const MAX_APPS: usize = 15;
pub const APP_NAME_SIZE: usize = 32;

pub const INODE_TYPE_FILE: u32 = 1;
pub const INODE_TYPE_DIRECTORY: u32 = 2;
pub const INODE_TYPE_SYMLINK: u32 = 3;
pub const INODE_TYPE_BPTREE: u32 = 4;

pub const DIR_EMPTY: u32 = 0;
pub const DIR_USED: u32 = 1;
pub const DIR_DELETED: u32 = 2;

/// Device-wide constants and global counters shared with data planes over
/// the superblock-copy RPC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SuperblockCommon {
    pub sb_signature: u32,
    pub sb_root_ino: u32,
    pub sb_no_of_sectors: u64,
    pub sb_no_of_blocks: u64,
    pub sb_no_of_used_blocks: u64,
    pub sb_free_blocks: u64,
    pub sb_last_update: u64,
    pub sb_free_inodes: u32,
    pub sb_bg_num: u32,
    pub sb_no_of_inodes_per_bg: u32,
    pub sb_no_of_blocks_per_bg: u32,
    pub sb_last_allocated_ino: u32,
    pub sb_mount_cnt: u32,
    pub sb_umount: u32,
    pub sb_reserved: u32,
}

/// One registered application in the control plane's ownership map.
///
/// Container ownership itself is replayed from the `bd_owner` fields; this
/// table anchors the stable application id and its root container so a
/// restarted data plane can reclaim its groups under the same name.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct AppSlot {
    pub name: [u8; APP_NAME_SIZE],
    pub root_bg: u32,
    pub registered: u32,
}

/// The on-disk superblock, written to cluster 0 by the control plane on
/// unmount.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct DiskSuperblock {
    pub common: SuperblockCommon,
    pub apps: [AppSlot; MAX_APPS],
}

/// Per-process mirror of the global counters, restricted to the block
/// groups currently owned by this process.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct AppSuperblock {
    pub asb_core_id: u32,
    pub asb_root_bg_id: u32,
    pub asb_free_inodes: u32,
    pub asb_reserved: u32,
    pub asb_free_blocks: u64,
    pub asb_no_of_used_blocks: u64,
}

/// On-disk block group descriptor, held in cluster [`BD_OFFSET`] of every
/// group. All `*_start` fields are absolute cluster numbers.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BgDescriptor {
    pub bd_magic: u32,
    pub bd_id: u32,
    /// Process id owning this group at data-plane time, 0 when unowned.
    pub bd_owner: u32,
    pub bd_max_inodes: u32,
    pub bd_max_blocks: u32,
    pub bd_free_inodes: u32,
    pub bd_free_blocks: u32,
    /// Allocation hint, relative to the group base.
    pub bd_next_block: u32,
    pub bd_bg_start: u32,
    pub bd_dbitmap_start: u32,
    pub bd_ibitmap_start: u32,
    pub bd_itable_start: u32,
    pub bd_itable_size: u32,
    pub bd_dtable_start: u32,
}

impl BgDescriptor {
    /// Cluster count occupied by descriptor, bitmaps and inode table,
    /// including the reserved group-base cluster.
    pub fn meta_clusters(&self) -> u32 {
        self.bd_dtable_start - self.bd_bg_start
    }

    /// An owned group is returnable to the control plane once every data
    /// block and every inode in it is free again.
    pub fn is_empty(&self) -> bool {
        self.bd_free_blocks + self.meta_clusters() == self.bd_max_blocks
            && self.bd_free_inodes == self.bd_max_inodes
    }
}

/// On-disk inode slot, [`INODE_ENTRY_NUM`] per inode table cluster.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct RawInode {
    pub i_size: u64,
    pub i_mtime: u64,
    pub i_ctime: u64,
    pub i_ino: u32,
    pub i_type: u32,
    pub i_mode: u32,
    pub i_links_count: u32,
    pub i_version: u32,
    pub i_deleted: u32,
    /// Last-used directory entry offset, used as the insertion hint.
    pub i_ptr: u32,
    /// Inode of this directory's hash index, 0 when absent.
    pub i_bpino: u32,
    pub i_blocks: [u32; BLOCK_MAP_SLOTS],
}

/// Fixed-size directory entry record.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct RawDirEntry {
    pub d_flag: u32,
    pub d_ino: u32,
    pub d_version: u32,
    pub d_filename: [u8; FNAME_SIZE + 1],
}

impl RawDirEntry {
    pub fn is_invalid(&self) -> bool {
        self.d_flag == DIR_EMPTY || self.d_flag == DIR_DELETED
    }

    pub fn name(&self) -> &str {
        let end = self
            .d_filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.d_filename.len());
        core::str::from_utf8(&self.d_filename[..end]).unwrap_or("")
    }

    pub fn set_name(&mut self, name: &str) {
        self.d_filename = [0u8; FNAME_SIZE + 1];
        self.d_filename[..name.len()].copy_from_slice(name.as_bytes());
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.d_flag == DIR_USED && self.name() == name
    }
}

impl Default for RawDirEntry {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

const _: () = assert!(core::mem::size_of::<RawInode>() == INODE_ENTRY_SIZE);
const _: () = assert!(core::mem::size_of::<RawDirEntry>() == DIR_ENTRY_SIZE);
const _: () = assert!(core::mem::size_of::<BgDescriptor>() <= CLUSTER_SIZE);
const _: () = assert!(core::mem::size_of::<DiskSuperblock>() <= CLUSTER_SIZE);

/// Parameters chosen at format time.
#[derive(Clone, Copy, Debug)]
pub struct FormatParams {
    /// Clusters per block group, power of two, at most one bitmap cluster
    /// worth of bits.
    pub clusters_per_bg: u32,
    /// Inodes per block group, multiple of [`INODE_ENTRY_NUM`].
    pub inodes_per_bg: u32,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            clusters_per_bg: 1 << 15,
            inodes_per_bg: (1 << 15) / 4,
        }
    }
}

impl FormatParams {
    pub fn validate(&self) -> crate::err::CanFail {
        use crate::err::FsError;

        if !self.clusters_per_bg.is_power_of_two() {
            return Err(FsError::Invalid("clusters_per_bg must be a power of two"));
        }
        if self.clusters_per_bg as usize > CLUSTER_SIZE * 8 {
            return Err(FsError::Invalid("data bitmap does not fit in one cluster"));
        }
        if self.inodes_per_bg as usize > CLUSTER_SIZE * 8 {
            return Err(FsError::Invalid("inode bitmap does not fit in one cluster"));
        }
        if self.inodes_per_bg % INODE_ENTRY_NUM != 0 {
            return Err(FsError::Invalid(
                "inodes_per_bg must be a multiple of the inode table packing",
            ));
        }
        let itable = self.inodes_per_bg / INODE_ENTRY_NUM;
        if ITABLE_OFFSET + itable >= self.clusters_per_bg {
            return Err(FsError::Invalid("inode table does not fit in a block group"));
        }
        Ok(())
    }

    /// Descriptor template for block group `bg_id`.
    pub fn descriptor(&self, bg_id: u32) -> BgDescriptor {
        let base = bg_id * self.clusters_per_bg;
        let itable_size = self.inodes_per_bg / INODE_ENTRY_NUM;
        let dtable_start = base + ITABLE_OFFSET + itable_size;
        BgDescriptor {
            bd_magic: BD_SIGNATURE,
            bd_id: bg_id,
            bd_owner: 0,
            bd_max_inodes: self.inodes_per_bg,
            bd_max_blocks: self.clusters_per_bg,
            bd_free_inodes: self.inodes_per_bg,
            bd_free_blocks: self.clusters_per_bg - (dtable_start - base),
            bd_next_block: dtable_start - base,
            bd_bg_start: base,
            bd_dbitmap_start: base + DBITMAP_OFFSET,
            bd_ibitmap_start: base + IBITMAP_OFFSET,
            bd_itable_start: base + ITABLE_OFFSET,
            bd_itable_size: itable_size,
            bd_dtable_start: dtable_start,
        }
    }
}

/// Number of whole block groups a device of `clusters` clusters can hold.
pub fn bg_count_for(clusters: u64, clusters_per_bg: u32) -> u32 {
    (clusters / clusters_per_bg as u64) as u32
}

/// Size in clusters needed to hold `size` bytes.
pub fn size_to_blocks(size: u64) -> u64 {
    size.div_ceil(CLUSTER_SIZE as u64)
}

/// Logical block containing byte offset `off`.
pub fn byte_to_block(off: u64) -> Lbno {
    (off >> CLUSTER_SIZE_BITS) as Lbno
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_are_packed() {
        assert_eq!(core::mem::size_of::<RawInode>(), 128);
        assert_eq!(core::mem::size_of::<RawDirEntry>(), 128);
        assert_eq!(core::mem::size_of::<AppSlot>(), 40);
        assert_eq!(core::mem::size_of::<AppSuperblock>(), 32);
    }

    #[test]
    fn descriptor_template_layout() {
        let params = FormatParams {
            clusters_per_bg: 1024,
            inodes_per_bg: 256,
        };
        params.validate().unwrap();

        let bd = params.descriptor(2);
        assert_eq!(bd.bd_bg_start, 2048);
        assert_eq!(bd.bd_dbitmap_start, 2050);
        assert_eq!(bd.bd_ibitmap_start, 2051);
        assert_eq!(bd.bd_itable_start, 2052);
        assert_eq!(bd.bd_itable_size, 8);
        assert_eq!(bd.bd_dtable_start, 2060);
        assert_eq!(bd.bd_free_blocks, 1024 - 12);
        assert!(bd.is_empty());
    }

    #[test]
    fn format_params_reject_oversized_bitmaps() {
        let params = FormatParams {
            clusters_per_bg: 1 << 16,
            inodes_per_bg: 256,
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn dir_entry_name_round_trip() {
        let mut dent = RawDirEntry::default();
        dent.set_name("config.toml");
        dent.d_flag = DIR_USED;
        assert_eq!(dent.name(), "config.toml");
        assert!(dent.name_matches("config.toml"));
        assert!(!dent.name_matches("config.tom"));
    }
}
