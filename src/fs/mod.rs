//! The filesystem core: on-disk engine, caches and the public metadata
//! API.
//!
//! [`FileSystem`] is the explicit mount context threaded through every
//! operation; there is no process-global superblock handle. A process
//! mounts the shared device in one of three roles ([`ProcessRole`]): as a
//! standalone owner of the whole device, as the control plane arbitrating
//! block group ownership for data planes, or as a data plane serving a
//! workload out of the block groups it leased over IPC.
//!
//! Operations on files and directories consult the inode-context cache,
//! which consults the buffer cache, which consults the device facade.
//! Mutations mark buffers dirty; the dirty-flush pipeline batches them
//! into bounded asynchronous write bursts.

pub mod bitmap;
pub mod block_grp;
pub mod bptree;
pub mod buffer;
pub mod dir;
pub mod flush;
pub mod ictx;
pub mod inode;
pub mod layout;
pub mod mount;

use std::sync::Arc;

use log::info;

use crate::drivers::DeviceQueue;
use crate::err::{CanFail, FsError, IoResult};
use crate::fs::block_grp::BgList;
use crate::fs::buffer::BufferCache;
use crate::fs::flush::FlushMode;
use crate::fs::ictx::IctxCache;
use crate::fs::layout::{
    AppSlot, AppSuperblock, InodeNo, SuperblockCommon, INODE_TYPE_DIRECTORY, INODE_TYPE_FILE,
    MAX_APPS, MAX_OPEN_FILE, ROOT_INO,
};
use crate::ipc::{IpcHub, PerfStatIpc};

/// Which role this process plays on the shared device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessRole {
    /// Single process owning every block group.
    Standalone,
    /// Primary process of a multi-process deployment; owns the device,
    /// the free pool and block group 0.
    Control,
    /// Worker process leasing block groups from the control plane.
    Data,
}

impl ProcessRole {
    pub fn is_primary(self) -> bool {
        !matches!(self, ProcessRole::Data)
    }

    pub fn is_dataplane_model(self) -> bool {
        !matches!(self, ProcessRole::Standalone)
    }
}

/// Buffer cache sizing per role, in clusters.
pub const BUFFER_SIZE_CONTROL: usize = 1024;
pub const BUFFER_SIZE_DATA: usize = 4096;
pub const BUFFER_SIZE_DATA_PREALLOC: usize = 8192;
pub const BUFFER_SIZE_STANDALONE: usize = 8192;

/// Number of block groups a preallocating data plane pads itself up to at
/// mount.
pub const CONTAINER_PREALLOCATION_COUNT: u32 = 4;

#[derive(Clone, Debug)]
pub struct MountParams {
    pub role: ProcessRole,
    /// Application name; the control plane keys container ownership on it.
    pub appname: String,
    /// Buffer cache capacity override, in clusters.
    pub buffer_clusters: Option<usize>,
    /// Lease containers up front instead of on demand, and never release
    /// them back.
    pub preallocation: bool,
}

impl Default for MountParams {
    fn default() -> Self {
        Self {
            role: ProcessRole::Standalone,
            appname: String::from("nvfs"),
            buffer_clusters: None,
            preallocation: false,
        }
    }
}

impl MountParams {
    pub fn standalone() -> Self {
        Self::default()
    }

    pub fn control() -> Self {
        Self {
            role: ProcessRole::Control,
            ..Self::default()
        }
    }

    pub fn data(appname: &str) -> Self {
        Self {
            role: ProcessRole::Data,
            appname: String::from(appname),
            ..Self::default()
        }
    }

    pub(crate) fn buffer_clusters(&self) -> usize {
        self.buffer_clusters.unwrap_or(match self.role {
            ProcessRole::Standalone => BUFFER_SIZE_STANDALONE,
            ProcessRole::Control => BUFFER_SIZE_CONTROL,
            ProcessRole::Data if self.preallocation => BUFFER_SIZE_DATA_PREALLOC,
            ProcessRole::Data => BUFFER_SIZE_DATA,
        })
    }
}

/// One slot of the open-file table.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileSlot {
    pub used: bool,
    pub ino: InodeNo,
    pub flags: u32,
    pub rwoffset: u64,
    pub size: u64,
}

/// Cursor origins for [`FileSystem::seek`].
#[derive(Clone, Copy, Debug)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Metadata snapshot returned by [`FileSystem::stat`].
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub ino: InodeNo,
    pub size: u64,
    pub links: u32,
    pub mode: u32,
    pub version: u32,
    pub is_dir: bool,
}

/// One `readdir` result.
#[derive(Clone, Debug)]
pub struct DirEntryInfo {
    pub name: String,
    pub ino: InodeNo,
}

/// The mount context: the per-process superblock state plus every cache
/// and the device facade.
pub struct FileSystem {
    pub(crate) dev: DeviceQueue,
    pub(crate) sb: SuperblockCommon,
    pub(crate) apps: [AppSlot; MAX_APPS],
    pub(crate) asb: AppSuperblock,
    pub(crate) bd_table: Vec<layout::BgDescriptor>,
    pub(crate) bc: BufferCache,
    pub(crate) ictxc: IctxCache,
    pub(crate) bg_list: BgList,
    pub(crate) file_table: Vec<FileSlot>,
    pub(crate) params: MountParams,
    pub(crate) hub: Option<Arc<IpcHub>>,
    pub(crate) chan_id: u16,
    pub(crate) ctrl: Option<crate::ipc::ControlState>,
    pub(crate) perf: PerfStatIpc,
    pub(crate) dirty_policy: FlushMode,
    /// Data-block allocation cursor for primary roles.
    pub(crate) cur_bg: u32,
    pub(crate) mounted: bool,
}

impl FileSystem {
    pub(crate) fn is_primary(&self) -> bool {
        self.params.role.is_primary()
    }

    pub(crate) fn is_dataplane_model(&self) -> bool {
        self.params.role.is_dataplane_model()
    }

    pub fn root_ino(&self) -> InodeNo {
        self.sb.sb_root_ino
    }

    pub fn free_blocks(&self) -> u64 {
        self.sb.sb_free_blocks
    }

    pub fn free_inodes(&self) -> u32 {
        self.sb.sb_free_inodes
    }

    /// Splits `path` into its parent directory inode and final component.
    fn resolve_parent<'p>(&mut self, path: &'p str) -> IoResult<(InodeNo, &'p str)> {
        let path = path.strip_prefix('/').ok_or(FsError::Invalid(
            "only absolute paths are supported",
        ))?;
        if path.is_empty() {
            return Err(FsError::Invalid("path has no final component"));
        }

        let mut dir_ino = ROOT_INO;
        let mut components = path.split('/').peekable();
        while let Some(comp) = components.next() {
            if comp.is_empty() || comp == "." || comp == ".." {
                return Err(FsError::Invalid("bad path component"));
            }
            if components.peek().is_none() {
                return Ok((dir_ino, comp));
            }
            let entry = self.lookup(dir_ino, comp)?;
            dir_ino = entry.ino;
        }
        unreachable!()
    }

    /// Resolves `path` to an inode number, walking from the root.
    pub fn path_lookup(&mut self, path: &str) -> IoResult<InodeNo> {
        if path == "/" {
            return Ok(ROOT_INO);
        }
        let (parent, name) = self.resolve_parent(path)?;
        Ok(self.lookup(parent, name)?.ino)
    }

    /// Creates a regular file. Returns its inode number.
    pub fn create_file(&mut self, path: &str, mode: u32) -> IoResult<InodeNo> {
        let (parent, name) = self.resolve_parent(path)?;
        if self.lookup(parent, name).is_ok() {
            return Err(FsError::Exists);
        }
        let ino = self.create_inode(INODE_TYPE_FILE, mode)?;
        self.link_ino(parent, name, ino)?;
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)?;
        Ok(ino)
    }

    /// Creates a directory with its hash index.
    pub fn mkdir(&mut self, path: &str, mode: u32) -> IoResult<InodeNo> {
        let (parent, name) = self.resolve_parent(path)?;
        if self.lookup(parent, name).is_ok() {
            return Err(FsError::Exists);
        }
        let ino = self.create_inode(INODE_TYPE_DIRECTORY, mode)?;
        let ictx = self.read_inode(ino)?;
        self.create_bptree(ictx)?;
        self.release_inode(ictx, true)?;
        self.link_ino(parent, name, ino)?;
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)?;
        Ok(ino)
    }

    /// Adds another directory entry for an existing file.
    pub fn hardlink(&mut self, src: &str, dst: &str) -> IoResult<()> {
        let ino = self.path_lookup(src)?;
        let ictx = self.read_inode(ino)?;
        let is_dir = self.inode(ictx).i_type == INODE_TYPE_DIRECTORY;
        self.release_inode(ictx, false)?;
        if is_dir {
            return Err(FsError::Invalid("hard links to directories are not allowed"));
        }

        let (parent, name) = self.resolve_parent(dst)?;
        if self.lookup(parent, name).is_ok() {
            return Err(FsError::Exists);
        }
        self.link_ino(parent, name, ino)?;
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)
    }

    /// Removes a file name; drops the inode once its link count is zero.
    pub fn unlink(&mut self, path: &str) -> IoResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let target = self.lookup(parent, name)?;

        let ictx = self.read_inode(target.ino)?;
        if self.inode(ictx).i_type == INODE_TYPE_DIRECTORY {
            self.release_inode(ictx, false)?;
            return Err(FsError::Invalid("unlink of a directory; use rmdir"));
        }
        self.release_inode(ictx, false)?;

        let ino = self.rm_direntry(parent, name)?;
        let ictx = self.read_inode(ino)?;
        if self.inode(ictx).i_links_count == 0 {
            self.free_inode_size(ictx, 0)?;
            self.relocate_delete_inode(ictx)?;
        } else {
            self.release_inode(ictx, true)?;
        }
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)
    }

    /// Removes an empty directory and its hash index.
    pub fn rmdir(&mut self, path: &str) -> IoResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let target = self.lookup(parent, name)?;

        let ictx = self.read_inode(target.ino)?;
        let inode = *self.inode(ictx);
        if inode.i_type != INODE_TYPE_DIRECTORY {
            self.release_inode(ictx, false)?;
            return Err(FsError::Invalid("rmdir of a non-directory"));
        }
        self.release_inode(ictx, false)?;

        if !self.dir_is_empty(target.ino)? {
            return Err(FsError::Invalid("directory not empty"));
        }

        self.rm_direntry(parent, name)?;

        // Drop the hash index inode first, then the directory itself.
        if inode.i_bpino != 0 {
            let bp_ictx = self.read_inode(inode.i_bpino)?;
            self.free_inode_size(bp_ictx, 0)?;
            self.relocate_delete_inode(bp_ictx)?;
        }
        let ictx = self.read_inode(target.ino)?;
        self.free_inode_size(ictx, 0)?;
        self.relocate_delete_inode(ictx)?;

        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)
    }

    /// Renames `old` to `new`, replacing a regular file at `new` if one
    /// exists.
    pub fn rename(&mut self, old: &str, new: &str) -> IoResult<()> {
        let ino = self.path_lookup(old)?;
        let (new_parent, new_name) = self.resolve_parent(new)?;

        if let Ok(existing) = self.lookup(new_parent, new_name) {
            if existing.ino == ino {
                return Ok(());
            }
            self.unlink(new)?;
        }

        self.link_ino(new_parent, new_name, ino)?;
        let (old_parent, old_name) = self.resolve_parent(old)?;
        self.rm_direntry(old_parent, old_name)?;
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)
    }

    /// Preallocates clusters so the file covers `size` bytes. Shrinking
    /// is left to [`FileSystem::truncate`].
    pub fn fallocate(&mut self, path: &str, size: u64) -> IoResult<()> {
        if size > layout::MAX_FILE_SIZE {
            return Err(FsError::Invalid("size beyond the maximum file size"));
        }
        let ino = self.path_lookup(path)?;
        let ictx = self.read_inode(ino)?;
        if self.inode(ictx).i_type != INODE_TYPE_FILE {
            self.release_inode(ictx, false)?;
            return Err(FsError::Invalid("fallocate of a non-file"));
        }
        if size <= self.inode(ictx).i_size {
            self.release_inode(ictx, false)?;
            return Ok(());
        }

        let blocks = layout::size_to_blocks(size);
        for lblk in 0..blocks {
            if let Err(err) = self.get_block(ictx, lblk as u32, true) {
                self.release_inode(ictx, true)?;
                return Err(err);
            }
        }
        self.inode_mut(ictx).i_size = size;
        self.release_inode(ictx, true)?;
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)
    }

    /// Truncates a regular file to `size` bytes. Truncation to the current
    /// size is a no-op.
    pub fn truncate(&mut self, path: &str, size: u64) -> IoResult<()> {
        let ino = self.path_lookup(path)?;
        let ictx = self.read_inode(ino)?;
        if self.inode(ictx).i_type != INODE_TYPE_FILE {
            self.release_inode(ictx, false)?;
            return Err(FsError::Invalid("truncate of a non-file"));
        }
        if self.inode(ictx).i_size == size {
            self.release_inode(ictx, false)?;
            return Ok(());
        }

        self.free_inode_size(ictx, size)?;
        self.inode_mut(ictx).i_size = size;
        self.release_inode(ictx, true)?;
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)
    }

    pub fn stat(&mut self, path: &str) -> IoResult<Stat> {
        let ino = self.path_lookup(path)?;
        let ictx = self.read_inode(ino)?;
        let inode = *self.inode(ictx);
        self.release_inode(ictx, false)?;
        Ok(Stat {
            ino,
            size: inode.i_size,
            links: inode.i_links_count,
            mode: inode.i_mode,
            version: inode.i_version,
            is_dir: inode.i_type == INODE_TYPE_DIRECTORY,
        })
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> IoResult<()> {
        let ino = self.path_lookup(path)?;
        let ictx = self.read_inode(ino)?;
        self.inode_mut(ictx).i_mode = mode & 0o7777;
        self.release_inode(ictx, true)?;
        let policy = self.dirty_policy;
        self.check_flush_dirty(policy)
    }

    /// Lists the used entries of a directory.
    pub fn readdir_path(&mut self, path: &str) -> IoResult<Vec<DirEntryInfo>> {
        let ino = self.path_lookup(path)?;
        self.readdir(ino)
    }

    /// Opens a slot in the file table.
    pub fn open_file(&mut self, path: &str, flags: u32) -> IoResult<usize> {
        let ino = self.path_lookup(path)?;
        let ictx = self.read_inode(ino)?;
        let size = self.inode(ictx).i_size;
        self.release_inode(ictx, false)?;

        let fd = self
            .file_table
            .iter()
            .position(|slot| !slot.used)
            .ok_or(FsError::Invalid("file table full"))?;
        self.file_table[fd] = FileSlot {
            used: true,
            ino,
            flags,
            rwoffset: 0,
            size,
        };
        Ok(fd)
    }

    pub fn close_file(&mut self, fd: usize) -> CanFail {
        let slot = self
            .file_table
            .get_mut(fd)
            .filter(|slot| slot.used)
            .ok_or(FsError::Invalid("bad file descriptor"))?;
        slot.used = false;
        Ok(())
    }

    pub fn seek(&mut self, fd: usize, offset: u64, whence: Whence) -> IoResult<u64> {
        let slot = self
            .file_table
            .get_mut(fd)
            .filter(|slot| slot.used)
            .ok_or(FsError::Invalid("bad file descriptor"))?;
        slot.rwoffset = match whence {
            Whence::Set => offset,
            Whence::Cur => slot.rwoffset + offset,
            Whence::End => slot.size.saturating_sub(offset),
        };
        Ok(slot.rwoffset)
    }

    /// Forces every dirty buffer to the device.
    pub fn sync(&mut self) -> CanFail {
        self.check_flush_dirty(FlushMode::Force)
    }

    pub(crate) fn new_file_table() -> Vec<FileSlot> {
        vec![FileSlot::default(); MAX_OPEN_FILE]
    }

    pub(crate) fn log_counters(&self) {
        info!(
            target: "fs",
            "free inodes = {}, free blocks = {}, used blocks = {}",
            self.sb.sb_free_inodes, self.sb.sb_free_blocks, self.sb.sb_no_of_used_blocks
        );
    }
}
