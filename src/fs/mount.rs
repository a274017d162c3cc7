//! Format, mount and unmount.
//!
//! Mount bootstraps the per-process engine: it opens the device facade,
//! sizes the buffer cache for the role, reads (or copies over IPC) the
//! superblock, loads every group descriptor into the pinned table and
//! builds the list of groups this process may allocate from. The first
//! mount after a format also creates the root directory's hash index.
//!
//! Unmount force-flushes, writes the superblock back (control plane and
//! standalone), unregisters data planes while keeping their containers,
//! and tears the caches down.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::{bytes_of, pod_read_unaligned};
use log::{info, warn};

use crate::drivers::{check_capacity, ClusterDevice, DeviceQueue};
use crate::err::{CanFail, FsError, IoResult};
use crate::fs::block_grp::BgList;
use crate::fs::buffer::{BufferCache, ClusterBuf};
use crate::fs::flush::FlushMode;
use crate::fs::ictx::IctxCache;
use crate::fs::layout::{
    bg_count_for, AppSlot, AppSuperblock, BgDescriptor, DiskSuperblock, FormatParams, RawInode,
    SuperblockCommon, BD_OFFSET, DBITMAP_OFFSET, IBITMAP_OFFSET,
    INODE_ENTRY_NUM, INODE_ENTRY_SIZE, INODE_TYPE_DIRECTORY, MAX_APPS, ROOT_INO,
    SB_SIGNATURE, SECTORS_PER_CLUSTER, SUPERBLOCK_CLUSTER,
};
use crate::fs::{bitmap, FileSystem, MountParams, ProcessRole, CONTAINER_PREALLOCATION_COUNT};
use crate::ipc::{ContainerAllocKind, ControlState, IpcHub, IpcKind, PerfStatIpc};

/// Writes a fresh filesystem onto the device: superblock, group
/// descriptors, bitmaps with the metadata clusters pre-set, zeroed inode
/// tables, and the root directory inode.
pub fn format(dev: &mut dyn ClusterDevice, params: &FormatParams) -> CanFail {
    params.validate()?;
    let clusters = check_capacity(dev, params.clusters_per_bg)?;
    let bg_num = bg_count_for(clusters, params.clusters_per_bg);

    let mut buf = ClusterBuf::new();
    let mut free_inodes = 0u32;
    let mut free_blocks = 0u64;

    for bg_id in 0..bg_num {
        let mut bd = params.descriptor(bg_id);
        if bg_id == 0 {
            // The reserved inode numbers plus the root inode.
            bd.bd_free_inodes -= ROOT_INO + 1;
        }
        free_inodes += bd.bd_free_inodes;
        free_blocks += bd.bd_free_blocks as u64;

        buf.fill(0);
        buf[..core::mem::size_of::<BgDescriptor>()].copy_from_slice(bytes_of(&bd));
        dev.write_cluster(&buf.0, bd.bd_bg_start + BD_OFFSET)?;

        buf.fill(0);
        for nr in 0..bd.meta_clusters() {
            bitmap::set_bit(&mut buf.0, nr);
        }
        dev.write_cluster(&buf.0, bd.bd_dbitmap_start)?;

        buf.fill(0);
        if bg_id == 0 {
            for nr in 0..=ROOT_INO {
                bitmap::set_bit(&mut buf.0, nr);
            }
        }
        dev.write_cluster(&buf.0, bd.bd_ibitmap_start)?;

        buf.fill(0);
        if bg_id == 0 {
            let root = RawInode {
                i_ino: ROOT_INO,
                i_type: INODE_TYPE_DIRECTORY,
                i_mode: 0o755,
                i_links_count: 1,
                i_version: 1,
                ..Default::default()
            };
            let slot = (ROOT_INO % INODE_ENTRY_NUM) as usize;
            buf[slot * INODE_ENTRY_SIZE..(slot + 1) * INODE_ENTRY_SIZE]
                .copy_from_slice(bytes_of(&root));
            dev.write_cluster(&buf.0, bd.bd_itable_start)?;
            buf.fill(0);
            for itable in 1..bd.bd_itable_size {
                dev.write_cluster(&buf.0, bd.bd_itable_start + itable)?;
            }
        } else {
            for itable in 0..bd.bd_itable_size {
                dev.write_cluster(&buf.0, bd.bd_itable_start + itable)?;
            }
        }
    }

    let total_blocks = bg_num as u64 * params.clusters_per_bg as u64;
    let disk_sb = DiskSuperblock {
        common: SuperblockCommon {
            sb_signature: SB_SIGNATURE,
            sb_root_ino: ROOT_INO,
            sb_no_of_sectors: total_blocks * SECTORS_PER_CLUSTER,
            sb_no_of_blocks: total_blocks,
            sb_no_of_used_blocks: total_blocks - free_blocks,
            sb_free_blocks: free_blocks,
            sb_last_update: unix_seconds(),
            sb_free_inodes: free_inodes,
            sb_bg_num: bg_num,
            sb_no_of_inodes_per_bg: params.inodes_per_bg,
            sb_no_of_blocks_per_bg: params.clusters_per_bg,
            sb_last_allocated_ino: ROOT_INO + 1,
            sb_mount_cnt: 0,
            sb_umount: 1,
            sb_reserved: 0,
        },
        apps: [AppSlot {
            name: [0; crate::fs::layout::APP_NAME_SIZE],
            root_bg: 0,
            registered: 0,
        }; MAX_APPS],
    };

    buf.fill(0);
    buf[..core::mem::size_of::<DiskSuperblock>()].copy_from_slice(bytes_of(&disk_sb));
    dev.write_cluster(&buf.0, SUPERBLOCK_CLUSTER)?;
    dev.flush()?;

    info!(
        target: "mount",
        "formatted {bg_num} groups of {} clusters, {free_inodes} inodes free",
        params.clusters_per_bg
    );
    Ok(())
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FileSystem {
    /// Mounts the device in the role picked by `params`. Multi-process
    /// roles need the shared channel fabric.
    pub fn mount(
        dev: Box<dyn ClusterDevice>,
        params: MountParams,
        hub: Option<Arc<IpcHub>>,
    ) -> IoResult<FileSystem> {
        if params.role.is_dataplane_model() && hub.is_none() {
            return Err(FsError::Ipc("multi-process roles need a channel fabric"));
        }

        let mut fs = FileSystem {
            dev: DeviceQueue::new(dev),
            sb: SuperblockCommon::default(),
            apps: [AppSlot {
                name: [0; crate::fs::layout::APP_NAME_SIZE],
                root_bg: 0,
                registered: 0,
            }; MAX_APPS],
            asb: AppSuperblock::default(),
            bd_table: Vec::new(),
            bc: BufferCache::new(params.buffer_clusters()),
            ictxc: IctxCache::new(),
            bg_list: BgList::new(),
            file_table: Self::new_file_table(),
            params,
            hub,
            chan_id: 0,
            ctrl: None,
            perf: PerfStatIpc::new(),
            dirty_policy: FlushMode::Delay,
            cur_bg: 0,
            mounted: false,
        };

        if fs.is_primary() {
            fs.scan_superblock()?;
        } else {
            let hub = fs.hub.clone().expect("fabric checked above");
            fs.chan_id = hub
                .claim_channel()
                .ok_or(FsError::Ipc("no free channel"))?;
            info!(target: "mount", "claimed channel {}", fs.chan_id);

            let (app_id, root_bg) = fs.register_app()?;
            let (common, asb) = fs.superblock_copy()?;
            fs.sb = common;
            fs.asb = asb;
            assert_eq!(fs.asb.asb_core_id, app_id);
            assert_ne!(root_bg, 0, "data plane granted block group 0");
            info!(
                target: "mount",
                "registered as app {app_id}, root container {root_bg}, {} free inodes globally",
                fs.sb.sb_free_inodes
            );
        }

        fs.load_bd_table()?;

        if fs.params.role == ProcessRole::Control {
            let owners: Vec<u32> = fs.bd_table.iter().map(|bd| bd.bd_owner).collect();
            fs.ctrl = Some(ControlState::new(&owners));
        }

        match fs.params.role {
            ProcessRole::Standalone => {
                for bg_id in 0..fs.sb.sb_bg_num {
                    fs.add_bg(bg_id)?;
                }
            }
            ProcessRole::Control => {
                fs.add_bg(fs.asb.asb_root_bg_id)?;
            }
            ProcessRole::Data => {
                // Replay the containers still reserved from an earlier
                // run, then optionally pad up to the preallocation target.
                let mut bg_count = 0;
                loop {
                    let bg_id = fs.alloc_container(ContainerAllocKind::Allocated)?;
                    if bg_id == 0 {
                        break;
                    }
                    fs.add_bg(bg_id)?;
                    bg_count += 1;
                }
                if fs.params.preallocation {
                    while bg_count < CONTAINER_PREALLOCATION_COUNT {
                        let bg_id = fs.alloc_container(ContainerAllocKind::New)?;
                        if bg_id == 0 {
                            break;
                        }
                        fs.add_bg(bg_id)?;
                        bg_count += 1;
                    }
                }
            }
        }

        if fs.is_primary() {
            if fs.sb.sb_umount == 0 {
                // Crash: the global counters were never written back.
                // Rebuild them from the flushed group descriptors.
                warn!(target: "mount", "unclean shutdown detected, rebuilding counters");
                fs.sb.sb_free_inodes =
                    fs.bd_table.iter().map(|bd| bd.bd_free_inodes).sum();
                fs.sb.sb_free_blocks = fs
                    .bd_table
                    .iter()
                    .map(|bd| bd.bd_free_blocks as u64)
                    .sum();
                fs.sb.sb_no_of_used_blocks = fs.sb.sb_no_of_blocks - fs.sb.sb_free_blocks;
                fs.cur_bg = 0;
            } else {
                fs.sb.sb_umount = 0;
            }

            // First mount after format: the root directory gets its hash
            // index.
            if fs.sb.sb_mount_cnt == 0 {
                let root_ictx = fs.read_inode(fs.sb.sb_root_ino)?;
                fs.create_bptree(root_ictx)?;
                fs.release_inode(root_ictx, true)?;
                fs.check_flush_dirty(FlushMode::Force)?;
            }
            fs.sb.sb_mount_cnt += 1;

            // Live marker: with `sb_umount` cleared on disk, a crash is
            // detectable at the next mount.
            fs.write_superblock()?;
        }

        fs.mounted = true;

        if fs.params.role == ProcessRole::Data {
            fs.health_check()?;
        }

        info!(target: "mount", "mounted as {:?}", fs.params.role);
        fs.log_counters();
        Ok(fs)
    }

    /// Persists the superblock (and the application table) to cluster 0,
    /// followed by a device flush.
    fn write_superblock(&mut self) -> CanFail {
        self.sb.sb_last_update = unix_seconds();
        let disk_sb = DiskSuperblock {
            common: self.sb,
            apps: self.apps,
        };
        let mut buf = ClusterBuf::new();
        buf[..core::mem::size_of::<DiskSuperblock>()].copy_from_slice(bytes_of(&disk_sb));
        self.dev.write_cluster(&buf.0, SUPERBLOCK_CLUSTER)?;
        self.dev.flush()
    }

    /// Cross-checks the global counters against the sum of the per-group
    /// descriptors, through the cache.
    pub fn verify_counters(&mut self) -> IoResult<bool> {
        let mut free_inodes = 0u32;
        let mut free_blocks = 0u64;
        for bg_id in 0..self.sb.sb_bg_num {
            let bh = self.get_bh(
                None,
                crate::fs::layout::BD_INO,
                bg_id,
                crate::fs::buffer::BhMode::Read,
                crate::fs::buffer::BufType::Meta,
            )?;
            let bd = self.bd_from_bh(bh);
            self.release_bh(bh, crate::fs::buffer::InsertPos::Head, false);
            free_inodes += bd.bd_free_inodes;
            free_blocks += bd.bd_free_blocks as u64;
        }
        Ok(free_inodes == self.sb.sb_free_inodes && free_blocks == self.sb.sb_free_blocks)
    }

    fn scan_superblock(&mut self) -> CanFail {
        let mut buf = ClusterBuf::new();
        self.dev.read_cluster(&mut buf.0, SUPERBLOCK_CLUSTER)?;

        let disk_sb: DiskSuperblock =
            pod_read_unaligned(&buf[..core::mem::size_of::<DiskSuperblock>()]);
        if disk_sb.common.sb_signature != SB_SIGNATURE {
            return Err(FsError::Invalid("superblock signature mismatch"));
        }
        self.sb = disk_sb.common;
        self.apps = disk_sb.apps;

        info!(
            target: "mount",
            "superblock: {} blocks in {} groups, root ino {}",
            self.sb.sb_no_of_blocks, self.sb.sb_bg_num, self.sb.sb_root_ino
        );
        Ok(())
    }

    /// Loads every group descriptor into the pinned in-memory table.
    fn load_bd_table(&mut self) -> CanFail {
        let mut buf = ClusterBuf::new();
        self.bd_table = Vec::with_capacity(self.sb.sb_bg_num as usize);
        for bg_id in 0..self.sb.sb_bg_num {
            let cno = bg_id * self.sb.sb_no_of_blocks_per_bg + BD_OFFSET;
            self.dev.read_cluster(&mut buf.0, cno)?;
            let bd: BgDescriptor =
                pod_read_unaligned(&buf[..core::mem::size_of::<BgDescriptor>()]);
            if bd.bd_id != bg_id {
                return Err(FsError::Fatal("descriptor id mismatch while loading groups"));
            }
            debug_assert_eq!(bd.bd_dbitmap_start, bd.bd_bg_start + DBITMAP_OFFSET);
            debug_assert_eq!(bd.bd_ibitmap_start, bd.bd_bg_start + IBITMAP_OFFSET);
            self.bd_table.push(bd);
        }
        Ok(())
    }

    /// Unmounts: flushes everything, persists the superblock (primary),
    /// hands the channel back (data plane) and drops the caches.
    pub fn umount(&mut self) -> CanFail {
        if !self.mounted {
            return Err(FsError::Invalid("not mounted"));
        }

        self.check_flush_dirty(FlushMode::Force)?;

        if self.is_primary() {
            self.sb.sb_umount = 1;
            self.write_superblock()?;
        } else {
            self.unregister_app(true)?;
            if let Some(hub) = &self.hub {
                hub.release_channel(self.chan_id);
            }
            info!(target: "mount", "released channel {}", self.chan_id);
        }

        if self.is_dataplane_model() {
            for kind in [
                IpcKind::ContainerAllocReq,
                IpcKind::ContainerReleaseReq,
                IpcKind::BufferAllocReq,
                IpcKind::BufferFreeReq,
            ] {
                if self.perf.requests(kind) > 0 {
                    info!(
                        target: "ipc",
                        "{kind:?} latency = {:.2} us over {} requests",
                        self.perf.average_us(kind),
                        self.perf.requests(kind)
                    );
                }
            }
        }

        self.bd_table.clear();
        self.file_table.clear();
        self.mounted = false;
        info!(target: "mount", "unmounted");
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if self.mounted {
            warn!(target: "mount", "dropped while mounted; metadata may be unflushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram::RamDisk;
    use crate::err::FsError;
    use crate::fs::buffer::BufList;
    use crate::fs::layout::CLUSTER_SIZE;

    fn small_geometry() -> FormatParams {
        FormatParams {
            clusters_per_bg: 256,
            inodes_per_bg: 64,
        }
    }

    fn test_params() -> MountParams {
        MountParams {
            buffer_clusters: Some(192),
            ..MountParams::standalone()
        }
    }

    fn fresh_fs(bgs: u64) -> (RamDisk, FileSystem) {
        let mut disk = RamDisk::new(bgs * 256);
        format(&mut disk, &small_geometry()).unwrap();
        let handle = disk.open_shared();
        let fs = FileSystem::mount(Box::new(handle), test_params(), None).unwrap();
        (disk, fs)
    }

    fn remount(disk: &RamDisk) -> FileSystem {
        FileSystem::mount(Box::new(disk.open_shared()), test_params(), None).unwrap()
    }

    #[test]
    fn bad_signature_is_rejected() {
        let disk = RamDisk::new(1024);
        let err = FileSystem::mount(Box::new(disk.open_shared()), test_params(), None);
        assert!(matches!(err, Err(FsError::Invalid(_))));
    }

    #[test]
    fn files_survive_a_remount() {
        let (disk, mut fs) = fresh_fs(4);
        for i in 0..10 {
            fs.create_file(&format!("/file{i}"), 0o644).unwrap();
        }
        assert!(fs.verify_counters().unwrap());
        fs.umount().unwrap();

        let mut fs = remount(&disk);
        let names: Vec<String> = fs
            .readdir_path("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names.len(), 10);
        for i in 0..10 {
            assert!(names.contains(&format!("file{i}")));
            let stat = fs.stat(&format!("/file{i}")).unwrap();
            assert_eq!(stat.links, 1);
            assert!(!stat.is_dir);
        }
        fs.umount().unwrap();
    }

    #[test]
    fn truncate_returns_blocks_to_the_pool() {
        let (_disk, mut fs) = fresh_fs(4);
        fs.create_file("/a", 0o644).unwrap();
        fs.fallocate("/a", 64 * 1024).unwrap();
        assert_eq!(fs.stat("/a").unwrap().size, 64 * 1024);

        let free_before = fs.free_blocks();
        fs.truncate("/a", CLUSTER_SIZE as u64).unwrap();
        assert_eq!(fs.stat("/a").unwrap().size, 4096);
        assert_eq!(fs.free_blocks(), free_before + 15);
        assert!(fs.verify_counters().unwrap());
        fs.umount().unwrap();
    }

    #[test]
    fn truncate_to_current_size_makes_nothing_dirty() {
        let (_disk, mut fs) = fresh_fs(4);
        fs.create_file("/a", 0o644).unwrap();
        fs.fallocate("/a", 8 * CLUSTER_SIZE as u64).unwrap();
        fs.sync().unwrap();
        assert_eq!(fs.bc.list_count(BufList::Dirty), 0);

        fs.truncate("/a", 8 * CLUSTER_SIZE as u64).unwrap();
        assert_eq!(fs.bc.list_count(BufList::Dirty), 0);
        fs.umount().unwrap();
    }

    #[test]
    fn force_flush_is_idempotent() {
        let (disk, mut fs) = fresh_fs(4);
        for i in 0..20 {
            fs.create_file(&format!("/f{i}"), 0o644).unwrap();
        }
        fs.sync().unwrap();
        assert_eq!(fs.bc.list_count(BufList::Dirty), 0);

        let writes_after_first = disk.write_count();
        fs.sync().unwrap();
        assert_eq!(disk.write_count(), writes_after_first);
        fs.umount().unwrap();
    }

    #[test]
    fn hard_links_share_the_inode() {
        let (_disk, mut fs) = fresh_fs(4);
        fs.create_file("/x", 0o644).unwrap();
        fs.hardlink("/x", "/y").unwrap();

        let x = fs.stat("/x").unwrap();
        let y = fs.stat("/y").unwrap();
        assert_eq!(x.ino, y.ino);
        assert_eq!(y.links, 2);

        fs.unlink("/x").unwrap();
        assert!(matches!(fs.stat("/x"), Err(FsError::NotFound)));
        let y = fs.stat("/y").unwrap();
        assert_eq!(y.links, 1);

        // The inode stays allocated until the last name goes away.
        fs.unlink("/y").unwrap();
        assert!(fs.verify_counters().unwrap());
        fs.umount().unwrap();
    }

    #[test]
    fn rename_replaces_and_moves() {
        let (_disk, mut fs) = fresh_fs(4);
        fs.mkdir("/dir", 0o755).unwrap();
        fs.create_file("/old", 0o644).unwrap();
        fs.create_file("/dir/existing", 0o644).unwrap();

        fs.rename("/old", "/dir/moved").unwrap();
        assert!(matches!(fs.stat("/old"), Err(FsError::NotFound)));
        assert_eq!(fs.stat("/dir/moved").unwrap().links, 1);

        fs.rename("/dir/moved", "/dir/existing").unwrap();
        assert_eq!(fs.readdir_path("/dir").unwrap().len(), 1);
        assert_eq!(fs.stat("/dir/existing").unwrap().links, 1);
        fs.umount().unwrap();
    }

    #[test]
    fn readdir_skips_deleted_entries() {
        let (_disk, mut fs) = fresh_fs(4);
        fs.mkdir("/d", 0o755).unwrap();
        for i in 0..8 {
            fs.create_file(&format!("/d/f{i}"), 0o644).unwrap();
        }
        for i in [1, 3, 5] {
            fs.unlink(&format!("/d/f{i}")).unwrap();
        }
        let names: Vec<String> = fs
            .readdir_path("/d")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names.len(), 5);
        assert!(!names.contains(&String::from("f3")));

        // Invalid slots are reused without growing the directory.
        let size_before = fs.stat("/d").unwrap().size;
        fs.create_file("/d/again", 0o644).unwrap();
        assert_eq!(fs.stat("/d").unwrap().size, size_before);
        assert_eq!(fs.readdir_path("/d").unwrap().len(), 6);
        fs.umount().unwrap();
    }

    #[test]
    fn rmdir_requires_an_empty_directory() {
        let (_disk, mut fs) = fresh_fs(4);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create_file("/d/f", 0o644).unwrap();
        assert!(fs.rmdir("/d").is_err());

        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.stat("/d"), Err(FsError::NotFound)));
        assert!(fs.verify_counters().unwrap());
        fs.umount().unwrap();
    }

    #[test]
    fn directory_index_scales_past_node_splits() {
        let (_disk, mut fs) = fresh_fs(8);
        fs.mkdir("/big", 0o755).unwrap();
        for i in 0..300 {
            fs.create_file(&format!("/big/entry-{i:04}"), 0o644).unwrap();
        }
        for i in (0..300).step_by(7) {
            let stat = fs.stat(&format!("/big/entry-{i:04}")).unwrap();
            assert_eq!(stat.links, 1);
        }
        assert_eq!(fs.readdir_path("/big").unwrap().len(), 300);

        for i in 0..300 {
            fs.unlink(&format!("/big/entry-{i:04}")).unwrap();
        }
        assert!(fs.readdir_path("/big").unwrap().is_empty());
        assert!(fs.verify_counters().unwrap());
        fs.umount().unwrap();
    }

    #[test]
    fn colliding_hashes_degrade_to_linear_scans() {
        let (_disk, mut fs) = fresh_fs(4);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create_file("/d/a", 0o644).unwrap();
        fs.create_file("/d/b", 0o644).unwrap();

        let dir_ino = fs.path_lookup("/d").unwrap();
        let ictx = fs.read_inode(dir_ino).unwrap();
        let bpino = fs.inode(ictx).i_bpino;
        fs.release_inode(ictx, false).unwrap();

        // Collision-free names report their exact entry offsets.
        assert_eq!(fs.get_dir_indexing(bpino, "a").unwrap(), Some(0));
        assert_eq!(fs.get_dir_indexing(bpino, "b").unwrap(), Some(1));

        // A second insertion under "a"'s key marks it collided: the index
        // now reports offset 0 and lookups fall back to the linear scan.
        fs.set_dir_indexing(bpino, "a", 7).unwrap();
        assert_eq!(fs.get_dir_indexing(bpino, "a").unwrap(), Some(0));
        assert_eq!(fs.stat("/d/a").unwrap().links, 1);
        assert_eq!(fs.stat("/d/b").unwrap().links, 1);

        // Removing one collided name keeps the other reachable.
        fs.unlink("/d/a").unwrap();
        assert!(matches!(fs.stat("/d/a"), Err(FsError::NotFound)));
        assert_eq!(fs.stat("/d/b").unwrap().links, 1);
        fs.umount().unwrap();
    }

    #[test]
    fn committed_metadata_survives_a_crash() {
        let (disk, mut fs) = fresh_fs(4);
        for i in 0..10 {
            fs.create_file(&format!("/f{i}"), 0o644).unwrap();
        }
        fs.sync().unwrap();
        // Crash: drop every in-memory structure without unmounting.
        drop(fs);

        let mut fs = remount(&disk);
        assert_eq!(fs.readdir_path("/").unwrap().len(), 10);
        assert!(fs.verify_counters().unwrap());
        fs.umount().unwrap();
    }

    #[test]
    fn standalone_spills_into_further_groups() {
        // One group holds 64 inodes; allocating past it must walk on to
        // the next group without any IPC in standalone mode.
        let (_disk, mut fs) = fresh_fs(4);
        for i in 0..100 {
            fs.create_file(&format!("/f{i}"), 0o644).unwrap();
        }
        assert!(fs.verify_counters().unwrap());
        assert_eq!(fs.readdir_path("/").unwrap().len(), 100);
        fs.umount().unwrap();
    }

    #[test]
    fn exhausting_every_inode_reports_no_space() {
        let (_disk, mut fs) = fresh_fs(1);
        // 64 inodes per group, minus the reserved range and the root
        // directory's index inode.
        let mut created = 0;
        let err = loop {
            match fs.create_file(&format!("/f{created}"), 0o644) {
                Ok(_) => created += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, FsError::NoSpace));
        assert!(created > 0);
        assert_eq!(fs.free_inodes(), 0);
        fs.umount().unwrap();
    }
}
