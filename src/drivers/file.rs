//! File-backed cluster device.
//!
//! Clusters map 1:1 onto 4 KiB extents of a regular file (or a block
//! device node) through positioned I/O. A short read or write is surfaced
//! to the caller as an I/O failure; the flush barrier maps to `fsync`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::drivers::ClusterDevice;
use crate::err::{CanFail, FsError, IoResult};
use crate::fs::layout::CLUSTER_SIZE;

pub struct FileDisk {
    file: File,
    clusters: u64,
}

impl FileDisk {
    /// Opens an existing image or device node.
    pub fn open<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let clusters = file.metadata()?.len() / CLUSTER_SIZE as u64;
        Ok(Self { file, clusters })
    }

    /// Creates (or truncates) an image of `clusters` clusters.
    pub fn create<P: AsRef<Path>>(path: P, clusters: u64) -> IoResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(clusters * CLUSTER_SIZE as u64)?;
        Ok(Self { file, clusters })
    }

    fn offset(pno: u32) -> u64 {
        pno as u64 * CLUSTER_SIZE as u64
    }
}

impl ClusterDevice for FileDisk {
    fn total_clusters(&self) -> u64 {
        self.clusters
    }

    fn read_cluster(&mut self, buf: &mut [u8], pno: u32) -> CanFail {
        if pno as u64 >= self.clusters {
            return Err(FsError::Io(format!("cluster {pno} out of range")));
        }
        let n = self.file.read_at(buf, Self::offset(pno))?;
        if n != CLUSTER_SIZE {
            return Err(FsError::Io(format!(
                "short read at cluster {pno}: {n}/{CLUSTER_SIZE}"
            )));
        }
        Ok(())
    }

    fn write_cluster(&mut self, buf: &[u8], pno: u32) -> CanFail {
        if pno as u64 >= self.clusters {
            return Err(FsError::Io(format!("cluster {pno} out of range")));
        }
        let n = self.file.write_at(buf, Self::offset(pno))?;
        if n != CLUSTER_SIZE {
            return Err(FsError::Io(format!(
                "short write at cluster {pno}: {n}/{CLUSTER_SIZE}"
            )));
        }
        Ok(())
    }

    fn flush(&mut self) -> CanFail {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clusters_round_trip_through_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut disk = FileDisk::create(&path, 16).unwrap();
        assert_eq!(disk.total_clusters(), 16);

        let block = [0xA5u8; CLUSTER_SIZE];
        disk.write_cluster(&block, 7).unwrap();
        disk.flush().unwrap();
        drop(disk);

        let mut reopened = FileDisk::open(&path).unwrap();
        let mut read = [0u8; CLUSTER_SIZE];
        reopened.read_cluster(&mut read, 7).unwrap();
        assert_eq!(read, block);
    }
}
