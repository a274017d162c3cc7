//! RAM-backed cluster device.
//!
//! The backing store is shared behind a lock so several process contexts
//! (control plane plus data planes in tests) can mount the same "device".
//! Batched submission is supported: writes land in the store immediately
//! and completions are reported through the polled counter, which is
//! per-handle state.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;
use std::sync::Arc;

use crate::drivers::ClusterDevice;
use crate::err::{CanFail, FsError};
use crate::fs::layout::CLUSTER_SIZE;

pub struct RamDisk {
    store: Arc<RwLock<Vec<u8>>>,
    writes: Arc<AtomicU64>,
    pending: u32,
}

impl RamDisk {
    /// Creates a zero-filled RAM disk of `clusters` clusters.
    pub fn new(clusters: u64) -> Self {
        Self {
            store: Arc::new(RwLock::new(vec![0u8; clusters as usize * CLUSTER_SIZE])),
            writes: Arc::new(AtomicU64::new(0)),
            pending: 0,
        }
    }

    /// Another handle on the same backing store, with its own submission
    /// state. This is how a second process context opens the device.
    pub fn open_shared(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            writes: Arc::clone(&self.writes),
            pending: 0,
        }
    }

    /// Total cluster writes across every handle.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_bounds(&self, pno: u32) -> CanFail {
        if (pno as u64) < self.total_clusters() {
            Ok(())
        } else {
            Err(FsError::Io(format!("cluster {pno} out of range")))
        }
    }

    fn byte_range(pno: u32) -> core::ops::Range<usize> {
        let start = pno as usize * CLUSTER_SIZE;
        start..start + CLUSTER_SIZE
    }
}

impl ClusterDevice for RamDisk {
    fn total_clusters(&self) -> u64 {
        (self.store.read().len() / CLUSTER_SIZE) as u64
    }

    fn read_cluster(&mut self, buf: &mut [u8], pno: u32) -> CanFail {
        self.check_bounds(pno)?;
        buf.copy_from_slice(&self.store.read()[Self::byte_range(pno)]);
        Ok(())
    }

    fn write_cluster(&mut self, buf: &[u8], pno: u32) -> CanFail {
        self.check_bounds(pno)?;
        self.store.write()[Self::byte_range(pno)].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&mut self) -> CanFail {
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn submit_write(&mut self, pno: u32, data: &[u8]) -> CanFail {
        self.write_cluster(data, pno)?;
        self.pending += 1;
        Ok(())
    }

    fn poll_completions(&mut self) -> u32 {
        core::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_handles_see_each_others_writes() {
        let mut a = RamDisk::new(8);
        let mut b = a.open_shared();

        let block = [0x5Au8; CLUSTER_SIZE];
        a.write_cluster(&block, 3).unwrap();

        let mut read = [0u8; CLUSTER_SIZE];
        b.read_cluster(&mut read, 3).unwrap();
        assert_eq!(read, block);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let mut disk = RamDisk::new(4);
        let mut buf = [0u8; CLUSTER_SIZE];
        assert!(disk.read_cluster(&mut buf, 4).is_err());
        assert!(disk.write_cluster(&buf, 17).is_err());
    }

    #[test]
    fn batched_writes_complete_on_poll() {
        let mut disk = RamDisk::new(4);
        let block = [1u8; CLUSTER_SIZE];
        disk.submit_write(0, &block).unwrap();
        disk.submit_write(1, &block).unwrap();
        assert_eq!(disk.poll_completions(), 2);
        assert_eq!(disk.poll_completions(), 0);
    }
}
