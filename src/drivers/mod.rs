//! Standard API to interact with cluster devices, regardless of their
//! physical backing (kernel-bypass NVMe, generic block device, RAM or file
//! disk).
//!
//! The [`ClusterDevice`] trait specifies the capability set every backend
//! provides: synchronous 4 KiB-aligned cluster reads and writes plus a
//! flush barrier. Batched asynchronous submission is an optional
//! capability; callers that need it (the dirty-flush pipeline) degrade to a
//! synchronous write loop when it is absent.
//!
//! [`DeviceQueue`] wraps a backend with the submit/complete bookkeeping:
//! jobs are drawn from a fixed pool bounded by [`AIO_MAX_QDEPTH`], the
//! queue depth counter is incremented on submission and drained by polled
//! completion counts, and jobs still incomplete at a barrier are cancelled.

pub mod file;
pub mod ram;

use log::{error, warn};

use crate::err::{CanFail, FsError, IoResult};
use crate::fs::layout::CLUSTER_SIZE;

/// Maximum number of in-flight jobs per submission batch.
pub const AIO_MAX_QDEPTH: usize = 128;

pub trait ClusterDevice: Send {
    /// Device capacity, in clusters.
    fn total_clusters(&self) -> u64;

    /// Reads cluster `pno` into `buf` (exactly [`CLUSTER_SIZE`] bytes).
    fn read_cluster(&mut self, buf: &mut [u8], pno: u32) -> CanFail;

    /// Writes `buf` (exactly [`CLUSTER_SIZE`] bytes) to cluster `pno`.
    fn write_cluster(&mut self, buf: &[u8], pno: u32) -> CanFail;

    /// Durability barrier.
    fn flush(&mut self) -> CanFail;

    /// Whether this backend supports batched asynchronous submission.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Queues one cluster write; completion is observed through
    /// [`ClusterDevice::poll_completions`].
    fn submit_write(&mut self, pno: u32, data: &[u8]) -> CanFail {
        let _ = (pno, data);
        Err(FsError::Invalid("batched submission not supported"))
    }

    /// Harvests completions, returning how many jobs finished since the
    /// previous poll.
    fn poll_completions(&mut self) -> u32 {
        0
    }
}

/// One entry of the I/O job pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoJob {
    pub offset: u64,
    pub bytes: usize,
    pub ret: usize,
    pub complete: bool,
    pub cancelled: bool,
}

/// A cluster device plus its submission queue state.
pub struct DeviceQueue {
    dev: Box<dyn ClusterDevice>,
    jobs: Vec<IoJob>,
    queue_cur_count: u32,
}

impl DeviceQueue {
    pub fn new(dev: Box<dyn ClusterDevice>) -> Self {
        Self {
            dev,
            jobs: vec![IoJob::default(); AIO_MAX_QDEPTH],
            queue_cur_count: 0,
        }
    }

    pub fn total_clusters(&self) -> u64 {
        self.dev.total_clusters()
    }

    pub fn read_cluster(&mut self, buf: &mut [u8], pno: u32) -> CanFail {
        debug_assert_eq!(buf.len(), CLUSTER_SIZE);
        self.dev.read_cluster(buf, pno)
    }

    pub fn write_cluster(&mut self, buf: &[u8], pno: u32) -> CanFail {
        debug_assert_eq!(buf.len(), CLUSTER_SIZE);
        self.dev.write_cluster(buf, pno)
    }

    pub fn flush(&mut self) -> CanFail {
        self.dev.flush()
    }

    pub fn supports_batch(&self) -> bool {
        self.dev.supports_batch()
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_cur_count
    }

    /// Submits one batch of cluster writes. The batch size is bounded by
    /// the job pool; completions must be reaped with
    /// [`DeviceQueue::wait_completions`] before the next submission.
    pub fn submit_write_batch(&mut self, batch: &[(u32, &[u8])]) -> CanFail {
        assert!(batch.len() <= AIO_MAX_QDEPTH, "batch exceeds job pool");
        assert_eq!(self.queue_cur_count, 0, "previous batch still in flight");

        for (slot, (pno, data)) in self.jobs.iter_mut().zip(batch) {
            slot.offset = *pno as u64 * CLUSTER_SIZE as u64;
            slot.bytes = data.len();
            slot.ret = 0;
            slot.complete = false;
            slot.cancelled = false;
        }

        for (pno, data) in batch {
            self.dev.submit_write(*pno, data)?;
            self.queue_cur_count += 1;
        }
        Ok(())
    }

    /// Polls the backend until every submitted job has completed, then
    /// cancels whatever is left dangling. Short I/O surfaces as
    /// [`FsError::Io`] once the whole batch has drained.
    pub fn wait_completions(&mut self, submitted: usize) -> CanFail {
        let mut completed = 0usize;
        while self.queue_cur_count > 0 {
            let cc = self.dev.poll_completions();
            self.queue_cur_count = self.queue_cur_count.saturating_sub(cc);

            for _ in 0..cc {
                if let Some(job) = self.jobs[..submitted].iter_mut().find(|j| !j.complete) {
                    job.ret = job.bytes;
                    job.complete = true;
                    completed += 1;
                }
            }
            if cc == 0 {
                core::hint::spin_loop();
            }
        }

        self.cancel_incomplete(submitted);

        let short = self.jobs[..submitted]
            .iter()
            .filter(|j| j.complete && j.ret != j.bytes)
            .count();
        if short != 0 {
            error!(target: "dev", "{short} short write(s) in batch of {submitted}");
            return Err(FsError::Io(format!("{short} short writes")));
        }
        if completed != submitted {
            return Err(FsError::Io(format!(
                "batch incomplete: {completed}/{submitted}"
            )));
        }
        Ok(())
    }

    fn cancel_incomplete(&mut self, submitted: usize) {
        for job in self.jobs[..submitted].iter_mut().filter(|j| !j.complete) {
            job.cancelled = true;
            warn!(target: "dev", "cancelled incomplete job at offset {}", job.offset);
        }
    }
}

/// Validates that a device is large enough to hold at least one block
/// group of the requested geometry.
pub fn check_capacity(dev: &dyn ClusterDevice, clusters_per_bg: u32) -> IoResult<u64> {
    let clusters = dev.total_clusters();
    if clusters < clusters_per_bg as u64 {
        return Err(FsError::Invalid("device smaller than one block group"));
    }
    Ok(clusters)
}
