//! Dirty-flush pipeline.
//!
//! Batches dirty buffers into asynchronous write bursts of at most
//! [`AIO_MAX_QDEPTH`] clusters. Buffers drain in insertion order from the
//! head of the `DIRTY` list into `FLUSHING`, whose membership blocks
//! mutation until the batch has completed; completed buffers return to the
//! head of `CLEAN`. A device flush closes every pipeline run, and a run
//! with nothing dirty issues no I/O at all.

use log::trace;

use crate::drivers::AIO_MAX_QDEPTH;
use crate::err::IoResult;
use crate::fs::buffer::{BufList, InsertPos};
use crate::fs::{FileSystem, ProcessRole};

/// Dirty buffers accumulated before a delayed flush kicks in.
pub const FLUSH_DIRTY_THRESHOLD: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush only once the dirty count crosses the threshold.
    Delay,
    /// Flush everything now.
    Force,
}

impl FileSystem {
    /// Flushes dirty buffers according to `mode`. The control plane of a
    /// multi-process deployment always forces: it mediates container
    /// boundaries and must not sit on dirty group metadata.
    pub(crate) fn check_flush_dirty(&mut self, mode: FlushMode) -> IoResult<()> {
        let mode = if self.params.role == ProcessRole::Control {
            FlushMode::Force
        } else {
            mode
        };

        let dirty_count = self.bc.list_count(BufList::Dirty);
        if mode == FlushMode::Delay && dirty_count < FLUSH_DIRTY_THRESHOLD {
            return Ok(());
        }
        if dirty_count == 0 {
            return Ok(());
        }

        trace!(target: "flush", "flushing {dirty_count} dirty buffers");

        while self.bc.list_count(BufList::Dirty) > 0 {
            let mut batch = Vec::with_capacity(AIO_MAX_QDEPTH);
            while batch.len() < AIO_MAX_QDEPTH {
                let Some(idx) = self.bc.pop_head(BufList::Dirty) else {
                    break;
                };
                assert!(self.bc.entry(idx).dirty, "clean buffer on the dirty list");
                self.bc.push_entry(BufList::Flushing, idx, InsertPos::Tail);
                batch.push(idx);
            }
            self.sync_dirty_batch(&batch)?;
        }

        self.dev.flush()
    }

    /// Writes one batch out of `FLUSHING` and retires it to `CLEAN`.
    fn sync_dirty_batch(&mut self, batch: &[usize]) -> IoResult<()> {
        if self.dev.supports_batch() {
            let jobs: Vec<(u32, &[u8])> = batch
                .iter()
                .map(|&idx| {
                    let entry = self.bc.entry(idx);
                    (entry.pno, &entry.buf.0[..])
                })
                .collect();
            self.dev.submit_write_batch(&jobs)?;
            self.dev.wait_completions(jobs.len())?;
        } else {
            for &idx in batch {
                let pno = self.bc.entry(idx).pno;
                self.dev.write_cluster(&self.bc.entry(idx).buf.0, pno)?;
            }
        }

        for &idx in batch {
            self.remove_bhs_in_bc(idx);
            let entry = self.bc.entry_mut(idx);
            assert!(entry.dirty);
            entry.dirty = false;
            self.bc.move_to(idx, BufList::Clean, InsertPos::Head);
        }
        Ok(())
    }
}
