//! Flusher: the single agent moving bytes from writer ring buffers into the
//! active NV segment and durably advancing the Durable Epoch.
//!
//! Grounded on the segment roll-on-full pattern from the teacher's segment
//! writer, generalized from "one queue, one segment" to "N writer frames
//! feeding one shared NV segment pool, gated by epoch order" and driven by
//! the state machine in [`crate::state`].

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::control::ControlFile;
use crate::epoch::{is_after, Epoch, SharedEpochs, INVALID_EPOCH};
use crate::error::Result;
use crate::mds::{MdsCore, MdsEntry};
use crate::segment::SegmentPool;
use crate::state::AgentStateHandle;
use crate::writer::{WriterContext, FRAME_COUNT};

/// How far behind the current DE a frame's epoch must fall before its slot
/// is reclaimed for reuse, per the frame-reclaim rule.
const RECLAIM_LAG: u64 = 2;

pub struct Flusher {
    writers: Vec<Arc<WriterContext>>,
    pool: Arc<SegmentPool>,
    mds: Arc<Mutex<MdsCore>>,
    cf: Arc<Mutex<ControlFile>>,
    epochs: Arc<SharedEpochs>,
    state: Arc<AgentStateHandle>,
    /// Accumulates the DSID/offset span touched since the previous epoch,
    /// per writer, cleared once the MDS entry for an epoch is written.
    accum: Mutex<EpochAccumulator>,
}

#[derive(Default)]
struct EpochAccumulator {
    first_dsid: u64,
    first_offset: u64,
    last_dsid: u64,
    last_offset: u64,
    touched: bool,
}

impl EpochAccumulator {
    fn record(&mut self, dsid: u64, start_offset: u64, end_offset: u64) {
        if !self.touched {
            self.first_dsid = dsid;
            self.first_offset = start_offset;
            self.touched = true;
        }
        self.last_dsid = dsid;
        self.last_offset = end_offset;
    }

    fn peek(&self) -> Option<(u64, u64, u64, u64)> {
        if !self.touched {
            return None;
        }
        Some((self.first_dsid, self.first_offset, self.last_dsid, self.last_offset))
    }

    fn take(&mut self) -> Option<(u64, u64, u64, u64)> {
        let span = self.peek();
        self.touched = false;
        span
    }
}

impl Flusher {
    pub fn new(
        writers: Vec<Arc<WriterContext>>,
        pool: Arc<SegmentPool>,
        mds: Arc<Mutex<MdsCore>>,
        cf: Arc<Mutex<ControlFile>>,
        epochs: Arc<SharedEpochs>,
        state: Arc<AgentStateHandle>,
    ) -> Self {
        Self {
            writers,
            pool,
            mds,
            cf,
            epochs,
            state,
            accum: Mutex::new(EpochAccumulator::default()),
        }
    }

    /// Runs the main loop until the state machine transitions to `Stopped`.
    /// Intended to be the body of the dedicated flusher thread.
    pub fn run(&self) {
        self.state.mark_running();
        while self.state.poll() {
            if let Err(err) = self.tick() {
                log::error!("flusher tick failed: {err}");
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// One pass: drain frames up to SE, publish DE if fully drained,
    /// opportunistically copy NE bytes, and reclaim stale frames.
    fn tick(&self) -> Result<()> {
        let se = self.epochs.stable_epoch();
        let ne = self.epochs.next_epoch();

        let mut fully_drained = se != INVALID_EPOCH;
        for writer in &self.writers {
            let drained_to_se = self.drain_writer(writer, se, false)?;
            fully_drained &= drained_to_se;
            if is_after(ne, se) {
                // Opportunistic: copy NE bytes too, but they must not count
                // toward DE until SE catches up to them.
                let _ = self.drain_writer(writer, ne, true)?;
            }
        }

        if fully_drained && is_after(se, self.epochs.durable_epoch()) {
            let blocked = match self.accum.lock().unwrap().peek() {
                Some((first_dsid, _, last_dsid, _)) => self.pool.has_fsync_error_in_range(first_dsid, last_dsid),
                None => false,
            };
            if blocked {
                log::error!("durable epoch {se} blocked: a segment it touches has a sticky fsync error");
            } else {
                self.publish_durable_epoch(se)?;
            }
        }

        self.reclaim_stale_frames();
        Ok(())
    }

    /// Drains every frame of `writer` tagged with `target_epoch` (or, when
    /// `opportunistic`, with an epoch newer than what's already durable).
    /// Returns whether the writer has nothing left to drain at
    /// `target_epoch` or older.
    fn drain_writer(&self, writer: &Arc<WriterContext>, target_epoch: Epoch, opportunistic: bool) -> Result<bool> {
        let active = writer.active_frame_index();
        let mut all_caught_up = true;
        for offset in 0..FRAME_COUNT {
            let idx = (active + 1 + offset) % FRAME_COUNT;
            let snap = writer.frame_snapshot(idx);
            if snap.log_epoch == INVALID_EPOCH {
                continue;
            }
            let in_scope = if opportunistic {
                snap.log_epoch == target_epoch
            } else {
                !is_after(snap.log_epoch, target_epoch)
            };
            if !in_scope {
                continue;
            }
            if snap.head_offset < snap.tail_offset {
                self.copy_frame_bytes(writer, idx, snap.head_offset, snap.tail_offset)?;
            }
            if !opportunistic {
                // More bytes may still land on this frame if it's the
                // active one; only count it caught-up once fully drained.
                let fresh = writer.frame_snapshot(idx);
                if fresh.head_offset < fresh.tail_offset {
                    all_caught_up = false;
                }
            }
        }
        Ok(all_caught_up)
    }

    fn copy_frame_bytes(&self, writer: &Arc<WriterContext>, idx: usize, head: u64, tail: u64) -> Result<()> {
        let bytes = writer.copy_region(head, tail);
        let mut offset_in_bytes = 0usize;
        while offset_in_bytes < bytes.len() {
            let segment = self.pool.current_nv_segment()?;
            let written = segment.written_bytes.load(Ordering::Acquire);
            let capacity = self.pool.segment_size() - written;
            let chunk_len = (bytes.len() - offset_in_bytes).min(capacity as usize);
            if chunk_len == 0 {
                self.pool.advance_nv_segment()?;
                continue;
            }
            let dsid = segment.dsid.load(Ordering::Acquire);
            unsafe {
                let dst = segment.data_mut()?;
                dst[written as usize..written as usize + chunk_len]
                    .copy_from_slice(&bytes[offset_in_bytes..offset_in_bytes + chunk_len]);
                segment.flush_sync()?;
            }
            segment.written_bytes.fetch_add(chunk_len as u64, Ordering::Release);
            self.accum.lock().unwrap().record(dsid, written, written + chunk_len as u64);
            offset_in_bytes += chunk_len;
            if written as usize + chunk_len == self.pool.segment_size() as usize {
                self.pool.advance_nv_segment()?;
            }
        }
        writer.advance_frame_head(idx, tail);
        Ok(())
    }

    fn publish_durable_epoch(&self, se: Epoch) -> Result<()> {
        let span = self.accum.lock().unwrap().take();
        if let Some((first_dsid, first_offset, last_dsid, last_offset)) = span {
            let entry = MdsEntry {
                epoch: se,
                first_dsid,
                first_offset,
                last_dsid,
                last_offset,
                user_meta_0: 0,
                user_meta_1: 0,
            };
            let mut mds = self.mds.lock().unwrap();
            let paged_through = mds.write_epoch(se, entry)?;
            let mut cf = self.cf.lock().unwrap();
            if let Some(paged_epoch) = paged_through {
                cf.advance_paged_mds_epoch(paged_epoch)?;
            }
            cf.advance_durable_epoch(se)?;
        } else {
            // No bytes were written this epoch; DE still advances.
            let mut cf = self.cf.lock().unwrap();
            cf.advance_durable_epoch(se)?;
        }
        self.epochs.publish_durable_epoch(se);
        Ok(())
    }

    fn reclaim_stale_frames(&self) {
        let de = self.epochs.durable_epoch();
        if de < RECLAIM_LAG {
            return;
        }
        let threshold = de - RECLAIM_LAG;
        for writer in &self.writers {
            for idx in 0..FRAME_COUNT {
                let snap = writer.frame_snapshot(idx);
                if snap.log_epoch != INVALID_EPOCH
                    && !is_after(snap.log_epoch, threshold)
                    && snap.head_offset >= snap.tail_offset
                {
                    writer.reclaim_frame(idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitMode;
    use crate::control::CfConfigSnapshot;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> Flusher {
        let pool = Arc::new(SegmentPool::create(dir, 4096, 4).unwrap());
        pool.activate_first_segment().unwrap();
        let (mds, _) = MdsCore::init(dir, InitMode::CreateIfNotExists, 4096, 1, 16).unwrap();
        let cf = ControlFile::create(
            &dir.join("nvwal.cf"),
            &CfConfigSnapshot { segment_size: 4096, nv_quota: 4096 * 4, mds_page_size: 4096, writer_count: 1, mds_num_files: 1 },
        )
        .unwrap();
        let writers = vec![Arc::new(WriterContext::new(0, 65536))];
        let epochs = Arc::new(SharedEpochs::new(0, 1, 2));
        let state = Arc::new(AgentStateHandle::new());
        Flusher::new(writers, pool, Arc::new(std::sync::Mutex::new(mds)), Arc::new(std::sync::Mutex::new(cf)), epochs, state)
    }

    #[test]
    fn drains_frame_and_advances_durable_epoch() {
        let dir = tempdir().unwrap();
        let flusher = setup(dir.path());
        flusher.writers[0].reserve(128).unwrap().fill(0x55);
        flusher.writers[0].on_wal_write(128, 1, 0, 0).unwrap();

        flusher.tick().unwrap();
        assert_eq!(flusher.epochs.durable_epoch(), 1);

        let mut mds = flusher.mds.lock().unwrap();
        let entry = mds.read_epoch(1).unwrap();
        assert_eq!(entry.last_offset - entry.first_offset, 128);
    }

    #[test]
    fn empty_epoch_still_advances_de() {
        let dir = tempdir().unwrap();
        let flusher = setup(dir.path());
        flusher.tick().unwrap();
        assert_eq!(flusher.epochs.durable_epoch(), 1);
    }
}
