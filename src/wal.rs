//! Top-level instance API: `init`/`uninit`, writer registration, epoch
//! advance, and cursor open/close — the public surface every other module
//! exists to serve.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::{InitMode, NvWalConfig};
use crate::control::{CfConfigSnapshot, ControlFile};
use crate::cursor::LogCursor;
use crate::epoch::{increment, is_after, is_after_or_equal, Epoch, SharedEpochs, INVALID_EPOCH};
use crate::error::{Error, Result};
use crate::flusher::Flusher;
use crate::fsyncer::Fsyncer;
use crate::mds::MdsCore;
use crate::segment::SegmentPool;
use crate::state::AgentStateHandle;
use crate::writer::WriterContext;

const CF_FILE_NAME: &str = "nvwal.cf";

pub struct WriterHandle {
    pub seq_id: u64,
    ctx: Arc<WriterContext>,
}

impl WriterHandle {
    pub fn has_enough_space(&self, size: u64) -> bool {
        self.ctx.has_enough_space(size)
    }

    pub fn reserve(&self, size: usize) -> Result<&mut [u8]> {
        self.ctx.reserve(size)
    }

    pub fn on_wal_write(&self, size: u64, epoch: Epoch, user_meta_0: u64, user_meta_1: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.ctx.on_wal_write(size, epoch, user_meta_0, user_meta_1)
    }
}

pub struct NvWal {
    config: NvWalConfig,
    pool: Arc<SegmentPool>,
    mds: Arc<Mutex<MdsCore>>,
    cf: Arc<Mutex<ControlFile>>,
    epochs: Arc<SharedEpochs>,
    writers: Vec<Arc<WriterContext>>,
    flusher_state: Arc<AgentStateHandle>,
    fsyncer_state: Arc<AgentStateHandle>,
    flusher_thread: Option<JoinHandle<()>>,
    fsyncer_thread: Option<JoinHandle<()>>,
}

impl NvWal {
    pub fn init(config: NvWalConfig, mode: InitMode) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.nv_root)?;
        std::fs::create_dir_all(&config.disk_root)?;

        if mode == InitMode::CreateTruncate {
            for entry in std::fs::read_dir(&config.nv_root)? {
                let entry = entry?;
                let _ = std::fs::remove_file(entry.path());
            }
        }

        let cf_path = config.nv_root.join(CF_FILE_NAME);
        let cf_exists = cf_path.exists();
        match mode {
            InitMode::Restart if !cf_exists => {
                return Err(Error::Restart("nv_root has no control file to restart from"));
            }
            InitMode::CreateIfNotExists if !cf_exists && std::fs::read_dir(&config.nv_root)?.next().is_some() {
                return Err(Error::Restart("nv_root is non-empty but has no control file"));
            }
            _ => {}
        }

        let cf = if cf_exists {
            ControlFile::open(&cf_path)?
        } else {
            ControlFile::create(
                &cf_path,
                &CfConfigSnapshot {
                    segment_size: config.segment_size,
                    nv_quota: config.nv_quota,
                    mds_page_size: config.mds_page_size,
                    writer_count: config.writer_count as u64,
                    mds_num_files: config.mds_num_files as u64,
                },
            )?
        };

        let snapshot = cf.config_snapshot();
        if cf_exists
            && (snapshot.segment_size != config.segment_size
                || snapshot.nv_quota != config.nv_quota
                || snapshot.mds_page_size != config.mds_page_size
                || snapshot.mds_num_files != config.mds_num_files as u64)
        {
            return Err(Error::Restart("persisted config does not match the requested config"));
        }

        let durable_epoch = cf.durable_epoch();
        if cf_exists && config.resuming_epoch != INVALID_EPOCH && config.resuming_epoch != durable_epoch {
            return Err(Error::Restart("resuming_epoch does not match the persisted durable epoch"));
        }

        let segment_count = config.segment_count();
        let pool = if cf_exists {
            Arc::new(SegmentPool::recover(&config.nv_root, config.segment_size, segment_count)?)
        } else {
            Arc::new(SegmentPool::create(&config.nv_root, config.segment_size, segment_count)?)
        };
        if pool.current_dsid() == 0 {
            pool.activate_first_segment()?;
        }

        let (mds, _restarted) = MdsCore::init(
            &config.nv_root,
            mode,
            config.mds_page_size,
            config.mds_num_files as u64,
            config.mds_read_prefetch,
        )?;

        let stable = increment(durable_epoch).unwrap_or(1);
        let next = increment(stable).unwrap_or(stable);
        let epochs = Arc::new(SharedEpochs::new(durable_epoch, stable, next));

        let writers: Vec<Arc<WriterContext>> = (0..config.writer_count)
            .map(|i| Arc::new(WriterContext::new(i as u64, config.writer_buffer_size as u64)))
            .collect();

        let mds = Arc::new(Mutex::new(mds));
        let cf = Arc::new(Mutex::new(cf));
        let flusher_state = Arc::new(AgentStateHandle::new());
        let fsyncer_state = Arc::new(AgentStateHandle::new());

        let flusher = Flusher::new(
            writers.clone(),
            Arc::clone(&pool),
            Arc::clone(&mds),
            Arc::clone(&cf),
            Arc::clone(&epochs),
            Arc::clone(&flusher_state),
        );
        let fsyncer = Fsyncer::new(Arc::clone(&pool), config.disk_root.clone(), Arc::clone(&cf), Arc::clone(&fsyncer_state));

        let flusher_thread = std::thread::Builder::new()
            .name("nvwal-flusher".into())
            .spawn(move || flusher.run())?;
        let fsyncer_thread = std::thread::Builder::new()
            .name("nvwal-fsyncer".into())
            .spawn(move || fsyncer.run())?;

        Ok(Self {
            config,
            pool,
            mds,
            cf,
            epochs,
            writers,
            flusher_state,
            fsyncer_state,
            flusher_thread: Some(flusher_thread),
            fsyncer_thread: Some(fsyncer_thread),
        })
    }

    /// Stops both agent threads and waits for them to reach `Stopped`.
    pub fn uninit(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.flusher_state.request_stop_and_wait();
        self.fsyncer_state.request_stop_and_wait();
        if let Some(handle) = self.flusher_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.fsyncer_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn register_writer(&self, seq_id: u64) -> Result<WriterHandle> {
        let idx = seq_id as usize;
        let ctx = self
            .writers
            .get(idx)
            .ok_or(Error::Configuration("seq_id is out of range for writer_count"))?;
        Ok(WriterHandle { seq_id, ctx: Arc::clone(ctx) })
    }

    /// No-op if `epoch` is not after the current NE. Fails if it would push
    /// `NE - SE` beyond 1.
    pub fn advance_next_epoch(&self, epoch: Epoch) -> Result<()> {
        if !is_after(epoch, self.epochs.next_epoch()) {
            return Ok(());
        }
        let se = self.epochs.stable_epoch();
        if epoch.wrapping_sub(se) > 1 {
            return Err(Error::Submission("advancing NE would exceed NE - SE <= 1"));
        }
        self.epochs.set_next_epoch(epoch);
        Ok(())
    }

    /// No-op if `epoch` is not after the current SE. Fails if it would push
    /// SE past NE.
    pub fn advance_stable_epoch(&self, epoch: Epoch) -> Result<()> {
        if !is_after(epoch, self.epochs.stable_epoch()) {
            return Ok(());
        }
        if !is_after_or_equal(self.epochs.next_epoch(), epoch) {
            return Err(Error::Submission("cannot advance SE past NE"));
        }
        self.epochs.set_stable_epoch(epoch);
        Ok(())
    }

    pub fn query_durable_epoch(&self) -> Epoch {
        self.epochs.durable_epoch()
    }

    /// Blocks (bounded poll) until DE reaches at least `epoch`.
    pub fn wait_until_durable(&self, epoch: Epoch, timeout: std::time::Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        while !is_after_or_equal(self.epochs.durable_epoch(), epoch) {
            if std::time::Instant::now() >= deadline {
                return Err(Error::Submission("timed out waiting for durable epoch to advance"));
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Ok(())
    }

    pub fn open_log_cursor(&self, start_epoch: Epoch, end_epoch: Epoch) -> Result<LogCursor<'_>> {
        let latest = self.mds.lock().unwrap().latest_epoch();
        let prefetch = self.config.cursor_epoch_prefetches.max(1);
        let mds = Arc::clone(&self.mds);
        LogCursor::open(
            &self.pool,
            self.config.disk_root.clone(),
            start_epoch,
            end_epoch,
            latest,
            move |start, count| mds.lock().unwrap().read_epochs(start, count),
            prefetch,
        )
    }

    pub fn close_log_cursor(&self, cursor: LogCursor<'_>) {
        cursor.close();
    }

    pub fn pool_segment_count(&self) -> u64 {
        self.pool.segment_count()
    }
}

impl Drop for NvWal {
    fn drop(&mut self) {
        if self.flusher_thread.is_some() || self.fsyncer_thread.is_some() {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(nv: &Path, disk: &Path) -> NvWalConfig {
        let mut c = NvWalConfig::new(nv, disk);
        c.segment_size = 4096;
        c.nv_quota = 4096 * 4;
        c.mds_page_size = 4096;
        c.writer_buffer_size = 65536;
        c.writer_count = 1;
        c
    }

    #[test]
    fn init_then_write_then_query_durable_epoch() {
        let nv = tempdir().unwrap();
        let disk = tempdir().unwrap();
        let wal = NvWal::init(cfg(nv.path(), disk.path()), InitMode::CreateIfNotExists).unwrap();
        let writer = wal.register_writer(0).unwrap();
        writer.reserve(64).unwrap().fill(7);
        writer.on_wal_write(64, 1, 0, 0).unwrap();
        wal.advance_stable_epoch(1).unwrap();
        wal.wait_until_durable(1, std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(wal.query_durable_epoch(), 1);
        wal.uninit().unwrap();
    }

    #[test]
    fn restart_recovers_durable_epoch() {
        let nv = tempdir().unwrap();
        let disk = tempdir().unwrap();
        {
            let wal = NvWal::init(cfg(nv.path(), disk.path()), InitMode::CreateIfNotExists).unwrap();
            let writer = wal.register_writer(0).unwrap();
            writer.reserve(64).unwrap().fill(9);
            writer.on_wal_write(64, 1, 0, 0).unwrap();
            wal.advance_stable_epoch(1).unwrap();
            wal.wait_until_durable(1, std::time::Duration::from_secs(2)).unwrap();
            wal.uninit().unwrap();
        }
        let wal = NvWal::init(cfg(nv.path(), disk.path()), InitMode::Restart).unwrap();
        assert_eq!(wal.query_durable_epoch(), 1);
        wal.uninit().unwrap();
    }

    #[test]
    fn register_writer_out_of_range_is_configuration_error() {
        let nv = tempdir().unwrap();
        let disk = tempdir().unwrap();
        let wal = NvWal::init(cfg(nv.path(), disk.path()), InitMode::CreateIfNotExists).unwrap();
        assert!(matches!(wal.register_writer(5), Err(Error::Configuration(_))));
        wal.uninit().unwrap();
    }
}
