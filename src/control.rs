//! The Control File (CF): a small NV-mapped file holding durable progress
//! counters and the startup configuration snapshot used to validate restarts.
//!
//! `flusher_progress` and `fsyncer_progress` each live on their own 64-byte
//! cache line so the flusher and fsyncer threads never false-share a line
//! while durably advancing their respective counters.

use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::epoch::{Epoch, INVALID_EPOCH};
use crate::error::{Error, Result};
use crate::mmap::{persist_range, MmapFile};

pub const CF_MAGIC: u32 = 0x4E56_5741; // 'NVWA'
pub const CF_VERSION: u32 = 1;

const CF_STATE_READY: u32 = 2;

/// Persisted copy of the sizing knobs that must match across a restart.
#[repr(C, align(64))]
pub struct PersistedConfig {
    pub segment_size: AtomicU64,
    pub nv_quota: AtomicU64,
    pub mds_page_size: AtomicU64,
    pub writer_count: AtomicU64,
    pub mds_num_files: AtomicU64,
    _pad: [u8; 24],
}

#[repr(C, align(64))]
pub struct FlusherProgress {
    pub durable_epoch: AtomicU64,
    pub paged_mds_epoch: AtomicU64,
    _pad: [u8; 48],
}

#[repr(C, align(64))]
pub struct FsyncerProgress {
    pub last_synced_dsid: AtomicU64,
    _pad: [u8; 56],
}

#[repr(C, align(128))]
pub struct ControlBlock {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    _pad0: [u8; 4],
    pub config: PersistedConfig,
    pub flusher_progress: FlusherProgress,
    pub fsyncer_progress: FsyncerProgress,
}

pub struct ControlFile {
    mmap: MmapFile,
    ptr: *mut ControlBlock,
}

// SAFETY: ControlFile owns the mapping and raw pointer exclusively; it is
// moved, not aliased, across the thread that owns the instance.
unsafe impl Send for ControlFile {}
unsafe impl Sync for ControlFile {}

pub struct CfConfigSnapshot {
    pub segment_size: u64,
    pub nv_quota: u64,
    pub mds_page_size: u64,
    pub writer_count: u64,
    pub mds_num_files: u64,
}

impl ControlFile {
    pub fn create(path: &Path, cfg: &CfConfigSnapshot) -> Result<Self> {
        let tmp_path = path.with_extension("tmp");
        let size = aligned_size();
        let mut mmap = MmapFile::create_new(&tmp_path, size)?;
        mmap.as_mut_slice().fill(0);
        let ptr = mmap.as_mut_slice().as_mut_ptr() as *mut ControlBlock;
        let block = unsafe { &*ptr };
        block.init_state.store(1, Ordering::Relaxed);
        block.version.store(CF_VERSION, Ordering::Relaxed);
        block.config.segment_size.store(cfg.segment_size, Ordering::Relaxed);
        block.config.nv_quota.store(cfg.nv_quota, Ordering::Relaxed);
        block.config.mds_page_size.store(cfg.mds_page_size, Ordering::Relaxed);
        block.config.writer_count.store(cfg.writer_count, Ordering::Relaxed);
        block.config.mds_num_files.store(cfg.mds_num_files, Ordering::Relaxed);
        block.flusher_progress.durable_epoch.store(INVALID_EPOCH, Ordering::Relaxed);
        block.flusher_progress.paged_mds_epoch.store(INVALID_EPOCH, Ordering::Relaxed);
        block.fsyncer_progress.last_synced_dsid.store(0, Ordering::Relaxed);
        block.magic.store(CF_MAGIC, Ordering::Relaxed);
        block.init_state.store(CF_STATE_READY, Ordering::Release);
        persist_range(&mut mmap, 0, size)?;
        mmap.sync()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(Self { mmap, ptr })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mmap = MmapFile::open(path)?;
        if mmap.len() < size_of::<ControlBlock>() {
            return Err(Error::Restart("control file too small"));
        }
        let ptr = mmap.as_slice().as_ptr() as *mut ControlBlock;
        let file = Self { mmap, ptr };
        file.check_ready()?;
        Ok(file)
    }

    fn check_ready(&self) -> Result<()> {
        let block = self.block();
        if block.init_state.load(Ordering::Acquire) != CF_STATE_READY {
            return Err(Error::Restart("control file not fully initialized"));
        }
        if block.magic.load(Ordering::Acquire) != CF_MAGIC {
            return Err(Error::Restart("control file magic mismatch"));
        }
        let version = block.version.load(Ordering::Acquire);
        if version != CF_VERSION {
            return Err(Error::Restart("control file version mismatch"));
        }
        Ok(())
    }

    fn block(&self) -> &ControlBlock {
        unsafe { &*self.ptr }
    }

    pub fn config_snapshot(&self) -> CfConfigSnapshot {
        let cfg = &self.block().config;
        CfConfigSnapshot {
            segment_size: cfg.segment_size.load(Ordering::Acquire),
            nv_quota: cfg.nv_quota.load(Ordering::Acquire),
            mds_page_size: cfg.mds_page_size.load(Ordering::Acquire),
            writer_count: cfg.writer_count.load(Ordering::Acquire),
            mds_num_files: cfg.mds_num_files.load(Ordering::Acquire),
        }
    }

    pub fn durable_epoch(&self) -> Epoch {
        self.block().flusher_progress.durable_epoch.load(Ordering::Acquire)
    }

    pub fn paged_mds_epoch(&self) -> Epoch {
        self.block().flusher_progress.paged_mds_epoch.load(Ordering::Acquire)
    }

    /// Durably advances DE: touches exactly the flusher's cache line, fences,
    /// then fsyncs the mapping so the store survives a crash.
    pub fn advance_durable_epoch(&mut self, epoch: Epoch) -> Result<()> {
        debug_assert!(epoch >= self.durable_epoch(), "durable epoch must never regress");
        self.block().flusher_progress.durable_epoch.store(epoch, Ordering::Relaxed);
        self.persist_flusher_line()
    }

    pub fn advance_paged_mds_epoch(&mut self, epoch: Epoch) -> Result<()> {
        self.block().flusher_progress.paged_mds_epoch.store(epoch, Ordering::Relaxed);
        self.persist_flusher_line()
    }

    fn persist_flusher_line(&mut self) -> Result<()> {
        let offset = field_offset_flusher_progress();
        persist_range(&mut self.mmap, offset, size_of::<FlusherProgress>())?;
        self.mmap.sync()
    }

    pub fn last_synced_dsid(&self) -> u64 {
        self.block().fsyncer_progress.last_synced_dsid.load(Ordering::Acquire)
    }

    /// Durably bumps `last_synced_dsid`; callers must never pass a value
    /// that would decrease it.
    pub fn advance_last_synced_dsid(&mut self, dsid: u64) -> Result<()> {
        debug_assert!(dsid >= self.last_synced_dsid(), "last_synced_dsid must never decrease");
        self.block().fsyncer_progress.last_synced_dsid.store(dsid, Ordering::Relaxed);
        let offset = field_offset_fsyncer_progress();
        persist_range(&mut self.mmap, offset, size_of::<FsyncerProgress>())?;
        self.mmap.sync()
    }
}

fn aligned_size() -> usize {
    let raw = size_of::<ControlBlock>();
    (raw + 511) & !511
}

fn field_offset_flusher_progress() -> usize {
    std::mem::offset_of!(ControlBlock, flusher_progress)
}

fn field_offset_fsyncer_progress() -> usize {
    std::mem::offset_of!(ControlBlock, fsyncer_progress)
}
