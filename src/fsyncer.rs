//! Fsyncer: the single agent copying filled NV segments to disk files and
//! fsyncing them, advancing `last_synced_dsid` in the control file.
//!
//! Grounded on the scan-copy-advance shape of the teacher's raw archiver
//! (`run_once` over `list_segment_ids`, tracking progress in a small
//! metadata record) generalized from "sealed queue segment -> archive" to
//! "NV segment with fsync_requested -> disk file + directory fsync".

use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::control::ControlFile;
use crate::error::Result;
use crate::segment::{segment_filename, SegmentPool};
use crate::state::AgentStateHandle;

pub struct Fsyncer {
    pool: Arc<SegmentPool>,
    disk_root: PathBuf,
    cf: Arc<Mutex<ControlFile>>,
    state: Arc<AgentStateHandle>,
}

impl Fsyncer {
    pub fn new(pool: Arc<SegmentPool>, disk_root: PathBuf, cf: Arc<Mutex<ControlFile>>, state: Arc<AgentStateHandle>) -> Self {
        Self { pool, disk_root, cf, state }
    }

    pub fn run(&self) {
        self.state.mark_running();
        while self.state.poll() {
            if let Err(err) = self.run_once() {
                log::error!("fsyncer pass failed: {err}");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// One scan over every pool slot, syncing any segment that's been
    /// requested and not yet completed. A directory fsync runs once at the
    /// end if at least one file was written this pass.
    pub fn run_once(&self) -> Result<()> {
        let mut synced_any = false;
        let segment_count = self.pool.segment_count();
        let current = self.pool.current_dsid();
        if current == 0 {
            return Ok(());
        }
        let lowest = current.saturating_sub(segment_count).max(1);
        for dsid in lowest..=current {
            if self.sync_one(dsid)? {
                synced_any = true;
            }
        }
        if synced_any {
            fsync_directory(&self.disk_root)?;
        }
        Ok(())
    }

    /// Returns `Ok(true)` if this segment was newly synced.
    fn sync_one(&self, dsid: u64) -> Result<bool> {
        let Some(pin) = self.pool.pin_for_read(dsid) else {
            return Ok(false);
        };
        let segment = pin.segment();
        if segment.fsync_requested.load(Ordering::Acquire) != 1
            || segment.fsync_completed.load(Ordering::Acquire) == 1
            || segment.fsync_error.load(Ordering::Acquire) == 1
        {
            return Ok(false);
        }

        let result = self.copy_and_sync(dsid, segment);
        match result {
            Ok(()) => {
                segment.fsync_completed.store(1, Ordering::Release);
                Ok(true)
            }
            Err(err) => {
                log::warn!("fsync of segment {dsid} failed, marking sticky error: {err}");
                segment.fsync_error.store(1, Ordering::Release);
                Ok(false)
            }
        }
    }

    fn copy_and_sync(&self, dsid: u64, segment: &crate::segment::NvSegment) -> Result<()> {
        let raw = unsafe { segment.raw()? };
        let written = segment.written_bytes.load(Ordering::Acquire) as usize;
        let end = crate::segment::SEG_HEADER_SIZE + written;
        let path = self.disk_root.join(segment_filename(dsid));
        let mut file = File::create(&path)?;
        write_all_retrying(&mut file, &raw[..end])?;
        file.sync_all()?;
        let mut cf = self.cf.lock().unwrap();
        cf.advance_last_synced_dsid(dsid)?;
        Ok(())
    }
}

fn write_all_retrying(file: &mut File, buf: &[u8]) -> Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        match file.write(&buf[written..]) {
            Ok(0) => {
                return Err(crate::error::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write copying segment to disk",
                )))
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn fsync_directory(dir: &std::path::Path) -> Result<()> {
    let dir_file = File::open(dir)?;
    let rc = unsafe { libc::fsync(dir_file.as_raw_fd()) };
    if rc != 0 {
        return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CfConfigSnapshot;
    use tempfile::tempdir;

    fn cf(path: &std::path::Path) -> ControlFile {
        ControlFile::create(
            path,
            &CfConfigSnapshot { segment_size: 4096, nv_quota: 4096 * 4, mds_page_size: 4096, writer_count: 1, mds_num_files: 1 },
        )
        .unwrap()
    }

    #[test]
    fn syncs_requested_segment_to_disk() {
        let nv_dir = tempdir().unwrap();
        let disk_dir = tempdir().unwrap();
        let pool = Arc::new(SegmentPool::create(nv_dir.path(), 4096, 4).unwrap());
        let segment = pool.activate_first_segment().unwrap();
        unsafe {
            segment.data_mut().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        segment.written_bytes.store(4, Ordering::Release);
        pool.advance_nv_segment().unwrap(); // marks dsid 1 fsync_requested

        let control_path = nv_dir.path().join("nvwal.cf");
        let state = Arc::new(AgentStateHandle::new());
        let fsyncer = Fsyncer::new(Arc::clone(&pool), disk_dir.path().to_path_buf(), Arc::new(Mutex::new(cf(&control_path))), state);
        fsyncer.run_once().unwrap();

        let bytes = std::fs::read(disk_dir.path().join(segment_filename(1))).unwrap();
        assert_eq!(bytes.len(), crate::segment::SEG_HEADER_SIZE + 4);
        assert_eq!(&bytes[crate::segment::SEG_HEADER_SIZE..], &[1, 2, 3, 4]);
        assert_eq!(fsyncer.cf.lock().unwrap().last_synced_dsid(), 1);
    }

    #[test]
    fn does_not_resync_completed_segment() {
        let nv_dir = tempdir().unwrap();
        let disk_dir = tempdir().unwrap();
        let pool = Arc::new(SegmentPool::create(nv_dir.path(), 4096, 4).unwrap());
        pool.activate_first_segment().unwrap();
        pool.advance_nv_segment().unwrap();

        let control_path = nv_dir.path().join("nvwal.cf");
        let state = Arc::new(AgentStateHandle::new());
        let fsyncer = Fsyncer::new(Arc::clone(&pool), disk_dir.path().to_path_buf(), Arc::new(Mutex::new(cf(&control_path))), state);
        fsyncer.run_once().unwrap();
        let first_de = fsyncer.cf.lock().unwrap().last_synced_dsid();
        fsyncer.run_once().unwrap();
        assert_eq!(fsyncer.cf.lock().unwrap().last_synced_dsid(), first_de);
    }
}
