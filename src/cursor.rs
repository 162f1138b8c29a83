//! Log cursor: a half-open `[start_epoch, end_epoch)` reader over durable
//! bytes, resolving each epoch's segment range through the MDS and
//! preferring a pinned NV segment over an mmap of the disk copy.

use std::path::PathBuf;

use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::mds::MdsEntry;
use crate::mmap::MmapFile;
use crate::segment::{segment_path, SegmentPin, SegmentPool};

enum Source<'a> {
    Nv(SegmentPin<'a>),
    Disk(MmapFile),
}

/// One open DSID's worth of bytes, plus the [start, len) slice of it this
/// cursor position covers.
struct CurrentSegment<'a> {
    source: Source<'a>,
    offset: usize,
    len: usize,
}

pub struct LogCursor<'a> {
    pool: &'a SegmentPool,
    disk_root: PathBuf,
    entries: Vec<MdsEntry>,
    entry_idx: usize,
    /// DSID within the current entry's `[first_dsid, last_dsid]` range.
    dsid_cursor: u64,
    current: Option<CurrentSegment<'a>>,
    end_epoch: Epoch,
    fetch_entries: Box<dyn FnMut(Epoch, usize) -> Result<Vec<MdsEntry>> + 'a>,
    prefetch: usize,
}

impl<'a> LogCursor<'a> {
    /// `fetch_entries` pulls up to `prefetch` MDS entries starting at
    /// `start_epoch`; the caller (the top-level instance) owns the MDS lock
    /// so the cursor itself never touches it directly.
    pub fn open(
        pool: &'a SegmentPool,
        disk_root: PathBuf,
        start_epoch: Epoch,
        end_epoch: Epoch,
        latest_epoch: Epoch,
        fetch_entries: impl FnMut(Epoch, usize) -> Result<Vec<MdsEntry>> + 'a,
        prefetch: usize,
    ) -> Result<Self> {
        if start_epoch >= end_epoch {
            return Err(Error::Cursor("cursor range must be non-empty"));
        }
        if start_epoch > latest_epoch {
            return Err(Error::Cursor("start_epoch is after the latest durable epoch"));
        }
        let prefetch = prefetch.max(1);
        let mut fetch_entries: Box<dyn FnMut(Epoch, usize) -> Result<Vec<MdsEntry>> + 'a> = Box::new(fetch_entries);
        let entries = fetch_entries(start_epoch, prefetch)?;
        if entries.is_empty() {
            return Err(Error::Cursor("no mds entry for start_epoch"));
        }
        let mut cursor = Self {
            pool,
            disk_root,
            dsid_cursor: entries[0].first_dsid,
            entries,
            entry_idx: 0,
            current: None,
            end_epoch,
            fetch_entries,
            prefetch,
        };
        cursor.open_segment()?;
        Ok(cursor)
    }

    fn current_entry(&self) -> &MdsEntry {
        &self.entries[self.entry_idx]
    }

    fn open_segment(&mut self) -> Result<()> {
        let entry = self.current_entry();
        let dsid = self.dsid_cursor;
        let (start_offset, len) = if dsid == entry.last_dsid {
            let start = if dsid == entry.first_dsid { entry.first_offset } else { 0 };
            (start, (entry.last_offset - start) as usize)
        } else {
            let start = if dsid == entry.first_dsid { entry.first_offset } else { 0 };
            (start, (self.pool.segment_size() - start) as usize)
        };

        let source = if let Some(pin) = self.pool.pin_for_read(dsid) {
            Source::Nv(pin)
        } else {
            let path = segment_path(&self.disk_root, dsid);
            if !path.exists() {
                return Err(Error::Cursor("segment neither NV-resident nor disk-resident"));
            }
            Source::Disk(MmapFile::open(&path)?)
        };

        self.current = Some(CurrentSegment { source, offset: start_offset as usize, len });
        Ok(())
    }

    /// Advances past the current segment, moving to the next DSID within the
    /// entry, or the next epoch's entry, or ending the cursor.
    pub fn next(&mut self) -> Result<bool> {
        self.release_current();
        let entry = *self.current_entry();
        if self.dsid_cursor < entry.last_dsid {
            self.dsid_cursor += 1;
            self.open_segment()?;
            return Ok(true);
        }
        let next_epoch = entry.epoch + 1;
        if next_epoch >= self.end_epoch {
            return Ok(false);
        }
        if self.entry_idx + 1 >= self.entries.len() {
            let refilled = (self.fetch_entries)(next_epoch, self.prefetch)?;
            if refilled.is_empty() {
                return Err(Error::Cursor("no mds entry for next epoch in cursor range"));
            }
            self.entries = refilled;
            self.entry_idx = 0;
        } else {
            self.entry_idx += 1;
        }
        self.dsid_cursor = self.current_entry().first_dsid;
        self.open_segment()?;
        Ok(true)
    }

    /// `(ptr, len)` of the currently-visible byte span, relative to the
    /// segment's data region (header already excluded).
    pub fn current(&self) -> Result<(*const u8, usize)> {
        let cur = self.current.as_ref().ok_or(Error::Cursor("cursor is closed"))?;
        let base: *const u8 = match &cur.source {
            Source::Nv(pin) => unsafe { pin.segment().data()?.as_ptr() },
            Source::Disk(mmap) => {
                let full = mmap.as_slice();
                if full.len() < crate::segment::SEG_HEADER_SIZE {
                    return Err(Error::Corrupt("disk segment shorter than its header"));
                }
                full[crate::segment::SEG_HEADER_SIZE..].as_ptr()
            }
        };
        Ok((unsafe { base.add(cur.offset) }, cur.len))
    }

    fn release_current(&mut self) {
        self.current = None;
    }

    pub fn close(mut self) {
        self.release_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(epoch: Epoch, dsid: u64) -> MdsEntry {
        MdsEntry { epoch, first_dsid: dsid, first_offset: 0, last_dsid: dsid, last_offset: 64, user_meta_0: 0, user_meta_1: 0 }
    }

    #[test]
    fn reads_nv_resident_segment() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), 4096, 4).unwrap();
        let segment = pool.activate_first_segment().unwrap();
        unsafe {
            segment.data_mut().unwrap()[..4].copy_from_slice(&[9, 8, 7, 6]);
        }
        let disk_dir = tempdir().unwrap();
        let entries = vec![entry(1, 1)];
        let mut cursor = LogCursor::open(&pool, disk_dir.path().to_path_buf(), 1, 2, 1, |_, _| Ok(entries.clone()), 2).unwrap();
        let (ptr, len) = cursor.current().unwrap();
        assert_eq!(len, 64);
        let slice = unsafe { std::slice::from_raw_parts(ptr, 4) };
        assert_eq!(slice, &[9, 8, 7, 6]);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn start_after_latest_is_error() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), 4096, 4).unwrap();
        let disk_dir = tempdir().unwrap();
        let result = LogCursor::open(&pool, disk_dir.path().to_path_buf(), 5, 6, 1, |_, _| Ok(vec![]), 2);
        assert!(matches!(result, Err(Error::Cursor(_))));
    }

    #[test]
    fn missing_segment_is_cursor_error() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), 4096, 4).unwrap();
        let disk_dir = tempdir().unwrap();
        let entries = vec![entry(1, 1)];
        let result = LogCursor::open(&pool, disk_dir.path().to_path_buf(), 1, 2, 1, |_, _| Ok(entries.clone()), 2);
        assert!(matches!(result, Err(Error::Cursor(_))));
    }
}
