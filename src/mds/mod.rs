//! Metadata store: maps each durable epoch to the segment byte ranges that
//! hold its log bytes.
//!
//! Address arithmetic (file/page/offset for a given epoch) mirrors the
//! striping formula from the original C header this module is grounded on:
//! epochs are normalized (`e - 1`) so the reserved epoch 0 never
//! participates in index math, then striped evenly across `num_files`
//! page files.

pub mod buffer;
pub mod io;

use std::path::Path;

use crate::config::InitMode;
use crate::epoch::{normalize, Epoch, INVALID_EPOCH};
use crate::error::{Error, Result};

pub const ENTRY_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MdsEntry {
    pub epoch: Epoch,
    pub first_dsid: u64,
    pub first_offset: u64,
    pub last_dsid: u64,
    pub last_offset: u64,
    pub user_meta_0: u64,
    pub user_meta_1: u64,
}

impl MdsEntry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.epoch.to_le_bytes());
        buf[8..16].copy_from_slice(&self.first_dsid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_dsid.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.user_meta_0.to_le_bytes());
        buf[48..56].copy_from_slice(&self.user_meta_1.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            epoch: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            first_dsid: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            first_offset: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            last_dsid: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            last_offset: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            user_meta_0: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            user_meta_1: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
        }
    }
}

fn max_epochs_per_page(page_size: u64) -> u64 {
    page_size / ENTRY_SIZE as u64
}

pub fn epoch_id_to_file_no(epoch: Epoch, page_size: u64, num_files: u64) -> u64 {
    let page_offset = normalize(epoch) / max_epochs_per_page(page_size);
    page_offset % num_files
}

pub fn epoch_id_to_page_no(epoch: Epoch, page_size: u64, num_files: u64) -> u64 {
    if epoch == INVALID_EPOCH {
        return 0;
    }
    1 + normalize(epoch) / (max_epochs_per_page(page_size) * num_files)
}

pub fn epoch_id_to_page_offset(epoch: Epoch, page_size: u64) -> u64 {
    normalize(epoch) % max_epochs_per_page(page_size)
}

/// Byte offset within a single page file, valid when `num_files == 1`
/// (today's only exercised configuration; see DESIGN.md).
pub fn epoch_id_to_file_offset(epoch: Epoch) -> u64 {
    normalize(epoch) * ENTRY_SIZE as u64
}

pub fn page_no_to_file_offset(page_no: u64, page_size: u64) -> u64 {
    (page_no - 1) * page_size
}

pub struct MdsCore {
    page_size: u64,
    num_files: u64,
    io_files: Vec<io::PageFile>,
    buffers: Vec<buffer::PageBuffer>,
    latest_epoch: Epoch,
    read_prefetch: usize,
    /// The most recent batch `read_epoch` pulled in, keyed by its first
    /// epoch; a read_epoch within this window is served without touching
    /// the buffer or page file again.
    prefetch_cache: Option<(Epoch, Vec<MdsEntry>)>,
}

impl MdsCore {
    pub fn init(root: &Path, mode: InitMode, page_size: u64, num_files: u64, read_prefetch: usize) -> Result<(Self, bool)> {
        let (io_files, did_restart) = io::init(root, mode, num_files, page_size)?;
        let mut buffers = Vec::with_capacity(num_files as usize);
        for (file_no, pf) in io_files.iter().enumerate() {
            let page_count = pf.page_count()?;
            buffers.push(buffer::PageBuffer::init(
                root,
                mode,
                file_no as u64,
                page_size,
                page_count + 1,
            )?);
        }
        Ok((
            Self {
                page_size,
                num_files,
                io_files,
                buffers,
                latest_epoch: INVALID_EPOCH,
                read_prefetch: read_prefetch.max(1),
                prefetch_cache: None,
            },
            did_restart,
        ))
    }

    pub fn latest_epoch(&self) -> Epoch {
        self.latest_epoch
    }

    /// Places `entry` at the slot computed for `epoch`. Entries must be
    /// written in strictly increasing epoch order and never rewritten.
    ///
    /// Returns the epoch durably paged out to disk this call, if writing
    /// `entry` forced the previous page to flush — `None` means `entry`
    /// landed on a page still resident only in the write buffer, and the
    /// caller must not advance `paged_mds_epoch` past what it already was.
    pub fn write_epoch(&mut self, epoch: Epoch, entry: MdsEntry) -> Result<Option<Epoch>> {
        debug_assert!(
            epoch > self.latest_epoch || self.latest_epoch == INVALID_EPOCH,
            "mds writes must be strictly monotonic"
        );
        let file_no = epoch_id_to_file_no(epoch, self.page_size, self.num_files);
        let page_no = epoch_id_to_page_no(epoch, self.page_size, self.num_files);
        let offset = epoch_id_to_page_offset(epoch, self.page_size);

        let mut paged_through = None;
        let buf = &mut self.buffers[file_no as usize];
        if page_no > buf.page_no {
            // First entry of a new page: the previous tail page is full and
            // must be paged out before we can start filling the next one.
            if self.latest_epoch != INVALID_EPOCH {
                paged_through = Some(self.latest_epoch);
            }
            self.page_out(file_no as usize)?;
        }
        let buf = &mut self.buffers[file_no as usize];
        debug_assert_eq!(page_no, buf.page_no, "mds entry landed on an unexpected page");
        buf.write_entry(offset, &entry.to_bytes())?;
        self.latest_epoch = epoch;
        Ok(paged_through)
    }

    /// Persists the buffer's current page to its page file and resets the
    /// buffer to represent the next page. The caller is responsible for
    /// durably advancing `paged_mds_epoch` in the control file immediately
    /// after this returns `Ok`.
    fn page_out(&mut self, file_no: usize) -> Result<()> {
        let buf = &mut self.buffers[file_no];
        if !buf.dirty {
            // Nothing written to this page yet (e.g. right after init);
            // just advance past it.
            buf.reset_for_next_page()?;
            return Ok(());
        }
        let bytes = buf.as_bytes().to_vec();
        self.io_files[file_no].append_page(&bytes)?;
        buf.reset_for_next_page()
    }

    /// Reads a single entry straight from the resident write buffer or, if
    /// already paged out, the page file on disk. Never touches the prefetch
    /// cache.
    fn fetch_entry(&self, epoch: Epoch) -> Result<MdsEntry> {
        let file_no = epoch_id_to_file_no(epoch, self.page_size, self.num_files) as usize;
        let page_no = epoch_id_to_page_no(epoch, self.page_size, self.num_files);
        let offset = epoch_id_to_page_offset(epoch, self.page_size);

        let buf = &self.buffers[file_no];
        let mut raw = [0u8; ENTRY_SIZE];
        if buf.page_no == page_no {
            buf.read_entry(offset, ENTRY_SIZE, &mut raw)?;
        } else {
            let file_offset = page_no_to_file_offset(page_no, self.page_size)
                + offset * ENTRY_SIZE as u64;
            self.io_files[file_no].read_at(file_offset, &mut raw)?;
        }
        Ok(MdsEntry::from_bytes(&raw))
    }

    /// Returns the entry for `epoch`. On a cache miss, pulls up to
    /// `read_prefetch` consecutive entries starting at `epoch` in one pass
    /// and caches them, so a sequential reader (e.g. a cursor stepping epoch
    /// by epoch) hits the buffer/page file only once per window instead of
    /// once per epoch.
    pub fn read_epoch(&mut self, epoch: Epoch) -> Result<MdsEntry> {
        if epoch == INVALID_EPOCH || epoch > self.latest_epoch {
            return Err(Error::Cursor("epoch has no mds entry yet"));
        }
        if let Some((start, cached)) = &self.prefetch_cache {
            if epoch >= *start {
                let idx = (epoch - start) as usize;
                if idx < cached.len() {
                    return Ok(cached[idx]);
                }
            }
        }
        let mut batch = Vec::with_capacity(self.read_prefetch);
        let mut e = epoch;
        for _ in 0..self.read_prefetch {
            if e > self.latest_epoch {
                break;
            }
            batch.push(self.fetch_entry(e)?);
            e += 1;
        }
        let result = *batch.first().ok_or(Error::Cursor("epoch has no mds entry yet"))?;
        self.prefetch_cache = Some((epoch, batch));
        Ok(result)
    }

    /// Batch read used by the cursor's own epoch-range prefetch window;
    /// stops early if an epoch beyond `latest_epoch` would be required. Reads
    /// straight through, independent of the `read_epoch` cache.
    pub fn read_epochs(&mut self, start: Epoch, count: usize) -> Result<Vec<MdsEntry>> {
        let mut out = Vec::with_capacity(count);
        let mut epoch = start;
        for _ in 0..count {
            if epoch > self.latest_epoch {
                break;
            }
            out.push(self.fetch_entry(epoch)?);
            epoch += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(epoch: Epoch) -> MdsEntry {
        MdsEntry { epoch, first_dsid: 1, first_offset: 0, last_dsid: 1, last_offset: 64, user_meta_0: 0, user_meta_1: 0 }
    }

    #[test]
    fn addressing_matches_formula() {
        let page_size = ENTRY_SIZE as u64 * 4; // 4 epochs per page
        assert_eq!(epoch_id_to_page_no(1, page_size, 1), 1);
        assert_eq!(epoch_id_to_page_no(4, page_size, 1), 1);
        assert_eq!(epoch_id_to_page_no(5, page_size, 1), 2);
        assert_eq!(epoch_id_to_page_offset(1, page_size), 0);
        assert_eq!(epoch_id_to_page_offset(4, page_size), 3);
        assert_eq!(epoch_id_to_file_no(1, page_size, 1), 0);
    }

    #[test]
    fn write_then_read_within_buffer() {
        let dir = tempdir().unwrap();
        let page_size = ENTRY_SIZE as u64 * 4;
        let (mut mds, did_restart) = MdsCore::init(dir.path(), InitMode::CreateIfNotExists, page_size, 1, 16).unwrap();
        assert!(!did_restart);
        mds.write_epoch(1, entry(1)).unwrap();
        mds.write_epoch(2, entry(2)).unwrap();
        assert_eq!(mds.latest_epoch(), 2);
        let got = mds.read_epoch(1).unwrap();
        assert_eq!(got.epoch, 1);
    }

    #[test]
    fn page_out_then_read_from_disk() {
        let dir = tempdir().unwrap();
        let page_size = ENTRY_SIZE as u64 * 2; // tiny page: 2 epochs
        let (mut mds, _) = MdsCore::init(dir.path(), InitMode::CreateIfNotExists, page_size, 1, 16).unwrap();
        mds.write_epoch(1, entry(1)).unwrap();
        mds.write_epoch(2, entry(2)).unwrap();
        // epoch 3 starts a new page, forcing page 1 out to disk.
        mds.write_epoch(3, entry(3)).unwrap();
        let got = mds.read_epoch(1).unwrap();
        assert_eq!(got.epoch, 1);
        let got = mds.read_epoch(3).unwrap();
        assert_eq!(got.epoch, 3);
    }

    #[test]
    fn read_beyond_latest_is_cursor_error() {
        let dir = tempdir().unwrap();
        let (mut mds, _) = MdsCore::init(dir.path(), InitMode::CreateIfNotExists, 256, 1, 16).unwrap();
        mds.write_epoch(1, entry(1)).unwrap();
        assert!(matches!(mds.read_epoch(2), Err(Error::Cursor(_))));
    }
}
