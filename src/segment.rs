//! NV segment pool: a fixed-size circular array of NVRAM-mapped regions.
//!
//! Each live segment backs one file named by its DSID
//! (`nvwal_segment_XXXXXXXX`, uppercase 8-hex). The pool has
//! `segment_count = ceil(nv_quota / segment_size)` slots; a slot's occupant
//! is recycled when the flusher advances past it, which requires the CAS
//! on `nv_reader_pins` to observe zero live pins first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mmap::MmapFile;

pub const SEG_MAGIC: u32 = 0x4E56_5347; // 'NVSG'
pub const SEG_VERSION: u32 = 1;
pub const SEG_HEADER_SIZE: usize = 64;

/// `nv_reader_pins` sentinel meaning "being recycled, holds zero readers".
pub const RECYCLING: i64 = -1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub dsid: u64,
    pub _pad: [u8; 48],
}

pub fn segment_filename(dsid: u64) -> String {
    format!("nvwal_segment_{:08X}", dsid)
}

pub fn segment_path(root: &Path, dsid: u64) -> PathBuf {
    root.join(segment_filename(dsid))
}

fn write_segment_header(mmap: &mut MmapFile, dsid: u64) -> Result<()> {
    let header = SegmentHeader {
        magic: SEG_MAGIC,
        version: SEG_VERSION,
        dsid,
        _pad: [0u8; 48],
    };
    let bytes = mmap.range_mut(0, SEG_HEADER_SIZE)?;
    bytes[0..4].copy_from_slice(&header.magic.to_le_bytes());
    bytes[4..8].copy_from_slice(&header.version.to_le_bytes());
    bytes[8..16].copy_from_slice(&header.dsid.to_le_bytes());
    Ok(())
}

fn read_segment_header(mmap: &MmapFile) -> Result<SegmentHeader> {
    let bytes = mmap.as_slice();
    if bytes.len() < SEG_HEADER_SIZE {
        return Err(Error::Corrupt("segment shorter than its header"));
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let dsid = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    if magic != SEG_MAGIC {
        return Err(Error::Corrupt("segment magic mismatch"));
    }
    if version != SEG_VERSION {
        return Err(Error::Corrupt("segment version mismatch"));
    }
    Ok(SegmentHeader { magic, version, dsid, _pad: [0u8; 48] })
}

/// Touches every 4 KiB page of the mapping once, skipping the header page,
/// so the first write into the segment doesn't pay a page-fault latency
/// spike inside the flusher's hot path.
fn prefault(mmap: &mut MmapFile) {
    const PAGE: usize = 4096;
    let len = mmap.len();
    let slice = mmap.as_mut_slice();
    let mut offset = PAGE;
    while offset < len {
        slice[offset] = slice[offset];
        offset += PAGE;
    }
}

/// One slot in the NV segment pool.
///
/// `mmap` is guarded only by the pin-count protocol, not a lock: a reader
/// may dereference the mapping once [`SegmentPool::pin_for_read`] succeeds,
/// and [`SegmentPool::advance_nv_segment`] may only swap the mapping out
/// after observing zero pins via CAS. This mirrors the lock-free contract in
/// the data model ("a segment in state being recycled holds zero readers").
pub struct NvSegment {
    pub dsid: AtomicU64,
    pub nv_reader_pins: AtomicI64,
    pub fsync_requested: AtomicU32,
    pub fsync_completed: AtomicU32,
    pub fsync_error: AtomicU32,
    pub written_bytes: AtomicU64,
    index: usize,
    mmap: std::cell::UnsafeCell<Option<MmapFile>>,
}

// SAFETY: all access to `mmap` is gated by the pin-count CAS protocol
// documented above; concurrent readers only ever take shared access to an
// established mapping, and the writer (flusher) only swaps it while pins
// are provably zero.
unsafe impl Sync for NvSegment {}

impl NvSegment {
    fn empty(index: usize) -> Self {
        Self {
            dsid: AtomicU64::new(0),
            nv_reader_pins: AtomicI64::new(0),
            fsync_requested: AtomicU32::new(0),
            fsync_completed: AtomicU32::new(0),
            fsync_error: AtomicU32::new(0),
            written_bytes: AtomicU64::new(0),
            index,
            mmap: std::cell::UnsafeCell::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Raw bytes of the data region (header excluded). Only valid while the
    /// caller holds a pin, or is the flusher with exclusive access.
    ///
    /// # Safety
    /// The caller must ensure the segment is pinned (or otherwise known not
    /// to be concurrently recycled) for the duration the returned slice is
    /// used.
    pub unsafe fn data(&self) -> Result<&[u8]> {
        match &*self.mmap.get() {
            Some(mmap) => Ok(&mmap.as_slice()[SEG_HEADER_SIZE..]),
            None => Err(Error::Cursor("segment not NV-resident")),
        }
    }

    /// Raw bytes of the mapping, header included. The fsyncer copies this
    /// verbatim to the disk file so the disk copy has the same layout as the
    /// NV mapping and the cursor's disk-fallback path can strip the header
    /// the same way it strips it from an NV-resident segment.
    ///
    /// # Safety
    /// Same contract as [`Self::data`].
    pub unsafe fn raw(&self) -> Result<&[u8]> {
        match &*self.mmap.get() {
            Some(mmap) => Ok(mmap.as_slice()),
            None => Err(Error::Cursor("segment not NV-resident")),
        }
    }

    /// # Safety
    /// Exclusive-writer discipline: only the flusher ever calls this, and
    /// only for the current active segment.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> Result<&mut [u8]> {
        match &mut *self.mmap.get() {
            Some(mmap) => Ok(&mut mmap.as_mut_slice()[SEG_HEADER_SIZE..]),
            None => Err(Error::Cursor("segment not NV-resident")),
        }
    }

    pub unsafe fn flush_sync(&self) -> Result<()> {
        match &*self.mmap.get() {
            Some(mmap) => mmap.flush_sync(),
            None => Ok(()),
        }
    }
}

/// RAII guard releasing a reader pin on drop.
pub struct SegmentPin<'a> {
    segment: &'a NvSegment,
}

impl<'a> Drop for SegmentPin<'a> {
    fn drop(&mut self) {
        self.segment.nv_reader_pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<'a> SegmentPin<'a> {
    pub fn segment(&self) -> &'a NvSegment {
        self.segment
    }
}

pub struct SegmentPool {
    root: PathBuf,
    segment_size: u64,
    segments: Vec<NvSegment>,
    current_dsid: AtomicU64,
}

impl SegmentPool {
    /// How long `advance_nv_segment` waits for a pinned segment to free up
    /// before failing with `Error::Space`.
    const RECYCLE_DEADLINE: Duration = Duration::from_secs(30);

    /// Creates a fresh, empty pool with `segment_count` slots, none backed
    /// by an NV file yet.
    pub fn create(root: &Path, segment_size: u64, segment_count: u64) -> Result<Self> {
        let segments = (0..segment_count as usize).map(NvSegment::empty).collect();
        Ok(Self {
            root: root.to_path_buf(),
            segment_size,
            segments,
            current_dsid: AtomicU64::new(0),
        })
    }

    /// Recovers a pool on restart by scanning the NV folder for segment
    /// files still present; each is mapped back into its slot.
    pub fn recover(root: &Path, segment_size: u64, segment_count: u64) -> Result<Self> {
        let mut pool = Self::create(root, segment_size, segment_count)?;
        let mut max_dsid = 0u64;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(dsid) = parse_segment_filename(&name) {
                let mmap = MmapFile::open(&segment_path(root, dsid))?;
                let header = read_segment_header(&mmap)?;
                if header.dsid != dsid {
                    return Err(Error::Corrupt("segment filename/DSID mismatch on recovery"));
                }
                let idx = pool.index_for_dsid(dsid);
                let written = mmap.len().saturating_sub(SEG_HEADER_SIZE) as u64;
                let slot = &pool.segments[idx];
                slot.dsid.store(dsid, Ordering::Relaxed);
                slot.written_bytes.store(written, Ordering::Relaxed);
                unsafe { *slot.mmap.get() = Some(mmap) };
                max_dsid = max_dsid.max(dsid);
            }
        }
        pool.current_dsid.store(max_dsid, Ordering::Relaxed);
        Ok(pool)
    }

    pub fn segment_count(&self) -> u64 {
        self.segments.len() as u64
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn index_for_dsid(&self, dsid: u64) -> usize {
        debug_assert!(dsid > 0, "DSID 0 is null");
        ((dsid - 1) % self.segment_count()) as usize
    }

    pub fn current_dsid(&self) -> u64 {
        self.current_dsid.load(Ordering::Acquire)
    }

    pub fn current_nv_segment(&self) -> Result<&NvSegment> {
        let dsid = self.current_dsid();
        if dsid == 0 {
            return Err(Error::Space("no active NV segment has been allocated yet"));
        }
        Ok(&self.segments[self.index_for_dsid(dsid)])
    }

    /// Allocates the very first segment for a brand-new pool.
    pub fn activate_first_segment(&self) -> Result<&NvSegment> {
        debug_assert_eq!(self.current_dsid(), 0);
        self.allocate_next(1)
    }

    /// Marks the current segment `fsync_requested`, then allocates DSID
    /// `current + 1` at the next slot, blocking (via CAS retry with backoff)
    /// until that slot's reader pins reach zero.
    pub fn advance_nv_segment(&self) -> Result<&NvSegment> {
        let current = self.current_nv_segment()?;
        current.fsync_requested.store(1, Ordering::Release);
        let next_dsid = self.current_dsid() + 1;
        self.allocate_next(next_dsid)
    }

    fn allocate_next(&self, dsid: u64) -> Result<&NvSegment> {
        let idx = self.index_for_dsid(dsid);
        let slot = &self.segments[idx];

        let deadline = std::time::Instant::now() + Self::RECYCLE_DEADLINE;
        let mut backoff = Duration::from_micros(50);
        loop {
            let occupant_dsid = slot.dsid.load(Ordering::Acquire);
            let fsync_done = occupant_dsid == 0 || slot.fsync_completed.load(Ordering::Acquire) == 1;
            if !fsync_done {
                // Refuse to recycle a segment the fsyncer hasn't archived
                // yet, whether it's still pending or stuck on a sticky error.
                if std::time::Instant::now() >= deadline {
                    return Err(Error::Space("NV quota exhausted: occupant segment not yet fsynced"));
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(10));
                continue;
            }
            match slot.nv_reader_pins.compare_exchange(
                0,
                RECYCLING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) if std::time::Instant::now() >= deadline => {
                    return Err(Error::Space("NV quota exhausted: no recycleable segment within deadline"));
                }
                Err(v) if v == RECYCLING => {
                    // Another thread is already recycling this slot; spin.
                    std::thread::sleep(backoff);
                }
                Err(_) => {
                    // Pinned by a live reader (spec scenario: reader pin
                    // blocks recycle). Wait for it to release.
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(10));
                }
            }
        }

        let old_path = {
            let old_dsid = slot.dsid.load(Ordering::Acquire);
            if old_dsid != 0 {
                Some(segment_path(&self.root, old_dsid))
            } else {
                None
            }
        };

        let path = segment_path(&self.root, dsid);
        let mut mmap = MmapFile::create_new(&path, (SEG_HEADER_SIZE as u64 + self.segment_size) as usize)?;
        write_segment_header(&mut mmap, dsid)?;
        prefault(&mut mmap);

        unsafe { *slot.mmap.get() = Some(mmap) };
        slot.dsid.store(dsid, Ordering::Release);
        slot.written_bytes.store(0, Ordering::Release);
        slot.fsync_requested.store(0, Ordering::Release);
        slot.fsync_completed.store(0, Ordering::Release);
        slot.fsync_error.store(0, Ordering::Release);
        slot.nv_reader_pins.store(0, Ordering::Release);
        self.current_dsid.store(dsid, Ordering::Release);

        // The fsync_completed gate above guarantees a disk-synced copy
        // already exists by the time we get here.
        if let Some(old) = old_path {
            let _ = std::fs::remove_file(old);
        }

        Ok(slot)
    }

    /// CAS-pins the segment with the given DSID for reading. Returns `None`
    /// if the DSID is no longer NV-resident (miss — caller falls back to
    /// disk).
    /// True if any resident segment has a sticky fsync error. The flusher
    /// consults this before advancing DE past bytes it can no longer
    /// guarantee are archivable.
    pub fn has_fsync_error(&self) -> bool {
        self.segments.iter().any(|s| s.fsync_error.load(Ordering::Acquire) == 1)
    }

    /// True if any segment in `[first_dsid, last_dsid]` still has a sticky
    /// fsync error. A slot whose occupant has since moved on to a later DSID
    /// proves that occupant synced cleanly, since recycling refuses to
    /// proceed past a sticky error — so only slots still holding the DSID in
    /// question need checking.
    pub fn has_fsync_error_in_range(&self, first_dsid: u64, last_dsid: u64) -> bool {
        if first_dsid == 0 || last_dsid == 0 {
            return false;
        }
        (first_dsid..=last_dsid).any(|dsid| {
            let slot = &self.segments[self.index_for_dsid(dsid)];
            slot.dsid.load(Ordering::Acquire) == dsid && slot.fsync_error.load(Ordering::Acquire) == 1
        })
    }

    pub fn pin_for_read(&self, dsid: u64) -> Option<SegmentPin<'_>> {
        if dsid == 0 {
            return None;
        }
        let idx = self.index_for_dsid(dsid);
        let slot = &self.segments[idx];
        loop {
            let current = slot.nv_reader_pins.load(Ordering::Acquire);
            if current == RECYCLING {
                return None;
            }
            if slot.dsid.load(Ordering::Acquire) != dsid {
                return None;
            }
            if slot
                .nv_reader_pins
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Re-check identity: a recycle could have raced between the
                // dsid load and the CAS succeeding on the *old* generation's
                // pin count if it happened to also be at value `current`.
                if slot.dsid.load(Ordering::Acquire) != dsid {
                    slot.nv_reader_pins.fetch_sub(1, Ordering::AcqRel);
                    return None;
                }
                return Some(SegmentPin { segment: slot });
            }
        }
    }
}

fn parse_segment_filename(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("nvwal_segment_")?;
    if hex.len() != 8 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn activate_then_advance_rotates_dsid() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), 512, 4).unwrap();
        pool.activate_first_segment().unwrap();
        assert_eq!(pool.current_dsid(), 1);
        pool.advance_nv_segment().unwrap();
        assert_eq!(pool.current_dsid(), 2);
    }

    #[test]
    fn pin_for_read_hits_resident_segment() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), 512, 4).unwrap();
        pool.activate_first_segment().unwrap();
        let pin = pool.pin_for_read(1).expect("segment should be resident");
        assert_eq!(pin.segment().dsid.load(Ordering::Acquire), 1);
    }

    #[test]
    fn pin_for_read_misses_recycled_segment() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), 512, 2).unwrap();
        pool.activate_first_segment().unwrap(); // dsid 1 -> slot 0
        pool.advance_nv_segment().unwrap(); // dsid 2 -> slot 1
        // The fsyncer would normally mark this once it archives dsid 1;
        // recycling refuses to proceed otherwise.
        pool.segments[0].fsync_completed.store(1, Ordering::Release);
        pool.advance_nv_segment().unwrap(); // dsid 3 -> slot 0, recycles dsid 1
        assert!(pool.pin_for_read(1).is_none());
        assert!(pool.pin_for_read(3).is_some());
    }

    #[test]
    fn recover_remaps_existing_segments() {
        let dir = tempdir().unwrap();
        {
            let pool = SegmentPool::create(dir.path(), 512, 4).unwrap();
            pool.activate_first_segment().unwrap();
            pool.advance_nv_segment().unwrap();
        }
        let pool = SegmentPool::recover(dir.path(), 512, 4).unwrap();
        assert_eq!(pool.current_dsid(), 2);
        assert!(pool.pin_for_read(2).is_some());
    }
}
