//! Thin wrapper around a memory-mapped file.
//!
//! This is the one seam between "bytes in a `File`" and "bytes reachable by
//! a raw pointer dereference". Every NV-resident structure (control block,
//! segments, MDS buffers) is built on top of an `MmapFile`.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates (truncating if present) and maps a file of exactly `len` bytes.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Configuration("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Like [`Self::create`] but fails with `AlreadyExists` instead of
    /// truncating an existing file. Used for publish-by-rename flows where a
    /// stale temp file must never be silently reused.
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Configuration("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Configuration("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Advisory exclusive lock on the backing file, held for the lifetime of
    /// the `File` descriptor. Used to detect a second process opening the
    /// same NV folder concurrently.
    pub fn lock(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fsyncs the backing file descriptor.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// Persistent-store fence for a range just written into an NV mapping.
///
/// On real NVRAM this would be a `clwb`-per-cacheline loop followed by an
/// `sfence`; portable Rust has no stable intrinsic for either, so the
/// equivalent "flush to the point of persistence" is approximated with an
/// `msync`-class flush via `MmapMut::flush_range`, which is the strongest
/// portable guarantee memmap2 exposes. Call this before any dependent
/// durability point (CF update, DSID publication) is allowed to proceed.
pub fn persist_range(mmap: &mut MmapFile, offset: usize, len: usize) -> Result<()> {
    mmap.map.flush_range(offset, len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        {
            let mut m = MmapFile::create(&path, 4096).unwrap();
            m.as_mut_slice()[0] = 0xAB;
            m.flush_sync().unwrap();
        }
        let m = MmapFile::open(&path).unwrap();
        assert_eq!(m.as_slice()[0], 0xAB);
        assert_eq!(m.len(), 4096);
    }

    #[test]
    fn create_new_fails_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        MmapFile::create(&path, 4096).unwrap();
        assert!(matches!(
            MmapFile::create_new(&path, 4096),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn range_mut_bounds_checked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut m = MmapFile::create(&path, 64).unwrap();
        assert!(m.range_mut(60, 10).is_err());
        assert!(m.range_mut(0, 64).is_ok());
    }
}
