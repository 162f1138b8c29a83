//! MDS buffer manager: one NV-mapped write buffer per page file, holding the
//! page currently being filled. The buffer is the only page a reader can
//! observe ahead of the disk; everything older has already been paged out.

use std::path::Path;

use crate::config::InitMode;
use crate::error::Result;
use crate::mmap::{persist_range, MmapFile};

pub fn buffer_file_name(file_no: u64) -> String {
    format!("nvwal_mds_buffer_{file_no}")
}

pub struct PageBuffer {
    pub page_no: u64,
    pub dirty: bool,
    mmap: MmapFile,
}

impl PageBuffer {
    /// `start_page_no` is the page this buffer should represent once
    /// initialized: `disk_page_count + 1`.
    pub fn init(root: &Path, mode: InitMode, file_no: u64, page_size: u64, start_page_no: u64) -> Result<Self> {
        let path = root.join(buffer_file_name(file_no));
        let mut mmap = if path.exists() && mode != InitMode::CreateTruncate {
            MmapFile::open(&path)?
        } else {
            let m = MmapFile::create(&path, page_size as usize)?;
            m
        };
        if mmap.len() != page_size as usize {
            mmap = MmapFile::create(&path, page_size as usize)?;
        }
        Ok(Self { page_no: start_page_no, dirty: false, mmap })
    }

    pub fn write_entry(&mut self, offset_in_page: u64, entry_bytes: &[u8]) -> Result<()> {
        let offset = (offset_in_page as usize) * entry_bytes.len();
        let slice = self.mmap.range_mut(offset, entry_bytes.len())?;
        slice.copy_from_slice(entry_bytes);
        persist_range(&mut self.mmap, offset, entry_bytes.len())?;
        self.dirty = true;
        Ok(())
    }

    pub fn read_entry(&self, offset_in_page: u64, entry_len: usize, out: &mut [u8]) -> Result<()> {
        let offset = (offset_in_page as usize) * entry_len;
        out.copy_from_slice(&self.mmap.as_slice()[offset..offset + entry_len]);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.mmap.as_slice()
    }

    /// Resets the buffer to represent a fresh, empty page after its
    /// predecessor has been paged out to disk.
    pub fn reset_for_next_page(&mut self) -> Result<()> {
        self.page_no += 1;
        self.mmap.as_mut_slice().fill(0);
        persist_range(&mut self.mmap, 0, self.mmap.len())?;
        self.dirty = false;
        Ok(())
    }
}
