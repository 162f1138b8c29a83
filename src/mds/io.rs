//! Append-only page files for the metadata store.
//!
//! Atomicity of a single page append is inferred from file size: a page
//! write is either fully reflected in the file's length or not at all,
//! because on restart any file whose size is not a multiple of the page
//! size is truncated down to the nearest lower multiple, discarding the
//! last partial page.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::InitMode;
use crate::error::{Error, Result};

pub fn page_file_name(file_no: u64) -> String {
    format!("nvwal_mds_page_file_{file_no}")
}

pub struct PageFile {
    file: File,
    page_size: u64,
}

impl PageFile {
    fn open_existing(path: &Path, page_size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, page_size })
    }

    fn create_fresh(path: &Path, page_size: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).write(true).truncate(true).open(path)?;
        Ok(Self { file, page_size })
    }

    /// Truncates a possibly-torn trailing page left by a crash mid-append.
    fn repair(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        let complete_len = (len / self.page_size) * self.page_size;
        if complete_len != len {
            self.file.set_len(complete_len)?;
        }
        Ok(())
    }

    pub fn page_count(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / self.page_size)
    }

    /// Appends one full page, retrying on short writes, fsyncing once the
    /// whole page has landed so the caller can safely advance
    /// `paged_mds_epoch` in the control file afterward.
    pub fn append_page(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() as u64 != self.page_size {
            return Err(Error::Configuration("append_page buffer must equal page size"));
        }
        self.file.seek(SeekFrom::End(0))?;
        let mut written = 0usize;
        while written < buf.len() {
            match self.file.write(&buf[written..]) {
                Ok(0) => return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write appending mds page",
                ))),
                Ok(n) => written += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.file.sync_all()?;
        Ok(())
    }

    pub fn read_page(&mut self, page_no: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 != self.page_size {
            return Err(Error::Configuration("read_page buffer must equal page size"));
        }
        let offset = (page_no - 1) * self.page_size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn read_at(&mut self, file_offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(file_offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

/// Opens or creates the `num_files` page files for `mode`, returning
/// whether an existing instance was restarted.
pub fn init(
    root: &Path,
    mode: InitMode,
    num_files: u64,
    page_size: u64,
) -> Result<(Vec<PageFile>, bool)> {
    let mut files = Vec::with_capacity(num_files as usize);
    let mut did_restart = false;
    for file_no in 0..num_files {
        let path: PathBuf = root.join(page_file_name(file_no));
        let exists = path.exists();
        match mode {
            InitMode::Restart if !exists => {
                return Err(Error::Restart("mds page file missing on restart"));
            }
            InitMode::CreateTruncate => {
                let _ = std::fs::remove_file(&path);
            }
            _ => {}
        }
        let mut pf = if path.exists() {
            did_restart = true;
            PageFile::open_existing(&path, page_size)?
        } else {
            PageFile::create_fresh(&path, page_size)?
        };
        pf.repair()?;
        files.push(pf);
    }
    Ok((files, did_restart))
}
