// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Block device abstraction.
//!
//! Everything that touches a disk goes through [`BlockDev`], so the
//! whole stack can run against a plain file, a real block device, or an
//! in-memory buffer in tests.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use crate::{Error, Result};

/// Size in bytes of a disk sector.
pub const SECTOR_SIZE: usize = 512;

/// What a device reports about itself.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct BlockInfo {
    /// Writes allowed.
    pub read_write: bool,
    /// Sector size in bytes.
    pub sector_size: usize,
    /// Total size in sectors.
    pub size_sectors: u64,
}

/// A sectored device addressed by byte offset.
pub trait BlockDev: Send + Sync {
    fn get_info(&self) -> Result<BlockInfo>;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    /// Barrier: returns once previously written data is durable.
    fn sync(&self) -> Result<()>;
}

/// A device backed by a unix file or block device node.
pub struct FileBlockDev {
    file: std::fs::File,
    size: u64,
    read_write: bool,
}

impl FileBlockDev {
    /// Open a file or block device node. Size is taken from the seek
    /// end, which works for device nodes where metadata length is 0.
    pub fn open(path: &Path, read_write: bool) -> Result<FileBlockDev> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(read_write)
            .open(path)
            .map_err(|e| Error::Msg(format!("{}: {}", path.display(), e)))?;

        let size = file.seek(SeekFrom::End(0))?;

        Ok(FileBlockDev {
            file,
            size,
            read_write,
        })
    }
}

impl BlockDev for FileBlockDev {
    fn get_info(&self) -> Result<BlockInfo> {
        Ok(BlockInfo {
            read_write: self.read_write,
            sector_size: SECTOR_SIZE,
            size_sectors: self.size / SECTOR_SIZE as u64,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        if !self.read_write {
            return Err(Error::Msg("device is read-only".into()));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// An in-memory device for tests.
pub struct MemBlockDev {
    data: Mutex<Vec<u8>>,
    read_write: bool,
}

impl MemBlockDev {
    /// Create a zero-filled device. `size` must be a sector multiple.
    pub fn new(size: usize, read_write: bool) -> MemBlockDev {
        assert_eq!(size % SECTOR_SIZE, 0);
        MemBlockDev {
            data: Mutex::new(vec![0u8; size]),
            read_write,
        }
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let data = self.data.lock().unwrap();
        let end = offset as usize + len;
        if end > data.len() {
            return Err(Error::Msg(format!(
                "access beyond end of device: {} > {}",
                end,
                data.len()
            )));
        }
        Ok(offset as usize)
    }
}

impl BlockDev for MemBlockDev {
    fn get_info(&self) -> Result<BlockInfo> {
        let len = self.data.lock().unwrap().len();
        Ok(BlockInfo {
            read_write: self.read_write,
            sector_size: SECTOR_SIZE,
            size_sectors: (len / SECTOR_SIZE) as u64,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(offset, buf.len())?;
        let data = self.data.lock().unwrap();
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.read_write {
            return Err(Error::Msg("device is read-only".into()));
        }
        let start = self.check_range(offset, buf.len())?;
        let mut data = self.data.lock().unwrap();
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
