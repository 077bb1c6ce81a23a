//! The file interface file-backed and memory-mapped pages are loaded from and
//! written back to.

use crate::sync::mutex::Mutex;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::{AtomicBool, Ordering};
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// no space left on device
    NoSpace,
    /// file does not accept writes
    ReadOnly,
    /// the underlying device failed
    Io,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoSpace => write!(f, "no space left on device"),
            Self::ReadOnly => write!(f, "file is read-only"),
            Self::Io => write!(f, "input/output error"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// An open file. Implementations synchronize internally, so one file may be
/// shared by every page that maps it.
pub trait File: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were read.
    /// Reading at or past the end of the file reads nothing.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `offset`, growing the file if needed. Returns how many
    /// bytes were written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Current length in bytes.
    fn length(&self) -> u64;
}

/// A file held entirely in kernel memory.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    read_only: AtomicBool,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            read_only: AtomicBool::new(false),
        }
    }

    /// Refuse (or allow again) all writes.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    #[allow(clippy::cast_possible_truncation)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        trace!("memfile: read @ {} length {}", offset, buf.len());
        let data = self.data.lock();
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let offset = offset as usize; // fits into usize by check above
        let read_len = min(buf.len(), data.len() - offset);
        buf[..read_len].copy_from_slice(&data[offset..offset + read_len]);
        Ok(read_len)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        trace!("memfile: write @ {} length {}", offset, buf.len());
        if self.read_only.load(Ordering::Relaxed) {
            return Err(Error::ReadOnly);
        }
        if offset > (isize::MAX as u64).saturating_sub(buf.len() as u64) {
            return Err(Error::NoSpace);
        }
        let offset = offset as usize;
        let end = offset + buf.len();

        let mut data = self.data.lock();
        if end > data.len() {
            let extra = end - data.len();
            data.try_reserve(extra).map_err(|_| Error::NoSpace)?;
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn reads_stop_at_end_of_file() {
        let file = MemFile::new(b"hello world".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(6, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"world");
        assert_eq!(file.read_at(11, &mut buf), Ok(0));
        assert_eq!(file.read_at(100, &mut buf), Ok(0));
    }

    #[test]
    fn writes_grow_with_zeroes() {
        let file = MemFile::new(vec![1, 2]);
        assert_eq!(file.write_at(4, &[9, 9]), Ok(2));
        assert_eq!(file.contents(), [1, 2, 0, 0, 9, 9]);
        assert_eq!(file.length(), 6);
    }

    #[test]
    fn read_only_refuses_writes() {
        let file = MemFile::new(vec![7; 4]);
        file.set_read_only(true);
        assert_eq!(file.write_at(0, &[0]), Err(Error::ReadOnly));
        file.set_read_only(false);
        assert_eq!(file.write_at(0, &[0]), Ok(1));
        assert_eq!(file.contents(), [0, 7, 7, 7]);
    }
}
