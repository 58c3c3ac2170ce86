//! Retrying file I/O.
//!
//! Wraps `std::fs::File` so that short reads and writes are retried a
//! bounded number of times. Partial progress is accepted: every retry
//! resumes from the updated offset or the remaining slice. After
//! `MAX_ATTEMPTS` failed attempts the last error surfaces unchanged.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAX_ATTEMPTS: u32 = 5;

/// A file handle hardened against transient partial completions.
#[derive(Debug)]
pub struct File {
    inner: fs::File,
}

impl File {
    /// Opens an existing file read-only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            inner: fs::File::open(path)?,
        })
    }

    /// Opens a file with the given options.
    pub fn open_with(path: impl AsRef<Path>, opts: &OpenOptions) -> io::Result<Self> {
        Ok(Self {
            inner: opts.open(path)?,
        })
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    ///
    /// Running out of file is a short read and surfaces as
    /// `UnexpectedEof` once the remaining bytes cannot be produced.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        let mut attempts = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read: file ended before the record did",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) => {
                    attempts += 1;
                    if attempts == MAX_ATTEMPTS {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes the whole buffer at the current position.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        let mut attempts = 0;
        while written < buf.len() {
            match self.inner.write(&buf[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write: no progress",
                    ))
                }
                Ok(n) => written += n,
                Err(e) => {
                    attempts += 1;
                    if attempts == MAX_ATTEMPTS {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Flushes file contents and metadata to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.inner.sync_all()
    }
}
