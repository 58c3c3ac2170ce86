//! Datastore directory management.
//!
//! A datastore is a directory of append-only segment files guarded by
//! an advisory lock on `.lck`: one exclusive writer, any number of
//! shared readers. The manager owns the lock for the lifetime of the
//! handle and reads records back from named segments.

mod append;

pub use append::{AppendFile, AppendKind, MAX_SEGMENT_SIZE};

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::debug;

use crate::error::{Error, Result};
use crate::recfmt;
use crate::sio;

/// Sentinel value marking deleted keys on disk. A record whose value
/// equals this byte sequence is semantically absent.
pub const TOMBSTONE: &[u8] = b"8890fc70294d02dbde257989e802451c2276be7fb177c3ca4399dc4728e4e1e0";

/// Name of the advisory lock file inside a datastore directory.
const LOCK_FILE: &str = ".lck";

/// How the directory lock is held: exclusive for read-write handles,
/// shared for read-only handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Handle on a datastore directory. Holds the advisory lock until
/// dropped.
#[derive(Debug)]
pub struct DataStore {
    path: PathBuf,
    lock: fs::File,
}

impl DataStore {
    /// Opens (and for exclusive mode, creates if absent) the datastore
    /// directory at `path` and acquires the advisory lock.
    ///
    /// # Errors
    ///
    /// * `Error::AccessDenied` if the lock is already held in a
    ///   conflicting mode.
    /// * The original not-found error when the directory is missing and
    ///   the mode is not exclusive.
    pub fn open(path: impl AsRef<Path>, mode: LockMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match fs::metadata(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound && mode == LockMode::Exclusive => {
                fs::create_dir_all(&path)?;
            }
            Err(e) => return Err(e.into()),
        }

        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.join(LOCK_FILE))?;
        match mode {
            LockMode::Exclusive => FileExt::try_lock_exclusive(&lock),
            LockMode::Shared => FileExt::try_lock_shared(&lock),
        }
        .map_err(|_| Error::AccessDenied)?;

        debug!("acquired {mode:?} lock on {}", path.display());
        Ok(Self { path, lock })
    }

    /// Reads the value stored for `key` at `(file_id, value_offset)`,
    /// validating the record checksum on the way.
    ///
    /// # Errors
    ///
    /// * `Error::KeyNotFound` if the stored value is the tombstone.
    /// * `Error::Corruption` if the record fails its checksum.
    pub fn read_value_at(
        &self,
        file_id: &str,
        key: &[u8],
        value_offset: u32,
        value_size: u32,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; recfmt::DATA_HEADER_SIZE + key.len() + value_size as usize];
        let mut file = sio::File::open(self.path.join(file_id))?;
        file.read_at(&mut buf, u64::from(value_offset))?;

        let (record, _) = recfmt::decode_data(&buf)?;
        if record.value == TOMBSTONE {
            return Err(Error::KeyNotFound);
        }
        Ok(record.value)
    }

    /// Path of the datastore directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        // Best-effort: the OS drops the lock with the descriptor anyway.
        let _ = FileExt::unlock(&self.lock);
    }
}

/// Current time in microseconds since the Unix epoch. Segment stems and
/// record timestamps both come from this clock.
pub(crate) fn timestamp_micros() -> Result<i64> {
    let micros = SystemTime::now().duration_since(UNIX_EPOCH)?.as_micros();
    Ok(i64::try_from(micros)?)
}
