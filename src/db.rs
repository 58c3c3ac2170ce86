//! The store facade.
//!
//! `Caskdb` composes the directory manager, the active append file and
//! the keydir into the public key-value API. One process opens the
//! datastore read-write and holds the exclusive directory lock; any
//! number of other processes open it read-only under shared locks.
//! Within a process the handle is safe to share across threads:
//! readers run concurrently, writers serialize on the handle's
//! reader-writer lock.

use std::fs;
use std::path::Path;
use std::sync::RwLock;

use log::{debug, info};

use crate::datastore::{self, AppendFile, AppendKind, DataStore, LockMode, TOMBSTONE};
use crate::error::{Error, Result};
use crate::keydir::{self, KeyDir, Privacy, KEYDIR_FILE};
use crate::recfmt::KeyDirEntry;

/// Configuration options accepted by [`Caskdb::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOpt {
    /// Open without write permission (the default).
    ReadOnly,
    /// Open with exclusive write permission.
    ReadWrite,
    /// Flush every put to disk before it returns.
    SyncOnPut,
    /// Leave flushing to explicit [`Caskdb::sync`] calls (the default).
    SyncOnDemand,
}

#[derive(Debug, Clone, Copy)]
struct Options {
    read_write: bool,
    sync_on_put: bool,
}

fn parse_opts(opts: &[ConfigOpt]) -> Options {
    let mut parsed = Options {
        read_write: false,
        sync_on_put: false,
    };
    for opt in opts {
        match opt {
            ConfigOpt::ReadWrite => parsed.read_write = true,
            ConfigOpt::SyncOnPut => parsed.sync_on_put = true,
            ConfigOpt::ReadOnly | ConfigOpt::SyncOnDemand => {}
        }
    }
    parsed
}

/// A Bitcask-style key-value store.
///
/// Writes append to immutable-once-rotated segment files; an in-memory
/// keydir maps each live key to the location of its latest value, so a
/// point read costs one seek.
///
/// # Examples
///
/// ```no_run
/// use caskdb::{Caskdb, ConfigOpt};
///
/// # fn main() -> caskdb::Result<()> {
/// let db = Caskdb::open("my_store", &[ConfigOpt::ReadWrite])?;
///
/// db.put(b"key".to_vec(), b"value".to_vec())?;
/// assert_eq!(db.get(b"key")?, b"value");
///
/// db.delete(b"key".to_vec())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Caskdb {
    options: Options,
    store: DataStore,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    keydir: KeyDir,
    active: Option<AppendFile>,
}

impl Caskdb {
    /// Opens the datastore directory at `path`.
    ///
    /// A read-write open acquires the exclusive directory lock and
    /// creates the directory if it does not exist; a read-only open
    /// acquires a shared lock and fails if the directory is missing.
    ///
    /// # Errors
    ///
    /// * `Error::AccessDenied` if the directory lock is held in a
    ///   conflicting mode.
    /// * `Error::Corruption` if keydir reconstruction hits a record
    ///   that fails its checksum.
    pub fn open(path: impl AsRef<Path>, opts: &[ConfigOpt]) -> Result<Self> {
        let options = parse_opts(opts);
        let (privacy, lock_mode) = if options.read_write {
            (Privacy::Private, LockMode::Exclusive)
        } else {
            (Privacy::Shared, LockMode::Shared)
        };

        let store = DataStore::open(path, lock_mode)?;
        let keydir = keydir::build(store.path(), privacy)?;
        let active = options
            .read_write
            .then(|| AppendFile::new(store.path(), AppendKind::Active, options.sync_on_put));

        info!(
            "opened datastore at {} with {} keys",
            store.path().display(),
            keydir.len()
        );
        Ok(Self {
            options,
            store,
            inner: RwLock::new(Inner { keydir, active }),
        })
    }

    /// Retrieves the value associated with `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` when the key has no entry or its
    /// stored value is the deletion tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::InvalidEmptyKey);
        }

        let inner = self.inner.read()?;
        let entry = inner.keydir.get(key).ok_or(Error::KeyNotFound)?;
        self.store
            .read_value_at(&entry.file_id, key, entry.value_offset, entry.value_size)
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `Error::RequireWrite` on a read-only handle.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if !self.options.read_write {
            return Err(Error::RequireWrite);
        }
        validate_pair(&key, &value)?;

        let mut inner = self.inner.write()?;
        inner.append(key, &value)
    }

    /// Removes `key` by writing a tombstone record.
    ///
    /// # Errors
    ///
    /// * `Error::RequireWrite` on a read-only handle.
    /// * `Error::KeyNotFound` when the key is absent or already
    ///   deleted.
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        if !self.options.read_write {
            return Err(Error::RequireWrite);
        }
        if key.is_empty() {
            return Err(Error::InvalidEmptyKey);
        }

        let mut inner = self.inner.write()?;
        // The existence and tombstone checks go through the directory
        // manager directly; calling `get` here would re-enter the
        // handle lock.
        let entry = inner.keydir.get(&key).ok_or(Error::KeyNotFound)?;
        self.store
            .read_value_at(&entry.file_id, &key, entry.value_offset, entry.value_size)?;
        inner.append(key, TOMBSTONE)
    }

    /// All keys currently present in the keydir, in unspecified order.
    /// Keys whose latest record is a tombstone may still appear until
    /// the next merge.
    pub fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.read()?;
        Ok(inner.keydir.keys().cloned().collect())
    }

    /// Folds `f` over every live key-value pair.
    ///
    /// Keys whose stored value turns out to be a tombstone are skipped;
    /// any other read failure aborts the fold.
    pub fn fold<A, F>(&self, mut f: F, mut acc: A) -> Result<A>
    where
        F: FnMut(&[u8], &[u8], A) -> A,
    {
        let inner = self.inner.read()?;
        for (key, entry) in &inner.keydir {
            match self
                .store
                .read_value_at(&entry.file_id, key, entry.value_offset, entry.value_size)
            {
                Ok(value) => acc = f(key.as_slice(), value.as_slice(), acc),
                Err(Error::KeyNotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(acc)
    }

    /// Compacts the datastore: rewrites the latest value of every key
    /// living outside the active segment into fresh merge segments
    /// (with paired hint files), swaps in a keydir pointing at them,
    /// and deletes the superseded segment files. Deleted keys are
    /// dropped for good.
    ///
    /// Runs on the caller's thread and holds the writer lock for
    /// everything but the final unlink step.
    ///
    /// # Errors
    ///
    /// Returns `Error::RequireWrite` on a read-only handle. Any read or
    /// write failure aborts the merge with the lock released; merge
    /// segments written so far stay on disk and are rescanned as plain
    /// data on the next open.
    pub fn merge(&self) -> Result<()> {
        if !self.options.read_write {
            return Err(Error::RequireWrite);
        }

        let mut inner = self.inner.write()?;
        let active_name = match inner.active.as_ref() {
            Some(active) => active.name().to_string(),
            None => String::new(),
        };
        let old_files = self.list_old_files(&active_name)?;

        let mut merge_file = AppendFile::new(self.store.path(), AppendKind::Merge, false);
        let mut new_keydir = KeyDir::new();
        for (key, entry) in &inner.keydir {
            if entry.file_id == active_name {
                new_keydir.insert(key.clone(), entry.clone());
                continue;
            }
            match self.merge_write(&mut merge_file, key, entry) {
                Ok(new_entry) => {
                    new_keydir.insert(key.clone(), new_entry);
                }
                // The latest record was a tombstone: the key dies here.
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        merge_file.sync()?;
        inner.keydir = new_keydir;
        drop(inner);

        self.delete_old_files(&old_files)?;
        info!("merge removed {} old segment files", old_files.len());
        Ok(())
    }

    /// Flushes the active segment to disk.
    ///
    /// # Errors
    ///
    /// Returns `Error::RequireWrite` on a read-only handle.
    pub fn sync(&self) -> Result<()> {
        if !self.options.read_write {
            return Err(Error::RequireWrite);
        }

        let inner = self.inner.write()?;
        if let Some(active) = inner.active.as_ref() {
            active.sync()?;
        }
        Ok(())
    }

    /// Closes the store. Equivalent to dropping the handle: the active
    /// segment is flushed best-effort and the directory lock released.
    pub fn close(self) {}

    /// Every non-hidden file that is neither the active segment nor the
    /// keydir snapshot; these are the files a completed merge deletes.
    fn list_old_files(&self, active_name: &str) -> Result<Vec<String>> {
        let mut old_files = Vec::new();
        for entry in fs::read_dir(self.store.path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') && name != active_name && name != KEYDIR_FILE {
                old_files.push(name);
            }
        }
        Ok(old_files)
    }

    /// Rewrites one live entry into the merge segment and emits its
    /// hint record. Fails with `Error::KeyNotFound` when the stored
    /// value is a tombstone.
    fn merge_write(
        &self,
        merge_file: &mut AppendFile,
        key: &[u8],
        entry: &KeyDirEntry,
    ) -> Result<KeyDirEntry> {
        let value =
            self.store
                .read_value_at(&entry.file_id, key, entry.value_offset, entry.value_size)?;

        let timestamp = datastore::timestamp_micros()?;
        let offset = merge_file.write_data(key, &value, timestamp)?;
        let new_entry = KeyDirEntry {
            file_id: merge_file.name().to_string(),
            value_offset: offset,
            value_size: value.len() as u32,
            timestamp,
        };
        merge_file.write_hint(key, &new_entry)?;
        Ok(new_entry)
    }

    fn delete_old_files(&self, files: &[String]) -> Result<()> {
        for name in files {
            fs::remove_file(self.store.path().join(name))?;
            debug!("deleted merged segment {name}");
        }
        Ok(())
    }
}

impl Inner {
    /// Appends one record and points the keydir at it. The caller holds
    /// the write guard; the timestamp is taken here, inside the
    /// critical section, so timestamp order matches commit order.
    fn append(&mut self, key: Vec<u8>, value: &[u8]) -> Result<()> {
        let active = self.active.as_mut().ok_or(Error::RequireWrite)?;

        let timestamp = datastore::timestamp_micros()?;
        let offset = active.write_data(&key, value, timestamp)?;
        self.keydir.insert(
            key,
            KeyDirEntry {
                file_id: active.name().to_string(),
                value_offset: offset,
                value_size: value.len() as u32,
                timestamp,
            },
        );
        Ok(())
    }
}

fn validate_pair(key: &[u8], value: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidEmptyKey);
    }
    if value.is_empty() {
        return Err(Error::InvalidEmptyValue);
    }
    if key.len() > u16::MAX as usize {
        return Err(Error::KeyTooLarge { len: key.len() });
    }
    if value.len() > u32::MAX as usize {
        return Err(Error::ValueTooLarge { len: value.len() });
    }
    Ok(())
}

impl Drop for Caskdb {
    fn drop(&mut self) {
        if self.options.read_write {
            if let Ok(inner) = self.inner.read() {
                if let Some(active) = inner.active.as_ref() {
                    let _ = active.sync();
                }
            }
        }
        // The directory lock is released by the DataStore drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opts_defaults() {
        let opts = parse_opts(&[]);
        assert!(!opts.read_write);
        assert!(!opts.sync_on_put);
    }

    #[test]
    fn test_parse_opts_read_write_and_sync() {
        let opts = parse_opts(&[ConfigOpt::ReadWrite, ConfigOpt::SyncOnPut]);
        assert!(opts.read_write);
        assert!(opts.sync_on_put);
    }

    #[test]
    fn test_validate_pair_limits() {
        assert!(matches!(
            validate_pair(b"", b"v"),
            Err(Error::InvalidEmptyKey)
        ));
        assert!(matches!(
            validate_pair(b"k", b""),
            Err(Error::InvalidEmptyValue)
        ));
        let long_key = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            validate_pair(&long_key, b"v"),
            Err(Error::KeyTooLarge { .. })
        ));
        assert!(validate_pair(b"k", b"v").is_ok());
    }
}
