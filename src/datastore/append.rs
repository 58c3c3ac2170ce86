//! Append files: the write end of a segment lineage.
//!
//! An append file owns no segment until the first write. Rotation
//! closes the current segment and opens a fresh one named by the
//! current microsecond clock; merge-kind append files rotate a paired
//! hint file alongside.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::recfmt::{self, KeyDirEntry, DATA_EXT, HINT_EXT};
use crate::sio;

/// Rotation threshold in bytes. A record is never appended to a segment
/// whose occupancy it would push past this bound; a record that exactly
/// fills the segment still fits.
pub const MAX_SEGMENT_SIZE: u64 = 10 * 1024;

/// Whether an append file serves live writes or a merge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendKind {
    Active,
    Merge,
}

/// The currently appendable segment of a datastore directory.
#[derive(Debug)]
pub struct AppendFile {
    dir: PathBuf,
    kind: AppendKind,
    sync_on_put: bool,
    name: String,
    data: Option<sio::File>,
    hint: Option<sio::File>,
    pos: u64,
}

impl AppendFile {
    pub fn new(dir: impl AsRef<Path>, kind: AppendKind, sync_on_put: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            kind,
            sync_on_put,
            name: String::new(),
            data: None,
            hint: None,
            pos: 0,
        }
    }

    /// Appends a data record, rotating first when no segment is open or
    /// the record would overflow the current one.
    ///
    /// Returns the record's start offset within the (possibly fresh)
    /// segment; the offset is what the keydir stores.
    pub fn write_data(&mut self, key: &[u8], value: &[u8], timestamp: i64) -> Result<u32> {
        let record = recfmt::encode_data(key, value, timestamp);
        if self.data.is_none() || self.pos + record.len() as u64 > MAX_SEGMENT_SIZE {
            self.rotate()?;
        }
        let offset = self.pos;
        let file = self
            .data
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::other("rotation left no open segment")))?;
        file.write_all(&record)?;
        if self.sync_on_put {
            file.sync()?;
        }
        self.pos = offset + record.len() as u64;
        Ok(offset as u32)
    }

    /// Appends a hint record. Meaningful only for merge-kind files;
    /// active files have no hint sibling and ignore the call.
    pub fn write_hint(&mut self, key: &[u8], entry: &KeyDirEntry) -> Result<()> {
        if let Some(hint) = self.hint.as_mut() {
            hint.write_all(&recfmt::encode_hint(key, entry))?;
        }
        Ok(())
    }

    /// Name of the current segment file, e.g. `1700000000000000.data`.
    /// Empty until the first write.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flushes the current segment to disk. No-op when nothing has been
    /// written yet.
    pub fn sync(&self) -> Result<()> {
        if let Some(data) = self.data.as_ref() {
            data.sync()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        // Dropping the handles closes the previous segment pair.
        self.data.take();
        self.hint.take();

        // The clock can tie with the segment being rotated away from on
        // fast back-to-back rotations; bump until the name is unused.
        let mut stem = super::timestamp_micros()?;
        while self.dir.join(format!("{stem}{DATA_EXT}")).exists() {
            stem += 1;
        }

        let mut opts = OpenOptions::new();
        opts.create(true).read(true).append(true);

        self.name = format!("{stem}{DATA_EXT}");
        self.data = Some(sio::File::open_with(self.dir.join(&self.name), &opts)?);
        if self.kind == AppendKind::Merge {
            let hint_name = format!("{stem}{HINT_EXT}");
            self.hint = Some(sio::File::open_with(self.dir.join(hint_name), &opts)?);
        }
        self.pos = 0;
        debug!("rotated to segment {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_opens_a_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = AppendFile::new(dir.path(), AppendKind::Active, false);
        assert_eq!(file.name(), "");

        let offset = file.write_data(b"k", b"v", 1).unwrap();
        assert_eq!(offset, 0);
        assert!(file.name().ends_with(DATA_EXT));
        assert!(dir.path().join(file.name()).exists());
    }

    #[test]
    fn test_record_exactly_filling_segment_fits() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = AppendFile::new(dir.path(), AppendKind::Active, false);

        // 18-byte header + 1-byte key + value sized to land exactly on
        // the threshold.
        let value = vec![0u8; MAX_SEGMENT_SIZE as usize - recfmt::DATA_HEADER_SIZE - 1];
        file.write_data(b"a", &value, 1).unwrap();
        let first = file.name().to_string();

        // Exactly full, not past it: no rotation happened yet, but the
        // next write must open a new segment.
        let offset = file.write_data(b"b", b"v", 2).unwrap();
        assert_eq!(offset, 0);
        assert_ne!(file.name(), first);
    }

    #[test]
    fn test_offsets_accumulate_within_a_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = AppendFile::new(dir.path(), AppendKind::Active, false);

        let first = file.write_data(b"k1", b"v1", 1).unwrap();
        let second = file.write_data(b"k2", b"v2", 2).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, (recfmt::DATA_HEADER_SIZE + 2 + 2) as u32);
    }

    #[test]
    fn test_merge_kind_opens_paired_hint_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = AppendFile::new(dir.path(), AppendKind::Merge, false);

        file.write_data(b"k", b"v", 1).unwrap();
        let entry = KeyDirEntry {
            file_id: file.name().to_string(),
            value_offset: 0,
            value_size: 1,
            timestamp: 1,
        };
        file.write_hint(b"k", &entry).unwrap();

        let stem = file.name().strip_suffix(DATA_EXT).unwrap();
        let hint_path = dir.path().join(format!("{stem}{HINT_EXT}"));
        assert!(hint_path.exists());
        assert!(std::fs::metadata(&hint_path).unwrap().len() > 0);
    }
}
