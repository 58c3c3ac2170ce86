//! The in-memory key directory and its reconstruction.
//!
//! On open the keydir is rebuilt from whichever source is cheapest:
//! a fresh `keydir` snapshot file if one exists, otherwise a scan of
//! the directory's hint and data files. Hint files shadow the data
//! file with the same stem, so merged segments rebuild without reading
//! their values. Read-only handles persist the scan result back as a
//! snapshot so later readers can skip the work.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use log::debug;

use crate::error::Result;
use crate::recfmt::{self, KeyDirEntry, DATA_EXT, HINT_EXT};
use crate::sio;

/// Map from key to the location of its latest value.
pub type KeyDir = BTreeMap<Vec<u8>, KeyDirEntry>;

/// Name of the persisted keydir snapshot inside the datastore
/// directory.
pub const KEYDIR_FILE: &str = "keydir";

/// Whether the keydir may be persisted for other processes. Writers
/// keep theirs private; readers share what they rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    Private,
    Shared,
}

/// Builds the keydir for the datastore directory at `dir`.
pub fn build(dir: &Path, privacy: Privacy) -> Result<KeyDir> {
    if let Some(keydir) = build_from_snapshot(dir)? {
        debug!("keydir restored from snapshot ({} keys)", keydir.len());
        return Ok(keydir);
    }

    let keydir = build_from_segments(dir)?;
    debug!("keydir rebuilt from segments ({} keys)", keydir.len());

    if privacy == Privacy::Shared {
        // Best-effort: a failed snapshot only costs the next reader a
        // rescan.
        if let Err(e) = share(dir, &keydir) {
            debug!("keydir snapshot not persisted: {e}");
        }
    }
    Ok(keydir)
}

/// Snapshot fast path. Returns `None` when there is no snapshot or the
/// directory has been modified since it was written.
fn build_from_snapshot(dir: &Path) -> Result<Option<KeyDir>> {
    let snapshot_path = dir.join(KEYDIR_FILE);
    let data = match fs::read(&snapshot_path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if is_stale(dir, &snapshot_path)? {
        return Ok(None);
    }

    let mut keydir = KeyDir::new();
    let mut pos = 0;
    while pos < data.len() {
        let (key, entry, len) = recfmt::decode_keydir(&data[pos..])?;
        keydir.insert(key, entry);
        pos += len;
    }
    Ok(Some(keydir))
}

// The snapshot is stale once any writer has touched the directory after
// it was written. Equal mtimes keep a snapshot written in the same
// filesystem-timestamp tick as the last change usable.
fn is_stale(dir: &Path, snapshot: &Path) -> Result<bool> {
    let dir_mtime = fs::metadata(dir)?.modified()?;
    let snapshot_mtime = fs::metadata(snapshot)?.modified()?;
    Ok(dir_mtime > snapshot_mtime)
}

fn build_from_segments(dir: &Path) -> Result<KeyDir> {
    let mut keydir = KeyDir::new();
    for name in hint_files(dir)? {
        parse_hint_file(dir, &name, &mut keydir)?;
    }
    for name in unshadowed_data_files(dir)? {
        parse_data_file(dir, &name, &mut keydir)?;
    }
    Ok(keydir)
}

/// Non-hidden `.hint` files, name-sorted. Hint files are parsed before
/// data files: hint entries land unconditionally, and the data scan's
/// timestamp comparison then lets newer live records win over them.
fn hint_files(dir: &Path) -> Result<Vec<String>> {
    let mut hints: Vec<String> = visible_files(dir)?
        .into_iter()
        .filter(|name| name.ends_with(HINT_EXT))
        .collect();
    hints.sort();
    Ok(hints)
}

/// Non-hidden `.data` files without a hint sibling of the same stem,
/// name-sorted. A hint file shadows its data sibling entirely.
fn unshadowed_data_files(dir: &Path) -> Result<Vec<String>> {
    let names = visible_files(dir)?;
    let hint_stems: HashSet<&str> = names
        .iter()
        .filter_map(|name| name.strip_suffix(HINT_EXT))
        .collect();

    let mut data: Vec<String> = names
        .iter()
        .filter(|name| match name.strip_suffix(DATA_EXT) {
            Some(stem) => !hint_stems.contains(stem),
            None => false,
        })
        .cloned()
        .collect();
    data.sort();
    Ok(data)
}

/// File names in `dir`, minus hidden entries (the lock file) and
/// non-segment files such as the snapshot.
fn visible_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    Ok(names)
}

fn parse_hint_file(dir: &Path, name: &str, keydir: &mut KeyDir) -> Result<()> {
    let data = fs::read(dir.join(name))?;
    let stem = name.strip_suffix(HINT_EXT).unwrap_or(name);
    let file_id = format!("{stem}{DATA_EXT}");

    let mut pos = 0;
    while pos < data.len() {
        let (key, mut entry, len) = recfmt::decode_hint(&data[pos..])?;
        entry.file_id = file_id.clone();
        keydir.insert(key, entry);
        pos += len;
    }
    Ok(())
}

fn parse_data_file(dir: &Path, name: &str, keydir: &mut KeyDir) -> Result<()> {
    let data = fs::read(dir.join(name))?;

    let mut pos = 0;
    while pos < data.len() {
        let (record, len) = recfmt::decode_data(&data[pos..])?;
        let newer = keydir
            .get(&record.key)
            .map_or(true, |old| old.timestamp < record.timestamp);
        if newer {
            let entry = KeyDirEntry {
                file_id: name.to_string(),
                value_offset: pos as u32,
                value_size: record.value.len() as u32,
                timestamp: record.timestamp,
            };
            keydir.insert(record.key, entry);
        }
        pos += len;
    }
    Ok(())
}

/// Persists the keydir as a snapshot, truncating any previous one.
fn share(dir: &Path, keydir: &KeyDir) -> Result<()> {
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).truncate(true);
    let mut file = sio::File::open_with(dir.join(KEYDIR_FILE), &opts)?;

    for (key, entry) in keydir {
        file.write_all(&recfmt::encode_keydir(key, entry)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{AppendFile, AppendKind};

    fn write_segment(dir: &Path, records: &[(&[u8], &[u8], i64)]) -> String {
        let mut file = AppendFile::new(dir, AppendKind::Active, false);
        for (key, value, ts) in records {
            file.write_data(key, value, *ts).unwrap();
        }
        file.name().to_string()
    }

    #[test]
    fn test_build_from_data_scan_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let name = write_segment(
            dir.path(),
            &[(b"k", b"old", 1), (b"k", b"new", 2), (b"other", b"x", 1)],
        );

        let keydir = build(dir.path(), Privacy::Private).unwrap();
        assert_eq!(keydir.len(), 2);
        let entry = &keydir[b"k".as_slice()];
        assert_eq!(entry.file_id, name);
        assert_eq!(entry.timestamp, 2);
        assert_eq!(entry.value_size, 3);
    }

    #[test]
    fn test_hint_file_shadows_its_data_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let mut merge = AppendFile::new(dir.path(), AppendKind::Merge, false);
        let offset = merge.write_data(b"k", b"merged", 5).unwrap();
        let entry = KeyDirEntry {
            file_id: merge.name().to_string(),
            value_offset: offset,
            value_size: 6,
            timestamp: 5,
        };
        merge.write_hint(b"k", &entry).unwrap();
        let merge_name = merge.name().to_string();
        drop(merge);

        // Corrupt the data file: if the scan honored the hint shadow it
        // never decodes the data sibling.
        let data_path = dir.path().join(&merge_name);
        let mut bytes = fs::read(&data_path).unwrap();
        bytes[6] ^= 0xff;
        fs::write(&data_path, bytes).unwrap();

        let keydir = build(dir.path(), Privacy::Private).unwrap();
        assert_eq!(keydir[b"k".as_slice()], entry);
    }

    #[test]
    fn test_newer_data_records_win_over_hint_entries() {
        let dir = tempfile::tempdir().unwrap();

        // A merged segment with a hint for `k` at timestamp 5.
        let mut merge = AppendFile::new(dir.path(), AppendKind::Merge, false);
        let offset = merge.write_data(b"k", b"merged", 5).unwrap();
        let hint_entry = KeyDirEntry {
            file_id: merge.name().to_string(),
            value_offset: offset,
            value_size: 6,
            timestamp: 5,
        };
        merge.write_hint(b"k", &hint_entry).unwrap();
        drop(merge);

        // A later live write to `k` in a plain data segment.
        let live_name = write_segment(dir.path(), &[(b"k", b"live", 9)]);

        let keydir = build(dir.path(), Privacy::Private).unwrap();
        let entry = &keydir[b"k".as_slice()];
        assert_eq!(entry.file_id, live_name);
        assert_eq!(entry.timestamp, 9);
    }

    #[test]
    fn test_shared_build_persists_snapshot_and_fast_path_reads_it() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), &[(b"a", b"1", 1), (b"b", b"2", 2)]);

        let scanned = build(dir.path(), Privacy::Shared).unwrap();
        assert!(dir.path().join(KEYDIR_FILE).exists());

        let restored = build_from_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(restored, scanned);
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), &[(b"a", b"1", 1)]);
        build(dir.path(), Privacy::Shared).unwrap();

        // Touch the directory: any new file makes the snapshot stale.
        // Filesystem mtimes can be coarse, so force the ordering.
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_segment(dir.path(), &[(b"b", b"2", 2)]);

        let snapshot_mtime = fs::metadata(dir.path().join(KEYDIR_FILE))
            .unwrap()
            .modified()
            .unwrap();
        let dir_mtime = fs::metadata(dir.path()).unwrap().modified().unwrap();
        if dir_mtime > snapshot_mtime {
            assert_eq!(build_from_snapshot(dir.path()).unwrap(), None);
        }

        // Either way the full build must see both keys.
        let keydir = build(dir.path(), Privacy::Private).unwrap();
        assert_eq!(keydir.len(), 2);
    }

    #[test]
    fn test_corrupt_data_file_surfaces_at_build() {
        let dir = tempfile::tempdir().unwrap();
        let name = write_segment(dir.path(), &[(b"k", b"v", 1)]);

        let path = dir.path().join(name);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            build(dir.path(), Privacy::Private),
            Err(crate::error::Error::Corruption)
        ));
    }
}
