//! On-disk record codecs.
//!
//! Three record shapes share the datastore directory, all little-endian
//! and packed:
//!
//! * data records (`.data` segments): crc32 + timestamp + sizes + key +
//!   value, with the checksum covering every byte after itself;
//! * hint records (`.hint` files written by merge): no checksum,
//!   corruption tolerance rides on the paired data file;
//! * keydir snapshot records (the `keydir` file): the numeric segment
//!   stem packed as a u64.
//!
//! These are pure functions over byte slices; no I/O happens here.

use crate::error::{Error, Result};

/// Data record header size: crc32 (4) + timestamp (8) + key size (2) +
/// value size (4).
pub const DATA_HEADER_SIZE: usize = 18;

/// Hint record header size: timestamp (8) + key size (2) + value size
/// (4) + value offset (4).
pub const HINT_HEADER_SIZE: usize = 18;

/// Keydir snapshot record header size: file id (8) + key size (2) +
/// value size (4) + value offset (4) + timestamp (8).
pub const KEYDIR_HEADER_SIZE: usize = 26;

/// Suffix of segment data files.
pub const DATA_EXT: &str = ".data";

/// Suffix of hint files paired with merge segments.
pub const HINT_EXT: &str = ".hint";

/// A decoded data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Write time in microseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Entry in the key directory mapping a key to its location on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDirEntry {
    /// Name of the segment file holding the record, e.g.
    /// `1700000000000000.data`.
    pub file_id: String,
    /// Offset of the record header within the segment file.
    pub value_offset: u32,
    /// Size of the value in bytes.
    pub value_size: u32,
    /// Timestamp when the entry was written, microseconds since epoch.
    pub timestamp: i64,
}

/// Encodes a data record. The checksum is computed last, over all bytes
/// after the checksum field itself.
pub fn encode_data(key: &[u8], value: &[u8], timestamp: i64) -> Vec<u8> {
    let mut buf = vec![0u8; DATA_HEADER_SIZE + key.len() + value.len()];
    buf[4..12].copy_from_slice(&(timestamp as u64).to_le_bytes());
    buf[12..14].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[14..18].copy_from_slice(&(value.len() as u32).to_le_bytes());
    buf[DATA_HEADER_SIZE..DATA_HEADER_SIZE + key.len()].copy_from_slice(key);
    buf[DATA_HEADER_SIZE + key.len()..].copy_from_slice(value);

    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decodes one data record from the front of `buf`, validating its
/// checksum. Returns the record and its encoded length.
///
/// A buffer too short for the lengths it declares fails with
/// [`Error::Corruption`], which is what a torn tail of a segment file
/// looks like.
pub fn decode_data(buf: &[u8]) -> Result<(DataRecord, usize)> {
    if buf.len() < DATA_HEADER_SIZE {
        return Err(Error::Corruption);
    }
    let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let timestamp = u64::from_le_bytes(buf[4..12].try_into().unwrap()) as i64;
    let key_size = u16::from_le_bytes(buf[12..14].try_into().unwrap()) as usize;
    let value_size = u32::from_le_bytes(buf[14..18].try_into().unwrap()) as usize;

    let record_len = DATA_HEADER_SIZE + key_size + value_size;
    if buf.len() < record_len {
        return Err(Error::Corruption);
    }
    if crc != crc32fast::hash(&buf[4..record_len]) {
        return Err(Error::Corruption);
    }

    let key = buf[DATA_HEADER_SIZE..DATA_HEADER_SIZE + key_size].to_vec();
    let value = buf[DATA_HEADER_SIZE + key_size..record_len].to_vec();
    Ok((
        DataRecord {
            key,
            value,
            timestamp,
        },
        record_len,
    ))
}

/// Encodes a hint record for `key` pointing into the merge segment
/// described by `entry`.
pub fn encode_hint(key: &[u8], entry: &KeyDirEntry) -> Vec<u8> {
    let mut buf = vec![0u8; HINT_HEADER_SIZE + key.len()];
    buf[0..8].copy_from_slice(&(entry.timestamp as u64).to_le_bytes());
    buf[8..10].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[10..14].copy_from_slice(&entry.value_size.to_le_bytes());
    buf[14..18].copy_from_slice(&entry.value_offset.to_le_bytes());
    buf[HINT_HEADER_SIZE..].copy_from_slice(key);
    buf
}

/// Decodes one hint record from the front of `buf`. The returned entry
/// carries no file id; the caller knows the paired data file.
pub fn decode_hint(buf: &[u8]) -> Result<(Vec<u8>, KeyDirEntry, usize)> {
    if buf.len() < HINT_HEADER_SIZE {
        return Err(Error::Corruption);
    }
    let timestamp = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as i64;
    let key_size = u16::from_le_bytes(buf[8..10].try_into().unwrap()) as usize;
    let value_size = u32::from_le_bytes(buf[10..14].try_into().unwrap());
    let value_offset = u32::from_le_bytes(buf[14..18].try_into().unwrap());

    let record_len = HINT_HEADER_SIZE + key_size;
    if buf.len() < record_len {
        return Err(Error::Corruption);
    }
    let key = buf[HINT_HEADER_SIZE..record_len].to_vec();
    Ok((
        key,
        KeyDirEntry {
            file_id: String::new(),
            value_offset,
            value_size,
            timestamp,
        },
        record_len,
    ))
}

/// Encodes a keydir snapshot record. The segment file name must have a
/// decimal numeric stem, which is packed as a u64.
pub fn encode_keydir(key: &[u8], entry: &KeyDirEntry) -> Result<Vec<u8>> {
    let stem = entry
        .file_id
        .strip_suffix(DATA_EXT)
        .unwrap_or(&entry.file_id);
    let file_id: u64 = stem.parse().map_err(|_| Error::InvalidFileName {
        name: entry.file_id.clone(),
    })?;

    let mut buf = vec![0u8; KEYDIR_HEADER_SIZE + key.len()];
    buf[0..8].copy_from_slice(&file_id.to_le_bytes());
    buf[8..10].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[10..14].copy_from_slice(&entry.value_size.to_le_bytes());
    buf[14..18].copy_from_slice(&entry.value_offset.to_le_bytes());
    buf[18..26].copy_from_slice(&(entry.timestamp as u64).to_le_bytes());
    buf[KEYDIR_HEADER_SIZE..].copy_from_slice(key);
    Ok(buf)
}

/// Decodes one keydir snapshot record from the front of `buf`,
/// reconstituting the full segment file name from the packed stem.
pub fn decode_keydir(buf: &[u8]) -> Result<(Vec<u8>, KeyDirEntry, usize)> {
    if buf.len() < KEYDIR_HEADER_SIZE {
        return Err(Error::Corruption);
    }
    let file_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let key_size = u16::from_le_bytes(buf[8..10].try_into().unwrap()) as usize;
    let value_size = u32::from_le_bytes(buf[10..14].try_into().unwrap());
    let value_offset = u32::from_le_bytes(buf[14..18].try_into().unwrap());
    let timestamp = u64::from_le_bytes(buf[18..26].try_into().unwrap()) as i64;

    let record_len = KEYDIR_HEADER_SIZE + key_size;
    if buf.len() < record_len {
        return Err(Error::Corruption);
    }
    let key = buf[KEYDIR_HEADER_SIZE..record_len].to_vec();
    Ok((
        key,
        KeyDirEntry {
            file_id: format!("{file_id}{DATA_EXT}"),
            value_offset,
            value_size,
            timestamp,
        },
        record_len,
    ))
}
