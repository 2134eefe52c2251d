//! Bitmap type
//!
//! Bits are stored in fixed 1024-byte segments in the sub-key column family;
//! the sub-key is the decimal byte offset of the segment under the key's
//! current version. The metadata `size` tracks the bit-length ceiling
//! (always a multiple of 8) and only ever grows. A key holding a plain
//! string is served too, operating directly on the string payload.

use crate::batch::{put_log_data, WriteBatchLogData};
use crate::database::Database;
use crate::engine::Storage;
use crate::metadata::{encode_internal_key, Metadata, RedisType};
use crate::string::STRING_HEADER_SIZE;
use crate::{Error, Result, CF_DEFAULT, CF_METADATA};
use rocksdb::WriteBatch;
use std::sync::Arc;

pub const BITMAP_SEGMENT_BYTES: usize = 1024;
pub const BITMAP_SEGMENT_BITS: usize = BITMAP_SEGMENT_BYTES * 8;

/// What the metadata record under a bitmap operation turned out to hold
enum BitmapValue {
    /// A live bitmap record
    Bitmap(Metadata),
    /// A string record; operations fall through to its payload
    String(Vec<u8>),
}

pub struct Bitmap {
    db: Database,
}

impl Bitmap {
    pub fn new(storage: Arc<Storage>, namespace: &str) -> Self {
        Self {
            db: Database::new(storage, namespace),
        }
    }

    pub fn is_empty_segment(segment: &[u8]) -> bool {
        segment.iter().all(|&b| b == 0)
    }

    /// MSB-first bit test inside a raw value; out-of-range offsets read 0
    pub fn get_bit_from_value_and_offset(value: &[u8], offset: u32) -> bool {
        let byte_index = (offset / 8) as usize;
        byte_index < value.len() && value[byte_index] & (1 << (7 - offset % 8)) != 0
    }

    fn get_metadata(&self, ns_key: &[u8]) -> Result<BitmapValue> {
        let value = self.db.get_raw_metadata(ns_key)?.ok_or(Error::NotFound)?;
        let metadata = Metadata::decode(&value)?;
        if metadata.expired() {
            return Err(Error::NotFound);
        }
        match metadata.redis_type() {
            RedisType::Bitmap => Ok(BitmapValue::Bitmap(metadata)),
            RedisType::String => Ok(BitmapValue::String(value[STRING_HEADER_SIZE..].to_vec())),
            _ => Err(Error::WrongType),
        }
    }

    fn fetch_segment(&self, ns_key: &[u8], version: u64, segment_index: usize) -> Result<Vec<u8>> {
        let storage = self.db.storage();
        let db = storage.db()?;
        let cf = storage.cf_handle(&db, CF_DEFAULT)?;
        let snapshot = db.snapshot();
        let sub_key = segment_sub_key(ns_key, version, segment_index);
        Ok(snapshot.get_cf(cf, &sub_key)?.unwrap_or_default())
    }

    pub fn get_bit(&self, user_key: &[u8], offset: u32) -> Result<bool> {
        let ns_key = self.db.append_namespace_prefix(user_key);
        let metadata = match self.get_metadata(&ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        match metadata {
            BitmapValue::String(payload) => {
                Ok(Self::get_bit_from_value_and_offset(&payload, offset))
            }
            BitmapValue::Bitmap(metadata) => {
                let segment_index = offset as usize / BITMAP_SEGMENT_BITS;
                let segment = self.fetch_segment(&ns_key, metadata.version, segment_index)?;
                let byte_index = (offset as usize % BITMAP_SEGMENT_BITS) / 8;
                Ok(byte_index < segment.len()
                    && segment[byte_index] & (1 << (7 - offset % 8)) != 0)
            }
        }
    }

    /// Read-modify-write of one bit under the key lock; returns the old bit
    pub fn set_bit(&self, user_key: &[u8], offset: u32, new_bit: bool) -> Result<bool> {
        let ns_key = self.db.append_namespace_prefix(user_key);
        let _guard = self.db.storage().lock_manager().lock(&ns_key);

        match self.get_metadata(&ns_key) {
            Ok(BitmapValue::String(payload)) => {
                self.set_bit_on_string(&ns_key, payload, offset, new_bit)
            }
            Ok(BitmapValue::Bitmap(metadata)) => {
                self.set_bit_on_segments(&ns_key, metadata, offset, new_bit)
            }
            Err(Error::NotFound) => {
                self.set_bit_on_segments(&ns_key, Metadata::new(RedisType::Bitmap), offset, new_bit)
            }
            Err(e) => Err(e),
        }
    }

    fn set_bit_on_segments(
        &self,
        ns_key: &[u8],
        mut metadata: Metadata,
        offset: u32,
        new_bit: bool,
    ) -> Result<bool> {
        let segment_index = offset as usize / BITMAP_SEGMENT_BITS;
        let mut segment = self.fetch_segment(ns_key, metadata.version, segment_index)?;
        let byte_index = (offset as usize % BITMAP_SEGMENT_BITS) / 8;
        if segment.len() <= byte_index {
            segment.resize(byte_index + 1, 0);
        }
        let mask = 1u8 << (7 - offset % 8);
        let old_bit = segment[byte_index] & mask != 0;
        if new_bit {
            segment[byte_index] |= mask;
        } else {
            segment[byte_index] &= !mask;
        }

        let bit_len = ((u64::from(offset) / 8 + 1) * 8).min(u64::from(u32::MAX)) as u32;
        if metadata.size < bit_len {
            metadata.size = bit_len;
        }

        let storage = self.db.storage();
        let db = storage.db()?;
        let default_cf = storage.cf_handle(&db, CF_DEFAULT)?;
        let metadata_cf = storage.cf_handle(&db, CF_METADATA)?;
        let mut batch = WriteBatch::default();
        put_log_data(
            &mut batch,
            &db,
            &WriteBatchLogData::with_args(RedisType::Bitmap, vec![b"setbit".to_vec()]),
        )?;
        batch.put_cf(
            default_cf,
            segment_sub_key(ns_key, metadata.version, segment_index),
            &segment,
        );
        batch.put_cf(metadata_cf, ns_key, metadata.encode());
        drop(db);
        storage.write(batch)?;
        Ok(old_bit)
    }

    fn set_bit_on_string(
        &self,
        ns_key: &[u8],
        mut payload: Vec<u8>,
        offset: u32,
        new_bit: bool,
    ) -> Result<bool> {
        let byte_index = (offset / 8) as usize;
        if payload.len() <= byte_index {
            payload.resize(byte_index + 1, 0);
        }
        let mask = 1u8 << (7 - offset % 8);
        let old_bit = payload[byte_index] & mask != 0;
        if new_bit {
            payload[byte_index] |= mask;
        } else {
            payload[byte_index] &= !mask;
        }

        let storage = self.db.storage();
        let db = storage.db()?;
        let cf = storage.cf_handle(&db, CF_METADATA)?;
        // keep the original flags and expiry, replace only the payload
        let header = self
            .db
            .get_raw_metadata(ns_key)?
            .map(|v| v[..STRING_HEADER_SIZE].to_vec())
            .ok_or(Error::NotFound)?;
        let mut value = header;
        value.extend_from_slice(&payload);
        let mut batch = WriteBatch::default();
        put_log_data(
            &mut batch,
            &db,
            &WriteBatchLogData::with_args(RedisType::String, vec![b"setbit".to_vec()]),
        )?;
        batch.put_cf(cf, ns_key, value);
        drop(db);
        storage.write(batch)?;
        Ok(old_bit)
    }

    /// Count set bits in the inclusive byte range `[start, stop]`; negative
    /// indices count from the end
    pub fn bit_count(&self, user_key: &[u8], start: i64, stop: i64) -> Result<u64> {
        let ns_key = self.db.append_namespace_prefix(user_key);
        let metadata = match self.get_metadata(&ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(0),
            Err(e) => return Err(e),
        };
        match metadata {
            BitmapValue::String(payload) => {
                let Some((start, stop)) = resolve_range(start, stop, payload.len() as i64) else {
                    return Ok(0);
                };
                Ok(payload[start..=stop]
                    .iter()
                    .map(|b| b.count_ones() as u64)
                    .sum())
            }
            BitmapValue::Bitmap(metadata) => {
                let total_bytes = (metadata.size / 8) as i64;
                let Some((start, stop)) = resolve_range(start, stop, total_bytes) else {
                    return Ok(0);
                };
                let mut count = 0u64;
                for segment_index in start / BITMAP_SEGMENT_BYTES..=stop / BITMAP_SEGMENT_BYTES {
                    let segment =
                        self.fetch_segment(&ns_key, metadata.version, segment_index)?;
                    if segment.is_empty() {
                        continue;
                    }
                    let segment_start = segment_index * BITMAP_SEGMENT_BYTES;
                    let from = start.max(segment_start) - segment_start;
                    let to = (stop.min(segment_start + segment.len() - 1))
                        .saturating_sub(segment_start);
                    if from >= segment.len() {
                        continue;
                    }
                    count += segment[from..=to]
                        .iter()
                        .map(|b| b.count_ones() as u64)
                        .sum::<u64>();
                }
                Ok(count)
            }
        }
    }

    /// First offset holding `bit` in the inclusive byte range, -1 when not
    /// found. Searching for 0 without an explicit stop returns the bit
    /// length when every stored bit is set.
    pub fn bit_pos(
        &self,
        user_key: &[u8],
        bit: bool,
        start: i64,
        stop: Option<i64>,
    ) -> Result<i64> {
        let stop_given = stop.is_some();
        let stop = stop.unwrap_or(-1);

        let ns_key = self.db.append_namespace_prefix(user_key);
        let metadata = match self.get_metadata(&ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(if bit { -1 } else { 0 }),
            Err(e) => return Err(e),
        };

        let first_in_byte = |byte: u8, base: usize| -> Option<i64> {
            for i in 0..8u32 {
                let is_set = byte & (1 << (7 - i)) != 0;
                if is_set == bit {
                    return Some((base * 8) as i64 + i64::from(i));
                }
            }
            None
        };

        match metadata {
            BitmapValue::String(payload) => {
                let Some((start, stop)) = resolve_range(start, stop, payload.len() as i64) else {
                    return Ok(-1);
                };
                for (index, &byte) in payload[start..=stop].iter().enumerate() {
                    if let Some(pos) = first_in_byte(byte, start + index) {
                        return Ok(pos);
                    }
                }
                if !bit && !stop_given {
                    return Ok(payload.len() as i64 * 8);
                }
                Ok(-1)
            }
            BitmapValue::Bitmap(metadata) => {
                let total_bytes = (metadata.size / 8) as i64;
                let Some((start, stop)) = resolve_range(start, stop, total_bytes) else {
                    return Ok(-1);
                };
                for segment_index in start / BITMAP_SEGMENT_BYTES..=stop / BITMAP_SEGMENT_BYTES {
                    let segment =
                        self.fetch_segment(&ns_key, metadata.version, segment_index)?;
                    let segment_start = segment_index * BITMAP_SEGMENT_BYTES;
                    let from = start.max(segment_start);
                    let to = stop.min(segment_start + BITMAP_SEGMENT_BYTES - 1);
                    for byte_index in from..=to {
                        // bytes beyond the stored segment read as zero
                        let byte = segment
                            .get(byte_index - segment_start)
                            .copied()
                            .unwrap_or(0);
                        if let Some(pos) = first_in_byte(byte, byte_index) {
                            return Ok(pos);
                        }
                    }
                }
                if !bit && !stop_given {
                    return Ok(i64::from(metadata.size));
                }
                Ok(-1)
            }
        }
    }
}

/// Redis-style inclusive byte range: negative indices from the end, clamped
/// to the value length; None when the range is empty
fn resolve_range(start: i64, stop: i64, len: i64) -> Option<(usize, usize)> {
    if len <= 0 {
        return None;
    }
    let mut start = if start < 0 { start + len } else { start };
    let mut stop = if stop < 0 { stop + len } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn segment_sub_key(ns_key: &[u8], version: u64, segment_index: usize) -> Vec<u8> {
    let byte_offset = segment_index * BITMAP_SEGMENT_BYTES;
    encode_internal_key(ns_key, byte_offset.to_string().as_bytes(), version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_config;
    use crate::string::RedisString;

    fn open_temp_bitmap() -> (Bitmap, Arc<Storage>, String) {
        let dir = format!("/tmp/redrock_bitmap_test_{}", rand::random::<u64>());
        let storage = Arc::new(Storage::new(test_config(&dir, false)));
        storage.open().unwrap();
        (Bitmap::new(storage.clone(), "ns"), storage, dir)
    }

    fn cleanup(storage: Arc<Storage>, dir: &str) {
        storage.close();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_set_and_get_bit() {
        let (bitmap, storage, dir) = open_temp_bitmap();
        assert!(!bitmap.get_bit(b"k", 7).unwrap());
        assert!(!bitmap.set_bit(b"k", 7, true).unwrap());
        assert!(bitmap.get_bit(b"k", 7).unwrap());
        assert!(!bitmap.get_bit(b"k", 6).unwrap());
        // idempotent after the first write
        assert!(bitmap.set_bit(b"k", 7, true).unwrap());
        assert!(bitmap.set_bit(b"k", 7, false).unwrap());
        assert!(!bitmap.get_bit(b"k", 7).unwrap());
        cleanup(storage, &dir);
    }

    #[test]
    fn test_set_bit_across_segments() {
        let (bitmap, storage, dir) = open_temp_bitmap();
        let offset = (BITMAP_SEGMENT_BITS * 3 + 13) as u32;
        assert!(!bitmap.set_bit(b"k", offset, true).unwrap());
        assert!(bitmap.get_bit(b"k", offset).unwrap());
        assert!(!bitmap.get_bit(b"k", offset - 1).unwrap());
        assert_eq!(bitmap.bit_count(b"k", 0, -1).unwrap(), 1);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_bit_count_ranges() {
        let (bitmap, storage, dir) = open_temp_bitmap();
        for offset in [0u32, 1, 9, 17, 8191, 8192] {
            bitmap.set_bit(b"k", offset, true).unwrap();
        }
        assert_eq!(bitmap.bit_count(b"k", 0, -1).unwrap(), 6);
        assert_eq!(bitmap.bit_count(b"k", 0, 0).unwrap(), 2);
        assert_eq!(bitmap.bit_count(b"k", 1, 1).unwrap(), 1);
        assert_eq!(bitmap.bit_count(b"k", 2, 2).unwrap(), 1);
        assert_eq!(bitmap.bit_count(b"k", -1, -1).unwrap(), 1);
        assert_eq!(bitmap.bit_count(b"k", 3, 2).unwrap(), 0);
        assert_eq!(bitmap.bit_count(b"missing", 0, -1).unwrap(), 0);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_bit_pos() {
        let (bitmap, storage, dir) = open_temp_bitmap();
        assert_eq!(bitmap.bit_pos(b"k", true, 0, None).unwrap(), -1);
        assert_eq!(bitmap.bit_pos(b"k", false, 0, None).unwrap(), 0);

        bitmap.set_bit(b"k", 13, true).unwrap();
        assert_eq!(bitmap.bit_pos(b"k", true, 0, None).unwrap(), 13);
        assert_eq!(bitmap.bit_pos(b"k", false, 0, None).unwrap(), 0);
        assert_eq!(bitmap.bit_pos(b"k", true, 1, None).unwrap(), 13);
        assert_eq!(bitmap.bit_pos(b"k", true, 2, None).unwrap(), -1);

        // every stored bit set, searching for 0 without a stop
        let bitmap2 = Bitmap::new(storage.clone(), "ns2");
        for offset in 0..8u32 {
            bitmap2.set_bit(b"full", offset, true).unwrap();
        }
        assert_eq!(bitmap2.bit_pos(b"full", false, 0, None).unwrap(), 8);
        assert_eq!(bitmap2.bit_pos(b"full", false, 0, Some(0)).unwrap(), -1);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_bitmap_over_string_payload() {
        let (bitmap, storage, dir) = open_temp_bitmap();
        let string = RedisString::new(storage.clone(), "ns");
        string.set(b"foo", b"bar").unwrap();

        // 'b' = 0x62 = 0110 0010
        assert!(!bitmap.get_bit(b"foo", 0).unwrap());
        assert!(bitmap.get_bit(b"foo", 1).unwrap());
        assert!(bitmap.get_bit(b"foo", 2).unwrap());

        // setting the last bit of 'b' turns it into 'c'
        assert!(!bitmap.set_bit(b"foo", 7, true).unwrap());
        assert_eq!(string.get(b"foo").unwrap(), Some(b"car".to_vec()));

        assert_eq!(
            bitmap.bit_count(b"foo", 0, -1).unwrap(),
            b"car".iter().map(|b| b.count_ones() as u64).sum::<u64>()
        );
        assert_eq!(bitmap.bit_pos(b"foo", true, 0, None).unwrap(), 1);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_helpers() {
        assert!(Bitmap::is_empty_segment(b""));
        assert!(Bitmap::is_empty_segment(&[0, 0, 0]));
        assert!(!Bitmap::is_empty_segment(&[0, 4, 0]));
        assert!(Bitmap::get_bit_from_value_and_offset(b"\x80", 0));
        assert!(!Bitmap::get_bit_from_value_and_offset(b"\x80", 1));
        assert!(!Bitmap::get_bit_from_value_and_offset(b"\x80", 100));
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(0, -1, 10), Some((0, 9)));
        assert_eq!(resolve_range(-2, -1, 10), Some((8, 9)));
        assert_eq!(resolve_range(0, 100, 10), Some((0, 9)));
        assert_eq!(resolve_range(5, 2, 10), None);
        assert_eq!(resolve_range(0, -1, 0), None);
        assert_eq!(resolve_range(-100, -50, 10), None);
    }
}
