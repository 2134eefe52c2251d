//! Write-batch wire format support
//!
//! RocksDB serializes a write batch as a 12-byte header (sequence, count)
//! followed by tagged records. Scanning that serialization directly gives us
//! two things the engine needs without touching the memtable path: the set of
//! metadata keys a batch puts or deletes (consumed by cluster-mode slot
//! tracking before the atomic commit) and the ability to replay a follower's
//! raw batch into the correct column families.
//!
//! `WriteBatchLogData` is the side-channel payload describing the intent of a
//! batch (Redis type plus optional arguments). It rides inside the batch as a
//! put under a reserved key in the `pubsub` column family, whose compaction
//! filter collects every record immediately, so the payload reaches the WAL
//! (and therefore replication consumers) without ever accumulating on disk.

use crate::metadata::{extract_namespace_key, RedisType};
use crate::{Error, Result, CF_ID_METADATA, CF_ID_PUBSUB, COLUMN_FAMILY_NAMES};
use rocksdb::{WriteBatch, DB};

/// Reserved key carrying encoded `WriteBatchLogData` in the pubsub column family
pub const LOG_DATA_KEY: &[u8] = b"\x00_log_data_";

// Record tags of the write-batch serialization.
const TYPE_DELETION: u8 = 0x0;
const TYPE_VALUE: u8 = 0x1;
const TYPE_LOG_DATA: u8 = 0x3;
const TYPE_CF_DELETION: u8 = 0x4;
const TYPE_CF_VALUE: u8 = 0x5;
const TYPE_SINGLE_DELETION: u8 = 0x7;
const TYPE_CF_SINGLE_DELETION: u8 = 0x8;
const TYPE_CF_RANGE_DELETION: u8 = 0xE;
const TYPE_RANGE_DELETION: u8 = 0xF;

const BATCH_HEADER_SIZE: usize = 12;

/// Intent payload attached to write batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatchLogData {
    redis_type: RedisType,
    args: Vec<Vec<u8>>,
}

impl WriteBatchLogData {
    pub fn new(redis_type: RedisType) -> Self {
        Self {
            redis_type,
            args: Vec::new(),
        }
    }

    pub fn with_args(redis_type: RedisType, args: Vec<Vec<u8>>) -> Self {
        Self { redis_type, args }
    }

    pub fn redis_type(&self) -> RedisType {
        self.redis_type
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// One byte type tag, then a length-prefixed sequence of strings
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.redis_type as u8);
        out.extend_from_slice(&(self.args.len() as u32).to_le_bytes());
        for arg in &self.args {
            out.extend_from_slice(&(arg.len() as u32).to_le_bytes());
            out.extend_from_slice(arg);
        }
        out
    }

    /// Rejects any buffer that does not decode to exactly its full length
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let fail = || Error::InvalidArgument("malformed write batch log data".to_string());
        if blob.len() < 5 {
            return Err(fail());
        }
        let redis_type = RedisType::from_u8(blob[0]);
        let count = u32::from_le_bytes([blob[1], blob[2], blob[3], blob[4]]) as usize;
        let mut pos = 5;
        let mut args = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let len_bytes = blob.get(pos..pos + 4).ok_or_else(fail)?;
            let len =
                u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                    as usize;
            pos += 4;
            let arg = blob.get(pos..pos + len).ok_or_else(fail)?;
            pos += len;
            args.push(arg.to_vec());
        }
        if pos != blob.len() {
            return Err(fail());
        }
        Ok(Self { redis_type, args })
    }
}

/// Attach a log-data payload to a batch. Counts as one logical operation.
pub fn put_log_data(batch: &mut WriteBatch, db: &DB, log_data: &WriteBatchLogData) -> Result<()> {
    let cf = db
        .cf_handle(crate::CF_PUBSUB)
        .ok_or_else(|| Error::NotOk("pubsub column family is missing".to_string()))?;
    batch.put_cf(cf, LOG_DATA_KEY, log_data.encode());
    Ok(())
}

/// Keys a serialized batch touches in the metadata column family, reduced to
/// user keys, plus the decoded log-data payload when one is present
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub put_keys: Vec<Vec<u8>>,
    pub delete_keys: Vec<Vec<u8>>,
    pub log_data: Option<WriteBatchLogData>,
}

enum Record<'a> {
    Put {
        cf_id: u32,
        key: &'a [u8],
        value: &'a [u8],
    },
    Delete {
        cf_id: u32,
        key: &'a [u8],
    },
    DeleteRange {
        cf_id: u32,
        begin: &'a [u8],
        end: &'a [u8],
    },
    LogData {
        blob: &'a [u8],
    },
}

struct RecordReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < BATCH_HEADER_SIZE {
            return Err(Error::InvalidArgument(
                "write batch is shorter than its header".to_string(),
            ));
        }
        Ok(Self {
            input: raw,
            pos: BATCH_HEADER_SIZE,
        })
    }

    fn done(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .input
            .get(self.pos)
            .ok_or_else(|| Error::InvalidArgument("truncated write batch".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_varint32(&mut self) -> Result<u32> {
        let mut shift = 0u32;
        let mut out = 0u32;
        loop {
            let b = self.read_u8()?;
            out |= u32::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(out);
            }
            shift += 7;
            if shift > 28 {
                return Err(Error::InvalidArgument(
                    "varint32 overflow in write batch".to_string(),
                ));
            }
        }
    }

    fn read_slice(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint32()? as usize;
        let slice = self
            .input
            .get(self.pos..self.pos + len)
            .ok_or_else(|| Error::InvalidArgument("truncated write batch".to_string()))?;
        self.pos += len;
        Ok(slice)
    }

    fn next_record(&mut self) -> Result<Record<'a>> {
        let tag = self.read_u8()?;
        match tag {
            TYPE_VALUE => Ok(Record::Put {
                cf_id: 0,
                key: self.read_slice()?,
                value: self.read_slice()?,
            }),
            TYPE_CF_VALUE => {
                let cf_id = self.read_varint32()?;
                Ok(Record::Put {
                    cf_id,
                    key: self.read_slice()?,
                    value: self.read_slice()?,
                })
            }
            TYPE_DELETION | TYPE_SINGLE_DELETION => Ok(Record::Delete {
                cf_id: 0,
                key: self.read_slice()?,
            }),
            TYPE_CF_DELETION | TYPE_CF_SINGLE_DELETION => {
                let cf_id = self.read_varint32()?;
                Ok(Record::Delete {
                    cf_id,
                    key: self.read_slice()?,
                })
            }
            TYPE_RANGE_DELETION => Ok(Record::DeleteRange {
                cf_id: 0,
                begin: self.read_slice()?,
                end: self.read_slice()?,
            }),
            TYPE_CF_RANGE_DELETION => {
                let cf_id = self.read_varint32()?;
                Ok(Record::DeleteRange {
                    cf_id,
                    begin: self.read_slice()?,
                    end: self.read_slice()?,
                })
            }
            TYPE_LOG_DATA => Ok(Record::LogData {
                blob: self.read_slice()?,
            }),
            other => Err(Error::InvalidArgument(format!(
                "unsupported write batch record: {:#x}",
                other
            ))),
        }
    }
}

/// Scan a serialized batch for metadata-column-family puts and deletes
pub fn extract(raw: &[u8]) -> Result<BatchSummary> {
    let mut reader = RecordReader::new(raw)?;
    let mut summary = BatchSummary::default();
    while !reader.done() {
        match reader.next_record()? {
            Record::Put { cf_id, key, value } => {
                if cf_id == CF_ID_METADATA {
                    let (_, user_key) = extract_namespace_key(key);
                    summary.put_keys.push(user_key.to_vec());
                } else if cf_id == CF_ID_PUBSUB && key == LOG_DATA_KEY {
                    summary.log_data = Some(WriteBatchLogData::decode(value)?);
                }
            }
            Record::Delete { cf_id, key } => {
                if cf_id == CF_ID_METADATA {
                    let (_, user_key) = extract_namespace_key(key);
                    summary.delete_keys.push(user_key.to_vec());
                }
            }
            Record::DeleteRange { .. } => {}
            Record::LogData { blob } => {
                summary.log_data = Some(WriteBatchLogData::decode(blob)?);
            }
        }
    }
    Ok(summary)
}

/// Rebuild a batch received as raw bytes, routing each record to the column
/// family its id names. Used by replication followers applying the leader's
/// updates.
pub fn replay(raw: &[u8], db: &DB) -> Result<WriteBatch> {
    let mut reader = RecordReader::new(raw)?;
    let mut batch = WriteBatch::default();
    while !reader.done() {
        match reader.next_record()? {
            Record::Put { cf_id, key, value } => {
                let cf = cf_by_id(db, cf_id)?;
                batch.put_cf(cf, key, value);
            }
            Record::Delete { cf_id, key } => {
                let cf = cf_by_id(db, cf_id)?;
                batch.delete_cf(cf, key);
            }
            Record::DeleteRange { cf_id, begin, end } => {
                let cf = cf_by_id(db, cf_id)?;
                batch.delete_range_cf(cf, begin, end);
            }
            Record::LogData { .. } => {}
        }
    }
    Ok(batch)
}

fn cf_by_id<'a>(db: &'a DB, cf_id: u32) -> Result<&'a rocksdb::ColumnFamily> {
    let name = COLUMN_FAMILY_NAMES
        .get(cf_id as usize)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown column family id {}", cf_id)))?;
    db.cf_handle(name)
        .ok_or_else(|| Error::NotOk(format!("column family {} is missing", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_data_roundtrip() {
        let log_data = WriteBatchLogData::with_args(
            RedisType::Bitmap,
            vec![b"setbit".to_vec(), b"7".to_vec()],
        );
        let encoded = log_data.encode();
        assert_eq!(WriteBatchLogData::decode(&encoded).unwrap(), log_data);
    }

    #[test]
    fn test_log_data_rejects_trailing_bytes() {
        let mut encoded = WriteBatchLogData::new(RedisType::String).encode();
        encoded.push(0);
        assert!(WriteBatchLogData::decode(&encoded).is_err());
    }

    #[test]
    fn test_log_data_rejects_truncation() {
        let encoded = WriteBatchLogData::with_args(RedisType::None, vec![b"expire".to_vec()])
            .encode();
        assert!(WriteBatchLogData::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_extract_default_cf_records() {
        // default-column-family records carry no cf id prefix
        let mut batch = WriteBatch::default();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        let summary = extract(batch.data()).unwrap();
        assert!(summary.put_keys.is_empty());
        assert!(summary.delete_keys.is_empty());
        assert!(summary.log_data.is_none());
    }

    #[test]
    fn test_extract_metadata_keys_and_log_data() {
        use crate::engine::{tests::test_config, Storage};
        use crate::metadata::compose_namespace_key;

        let dir = format!("/tmp/redrock_batch_test_{}", rand::random::<u64>());
        let storage = Storage::new(test_config(&dir, false));
        storage.open().unwrap();
        let db = storage.db().unwrap();

        let mut batch = WriteBatch::default();
        let log_data = WriteBatchLogData::with_args(RedisType::String, vec![b"set".to_vec()]);
        put_log_data(&mut batch, &db, &log_data).unwrap();
        let metadata_cf = db.cf_handle(crate::CF_METADATA).unwrap();
        batch.put_cf(metadata_cf, compose_namespace_key(b"ns", b"put-me"), b"v");
        batch.delete_cf(metadata_cf, compose_namespace_key(b"ns", b"del-me"));
        let default_cf = db.cf_handle(crate::CF_DEFAULT).unwrap();
        batch.put_cf(default_cf, b"subkey", b"ignored");

        let summary = extract(batch.data()).unwrap();
        assert_eq!(summary.put_keys, vec![b"put-me".to_vec()]);
        assert_eq!(summary.delete_keys, vec![b"del-me".to_vec()]);
        assert_eq!(summary.log_data, Some(log_data));

        drop(db);
        storage.close();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_extract_rejects_truncated_batch() {
        let mut batch = WriteBatch::default();
        batch.put(b"abc", b"def");
        let raw = batch.data();
        assert!(extract(&raw[..raw.len() - 2]).is_err());
    }
}
