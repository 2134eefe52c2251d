//! Cluster-mode slot tracking
//!
//! When cluster mode is enabled every metadata write carries a side effect:
//! the touched user keys are recorded under their hash slot in the `slot`
//! column family, with a per-slot version in `slot_metadata`, inside the same
//! atomic batch. Migration tooling scans slots instead of the whole keyspace.

use crate::engine::Storage;
use crate::metadata::generate_version;
use crate::{Error, Result, CF_SLOT, CF_SLOT_METADATA};
use rocksdb::WriteBatch;
use std::collections::BTreeMap;

/// Slot count; the mask keeps the CRC32 of the key tag in range
pub const HASH_SLOTS_SIZE: u32 = 1024;
const HASH_SLOTS_MASK: u32 = HASH_SLOTS_SIZE - 1;

/// Marker record guarding against opening a cluster-mode store without
/// cluster mode (and vice versa)
const CLUSTER_ENABLED_KEY: &[u8] = b"cluster_enabled";

/// Hash tag: the content between the first `{` and the following `}` when
/// non-empty, otherwise the whole key. Keys sharing a tag share a slot.
pub fn tag_from_key(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    let Some(close) = rest.iter().position(|&b| b == b'}') else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &rest[..close]
}

pub fn slot_num_from_key(key: &[u8]) -> u32 {
    crc32fast::hash(tag_from_key(key)) & HASH_SLOTS_MASK
}

/// Per-slot metadata value: `version (8, LE) || size (4, LE)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMetadata {
    pub version: u64,
    pub size: u32,
}

impl SlotMetadata {
    pub fn new() -> Self {
        Self {
            version: generate_version(),
            size: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(Error::InvalidArgument(
                "slot metadata value is too short".to_string(),
            ));
        }
        Ok(Self {
            version: u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            size: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

impl Default for SlotMetadata {
    fn default() -> Self {
        Self::new()
    }
}

pub fn slot_metadata_key(slot_num: u32) -> [u8; 4] {
    slot_num.to_be_bytes()
}

/// Slot key layout: `slot_num (4, BE) || version (8, BE) || user_key`
pub fn encode_slot_internal_key(slot_num: u32, version: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + key.len());
    out.extend_from_slice(&slot_num.to_be_bytes());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(key);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInternalKey<'a> {
    pub slot_num: u32,
    pub version: u64,
    pub key: &'a [u8],
}

impl<'a> SlotInternalKey<'a> {
    pub fn decode(input: &'a [u8]) -> Result<Self> {
        if input.len() < 12 {
            return Err(Error::InvalidArgument(
                "malformed slot internal key".to_string(),
            ));
        }
        Ok(Self {
            slot_num: u32::from_be_bytes([input[0], input[1], input[2], input[3]]),
            version: u64::from_be_bytes([
                input[4], input[5], input[6], input[7], input[8], input[9], input[10], input[11],
            ]),
            key: &input[12..],
        })
    }
}

/// Slot-tracking operations over the storage engine
pub struct Slot<'a> {
    storage: &'a Storage,
}

impl<'a> Slot<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    fn get_metadata(&self, slot_num: u32) -> Result<SlotMetadata> {
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_SLOT_METADATA)?;
        match db.get_cf(cf, slot_metadata_key(slot_num))? {
            Some(bytes) => SlotMetadata::decode(&bytes),
            None => Err(Error::NotFound),
        }
    }

    fn key_exists(&self, metadata: &SlotMetadata, user_key: &[u8]) -> Result<bool> {
        let slot_num = slot_num_from_key(user_key);
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_SLOT)?;
        let slot_key = encode_slot_internal_key(slot_num, metadata.version, user_key);
        Ok(db.get_cf(cf, slot_key)?.is_some())
    }

    /// Fold the slot-tracking mutations for `put_keys`/`delete_keys` into
    /// `updates` so they commit atomically with the triggering batch.
    pub fn update_keys(
        &self,
        put_keys: &[Vec<u8>],
        delete_keys: &[Vec<u8>],
        updates: &mut WriteBatch,
    ) -> Result<()> {
        let db = self.storage.db()?;
        let slot_cf = self.storage.cf_handle(&db, CF_SLOT)?;
        let slot_metadata_cf = self.storage.cf_handle(&db, CF_SLOT_METADATA)?;

        let mut metadatas: BTreeMap<u32, SlotMetadata> = BTreeMap::new();
        let load = |metadatas: &mut BTreeMap<u32, SlotMetadata>,
                    slot_num: u32|
         -> Result<SlotMetadata> {
            if let Some(m) = metadatas.get(&slot_num) {
                return Ok(m.clone());
            }
            let m = match self.get_metadata(slot_num) {
                Ok(m) => m,
                Err(Error::NotFound) => SlotMetadata::new(),
                Err(e) => return Err(e),
            };
            metadatas.insert(slot_num, m.clone());
            Ok(m)
        };

        for key in put_keys {
            let slot_num = slot_num_from_key(key);
            let metadata = load(&mut metadatas, slot_num)?;
            if !self.key_exists(&metadata, key)? {
                let slot_key = encode_slot_internal_key(slot_num, metadata.version, key);
                updates.put_cf(slot_cf, slot_key, b"");
                if let Some(m) = metadatas.get_mut(&slot_num) {
                    m.size += 1;
                }
            }
        }

        for key in delete_keys {
            let slot_num = slot_num_from_key(key);
            let metadata = load(&mut metadatas, slot_num)?;
            if self.key_exists(&metadata, key)? {
                let slot_key = encode_slot_internal_key(slot_num, metadata.version, key);
                updates.delete_cf(slot_cf, slot_key);
                if let Some(m) = metadatas.get_mut(&slot_num) {
                    m.size = m.size.saturating_sub(1);
                }
            }
        }

        for (slot_num, metadata) in &metadatas {
            updates.put_cf(
                slot_metadata_cf,
                slot_metadata_key(*slot_num),
                metadata.encode(),
            );
        }
        Ok(())
    }

    /// Drop every slot's metadata; the orphaned slot keys are reclaimed by
    /// the slot-key compaction filter.
    pub fn delete_all(&self) -> Result<()> {
        let _guard = self.storage.lock_manager().lock(b"slots_all");
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_SLOT_METADATA)?;
        db.delete_range_cf(
            cf,
            slot_metadata_key(0),
            slot_metadata_key(HASH_SLOTS_SIZE),
        )?;
        Ok(())
    }

    pub fn size(&self, slot_num: u32) -> Result<u32> {
        Ok(self.get_metadata(slot_num)?.size)
    }

    /// Scan the user keys recorded under `slot_num`, resuming after `cursor`
    pub fn scan(&self, slot_num: u32, cursor: &[u8], limit: u64) -> Result<Vec<Vec<u8>>> {
        let metadata = self.get_metadata(slot_num)?;
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_SLOT)?;
        let snapshot = db.snapshot();

        let prefix = encode_slot_internal_key(slot_num, metadata.version, b"");
        let start_key = if cursor.is_empty() {
            prefix.clone()
        } else {
            encode_slot_internal_key(slot_num, metadata.version, cursor)
        };

        let mut keys = Vec::new();
        let iter = snapshot.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !cursor.is_empty() && key.as_ref() == start_key.as_slice() {
                continue;
            }
            if !key.starts_with(&prefix) {
                break;
            }
            let ikey = SlotInternalKey::decode(&key)?;
            keys.push(ikey.key.to_vec());
            if limit > 0 && keys.len() as u64 >= limit {
                break;
            }
        }
        Ok(keys)
    }

    /// First open records the cluster-mode setting; later opens refuse a
    /// store created under the opposite setting.
    pub fn check_cluster_enabled(&self, enabled: bool) -> Result<()> {
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_SLOT_METADATA)?;
        let stored = {
            let snapshot = db.snapshot();
            snapshot.get_cf(cf, CLUSTER_ENABLED_KEY).map_err(|e| {
                Error::DbOpen(format!("get cluster enabled status: {}", e))
            })?
        };
        let want: &[u8] = if enabled { b"1" } else { b"0" };
        match stored {
            None => {
                // read-only opens cannot record the marker; ignore the failure
                if let Err(e) = db.put_cf(cf, CLUSTER_ENABLED_KEY, want) {
                    tracing::debug!("[storage] skip writing cluster enabled status: {}", e);
                }
                Ok(())
            }
            Some(bytes) if bytes == want => Ok(()),
            Some(_) => Err(Error::DbOpen(
                "cluster enabled status mismatch".to_string(),
            )),
        }
    }
}
