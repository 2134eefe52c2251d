//! Compaction filters
//!
//! Deletion in the data model is logical: expiring a key or advancing its
//! version leaves the old records in place. These filters reclaim them as
//! compaction rewrites each column family. The sub-key and slot-key filters
//! read parent metadata through the engine and therefore pin the DB handle
//! with the reference-count protocol while doing so.

use crate::bitmap::Bitmap;
use crate::engine::StorageInner;
use crate::metadata::{InternalKey, Metadata, RedisType};
use crate::slot::{slot_metadata_key, SlotInternalKey, SlotMetadata};
use crate::{CF_METADATA, CF_SLOT_METADATA};
use rocksdb::compaction_filter::{CompactionFilter, Decision};
use rocksdb::compaction_filter_factory::{CompactionFilterContext, CompactionFilterFactory};
use std::ffi::CStr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Drops expired top-level records from the metadata column family
pub struct MetadataFilter;

impl CompactionFilter for MetadataFilter {
    fn filter(&mut self, _level: u32, key: &[u8], value: &[u8]) -> Decision {
        let metadata = match Metadata::decode(value) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(
                    "[compact_filter/metadata] failed to decode key {:?}: {}",
                    String::from_utf8_lossy(key),
                    e
                );
                return Decision::Keep;
            }
        };
        if metadata.expired() {
            debug!(
                "[compact_filter/metadata] key {:?}: deleted",
                String::from_utf8_lossy(key)
            );
            Decision::Remove
        } else {
            Decision::Keep
        }
    }

    fn name(&self) -> &CStr {
        c"MetadataFilter"
    }
}

pub struct MetadataFilterFactory;

impl CompactionFilterFactory for MetadataFilterFactory {
    type Filter = MetadataFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        MetadataFilter
    }

    fn name(&self) -> &CStr {
        c"MetadataFilterFactory"
    }
}

/// Drops sub-keys whose parent metadata is gone, expired, rewritten as a
/// string, or advanced to a newer version. Consecutive sub-keys of one
/// parent share a single metadata fetch through the cache fields.
pub struct SubKeyFilter {
    stor: Arc<StorageInner>,
    cached_key: Vec<u8>,
    cached_metadata: Vec<u8>,
}

impl SubKeyFilter {
    fn is_collectible(&mut self, ikey: &InternalKey, value: &[u8]) -> bool {
        let metadata_key = ikey.metadata_key();
        if self.cached_key.is_empty() || self.cached_key != metadata_key {
            // the db may be closing under us; keep the record in doubt
            if self.stor.incr_db_refs().is_err() {
                return false;
            }
            let fetched = self.stor.db().and_then(|db| {
                db.cf_handle(CF_METADATA)
                    .map(|cf| db.get_cf(cf, &metadata_key))
            });
            let _ = self.stor.decr_db_refs();
            self.cached_key = metadata_key;
            match fetched {
                Some(Ok(Some(bytes))) => self.cached_metadata = bytes,
                Some(Ok(None)) => {
                    // metadata already reclaimed; every sub-key is garbage
                    self.cached_metadata.clear();
                    return true;
                }
                _ => {
                    error!(
                        "[compact_filter/subkey] failed to fetch metadata, key: {:?}",
                        String::from_utf8_lossy(ikey.user_key)
                    );
                    self.cached_key.clear();
                    self.cached_metadata.clear();
                    return false;
                }
            }
        }
        if self.cached_metadata.is_empty() {
            return true;
        }
        let metadata = match Metadata::decode(&self.cached_metadata) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.cached_key.clear();
                error!(
                    "[compact_filter/subkey] failed to decode metadata, key: {:?}, err: {}",
                    String::from_utf8_lossy(ikey.user_key),
                    e
                );
                return false;
            }
        };
        if metadata.redis_type() == RedisType::String
            || metadata.expired()
            || ikey.version != metadata.version
        {
            return true;
        }
        metadata.redis_type() == RedisType::Bitmap && Bitmap::is_empty_segment(value)
    }
}

impl CompactionFilter for SubKeyFilter {
    fn filter(&mut self, _level: u32, key: &[u8], value: &[u8]) -> Decision {
        let ikey = match InternalKey::decode(key) {
            Ok(ikey) => ikey,
            Err(_) => return Decision::Keep,
        };
        if self.is_collectible(&ikey, value) {
            Decision::Remove
        } else {
            Decision::Keep
        }
    }

    fn name(&self) -> &CStr {
        c"SubKeyFilter"
    }
}

pub struct SubKeyFilterFactory {
    stor: Arc<StorageInner>,
}

impl SubKeyFilterFactory {
    pub(crate) fn new(stor: Arc<StorageInner>) -> Self {
        Self { stor }
    }
}

impl CompactionFilterFactory for SubKeyFilterFactory {
    type Filter = SubKeyFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        SubKeyFilter {
            stor: self.stor.clone(),
            cached_key: Vec::new(),
            cached_metadata: Vec::new(),
        }
    }

    fn name(&self) -> &CStr {
        c"SubKeyFilterFactory"
    }
}

/// Pub/sub records only exist to ride the WAL; everything is collectible
pub struct PubSubFilter;

impl CompactionFilter for PubSubFilter {
    fn filter(&mut self, _level: u32, _key: &[u8], _value: &[u8]) -> Decision {
        Decision::Remove
    }

    fn name(&self) -> &CStr {
        c"PubSubFilter"
    }
}

pub struct PubSubFilterFactory;

impl CompactionFilterFactory for PubSubFilterFactory {
    type Filter = PubSubFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        PubSubFilter
    }

    fn name(&self) -> &CStr {
        c"PubSubFilterFactory"
    }
}

/// Drops slot keys recorded under an outdated slot version
pub struct SlotKeyFilter {
    stor: Arc<StorageInner>,
    cached_key: Vec<u8>,
    cached_metadata: Vec<u8>,
}

impl SlotKeyFilter {
    fn is_collectible(&mut self, ikey: &SlotInternalKey) -> bool {
        let metadata_key = slot_metadata_key(ikey.slot_num).to_vec();
        if self.cached_key.is_empty() || self.cached_key != metadata_key {
            if self.stor.incr_db_refs().is_err() {
                return false;
            }
            let fetched = self.stor.db().and_then(|db| {
                db.cf_handle(CF_SLOT_METADATA)
                    .map(|cf| db.get_cf(cf, &metadata_key))
            });
            let _ = self.stor.decr_db_refs();
            self.cached_key = metadata_key;
            match fetched {
                Some(Ok(Some(bytes))) => self.cached_metadata = bytes,
                Some(Ok(None)) => {
                    self.cached_metadata.clear();
                    return true;
                }
                _ => {
                    error!(
                        "[compact_filter/slotkey] failed to fetch slot metadata, slot: {}",
                        ikey.slot_num
                    );
                    self.cached_key.clear();
                    self.cached_metadata.clear();
                    return false;
                }
            }
        }
        if self.cached_metadata.is_empty() {
            return true;
        }
        match SlotMetadata::decode(&self.cached_metadata) {
            Ok(metadata) => ikey.version != metadata.version,
            Err(e) => {
                self.cached_key.clear();
                error!(
                    "[compact_filter/slotkey] failed to decode slot metadata, slot: {}, err: {}",
                    ikey.slot_num, e
                );
                false
            }
        }
    }
}

impl CompactionFilter for SlotKeyFilter {
    fn filter(&mut self, _level: u32, key: &[u8], _value: &[u8]) -> Decision {
        let ikey = match SlotInternalKey::decode(key) {
            Ok(ikey) => ikey,
            Err(_) => return Decision::Keep,
        };
        if self.is_collectible(&ikey) {
            Decision::Remove
        } else {
            Decision::Keep
        }
    }

    fn name(&self) -> &CStr {
        c"SlotKeyFilter"
    }
}

pub struct SlotKeyFilterFactory {
    stor: Arc<StorageInner>,
}

impl SlotKeyFilterFactory {
    pub(crate) fn new(stor: Arc<StorageInner>) -> Self {
        Self { stor }
    }
}

impl CompactionFilterFactory for SlotKeyFilterFactory {
    type Filter = SlotKeyFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        SlotKeyFilter {
            stor: self.stor.clone(),
            cached_key: Vec::new(),
            cached_metadata: Vec::new(),
        }
    }

    fn name(&self) -> &CStr {
        c"SlotKeyFilterFactory"
    }
}
