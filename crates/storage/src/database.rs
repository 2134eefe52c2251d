//! Database facade
//!
//! The operations every data-type module builds on: metadata lookup with
//! type checking, TTL, logical delete, namespace-scoped iteration, and the
//! sub-key scanner. Each read takes a snapshot of the DB at entry; the
//! snapshot is a guard released on every exit path.

use crate::batch::{put_log_data, WriteBatchLogData};
use crate::engine::Storage;
use crate::metadata::{
    compose_namespace_key, encode_internal_key, extract_namespace_key, InternalKey, Metadata,
    RedisType,
};
use crate::{Error, Result, CF_DEFAULT, CF_METADATA};
use rocksdb::{Direction, IteratorMode, WriteBatch};
use std::sync::Arc;

/// Aggregate statistics over a namespace's keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyNumStats {
    pub n_key: u64,
    pub n_expires: u64,
    pub n_expired: u64,
    pub avg_ttl: u64,
}

pub struct Database {
    storage: Arc<Storage>,
    namespace: Vec<u8>,
}

impl Database {
    pub fn new(storage: Arc<Storage>, namespace: &str) -> Self {
        Self {
            storage,
            namespace: namespace.as_bytes().to_vec(),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    /// The on-disk metadata key for a user key
    pub fn append_namespace_prefix(&self, user_key: &[u8]) -> Vec<u8> {
        compose_namespace_key(&self.namespace, user_key)
    }

    /// Fetch and decode the metadata record under a snapshot. Absent,
    /// expired and empty records all read as `NotFound`; a type mismatch is
    /// `WrongType` unless the caller passed the `None` sentinel.
    pub fn get_metadata(&self, expected_type: RedisType, ns_key: &[u8]) -> Result<Metadata> {
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_METADATA)?;
        let snapshot = db.snapshot();
        let bytes = snapshot.get_cf(cf, ns_key)?.ok_or(Error::NotFound)?;
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Err(Error::NotFound);
        }
        if expected_type != RedisType::None
            && metadata.redis_type() != expected_type
            && (metadata.size > 0 || metadata.redis_type() == RedisType::String)
        {
            return Err(Error::WrongType);
        }
        if metadata.redis_type() != RedisType::String && metadata.size == 0 {
            return Err(Error::NotFound);
        }
        Ok(metadata)
    }

    /// Raw metadata value, None when the record is absent
    pub(crate) fn get_raw_metadata(&self, ns_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_METADATA)?;
        let snapshot = db.snapshot();
        Ok(snapshot.get_cf(cf, ns_key)?)
    }

    /// Overwrite the expiry; 0 clears it
    pub fn expire(&self, user_key: &[u8], timestamp: u32) -> Result<()> {
        let ns_key = self.append_namespace_prefix(user_key);
        let _guard = self.storage.lock_manager().lock(&ns_key);

        let value = self.get_raw_metadata(&ns_key)?.ok_or(Error::NotFound)?;
        let metadata = Metadata::decode(&value)?;
        if metadata.expired() {
            return Err(Error::NotFound);
        }
        if metadata.redis_type() != RedisType::String && metadata.size == 0 {
            return Err(Error::NotFound);
        }
        if metadata.expire == timestamp {
            return Ok(());
        }

        let mut rewritten = value;
        rewritten[1..5].copy_from_slice(&timestamp.to_le_bytes());

        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_METADATA)?;
        let mut batch = WriteBatch::default();
        put_log_data(
            &mut batch,
            &db,
            &WriteBatchLogData::with_args(RedisType::None, vec![b"expire".to_vec()]),
        )?;
        batch.put_cf(cf, &ns_key, rewritten);
        drop(db);
        self.storage.write(batch)
    }

    /// Logical delete of the whole value: drop the metadata record, making
    /// every sub-key unreachable for the compaction filter to reclaim
    pub fn del(&self, user_key: &[u8]) -> Result<()> {
        let ns_key = self.append_namespace_prefix(user_key);
        let _guard = self.storage.lock_manager().lock(&ns_key);

        let value = self.get_raw_metadata(&ns_key)?.ok_or(Error::NotFound)?;
        if Metadata::decode(&value)?.expired() {
            return Err(Error::NotFound);
        }
        self.storage.delete(CF_METADATA, &ns_key)
    }

    /// Count the keys whose metadata exists and has not expired
    pub fn exists(&self, keys: &[&[u8]]) -> Result<u64> {
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_METADATA)?;
        let snapshot = db.snapshot();

        let mut count = 0;
        for key in keys {
            let ns_key = self.append_namespace_prefix(key);
            if let Some(bytes) = snapshot.get_cf(cf, &ns_key)? {
                if !Metadata::decode(&bytes)?.expired() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Remaining seconds; -1 when no expiry, -2 when the key is absent
    pub fn ttl(&self, user_key: &[u8]) -> Result<i64> {
        let ns_key = self.append_namespace_prefix(user_key);
        match self.get_raw_metadata(&ns_key)? {
            None => Ok(-2),
            Some(bytes) => {
                let metadata = Metadata::decode(&bytes)?;
                if metadata.expired() {
                    return Ok(-2);
                }
                Ok(metadata.ttl())
            }
        }
    }

    pub fn type_of(&self, user_key: &[u8]) -> Result<RedisType> {
        let ns_key = self.append_namespace_prefix(user_key);
        match self.get_raw_metadata(&ns_key)? {
            None => Ok(RedisType::None),
            Some(bytes) => {
                let metadata = Metadata::decode(&bytes)?;
                if metadata.expired() {
                    return Ok(RedisType::None);
                }
                Ok(metadata.redis_type())
            }
        }
    }

    /// Diagnostic field/value pairs describing the stored record
    pub fn dump(&self, user_key: &[u8]) -> Result<Vec<String>> {
        let ns_key = self.append_namespace_prefix(user_key);
        let Some(bytes) = self.get_raw_metadata(&ns_key)? else {
            return Ok(Vec::new());
        };
        let metadata = Metadata::decode(&bytes)?;

        let mut infos = Vec::new();
        infos.push("namespace".to_string());
        infos.push(String::from_utf8_lossy(&self.namespace).into_owned());
        infos.push("type".to_string());
        infos.push(metadata.redis_type().name().to_string());
        infos.push("version".to_string());
        infos.push(metadata.version.to_string());
        infos.push("expire".to_string());
        infos.push(metadata.expire.to_string());
        infos.push("size".to_string());
        infos.push(metadata.size.to_string());
        infos.push("created_at".to_string());
        let micros = metadata.created_at_micros();
        let created_at = chrono::DateTime::from_timestamp_micros(micros as i64)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        infos.push(created_at);
        Ok(infos)
    }

    /// Walk the namespace's metadata records, collecting keys matching
    /// `prefix` and aggregate statistics
    fn walk_keys(
        &self,
        prefix: &[u8],
        mut on_key: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<KeyNumStats> {
        let ns_prefix = self.append_namespace_prefix(prefix);
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_METADATA)?;
        let snapshot = db.snapshot();

        let mut stats = KeyNumStats::default();
        let mut ttl_sum = 0u64;
        let iter = snapshot.iterator_cf(cf, IteratorMode::From(&ns_prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&ns_prefix) {
                break;
            }
            let metadata = Metadata::decode(&value)?;
            if metadata.expired() {
                stats.n_expired += 1;
                continue;
            }
            let ttl = metadata.ttl();
            stats.n_key += 1;
            if ttl != -1 {
                stats.n_expires += 1;
                if ttl > 0 {
                    ttl_sum += ttl as u64;
                }
            }
            if let Some(on_key) = on_key.as_mut() {
                let (_, user_key) = extract_namespace_key(&key);
                on_key(user_key);
            }
        }
        if stats.n_expires > 0 {
            stats.avg_ttl = ttl_sum / stats.n_expires;
        }
        Ok(stats)
    }

    /// Every live user key in the namespace matching `prefix`
    pub fn keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        let mut push = |key: &[u8]| keys.push(key.to_vec());
        self.walk_keys(prefix, Some(&mut push))?;
        Ok(keys)
    }

    pub fn get_key_num_stats(&self, prefix: &[u8]) -> Result<KeyNumStats> {
        self.walk_keys(prefix, None)
    }

    /// Resumable iteration. The cursor is the last user key returned by the
    /// previous call; `limit` bounds returned keys.
    pub fn scan(&self, cursor: &[u8], limit: u64, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ns_prefix = self.append_namespace_prefix(prefix);
        let ns_cursor = self.append_namespace_prefix(cursor);
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_METADATA)?;
        let snapshot = db.snapshot();

        let start: &[u8] = if cursor.is_empty() {
            &ns_prefix
        } else {
            &ns_cursor
        };
        let mut keys = Vec::new();
        let iter = snapshot.iterator_cf(cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !cursor.is_empty() && key.as_ref() == ns_cursor.as_slice() {
                continue;
            }
            if !key.starts_with(&ns_prefix) {
                break;
            }
            if Metadata::decode(&value)?.expired() {
                continue;
            }
            let (_, user_key) = extract_namespace_key(&key);
            keys.push(user_key.to_vec());
            if keys.len() as u64 >= limit {
                break;
            }
        }
        Ok(keys)
    }

    /// A key picked from a 60-key window after `cursor`, wrapping to the
    /// start when the window is empty
    pub fn random_key(&self, cursor: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut keys = self.scan(cursor, 60, b"")?;
        if keys.is_empty() && !cursor.is_empty() {
            keys = self.scan(b"", 60, b"")?;
        }
        if keys.is_empty() {
            return Ok(None);
        }
        let index = rand::random::<u64>() as usize % keys.len();
        Ok(Some(keys.swap_remove(index)))
    }

    /// First and last existing metadata keys under `prefix`, or None when
    /// the range is empty
    pub(crate) fn find_key_range_with_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let db = self.storage.db()?;
        let cf = self.storage.cf_handle(&db, CF_METADATA)?;
        let snapshot = db.snapshot();

        let mut iter =
            snapshot.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        let begin = match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if !key.starts_with(prefix) {
                    return Ok(None);
                }
                key.to_vec()
            }
            None => return Ok(None),
        };

        // the upper bound of the prefix: bump the last byte; namespaces keep
        // their last byte under 0x80 so this cannot wrap
        let mut next_prefix = prefix.to_vec();
        if let Some(last) = next_prefix.last_mut() {
            *last += 1;
        }
        let rev = snapshot.iterator_cf(
            cf,
            IteratorMode::From(&next_prefix, Direction::Reverse),
        );
        for item in rev {
            let (key, _) = item?;
            if key.starts_with(prefix) {
                return Ok(Some((begin, key.to_vec())));
            }
        }
        Ok(None)
    }

    /// Delete every key in this namespace
    pub fn flush_db(&self) -> Result<()> {
        let prefix = self.append_namespace_prefix(b"");
        match self.find_key_range_with_prefix(&prefix)? {
            Some((begin, end)) => self.storage.delete_all(&begin, &end),
            None => Ok(()),
        }
    }

    /// Delete every key in every namespace
    pub fn flush_all(&self) -> Result<()> {
        let (first, last) = {
            let db = self.storage.db()?;
            let cf = self.storage.cf_handle(&db, CF_METADATA)?;
            let snapshot = db.snapshot();
            let mut forward = snapshot.iterator_cf(cf, IteratorMode::Start);
            let first = match forward.next() {
                Some(item) => item?.0.to_vec(),
                None => return Ok(()),
            };
            let mut backward = snapshot.iterator_cf(cf, IteratorMode::End);
            let last = match backward.next() {
                Some(item) => item?.0.to_vec(),
                None => return Ok(()),
            };
            (first, last)
        };
        self.storage.delete_all(&first, &last)
    }
}

/// Version-scoped iteration over one key's sub-keys
pub struct SubKeyScanner {
    db: Database,
}

impl SubKeyScanner {
    pub fn new(storage: Arc<Storage>, namespace: &str) -> Self {
        Self {
            db: Database::new(storage, namespace),
        }
    }

    /// Scan sub-keys of `user_key` under its current version. `cursor` is
    /// the last sub-key of the previous call, `limit` 0 means unbounded.
    pub fn scan(
        &self,
        redis_type: RedisType,
        user_key: &[u8],
        cursor: &[u8],
        limit: u64,
        subkey_prefix: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let ns_key = self.db.append_namespace_prefix(user_key);
        let metadata = self.db.get_metadata(redis_type, &ns_key)?;

        let storage = self.db.storage();
        let db = storage.db()?;
        let cf = storage.cf_handle(&db, CF_DEFAULT)?;
        let snapshot = db.snapshot();

        let match_prefix = encode_internal_key(&ns_key, subkey_prefix, metadata.version);
        let start_key = if cursor.is_empty() {
            match_prefix.clone()
        } else {
            encode_internal_key(&ns_key, cursor, metadata.version)
        };

        let mut keys = Vec::new();
        let mut values = Vec::new();
        let iter = snapshot.iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !cursor.is_empty() && key.as_ref() == start_key.as_slice() {
                // the cursor itself was returned by the previous scan
                continue;
            }
            if !key.starts_with(&match_prefix) {
                break;
            }
            let ikey = InternalKey::decode(&key)?;
            keys.push(ikey.sub_key.to_vec());
            values.push(value.to_vec());
            if limit > 0 && keys.len() as u64 >= limit {
                break;
            }
        }
        Ok((keys, values))
    }
}
