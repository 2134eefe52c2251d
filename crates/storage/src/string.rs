//! String type
//!
//! Strings are the one type stored entirely inside the metadata record: the
//! payload follows the `flags | expire` header, so a plain overwrite is a
//! logical delete of whatever lived under the key before.

use crate::batch::{put_log_data, WriteBatchLogData};
use crate::database::Database;
use crate::engine::Storage;
use crate::metadata::{Metadata, RedisType};
use crate::{Error, Result, CF_METADATA};
use rocksdb::WriteBatch;
use std::sync::Arc;

pub(crate) const STRING_HEADER_SIZE: usize = 5;

pub struct RedisString {
    db: Database,
}

impl RedisString {
    pub fn new(storage: Arc<Storage>, namespace: &str) -> Self {
        Self {
            db: Database::new(storage, namespace),
        }
    }

    pub fn get(&self, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let ns_key = self.db.append_namespace_prefix(user_key);
        let Some(value) = self.db.get_raw_metadata(&ns_key)? else {
            return Ok(None);
        };
        let metadata = Metadata::decode(&value)?;
        if metadata.expired() {
            return Ok(None);
        }
        if metadata.redis_type() != RedisType::String {
            return Err(Error::WrongType);
        }
        Ok(Some(value[STRING_HEADER_SIZE..].to_vec()))
    }

    pub fn set(&self, user_key: &[u8], payload: &[u8]) -> Result<()> {
        let ns_key = self.db.append_namespace_prefix(user_key);
        let _guard = self.db.storage().lock_manager().lock(&ns_key);

        let mut value = Metadata::new(RedisType::String).encode();
        value.extend_from_slice(payload);

        let storage = self.db.storage();
        let db = storage.db()?;
        let cf = storage.cf_handle(&db, CF_METADATA)?;
        let mut batch = WriteBatch::default();
        put_log_data(
            &mut batch,
            &db,
            &WriteBatchLogData::with_args(RedisType::String, vec![b"set".to_vec()]),
        )?;
        batch.put_cf(cf, &ns_key, value);
        drop(db);
        storage.write(batch)
    }

    pub fn strlen(&self, user_key: &[u8]) -> Result<u64> {
        Ok(self.get(user_key)?.map(|v| v.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_config;

    fn open_temp_string() -> (RedisString, Arc<Storage>, String) {
        let dir = format!("/tmp/redrock_string_test_{}", rand::random::<u64>());
        let storage = Arc::new(Storage::new(test_config(&dir, false)));
        storage.open().unwrap();
        (RedisString::new(storage.clone(), "ns"), storage, dir)
    }

    fn cleanup(storage: Arc<Storage>, dir: &str) {
        storage.close();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_set_get() {
        let (string, storage, dir) = open_temp_string();
        assert_eq!(string.get(b"k").unwrap(), None);
        string.set(b"k", b"hello").unwrap();
        assert_eq!(string.get(b"k").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(string.strlen(b"k").unwrap(), 5);
        string.set(b"k", b"").unwrap();
        assert_eq!(string.get(b"k").unwrap(), Some(Vec::new()));
        cleanup(storage, &dir);
    }

    #[test]
    fn test_get_wrong_type() {
        let (string, storage, dir) = open_temp_string();
        let db = Database::new(storage.clone(), "ns");
        let handle = storage.db().unwrap();
        let cf = storage.cf_handle(&handle, CF_METADATA).unwrap();
        let mut metadata = Metadata::new(RedisType::Hash);
        metadata.size = 1;
        handle
            .put_cf(cf, db.append_namespace_prefix(b"h"), metadata.encode())
            .unwrap();
        drop(handle);
        assert!(matches!(string.get(b"h"), Err(Error::WrongType)));
        cleanup(storage, &dir);
    }
}
