//! Key and metadata encoding for the Redis data model
//!
//! Every user-visible key belongs to a namespace. The metadata column family
//! stores one record per top-level key: `len(ns) || ns || user_key` mapping
//! to `flags | expire | [version | size]` (string values carry their payload
//! inline after `flags | expire`). Sub-keys of non-string types live in their
//! own column family under the metadata key plus the record version, so
//! advancing the version logically deletes every old sub-key at once.

use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// The namespace attached to connections that authenticated as admin
pub const DEFAULT_NAMESPACE: &str = "__namespace";

const METADATA_HEADER_SIZE: usize = 5;
const METADATA_FULL_SIZE: usize = 17;

/// Redis value type, stored in the low nibble of the metadata flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RedisType {
    None = 0,
    String = 1,
    Hash = 2,
    List = 3,
    Set = 4,
    ZSet = 5,
    Bitmap = 6,
    SortedInt = 7,
    Stream = 8,
}

impl RedisType {
    pub fn from_u8(v: u8) -> RedisType {
        match v {
            1 => RedisType::String,
            2 => RedisType::Hash,
            3 => RedisType::List,
            4 => RedisType::Set,
            5 => RedisType::ZSet,
            6 => RedisType::Bitmap,
            7 => RedisType::SortedInt,
            8 => RedisType::Stream,
            _ => RedisType::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RedisType::None => "none",
            RedisType::String => "string",
            RedisType::Hash => "hash",
            RedisType::List => "list",
            RedisType::Set => "set",
            RedisType::ZSet => "zset",
            RedisType::Bitmap => "bitmap",
            RedisType::SortedInt => "sortedint",
            RedisType::Stream => "stream",
        }
    }
}

static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Monotonic 8-byte version: microsecond timestamp in the high bits, a
/// wrapping counter in the low 11 bits to keep same-microsecond writers apart
pub fn generate_version() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let counter = VERSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    (micros << 11) | (counter & 0x7ff)
}

pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Per-top-level-key metadata record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub flags: u8,
    pub expire: u32,
    pub version: u64,
    pub size: u32,
}

impl Metadata {
    pub fn new(redis_type: RedisType) -> Self {
        Self {
            flags: redis_type as u8,
            expire: 0,
            version: generate_version(),
            size: 0,
        }
    }

    pub fn redis_type(&self) -> RedisType {
        RedisType::from_u8(self.flags & 0x0f)
    }

    pub fn expired(&self) -> bool {
        self.expire != 0 && self.expire <= now_secs()
    }

    /// Remaining seconds, or -1 when no expiry is set
    pub fn ttl(&self) -> i64 {
        if self.expire == 0 {
            return -1;
        }
        let now = now_secs();
        if self.expire <= now {
            0
        } else {
            (self.expire - now) as i64
        }
    }

    /// Creation time in unix microseconds, recovered from the version
    pub fn created_at_micros(&self) -> u64 {
        self.version >> 11
    }

    /// Encode the metadata header. String payloads are appended by the
    /// caller; non-string types carry version and size.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_FULL_SIZE);
        out.push(self.flags);
        out.extend_from_slice(&self.expire.to_le_bytes());
        if self.redis_type() != RedisType::String {
            out.extend_from_slice(&self.version.to_le_bytes());
            out.extend_from_slice(&self.size.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < METADATA_HEADER_SIZE {
            return Err(Error::InvalidArgument(
                "metadata value is too short".to_string(),
            ));
        }
        let flags = bytes[0];
        let expire = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let mut metadata = Metadata {
            flags,
            expire,
            version: 0,
            size: 0,
        };
        if metadata.redis_type() != RedisType::String {
            if bytes.len() < METADATA_FULL_SIZE {
                return Err(Error::InvalidArgument(
                    "metadata value is too short".to_string(),
                ));
            }
            metadata.version = u64::from_le_bytes([
                bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11], bytes[12],
            ]);
            metadata.size =
                u32::from_le_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
        }
        Ok(metadata)
    }
}

/// On-disk metadata key: `len(ns) (1 byte) || ns || user_key`
pub fn compose_namespace_key(namespace: &[u8], user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + namespace.len() + user_key.len());
    out.push(namespace.len() as u8);
    out.extend_from_slice(namespace);
    out.extend_from_slice(user_key);
    out
}

/// Split a metadata key back into (namespace, user_key)
pub fn extract_namespace_key(ns_key: &[u8]) -> (&[u8], &[u8]) {
    if ns_key.is_empty() {
        return (&[], &[]);
    }
    let ns_len = ns_key[0] as usize;
    if ns_key.len() < 1 + ns_len {
        return (&[], &[]);
    }
    (&ns_key[1..1 + ns_len], &ns_key[1 + ns_len..])
}

/// Sub-key layout:
/// `len(ns) (1) || ns || len(key) (4, LE) || key || version (8, BE) || sub_key`.
/// The version is big-endian so a key's sub-keys sort by version under the
/// shared prefix.
pub fn encode_internal_key(ns_key: &[u8], sub_key: &[u8], version: u64) -> Vec<u8> {
    let (namespace, user_key) = extract_namespace_key(ns_key);
    let mut out =
        Vec::with_capacity(1 + namespace.len() + 4 + user_key.len() + 8 + sub_key.len());
    out.push(namespace.len() as u8);
    out.extend_from_slice(namespace);
    out.extend_from_slice(&(user_key.len() as u32).to_le_bytes());
    out.extend_from_slice(user_key);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(sub_key);
    out
}

/// Decoded view over an encoded sub-key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalKey<'a> {
    pub namespace: &'a [u8],
    pub user_key: &'a [u8],
    pub version: u64,
    pub sub_key: &'a [u8],
}

impl<'a> InternalKey<'a> {
    pub fn decode(input: &'a [u8]) -> Result<Self> {
        let fail = || Error::InvalidArgument("malformed internal key".to_string());
        if input.is_empty() {
            return Err(fail());
        }
        let ns_len = input[0] as usize;
        let mut pos = 1;
        let namespace = input.get(pos..pos + ns_len).ok_or_else(fail)?;
        pos += ns_len;
        let key_len_bytes = input.get(pos..pos + 4).ok_or_else(fail)?;
        let key_len = u32::from_le_bytes([
            key_len_bytes[0],
            key_len_bytes[1],
            key_len_bytes[2],
            key_len_bytes[3],
        ]) as usize;
        pos += 4;
        let user_key = input.get(pos..pos + key_len).ok_or_else(fail)?;
        pos += key_len;
        let version_bytes = input.get(pos..pos + 8).ok_or_else(fail)?;
        let version = u64::from_be_bytes([
            version_bytes[0],
            version_bytes[1],
            version_bytes[2],
            version_bytes[3],
            version_bytes[4],
            version_bytes[5],
            version_bytes[6],
            version_bytes[7],
        ]);
        pos += 8;
        Ok(InternalKey {
            namespace,
            user_key,
            version,
            sub_key: &input[pos..],
        })
    }

    /// Metadata key of the record this sub-key belongs to
    pub fn metadata_key(&self) -> Vec<u8> {
        compose_namespace_key(self.namespace, self.user_key)
    }
}
