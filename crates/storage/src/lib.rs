//! On-disk Redis data model over RocksDB column families
//!
//! The engine wrapper owns the RocksDB handle and its column families; the
//! database facade layers the namespaced Redis key scheme on top. Data-type
//! modules (string, bitmap) build on the facade.

pub mod backup;
pub mod batch;
pub mod bitmap;
pub mod compaction_filter;
pub mod database;
pub mod engine;
pub mod lock_manager;
pub mod metadata;
pub mod slot;
pub mod string;

pub use batch::WriteBatchLogData;
pub use database::{Database, KeyNumStats, SubKeyScanner};
pub use engine::{Config, RocksDbConfig, Storage};
pub use metadata::{Metadata, RedisType, DEFAULT_NAMESPACE};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Column family names, in creation order. The position of each name is part
/// of the on-disk contract: reopening must produce the same handle index, and
/// the write-batch wire format refers to column families by that index.
pub const CF_DEFAULT: &str = "default";
pub const CF_METADATA: &str = "metadata";
pub const CF_ZSET_SCORE: &str = "zset_score";
pub const CF_PUBSUB: &str = "pubsub";
pub const CF_SLOT_METADATA: &str = "slot_metadata";
pub const CF_SLOT: &str = "slot";

pub const COLUMN_FAMILY_NAMES: [&str; 6] = [
    CF_DEFAULT,
    CF_METADATA,
    CF_ZSET_SCORE,
    CF_PUBSUB,
    CF_SLOT_METADATA,
    CF_SLOT,
];

/// Column family ids as they appear in write-batch records
pub const CF_ID_DEFAULT: u32 = 0;
pub const CF_ID_METADATA: u32 = 1;
pub const CF_ID_ZSET_SCORE: u32 = 2;
pub const CF_ID_PUBSUB: u32 = 3;
pub const CF_ID_SLOT_METADATA: u32 = 4;
pub const CF_ID_SLOT: u32 = 5;

/// Storage-level error kinds. Engine errors are wrapped once at the boundary
/// that invoked the engine call so the original text is preserved.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open db: {0}")]
    DbOpen(String),
    #[error("backup: {0}")]
    DbBackup(String),
    #[error("failed to get WAL iterator: {0}")]
    DbGetWal(String),
    #[error("reach space limit")]
    SpaceLimit,
    #[error("key not found")]
    NotFound,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotOk(String),
    #[error(transparent)]
    Rocks(#[from] rocksdb::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
