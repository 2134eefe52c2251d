//! Storage engine wrapper
//!
//! Owns the RocksDB handle and the fixed column-family set, applies the
//! tuning contract at open, and funnels every write through the size-limit
//! and cluster-mode gates. Teardown is guarded by a reference count so
//! compaction-filter callbacks never observe a dangling handle.

use crate::backup::rmdir_recursively;
use crate::batch;
use crate::compaction_filter::{
    MetadataFilterFactory, PubSubFilterFactory, SlotKeyFilterFactory, SubKeyFilterFactory,
};
use crate::lock_manager::{LockManager, DEFAULT_LOCK_STRIPES};
use crate::metadata::extract_namespace_key;
use crate::slot::Slot;
use crate::{Error, Result, CF_METADATA, COLUMN_FAMILY_NAMES, GIB, MIB};
use parking_lot::{Mutex, RwLock};
use rocksdb::backup::{BackupEngine, BackupEngineInfo, BackupEngineOptions, RestoreOptions};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, CompactOptions, DBCompressionType,
    DBWALIterator, Env, Options, WriteBatch, DB,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Upper bound substituted when the configured IO rate limit is zero
pub const IO_RATE_LIMIT_MAX_MB: u64 = 1_024_000;

const TOTAL_SST_FILES_SIZE_PROPERTY: &str = "rocksdb.total-sst-files-size";

/// Storage section of the server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub cluster_enabled: bool,
    /// GiB; 0 disables the size limit
    pub max_db_size: u64,
    /// MB/s; 0 means the implementation maximum
    pub max_io_mb: u64,
    pub rocksdb: RocksDbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("./data/db"),
            backup_dir: PathBuf::from("./data/backup"),
            cluster_enabled: false,
            max_db_size: 0,
            max_io_mb: 500,
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// Engine tuning bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    pub max_open_files: i32,
    pub max_sub_compactions: u32,
    pub max_background_flushes: i32,
    pub max_background_compactions: i32,
    pub max_write_buffer_number: i32,
    pub write_buffer_size: u64,
    pub compression: String,
    pub stats_dump_period_sec: u32,
    pub enable_pipelined_write: bool,
    pub delayed_write_rate: u64,
    pub compaction_readahead_size: u64,
    pub target_file_size_base: u64,
    pub wal_ttl_seconds: u64,
    pub wal_size_limit_mb: u64,
    pub level0_slowdown_writes_trigger: i32,
    pub level0_stop_writes_trigger: i32,
    pub metadata_block_cache_size: u64,
    pub subkey_block_cache_size: u64,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_open_files: 4096,
            max_sub_compactions: 1,
            max_background_flushes: 2,
            max_background_compactions: 2,
            max_write_buffer_number: 2,
            write_buffer_size: 256 * MIB,
            compression: "snappy".to_string(),
            stats_dump_period_sec: 0,
            enable_pipelined_write: true,
            delayed_write_rate: 0,
            compaction_readahead_size: 2 * MIB,
            target_file_size_base: 256 * MIB,
            wal_ttl_seconds: 7 * 24 * 3600,
            wal_size_limit_mb: 5 * 1024,
            level0_slowdown_writes_trigger: 20,
            level0_stop_writes_trigger: 36,
            metadata_block_cache_size: 4 * GIB,
            subkey_block_cache_size: 8 * GIB,
        }
    }
}

fn compression_type(name: &str) -> DBCompressionType {
    match name {
        "no" | "none" => DBCompressionType::None,
        "lz4" => DBCompressionType::Lz4,
        "zstd" => DBCompressionType::Zstd,
        "zlib" => DBCompressionType::Zlib,
        _ => DBCompressionType::Snappy,
    }
}

pub(crate) struct RefState {
    pub(crate) closing: bool,
    pub(crate) refs: u32,
}

/// State shared with compaction-filter callbacks, which outlive any single
/// open/close cycle of the handle
pub(crate) struct StorageInner {
    pub(crate) config: Config,
    pub(crate) db: RwLock<Option<Arc<DB>>>,
    pub(crate) ref_state: Mutex<RefState>,
    pub(crate) reach_db_size_limit: AtomicBool,
    io_rate_limit_mb: AtomicU64,
    flush_count: AtomicU64,
    compaction_count: AtomicU64,
    lock_mgr: LockManager,
}

impl StorageInner {
    pub(crate) fn db(&self) -> Option<Arc<DB>> {
        self.db.read().clone()
    }

    pub(crate) fn incr_db_refs(&self) -> Result<()> {
        let mut st = self.ref_state.lock();
        if st.closing {
            return Err(Error::NotOk("db is closing".to_string()));
        }
        st.refs += 1;
        Ok(())
    }

    pub(crate) fn decr_db_refs(&self) -> Result<()> {
        let mut st = self.ref_state.lock();
        if st.refs == 0 {
            return Err(Error::NotOk("db refs was zero".to_string()));
        }
        st.refs -= 1;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    pub fn new(config: Config) -> Self {
        let io_rate_limit_mb = if config.max_io_mb == 0 {
            IO_RATE_LIMIT_MAX_MB
        } else {
            config.max_io_mb
        };
        Self {
            inner: Arc::new(StorageInner {
                config,
                db: RwLock::new(None),
                ref_state: Mutex::new(RefState {
                    closing: true,
                    refs: 0,
                }),
                reach_db_size_limit: AtomicBool::new(false),
                io_rate_limit_mb: AtomicU64::new(io_rate_limit_mb),
                flush_count: AtomicU64::new(0),
                compaction_count: AtomicU64::new(0),
                lock_mgr: LockManager::new(DEFAULT_LOCK_STRIPES),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.lock_mgr
    }

    pub fn db(&self) -> Result<Arc<DB>> {
        self.inner
            .db()
            .ok_or_else(|| Error::NotOk("db is not opened".to_string()))
    }

    pub fn cf_handle<'d>(&self, db: &'d DB, name: &str) -> Result<&'d rocksdb::ColumnFamily> {
        db.cf_handle(name)
            .ok_or_else(|| Error::NotOk(format!("column family {} is missing", name)))
    }

    pub fn open(&self) -> Result<()> {
        self.open_mode(false)
    }

    pub fn open_for_read_only(&self) -> Result<()> {
        self.open_mode(true)
    }

    fn open_mode(&self, read_only: bool) -> Result<()> {
        {
            let mut st = self.inner.ref_state.lock();
            st.closing = false;
            st.refs = 0;
        }

        let base = self.init_options();
        self.create_column_families(&base)?;

        let db_dir = &self.inner.config.db_dir;
        let start = Instant::now();
        let opened = if read_only {
            DB::open_cf_descriptors_read_only(
                &base,
                db_dir,
                self.column_family_descriptors(&base),
                false,
            )
        } else {
            DB::open_cf_descriptors(&base, db_dir, self.column_family_descriptors(&base))
        };
        let duration_ms = start.elapsed().as_millis();
        let db = match opened {
            Ok(db) => db,
            Err(e) => {
                error!(
                    "[storage] failed to load the data from disk: {} ms",
                    duration_ms
                );
                return Err(Error::DbOpen(e.to_string()));
            }
        };
        info!(
            "[storage] success to load the data from disk: {} ms",
            duration_ms
        );
        *self.inner.db.write() = Some(Arc::new(db));

        if !read_only {
            // surface a broken backup directory at open instead of at the
            // first bgsave
            self.open_backup_engine().map(drop)?;
        }

        Slot::new(self).check_cluster_enabled(self.inner.config.cluster_enabled)?;
        Ok(())
    }

    /// Ensure the fixed column-family set exists by opening a temporary
    /// read-write handle with create-missing enabled. A store that already
    /// carries every column family is left untouched.
    fn create_column_families(&self, base: &Options) -> Result<()> {
        let db_dir = &self.inner.config.db_dir;
        if let Ok(existing) = DB::list_cf(base, db_dir) {
            if COLUMN_FAMILY_NAMES
                .iter()
                .all(|name| existing.iter().any(|have| have == name))
            {
                return Ok(());
            }
        }
        let descriptors: Vec<_> = COLUMN_FAMILY_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, base.clone()))
            .collect();
        let tmp = DB::open_cf_descriptors(base, db_dir, descriptors)
            .map_err(|e| Error::DbOpen(e.to_string()))?;
        drop(tmp);
        Ok(())
    }

    fn init_options(&self) -> Options {
        let c = &self.inner.config.rocksdb;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.enable_statistics();
        opts.set_stats_dump_period_sec(c.stats_dump_period_sec);
        opts.optimize_level_style_compaction((512 * MIB) as usize);
        opts.set_max_open_files(c.max_open_files);
        opts.set_max_subcompactions(c.max_sub_compactions);
        opts.set_max_background_jobs(c.max_background_flushes + c.max_background_compactions);
        opts.set_max_write_buffer_number(c.max_write_buffer_number);
        opts.set_write_buffer_size(c.write_buffer_size as usize);
        opts.set_compression_type(compression_type(&c.compression));
        opts.set_enable_pipelined_write(c.enable_pipelined_write);
        opts.set_target_file_size_base(c.target_file_size_base);
        opts.set_max_manifest_file_size((64 * MIB) as usize);
        opts.set_max_log_file_size((256 * MIB) as usize);
        opts.set_keep_log_file_num(12);
        opts.set_wal_ttl_seconds(c.wal_ttl_seconds);
        opts.set_wal_size_limit_mb(c.wal_size_limit_mb);
        opts.add_compact_on_deletion_collector_factory(128_000, 64_000, 0.0);
        let io_mb = self.inner.io_rate_limit_mb.load(Ordering::Relaxed);
        opts.set_ratelimiter((io_mb * MIB) as i64, 100_000, 10);
        if c.delayed_write_rate > 0 {
            opts.set_delayed_write_rate(c.delayed_write_rate);
        }
        opts.set_compaction_readahead_size(c.compaction_readahead_size as usize);
        opts.set_level_zero_slowdown_writes_trigger(c.level0_slowdown_writes_trigger);
        opts.set_level_zero_stop_writes_trigger(c.level0_stop_writes_trigger);
        opts
    }

    /// Per-column-family options. The order of the returned descriptors is
    /// the creation order and must never change.
    fn column_family_descriptors(&self, base: &Options) -> Vec<ColumnFamilyDescriptor> {
        let c = &self.inner.config.rocksdb;

        let mut metadata_table = BlockBasedOptions::default();
        metadata_table.set_bloom_filter(10.0, true);
        let metadata_cache = Cache::new_lru_cache(c.metadata_block_cache_size as usize);
        metadata_table.set_block_cache(&metadata_cache);
        metadata_table.set_cache_index_and_filter_blocks(true);
        metadata_table.set_pin_l0_filter_and_index_blocks_in_cache(true);
        let mut metadata_opts = base.clone();
        metadata_opts.set_block_based_table_factory(&metadata_table);
        metadata_opts.set_compaction_filter_factory(MetadataFilterFactory);

        let mut subkey_table = BlockBasedOptions::default();
        subkey_table.set_bloom_filter(10.0, true);
        let subkey_cache = Cache::new_lru_cache(c.subkey_block_cache_size as usize);
        subkey_table.set_block_cache(&subkey_cache);
        subkey_table.set_cache_index_and_filter_blocks(true);
        subkey_table.set_pin_l0_filter_and_index_blocks_in_cache(true);
        let mut default_opts = base.clone();
        default_opts.set_block_based_table_factory(&subkey_table);
        default_opts
            .set_compaction_filter_factory(SubKeyFilterFactory::new(self.inner.clone()));
        let mut zset_score_opts = base.clone();
        zset_score_opts.set_block_based_table_factory(&subkey_table);
        zset_score_opts
            .set_compaction_filter_factory(SubKeyFilterFactory::new(self.inner.clone()));

        let mut pubsub_table = BlockBasedOptions::default();
        pubsub_table.set_bloom_filter(10.0, true);
        let mut pubsub_opts = base.clone();
        pubsub_opts.set_block_based_table_factory(&pubsub_table);
        pubsub_opts.set_compaction_filter_factory(PubSubFilterFactory);

        let mut slot_metadata_table = BlockBasedOptions::default();
        slot_metadata_table.set_bloom_filter(10.0, true);
        let slot_metadata_cache = Cache::new_lru_cache(c.metadata_block_cache_size as usize);
        slot_metadata_table.set_block_cache(&slot_metadata_cache);
        slot_metadata_table.set_cache_index_and_filter_blocks(true);
        slot_metadata_table.set_pin_l0_filter_and_index_blocks_in_cache(true);
        let mut slot_metadata_opts = base.clone();
        slot_metadata_opts.set_block_based_table_factory(&slot_metadata_table);

        let mut slot_table = BlockBasedOptions::default();
        slot_table.set_bloom_filter(10.0, true);
        let slot_cache = Cache::new_lru_cache(c.subkey_block_cache_size as usize);
        slot_table.set_block_cache(&slot_cache);
        slot_table.set_cache_index_and_filter_blocks(true);
        slot_table.set_pin_l0_filter_and_index_blocks_in_cache(true);
        let mut slot_opts = base.clone();
        slot_opts.set_block_based_table_factory(&slot_table);
        slot_opts.set_compaction_filter_factory(SlotKeyFilterFactory::new(self.inner.clone()));

        vec![
            ColumnFamilyDescriptor::new(crate::CF_DEFAULT, default_opts),
            ColumnFamilyDescriptor::new(crate::CF_METADATA, metadata_opts),
            ColumnFamilyDescriptor::new(crate::CF_ZSET_SCORE, zset_score_opts),
            ColumnFamilyDescriptor::new(crate::CF_PUBSUB, pubsub_opts),
            ColumnFamilyDescriptor::new(crate::CF_SLOT_METADATA, slot_metadata_opts),
            ColumnFamilyDescriptor::new(crate::CF_SLOT, slot_opts),
        ]
    }

    /// Block until no reader pins the handle, then drop it. Column-family
    /// handles are destroyed in creation order before the DB itself.
    pub fn close(&self) {
        let db = self.inner.db();
        let Some(db) = db else {
            return;
        };
        if let Err(e) = db.flush_wal(true) {
            warn!("[storage] failed to sync the WAL before close: {}", e);
        }
        drop(db);

        let mut st = self.inner.ref_state.lock();
        st.closing = true;
        while st.refs != 0 {
            drop(st);
            std::thread::sleep(Duration::from_millis(10));
            st = self.inner.ref_state.lock();
        }
        drop(st);

        *self.inner.db.write() = None;
    }

    pub fn is_closing(&self) -> bool {
        self.inner.ref_state.lock().closing
    }

    pub fn incr_db_refs(&self) -> Result<()> {
        self.inner.incr_db_refs()
    }

    pub fn decr_db_refs(&self) -> Result<()> {
        self.inner.decr_db_refs()
    }

    /// Atomic application of a write batch. In cluster mode the batch is
    /// scanned first and the slot-tracking mutations join the same commit.
    pub fn write(&self, mut batch: WriteBatch) -> Result<()> {
        if self.inner.reach_db_size_limit.load(Ordering::Relaxed) {
            return Err(Error::SpaceLimit);
        }
        if self.inner.config.cluster_enabled {
            let summary = batch::extract(batch.data())?;
            Slot::new(self).update_keys(&summary.put_keys, &summary.delete_keys, &mut batch)?;
        }
        let db = self.db()?;
        db.write(batch)?;
        Ok(())
    }

    /// Point delete; deletes are exempt from the size limit since they free
    /// space
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let db = self.db()?;
        let cf = self.cf_handle(&db, cf_name)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, key);
        if self.inner.config.cluster_enabled && cf_name == CF_METADATA {
            let (_, user_key) = extract_namespace_key(key);
            Slot::new(self).update_keys(&[], &[user_key.to_vec()], &mut batch)?;
        }
        db.write(batch)?;
        Ok(())
    }

    /// Inclusive range delete over the metadata column family:
    /// `[first_key, last_key)` as a range tombstone, then `last_key` itself
    pub fn delete_all(&self, first_key: &[u8], last_key: &[u8]) -> Result<()> {
        let db = self.db()?;
        let cf = self.cf_handle(&db, CF_METADATA)?;
        db.delete_range_cf(cf, first_key, last_key)?;
        self.delete(CF_METADATA, last_key)?;
        if self.inner.config.cluster_enabled {
            Slot::new(self).delete_all()?;
        }
        Ok(())
    }

    /// Apply a pre-serialized batch received from the replication leader
    pub fn write_raw_batch(&self, raw: &[u8]) -> Result<()> {
        if self.inner.reach_db_size_limit.load(Ordering::Relaxed) {
            return Err(Error::SpaceLimit);
        }
        let db = self.db()?;
        let replayed = batch::replay(raw, &db)?;
        db.write(replayed)?;
        Ok(())
    }

    pub fn get_wal_iter(&self, seq: u64) -> Result<DBWALIterator> {
        let db = self.db()?;
        let iter = db
            .get_updates_since(seq)
            .map_err(|e| Error::DbGetWal(e.to_string()))?;
        if !iter.valid() {
            return Err(Error::DbGetWal("iterator not valid".to_string()));
        }
        Ok(iter)
    }

    pub fn latest_seq(&self) -> Result<u64> {
        Ok(self.db()?.latest_sequence_number())
    }

    pub fn wal_has_new_data(&self, seq: u64) -> Result<bool> {
        Ok(seq <= self.latest_seq()?)
    }

    /// Range compaction across every column family
    pub fn compact(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let db = self.db()?;
        let mut opts = CompactOptions::default();
        opts.set_change_level(true);
        for name in COLUMN_FAMILY_NAMES {
            let cf = self.cf_handle(&db, name)?;
            db.compact_range_cf_opt(cf, begin, end, &opts);
        }
        self.incr_compaction_count(1);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let db = self.db()?;
        db.flush()?;
        self.incr_flush_count(1);
        Ok(())
    }

    /// Total live SST size across column families
    pub fn total_size(&self) -> Result<u64> {
        let db = self.db()?;
        let mut total = 0;
        for name in COLUMN_FAMILY_NAMES {
            let cf = self.cf_handle(&db, name)?;
            total += db
                .property_int_value_cf(cf, TOTAL_SST_FILES_SIZE_PROPERTY)?
                .unwrap_or(0);
        }
        Ok(total)
    }

    /// Edge-triggered size-limit check, run from the maintenance path
    pub fn check_db_size_limit(&self) -> Result<()> {
        let max_db_size = self.inner.config.max_db_size;
        let reach = max_db_size != 0 && self.total_size()? >= max_db_size * GIB;
        if self.inner.reach_db_size_limit.load(Ordering::Relaxed) == reach {
            return Ok(());
        }
        self.inner
            .reach_db_size_limit
            .store(reach, Ordering::Relaxed);
        if reach {
            warn!(
                "[storage] enable db size limit of {} GiB, switch to read-only mode",
                max_db_size
            );
        } else {
            warn!("[storage] disable db size limit, switch to read-write mode");
        }
        Ok(())
    }

    pub fn reach_db_size_limit(&self) -> bool {
        self.inner.reach_db_size_limit.load(Ordering::Relaxed)
    }

    /// Record a new IO rate limit; 0 selects the implementation maximum.
    /// The limiter is installed through the open options, so the new value
    /// takes effect at the next open.
    pub fn set_io_rate_limit(&self, max_io_mb: u64) {
        let max_io_mb = if max_io_mb == 0 {
            IO_RATE_LIMIT_MAX_MB
        } else {
            max_io_mb
        };
        self.inner
            .io_rate_limit_mb
            .store(max_io_mb, Ordering::Relaxed);
        info!("[storage] io rate limit set to {} MB/s", max_io_mb);
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.flush_count.load(Ordering::Relaxed)
    }

    pub fn incr_flush_count(&self, n: u64) {
        self.inner.flush_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn compaction_count(&self) -> u64 {
        self.inner.compaction_count.load(Ordering::Relaxed)
    }

    pub fn incr_compaction_count(&self, n: u64) {
        self.inner.compaction_count.fetch_add(n, Ordering::Relaxed);
    }

    // ---- backup engine ----

    /// The backup engine is opened per use: the engine snapshots the backup
    /// directory at open, and restores must observe files written since.
    pub(crate) fn open_backup_engine(&self) -> Result<BackupEngine> {
        let opts = BackupEngineOptions::new(&self.inner.config.backup_dir)
            .map_err(|e| Error::DbBackup(e.to_string()))?;
        let env = Env::new().map_err(|e| Error::DbBackup(e.to_string()))?;
        BackupEngine::open(&opts, &env).map_err(|e| Error::DbBackup(e.to_string()))
    }

    pub fn backup_info(&self) -> Result<Vec<BackupEngineInfo>> {
        Ok(self.open_backup_engine()?.get_backup_info())
    }

    pub fn create_backup(&self) -> Result<()> {
        info!("[storage] start to create new backup");
        let db = self.db()?;
        let mut engine = self.open_backup_engine()?;
        engine
            .create_new_backup_flush(&*db, true)
            .map_err(|e| Error::DbBackup(e.to_string()))?;
        info!(
            "[storage] success to create new backup at {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }

    /// Close the DB, restore the latest backup into `db_dir`, reopen
    pub fn restore_from_backup(&self) -> Result<()> {
        let mut engine = self.open_backup_engine()?;
        self.close();

        let db_dir = &self.inner.config.db_dir;
        if let Err(e) =
            engine.restore_from_latest_backup(db_dir, db_dir, &RestoreOptions::default())
        {
            error!("[storage] failed to restore: {}", e);
            return Err(Error::DbBackup(e.to_string()));
        }
        info!("[storage] restore from backup");

        self.open().map_err(|e| {
            error!("[storage] failed to reopen db: {}", e);
            Error::DbOpen(e.to_string())
        })
    }

    /// Two-phase purge: first by count, then by age when `max_hours` > 0
    pub fn purge_old_backups(&self, num_backups_to_keep: u32, backup_max_keep_hours: u32) {
        let mut engine = match self.open_backup_engine() {
            Ok(engine) => engine,
            Err(e) => {
                warn!("[storage] failed to open backup engine for purge: {}", e);
                return;
            }
        };
        let backup_infos = engine.get_backup_info();
        if backup_infos.len() > num_backups_to_keep as usize {
            let purge = backup_infos.len() - num_backups_to_keep as usize;
            info!("[storage] going to purge {} old backups", purge);
            for info in backup_infos.iter().take(purge) {
                info!(
                    "[storage] the old backup(id: {}) would be purged, created at: {}, size: {}, num files: {}",
                    info.backup_id, info.timestamp, info.size, info.num_files
                );
            }
            if let Err(e) = engine.purge_old_backups(num_backups_to_keep as usize) {
                warn!("[storage] purge old backups: {}", e);
            }
        }

        if backup_max_keep_hours == 0 {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        let backup_infos = engine.get_backup_info();
        let keep = backup_infos
            .iter()
            .filter(|info| info.timestamp + i64::from(backup_max_keep_hours) * 3600 >= now)
            .count();
        if keep < backup_infos.len() {
            for info in backup_infos.iter().take(backup_infos.len() - keep) {
                info!(
                    "[storage] the old backup(id: {}) would be purged because expired, created at: {}, size: {}, num files: {}",
                    info.backup_id, info.timestamp, info.size, info.num_files
                );
            }
            if let Err(e) = engine.purge_old_backups(keep) {
                warn!("[storage] purge expired backups: {}", e);
            }
        }
    }

    /// A follower expecting backup id `next_backup_id` wipes a diverged
    /// backup directory so the next backup starts clean
    pub fn purge_backup_if_need(&self, next_backup_id: u32) {
        let backup_infos = match self.backup_info() {
            Ok(infos) => infos,
            Err(e) => {
                warn!("[storage] failed to list backups: {}", e);
                return;
            }
        };
        if let Some(last) = backup_infos.last() {
            if last.backup_id != next_backup_id.wrapping_sub(1) {
                if let Err(e) = rmdir_recursively(&self.inner.config.backup_dir) {
                    warn!("[storage] failed to purge backup dir: {}", e);
                }
                if let Err(e) = std::fs::create_dir_all(&self.inner.config.backup_dir) {
                    warn!("[storage] failed to recreate backup dir: {}", e);
                }
            }
        }
    }

    pub(crate) fn inner(&self) -> &Arc<StorageInner> {
        &self.inner
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::{compose_namespace_key, Metadata, RedisType};
    use crate::slot::{slot_num_from_key, Slot};

    pub(crate) fn test_config(dir: &str, cluster_enabled: bool) -> Config {
        Config {
            db_dir: format!("{}/db", dir).into(),
            backup_dir: format!("{}/backup", dir).into(),
            cluster_enabled,
            max_db_size: 0,
            max_io_mb: 0,
            rocksdb: RocksDbConfig {
                metadata_block_cache_size: 16 * MIB,
                subkey_block_cache_size: 16 * MIB,
                write_buffer_size: 16 * MIB,
                ..RocksDbConfig::default()
            },
        }
    }

    fn open_temp_storage(cluster_enabled: bool) -> (Storage, String) {
        let dir = format!("/tmp/redrock_engine_test_{}", rand::random::<u64>());
        let storage = Storage::new(test_config(&dir, cluster_enabled));
        storage.open().unwrap();
        (storage, dir)
    }

    fn cleanup(storage: Storage, dir: &str) {
        storage.close();
        let _ = std::fs::remove_dir_all(dir);
    }

    fn put_metadata_batch(storage: &Storage, ns_key: &[u8], value: &[u8]) -> WriteBatch {
        let db = storage.db().unwrap();
        let cf = storage.cf_handle(&db, CF_METADATA).unwrap();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, ns_key, value);
        batch
    }

    #[test]
    fn test_open_write_reopen() {
        let (storage, dir) = open_temp_storage(false);
        let ns_key = compose_namespace_key(b"ns", b"k1");
        let value = Metadata::new(RedisType::Hash).encode();
        storage
            .write(put_metadata_batch(&storage, &ns_key, &value))
            .unwrap();
        storage.close();

        storage.open().unwrap();
        let db = storage.db().unwrap();
        let cf = storage.cf_handle(&db, CF_METADATA).unwrap();
        assert_eq!(db.get_cf(cf, &ns_key).unwrap(), Some(value));
        cleanup(storage, &dir);
    }

    #[test]
    fn test_latest_seq_advances_by_logical_ops() {
        let (storage, dir) = open_temp_storage(false);
        let before = storage.latest_seq().unwrap();
        let db = storage.db().unwrap();
        let cf = storage.cf_handle(&db, CF_METADATA).unwrap();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, b"\x02nsa", b"1");
        batch.put_cf(cf, b"\x02nsb", b"2");
        batch.delete_cf(cf, b"\x02nsc");
        drop(db);
        storage.write(batch).unwrap();
        assert_eq!(storage.latest_seq().unwrap(), before + 3);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_space_limit_rejects_writes() {
        let (storage, dir) = open_temp_storage(false);
        storage
            .inner
            .reach_db_size_limit
            .store(true, Ordering::Relaxed);
        let batch = put_metadata_batch(&storage, b"\x02nsk", b"v");
        assert!(matches!(storage.write(batch), Err(Error::SpaceLimit)));
        storage
            .inner
            .reach_db_size_limit
            .store(false, Ordering::Relaxed);
        let batch = put_metadata_batch(&storage, b"\x02nsk", b"v");
        storage.write(batch).unwrap();
        cleanup(storage, &dir);
    }

    #[test]
    fn test_check_db_size_limit_is_idempotent_when_unlimited() {
        let (storage, dir) = open_temp_storage(false);
        storage.check_db_size_limit().unwrap();
        assert!(!storage.reach_db_size_limit());
        storage.check_db_size_limit().unwrap();
        assert!(!storage.reach_db_size_limit());
        cleanup(storage, &dir);
    }

    #[test]
    fn test_delete_all_is_inclusive() {
        let (storage, dir) = open_temp_storage(false);
        for key in [b"a" as &[u8], b"b", b"c"] {
            let ns_key = compose_namespace_key(b"ns", key);
            let batch = put_metadata_batch(&storage, &ns_key, b"v");
            storage.write(batch).unwrap();
        }
        let first = compose_namespace_key(b"ns", b"a");
        let last = compose_namespace_key(b"ns", b"c");
        storage.delete_all(&first, &last).unwrap();

        let db = storage.db().unwrap();
        let cf = storage.cf_handle(&db, CF_METADATA).unwrap();
        for key in [b"a" as &[u8], b"b", b"c"] {
            let ns_key = compose_namespace_key(b"ns", key);
            assert_eq!(db.get_cf(cf, &ns_key).unwrap(), None);
        }
        drop(db);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_db_refs_protocol() {
        let (storage, dir) = open_temp_storage(false);
        storage.incr_db_refs().unwrap();
        storage.incr_db_refs().unwrap();
        storage.decr_db_refs().unwrap();
        storage.decr_db_refs().unwrap();
        assert!(storage.decr_db_refs().is_err());
        storage.close();
        assert!(storage.incr_db_refs().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_write_raw_batch_replays_into_column_families() {
        let (storage, dir) = open_temp_storage(false);
        let ns_key = compose_namespace_key(b"ns", b"raw");
        let raw = {
            let db = storage.db().unwrap();
            let cf = storage.cf_handle(&db, CF_METADATA).unwrap();
            let mut batch = WriteBatch::default();
            batch.put_cf(cf, &ns_key, b"value");
            batch.data().to_vec()
        };
        storage.write_raw_batch(&raw).unwrap();
        let db = storage.db().unwrap();
        let cf = storage.cf_handle(&db, CF_METADATA).unwrap();
        assert_eq!(db.get_cf(cf, &ns_key).unwrap(), Some(b"value".to_vec()));
        drop(db);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_cluster_mode_tracks_slots_atomically() {
        let (storage, dir) = open_temp_storage(true);
        let ns_key = compose_namespace_key(b"ns", b"a");
        let batch = put_metadata_batch(&storage, &ns_key, b"v");
        storage.write(batch).unwrap();

        let slot = Slot::new(&storage);
        let slot_num = slot_num_from_key(b"a");
        assert_eq!(slot.size(slot_num).unwrap(), 1);
        assert_eq!(slot.scan(slot_num, b"", 10).unwrap(), vec![b"a".to_vec()]);

        storage.delete(CF_METADATA, &ns_key).unwrap();
        assert_eq!(slot.size(slot_num).unwrap(), 0);
        assert!(slot.scan(slot_num, b"", 10).unwrap().is_empty());
        cleanup(storage, &dir);
    }

    #[test]
    fn test_cluster_status_mismatch_fails_open() {
        let dir = format!("/tmp/redrock_engine_test_{}", rand::random::<u64>());
        let storage = Storage::new(test_config(&dir, false));
        storage.open().unwrap();
        storage.close();

        let storage = Storage::new(test_config(&dir, true));
        assert!(matches!(storage.open(), Err(Error::DbOpen(_))));
        storage.close();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_wal_iterator_replays_committed_updates() {
        let (storage, dir) = open_temp_storage(false);
        let seq_before = storage.latest_seq().unwrap();
        let ns_key = compose_namespace_key(b"ns", b"walkey");
        let batch = put_metadata_batch(&storage, &ns_key, b"v");
        storage.write(batch).unwrap();

        let mut iter = storage.get_wal_iter(seq_before + 1).unwrap();
        let (seq, update) = iter.next().unwrap().unwrap();
        assert!(seq > seq_before);
        assert!(update.len() > 0);

        // sequences beyond the latest cannot be honored
        let latest = storage.latest_seq().unwrap();
        assert!(!storage.wal_has_new_data(latest + 1).unwrap());
        cleanup(storage, &dir);
    }

    #[test]
    fn test_backup_and_restore_preserves_data() {
        let (storage, dir) = open_temp_storage(false);
        let ns_key = compose_namespace_key(b"ns", b"durable");
        let batch = put_metadata_batch(&storage, &ns_key, b"v1");
        storage.write(batch).unwrap();
        storage.create_backup().unwrap();
        let seq_at_backup = storage.latest_seq().unwrap();

        storage.restore_from_backup().unwrap();
        assert_eq!(storage.latest_seq().unwrap(), seq_at_backup);
        let db = storage.db().unwrap();
        let cf = storage.cf_handle(&db, CF_METADATA).unwrap();
        assert_eq!(db.get_cf(cf, &ns_key).unwrap(), Some(b"v1".to_vec()));
        drop(db);
        cleanup(storage, &dir);
    }
}
