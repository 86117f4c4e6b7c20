//! RocksDB-backed key/value store with expiry.
//!
//! Values are wrapped in an [`Envelope`] carrying the absolute expiry
//! (seconds since epoch), bincode-encoded and LZ4-compressed:
//!
//! ```text
//! key:   utf-8 key bytes
//! value: lz4( bincode( Envelope { expires_at, value } ) )
//! ```
//!
//! Expired keys read as absent and are deleted on sight; `purge_expired`
//! sweeps the whole keyspace.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{KvStore, StoreError};

const CF_KV: &str = "kv";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Stored value with its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    expires_at: u64,
    value: String,
}

impl Envelope {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (env, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(env)
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4-compressed.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_KV, cf_opts)],
        )?;

        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_KV)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_KV}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf()?;
        let Some(bytes) = self.db.get_cf(cf, key.as_bytes())? else {
            return Ok(None);
        };
        let env = Envelope::decode(&bytes)?;
        if env.is_expired(now_secs()) {
            self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
            return Ok(None);
        }
        Ok(Some(env.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let env = Envelope {
            expires_at: now_secs().saturating_add(ttl.as_secs()),
            value: value.to_string(),
        };
        self.db
            .put_cf_opt(cf, key.as_bytes(), env.encode()?, &self.write_opts())?;
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let cf = self.cf()?;
        let now = now_secs();
        let mut batch = WriteBatch::default();
        let mut count = 0;

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            // Undecodable values are treated as garbage and dropped too.
            let expired = Envelope::decode(&value).map_or(true, |env| env.is_expired(now));
            if expired {
                batch.delete_cf(cf, &key);
                count += 1;
            }
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }
}
