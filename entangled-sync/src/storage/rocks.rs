//! RocksDB-backed topic store.
//!
//! Column families:
//! - `topics` — one record per topic name (bincode, LZ4 compressed)
//!
//! RocksDB calls block, so the [`Datastore`] impl moves them onto the
//! blocking pool with `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};

use super::{Datastore, StoreError, TopicRecord};

const CF_TOPICS: &str = "topics";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, an upsert must be durable before notify)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("entangled_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

/// RocksDB topic store. Cheap to clone.
#[derive(Clone)]
pub struct RocksDatastore {
    inner: Arc<Inner>,
}

impl RocksDatastore {
    /// Open the store, creating the database and column family if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptor = ColumnFamilyDescriptor::new(CF_TOPICS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![descriptor],
        )?;

        log::info!("Opened topic store at {}", config.path.display());
        Ok(Self {
            inner: Arc::new(Inner { db, config }),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        // Topics are only ever fetched by name.
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Store a topic record, replacing any previous one.
    pub fn save(&self, record: &TopicRecord) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let compressed = lz4_flex::compress_prepend_size(&record.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.config.sync_writes);
        self.inner
            .db
            .put_cf_opt(cf, record.name.as_bytes(), &compressed, &write_opts)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<TopicRecord>, StoreError> {
        let cf = self.cf()?;
        match self.inner.db.get_cf(cf, name.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                TopicRecord::decode(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Names of every stored topic, in key order.
    pub fn list_topics(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut names = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            names.push(name);
        }
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.inner.db.delete_cf(cf, name.as_bytes())?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner
            .db
            .cf_handle(CF_TOPICS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_TOPICS}' not found")))
    }
}

#[async_trait]
impl Datastore for RocksDatastore {
    async fn find_one(&self, name: &str) -> Result<Option<TopicRecord>, StoreError> {
        let store = self.clone();
        let name = name.to_owned();
        tokio::task::spawn_blocking(move || store.load(&name)).await?
    }

    async fn upsert(&self, record: &TopicRecord) -> Result<(), StoreError> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.save(&record)).await?
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
