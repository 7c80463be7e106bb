//! RocksDB-backed [`SnapshotStore`].
//!
//! Column families:
//! - `snapshots` — one LZ4-compressed blob per row, keyed by the 16 id bytes
//! - `metadata`  — bincode [`SnapshotMetadata`] per row, same key
//!
//! Snapshot and metadata are written in one batch.

use log::{debug, info};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tandem_core::DocumentId;
use uuid::Uuid;

use super::{ChangeFeed, RowChanges, RowFilter, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory.
    pub path: PathBuf,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    /// Bloom filter bits per key.
    pub bloom_filter_bits: i32,
    /// fsync every write.
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
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

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: Uuid,
    /// Number of writes so far.
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since the epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(id: DocumentId) -> Self {
        let now = unix_now();
        Self {
            id: id.0,
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Metadata(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Metadata(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Durable snapshot store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    feed: ChangeFeed,
}

impl RocksStore {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            feed: ChangeFeed::new(),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        // Snapshot values are already LZ4 framed.
        match name {
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }

        opts
    }

    pub fn metadata(&self, id: DocumentId) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Ids of every stored row.
    pub fn list_snapshots(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Metadata(format!("invalid key of {} bytes", key.len())))?;
            ids.push(DocumentId(Uuid::from_bytes(bytes)));
        }
        Ok(ids)
    }

    /// Delete a row. Returns whether it existed.
    pub fn delete_snapshot(&self, id: DocumentId) -> Result<bool, StoreError> {
        let existed = self.metadata(id)?.is_some();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, id.as_bytes());
        self.db.write(batch)?;
        if existed {
            self.feed.notify(id);
        }
        Ok(existed)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }
}

impl SnapshotStore for RocksStore {
    fn get_snapshot(&self, id: DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression {
                    id,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn put_snapshot(&self, id: DocumentId, blob: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(blob);

        let mut meta = self.metadata(id)?.unwrap_or_else(|| SnapshotMetadata::new(id));
        meta.version += 1;
        meta.snapshot_size = blob.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        debug!(
            "Stored snapshot {id} v{} ({} -> {} bytes)",
            meta.version, meta.snapshot_size, meta.compressed_size
        );

        self.feed.notify(id);
        Ok(())
    }

    fn on_row_changed(&self, table: &str, filter: RowFilter) -> RowChanges {
        self.feed.subscribe(table, filter)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DOCUMENTS_TABLE;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_roundtrip_and_metadata() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        let blob = br#"{"columns":[],"tasks":[]}"#.repeat(20);

        assert_eq!(store.get_snapshot(id).unwrap(), None);
        store.put_snapshot(id, &blob).unwrap();
        store.put_snapshot(id, &blob).unwrap();

        assert_eq!(store.get_snapshot(id).unwrap(), Some(blob.clone()));
        let meta = store.metadata(id).unwrap().unwrap();
        assert_eq!(meta.id, id.0);
        assert_eq!(meta.version, 2);
        assert_eq!(meta.snapshot_size, blob.len() as u64);
        assert!(meta.compressed_size < meta.snapshot_size);
    }

    #[test]
    fn test_snapshots_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = DocumentId::new();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put_snapshot(id, b"{\"title\":\"A\"}").unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(
            store.get_snapshot(id).unwrap().as_deref(),
            Some(&b"{\"title\":\"A\"}"[..])
        );
        assert_eq!(store.list_snapshots().unwrap(), vec![id]);
    }

    #[test]
    fn test_delete_snapshot() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        store.put_snapshot(id, b"x").unwrap();

        assert!(store.delete_snapshot(id).unwrap());
        assert!(!store.delete_snapshot(id).unwrap());
        assert_eq!(store.get_snapshot(id).unwrap(), None);
        assert!(store.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_rows_are_isolated() {
        let (_dir, store) = open_temp();
        let a = DocumentId::new();
        let b = DocumentId::new();
        store.put_snapshot(a, b"a").unwrap();
        store.put_snapshot(b, b"b").unwrap();

        assert_eq!(store.get_snapshot(a).unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(store.get_snapshot(b).unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(store.list_snapshots().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_put_notifies_change_feed() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        let mut changes = store.on_row_changed(DOCUMENTS_TABLE, RowFilter::Id(id));

        store.put_snapshot(DocumentId::new(), b"other").unwrap();
        store.put_snapshot(id, b"mine").unwrap();

        assert_eq!(changes.recv().await.map(|c| c.id), Some(id));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("tandem_data"));
        assert!(!config.sync_writes);
    }
}
