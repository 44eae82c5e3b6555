//! RocksDB-backed persistence.
//!
//! Column families:
//! - `documents`: latest snapshot per document (bincode, LZ4 compressed)
//! - `operations`: accepted operations, keyed by document and revision
//! - `leases`: ownership lease per document (instance UUID)
//!
//! Operation keys sort by document, then by revision:
//! ```text
//! ┌───────────────┬──────────────────┬──────────────────┐
//! │ id len (4, BE)│ document id bytes│ revision (8, BE) │
//! └───────────────┴──────────────────┴──────────────────┘
//! ```
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use tandem_core::Revision;
use uuid::Uuid;

use super::{decode, encode, Persistence, StoreError, StoredDocument};
use crate::document::{AcceptedOp, DocumentId, Snapshot};

const CF_DOCUMENTS: &str = "documents";
const CF_OPERATIONS: &str = "operations";
const CF_LEASES: &str = "leases";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPERATIONS, CF_LEASES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    /// Single-threaded mode: column families are fixed at open
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes lease read-modify-write
    lease_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            lease_lock: Mutex::new(()),
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

        match name {
            CF_DOCUMENTS => {
                // Snapshots are compressed by us already.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned per document
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_LEASES => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn document_prefix(document: &DocumentId) -> Vec<u8> {
        let id = document.as_str().as_bytes();
        let mut prefix = Vec::with_capacity(4 + id.len() + 8);
        prefix.extend_from_slice(&(id.len() as u32).to_be_bytes());
        prefix.extend_from_slice(id);
        prefix
    }

    fn operation_key(document: &DocumentId, revision: Revision) -> Vec<u8> {
        let mut key = Self::document_prefix(document);
        key.extend_from_slice(&revision.to_be_bytes());
        key
    }

    /// Iterate logged operations of a document with revision >= `from`.
    fn scan_operations(
        &self,
        document: &DocumentId,
        from: Revision,
        mut visit: impl FnMut(Revision, &[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = Self::document_prefix(document);
        let start = Self::operation_key(document, from);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(revision) = Self::key_revision(&prefix, &key) else {
                break;
            };
            visit(revision, &key, &value)?;
        }
        Ok(())
    }

    /// Revision of an operation key, if it belongs to the document of `prefix`.
    fn key_revision(prefix: &[u8], key: &[u8]) -> Option<Revision> {
        if key.len() != prefix.len() + 8 || !key.starts_with(prefix) {
            return None;
        }
        let mut rev_buf = [0u8; 8];
        rev_buf.copy_from_slice(&key[prefix.len()..]);
        Some(u64::from_be_bytes(rev_buf))
    }

    /// Newest logged revision, found with one reverse seek.
    fn last_logged_revision(&self, document: &DocumentId) -> Result<Option<Revision>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = Self::document_prefix(document);
        let end = Self::operation_key(document, Revision::MAX);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Self::key_revision(&prefix, &key))
            }
            None => Ok(None),
        }
    }

    fn load_snapshot(&self, document: &DocumentId) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, document.as_str().as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(decode(&bytes)?))
            }
            None => Ok(None),
        }
    }
}

impl Persistence for RocksStore {
    fn acquire(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError> {
        let cf = self.cf(CF_LEASES)?;
        let _guard = self.lease_lock.lock();
        let key = document.as_str().as_bytes();

        if let Some(bytes) = self.db.get_cf(&cf, key)? {
            let holder = Uuid::from_slice(&bytes)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            if holder != owner {
                return Err(StoreError::LeaseHeld {
                    document: document.clone(),
                    owner: holder,
                });
            }
            return Ok(());
        }
        self.db.put_cf_opt(&cf, key, owner.as_bytes(), &self.write_options())?;
        Ok(())
    }

    fn release(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError> {
        let cf = self.cf(CF_LEASES)?;
        let _guard = self.lease_lock.lock();
        let key = document.as_str().as_bytes();

        if let Some(bytes) = self.db.get_cf(&cf, key)? {
            if bytes.as_slice() == owner.as_bytes() {
                self.db.delete_cf_opt(&cf, key, &self.write_options())?;
            }
        }
        Ok(())
    }

    fn load(&self, document: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let snapshot = self.load_snapshot(document)?;
        let from = snapshot.as_ref().map_or(0, |s| s.revision) + 1;
        let operations = self.operations_since(document, from - 1)?;

        if snapshot.is_none() && operations.is_empty() {
            return Ok(None);
        }
        Ok(Some(StoredDocument {
            snapshot: snapshot.unwrap_or_else(Snapshot::empty),
            operations,
        }))
    }

    fn save_snapshot(&self, document: &DocumentId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;

        if let Some(existing) = self.load_snapshot(document)? {
            if existing.revision > snapshot.revision {
                return Ok(());
            }
        }

        let compressed = lz4_flex::compress_prepend_size(&encode(snapshot)?);

        // Snapshot and log compaction land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, document.as_str().as_bytes(), &compressed);
        self.scan_operations(document, 0, |revision, key, _| {
            if revision <= snapshot.revision {
                batch.delete_cf(&cf_ops, key);
            }
            Ok(())
        })?;

        self.db.write_opt(batch, &self.write_options())?;
        log::debug!(
            "Saved snapshot of {document} at revision {} ({} bytes compressed)",
            snapshot.revision,
            compressed.len()
        );
        Ok(())
    }

    fn append_operation(&self, op: &AcceptedOp) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;

        let floor = match self.last_logged_revision(&op.document_id)? {
            Some(revision) => revision,
            None => self.load_snapshot(&op.document_id)?.map_or(0, |s| s.revision),
        };
        if op.revision != floor + 1 {
            return Err(StoreError::OutOfOrder {
                document: op.document_id.clone(),
                expected: floor + 1,
                actual: op.revision,
            });
        }

        let key = Self::operation_key(&op.document_id, op.revision);
        self.db.put_cf_opt(&cf, key, encode(op)?, &self.write_options())?;
        Ok(())
    }

    fn operations_since(
        &self,
        document: &DocumentId,
        after: Revision,
    ) -> Result<Vec<AcceptedOp>, StoreError> {
        let mut operations = Vec::new();
        self.scan_operations(document, after + 1, |_, _, value| {
            operations.push(decode(value)?);
            Ok(())
        })?;
        Ok(operations)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
