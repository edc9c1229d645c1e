//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 Queues pour records in, Sinks slurp batches up, Backup Stores catch
//! whatever the Sink spat back out. In between, the pipeline does the thinking.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait → concrete impls → `*Backend` enum → `from_config` resolver.
//! - [`RecordQueue`]: at-least-once, unordered. `poll` leases, `ack` deletes.
//! - [`Sink`]: one call per sealed batch, batch-atomic. I/O only, no retries.
//! - [`BackupStore`]: opaque bytes under a key. I/O only, no retries.
//! - Retrying, backing off and routing to backup all live in the pipeline.
//!   Ancient proverb: "He who puts business logic in the Sink, debugs in production."
//!
//! 🦆 The duck is here because every file must have one. This is law.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::app_config::{BackupStoreConfig, QueueConfig, SinkConfig};
use crate::common::{ReceiptToken, Record, SealedBatch};

pub(crate) mod elasticsearch;
pub(crate) mod file;
pub(crate) mod in_mem;

pub use elasticsearch::{ElasticsearchSinkConfig, IndexRotation};
pub use file::{DirectoryBackupConfig, FileSinkConfig, SpoolQueueConfig};

// ===== Record Queue =====

/// 📬 A durable, at-least-once, order-agnostic buffer of inbound records.
///
/// # Contract 📜
/// - `poll` returns up to `max_records` records, waiting at most `wait` for the
///   first one to show up. An empty `Vec` means "nothing yet", not EOF.
/// - Polled records are leased, not removed. Unacknowledged leases expire and
///   the records become visible again. That's the at-least-once part.
/// - `ack` deletes a leased record for good. Acking a receipt whose lease has
///   already expired is an error; the record may already be back in line.
#[async_trait]
pub(crate) trait RecordQueue: std::fmt::Debug {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> Result<Vec<Record>>;
    async fn ack(&mut self, receipt: &ReceiptToken) -> Result<()>;
}

/// 🎭 The many faces of a Record Queue.
#[derive(Debug, Clone)]
pub(crate) enum QueueBackend {
    InMemory(in_mem::InMemoryQueue),
    Spool(file::SpoolQueue),
}

impl QueueBackend {
    pub(crate) async fn from_config(config: &QueueConfig) -> Result<Self> {
        Ok(match config {
            QueueConfig::InMemory => Self::InMemory(in_mem::InMemoryQueue::new(Duration::from_secs(30))),
            QueueConfig::Spool(spool_config) => Self::Spool(file::SpoolQueue::new(spool_config.clone()).await?),
        })
    }
}

#[async_trait]
impl RecordQueue for QueueBackend {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> Result<Vec<Record>> {
        match self {
            Self::InMemory(queue) => queue.poll(max_records, wait).await,
            Self::Spool(queue) => queue.poll(max_records, wait).await,
        }
    }

    async fn ack(&mut self, receipt: &ReceiptToken) -> Result<()> {
        match self {
            Self::InMemory(queue) => queue.ack(receipt).await,
            Self::Spool(queue) => queue.ack(receipt).await,
        }
    }
}

// ===== Sink =====

/// 🕳️ A sink that accepts a whole sealed batch as one logical write.
///
/// # Contract 📜
/// - `write_batch` succeeds only if every record in the batch was accepted.
///   Partial success is failure; the pipeline backs up the whole batch.
/// - `close` flushes and releases. MUST be called. Skipping it is a bug and also rude.
#[async_trait]
pub(crate) trait Sink: std::fmt::Debug {
    async fn write_batch(&mut self, batch: &SealedBatch) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// 🎭 The many faces of a Sink. Cloned once per delivery worker; every variant
/// shares its underlying client/handle across clones.
#[derive(Debug, Clone)]
pub(crate) enum SinkBackend {
    InMemory(in_mem::InMemorySink),
    File(file::FileSink),
    Elasticsearch(elasticsearch::ElasticsearchSink),
}

impl SinkBackend {
    /// `request_timeout` bounds each network call a sink makes on its own.
    pub(crate) async fn from_config(config: &SinkConfig, request_timeout: Duration) -> Result<Self> {
        Ok(match config {
            SinkConfig::InMemory => Self::InMemory(in_mem::InMemorySink::new()),
            SinkConfig::File(file_config) => Self::File(file::FileSink::new(file_config.clone()).await?),
            SinkConfig::Elasticsearch(es_config) => {
                Self::Elasticsearch(elasticsearch::ElasticsearchSink::new(es_config.clone(), request_timeout).await?)
            }
        })
    }
}

#[async_trait]
impl Sink for SinkBackend {
    async fn write_batch(&mut self, batch: &SealedBatch) -> Result<()> {
        match self {
            Self::InMemory(sink) => sink.write_batch(batch).await,
            Self::File(sink) => sink.write_batch(batch).await,
            Self::Elasticsearch(sink) => sink.write_batch(batch).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            Self::InMemory(sink) => sink.close().await,
            Self::File(sink) => sink.close().await,
            Self::Elasticsearch(sink) => sink.close().await,
        }
    }
}

// ===== Backup Store =====

/// 🧯 Durable blob storage for batches the sink would not take.
///
/// # Contract 📜
/// - `put` returns `Ok` only once the body is durably stored under `key`.
/// - Writing the same key twice overwrites; keys carry a batch id so that
///   only happens when a retried put already half-landed.
#[async_trait]
pub(crate) trait BackupStore: std::fmt::Debug {
    async fn put(&mut self, key: &str, body: &[u8]) -> Result<()>;
}

/// 🎭 The many faces of a Backup Store.
#[derive(Debug, Clone)]
pub(crate) enum BackupBackend {
    InMemory(in_mem::InMemoryBackupStore),
    Directory(file::DirectoryBackupStore),
}

impl BackupBackend {
    pub(crate) async fn from_config(config: &BackupStoreConfig) -> Result<Self> {
        Ok(match config {
            BackupStoreConfig::InMemory => Self::InMemory(in_mem::InMemoryBackupStore::new()),
            BackupStoreConfig::Directory(dir_config) => {
                Self::Directory(file::DirectoryBackupStore::new(dir_config.clone()).await?)
            }
        })
    }
}

#[async_trait]
impl BackupStore for BackupBackend {
    async fn put(&mut self, key: &str, body: &[u8]) -> Result<()> {
        match self {
            Self::InMemory(store) => store.put(key, body).await,
            Self::Directory(store) => store.put(key, body).await,
        }
    }
}
