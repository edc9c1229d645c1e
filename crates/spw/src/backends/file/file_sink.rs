use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::trace;

use crate::backends::Sink;
use crate::common::SealedBatch;

// -- 🚰 FileSinkConfig lives next to its FileSink bestie. One backend = one config = one file.
#[derive(Debug, Deserialize, Clone)]
pub struct FileSinkConfig {
    pub file_name: PathBuf,
}

/// 🚰 FileSink: appends every delivered batch to one NDJSON file. I/O only.
///
/// Unlike a migration target, a forwarder restarts. So this opens in append
/// mode: yesterday's deliveries stay where they were. The writer is shared
/// behind a Mutex so every delivery worker's clone writes whole batches,
/// never interleaved halves.
#[derive(Debug, Clone)]
pub(crate) struct FileSink {
    file_buf: Arc<Mutex<BufWriter<File>>>,
    sink_config: FileSinkConfig,
}

impl FileSink {
    pub(crate) async fn new(sink_config: FileSinkConfig) -> Result<Self> {
        if let Some(parent) = sink_config.file_name.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("💀 could not create the sink file's parent directory '{}'", parent.display())
            })?;
        }
        let file_handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink_config.file_name)
            .await
            .with_context(|| {
                format!(
                    "💀 The sink file '{}' could not be opened for appending. \
                     We stared at the path. The path stared back.",
                    sink_config.file_name.display()
                )
            })?;
        Ok(Self {
            file_buf: Arc::new(Mutex::new(BufWriter::new(file_handle))),
            sink_config,
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write_batch(&mut self, batch: &SealedBatch) -> Result<()> {
        trace!(
            batch_id = %batch.id(),
            records = batch.len(),
            "📬 batch walked into the file sink. writing it all down"
        );
        let payload = batch.to_ndjson();
        let mut file_buf = self.file_buf.lock().await;
        file_buf.write_all(&payload).await.with_context(|| {
            format!("💀 failed to append batch {} to '{}'", batch.id(), self.sink_config.file_name.display())
        })?;
        // -- 🚽 a batch only counts as delivered once it left our buffer
        file_buf
            .flush()
            .await
            .with_context(|| format!("💀 failed to flush '{}'", self.sink_config.file_name.display()))
    }

    /// 🗑️ Flush and take a bow. Async Drop is not a thing, so this has to be explicit.
    async fn close(&mut self) -> Result<()> {
        self.file_buf.lock().await.flush().await.context(
            "💀 Error flushing the sink file. The bytes could SEE the disk. They did not make it.",
        )
    }
}
