use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::backends::RecordQueue;
use crate::common::{ReceiptToken, Record};

/// 📄 Suffix of a record file that is ready to be polled.
const RECORD_SUFFIX: &str = ".rec";
/// 🚧 Suffix of a record file still being written. Pollers ignore it.
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Deserialize, Clone)]
pub struct SpoolQueueConfig {
    /// 📁 Directory holding one file per record.
    pub directory: PathBuf,
    /// ⏳ How long a polled-but-unacked record stays invisible.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// 🔁 How often an empty poll re-scans the directory while waiting.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_rescan_interval_ms() -> u64 {
    250
}

/// 📬 A record queue backed by a spool directory: one file per record.
///
/// Producers drop `*.rec` files in (write a temp file, then rename, so a poller
/// never reads half a record). Polling leases files by name. Acking deletes the
/// file. A lease that is not acked within the visibility timeout lapses and the
/// file is handed out again. A crash forgets every lease, which is the same as
/// all of them lapsing at once. At-least-once, courtesy of `rename(2)`.
#[derive(Debug, Clone)]
pub(crate) struct SpoolQueue {
    config: SpoolQueueConfig,
    leases: Arc<Mutex<HashMap<String, Instant>>>,
}

impl SpoolQueue {
    pub(crate) async fn new(config: SpoolQueueConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory).await.with_context(|| {
            format!("💀 could not create the spool directory '{}'", config.directory.display())
        })?;
        Ok(Self {
            config,
            leases: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// 📮 Producer side: spool one record. Returns the file name it landed under.
    pub(crate) async fn enqueue(&self, body: &[u8]) -> Result<String> {
        // -- 🕰️ timestamp first so a directory listing sorts oldest-first
        let name = format!("{}-{}{}", Utc::now().format("%Y%m%dT%H%M%S%.9f"), Uuid::new_v4(), RECORD_SUFFIX);
        let final_path = self.config.directory.join(&name);
        let temp_path = self.config.directory.join(format!("{name}{TEMP_SUFFIX}"));
        tokio::fs::write(&temp_path, body)
            .await
            .with_context(|| format!("💀 could not write spool file '{}'", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("💀 could not publish spool file '{}'", final_path.display()))?;
        Ok(name)
    }

    async fn ready_file_names(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.config.directory)
            .await
            .with_context(|| format!("💀 could not list spool directory '{}'", self.config.directory.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(RECORD_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn try_lease(&self, max_records: usize) -> Result<Vec<Record>> {
        let names = self.ready_file_names().await?;
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        leases.retain(|_, expires_at| *expires_at > now);

        let mut polled = Vec::new();
        for name in names {
            if polled.len() >= max_records {
                break;
            }
            if leases.contains_key(&name) {
                continue;
            }
            let path = self.config.directory.join(&name);
            let body = match tokio::fs::read(&path).await {
                Ok(body) => body,
                // -- 🏃 acked by a sibling between the listing and the read. Fine.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("💀 could not read spool file '{}'", path.display())),
            };
            let enqueued_at = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            leases.insert(name.clone(), now + Duration::from_secs(self.config.visibility_timeout_secs));
            polled.push(Record::new(body, enqueued_at, ReceiptToken::new(name)));
        }
        Ok(polled)
    }
}

#[async_trait]
impl RecordQueue for SpoolQueue {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> Result<Vec<Record>> {
        let deadline = Instant::now() + wait;
        loop {
            let polled = self.try_lease(max_records).await?;
            let now = Instant::now();
            if !polled.is_empty() || now >= deadline {
                trace!(records = polled.len(), "📬 spool poll finished");
                return Ok(polled);
            }
            let nap = Duration::from_millis(self.config.rescan_interval_ms.max(1)).min(deadline - now);
            tokio::time::sleep(nap).await;
        }
    }

    async fn ack(&mut self, receipt: &ReceiptToken) -> Result<()> {
        let mut leases = self.leases.lock().await;
        match leases.get(receipt.as_str()) {
            Some(expires_at) if *expires_at > Instant::now() => {}
            _ => {
                leases.remove(receipt.as_str());
                bail!("💀 spool receipt '{}' is not leased (never polled, already acked, or lapsed)", receipt)
            }
        }
        let path = self.config.directory.join(receipt.as_str());
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("💀 could not delete acked spool file '{}'", path.display()))?;
        leases.remove(receipt.as_str());
        Ok(())
    }
}
