//! 🌊 spillway: a buffered, retrying delivery pipeline.
//!
//! Records come off an at-least-once queue, get packed into batches by size or
//! by age, and are written to a sink. A batch the sink keeps refusing is retried
//! within a time budget and then goes over the spillway into a backup store.
//! A record is acknowledged upstream only after the pipeline has taken
//! responsibility for it.
//!
//! 🦆

pub mod app_config;
pub mod backends;
pub mod common;
pub mod compression;
pub mod filter_policy;
pub mod pipeline;

mod consumer;
mod supervisor;
mod workers;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app_config::{AppConfig, FilterPolicyConfig, QueueConfig};
use crate::backends::file::SpoolQueue;
use crate::backends::{BackupBackend, QueueBackend, SinkBackend};
use crate::compression::CompressionFormat;
use crate::filter_policy::{ApplyOutcome, FileSubscriptionRegistry, FilterPolicy, FilterPolicySetter};
use crate::pipeline::{BackupObject, StatsSnapshot};
use crate::supervisor::Supervisor;

/// 🚀 Connect the backends, apply the filter policy if one is configured, and
/// deliver until `shutdown` fires.
///
/// `abort` is the second Ctrl-C: batches stuck retrying against a broken backup
/// store are abandoned and the run fails with [`pipeline::PipelineError::Unfinished`],
/// which counts every accepted record that landed nowhere.
pub async fn run(app_config: AppConfig, shutdown: CancellationToken, abort: CancellationToken) -> Result<StatsSnapshot> {
    if let Some(filter) = &app_config.filter_policy {
        apply_filter_policy(filter)
            .await
            .context("💀 could not apply the configured filter policy")?;
    }

    let queue = QueueBackend::from_config(&app_config.queue_config)
        .await
        .context("💀 could not open the record queue")?;
    let sink = SinkBackend::from_config(&app_config.sink_config, app_config.pipeline.request_timeout())
        .await
        .context("💀 could not open the sink")?;
    let backup = BackupBackend::from_config(&app_config.backup_config.store)
        .await
        .context("💀 could not open the backup store")?;

    Supervisor::new(app_config).run(queue, sink, backup, shutdown, abort).await
}

/// 🧹 Validate and register one filter policy in its file registry. Idempotent.
pub async fn apply_filter_policy(filter: &FilterPolicyConfig) -> Result<ApplyOutcome> {
    let policy = FilterPolicy::parse(filter.policy.clone())
        .with_context(|| format!("💀 filter policy for '{}' is not valid", filter.subscription))?;
    let mut registry = FileSubscriptionRegistry::new(&filter.registry);
    let outcome = registry.apply(&filter.subscription, &policy).await?;
    info!(subscription = %filter.subscription, outcome = ?outcome, "🧹 filter policy checked");
    Ok(outcome)
}

/// 📮 Spool an NDJSON file into the configured spool queue: one record per
/// non-blank line, after undoing `compression`. Returns how many were spooled.
pub async fn enqueue_lines(queue_config: &QueueConfig, payload: &[u8], compression: CompressionFormat) -> Result<usize> {
    let raw = compression
        .decompress(payload)
        .with_context(|| format!("💀 payload is not {compression:?}"))?;
    let lines = raw
        .split(|byte| *byte == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace));
    spool(queue_config, lines).await
}

/// ♻️ Put every record of a backup object back into the configured spool queue,
/// byte for byte, empty records included. Returns how many were spooled.
pub async fn replay_backup_object(queue_config: &QueueConfig, object: &[u8], compression: CompressionFormat) -> Result<usize> {
    let records = BackupObject::decode_records(compression, object)?;
    spool(queue_config, records.iter().map(Vec::as_slice)).await
}

async fn spool<'a>(queue_config: &QueueConfig, bodies: impl Iterator<Item = &'a [u8]>) -> Result<usize> {
    let QueueConfig::Spool(spool_config) = queue_config else {
        anyhow::bail!("💀 only a spool queue can be fed from outside the process. An in-memory queue forgets everything on exit.");
    };
    let queue = SpoolQueue::new(spool_config.clone()).await?;
    let mut spooled = 0;
    for body in bodies {
        queue.enqueue(body).await?;
        spooled += 1;
    }
    info!(spooled, directory = %spool_config.directory.display(), "📮 records spooled");
    Ok(spooled)
}
