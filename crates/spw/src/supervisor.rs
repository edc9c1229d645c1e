//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where records pile up in queues..."
//! 🎬 "One supervisor dared to deliver them all. At least once."
//!
//! 📦 The Supervisor wires a queue, a pipeline and a consumer together, waits
//! for someone to say stop, then drains everything in the right order:
//! stop polling first, then let the pipeline finish every batch it accepted.
//!
//! ⚠️ The consumer and the delivery workers are the supervisor's private minions.
//! Nothing outside this crate starts them directly.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::{BackupBackend, QueueBackend, SinkBackend};
use crate::consumer::BatchConsumer;
use crate::pipeline::{DeliveryPipeline, StatsSnapshot};
use crate::workers::Worker;

pub(crate) struct Supervisor {
    app_config: AppConfig,
}

impl Supervisor {
    pub(crate) fn new(app_config: AppConfig) -> Self {
        Self { app_config }
    }

    /// 🚀 Run until `shutdown` (graceful) or `abort` (give up on stuck backups) fires,
    /// or until the pipeline refuses records for good.
    pub(crate) async fn run(
        self,
        queue: QueueBackend,
        sink: SinkBackend,
        backup: BackupBackend,
        shutdown: CancellationToken,
        abort: CancellationToken,
    ) -> Result<StatsSnapshot> {
        let pipeline = DeliveryPipeline::start(
            &self.app_config.pipeline,
            &self.app_config.backup_config,
            sink,
            backup,
            abort.clone(),
        );

        let stop_polling = shutdown.child_token();
        let mut consumer = BatchConsumer::new(
            queue,
            pipeline.handle(),
            self.app_config.consumer.clone(),
            stop_polling.clone(),
        )
        .start();

        let consumed = tokio::select! {
            consumed = &mut consumer => consumed,
            _ = abort.cancelled() => {
                warn!("🧨 abort requested: no more polling, in-flight backups will be abandoned");
                stop_polling.cancel();
                consumer.await
            }
        };
        match consumed {
            Ok(Ok(())) => info!("📬 consumer stopped, draining the pipeline"),
            Ok(Err(e)) => error!(error = %format!("{e:#}"), "💀 consumer failed, draining the pipeline anyway"),
            Err(join_error) => error!(error = %join_error, "💀 consumer task panicked, draining the pipeline anyway"),
        }

        let stats = pipeline
            .shutdown()
            .await
            .context("💀 the pipeline could not finish every batch it accepted")?;
        info!(
            ingested = stats.records_ingested,
            delivered = stats.records_delivered,
            backed_up = stats.records_backed_up,
            "🏁 supervisor done"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backends::in_mem::{InMemoryBackupStore, InMemoryQueue, InMemorySink};
    use crate::compression::CompressionFormat;
    use crate::pipeline::{BackupObject, PipelineError};

    fn app_config(retry_duration_secs: u64) -> AppConfig {
        let raw = format!(
            r#"
queue_config = "InMemory"
sink_config = "InMemory"

[backup_config]
prefix = "failed/"
compression = "GZIP"
store = "InMemory"

[pipeline]
retry_duration_secs = {retry_duration_secs}
size_threshold_bytes = 64
max_buffered_bytes = 4096
interval_secs = 5

[consumer]
poll_wait_secs = 1
"#
        );
        toml::from_str(&raw).expect("💀 test config should parse")
    }

    async fn fill(queue: &InMemoryQueue, count: usize) {
        for i in 0..count {
            queue.push(format!("{{\"event\":{i}}}").into_bytes()).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_everything_goes_to_plan() -> Result<()> {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let sink = InMemorySink::new();
        let backup = InMemoryBackupStore::new();
        fill(&queue, 25).await;

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(Supervisor::new(app_config(300)).run(
            QueueBackend::InMemory(queue.clone()),
            SinkBackend::InMemory(sink.clone()),
            BackupBackend::InMemory(backup.clone()),
            shutdown.clone(),
            CancellationToken::new(),
        ));
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        let stats = running.await??;

        assert_eq!(stats.records_ingested, 25);
        assert_eq!(stats.records_delivered, 25);
        assert_eq!(stats.records_backed_up, 0);
        assert_eq!(queue.acked_count().await, 25);
        assert_eq!(sink.received_bodies().await.len(), 25);
        assert!(backup.keys().await.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_index_is_down_and_the_spillway_catches_everything() -> Result<()> {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        fill(&queue, 25).await;

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(Supervisor::new(app_config(0)).run(
            QueueBackend::InMemory(queue.clone()),
            SinkBackend::InMemory(sink.clone()),
            BackupBackend::InMemory(backup.clone()),
            shutdown.clone(),
            CancellationToken::new(),
        ));
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        let stats = running.await??;

        assert_eq!(stats.records_delivered, 0);
        assert_eq!(stats.records_backed_up, 25);
        let mut recovered = Vec::new();
        for (key, object) in backup.objects().await {
            assert!(key.starts_with("failed/") && key.ends_with(".gz"), "unexpected key {key}");
            recovered.extend(BackupObject::decode_records(CompressionFormat::Gzip, &object.body)?);
        }
        recovered.sort();
        let mut expected: Vec<Vec<u8>> = (0..25).map(|i| format!("{{\"event\":{i}}}").into_bytes()).collect();
        expected.sort();
        assert_eq!(recovered, expected, "every record lands in a backup object exactly once");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_abort_gives_up_on_a_backup_store_that_never_answers() -> Result<()> {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        backup.fail_next_puts(usize::MAX).await;
        fill(&queue, 3).await;

        let abort = CancellationToken::new();
        let running = tokio::spawn(Supervisor::new(app_config(0)).run(
            QueueBackend::InMemory(queue.clone()),
            SinkBackend::InMemory(sink.clone()),
            BackupBackend::InMemory(backup.clone()),
            CancellationToken::new(),
            abort.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(60)).await;
        abort.cancel();

        let err = running.await?.expect_err("aborting a stuck backup must fail loudly");
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Unfinished { unfinished_records, cause }) => {
                assert_eq!(*unfinished_records, 3, "all three accepted records are unaccounted for");
                assert!(matches!(**cause, PipelineError::BackupStore { .. }), "cause was {cause:?}");
            }
            _ => panic!("💀 unexpected error {err:#}"),
        }
        assert!(backup.keys().await.is_empty());
        Ok(())
    }
}
