//! 🌊 The delivery pipeline: records in, batches out, nothing down the drain.
//!
//! 🧠 Knowledge graph:
//! ```text
//!  ingest(records) ──► BatchBuffer ──(seal: size | interval | shutdown)──► async_channel
//!                        ▲    │                                                │
//!                        │    └── SealTimer ticks the interval                  ▼
//!                        └────────── release(batch) ◄──── DeliveryWorker × sink_parallelism
//!                                                          │  sink.write_batch (retry within budget)
//!                                                          └► backup.put (retry until done or abort)
//! ```
//!
//! Every record that enters a sealed batch ends up in exactly one place: the
//! sink, or a backup object. Batches are never re-sealed, split or mutated
//! once sealed, so retries and the backup see exactly the same records.
//!
//! Per-batch states: `Open → Sealed → Delivering → Delivered`, or
//! `Delivering → Retrying → (Delivering …) → BackedUp`.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app_config::{BackupConfig, PipelineConfig};
use crate::backends::{BackupBackend, SinkBackend};
use crate::common::{BatchId, Record};
use crate::workers::Worker;

mod backup_object;
mod buffer;
mod delivery_worker;
mod ledger;
mod retry;
mod stats;

pub use backup_object::BackupObject;
pub use stats::StatsSnapshot;

use buffer::{BatchBuffer, BufferLimits, SealTimer};
use delivery_worker::{DeliverySettings, DeliverySignals, DeliveryWorker};
pub(crate) use retry::Backoff;
use retry::RetryPolicy;
use stats::PipelineStats;

/// 🏷️ The ways the pipeline says no, or says goodbye.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 🪣 Accepting these records would exceed `max_buffered_bytes`. Nothing was buffered.
    #[error("🪣 pipeline is full: {requested} bytes requested, {available} bytes available")]
    CapacityExhausted { requested: usize, available: usize },
    /// 🛑 Shutdown began. Nothing was buffered.
    #[error("🛑 pipeline is shutting down and accepts no more records")]
    ShuttingDown,
    /// 🧨 The backup store kept failing and the operator aborted. These records are not durable.
    #[error("💀 batch {batch_id} ({records} records) never reached the backup store: {reason}")]
    BackupStore {
        batch_id: BatchId,
        records: usize,
        reason: String,
    },
    #[error("💀 pipeline worker failed: {0}")]
    Worker(String),
    /// 🧾 The pipeline died with accepted records that reached neither the sink nor
    /// the backup store: the open batch, batches still queued, and the batch in hand.
    #[error("💀 {unfinished_records} accepted records were neither delivered nor backed up")]
    Unfinished {
        unfinished_records: usize,
        #[source]
        cause: Box<PipelineError>,
    },
    #[error("💀 pipeline invariant broken: {0}")]
    Invariant(String),
}

/// 🔀 Where a batch is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Sealed,
    Delivering,
    Retrying,
    Delivered,
    BackedUp,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::BackedUp)
    }

    /// ✅ The legal edges of the state machine. Everything else is a bug.
    pub fn can_become(&self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Open, Sealed)
                | (Sealed, Delivering)
                | (Delivering, Delivered)
                | (Delivering, Retrying)
                | (Retrying, Delivering)
                | (Retrying, BackedUp)
        )
    }
}

/// 🎫 The cloneable front door of a running pipeline. All the consumer ever sees.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    buffer: Arc<BatchBuffer>,
}

impl IngestHandle {
    /// 📥 Hand records to the pipeline. `Ok` means the pipeline owns their
    /// durability now, and the caller may acknowledge them upstream.
    pub fn ingest(&self, records: Vec<Record>) -> Result<(), PipelineError> {
        self.buffer.ingest(records)
    }
}

/// 🌊 A running delivery pipeline: one buffer, one seal timer, N delivery workers.
#[derive(Debug)]
pub struct DeliveryPipeline {
    buffer: Arc<BatchBuffer>,
    stats: Arc<PipelineStats>,
    timer: JoinHandle<anyhow::Result<()>>,
    workers: Vec<JoinHandle<anyhow::Result<()>>>,
    draining: CancellationToken,
}

impl DeliveryPipeline {
    /// 🚀 Spawn the seal timer and `sink_parallelism` delivery workers.
    ///
    /// Every worker gets its own clone of `sink` and `backup`; backends share
    /// their connections across clones. `abort` is the operator's last resort:
    /// it breaks the otherwise endless backup retry.
    pub(crate) fn start(
        pipeline_config: &PipelineConfig,
        backup_config: &BackupConfig,
        sink: SinkBackend,
        backup: BackupBackend,
        abort: CancellationToken,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let (sealed_tx, sealed_rx) = async_channel::unbounded();
        let buffer = Arc::new(BatchBuffer::new(
            BufferLimits {
                size_threshold_bytes: pipeline_config.size_threshold_bytes,
                interval: pipeline_config.interval(),
                max_buffered_bytes: pipeline_config.max_buffered_bytes,
            },
            sealed_tx,
            stats.clone(),
        ));
        let draining = CancellationToken::new();

        let settings = DeliverySettings {
            retry: RetryPolicy::new(
                pipeline_config.initial_backoff(),
                pipeline_config.max_backoff(),
                pipeline_config.retry_duration(),
            ),
            request_timeout: pipeline_config.request_timeout(),
            backup_prefix: backup_config.prefix.clone(),
            compression: backup_config.compression,
            backup_initial_backoff: pipeline_config.initial_backoff(),
            backup_max_backoff: pipeline_config.max_backoff(),
        };
        let signals = DeliverySignals {
            draining: draining.clone(),
            abort,
        };

        let parallelism = pipeline_config.sink_parallelism.max(1);
        let workers = (0..parallelism)
            .map(|id| {
                DeliveryWorker::new(
                    id,
                    sealed_rx.clone(),
                    sink.clone(),
                    backup.clone(),
                    buffer.clone(),
                    settings.clone(),
                    signals.clone(),
                    stats.clone(),
                )
                .start()
            })
            .collect();
        // -- 🔒 only the workers hold receivers; if they all die the channel closes and ingest says so
        drop(sealed_rx);

        let timer = SealTimer::new(buffer.clone(), draining.clone()).start();
        info!(
            workers = parallelism,
            size_threshold_bytes = pipeline_config.size_threshold_bytes,
            interval_secs = pipeline_config.interval_secs,
            retry_duration_secs = pipeline_config.retry_duration_secs,
            "🌊 delivery pipeline started"
        );

        Self {
            buffer,
            stats,
            timer,
            workers,
            draining,
        }
    }

    pub fn handle(&self) -> IngestHandle {
        IngestHandle {
            buffer: self.buffer.clone(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// 🛑 Stop accepting, seal what's open, let every in-flight batch reach the
    /// sink or the backup store, then report.
    ///
    /// Batches still retrying when this is called stop waiting for the sink
    /// and go to backup right away. The backup itself is still retried until
    /// it lands, unless the abort token fires.
    pub async fn shutdown(self) -> Result<StatsSnapshot, PipelineError> {
        debug!("🛑 delivery pipeline shutting down");
        self.buffer.close();
        self.draining.cancel();

        let mut first_failure = None;
        let timer_result = self.timer.await;
        let worker_results = futures::future::join_all(self.workers).await;
        for result in std::iter::once(timer_result).chain(worker_results) {
            let failure = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e
                    .downcast::<PipelineError>()
                    .unwrap_or_else(|other| PipelineError::Worker(format!("{other:#}"))),
                Err(join_error) => PipelineError::Worker(join_error.to_string()),
            };
            if first_failure.is_none() {
                first_failure = Some(failure);
            }
        }

        let snapshot = self.stats.snapshot();
        let unfinished_records = self.buffer.unfinished_records();
        info!(
            delivered = snapshot.records_delivered,
            backed_up = snapshot.records_backed_up,
            unfinished = unfinished_records,
            "🏁 delivery pipeline stopped"
        );
        match (first_failure, unfinished_records) {
            (None, 0) => Ok(snapshot),
            (None, n) => Err(PipelineError::Invariant(format!(
                "every worker finished cleanly yet {n} accepted records never landed"
            ))),
            (Some(failure), 0) => Err(failure),
            (Some(failure), n) => Err(PipelineError::Unfinished {
                unfinished_records: n,
                cause: Box::new(failure),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use tokio::time::Instant;

    use super::*;
    use crate::app_config::BackupStoreConfig;
    use crate::backends::in_mem::{FailureScript, InMemoryBackupStore, InMemorySink};
    use crate::common::tests::record;
    use crate::compression::CompressionFormat;

    fn pipeline_config(size_threshold_bytes: usize, retry_duration_secs: u64) -> PipelineConfig {
        PipelineConfig {
            retry_duration_secs,
            size_threshold_bytes,
            interval_secs: 60,
            max_buffered_bytes: 1024 * 1024,
            request_timeout_secs: 30,
            sink_parallelism: 1,
            initial_backoff_ms: 500,
            max_backoff_secs: 30,
        }
    }

    fn backup_config(compression: CompressionFormat) -> BackupConfig {
        BackupConfig {
            prefix: "failed/".to_string(),
            compression,
            store: BackupStoreConfig::InMemory,
        }
    }

    fn start(
        config: &PipelineConfig,
        compression: CompressionFormat,
        sink: &InMemorySink,
        backup: &InMemoryBackupStore,
        abort: CancellationToken,
    ) -> DeliveryPipeline {
        DeliveryPipeline::start(
            config,
            &backup_config(compression),
            SinkBackend::InMemory(sink.clone()),
            BackupBackend::InMemory(backup.clone()),
            abort,
        )
    }

    /// 🧪 Let spawned tasks catch up without moving the paused clock.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_three_small_records_wait_for_the_timer_and_land_in_the_sink() -> Result<()> {
        let sink = InMemorySink::new();
        let backup = InMemoryBackupStore::new();
        let pipeline = start(&pipeline_config(5 * 1024 * 1024, 300), CompressionFormat::Gzip, &sink, &backup, CancellationToken::new());

        pipeline
            .handle()
            .ingest(vec![record(r#"{"a":1}"#), record(r#"{"a":2}"#), record(r#"{"a":3}"#)])?;
        tokio::time::sleep(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(sink.attempts(), 0, "no flush before the interval");

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(sink.received().await.len(), 1);
        assert_eq!(sink.received_bodies().await.len(), 3);

        let stats = pipeline.shutdown().await?;
        assert!(backup.keys().await.is_empty(), "a happy sink means an empty backup");
        assert_eq!(stats.records_delivered, 3);
        assert_eq!(stats.records_backed_up, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_crossing_the_size_threshold_flushes_immediately() -> Result<()> {
        let sink = InMemorySink::new();
        let backup = InMemoryBackupStore::new();
        let pipeline = start(&pipeline_config(16, 300), CompressionFormat::Uncompressed, &sink, &backup, CancellationToken::new());

        pipeline.handle().ingest(vec![record("0123456789"), record("abcdefgh")])?;
        settle().await;
        assert_eq!(sink.received().await.len(), 1, "sealed and delivered with the clock frozen");

        pipeline.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_five_minutes_of_refusals_end_in_a_gzip_backup() -> Result<()> {
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        let config = pipeline_config(5 * 1024 * 1024, 300);
        let pipeline = start(&config, CompressionFormat::Gzip, &sink, &backup, CancellationToken::new());

        let bodies = [r#"{"doc":1}"#, r#"{"doc":2}"#, r#"{"doc":3}"#, r#"{"doc":4}"#];
        pipeline.handle().ingest(bodies.iter().map(|b| record(b)).collect())?;
        let first_attempt_at = Instant::now() + Duration::from_secs(60);

        // -- ⏳ interval seal at 60s, then a 300s retry budget
        tokio::time::sleep(Duration::from_secs(60 + 299)).await;
        settle().await;
        assert!(backup.keys().await.is_empty(), "still inside the budget");

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        let objects = backup.objects().await;
        assert_eq!(objects.len(), 1);
        let (key, object) = objects
            .iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("💀 backup store is empty"))?;
        assert!(key.starts_with("failed/") && key.ends_with(".gz"), "key was {key}");

        let landed_after = object.stored_at - first_attempt_at;
        assert!(landed_after >= Duration::from_secs(300), "backed up too early: {landed_after:?}");
        assert!(
            landed_after < Duration::from_secs(300) + config.max_backoff(),
            "backed up too late: {landed_after:?}"
        );

        let decoded = BackupObject::decode_records(CompressionFormat::Gzip, &object.body)?;
        let expected: Vec<Vec<u8>> = bodies.iter().map(|b| b.as_bytes().to_vec()).collect();
        assert_eq!(decoded, expected);
        assert!(sink.attempts() > 5, "it really did keep trying");

        let stats = pipeline.shutdown().await?;
        assert_eq!(stats.records_backed_up, 4);
        assert_eq!(stats.records_delivered, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_flaky_sink_recovers_inside_the_budget() -> Result<()> {
        let sink = InMemorySink::failing_first(3);
        let backup = InMemoryBackupStore::new();
        let pipeline = start(&pipeline_config(1, 300), CompressionFormat::Gzip, &sink, &backup, CancellationToken::new());

        pipeline.handle().ingest(vec![record("persistent")])?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(sink.attempts(), 4);
        assert_eq!(sink.received_bodies().await, vec![b"persistent".to_vec()]);
        let stats = pipeline.shutdown().await?;
        assert_eq!(stats.sink_failures, 3);
        assert!(backup.keys().await.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_zero_budget_goes_straight_to_backup() -> Result<()> {
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        let pipeline = start(&pipeline_config(1, 0), CompressionFormat::Snappy, &sink, &backup, CancellationToken::new());

        pipeline.handle().ingest(vec![record("nope")])?;
        settle().await;
        assert_eq!(sink.attempts(), 1);
        assert_eq!(backup.keys().await.len(), 1);
        pipeline.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_backup_store_is_retried_until_it_gives_in() -> Result<()> {
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        backup.fail_next_puts(4).await;
        let pipeline = start(&pipeline_config(1, 0), CompressionFormat::Zip, &sink, &backup, CancellationToken::new());

        pipeline.handle().ingest(vec![record("eventually")])?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;

        let stats = pipeline.shutdown().await?;
        assert_eq!(stats.backup_failures, 4);
        assert_eq!(stats.records_backed_up, 1);
        assert_eq!(backup.keys().await.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_abort_breaks_an_endless_backup_retry() -> Result<()> {
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        backup.fail_next_puts(usize::MAX).await;
        let abort = CancellationToken::new();
        let pipeline = start(&pipeline_config(1, 0), CompressionFormat::Uncompressed, &sink, &backup, abort.clone());

        pipeline.handle().ingest(vec![record("doomed")])?;
        tokio::time::sleep(Duration::from_secs(120)).await;
        abort.cancel();

        match pipeline.shutdown().await {
            Err(PipelineError::Unfinished { unfinished_records, cause }) => {
                assert_eq!(unfinished_records, 1);
                assert!(matches!(*cause, PipelineError::BackupStore { records: 1, .. }), "cause was {cause:?}");
            }
            other => panic!("💀 expected an Unfinished failure, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_dead_pipeline_owns_up_to_every_record_it_dropped() -> Result<()> {
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        backup.fail_next_puts(usize::MAX).await;
        let abort = CancellationToken::new();
        let pipeline = start(&pipeline_config(8, 0), CompressionFormat::Uncompressed, &sink, &backup, abort.clone());
        let handle = pipeline.handle();

        // -- 🧱 one batch stuck in the only worker, one queued behind it, one still open
        handle.ingest(vec![record("doomed!!")])?;
        settle().await;
        handle.ingest(vec![record("queued!!")])?;
        handle.ingest(vec![record("open")])?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        abort.cancel();
        settle().await;

        assert!(matches!(handle.ingest(vec![record("late")]), Err(PipelineError::Worker(_))));
        assert_eq!(pipeline.buffer.open_batch_len(), 1, "nobody left to seal it for");

        match pipeline.shutdown().await {
            Err(PipelineError::Unfinished { unfinished_records, cause }) => {
                assert_eq!(unfinished_records, 3, "stuck + queued + open");
                assert!(matches!(*cause, PipelineError::BackupStore { records: 1, .. }), "cause was {cause:?}");
            }
            other => panic!("💀 expected an Unfinished failure, got {other:?}"),
        }
        assert!(backup.keys().await.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_shutdown_flushes_the_open_batch_and_refuses_latecomers() -> Result<()> {
        let sink = InMemorySink::new();
        let backup = InMemoryBackupStore::new();
        let pipeline = start(&pipeline_config(1024, 300), CompressionFormat::Gzip, &sink, &backup, CancellationToken::new());
        let handle = pipeline.handle();

        handle.ingest(vec![record("almost"), record("forgotten")])?;
        let stats = pipeline.shutdown().await?;
        assert_eq!(stats.records_delivered, 2, "shutdown sealed and delivered the open batch");
        assert!(matches!(handle.ingest(vec![record("late")]), Err(PipelineError::ShuttingDown)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_shutdown_cuts_retries_short_and_backs_up() -> Result<()> {
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        let pipeline = start(&pipeline_config(1, 300), CompressionFormat::Gzip, &sink, &backup, CancellationToken::new());

        pipeline.handle().ingest(vec![record("stubborn")])?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = pipeline.shutdown().await?;
        assert_eq!(stats.records_backed_up, 1);
        assert_eq!(backup.keys().await.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_capacity_comes_back_after_delivery() -> Result<()> {
        let sink = InMemorySink::failing_forever();
        let backup = InMemoryBackupStore::new();
        let mut config = pipeline_config(8, 2);
        config.max_buffered_bytes = 8;
        let pipeline = start(&config, CompressionFormat::Uncompressed, &sink, &backup, CancellationToken::new());
        let handle = pipeline.handle();

        handle.ingest(vec![record("12345678")])?;
        assert!(matches!(
            handle.ingest(vec![record("x")]),
            Err(PipelineError::CapacityExhausted { requested: 1, available: 0 })
        ));

        // -- 🧯 the batch is backed up after its 2s budget and its bytes are released
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        handle.ingest(vec![record("x")])?;
        let stats = pipeline.shutdown().await?;
        assert_eq!(stats.ingest_rejections, 1);
        Ok(())
    }

    /// 🧮 Randomized scripts of sink failures, several workers, one question:
    /// does every record land in exactly one of {sink, backup}?
    #[tokio::test(start_paused = true)]
    async fn the_one_where_every_record_is_accounted_for_exactly_once() -> Result<()> {
        use rand::Rng;
        use std::collections::HashMap;

        for round in 0..8 {
            let (failures, threshold, parallelism) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(0..40usize), rng.gen_range(8..64usize), rng.gen_range(1..4usize))
            };
            let sink = InMemorySink::failing_first(failures);
            let backup = InMemoryBackupStore::new();
            let mut config = pipeline_config(threshold, 3);
            config.sink_parallelism = parallelism;
            let pipeline = start(&config, CompressionFormat::Snappy, &sink, &backup, CancellationToken::new());
            let handle = pipeline.handle();

            let mut all = Vec::new();
            for n in 0..200 {
                let body = format!("r{round}-{n}");
                handle.ingest(vec![record(&body)])?;
                all.push(body.into_bytes());
                if n % 17 == 0 {
                    tokio::time::sleep(Duration::from_millis(700)).await;
                }
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
            if round % 2 == 0 {
                // -- 🔧 half the rounds, the sink recovers before shutdown
                sink.set_script(FailureScript::AcceptAll).await;
            }
            let stats = pipeline.shutdown().await?;

            let mut landed: HashMap<Vec<u8>, usize> = HashMap::new();
            for body in sink.received_bodies().await {
                *landed.entry(body).or_default() += 1;
            }
            for object in backup.objects().await.values() {
                for body in BackupObject::decode_records(CompressionFormat::Snappy, &object.body)? {
                    *landed.entry(body).or_default() += 1;
                }
            }
            assert_eq!(landed.len(), all.len(), "round {round}: something went missing");
            assert!(all.iter().all(|body| landed.get(body) == Some(&1)), "round {round}: something landed twice");
            assert_eq!(stats.records_accounted_for(), 200);
            assert_eq!(stats.records_ingested, 200);
        }
        Ok(())
    }
}
