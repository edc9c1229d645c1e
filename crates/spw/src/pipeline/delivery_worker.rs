//! 🎬 *[a channel fills with sealed batches. somewhere, a sink waits.]*
//! *[sometimes the sink says no. the worker does not take it personally.]*
//!
//! 🚚 The DeliveryWorker takes sealed batches off the channel and makes sure
//! each one ends up somewhere durable: the sink if it will have it, the backup
//! store if it won't. It retries the sink within the time budget, then gives
//! up on the sink and retries the backup store until it works. Only an abort
//! makes it stop trying.
//!
//! 🦆 (the duck has no comment at this time)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backup_object::BackupObject;
use super::buffer::BatchBuffer;
use super::ledger::AttemptLedger;
use super::retry::{Backoff, RetryDecision, RetryPolicy};
use super::stats::PipelineStats;
use super::{BatchState, PipelineError};
use crate::backends::{BackupBackend, BackupStore, Sink, SinkBackend};
use crate::common::{BatchId, SealedBatch};
use crate::compression::CompressionFormat;
use crate::workers::Worker;

/// 🎛️ Everything a delivery worker needs to know that isn't a connection.
#[derive(Debug, Clone)]
pub(crate) struct DeliverySettings {
    pub(crate) retry: RetryPolicy,
    pub(crate) request_timeout: Duration,
    pub(crate) backup_prefix: String,
    pub(crate) compression: CompressionFormat,
    pub(crate) backup_initial_backoff: Duration,
    pub(crate) backup_max_backoff: Duration,
}

/// 🚦 Tokens a delivery worker listens to.
#[derive(Debug, Clone)]
pub(crate) struct DeliverySignals {
    /// 🛑 Pipeline is draining: stop sleeping between sink retries, back up instead.
    pub(crate) draining: CancellationToken,
    /// 🧨 Operator gave up: stop retrying backup puts, fail loudly.
    pub(crate) abort: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct DeliveryWorker {
    id: usize,
    rx: Receiver<SealedBatch>,
    sink: SinkBackend,
    backup: BackupBackend,
    buffer: Arc<BatchBuffer>,
    settings: DeliverySettings,
    signals: DeliverySignals,
    stats: Arc<PipelineStats>,
    ledger: AttemptLedger,
}

enum SinkOutcome {
    Delivered,
    GiveUp,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        rx: Receiver<SealedBatch>,
        sink: SinkBackend,
        backup: BackupBackend,
        buffer: Arc<BatchBuffer>,
        settings: DeliverySettings,
        signals: DeliverySignals,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            id,
            rx,
            sink,
            backup,
            buffer,
            settings,
            signals,
            stats,
            ledger: AttemptLedger::new(),
        }
    }

    fn advance(&self, batch_id: BatchId, state: &mut BatchState, next: BatchState) -> Result<(), PipelineError> {
        if !state.can_become(next) {
            return Err(PipelineError::Invariant(format!(
                "batch {batch_id} tried to go from {state:?} to {next:?}"
            )));
        }
        debug!(worker = self.id, batch_id = %batch_id, from = ?*state, to = ?next, "🔀 batch state");
        *state = next;
        Ok(())
    }

    /// 🚚 One sealed batch, start to terminal state.
    async fn deliver(&mut self, batch: &SealedBatch) -> Result<(), PipelineError> {
        let mut state = BatchState::Sealed;
        match self.write_with_retry(batch, &mut state).await? {
            SinkOutcome::Delivered => {
                self.stats.delivered(batch.len());
                if let Some(attempt) = self.ledger.finish(batch.id()) {
                    debug!(
                        worker = self.id,
                        batch_id = %batch.id(),
                        records = batch.len(),
                        attempt = attempt.attempts,
                        "✅ batch delivered"
                    );
                }
                Ok(())
            }
            SinkOutcome::GiveUp => self.back_up(batch, &mut state).await,
        }
    }

    async fn write_with_retry(&mut self, batch: &SealedBatch, state: &mut BatchState) -> Result<SinkOutcome, PipelineError> {
        let batch_id = batch.id();
        loop {
            let attempt = self.ledger.begin_attempt(batch_id, Instant::now());
            self.advance(batch_id, state, BatchState::Delivering)?;

            let written = match tokio::time::timeout(self.settings.request_timeout, self.sink.write_batch(batch)).await {
                Ok(written) => written,
                Err(_) => Err(anyhow!("⌛ sink write timed out after {:?}", self.settings.request_timeout)),
            };
            let error = match written {
                Ok(()) => {
                    self.advance(batch_id, state, BatchState::Delivered)?;
                    return Ok(SinkOutcome::Delivered);
                }
                Err(e) => format!("{e:#}"),
            };

            self.stats.sink_failed();
            self.advance(batch_id, state, BatchState::Retrying)?;
            self.ledger.record_failure(batch_id, error.clone());
            let elapsed = self.ledger.elapsed(batch_id, Instant::now());

            match self.settings.retry.decide(attempt, elapsed) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        worker = self.id,
                        batch_id = %batch_id,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "🔁 sink refused the batch, retrying after a nap"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.signals.draining.cancelled() => {
                            warn!(worker = self.id, batch_id = %batch_id, "🛑 draining: skipping the remaining retries, backing up now");
                            return Ok(SinkOutcome::GiveUp);
                        }
                    }
                }
                RetryDecision::Exhausted => {
                    warn!(
                        worker = self.id,
                        batch_id = %batch_id,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        budget_ms = self.settings.retry.budget().as_millis() as u64,
                        error = %error,
                        "⏳ retry budget spent, routing batch to backup"
                    );
                    return Ok(SinkOutcome::GiveUp);
                }
            }
        }
    }

    /// 🧯 Put the whole batch in the backup store. Retries until it lands or the operator aborts.
    async fn back_up(&mut self, batch: &SealedBatch, state: &mut BatchState) -> Result<(), PipelineError> {
        let batch_id = batch.id();
        let object = match BackupObject::from_batch(batch, &self.settings.backup_prefix, self.settings.compression) {
            Ok(object) => object,
            Err(e) => {
                error!(batch_id = %batch_id, error = %format!("{e:#}"), "💀 compression failed, backing up uncompressed");
                BackupObject::from_batch(batch, &self.settings.backup_prefix, CompressionFormat::Uncompressed)
                    .map_err(|e| PipelineError::Invariant(format!("uncompressed backup of {batch_id} failed: {e:#}")))?
            }
        };

        let abort = self.signals.abort.clone();
        let mut backoff = Backoff::new(self.settings.backup_initial_backoff, self.settings.backup_max_backoff);
        let mut put_attempts = 0u32;
        loop {
            put_attempts += 1;
            let put = tokio::select! {
                biased;
                _ = abort.cancelled() => Err(anyhow!("🧨 aborted while writing the backup object")),
                put = tokio::time::timeout(self.settings.request_timeout, self.backup.put(object.key(), object.body())) => {
                    put.unwrap_or_else(|_| Err(anyhow!("⌛ backup put timed out after {:?}", self.settings.request_timeout)))
                }
            };
            let reason = match put {
                Ok(()) => {
                    self.advance(batch_id, state, BatchState::BackedUp)?;
                    self.stats.backed_up(batch.len());
                    let last_error = self.ledger.finish(batch_id).and_then(|attempt| attempt.last_error);
                    info!(
                        worker = self.id,
                        batch_id = %batch_id,
                        records = batch.len(),
                        key = object.key(),
                        bytes = object.body().len(),
                        last_sink_error = last_error.as_deref().unwrap_or("none"),
                        "🧯 batch backed up"
                    );
                    return Ok(());
                }
                Err(e) => format!("{e:#}"),
            };

            self.stats.backup_failed();
            let delay = backoff.next_delay();
            error!(
                worker = self.id,
                batch_id = %batch_id,
                key = object.key(),
                attempt = put_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "🔥 backup store refused the batch. Retrying until it works or someone aborts"
            );
            tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    return Err(PipelineError::BackupStore {
                        batch_id,
                        records: batch.len(),
                        reason,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Worker for DeliveryWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(worker = self.id, "📥 DeliveryWorker started draining channel...");
            while let Ok(batch) = self.rx.recv().await {
                // -- 🧾 only a batch that reached the sink or the backup store gives its records back
                if let Err(e) = self.deliver(&batch).await {
                    // -- 💀 closing the sink still matters; the error matters more
                    if let Err(close_err) = self.sink.close().await {
                        warn!(worker = self.id, error = %format!("{close_err:#}"), "⚠️ sink close failed after a fatal error");
                    }
                    return Err(e.into());
                }
                self.buffer.release(&batch);
            }
            debug!(worker = self.id, "🏁 DeliveryWorker: channel closed and drained. Shutting down.");
            self.sink.close().await?;
            Ok(())
        })
    }
}
