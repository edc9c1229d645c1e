//! 📬 The batch consumer: queue → pipeline, and only then → ack.
//!
//! 🎬 *[a queue holds records. a pipeline wants them. the consumer is the
//! courier who refuses to sign for a package until it's actually delivered.]*
//!
//! The order of operations is the whole point:
//! 1. `poll` leases up to `max_records_per_poll` records.
//! 2. `ingest` hands them to the pipeline. `Ok` means the pipeline owns them now.
//! 3. `ack` deletes them from the queue.
//!
//! If step 2 says no, step 3 never happens and the queue hands the records out
//! again after the visibility timeout. If step 3 fails, same thing, and the
//! records get delivered twice. At-least-once is a promise about "least", not
//! about "once".
//!
//! 🦆

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::app_config::ConsumerConfig;
use crate::backends::{QueueBackend, RecordQueue};
use crate::common::{ReceiptToken, Record};
use crate::pipeline::{Backoff, IngestHandle, PipelineError};
use crate::workers::Worker;

/// 🎯 What one poll-and-forward round ended with.
#[derive(Debug)]
pub(crate) enum ConsumeOutcome {
    /// 💤 The queue had nothing for us within the poll wait.
    Idle,
    /// ✅ Handed over and acknowledged (`acked` may be short of `forwarded` if acks failed).
    Forwarded { forwarded: usize, acked: usize },
    /// 🙅 The pipeline refused. Nothing was acknowledged.
    Rejected(PipelineError),
}

#[derive(Debug)]
pub(crate) struct BatchConsumer {
    queue: QueueBackend,
    pipeline: IngestHandle,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl BatchConsumer {
    pub(crate) fn new(queue: QueueBackend, pipeline: IngestHandle, config: ConsumerConfig, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            pipeline,
            config,
            shutdown,
        }
    }

    /// 🔁 One round: poll, forward, ack. Poll errors come back as `Err`.
    #[cfg(test)]
    pub(crate) async fn poll_once(&mut self) -> Result<ConsumeOutcome> {
        let records = self
            .queue
            .poll(self.config.max_records_per_poll, self.config.poll_wait())
            .await?;
        Ok(self.forward(records).await)
    }

    async fn forward(&mut self, records: Vec<Record>) -> ConsumeOutcome {
        if records.is_empty() {
            return ConsumeOutcome::Idle;
        }
        let receipts: Vec<ReceiptToken> = records.iter().map(|record| record.receipt().clone()).collect();
        let forwarded = receipts.len();
        if let Err(rejection) = self.pipeline.ingest(records) {
            return ConsumeOutcome::Rejected(rejection);
        }

        let mut acked = 0;
        for receipt in &receipts {
            match self.queue.ack(receipt).await {
                Ok(()) => acked += 1,
                Err(e) => warn!(
                    receipt = %receipt,
                    error = %format!("{e:#}"),
                    "⚠️ ack failed after hand-off. The record will come back and be delivered twice. Allowed, not loved."
                ),
            }
        }
        trace!(forwarded, acked, "📬 records handed to the pipeline");
        ConsumeOutcome::Forwarded { forwarded, acked }
    }

    /// 😴 Sleep, unless shutdown comes first. Returns false when it's time to stop.
    async fn nap(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(mut self) -> Result<()> {
        debug!(
            max_records_per_poll = self.config.max_records_per_poll,
            poll_wait_secs = self.config.poll_wait_secs,
            "📬 batch consumer started"
        );
        let mut backoff = Backoff::new(Duration::from_secs(1), self.config.max_backoff());
        loop {
            let shutdown = self.shutdown.clone();
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.queue.poll(self.config.max_records_per_poll, self.config.poll_wait()) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %format!("{e:#}"),
                        delay_ms = delay.as_millis() as u64,
                        "📡 queue poll failed. Backing off and trying again, as one does"
                    );
                    if !self.nap(delay).await {
                        break;
                    }
                    continue;
                }
            };

            match self.forward(records).await {
                ConsumeOutcome::Idle | ConsumeOutcome::Forwarded { .. } => backoff.reset(),
                ConsumeOutcome::Rejected(PipelineError::CapacityExhausted { requested, available }) => {
                    let delay = backoff.next_delay();
                    warn!(
                        requested,
                        available,
                        delay_ms = delay.as_millis() as u64,
                        "🪣 pipeline is full. Leaving the records leased in the queue and backing off"
                    );
                    if !self.nap(delay).await {
                        break;
                    }
                }
                ConsumeOutcome::Rejected(PipelineError::ShuttingDown) => {
                    debug!("🛑 pipeline is shutting down; consumer stops polling");
                    break;
                }
                ConsumeOutcome::Rejected(other) => {
                    error!(error = %other, "💀 pipeline refused records for good; consumer stops polling");
                    break;
                }
            }
        }
        debug!("🏁 batch consumer stopped");
        Ok(())
    }
}

impl Worker for BatchConsumer {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}
