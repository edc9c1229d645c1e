//! 🪣 The batch buffer: where records wait for enough company, or enough time.
//!
//! One open [`Batch`] for the single logical stream, guarded by a plain
//! `std::sync::Mutex`. Nothing inside the lock ever awaits. Append, threshold
//! check, seal and hand-off to the delivery channel all happen in one critical
//! section, so a record is either in the open batch or in exactly one sealed
//! batch, never both and never neither.
//!
//! Capacity is counted in bytes across the open batch *and* every sealed batch
//! that has not finished delivery or backup yet. Delivery workers give bytes
//! back with [`BatchBuffer::release`], and only for batches that reached a
//! terminal state. Records are counted the same way, so when the pipeline dies
//! it can say exactly how many accepted records never landed anywhere.
//!
//! Once every delivery worker is gone the open batch is left unsealed: sealing
//! it would only hand it to a channel nobody reads.
//!
//! ⏰ The [`SealTimer`] seals an open batch once it has been open for the
//! configured interval, whether or not anyone ingests anything ever again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_channel::Sender;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::PipelineError;
use super::stats::PipelineStats;
use crate::common::{Batch, Record, SealedBatch};
use crate::workers::Worker;

#[derive(Debug, Clone)]
pub(crate) struct BufferLimits {
    pub(crate) size_threshold_bytes: usize,
    pub(crate) interval: Duration,
    pub(crate) max_buffered_bytes: usize,
}

#[derive(Debug)]
struct BufferState {
    open: Option<Batch>,
    /// 📏 Open batch + sealed-but-unfinished batches.
    buffered_bytes: usize,
    /// 🧾 Same scope as `buffered_bytes`, counted in records.
    unfinished_records: usize,
    accepting: bool,
}

#[derive(Debug, Clone, Copy)]
enum SealReason {
    Size,
    Interval,
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct BatchBuffer {
    state: Mutex<BufferState>,
    /// 🔔 Rung whenever a fresh batch opens, so the timer knows there's a clock to watch.
    opened: Notify,
    sealed_tx: Sender<SealedBatch>,
    limits: BufferLimits,
    stats: Arc<PipelineStats>,
}

impl BatchBuffer {
    pub(crate) fn new(limits: BufferLimits, sealed_tx: Sender<SealedBatch>, stats: Arc<PipelineStats>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                open: None,
                buffered_bytes: 0,
                unfinished_records: 0,
                accepting: true,
            }),
            opened: Notify::new(),
            sealed_tx,
            limits,
            stats,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // -- 🧯 a panic elsewhere must not strand buffered records; the state itself stays consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 📥 Append `records` to the open batch, sealing as thresholds are crossed.
    ///
    /// All-or-nothing: on `Err` not a single record was buffered.
    pub(crate) fn ingest(&self, records: Vec<Record>) -> Result<(), PipelineError> {
        if records.is_empty() {
            return Ok(());
        }
        let requested: usize = records.iter().map(Record::size_bytes).sum();
        let count = records.len();

        let mut state = self.lock();
        if !state.accepting {
            return Err(PipelineError::ShuttingDown);
        }
        if self.sealed_tx.is_closed() {
            state.accepting = false;
            return Err(PipelineError::Worker(
                "every delivery worker is gone; nothing would deliver these records".to_string(),
            ));
        }
        let available = self.limits.max_buffered_bytes.saturating_sub(state.buffered_bytes);
        if requested > available {
            self.stats.rejected();
            return Err(PipelineError::CapacityExhausted { requested, available });
        }

        let now = Instant::now();
        let mut opened_fresh_batch = false;
        state.buffered_bytes += requested;
        state.unfinished_records += count;
        for record in records {
            let batch = state.open.get_or_insert_with(|| {
                opened_fresh_batch = true;
                Batch::open(now)
            });
            batch.push(record);
            let is_full = batch.size_bytes() >= self.limits.size_threshold_bytes;
            if is_full {
                self.seal_and_send(&mut state, now, SealReason::Size);
            }
        }
        self.stats.ingested(count);
        drop(state);

        if opened_fresh_batch {
            self.opened.notify_one();
        }
        Ok(())
    }

    /// 🔒 Seal the open batch and hand it off. Called with the state lock held.
    ///
    /// With no worker left to read the channel the batch stays open, and
    /// `false` comes back.
    fn seal_and_send(&self, state: &mut BufferState, now: Instant, reason: SealReason) -> bool {
        if self.sealed_tx.is_closed() {
            if let Some(open) = &state.open {
                error!(
                    records = open.len(),
                    ?reason,
                    "💀 no delivery worker left; the open batch stays unsealed"
                );
            }
            return false;
        }
        let Some(batch) = state.open.take() else {
            return false;
        };
        let sealed = batch.seal(now);
        self.stats.sealed();
        debug!(
            batch_id = %sealed.id(),
            records = sealed.len(),
            bytes = sealed.size_bytes(),
            open_ms = now.saturating_duration_since(sealed.opened_at()).as_millis() as u64,
            ?reason,
            "📦 batch OPEN → SEALED"
        );
        if let Err(e) = self.sealed_tx.try_send(sealed) {
            // -- 💀 the last worker died between the check and the send. Its records stay counted as unfinished.
            let lost = e.into_inner();
            error!(
                batch_id = %lost.id(),
                records = lost.len(),
                "💀 sealed batch has nowhere to go: the delivery channel is closed"
            );
            return false;
        }
        true
    }

    /// ⏰ When the open batch (if any) hits its interval. `None` once nothing
    /// would deliver it.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        if self.sealed_tx.is_closed() {
            return None;
        }
        self.lock().open.as_ref().map(|batch| batch.opened_at() + self.limits.interval)
    }

    /// ⏰ Seal the open batch if it has been open for at least the interval.
    pub(crate) fn seal_expired(&self, now: Instant) -> bool {
        let mut state = self.lock();
        let expired = state
            .open
            .as_ref()
            .is_some_and(|batch| now.saturating_duration_since(batch.opened_at()) >= self.limits.interval);
        expired && self.seal_and_send(&mut state, now, SealReason::Interval)
    }

    /// 🛑 Stop accepting, seal whatever is open, close the delivery channel.
    /// Workers drain what is already queued and then exit.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.accepting = false;
        if state.open.as_ref().is_some_and(|batch| !batch.is_empty()) {
            self.seal_and_send(&mut state, Instant::now(), SealReason::Shutdown);
        }
        self.sealed_tx.close();
    }

    /// 🪣 A batch finished (delivered or backed up). Its bytes and records no longer count.
    pub(crate) fn release(&self, batch: &SealedBatch) {
        let mut state = self.lock();
        state.buffered_bytes = state.buffered_bytes.saturating_sub(batch.size_bytes());
        state.unfinished_records = state.unfinished_records.saturating_sub(batch.len());
        trace!(
            released = batch.size_bytes(),
            buffered = state.buffered_bytes,
            unfinished_records = state.unfinished_records,
            "🪣 capacity released"
        );
    }

    /// 🧾 Accepted records not yet delivered or backed up: open, queued, or stuck in a dead worker.
    pub(crate) fn unfinished_records(&self) -> usize {
        self.lock().unfinished_records
    }

    #[cfg(test)]
    pub(crate) fn buffered_bytes(&self) -> usize {
        self.lock().buffered_bytes
    }

    #[cfg(test)]
    pub(crate) fn open_batch_len(&self) -> usize {
        self.lock().open.as_ref().map_or(0, Batch::len)
    }
}

/// ⏰ Seals the open batch on its interval. Sleeps until the open batch's
/// deadline, or until a batch opens when there is none.
#[derive(Debug)]
pub(crate) struct SealTimer {
    buffer: Arc<BatchBuffer>,
    stop: CancellationToken,
}

impl SealTimer {
    pub(crate) fn new(buffer: Arc<BatchBuffer>, stop: CancellationToken) -> Self {
        Self { buffer, stop }
    }
}

impl Worker for SealTimer {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("⏰ seal timer started");
            loop {
                match self.buffer.next_deadline() {
                    Some(deadline) => tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.buffer.seal_expired(Instant::now());
                        }
                    },
                    None => tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = self.buffer.opened.notified() => {}
                    },
                }
            }
            debug!("🏁 seal timer stopped");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::Rng;

    use super::*;
    use crate::common::tests::record;

    fn buffer(size_threshold_bytes: usize, interval: Duration, max_buffered_bytes: usize) -> (Arc<BatchBuffer>, async_channel::Receiver<SealedBatch>) {
        let (tx, rx) = async_channel::unbounded();
        let limits = BufferLimits {
            size_threshold_bytes,
            interval,
            max_buffered_bytes,
        };
        (Arc::new(BatchBuffer::new(limits, tx, Arc::new(PipelineStats::default()))), rx)
    }

    fn records(bodies: &[&str]) -> Vec<Record> {
        bodies.iter().map(|b| record(b)).collect()
    }

    #[test]
    fn the_one_where_crossing_the_size_threshold_seals_on_the_spot() -> Result<()> {
        let (buffer, rx) = buffer(10, Duration::from_secs(60), 1000);
        buffer.ingest(records(&["12345"]))?;
        assert!(rx.is_empty(), "5 bytes is not 10");
        buffer.ingest(records(&["67890", "x"]))?;

        let sealed = rx.try_recv()?;
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed.size_bytes(), 10);
        assert_eq!(buffer.open_batch_len(), 1, "the leftover starts the next batch");
        Ok(())
    }

    #[test]
    fn the_one_where_one_append_seals_several_batches() -> Result<()> {
        let (buffer, rx) = buffer(4, Duration::from_secs(60), 1000);
        buffer.ingest(records(&["aaaa", "bbbb", "cccc", "d"]))?;
        assert_eq!(rx.len(), 3);
        assert_eq!(buffer.buffered_bytes(), 13, "sealed bytes still count until released");
        Ok(())
    }

    #[test]
    fn the_one_where_a_full_bucket_rejects_everything_or_nothing() -> Result<()> {
        let (buffer, rx) = buffer(6, Duration::from_secs(60), 10);
        buffer.ingest(records(&["123456"]))?;

        match buffer.ingest(records(&["abc", "def"])) {
            Err(PipelineError::CapacityExhausted { requested, available }) => {
                assert_eq!((requested, available), (6, 4));
            }
            other => panic!("💀 expected CapacityExhausted, got {other:?}"),
        }
        assert_eq!(buffer.open_batch_len(), 0, "nothing from the rejected call got in");
        assert_eq!(buffer.buffered_bytes(), 6);
        assert_eq!(buffer.unfinished_records(), 1);

        let sealed = rx.try_recv()?;
        assert!(rx.is_empty());
        buffer.release(&sealed);
        assert_eq!(buffer.unfinished_records(), 0);
        buffer.ingest(records(&["abc", "def"]))?;
        Ok(())
    }

    #[test]
    fn the_one_where_nobody_is_left_to_deliver_so_nothing_gets_sealed() -> Result<()> {
        let (buffer, rx) = buffer(100, Duration::from_secs(60), 1000);
        buffer.ingest(records(&["still", "here"]))?;
        // -- 💀 the last delivery worker goes away with its receiver
        drop(rx);

        assert!(buffer.next_deadline().is_none(), "no clock to watch for a batch nobody can take");
        assert!(!buffer.seal_expired(Instant::now() + Duration::from_secs(120)));
        buffer.close();
        assert_eq!(buffer.open_batch_len(), 2, "the open batch stays open");
        assert_eq!(buffer.unfinished_records(), 2);
        assert_eq!(buffer.buffered_bytes(), 9);
        assert!(matches!(buffer.ingest(records(&["late"])), Err(PipelineError::ShuttingDown)));
        Ok(())
    }

    #[test]
    fn the_one_where_closing_seals_the_leftovers_and_slams_the_door() -> Result<()> {
        let (buffer, rx) = buffer(100, Duration::from_secs(60), 1000);
        buffer.ingest(records(&["last", "call"]))?;
        buffer.close();

        assert_eq!(rx.try_recv()?.len(), 2);
        assert!(rx.is_closed());
        assert!(matches!(buffer.ingest(records(&["late"])), Err(PipelineError::ShuttingDown)));
        Ok(())
    }

    #[test]
    fn the_one_where_closing_an_empty_buffer_sends_nothing() {
        let (buffer, rx) = buffer(100, Duration::from_secs(60), 1000);
        buffer.close();
        assert!(rx.is_empty());
        assert!(rx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_lonely_record_waits_exactly_one_interval() -> Result<()> {
        let (buffer, rx) = buffer(1024, Duration::from_secs(60), 4096);
        let stop = CancellationToken::new();
        let timer = SealTimer::new(buffer.clone(), stop.clone()).start();

        buffer.ingest(records(&["lonely"]))?;
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(rx.is_empty(), "not yet");

        let sealed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await??;
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed.sealed_at() - sealed.opened_at(), Duration::from_secs(60));

        stop.cancel();
        timer.await??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_timer_follows_the_newest_batch_after_a_size_seal() -> Result<()> {
        let (buffer, rx) = buffer(8, Duration::from_secs(60), 4096);
        let stop = CancellationToken::new();
        let timer = SealTimer::new(buffer.clone(), stop.clone()).start();

        buffer.ingest(records(&["1234"]))?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        buffer.ingest(records(&["5678", "fresh"]))?;
        assert_eq!(rx.try_recv()?.len(), 2, "size seal at t=30");

        // -- ⏰ the old deadline (t=60) passes without sealing the batch opened at t=30
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(rx.is_empty());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.try_recv()?.len(), 1, "interval seal at t=90");

        stop.cancel();
        timer.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_racing_ingest_and_timer_seals_lose_nothing() -> Result<()> {
        let (buffer, rx) = buffer(64, Duration::from_millis(3), usize::MAX);
        let stop = CancellationToken::new();
        let timer = SealTimer::new(buffer.clone(), stop.clone()).start();

        let mut producers = Vec::new();
        for producer in 0..8 {
            let buffer = buffer.clone();
            producers.push(tokio::spawn(async move {
                let mut ingested = 0usize;
                for n in 0..250 {
                    let (group, pause_us) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(1..=10usize), rng.gen_range(0..300u64))
                    };
                    let batch: Vec<Record> = (0..group).map(|i| record(&format!("p{producer}-n{n}-i{i}"))).collect();
                    buffer.ingest(batch)?;
                    ingested += group;
                    tokio::time::sleep(Duration::from_micros(pause_us)).await;
                }
                Ok::<_, PipelineError>(ingested)
            }));
        }
        let mut total_ingested = 0usize;
        for producer in producers {
            total_ingested += producer.await??;
        }
        stop.cancel();
        timer.await??;
        buffer.close();

        let mut seen: HashMap<Vec<u8>, usize> = HashMap::new();
        while let Ok(batch) = rx.recv().await {
            for record in batch.records() {
                *seen.entry(record.body().to_vec()).or_default() += 1;
            }
        }
        assert_eq!(seen.len(), total_ingested, "every ingested record was sealed");
        assert!(seen.values().all(|&count| count == 1), "no record may be sealed twice");
        assert_eq!(buffer.stats.snapshot().records_ingested, total_ingested as u64);
        Ok(())
    }
}
