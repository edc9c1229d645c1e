use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::backends::RecordQueue;
use crate::common::{ReceiptToken, Record};

/// 📬 An at-least-once queue that lives in a `VecDeque` and a `HashMap` of leases.
///
/// Polled records move from `ready` to `leased` with an expiry. Ack removes the
/// lease. Expired leases go back to `ready` on the next poll, exactly like a
/// visibility timeout on a real queue. Clones share the same state, so a test
/// can keep one handle to push and peek while the consumer owns another.
#[derive(Debug, Clone)]
pub(crate) struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    arrivals: Arc<Notify>,
    visibility_timeout: Duration,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    leased: HashMap<ReceiptToken, Lease>,
    acked: usize,
    // 🧪 failure injection: the next N polls return an error
    poll_failures_remaining: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Arc<[u8]>,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Lease {
    message: StoredMessage,
    expires_at: Instant,
}

impl QueueState {
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<ReceiptToken> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(lease) = self.leased.remove(&receipt) {
                // -- 🔄 back of the line? front of the line. the queue is unordered anyway.
                self.ready.push_front(lease.message);
            }
        }
    }

    fn next_lease_expiry(&self) -> Option<Instant> {
        self.leased.values().map(|lease| lease.expires_at).min()
    }
}

impl InMemoryQueue {
    pub(crate) fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            arrivals: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    /// 📮 Producer side: drop a record into the queue.
    pub(crate) async fn push(&self, body: impl Into<Arc<[u8]>>) {
        self.state.lock().await.ready.push_back(StoredMessage {
            body: body.into(),
            enqueued_at: Utc::now(),
        });
        self.arrivals.notify_waiters();
    }

    pub(crate) async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub(crate) async fn leased_len(&self) -> usize {
        self.state.lock().await.leased.len()
    }

    pub(crate) async fn acked_count(&self) -> usize {
        self.state.lock().await.acked
    }

    /// 🧪 Make the next `count` polls fail, like a queue endpoint having a moment.
    pub(crate) async fn fail_next_polls(&self, count: usize) {
        self.state.lock().await.poll_failures_remaining = count;
    }
}

#[async_trait]
impl RecordQueue for InMemoryQueue {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> Result<Vec<Record>> {
        let deadline = Instant::now() + wait;
        loop {
            // -- 🔔 register interest before looking, so a push between the look and the
            // -- wait still wakes us up
            let arrived = self.arrivals.notified();

            let next_expiry = {
                let mut state = self.state.lock().await;
                if state.poll_failures_remaining > 0 {
                    state.poll_failures_remaining -= 1;
                    bail!("💀 in-memory queue poll failed on purpose. The test asked for this.");
                }

                let now = Instant::now();
                state.reclaim_expired(now);
                if !state.ready.is_empty() {
                    let take = max_records.min(state.ready.len());
                    let mut polled = Vec::with_capacity(take);
                    for message in state.ready.drain(..take).collect::<Vec<_>>() {
                        let receipt = ReceiptToken::new(Uuid::new_v4().to_string());
                        polled.push(Record::new(message.body.clone(), message.enqueued_at, receipt.clone()));
                        state.leased.insert(
                            receipt,
                            Lease {
                                message,
                                expires_at: now + self.visibility_timeout,
                            },
                        );
                    }
                    return Ok(polled);
                }
                state.next_lease_expiry()
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = arrived => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&mut self, receipt: &ReceiptToken) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.leased.remove(receipt) {
            Some(_) => {
                state.acked += 1;
                Ok(())
            }
            None => bail!(
                "💀 receipt '{}' is not leased. Either it was acked already or its lease expired and the record went back in line.",
                receipt
            ),
        }
    }
}
