//! 📦 Common data structures, the building blocks of spillway.
//!
//! 🎬 INT. QUEUE, 3:47 AM. A record arrives. It has bytes, a timestamp, and a
//! receipt it must never lose, because the receipt is the only way the queue
//! will ever let it go. It joins a `Batch`. The batch grows. The batch seals.
//! The batch leaves. Nobody waves.
//!
//! This module defines the humble yet load-bearing structs that ferry records
//! from the queue to the index (or, on a bad day, to the backup store):
//!
//! - [`Record`]: raw bytes + arrival metadata. Immutable once created.
//! - [`Batch`]: the open, append-only accumulation, owned by the buffer.
//! - [`SealedBatch`]: a batch that crossed a threshold. Read-only forever after.
//! - [`BatchId`]: the name a batch carries into the retry ledger and the backup key.
//!
//! 🦆

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

/// 🎫 The receipt a queue hands out with every delivery of a record.
///
/// Acknowledging with it deletes the record from the queue. Losing it means the
/// record comes back after the visibility timeout, which is annoying but legal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 🎯 A singular `Record`: one message, one destiny, at-least-once guarantees.
///
/// The body is shared behind an `Arc<[u8]>` so a record can sit in a batch, in a
/// retry, and in a backup payload without anybody cloning megabytes. Nothing
/// here is mutable after construction. Records do not change. Records endure.
#[derive(Debug, Clone)]
pub struct Record {
    body: Arc<[u8]>,
    enqueued_at: DateTime<Utc>,
    receipt: ReceiptToken,
}

impl Record {
    pub fn new(body: impl Into<Arc<[u8]>>, enqueued_at: DateTime<Utc>, receipt: ReceiptToken) -> Self {
        Self {
            body: body.into(),
            enqueued_at,
            receipt,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn receipt(&self) -> &ReceiptToken {
        &self.receipt
    }

    /// 📏 Bytes this record contributes to the buffering thresholds.
    pub fn size_bytes(&self) -> usize {
        self.body.len()
    }
}

/// 🪪 Unique identity of a batch. UUID v4, because counters reset and UUIDs don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 📦 The open batch: an ordered-by-arrival, append-only shopping cart of records.
///
/// Opened when its first record lands (an empty batch has no clock running),
/// owned exclusively by the buffer until it is sealed.
#[derive(Debug)]
pub(crate) struct Batch {
    id: BatchId,
    records: Vec<Record>,
    size_bytes: usize,
    opened_at: Instant,
}

impl Batch {
    pub(crate) fn open(opened_at: Instant) -> Self {
        Self {
            id: BatchId::new(),
            records: Vec::new(),
            size_bytes: 0,
            opened_at,
        }
    }

    pub(crate) fn push(&mut self, record: Record) {
        self.size_bytes += record.size_bytes();
        self.records.push(record);
    }

    pub(crate) fn id(&self) -> BatchId {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub(crate) fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// 🔒 Seal it. After this the records are frozen inside an `Arc` and the
    /// only thing anyone can do is read them. Write-once, read-until-delivered.
    pub(crate) fn seal(self, sealed_at: Instant) -> SealedBatch {
        SealedBatch {
            inner: Arc::new(SealedInner {
                id: self.id,
                records: self.records,
                size_bytes: self.size_bytes,
                opened_at: self.opened_at,
                sealed_at,
            }),
        }
    }
}

#[derive(Debug)]
struct SealedInner {
    id: BatchId,
    records: Vec<Record>,
    size_bytes: usize,
    opened_at: Instant,
    sealed_at: Instant,
}

/// 🧊 A sealed batch. No `&mut` accessors exist. Retries see exactly what the
/// first attempt saw, and the backup object gets the same bytes again.
///
/// Cheap to clone (one `Arc` bump), so the delivery worker can hand it to the
/// sink and still hold it for the backup path.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    inner: Arc<SealedInner>,
}

impl SealedBatch {
    pub fn id(&self) -> BatchId {
        self.inner.id
    }

    pub fn records(&self) -> &[Record] {
        &self.inner.records
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.size_bytes
    }

    pub fn opened_at(&self) -> Instant {
        self.inner.opened_at
    }

    pub fn sealed_at(&self) -> Instant {
        self.inner.sealed_at
    }

    /// 📜 The batch as newline-delimited raw records, in arrival order.
    ///
    /// Every record is followed by exactly one `\n`, so the output is
    /// reproducible byte-for-byte and splits back into records as long as the
    /// records themselves are single-line documents (which the index needs anyway).
    pub fn to_ndjson(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.inner.size_bytes + self.inner.records.len());
        for record in &self.inner.records {
            payload.extend_from_slice(record.body());
            payload.push(b'\n');
        }
        payload
    }
}
