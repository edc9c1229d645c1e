use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::common::BatchId;

/// 📋 Delivery history of one sealed batch.
///
/// The exhaustion criterion is time since the first attempt began, not the
/// attempt count: a flapping cluster that answers slowly burns the budget
/// just as surely as one that refuses quickly.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryAttempt {
    pub(crate) attempts: u32,
    pub(crate) first_attempt_at: Instant,
    pub(crate) last_error: Option<String>,
}

/// 🗃️ The arena of in-flight delivery attempts, keyed by batch id.
///
/// Each delivery worker owns one. An entry is created when a batch's first
/// attempt begins and removed when the batch reaches a terminal state.
#[derive(Debug, Default)]
pub(crate) struct AttemptLedger {
    entries: HashMap<BatchId, DeliveryAttempt>,
}

impl AttemptLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🚦 An attempt is starting. Returns its 1-based number.
    pub(crate) fn begin_attempt(&mut self, batch_id: BatchId, now: Instant) -> u32 {
        let entry = self.entries.entry(batch_id).or_insert_with(|| DeliveryAttempt {
            attempts: 0,
            first_attempt_at: now,
            last_error: None,
        });
        entry.attempts += 1;
        entry.attempts
    }

    pub(crate) fn record_failure(&mut self, batch_id: BatchId, error: String) {
        if let Some(entry) = self.entries.get_mut(&batch_id) {
            entry.last_error = Some(error);
        }
    }

    /// ⏱️ Time since the first attempt of `batch_id` began. Zero if it never started.
    pub(crate) fn elapsed(&self, batch_id: BatchId, now: Instant) -> Duration {
        self.entries
            .get(&batch_id)
            .map(|entry| now.saturating_duration_since(entry.first_attempt_at))
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, batch_id: BatchId) -> Option<&DeliveryAttempt> {
        self.entries.get(&batch_id)
    }

    /// 🏁 Terminal state reached. The entry leaves the arena.
    pub(crate) fn finish(&mut self, batch_id: BatchId) -> Option<DeliveryAttempt> {
        self.entries.remove(&batch_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
