//! 🔁 Retry policies: how long to wait before the next try, and when to stop trying.
//!
//! Two flavors live here:
//! - [`RetryPolicy`]: budgeted. Delivery retries back off exponentially until the
//!   time since the first attempt reaches the budget, then the batch is backed up.
//!   Sleeps are clamped to whatever budget is left, so the give-up moment lands
//!   within one backoff step of the budget instead of one backoff step past it.
//! - [`Backoff`]: unbudgeted. For things that must eventually succeed (backup
//!   puts) or must never stop (queue polls): just a capped, doubling delay.

use std::time::Duration;

/// ⚖️ What to do after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// 😴 Sleep this long, then try the same batch again.
    RetryAfter(Duration),
    /// 🧯 Budget spent. Off to the backup store.
    Exhausted,
}

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: u32,
    budget: Duration,
}

impl RetryPolicy {
    pub(crate) fn new(initial_backoff: Duration, max_backoff: Duration, budget: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            multiplier: 2,
            budget,
        }
    }

    pub(crate) fn budget(&self) -> Duration {
        self.budget
    }

    /// 📐 Unclamped delay after the `attempt`-th failure (1-based): initial × 2^(n-1), capped.
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1).min(31));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// ⚖️ Decide after the `attempt`-th failure, `elapsed` after the first attempt began.
    pub(crate) fn decide(&self, attempt: u32, elapsed: Duration) -> RetryDecision {
        match self.budget.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                RetryDecision::RetryAfter(self.delay_for_attempt(attempt).min(remaining))
            }
            _ => RetryDecision::Exhausted,
        }
    }
}

/// 🪜 A capped doubling delay with no budget. `next_delay` climbs, `reset` starts over.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}
