use std::sync::atomic::{AtomicU64, Ordering};

/// 📊 Running counters for one pipeline. Cheap to bump from any task.
#[derive(Debug, Default)]
pub(crate) struct PipelineStats {
    records_ingested: AtomicU64,
    ingest_rejections: AtomicU64,
    batches_sealed: AtomicU64,
    batches_delivered: AtomicU64,
    records_delivered: AtomicU64,
    sink_failures: AtomicU64,
    batches_backed_up: AtomicU64,
    records_backed_up: AtomicU64,
    backup_failures: AtomicU64,
}

/// 📸 A point-in-time copy of [`PipelineStats`], for tables and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records_ingested: u64,
    pub ingest_rejections: u64,
    pub batches_sealed: u64,
    pub batches_delivered: u64,
    pub records_delivered: u64,
    pub sink_failures: u64,
    pub batches_backed_up: u64,
    pub records_backed_up: u64,
    pub backup_failures: u64,
}

impl PipelineStats {
    pub(crate) fn ingested(&self, records: usize) {
        self.records_ingested.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.ingest_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sealed(&self) {
        self.batches_sealed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self, records: usize) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        self.records_delivered.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn sink_failed(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn backed_up(&self, records: usize) {
        self.batches_backed_up.fetch_add(1, Ordering::Relaxed);
        self.records_backed_up.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn backup_failed(&self) {
        self.backup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_ingested: self.records_ingested.load(Ordering::Relaxed),
            ingest_rejections: self.ingest_rejections.load(Ordering::Relaxed),
            batches_sealed: self.batches_sealed.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            batches_backed_up: self.batches_backed_up.load(Ordering::Relaxed),
            records_backed_up: self.records_backed_up.load(Ordering::Relaxed),
            backup_failures: self.backup_failures.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// 🍽️ `(label, value)` rows, in the order a human wants to read them.
    pub fn rows(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("📥 records ingested", self.records_ingested),
            ("🪣 ingest rejections", self.ingest_rejections),
            ("📦 batches sealed", self.batches_sealed),
            ("✅ batches delivered", self.batches_delivered),
            ("✅ records delivered", self.records_delivered),
            ("💀 sink failures", self.sink_failures),
            ("🧯 batches backed up", self.batches_backed_up),
            ("🧯 records backed up", self.records_backed_up),
            ("🔥 backup put failures", self.backup_failures),
        ]
    }

    /// 🧮 Every record that entered a sealed batch is either delivered or backed up.
    pub fn records_accounted_for(&self) -> u64 {
        self.records_delivered + self.records_backed_up
    }
}
