use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backends::Sink;
use crate::common::SealedBatch;

/// 🎬 The script an [`InMemorySink`] follows when a batch shows up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum FailureScript {
    /// ✅ Takes everything. The golden retriever of sinks.
    #[default]
    AcceptAll,
    /// 💀 Refuses the first `n` writes, then behaves.
    FailFirst(usize),
    /// 💀 Refuses every write, forever. The cluster is on fire and nobody is coming.
    FailForever,
}

/// 📦 A sink that never forgets. Unless the test told it to refuse, in which case
/// it forgets on purpose and reports the failure with a straight face.
///
/// Clones share the same vault, so a test keeps one handle to peek at what was
/// delivered while the delivery workers own the others.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemorySink {
    /// 🔒 The evidence locker. One entry per successfully written batch.
    received: Arc<Mutex<Vec<SealedBatch>>>,
    script: Arc<Mutex<FailureScript>>,
    attempts: Arc<AtomicUsize>,
}

impl InMemorySink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_forever() -> Self {
        Self::with_script(FailureScript::FailForever)
    }

    pub(crate) fn failing_first(count: usize) -> Self {
        Self::with_script(FailureScript::FailFirst(count))
    }

    fn with_script(script: FailureScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            ..Self::default()
        }
    }

    /// 🔧 Swap the script mid-test. The cluster recovers! Or catches fire! Drama!
    pub(crate) async fn set_script(&self, script: FailureScript) {
        *self.script.lock().await = script;
    }

    pub(crate) async fn received(&self) -> Vec<SealedBatch> {
        self.received.lock().await.clone()
    }

    /// 📏 Every record body delivered so far, flattened across batches.
    pub(crate) async fn received_bodies(&self) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .await
            .iter()
            .flat_map(|batch| batch.records().iter().map(|record| record.body().to_vec()))
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn write_batch(&mut self, batch: &SealedBatch) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().await;
        match *script {
            FailureScript::AcceptAll => {}
            FailureScript::FailForever => {
                bail!("💀 in-memory sink refused batch {} (scripted: fail forever)", batch.id())
            }
            FailureScript::FailFirst(0) => *script = FailureScript::AcceptAll,
            FailureScript::FailFirst(remaining) => {
                *script = match remaining - 1 {
                    0 => FailureScript::AcceptAll,
                    left => FailureScript::FailFirst(left),
                };
                bail!(
                    "💀 in-memory sink refused batch {} (scripted: {} more refusal(s) queued)",
                    batch.id(),
                    remaining - 1
                )
            }
        }
        drop(script);
        // 🔒 The Mutex is load-bearing. Do not remove. I know it looks optional. It isn't.
        self.received.lock().await.push(batch.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // -- 🗑️ nothing to flush. We live in RAM. The Arc keeps the evidence alive for the test.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::common::Batch;
    use crate::common::tests::record;

    fn sealed(bodies: &[&str]) -> SealedBatch {
        let mut batch = Batch::open(Instant::now());
        for body in bodies {
            batch.push(record(body));
        }
        batch.seal(Instant::now())
    }

    #[tokio::test]
    async fn the_one_where_the_sink_keeps_every_batch_it_accepts() -> Result<()> {
        let mut sink = InMemorySink::new();
        let peek = sink.clone();
        sink.write_batch(&sealed(&["a", "b"])).await?;
        sink.write_batch(&sealed(&["c"])).await?;
        sink.close().await?;

        assert_eq!(peek.received().await.len(), 2);
        assert_eq!(peek.received_bodies().await, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(peek.attempts(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_sink_fails_twice_then_recovers() -> Result<()> {
        let mut sink = InMemorySink::failing_first(2);
        let batch = sealed(&["x"]);
        assert!(sink.write_batch(&batch).await.is_err());
        assert!(sink.write_batch(&batch).await.is_err());
        sink.write_batch(&batch).await?;
        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.received().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failing_sink_stores_nothing() {
        let mut sink = InMemorySink::failing_forever();
        for _ in 0..5 {
            assert!(sink.write_batch(&sealed(&["nope"])).await.is_err());
        }
        assert!(sink.received().await.is_empty());

        sink.set_script(FailureScript::AcceptAll).await;
        assert!(sink.write_batch(&sealed(&["finally"])).await.is_ok());
    }
}
