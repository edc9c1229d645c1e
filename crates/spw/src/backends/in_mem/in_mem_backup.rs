use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backends::BackupStore;

/// 🧯 A backup store made of a `BTreeMap`. Durable for exactly as long as the test runs.
///
/// Keeps the instant every object landed so timing tests can check that a batch
/// reached backup no earlier than the retry budget and not much later either.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryBackupStore {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    failures_remaining: Arc<Mutex<usize>>,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredObject {
    pub(crate) body: Vec<u8>,
    pub(crate) stored_at: Instant,
}

impl InMemoryBackupStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🧪 Make the next `count` puts fail. The bucket is having a day.
    pub(crate) async fn fail_next_puts(&self, count: usize) {
        *self.failures_remaining.lock().await = count;
    }

    pub(crate) async fn objects(&self) -> BTreeMap<String, StoredObject> {
        self.objects.lock().await.clone()
    }

    pub(crate) async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn put(&mut self, key: &str, body: &[u8]) -> Result<()> {
        {
            let mut failures = self.failures_remaining.lock().await;
            if *failures > 0 {
                *failures -= 1;
                bail!("💀 in-memory backup store refused '{}' on purpose", key);
            }
        }
        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_puts_land_and_injected_failures_do_not() -> Result<()> {
        let mut store = InMemoryBackupStore::new();
        store.fail_next_puts(1).await;

        assert!(store.put("failed/abc", b"x").await.is_err());
        assert!(store.keys().await.is_empty());

        store.put("failed/abc", b"first").await?;
        store.put("failed/abc", b"second").await?;
        let objects = store.objects().await;
        assert_eq!(objects.len(), 1, "same key overwrites");
        assert_eq!(objects["failed/abc"].body, b"second".to_vec());
        Ok(())
    }
}
