use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::backends::BackupStore;

#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryBackupConfig {
    /// 📁 Root of the backup tree. Keys (prefix included) become relative paths under it.
    pub directory: PathBuf,
}

/// 🧯 A backup store that is just a directory tree on durable disk.
///
/// A key like `failed/2024/abc.gz` lands at `<directory>/failed/2024/abc.gz`.
/// Every put goes to a temp sibling first, gets `sync_all`'d, then renamed into
/// place, so a reader never sees a half-written object.
#[derive(Debug, Clone)]
pub(crate) struct DirectoryBackupStore {
    config: DirectoryBackupConfig,
}

impl DirectoryBackupStore {
    pub(crate) async fn new(config: DirectoryBackupConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory).await.with_context(|| {
            format!(
                "💀 could not create the backup directory '{}'. Failed batches need somewhere to land.",
                config.directory.display()
            )
        })?;
        Ok(Self { config })
    }

    /// 🔒 Keys must stay inside the root. No `..`, no absolute paths, no escape hatches.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let is_tame = !key.is_empty() && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !is_tame {
            bail!("💀 backup key '{}' is not a plain relative path. Refusing to write outside the backup root.", key);
        }
        Ok(self.config.directory.join(relative))
    }
}

#[async_trait]
impl BackupStore for DirectoryBackupStore {
    async fn put(&mut self, key: &str, body: &[u8]) -> Result<()> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("💀 could not create backup directory '{}'", parent.display()))?;
        }

        let mut temp_name = target.clone().into_os_string();
        temp_name.push(format!(".{}.tmp", Uuid::new_v4()));
        let temp_path = PathBuf::from(temp_name);

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("💀 could not create temp backup file '{}'", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("💀 could not write temp backup file '{}'", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("💀 could not fsync temp backup file '{}'", temp_path.display()))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp_path, &target).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e).with_context(|| format!("💀 could not move backup object into '{}'", target.display()));
        }
        debug!(key, bytes = body.len(), "🧯 backup object landed on disk");
        Ok(())
    }
}
