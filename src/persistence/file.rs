use super::{decode_record, PersistenceError, PositionReader, PositionStore};
use crate::models::PositionRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Position record kept as a small JSON file
///
/// Writes go to a sibling temp file which is fsynced and then renamed over
/// the real one, so readers see either the old record or the new one. A
/// failed write removes the temp file.
#[derive(Debug, Clone)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "position".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PositionReader for FilePositionStore {
    async fn load(&self) -> PositionRecord {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => decode_record(&raw, &self.path.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No stored position at {}, starting flat",
                    self.path.display()
                );
                PositionRecord::default()
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read position from {} ({}), using default",
                    self.path.display(),
                    e
                );
                PositionRecord::default()
            }
        }
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn save(&self, record: &PositionRecord) -> Result<(), PersistenceError> {
        let payload = serde_json::to_vec(record)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        if let Err(e) = replace_with(&temp, &self.path, &payload).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!("Could not remove {}: {}", temp.display(), cleanup);
                }
            }
            return Err(e.into());
        }
        sync_parent(&self.path).await?;

        tracing::debug!("Saved position {:?} to {}", record, self.path.display());
        Ok(())
    }
}

/// Write `payload` to `temp`, fsync it, then rename it over `path`
async fn replace_with(temp: &Path, path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(temp).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(temp, path).await
}

/// The rename is only durable once the directory entry is flushed
#[cfg(unix)]
async fn sync_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
