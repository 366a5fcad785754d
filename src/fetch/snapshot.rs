//! Content-addressed raw page snapshots

use crate::error::FetchError;
use crate::store::{RawSnapshot, Store};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes page captures to `<dir>/<blake3>.html` and records them in the store
#[derive(Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    store: Store,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, store: Store) -> Self {
        Self {
            dir: dir.into(),
            store,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a capture; identical content shares one file
    pub async fn persist(
        &self,
        source: &str,
        url: &str,
        fetched_at: DateTime<Utc>,
        html: &str,
    ) -> Result<RawSnapshot, FetchError> {
        let hash = blake3::hash(html.as_bytes()).to_hex().to_string();
        let path = self.dir.join(format!("{}.html", hash));

        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| FetchError::Snapshot(format!("{}: {}", self.dir.display(), e)))?;
            tokio::fs::write(&path, html.as_bytes())
                .await
                .map_err(|e| FetchError::Snapshot(format!("{}: {}", path.display(), e)))?;
        } else {
            debug!("Snapshot {} already on disk", hash);
        }

        let snapshot = RawSnapshot::new(
            source,
            url,
            fetched_at,
            hash,
            path.display().to_string(),
        );
        self.store
            .insert_snapshot(&snapshot)
            .await
            .map_err(|e| FetchError::Snapshot(e.to_string()))?;
        Ok(snapshot)
    }

    /// Read a capture back for re-extraction
    pub async fn load(&self, snapshot: &RawSnapshot) -> Result<String, FetchError> {
        tokio::fs::read_to_string(&snapshot.path)
            .await
            .map_err(|e| FetchError::Snapshot(format!("{}: {}", snapshot.path, e)))
    }
}
