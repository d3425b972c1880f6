//! Per-user persistent map of `job_id -> DownloadRecord`.
//!
//! Thread-safe by a single reader-writer lock. Persisted as JSON with stable
//! key ordering; writes are atomic (`*.tmp` then rename) so a crash mid-save
//! never leaves a partial file on disk.

use crate::error::{Error, Result};
use crate::types::{DownloadRecord, StateFile};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Legacy state-file path this user's state may have been written to before
/// the canonical location was introduced. Checked once, on `load`, and
/// migrated in place if found.
#[derive(Clone, Debug)]
pub struct LegacyPath(pub PathBuf);

/// A per-user persistent store of download outcomes, keyed by job id.
pub struct DownloadStateStore {
    sid: String,
    path: PathBuf,
    legacy_path: Option<LegacyPath>,
    state: Arc<RwLock<StateFile>>,
}

impl DownloadStateStore {
    /// Build a store for `path`, without touching disk yet. Call [`Self::load`]
    /// to populate it from an existing file.
    pub fn new(sid: impl Into<String>, path: PathBuf, legacy_path: Option<LegacyPath>) -> Self {
        Self {
            sid: sid.into(),
            path,
            legacy_path,
            state: Arc::new(RwLock::new(StateFile::default())),
        }
    }

    /// Load the state file from disk. A missing file is not an error — the
    /// store starts empty. If a legacy path is configured and a file exists
    /// there but not at the canonical path, it is migrated in place first.
    pub async fn load(&self) -> Result<()> {
        self.migrate_legacy_if_needed().await?;

        let loaded = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::State {
                sid: self.sid.clone(),
                message: format!("failed to parse state file: {e}"),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => {
                return Err(Error::State {
                    sid: self.sid.clone(),
                    message: format!("failed to read state file: {e}"),
                });
            }
        };

        *self.state.write().await = loaded;
        Ok(())
    }

    async fn migrate_legacy_if_needed(&self) -> Result<()> {
        let Some(legacy) = &self.legacy_path else {
            return Ok(());
        };
        if self.path.exists() || !legacy.0.exists() {
            return Ok(());
        }

        tracing::info!(
            sid = %self.sid,
            from = %legacy.0.display(),
            to = %self.path.display(),
            "migrating state file from legacy path"
        );

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
            set_owner_only(parent).await;
        }

        if tokio::fs::rename(&legacy.0, &self.path).await.is_err() {
            // Cross-volume rename fails; fall back to copy + delete.
            tokio::fs::copy(&legacy.0, &self.path)
                .await
                .map_err(Error::Io)?;
            let _ = tokio::fs::remove_file(&legacy.0).await;
        }
        Ok(())
    }

    /// Serialize the current state and write it atomically: a sibling
    /// `*.tmp` file is written first (owner-only permissions), then renamed
    /// over the target.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.read().await;
        let json = serde_json::to_vec_pretty(&*state).map_err(|e| Error::State {
            sid: self.sid.clone(),
            message: format!("failed to serialize state: {e}"),
        })?;
        drop(state);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
            set_owner_only(parent).await;
        }

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json).await.map_err(Error::Io)?;
        set_owner_only(&tmp_path).await;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(Error::Io)?;
        Ok(())
    }

    /// `IsDownloaded(job_id)` — a record exists with an empty error.
    pub async fn is_downloaded(&self, job_id: &str) -> bool {
        self.state
            .read()
            .await
            .downloaded
            .get(job_id)
            .map(DownloadRecord::is_success)
            .unwrap_or(false)
    }

    /// Record a successful download.
    pub async fn mark_downloaded(
        &self,
        job_id: &str,
        job_name: &str,
        output_dir: &Path,
        file_count: u64,
        total_size: u64,
    ) {
        let record = DownloadRecord {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            downloaded_at: Utc::now(),
            output_dir: output_dir.to_path_buf(),
            file_count,
            total_size,
            error: None,
        };
        self.state
            .write()
            .await
            .downloaded
            .insert(job_id.to_string(), record);
    }

    /// Record a failed download attempt. Does not mark the job as
    /// downloaded; `is_downloaded` still returns false afterward.
    pub async fn mark_failed(&self, job_id: &str, job_name: &str, err: &str) {
        let record = DownloadRecord {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            downloaded_at: Utc::now(),
            output_dir: PathBuf::new(),
            file_count: 0,
            total_size: 0,
            error: Some(err.to_string()),
        };
        self.state
            .write()
            .await
            .downloaded
            .insert(job_id.to_string(), record);
    }

    /// Remove only records with a non-empty error, so a retry can run again
    /// next tick. Successful records are never erased by this call.
    pub async fn clear_failed(&self, job_id: &str) {
        let mut state = self.state.write().await;
        if matches!(state.downloaded.get(job_id), Some(r) if r.error.is_some()) {
            state.downloaded.remove(job_id);
        }
    }

    /// Stamp the time of the daemon's last completed scan tick.
    pub async fn update_last_poll(&self) {
        self.state.write().await.last_poll = Some(Utc::now());
    }

    /// Timestamp of the last completed scan tick, if any.
    pub async fn last_poll(&self) -> Option<chrono::DateTime<Utc>> {
        self.state.read().await.last_poll
    }

    /// Whether a state entry (success or failure) exists for this job.
    pub async fn has_record(&self, job_id: &str) -> bool {
        self.state.read().await.downloaded.contains_key(job_id)
    }

    /// The `limit` most recently downloaded jobs, newest first.
    pub async fn recent_downloads(&self, limit: usize) -> Vec<DownloadRecord> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .downloaded
            .values()
            .filter(|r| r.is_success())
            .cloned()
            .collect();
        records.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        records.truncate(limit);
        records
    }

    /// All jobs currently recorded with a non-empty error.
    pub async fn failed_jobs(&self) -> Vec<DownloadRecord> {
        self.state
            .read()
            .await
            .downloaded
            .values()
            .filter(|r| !r.is_success())
            .cloned()
            .collect()
    }

    /// Total number of successful downloads recorded for this user.
    pub async fn downloaded_count(&self) -> u64 {
        self.state
            .read()
            .await
            .downloaded
            .values()
            .filter(|r| r.is_success())
            .count() as u64
    }
}

#[cfg(unix)]
async fn set_owner_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mode = if path.is_dir() { 0o700 } else { 0o600 };
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await;
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) {}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_at(dir: &TempDir) -> DownloadStateStore {
        DownloadStateStore::new("u1", dir.path().join("state.json"), None)
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        store.load().await.unwrap();
        assert_eq!(store.downloaded_count().await, 0);
        assert!(store.last_poll().await.is_none());
    }

    #[tokio::test]
    async fn mark_downloaded_then_is_downloaded_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        store.load().await.unwrap();

        assert!(!store.is_downloaded("j1").await);
        store
            .mark_downloaded("j1", "Sim 1", Path::new("/tmp/out"), 3, 1024)
            .await;
        assert!(store.is_downloaded("j1").await);
    }

    #[tokio::test]
    async fn mark_failed_does_not_mark_as_downloaded() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        store.load().await.unwrap();

        store.mark_failed("j1", "Sim 1", "disk full").await;
        assert!(!store.is_downloaded("j1").await);
        assert!(store.has_record("j1").await);
        assert_eq!(store.failed_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn clear_failed_only_removes_failed_records() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        store.load().await.unwrap();

        store
            .mark_downloaded("ok", "Sim ok", Path::new("/tmp/out"), 1, 1)
            .await;
        store.mark_failed("bad", "Sim bad", "timeout").await;

        store.clear_failed("ok").await;
        assert!(store.is_downloaded("ok").await, "success must survive");

        store.clear_failed("bad").await;
        assert!(!store.has_record("bad").await, "failure should be cleared");
    }

    #[tokio::test]
    async fn save_then_load_round_trips_structurally() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        store.load().await.unwrap();
        store
            .mark_downloaded("j1", "Sim 1", Path::new("/tmp/out"), 5, 2048)
            .await;
        store.update_last_poll().await;
        store.save().await.unwrap();

        let reloaded = store_at(&dir);
        reloaded.load().await.unwrap();
        assert!(reloaded.is_downloaded("j1").await);
        assert!(reloaded.last_poll().await.is_some());
    }

    #[tokio::test]
    async fn save_writes_via_tmp_then_rename_leaving_no_tmp_behind() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        store.load().await.unwrap();
        store.save().await.unwrap();

        assert!(dir.path().join("state.json").exists());
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[tokio::test]
    async fn legacy_path_is_migrated_on_load() {
        let dir = TempDir::new().unwrap();
        let legacy_path = dir.path().join("legacy.json");
        let canonical_path = dir.path().join("state.json");

        let legacy_store = DownloadStateStore::new("u1", legacy_path.clone(), None);
        legacy_store.load().await.unwrap();
        legacy_store
            .mark_downloaded("j1", "Sim 1", Path::new("/tmp/out"), 1, 1)
            .await;
        legacy_store.save().await.unwrap();

        let store = DownloadStateStore::new(
            "u1",
            canonical_path.clone(),
            Some(LegacyPath(legacy_path.clone())),
        );
        store.load().await.unwrap();
        assert!(store.is_downloaded("j1").await);
        assert!(canonical_path.exists());
        assert!(!legacy_path.exists());
    }

    #[tokio::test]
    async fn recent_downloads_returns_newest_first_up_to_limit() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        store.load().await.unwrap();

        for i in 0..5 {
            store
                .mark_downloaded(&format!("j{i}"), "Sim", Path::new("/tmp/out"), 1, 1)
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let recent = store.recent_downloads(3).await;
        assert_eq!(recent.len(), 3);
        assert!(recent[0].downloaded_at >= recent[1].downloaded_at);
    }
}
