//! Trait boundaries for functionality this crate treats as an external
//! collaborator: the cryptographic file-transfer worker, desktop
//! notifications, and local-user profile enumeration. Each trait gets one
//! reference implementation good enough to exercise the core pipeline in
//! tests; production chunking/encryption/checksum logic, real toast
//! notifications, and OS-specific profile registries are out of scope.

use crate::error::{Error, Result};
use crate::types::{RemoteFile, UserProfile};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Transfers one remote file to a local path. The real implementation
/// chunks, encrypts, and checksums; this crate only needs the boundary.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Download `file` to `local_path`, honoring `cancel`.
    async fn transfer(
        &self,
        cancel: &CancellationToken,
        file: &RemoteFile,
        local_path: &Path,
    ) -> Result<u64>;
}

/// Reference [`FileTransfer`]: plain HTTP GET against the remote's file
/// content endpoint, streamed to disk. No encryption, no chunked resume.
pub struct HttpFileTransfer {
    http: reqwest::Client,
    base_url: url::Url,
    token: String,
}

impl HttpFileTransfer {
    /// Build a transfer worker authenticated with `token` against `base_url`.
    pub fn new(http: reqwest::Client, base_url: url::Url, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }
}

#[async_trait]
impl FileTransfer for HttpFileTransfer {
    async fn transfer(
        &self,
        cancel: &CancellationToken,
        file: &RemoteFile,
        local_path: &Path,
    ) -> Result<u64> {
        let url = self
            .base_url
            .join(&format!("/api/v2/files/{}/content/", file.id))
            .map_err(|e| Error::Other(format!("invalid file content URL: {e}")))?;

        let response = tokio::select! {
            result = self.http.get(url).header("Authorization", format!("Token {}", self.token)).send() => {
                result.map_err(|e| Error::Other(format!("file transfer request failed: {e}")))?
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let bytes = tokio::select! {
            result = response.bytes() => result.map_err(|e| Error::Other(format!("file transfer body read failed: {e}")))?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        tokio::fs::write(local_path, &bytes).await.map_err(Error::Io)?;
        Ok(bytes.len() as u64)
    }
}

/// Desktop toast notification surface. Out of scope beyond the boundary.
pub trait Notifier: Send + Sync {
    /// Notify the user that `job_name` finished downloading.
    fn notify_download_complete(&self, job_name: &str, file_count: u64);
    /// Notify the user that `job_name` failed to download.
    fn notify_download_failed(&self, job_name: &str, error: &str);
}

/// Reference [`Notifier`]: logs instead of raising a toast.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpNotifier;

impl Notifier for NoOpNotifier {
    fn notify_download_complete(&self, job_name: &str, file_count: u64) {
        tracing::debug!(job_name, file_count, "notify: download complete (no-op)");
    }

    fn notify_download_failed(&self, job_name: &str, error: &str) {
        tracing::debug!(job_name, error, "notify: download failed (no-op)");
    }
}

/// Enumerates local user profiles. One OS reads a system registry of
/// profile paths; others fall back to enumerating a filesystem root. Both
/// are out of scope in detail; this crate depends only on the boundary.
pub trait ProfileEnumerator: Send + Sync {
    /// List every local user profile that should be considered for a
    /// daemon, already excluding system/service/hidden profiles.
    fn enumerate(&self) -> Result<Vec<UserProfile>>;
}

/// Reference [`ProfileEnumerator`]: treats every immediate subdirectory of
/// `root` as a user profile, deriving canonical config/state/log paths and
/// skipping names on a fixed deny-list or matching a hidden-profile pattern.
pub struct FilesystemProfileEnumerator {
    root: PathBuf,
}

const DENYLISTED_PROFILE_NAMES: &[&str] = &["root", "daemon", "system", "service", "nobody"];

impl FilesystemProfileEnumerator {
    /// Enumerate profiles under `root`, one subdirectory per user.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn is_skipped(name: &str) -> bool {
        name.starts_with('.') || DENYLISTED_PROFILE_NAMES.contains(&name.to_lowercase().as_str())
    }
}

impl ProfileEnumerator for FilesystemProfileEnumerator {
    fn enumerate(&self) -> Result<Vec<UserProfile>> {
        let mut profiles = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(profiles),
            Err(e) => return Err(Error::Profile(format!("cannot enumerate profiles: {e}"))),
        };

        for entry in entries {
            let entry = entry.map_err(|e| Error::Profile(format!("directory read error: {e}")))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::is_skipped(&name) {
                continue;
            }

            let profile_root = entry.path();
            profiles.push(UserProfile {
                sid: name.clone(),
                username: name,
                config_path: profile_root.join(".relay-sync-agent").join("config.json"),
                state_path: profile_root.join(".relay-sync-agent").join("state.json"),
                log_dir: profile_root.join(".relay-sync-agent").join("logs"),
                profile_root,
            });
        }

        profiles.sort_by(|a, b| a.sid.cmp(&b.sid));
        Ok(profiles)
    }
}
