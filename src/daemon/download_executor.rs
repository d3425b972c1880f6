//! Per-job output directory naming, file listing, path-traversal-safe local
//! path resolution, and concurrency-limited transfer via the
//! [`FileTransfer`] collaborator.

use super::Shared;
use crate::config::DaemonConfig;
use crate::eligibility::EligibilityEngine;
use crate::error::{Error, Result};
use crate::types::{Job, RemoteFile};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

/// Sanitized job-name directory components are capped at this length,
/// matching the source system's exact truncate-before-trim ordering.
const MAX_NAME_LEN: usize = 100;
const UNNAMED_JOB: &str = "unnamed_job";
const SHORT_ID_LEN: usize = 6;

/// Outcome of one job's completed download, used for the summary log line
/// and the persisted [`crate::types::DownloadRecord`].
pub(super) struct DownloadOutcome {
    pub(super) file_count: u64,
    pub(super) total_bytes: u64,
}

/// Download one eligible job: list its files, transfer each to a
/// path-traversal-checked local path (bounded by `config.max_concurrent_files`
/// concurrent transfers), then persist the outcome and write the downloaded
/// tag back to the remote.
pub(super) async fn download_job(
    shared: &Shared,
    cancel: &CancellationToken,
    job: &Job,
    config: &DaemonConfig,
    eligibility: &EligibilityEngine<'_>,
) -> Result<DownloadOutcome> {
    let override_path = eligibility
        .job_download_path(cancel, &job.id)
        .await
        .unwrap_or_default();
    let base_dir = if override_path.is_empty() {
        config.download_folder.clone()
    } else {
        PathBuf::from(override_path)
    };

    let output_dir = output_directory(&base_dir, job, config.use_job_name_directory);
    tokio::fs::create_dir_all(&output_dir).await.map_err(Error::Io)?;
    set_dir_permissions(&output_dir).await;

    let files = shared.remote.list_job_files(cancel, &job.id).await?;

    let concurrency = config.max_concurrent_files.max(1);
    let results: Vec<Result<Option<u64>>> = stream::iter(files)
        .map(|file| transfer_one_file(shared, cancel, &job.id, &output_dir, file))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut file_count = 0u64;
    let mut total_bytes = 0u64;
    for result in results {
        match result? {
            Some(bytes) => {
                file_count += 1;
                total_bytes += bytes;
            }
            None => {}
        }
    }

    shared
        .state
        .mark_downloaded(&job.id, &job.name, &output_dir, file_count, total_bytes)
        .await;
    eligibility.mark_downloaded_remote(cancel, &job.id).await;

    Ok(DownloadOutcome {
        file_count,
        total_bytes,
    })
}

/// Transfer one file. Returns `Ok(None)` if its path cannot be validated as
/// safe (not counted towards `file_count`). Returns `Ok(Some(0))` without
/// re-fetching if the local path already exists — counted as present so a
/// job resumed after a partial download still reports its full file count.
/// Tracks the per-daemon active-download counter around the transfer
/// itself, not the listing.
async fn transfer_one_file(
    shared: &Shared,
    cancel: &CancellationToken,
    job_id: &str,
    output_dir: &Path,
    file: RemoteFile,
) -> Result<Option<u64>> {
    let local_path = match resolve_local_path(output_dir, &file) {
        Ok(path) => path,
        Err(reason) => {
            tracing::warn!(job_id, file_id = %file.id, reason, "skipping file with unsafe path");
            return Ok(None);
        }
    };

    if local_path.exists() {
        return Ok(Some(0));
    }

    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
    }

    shared.active_downloads.fetch_add(1, Ordering::SeqCst);
    let result = shared.transfer.transfer(cancel, &file, &local_path).await;
    shared.active_downloads.fetch_sub(1, Ordering::SeqCst);

    result.map(Some)
}

/// `<base>/<sanitized_name>_<short_id>` when name-directories are enabled,
/// otherwise `<base>/job_<full_id>`.
fn output_directory(base_dir: &Path, job: &Job, use_job_name_directory: bool) -> PathBuf {
    if use_job_name_directory {
        let short_id: String = job.id.chars().take(SHORT_ID_LEN).collect();
        let sanitized = sanitize_job_name(&job.name);
        base_dir.join(format!("{sanitized}_{short_id}"))
    } else {
        base_dir.join(format!("job_{}", job.id))
    }
}

/// Replace `/ \ : * ? " < > | CR LF` with `_`, truncate to 100 chars, *then*
/// trim whitespace and leading/trailing `.` — in that order, not the reverse,
/// since a downstream consumer depends on the exact post-truncation result.
fn sanitize_job_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if is_forbidden_char(c) { '_' } else { c })
        .collect();

    let truncated: String = if replaced.chars().count() > MAX_NAME_LEN {
        replaced.chars().take(MAX_NAME_LEN).collect()
    } else {
        replaced
    };

    let trimmed = truncated.trim().trim_matches('.').to_string();

    if trimmed.is_empty() {
        UNNAMED_JOB.to_string()
    } else {
        trimmed
    }
}

fn is_forbidden_char(c: char) -> bool {
    matches!(
        c,
        '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\r' | '\n'
    )
}

/// Prefer the server's `relative_path` if it's free of traversal components;
/// otherwise fall back to the bare filename, also validated.
fn resolve_local_path(output_dir: &Path, file: &RemoteFile) -> std::result::Result<PathBuf, String> {
    if let Some(relative) = &file.relative_path {
        if is_safe_relative_path(relative) {
            return Ok(output_dir.join(relative));
        }
    }

    if is_safe_filename(&file.name) {
        Ok(output_dir.join(&file.name))
    } else {
        Err(format!("unsafe file name: {}", file.name))
    }
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && name != ".."
        && name != "."
}

fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
}

#[cfg(unix)]
async fn set_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await;
}

#[cfg(not(unix))]
async fn set_dir_permissions(_path: &Path) {}
