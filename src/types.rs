//! Core domain types for relay-sync-agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// A local user identity with its own config file, state file, log
/// directory, and daemon. Created by profile enumeration, never mutated,
/// dropped when the profile disappears from the system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    /// Opaque stable identifier, stable across renames
    pub sid: String,
    /// Human-readable username
    pub username: String,
    /// Root of the user's profile directory
    pub profile_root: PathBuf,
    /// Path to this user's config file
    pub config_path: PathBuf,
    /// Path to this user's persisted download state file
    pub state_path: PathBuf,
    /// Directory this user's log files are written under
    pub log_dir: PathBuf,
}

/// Lifecycle state of a per-user daemon, as surfaced by `GetStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// Scan loop running normally
    Running,
    /// Daemon exists but its scan loop is stopped by `PauseUser`
    Paused,
    /// Config loaded but `is_enabled()` is false
    Disabled,
    /// Enabled but could not start (e.g. missing credentials)
    Error,
    /// No daemon entry for this profile (not yet started, or stopped)
    Stopped,
}

/// A job as returned by the remote platform's list endpoint. Read-only in
/// process; the remote is always the source of truth for job metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable job identifier
    pub id: String,
    /// Job display name
    pub name: String,
    /// Status string, e.g. "Completed", "Pending", "Queued"
    pub status: String,
    /// Owning username on the remote platform
    pub owner: String,
    /// When the job was created
    pub date_inserted: DateTime<Utc>,
    /// When the job completed, if known without a separate status-history call
    #[serde(default)]
    pub date_completed: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether this job's status is the one the scan monitor looks for.
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }
}

/// One entry in a job's status-change history, used to find the exact
/// completion timestamp when a lookback window is active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatusEntry {
    /// Status name at this point in history
    pub status: String,
    /// When the job entered this status, as a server-formatted timestamp
    /// (RFC3339 or a microsecond-precision variant — both are accepted)
    pub timestamp: String,
}

/// A file belonging to a job's output, as listed by the remote platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Stable file identifier
    pub id: String,
    /// File name, without any directory component
    pub name: String,
    /// Server-relative path within the job's output tree, if any
    #[serde(default)]
    pub relative_path: Option<String>,
    /// Size in bytes, if known
    #[serde(default)]
    pub size: Option<u64>,
    /// Storage descriptor used to request short-lived transfer credentials
    #[serde(default)]
    pub storage_descriptor: Option<String>,
}

/// A custom field value attached to a job. The remote accepts two wire
/// shapes for the collection (array of objects, or map keyed by field
/// name) — both are normalized into this type by the remote client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    /// Field name, e.g. `"Auto Download"`
    pub name: String,
    /// Field value as a string
    pub value: String,
}

/// Three-valued outcome of the eligibility engine for one job.
///
/// `should_log` distinguishes "not a real candidate, skip silently" from
/// "real candidate rejected, record why" so operators aren't flooded with
/// log lines for every job that was never going to be downloaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EligibilityVerdict {
    /// Whether the job should be downloaded
    pub eligible: bool,
    /// Human-readable reason, used in summary log lines
    pub reason: String,
    /// Whether this verdict is worth a log line at all
    pub should_log: bool,
}

impl EligibilityVerdict {
    /// A verdict that does not produce a log line: the job was never a
    /// real policy candidate.
    pub fn silent_skip(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: reason.into(),
            should_log: false,
        }
    }

    /// A rejection worth recording: the job was a real candidate but
    /// failed a later gate.
    pub fn logged_skip(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: reason.into(),
            should_log: true,
        }
    }

    /// An eligible verdict, always logged.
    pub fn eligible(reason: impl Into<String>) -> Self {
        Self {
            eligible: true,
            reason: reason.into(),
            should_log: true,
        }
    }
}

/// A persisted record of one job's download outcome. Either `error` is
/// empty (success) or non-empty, in which case the other fields are
/// best-effort only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// The job this record is for
    pub job_id: String,
    /// Job name at the time of download, for display in history
    pub job_name: String,
    /// When this record was written
    pub downloaded_at: DateTime<Utc>,
    /// Local directory the job's files were written to
    pub output_dir: PathBuf,
    /// Number of files transferred
    #[serde(default)]
    pub file_count: u64,
    /// Total bytes transferred
    #[serde(default)]
    pub total_size: u64,
    /// Error text if the download failed; omitted entirely on success
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl DownloadRecord {
    /// `IsDownloaded(job_id)` ≡ a record exists with an empty error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The persisted state-file schema for one user: `{version, last_poll,
/// downloaded}`. Written atomically (`*.tmp` then rename); a missing file
/// on load is not an error, just empty state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    /// Schema version, for forward migrations
    pub version: String,
    /// Timestamp of the daemon's last completed scan tick
    #[serde(default)]
    pub last_poll: Option<DateTime<Utc>>,
    /// Job id to its most recent download outcome, kept in a sorted map so
    /// two saves of identical state serialize to byte-identical JSON.
    #[serde(default)]
    pub downloaded: BTreeMap<String, DownloadRecord>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            last_poll: None,
            downloaded: BTreeMap::new(),
        }
    }
}

/// Severity of a log-ring entry, matching `tracing::Level` without taking a
/// hard dependency on it in the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Fine-grained diagnostic detail
    Debug,
    /// Routine informational messages
    Info,
    /// Recoverable problems worth an operator's attention
    Warn,
    /// Failures
    Error,
}

/// One structured entry in the log ring buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Which pipeline stage produced this entry, e.g. `"scan"`, `"download"`, `"ipc"`
    pub stage: String,
    /// Human-readable message
    pub message: String,
    /// Structured fields attached to the tracing event
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, String>,
}

/// Coarse lifecycle event emitted on the orchestrator's broadcast channel,
/// for in-process embedding. Additive to the IPC log stream, which is for
/// out-of-process clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A per-user daemon started
    DaemonStarted {
        /// The user whose daemon started
        sid: String,
    },
    /// A per-user daemon stopped
    DaemonStopped {
        /// The user whose daemon stopped
        sid: String,
    },
    /// A scan tick finished
    ScanCompleted {
        /// The user this tick belonged to
        sid: String,
        /// Candidates offered to the eligibility engine
        candidates: usize,
        /// Jobs actually downloaded this tick
        downloaded: usize,
    },
    /// One job finished downloading successfully
    DownloadCompleted {
        /// The user this download belonged to
        sid: String,
        /// The job that finished
        job_id: String,
    },
}

/// Snapshot of one user's daemon, returned by `GetUserList`/`GetStatus`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserStatus {
    /// Human-readable username
    pub username: String,
    /// Opaque stable identifier, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Current lifecycle state
    pub state: DaemonState,
    /// Configured download folder
    pub download_folder: PathBuf,
    /// Timestamp of the last completed scan tick
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan_time: Option<DateTime<Utc>>,
    /// Total jobs downloaded so far for this user
    pub jobs_downloaded: u64,
    /// Files currently being transferred for this user
    #[serde(default)]
    pub active_downloads: u64,
    /// Most recent error, if any (e.g. "no_api_key")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of the connection-test operation the GUI uses to validate
/// credentials, raced against a 7-second wall clock ceiling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerTestResult {
    /// Whether the test call succeeded within the deadline
    pub success: bool,
    /// Round-trip latency, if the call completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
    /// Error message, if the call failed or timed out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_is_completed_is_case_insensitive() {
        let job = sample_job("Completed");
        assert!(job.is_completed());
        let job = sample_job("completed");
        assert!(job.is_completed());
        let job = sample_job("Pending");
        assert!(!job.is_completed());
    }

    #[test]
    fn download_record_is_success_reflects_error_field() {
        let mut record = sample_record();
        assert!(record.is_success());
        record.error = Some("boom".into());
        assert!(!record.is_success());
    }

    #[test]
    fn state_file_default_is_empty_with_version() {
        let state = StateFile::default();
        assert_eq!(state.version, "1.0.0");
        assert!(state.downloaded.is_empty());
        assert!(state.last_poll.is_none());
    }

    #[test]
    fn state_file_round_trips_through_json() {
        let mut state = StateFile::default();
        state.downloaded.insert("j1".into(), sample_record());
        let json = serde_json::to_string(&state).unwrap();
        let restored: StateFile = serde_json::from_str(&json).unwrap();
        assert_eq!(state, restored);
    }

    #[test]
    fn eligibility_verdict_constructors_set_should_log() {
        assert!(!EligibilityVerdict::silent_skip("x").should_log);
        assert!(EligibilityVerdict::logged_skip("x").should_log);
        assert!(EligibilityVerdict::eligible("x").eligible);
    }

    fn sample_job(status: &str) -> Job {
        Job {
            id: "j1".into(),
            name: "Simulation 1".into(),
            status: status.into(),
            owner: "alice".into(),
            date_inserted: Utc::now(),
            date_completed: None,
        }
    }

    fn sample_record() -> DownloadRecord {
        DownloadRecord {
            job_id: "j1".into(),
            job_name: "Simulation 1".into(),
            downloaded_at: Utc::now(),
            output_dir: PathBuf::from("/tmp/out"),
            file_count: 3,
            total_size: 1024,
            error: None,
        }
    }
}
