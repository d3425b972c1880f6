//! Wire types for the newline-delimited JSON IPC protocol.
//!
//! One [`IpcRequest`] per line in, one or more [`IpcResponse`] values per
//! line out (`SubscribeLogs` streams a `LogEntry` response per line until
//! the client disconnects or unsubscribes).

use crate::error::ErrorDetail;
use crate::types::{DaemonState, LogEntry, UserStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A request from an IPC client. `user_id` is the target profile (sid or
/// username, case-insensitive); ignored in single-user mode.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Service-wide status snapshot
    GetStatus,
    /// Per-user status list
    GetUserList,
    /// Pause the named user's daemon (scan timer keeps running, ticks are skipped)
    PauseUser {
        /// sid or username, case-insensitive
        user_id: String,
    },
    /// Resume a paused daemon
    ResumeUser {
        /// sid or username, case-insensitive
        user_id: String,
    },
    /// Run one scan tick for the named user immediately
    TriggerScan {
        /// sid or username, case-insensitive
        user_id: String,
    },
    /// Re-enumerate every local profile immediately
    TriggerRescan,
    /// The `n` most recent buffered log entries
    GetRecentLogs {
        /// How many entries to return, oldest-first within the window
        count: usize,
    },
    /// Stream future log entries until the client disconnects
    SubscribeLogs,
    /// Reveal the log directory in the OS file browser; out of scope here
    /// beyond acknowledging the request
    OpenLogs,
    /// Re-read every profile's config file without a full profile rescan
    ReloadConfig,
    /// Stop the service
    Shutdown,
}

/// A response to an [`IpcRequest`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Reply to `GetStatus`
    Status {
        /// Coarse service lifecycle state
        service_state: String,
        /// Crate version at build time
        version: String,
        /// Most recent scan-tick time across all managed users
        #[serde(skip_serializing_if = "Option::is_none")]
        last_scan_time: Option<DateTime<Utc>>,
        /// Sum of active downloads across all managed users
        active_downloads: u64,
        /// Number of profiles currently tracked
        active_users: usize,
        /// Most recent error across any managed user, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
        /// Time elapsed since the service started, in seconds
        uptime_secs: u64,
        /// `"multi_user"` or `"single_user"`
        service_mode: String,
    },
    /// Reply to `GetUserList`
    UserList {
        /// One entry per tracked profile
        users: Vec<UserStatus>,
    },
    /// Reply to `GetRecentLogs`
    RecentLogs {
        /// Buffered entries, oldest-first within the requested window
        entries: Vec<LogEntry>,
    },
    /// One streamed entry in a `SubscribeLogs` response
    LogEntry(LogEntry),
    /// Reply to `ReloadConfig`
    ReloadConfig {
        /// Whether the reload was applied immediately
        applied: bool,
        /// Whether the reload was deferred because downloads are active
        deferred: bool,
        /// Active downloads across all users at the time of the request
        active_downloads: u64,
        /// Error text if reloading any profile's config failed
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Plain acknowledgement, used for `PauseUser`/`ResumeUser`/`TriggerScan`/
    /// `TriggerRescan`/`OpenLogs`/`Shutdown`
    Ok,
    /// The request failed
    Error {
        /// Structured error detail
        error: ErrorDetail,
    },
}

impl IpcResponse {
    /// Build an [`IpcResponse::Status`] from the orchestrator's snapshot.
    pub fn from_status(status: &crate::orchestrator::ServiceStatus) -> Self {
        IpcResponse::Status {
            service_state: status.service_state.to_string(),
            version: status.version.to_string(),
            last_scan_time: status.last_scan_time,
            active_downloads: status.active_downloads,
            active_users: status.active_users,
            last_error: status.last_error.clone(),
            uptime_secs: status.uptime.as_secs(),
            service_mode: status.service_mode.to_string(),
        }
    }
}

/// Lifecycle state as surfaced over IPC, redundant with [`DaemonState`] but
/// kept distinct so the wire enum can diverge from the internal one without
/// a breaking protocol change.
pub type WireDaemonState = DaemonState;

/// Placeholder folder reveal result, unused beyond acknowledging `OpenLogs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenLogsResult {
    /// The directory that would be revealed
    pub log_dir: PathBuf,
}

/// Read deadline for one line of an IPC request, per connection.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Max buffered line length before a connection is dropped as malformed.
pub const MAX_LINE_BYTES: usize = 4096;
