//! Configuration types for relay-sync-agent
//!
//! Two layers, matching the split between per-user policy and process-wide
//! plumbing: [`DaemonConfig`] is loaded once per user profile and reloaded on
//! every orchestrator rescan; [`ServiceConfig`] is loaded once at process
//! start and covers the remote endpoint, rate-scope ceilings, retry tuning,
//! and the IPC transport.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name filters applied by the scan monitor before a job is offered to the
/// eligibility engine. All comparisons are case-insensitive; `exclude` uses
/// prefix matching.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NameFilters {
    /// Job name must start with this, if set
    #[serde(default)]
    pub prefix: Option<String>,
    /// Job name must contain this substring, if set
    #[serde(default)]
    pub contains: Option<String>,
    /// Job name must not start with any of these
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl NameFilters {
    /// Whether `name` passes all configured filters.
    pub fn matches(&self, name: &str) -> bool {
        let lower = name.to_lowercase();

        if let Some(prefix) = &self.prefix {
            if !lower.starts_with(&prefix.to_lowercase()) {
                return false;
            }
        }
        if let Some(contains) = &self.contains {
            if !lower.contains(&contains.to_lowercase()) {
                return false;
            }
        }
        for excl in &self.exclude {
            if lower.starts_with(&excl.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Per-user download policy, loaded from the user's config file.
///
/// A change to any field (as compared by the orchestrator against its
/// cached copy) triggers a daemon restart on the next rescan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Whether this user's daemon should run at all
    #[serde(default)]
    pub enabled: bool,

    /// Local directory job output is written under
    #[serde(default)]
    pub download_folder: PathBuf,

    /// How often the scan tick fires (minimum 1 minute, enforced on load)
    #[serde(default = "default_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,

    /// Whether output directories are named after the job, or just `job_<id>`
    #[serde(default = "default_true")]
    pub use_job_name_directory: bool,

    /// Per-daemon cap on simultaneous file transfers
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    /// How many days back a job's completion time must fall within to be
    /// considered (minimum 1 day, enforced on load)
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Optional job name filters
    #[serde(default)]
    pub filters: Option<NameFilters>,

    /// The tag required when the remote policy field is `"conditional"`
    #[serde(default)]
    pub auto_download_tag: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            download_folder: PathBuf::new(),
            poll_interval: default_poll_interval(),
            use_job_name_directory: true,
            max_concurrent_files: default_max_concurrent_files(),
            lookback_days: default_lookback_days(),
            filters: None,
            auto_download_tag: String::new(),
        }
    }
}

impl DaemonConfig {
    /// `enabled ∧ download_folder ≠ ∅ ∧ poll_interval > 0 ∧ lookback_days > 0`.
    pub fn is_enabled(&self) -> bool {
        self.enabled
            && !self.download_folder.as_os_str().is_empty()
            && self.poll_interval > Duration::ZERO
            && self.lookback_days > 0
    }

    /// Clamp `poll_interval` to at least one minute and `lookback_days` to at
    /// least one day, as loaded configs may come from an older file format.
    pub fn normalize(&mut self) {
        if self.poll_interval < Duration::from_secs(60) {
            self.poll_interval = Duration::from_secs(60);
        }
        if self.lookback_days == 0 {
            self.lookback_days = 1;
        }
        if self.max_concurrent_files == 0 {
            self.max_concurrent_files = 1;
        }
    }

    /// The fields the orchestrator compares to decide whether a config
    /// change warrants restarting a running daemon.
    pub fn significant_fields_eq(&self, other: &DaemonConfig) -> bool {
        self.enabled == other.enabled
            && self.download_folder == other.download_folder
            && self.poll_interval == other.poll_interval
            && self.lookback_days == other.lookback_days
            && self.max_concurrent_files == other.max_concurrent_files
            && self.filters == other.filters
            && self.auto_download_tag == other.auto_download_tag
            && self.use_job_name_directory == other.use_job_name_directory
    }
}

/// Source of a loaded [`DaemonConfig`]. The file format and location are out
/// of scope for this crate (owned by the GUI/installer); this trait is the
/// boundary the orchestrator depends on.
pub trait ConfigSource: Send + Sync {
    /// Load and parse the config at `path`.
    fn load(&self, path: &Path) -> crate::error::Result<DaemonConfig>;
}

/// Reference [`ConfigSource`] implementation: a plain JSON file with
/// `#[serde(default = ...)]` field defaults, good enough to exercise the
/// eligibility and scan logic in tests without a real installer-owned format.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonConfigSource;

impl ConfigSource for JsonConfigSource {
    fn load(&self, path: &Path) -> crate::error::Result<DaemonConfig> {
        let bytes = std::fs::read(path).map_err(crate::error::Error::Io)?;
        let mut config: DaemonConfig = serde_json::from_slice(&bytes)?;
        config.normalize();
        Ok(config)
    }
}

/// One of the remote platform's four independent throttling scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    /// Default scope: most `/api/v3/` reads
    User,
    /// Job submission scope: `/api/v2/jobs/{id}/submit/`
    JobSubmit,
    /// Bulk job-usage scope: other `/api/v2/jobs/` paths
    JobsUsage,
    /// File storage scope: `/api/v2/files/` paths
    FileAccess,
}

impl RateScope {
    /// All scopes, in a stable order, used to build the limiter's bucket map.
    pub const ALL: [RateScope; 4] = [
        RateScope::User,
        RateScope::JobSubmit,
        RateScope::JobsUsage,
        RateScope::FileAccess,
    ];

    /// Requests-per-second ceiling for this scope, set at 80% of the
    /// published hard limit.
    pub fn default_rate(self) -> f64 {
        match self {
            RateScope::User => 2.0,
            RateScope::JobSubmit => 0.14,
            RateScope::JobsUsage => 25.0,
            RateScope::FileAccess => 10.0,
        }
    }

    /// Classify a request path into the scope that should gate it.
    pub fn classify(path: &str) -> RateScope {
        if path.contains("/submit") {
            RateScope::JobSubmit
        } else if path.contains("/api/v2/jobs") {
            RateScope::JobsUsage
        } else if path.contains("/api/v2/files") {
            RateScope::FileAccess
        } else {
            RateScope::User
        }
    }
}

/// Per-scope rate limiter tuning. Burst defaults to `ceil(rate)`, minimum 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second
    pub rate: f64,
    /// Maximum burst size (tokens available after a long idle period)
    pub burst: u32,
}

impl RateLimitConfig {
    fn for_scope(scope: RateScope) -> Self {
        let rate = scope.default_rate();
        let burst = (rate.ceil() as u32).max(1);
        Self { rate, burst }
    }
}

/// Retry configuration for transient remote failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial try (default: 10)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_secs")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_secs")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// IPC transport configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Filesystem socket path (Unix) or named-pipe path (Windows)
    #[serde(default = "default_ipc_path")]
    pub path: PathBuf,

    /// Whether this process runs in single-user (subprocess) mode, where the
    /// `user_id` field on requests is ignored
    #[serde(default)]
    pub single_user: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            path: default_ipc_path(),
            single_user: false,
        }
    }
}

/// Process-wide settings, loaded once at startup: the remote API base URL,
/// the four rate-scope ceilings, retry tuning, the IPC transport, and the
/// log ring capacity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the remote compute platform's API, e.g. `https://api.example.com`
    pub api_base_url: url::Url,

    /// Per-scope rate limit tuning, keyed by scope
    #[serde(default = "default_rate_limits")]
    pub rate_limits: std::collections::HashMap<RateScope, RateLimitConfig>,

    /// Retry tuning shared by all remote client calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// IPC transport settings
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Log ring buffer capacity (default: 1000)
    #[serde(default = "default_log_ring_capacity")]
    pub log_ring_capacity: usize,

    /// How often the orchestrator re-enumerates profiles (default: 5 minutes)
    #[serde(default = "default_profile_rescan_interval", with = "duration_secs")]
    pub profile_rescan_interval: Duration,
}

impl ServiceConfig {
    /// Look up this scope's configured rate limit, falling back to the
    /// compiled-in default if the config omitted it.
    pub fn rate_limit_for(&self, scope: RateScope) -> RateLimitConfig {
        self.rate_limits
            .get(&scope)
            .cloned()
            .unwrap_or_else(|| RateLimitConfig::for_scope(scope))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_base_url: url::Url::parse("https://api.rescale.com").expect("static URL"),
            rate_limits: default_rate_limits(),
            retry: RetryConfig::default(),
            ipc: IpcConfig::default(),
            log_ring_capacity: default_log_ring_capacity(),
            profile_rescan_interval: default_profile_rescan_interval(),
        }
    }
}

fn default_rate_limits() -> std::collections::HashMap<RateScope, RateLimitConfig> {
    RateScope::ALL
        .iter()
        .map(|&scope| (scope, RateLimitConfig::for_scope(scope)))
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_max_concurrent_files() -> usize {
    5
}

fn default_lookback_days() -> u32 {
    7
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_log_ring_capacity() -> usize {
    1000
}

fn default_profile_rescan_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_ipc_path() -> PathBuf {
    #[cfg(unix)]
    {
        PathBuf::from("/tmp/relay-sync-agent.sock")
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(r"\\.\pipe\relay-sync-agent")
    }
}

/// `Duration` as whole seconds, matching the teacher's `duration_serde` helper.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_config_is_enabled_requires_all_invariants() {
        let mut config = DaemonConfig {
            enabled: true,
            download_folder: PathBuf::from("/tmp/downloads"),
            ..DaemonConfig::default()
        };
        assert!(config.is_enabled());

        config.download_folder = PathBuf::new();
        assert!(!config.is_enabled());

        config.download_folder = PathBuf::from("/tmp/downloads");
        config.poll_interval = Duration::ZERO;
        assert!(!config.is_enabled());
    }

    #[test]
    fn normalize_clamps_poll_interval_and_lookback() {
        let mut config = DaemonConfig {
            poll_interval: Duration::from_secs(5),
            lookback_days: 0,
            max_concurrent_files: 0,
            ..DaemonConfig::default()
        };
        config.normalize();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.lookback_days, 1);
        assert_eq!(config.max_concurrent_files, 1);
    }

    #[test]
    fn significant_fields_eq_ignores_unrelated_changes() {
        let a = DaemonConfig {
            enabled: true,
            download_folder: PathBuf::from("/tmp/a"),
            ..DaemonConfig::default()
        };
        let b = a.clone();
        assert!(a.significant_fields_eq(&b));
    }

    #[test]
    fn name_filters_prefix_contains_exclude() {
        let filters = NameFilters {
            prefix: Some("Sim".into()),
            contains: Some("batch".into()),
            exclude: vec!["SimTest".into()],
        };
        assert!(filters.matches("Simulation batch 1"));
        assert!(!filters.matches("Other batch 1"));
        assert!(!filters.matches("Simulation nobatch"));
        assert!(!filters.matches("SimTest batch run"));
    }

    #[test]
    fn rate_scope_classification_routes_by_path() {
        assert_eq!(
            RateScope::classify("/api/v2/jobs/abc/submit/"),
            RateScope::JobSubmit
        );
        assert_eq!(
            RateScope::classify("/api/v2/jobs/abc/files/"),
            RateScope::JobsUsage
        );
        assert_eq!(
            RateScope::classify("/api/v2/files/abc/"),
            RateScope::FileAccess
        );
        assert_eq!(RateScope::classify("/api/v3/users/me/"), RateScope::User);
    }

    #[test]
    fn burst_is_ceil_of_rate_with_minimum_one() {
        let limit = RateLimitConfig::for_scope(RateScope::JobSubmit);
        assert_eq!(limit.burst, 1);
        let limit = RateLimitConfig::for_scope(RateScope::JobsUsage);
        assert_eq!(limit.burst, 25);
    }

    #[test]
    fn daemon_config_round_trips_through_json() {
        let config = DaemonConfig {
            enabled: true,
            download_folder: PathBuf::from("/tmp/downloads"),
            auto_download_tag: "autoDownload".into(),
            ..DaemonConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let restored: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, restored);
    }
}
