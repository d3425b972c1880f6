//! Shared helpers for the end-to-end scenario tests: a [`Daemon`] wired
//! against a [`wiremock::MockServer`] standing in for the remote platform,
//! plus the job/tag/custom-field fixture builders the scenarios share.

use relay_sync_agent::collaborators::HttpFileTransfer;
use relay_sync_agent::config::{DaemonConfig, ServiceConfig};
use relay_sync_agent::daemon::Daemon;
use relay_sync_agent::log_ring::LogRing;
use relay_sync_agent::rate_limiter::RateLimiter;
use relay_sync_agent::remote::RemoteClient;
use relay_sync_agent::state_store::DownloadStateStore;
use relay_sync_agent::types::UserProfile;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

/// One user's daemon plus its backing temp directory, torn down together.
pub struct Harness {
    pub daemon: Daemon,
    pub download_dir: TempDir,
    pub state_path: PathBuf,
}

/// Build a daemon for user `sid` against `server`, with default test policy
/// (`auto_download_tag` left to the caller since S2/S3 need it set).
pub async fn harness(server: &MockServer, auto_download_tag: &str) -> Harness {
    let mut service_config = ServiceConfig::default();
    service_config.api_base_url = url::Url::parse(&server.uri()).expect("mock server uri");

    let limiter = RateLimiter::new(&service_config);
    let remote = Arc::new(RemoteClient::new(
        "test-token".to_string(),
        limiter,
        service_config.clone(),
    ));
    let transfer = Arc::new(HttpFileTransfer::new(
        reqwest::Client::new(),
        service_config.api_base_url.clone(),
        "test-token".to_string(),
    ));

    let download_dir = TempDir::new().expect("tempdir");
    let state_dir = TempDir::new().expect("tempdir");
    let state_path = state_dir.path().join("state.json");
    let state = DownloadStateStore::new("u1", state_path.clone(), None);

    let profile = UserProfile {
        sid: "u1".to_string(),
        username: "alice".to_string(),
        profile_root: state_dir.path().to_path_buf(),
        config_path: state_dir.path().join("config.json"),
        state_path: state_path.clone(),
        log_dir: state_dir.path().join("logs"),
    };

    let config = DaemonConfig {
        enabled: true,
        download_folder: download_dir.path().to_path_buf(),
        poll_interval: Duration::from_secs(900),
        use_job_name_directory: true,
        max_concurrent_files: 4,
        lookback_days: 7,
        filters: None,
        auto_download_tag: auto_download_tag.to_string(),
    };

    let log_ring = Arc::new(LogRing::new(100));
    let (events, _rx) = tokio::sync::broadcast::channel(16);

    let daemon = Daemon::new(profile, config, remote, transfer, state, log_ring, events);

    Harness {
        daemon,
        download_dir,
        state_path,
    }
}
