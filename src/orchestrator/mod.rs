//! Owns the map from profile to per-user daemon: enumerates local profiles,
//! starts/stops daemons, detects config changes on rescan, and exposes the
//! pause/resume/trigger controls the IPC server delegates to.

mod credentials;

pub use credentials::{CredentialSource, FileThenEnvCredentialSource};

use crate::collaborators::{FileTransfer, HttpFileTransfer, ProfileEnumerator};
use crate::config::{ConfigSource, DaemonConfig, ServiceConfig};
use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::log_ring::LogRing;
use crate::rate_limiter::RateLimiter;
use crate::remote::RemoteClient;
use crate::state_store::DownloadStateStore;
use crate::types::{DaemonState, Event, UserProfile, UserStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fields the orchestrator compares to decide whether a config change
/// warrants restarting a running daemon, per the significant-field list.
const _SIGNIFICANT_FIELDS_DOC: &str =
    "enabled, download_folder, poll_interval, lookback_days, max_concurrent_files, filters, auto_download_tag, use_job_name_directory";

struct ManagedUser {
    profile: UserProfile,
    config: DaemonConfig,
    daemon: Option<Daemon>,
    /// Set when this profile is enabled but missing credentials; surfaced as
    /// `last_error` over `GetStatus`/`GetUserList`.
    skip_reason: Option<String>,
}

/// Snapshot of the service-wide status, backing the IPC `GetStatus` request.
#[derive(Clone, Debug)]
pub struct ServiceStatus {
    /// Coarse service lifecycle state, e.g. `"running"`
    pub service_state: &'static str,
    /// `env!("CARGO_PKG_VERSION")` at build time
    pub version: &'static str,
    /// Most recent scan-tick time across all managed users
    pub last_scan_time: Option<DateTime<Utc>>,
    /// Sum of active downloads across all managed users
    pub active_downloads: u64,
    /// Number of profiles currently tracked
    pub active_users: usize,
    /// Most recent error across any managed user, if any
    pub last_error: Option<String>,
    /// Time elapsed since the orchestrator was constructed
    pub uptime: Duration,
    /// `"multi_user"` or `"single_user"`, mirroring `IpcConfig::single_user`
    pub service_mode: &'static str,
}

/// Manages a mapping from profile path to per-user daemon.
pub struct MultiUserOrchestrator {
    enumerator: Arc<dyn ProfileEnumerator>,
    config_source: Arc<dyn ConfigSource>,
    credentials: Arc<dyn CredentialSource>,
    service_config: ServiceConfig,
    limiter: Arc<RateLimiter>,
    log_ring: Arc<LogRing>,
    events: broadcast::Sender<Event>,
    users: RwLock<HashMap<String, ManagedUser>>,
    started_at: Instant,
    rescan_handle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    single_user: bool,
}

impl MultiUserOrchestrator {
    /// Build an orchestrator. Does not enumerate profiles or start any
    /// daemon until [`Self::start`] is called.
    pub fn new(
        enumerator: Arc<dyn ProfileEnumerator>,
        config_source: Arc<dyn ConfigSource>,
        credentials: Arc<dyn CredentialSource>,
        service_config: ServiceConfig,
        log_ring: Arc<LogRing>,
    ) -> Self {
        let limiter = RateLimiter::new(&service_config);
        let (events, _) = broadcast::channel(256);
        let single_user = service_config.ipc.single_user;
        Self {
            enumerator,
            config_source,
            credentials,
            service_config,
            limiter,
            log_ring,
            events,
            users: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
            rescan_handle: Mutex::new(None),
            single_user,
        }
    }

    /// Subscribe to coarse lifecycle events. Additive to the IPC log stream,
    /// meant for in-process embedding.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// An immediate profile rescan, then a rescan every
    /// `service_config.profile_rescan_interval` until [`Self::stop`].
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.rescan_handle.lock().await;
        if handle.is_some() {
            return;
        }

        self.rescan().await;

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let this = self.clone();
        let join = tokio::spawn(async move { this.rescan_loop(loop_cancel).await });
        *handle = Some((cancel, join));
    }

    /// Stop the rescan loop and every managed daemon.
    pub async fn stop(&self) {
        if let Some((cancel, join)) = self.rescan_handle.lock().await.take() {
            cancel.cancel();
            let _ = join.await;
        }

        let users = self.users.read().await;
        for user in users.values() {
            if let Some(daemon) = &user.daemon {
                daemon.stop().await;
            }
        }
    }

    async fn rescan_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.service_config.profile_rescan_interval) => {
                    self.rescan().await;
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Re-enumerate profiles, applying the add/update/credential-recovery/
    /// disappearance rules. Safe to call concurrently with controls; holds
    /// the user map write lock only for short critical sections.
    pub async fn rescan(&self) {
        let profiles = match self.enumerator.enumerate() {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::error!(error = %e, "profile enumeration failed, skipping this rescan");
                return;
            }
        };

        let seen_sids: std::collections::HashSet<String> =
            profiles.iter().map(|p| p.sid.clone()).collect();

        for profile in profiles {
            self.reconcile_profile(profile).await;
        }

        let disappeared: Vec<String> = {
            let users = self.users.read().await;
            users
                .keys()
                .filter(|sid| !seen_sids.contains(*sid))
                .cloned()
                .collect()
        };

        for sid in disappeared {
            let removed = self.users.write().await.remove(&sid);
            if let Some(user) = removed {
                if let Some(daemon) = user.daemon {
                    daemon.stop().await;
                }
                tracing::info!(sid, "profile disappeared, daemon dropped");
            }
        }
    }

    async fn reconcile_profile(&self, profile: UserProfile) {
        let loaded_config = self.config_source.load(&profile.config_path);
        let existing = self.users.write().await.remove(&profile.sid);

        match existing {
            None => {
                let config = match loaded_config {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(sid = %profile.sid, error = %e, "invalid config on new profile, tracking disabled");
                        DaemonConfig::default()
                    }
                };
                self.start_fresh(profile, config).await;
            }
            Some(mut managed) => {
                let new_config = match loaded_config {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(sid = %profile.sid, error = %e, "invalid config on rescan, keeping previous config");
                        managed.config.clone()
                    }
                };

                let config_changed = !managed.config.significant_fields_eq(&new_config);
                let was_skipped_for_credentials = managed.skip_reason.is_some();

                if config_changed {
                    if let Some(daemon) = managed.daemon.take() {
                        daemon.stop().await;
                    }
                    managed.config = new_config;
                    managed.profile = profile;
                    self.start_if_eligible(managed).await;
                } else if was_skipped_for_credentials {
                    managed.profile = profile;
                    self.start_if_eligible(managed).await;
                } else {
                    managed.profile = profile;
                    self.users.write().await.insert(managed.profile.sid.clone(), managed);
                }
            }
        }
    }

    async fn start_fresh(&self, profile: UserProfile, config: DaemonConfig) {
        let managed = ManagedUser {
            profile,
            config,
            daemon: None,
            skip_reason: None,
        };
        self.start_if_eligible(managed).await;
    }

    /// Start a daemon for `managed` if its config is enabled and credentials
    /// can be resolved; otherwise track it with an appropriate skip reason.
    async fn start_if_eligible(&self, mut managed: ManagedUser) {
        let sid = managed.profile.sid.clone();

        if !managed.config.is_enabled() {
            managed.skip_reason = None;
            self.users.write().await.insert(sid, managed);
            return;
        }

        match self.credentials.resolve(&managed.profile) {
            None => {
                tracing::warn!(sid = %sid, "enabled profile missing API credentials");
                managed.skip_reason = Some("no_api_key".to_string());
                self.users.write().await.insert(sid, managed);
            }
            Some((source, token)) => {
                tracing::info!(sid = %sid, source, "resolved API credentials");
                managed.skip_reason = None;
                let daemon = self.build_daemon(&managed.profile, managed.config.clone(), token);
                daemon.start(&CancellationToken::new()).await;
                managed.daemon = Some(daemon);
                self.users.write().await.insert(sid, managed);
            }
        }
    }

    fn build_daemon(&self, profile: &UserProfile, config: DaemonConfig, token: String) -> Daemon {
        let remote = Arc::new(RemoteClient::new(
            token.clone(),
            self.limiter.clone(),
            self.service_config.clone(),
        ));
        let transfer: Arc<dyn FileTransfer> = Arc::new(HttpFileTransfer::new(
            reqwest::Client::new(),
            self.service_config.api_base_url.clone(),
            token,
        ));
        let state = DownloadStateStore::new(profile.sid.clone(), profile.state_path.clone(), None);

        Daemon::new(
            profile.clone(),
            config,
            remote,
            transfer,
            state,
            self.log_ring.clone(),
            self.events.clone(),
        )
    }

    /// Resolve `identifier` (sid or username, case-insensitive) to a known
    /// sid, if any profile matches.
    async fn resolve_sid(&self, identifier: &str) -> Option<String> {
        let users = self.users.read().await;
        if users.contains_key(identifier) {
            return Some(identifier.to_string());
        }
        users
            .values()
            .find(|u| {
                u.profile.sid.eq_ignore_ascii_case(identifier)
                    || u.profile.username.eq_ignore_ascii_case(identifier)
            })
            .map(|u| u.profile.sid.clone())
    }

    /// Pause the identified user's daemon. This does not stop the scan
    /// timer (§4.6) — the tick entry keeps firing on schedule but skips its
    /// body while paused, so a subsequent resume picks up on the next tick
    /// rather than losing the timer's phase. Error if already paused.
    pub async fn pause_user(&self, identifier: &str) -> Result<()> {
        let sid = self
            .resolve_sid(identifier)
            .await
            .ok_or_else(|| Error::UnknownUser(identifier.to_string()))?;
        let users = self.users.read().await;
        let managed = users.get(&sid).ok_or_else(|| Error::UnknownUser(sid.clone()))?;
        match &managed.daemon {
            Some(daemon) if daemon.is_running().await && !daemon.is_paused() => {
                daemon.pause();
                Ok(())
            }
            Some(_) => Err(Error::AlreadyInState {
                sid,
                state: "paused",
            }),
            None => Err(Error::UnknownUser(sid)),
        }
    }

    /// Resume a paused daemon. Error if not currently paused.
    pub async fn resume_user(&self, identifier: &str) -> Result<()> {
        let sid = self
            .resolve_sid(identifier)
            .await
            .ok_or_else(|| Error::UnknownUser(identifier.to_string()))?;
        let users = self.users.read().await;
        let managed = users.get(&sid).ok_or_else(|| Error::UnknownUser(sid.clone()))?;
        match &managed.daemon {
            Some(daemon) if daemon.is_running().await && daemon.is_paused() => {
                daemon.resume();
                Ok(())
            }
            Some(_) => Err(Error::AlreadyInState {
                sid,
                state: "running",
            }),
            None => Err(Error::UnknownUser(sid)),
        }
    }

    /// Run the profile-rescan routine asynchronously, without waiting for
    /// the periodic timer.
    pub fn trigger_rescan(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.rescan().await });
    }

    /// Ask one daemon to run its scan tick immediately.
    pub async fn trigger_user_scan(&self, identifier: &str) -> Result<()> {
        let sid = self
            .resolve_sid(identifier)
            .await
            .ok_or_else(|| Error::UnknownUser(identifier.to_string()))?;
        let users = self.users.read().await;
        let managed = users.get(&sid).ok_or_else(|| Error::UnknownUser(sid.clone()))?;
        match &managed.daemon {
            Some(daemon) => {
                daemon.trigger_scan().await;
                Ok(())
            }
            None => Err(Error::UnknownUser(sid)),
        }
    }

    /// Sum of active downloads across every managed daemon.
    pub async fn total_active_downloads(&self) -> u64 {
        let users = self.users.read().await;
        let mut total = 0;
        for user in users.values() {
            if let Some(daemon) = &user.daemon {
                total += daemon.status().await.active_downloads;
            }
        }
        total
    }

    /// The shared log ring, for the IPC server's `GetRecentLogs`/`SubscribeLogs`.
    pub fn log_ring(&self) -> &Arc<LogRing> {
        &self.log_ring
    }

    /// Re-read every tracked profile's config file in place, without
    /// restarting any daemon. Distinct from [`Self::rescan`], which also
    /// adds/removes daemons for added/disappeared profiles and restarts a
    /// daemon when a significant field changed.
    pub async fn reload_configs(&self) {
        let mut users = self.users.write().await;
        for managed in users.values_mut() {
            match self.config_source.load(&managed.profile.config_path) {
                Ok(new_config) => {
                    managed.config = new_config.clone();
                    if let Some(daemon) = &managed.daemon {
                        daemon.update_config(new_config).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(sid = %managed.profile.sid, error = %e, "failed to reload config, keeping previous");
                }
            }
        }
    }

    /// Build the `GetStatus` snapshot.
    pub async fn status(&self) -> ServiceStatus {
        let users = self.users.read().await;
        let mut last_scan_time = None;
        let mut last_error = None;
        let mut active_downloads = 0;

        for user in users.values() {
            if let Some(reason) = &user.skip_reason {
                last_error = Some(reason.clone());
            }
            if let Some(daemon) = &user.daemon {
                let daemon_status = daemon.status().await;
                active_downloads += daemon_status.active_downloads;
                if daemon_status.last_scan_time > last_scan_time {
                    last_scan_time = daemon_status.last_scan_time;
                }
                if daemon_status.last_error.is_some() {
                    last_error = daemon_status.last_error;
                }
            }
        }

        ServiceStatus {
            service_state: "running",
            version: env!("CARGO_PKG_VERSION"),
            last_scan_time,
            active_downloads,
            active_users: users.len(),
            last_error,
            uptime: self.started_at.elapsed(),
            service_mode: if self.single_user { "single_user" } else { "multi_user" },
        }
    }

    /// Build the `GetUserList` snapshot.
    pub async fn user_list(&self) -> Vec<UserStatus> {
        let users = self.users.read().await;
        let mut result = Vec::with_capacity(users.len());
        for managed in users.values() {
            let (state, last_scan_time, jobs_downloaded, active_downloads) = match &managed.daemon {
                Some(daemon) => {
                    let status = daemon.status().await;
                    (status.state, status.last_scan_time, status.jobs_downloaded, status.active_downloads)
                }
                None if !managed.config.is_enabled() => (DaemonState::Disabled, None, 0, 0),
                None if managed.skip_reason.is_some() => (DaemonState::Error, None, 0, 0),
                None => (DaemonState::Stopped, None, 0, 0),
            };

            result.push(UserStatus {
                username: managed.profile.username.clone(),
                sid: Some(managed.profile.sid.clone()),
                state,
                download_folder: managed.config.download_folder.clone(),
                last_scan_time,
                jobs_downloaded,
                active_downloads,
                last_error: managed.skip_reason.clone(),
            });
        }
        result
    }
}
