//! Owns one scan loop and one download executor for one user.
//!
//! Split into focused submodules, following the teacher's pattern of one
//! struct with behavior spread across files by concern:
//! - [`tick`] - the scan/eligibility/download loop that fires on a timer
//! - [`download_executor`] - per-job file listing, path validation, transfer

mod download_executor;
mod tick;

use crate::collaborators::FileTransfer;
use crate::config::DaemonConfig;
use crate::log_ring::LogRing;
use crate::remote::RemoteClient;
use crate::scan::RejectCounters;
use crate::state_store::DownloadStateStore;
use crate::types::{DaemonState, Event, UserProfile};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Wall-clock budget for one scan tick, longer than the remote client's
/// per-request timeout to allow its retry window to run to completion.
const SCAN_TICK_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Counters surfaced by one completed scan tick's summary log line and kept
/// for inspection over IPC.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickCounters {
    /// Candidates the eligibility engine actually downloaded
    pub downloaded: u64,
    /// Candidates rejected by the eligibility engine, worth a log line
    pub skipped: u64,
    /// Candidates rejected silently (not a real policy candidate)
    pub filtered: u64,
}

struct Shared {
    profile: UserProfile,
    config: RwLock<DaemonConfig>,
    remote: Arc<RemoteClient>,
    transfer: Arc<dyn FileTransfer>,
    state: DownloadStateStore,
    log_ring: Arc<LogRing>,
    events: broadcast::Sender<Event>,
    active_downloads: AtomicU64,
    jobs_downloaded: AtomicU64,
    last_scan_time: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
    last_tick_counters: RwLock<TickCounters>,
    last_reject_counters: RwLock<RejectCounters>,
    last_error: RwLock<Option<String>>,
    paused: AtomicBool,
}

/// One user's scan loop and download executor. Construct with [`Daemon::new`],
/// then [`Daemon::start`] to begin ticking. Only one `start` may be in
/// flight at a time, enforced by `running` under a lock.
pub struct Daemon {
    shared: Arc<Shared>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    tick_in_progress: Arc<AtomicBool>,
}

impl Daemon {
    /// Build a daemon for `profile`, with starting `config`, sharing `remote`
    /// and `log_ring` with the rest of the process, and broadcasting
    /// lifecycle events on `events`.
    pub fn new(
        profile: UserProfile,
        config: DaemonConfig,
        remote: Arc<RemoteClient>,
        transfer: Arc<dyn FileTransfer>,
        state: DownloadStateStore,
        log_ring: Arc<LogRing>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                profile,
                config: RwLock::new(config),
                remote,
                transfer,
                state,
                log_ring,
                events,
                active_downloads: AtomicU64::new(0),
                jobs_downloaded: AtomicU64::new(0),
                last_scan_time: RwLock::new(None),
                last_tick_counters: RwLock::new(TickCounters::default()),
                last_reject_counters: RwLock::new(RejectCounters::default()),
                last_error: RwLock::new(None),
                paused: AtomicBool::new(false),
            }),
            running: Mutex::new(None),
            tick_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// This daemon's user profile.
    pub fn profile(&self) -> &UserProfile {
        &self.shared.profile
    }

    /// Start the scan loop: fires immediately, then every `poll_interval`.
    /// A no-op if already running.
    pub async fn start(&self, parent_cancel: &CancellationToken) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        if let Err(e) = self.shared.state.load().await {
            tracing::error!(sid = %self.shared.profile.sid, error = %e, "failed to load download state, starting empty");
        }

        let cancel = parent_cancel.child_token();
        let shared = self.shared.clone();
        let tick_in_progress = self.tick_in_progress.clone();
        let loop_cancel = cancel.clone();
        let handle =
            tokio::spawn(async move { run_loop(shared, tick_in_progress, loop_cancel).await });

        let _ = self.shared.events.send(Event::DaemonStarted {
            sid: self.shared.profile.sid.clone(),
        });

        *running = Some((cancel, handle));
    }

    /// Stop the scan loop, cancelling any in-flight tick. A no-op if not
    /// running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some((cancel, handle)) = running.take() {
            cancel.cancel();
            let _ = handle.await;
            let _ = self.shared.events.send(Event::DaemonStopped {
                sid: self.shared.profile.sid.clone(),
            });
        }
    }

    /// Whether the scan loop task is currently running.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Pause: the scan timer keeps firing internally, but ticks are skipped
    /// until resumed. Matches the spec's "timer keeps running, handler gates
    /// polling" semantics.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Resume a paused daemon.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Whether this daemon is currently paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Reload this daemon's configuration in place, without restarting the
    /// scan loop. The orchestrator decides whether a config change warrants
    /// a full restart instead of this in-place update.
    pub async fn update_config(&self, config: DaemonConfig) {
        *self.shared.config.write().await = config;
    }

    /// Current configuration snapshot.
    pub async fn config(&self) -> DaemonConfig {
        self.shared.config.read().await.clone()
    }

    /// Trigger one scan tick immediately, outside the timer. A no-op if a
    /// tick is already in progress (ticks never overlap themselves) or if
    /// the daemon is paused.
    pub async fn trigger_scan(&self) {
        if self.is_paused() {
            return;
        }
        let parent_cancel = match &*self.running.lock().await {
            Some((cancel, _)) => cancel.clone(),
            None => CancellationToken::new(),
        };
        run_one_tick(self.shared.clone(), self.tick_in_progress.clone(), parent_cancel).await;
    }

    /// Snapshot this daemon's status fields for `GetStatus`/`GetUserList`.
    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            state: if !self.is_running().await {
                DaemonState::Stopped
            } else if self.is_paused() {
                DaemonState::Paused
            } else {
                DaemonState::Running
            },
            download_folder: self.shared.config.read().await.download_folder.clone(),
            last_scan_time: *self.shared.last_scan_time.read().await,
            jobs_downloaded: self.shared.jobs_downloaded.load(Ordering::SeqCst),
            active_downloads: self.shared.active_downloads.load(Ordering::SeqCst),
            last_error: self.shared.last_error.read().await.clone(),
            last_tick_counters: *self.shared.last_tick_counters.read().await,
            last_reject_counters: *self.shared.last_reject_counters.read().await,
        }
    }
}

/// Snapshot of one daemon's observable state.
#[derive(Clone, Debug)]
pub struct DaemonStatus {
    /// Current lifecycle state
    pub state: DaemonState,
    /// Configured download folder
    pub download_folder: std::path::PathBuf,
    /// Timestamp of the last completed scan tick
    pub last_scan_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Total jobs downloaded so far
    pub jobs_downloaded: u64,
    /// Files currently being transferred
    pub active_downloads: u64,
    /// Most recent error, if any
    pub last_error: Option<String>,
    /// Counters from the last completed tick
    pub last_tick_counters: TickCounters,
    /// Reject counters from the last completed tick
    pub last_reject_counters: RejectCounters,
}

async fn run_loop(shared: Arc<Shared>, tick_in_progress: Arc<AtomicBool>, cancel: CancellationToken) {
    // Fire immediately, then on the configured interval.
    run_one_tick(shared.clone(), tick_in_progress.clone(), cancel.clone()).await;

    loop {
        let interval = shared.config.read().await.poll_interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                run_one_tick(shared.clone(), tick_in_progress.clone(), cancel.clone()).await;
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn run_one_tick(shared: Arc<Shared>, tick_in_progress: Arc<AtomicBool>, parent_cancel: CancellationToken) {
    if shared.paused.load(Ordering::SeqCst) {
        tracing::debug!(sid = %shared.profile.sid, "daemon paused, skipping scan tick");
        return;
    }

    if tick_in_progress
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::debug!(sid = %shared.profile.sid, "scan tick already in progress, skipping");
        return;
    }

    let tick_cancel = parent_cancel.child_token();
    let deadline = tokio::time::sleep(SCAN_TICK_DEADLINE);
    tokio::pin!(deadline);

    tokio::select! {
        () = tick::run_tick(&shared, &tick_cancel) => {}
        () = &mut deadline => {
            tracing::warn!(sid = %shared.profile.sid, "scan tick exceeded 10 minute deadline, aborting");
            tick_cancel.cancel();
        }
    }

    tick_in_progress.store(false, Ordering::SeqCst);
}
