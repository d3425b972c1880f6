//! # relay-sync-agent
//!
//! Background agent that discovers completed remote compute jobs and syncs
//! eligible job output to local disk.
//!
//! ## Design Philosophy
//!
//! relay-sync-agent is designed to be:
//! - **Multi-user** - one [`daemon::Daemon`] per local profile, all owned by
//!   a single [`orchestrator::MultiUserOrchestrator`]
//! - **Idempotent** - a job is downloaded at most once, tracked by both a
//!   remote tag and local state, surviving restarts and crashes mid-download
//! - **Library-first** - no bundled CLI or GUI, purely a Rust crate for
//!   embedding behind an IPC control surface or directly
//! - **Event-driven** - consumers subscribe to [`types::Event`], no polling
//!   required, in addition to the newline-delimited JSON IPC protocol
//!
//! ## Quick Start
//!
//! ```no_run
//! use relay_sync_agent::collaborators::FilesystemProfileEnumerator;
//! use relay_sync_agent::config::{JsonConfigSource, ServiceConfig};
//! use relay_sync_agent::log_ring::LogRing;
//! use relay_sync_agent::orchestrator::{FileThenEnvCredentialSource, MultiUserOrchestrator};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Arc::new(MultiUserOrchestrator::new(
//!         Arc::new(FilesystemProfileEnumerator::new(PathBuf::from("/var/local"))),
//!         Arc::new(JsonConfigSource),
//!         Arc::new(FileThenEnvCredentialSource),
//!         ServiceConfig::default(),
//!         Arc::new(LogRing::new(1000)),
//!     ));
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     orchestrator.start().await;
//!     relay_sync_agent::run_until_signal(&orchestrator).await;
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Shared collaborator traits: file transfer, notification, local profile
/// enumeration
pub mod collaborators;
/// Configuration types and sources
pub mod config;
/// Per-user scan loop and download executor
pub mod daemon;
/// Two-stage eligibility engine (custom field gate, then tag gate)
pub mod eligibility;
/// Error types
pub mod error;
/// Newline-delimited JSON IPC control plane
pub mod ipc;
/// Fixed-capacity in-memory log buffer, fed by a `tracing` layer
pub mod log_ring;
/// Owns the map from profile to per-user daemon
pub mod orchestrator;
/// Scope-routed token-bucket rate limiting
pub mod rate_limiter;
/// Authenticated JSON-over-HTTP client for the remote platform API
pub mod remote;
/// Generic retry-with-backoff helper
pub mod retry;
/// Job discovery: pagination, completion-time resolution, reject counters
pub mod scan;
/// Idempotent download state persistence
pub mod state_store;
/// Core data model and lifecycle events
pub mod types;

pub use config::ServiceConfig;
pub use error::{Error, ErrorDetail, Result};
pub use orchestrator::MultiUserOrchestrator;
pub use types::Event;

/// Wait for a termination signal, then stop `orchestrator`.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use relay_sync_agent::orchestrator::MultiUserOrchestrator;
/// use relay_sync_agent::run_until_signal;
/// # async fn example(orchestrator: std::sync::Arc<MultiUserOrchestrator>) {
/// orchestrator.start().await;
/// run_until_signal(&orchestrator).await;
/// # }
/// ```
pub async fn run_until_signal(orchestrator: &std::sync::Arc<MultiUserOrchestrator>) {
    wait_for_signal().await;
    orchestrator.stop().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
