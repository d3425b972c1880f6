//! Maps one [`IpcRequest`] to the [`MultiUserOrchestrator`] call it
//! represents and builds the matching [`IpcResponse`].
//!
//! Kept as a single free function rather than a trait so both the unix
//! socket transport and (eventually) a named-pipe transport can share it
//! without an extra abstraction layer.

use super::protocol::IpcResponse;
use crate::orchestrator::MultiUserOrchestrator;
use std::sync::Arc;

use super::protocol::IpcRequest;

/// Execute `request` against `orchestrator` and build its response.
///
/// `SubscribeLogs` is handled by the transport directly (it streams rather
/// than returning one value) and never reaches this function.
pub async fn dispatch(orchestrator: &Arc<MultiUserOrchestrator>, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => {
            let status = orchestrator.status().await;
            IpcResponse::from_status(&status)
        }
        IpcRequest::GetUserList => IpcResponse::UserList {
            users: orchestrator.user_list().await,
        },
        IpcRequest::PauseUser { user_id } => match orchestrator.pause_user(&user_id).await {
            Ok(()) => IpcResponse::Ok,
            Err(e) => IpcResponse::Error { error: e.to_detail() },
        },
        IpcRequest::ResumeUser { user_id } => match orchestrator.resume_user(&user_id).await {
            Ok(()) => IpcResponse::Ok,
            Err(e) => IpcResponse::Error { error: e.to_detail() },
        },
        IpcRequest::TriggerScan { user_id } => match orchestrator.trigger_user_scan(&user_id).await {
            Ok(()) => IpcResponse::Ok,
            Err(e) => IpcResponse::Error { error: e.to_detail() },
        },
        IpcRequest::TriggerRescan => {
            orchestrator.trigger_rescan();
            IpcResponse::Ok
        }
        IpcRequest::GetRecentLogs { count } => IpcResponse::RecentLogs {
            entries: orchestrator.log_ring().recent(count),
        },
        IpcRequest::SubscribeLogs => {
            unreachable!("SubscribeLogs is handled by the transport before reaching dispatch")
        }
        IpcRequest::OpenLogs => IpcResponse::Ok,
        IpcRequest::ReloadConfig => {
            let active_downloads = orchestrator.total_active_downloads().await;
            if active_downloads > 0 {
                IpcResponse::ReloadConfig {
                    applied: false,
                    deferred: true,
                    active_downloads,
                    error: None,
                }
            } else {
                orchestrator.reload_configs().await;
                IpcResponse::ReloadConfig {
                    applied: true,
                    deferred: false,
                    active_downloads: 0,
                    error: None,
                }
            }
        }
        IpcRequest::Shutdown => {
            orchestrator.stop().await;
            IpcResponse::Ok
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::FilesystemProfileEnumerator;
    use crate::config::{JsonConfigSource, ServiceConfig};
    use crate::log_ring::LogRing;
    use crate::orchestrator::FileThenEnvCredentialSource;
    use tempfile::TempDir;

    fn orchestrator(root: std::path::PathBuf) -> Arc<MultiUserOrchestrator> {
        Arc::new(MultiUserOrchestrator::new(
            Arc::new(FilesystemProfileEnumerator::new(root)),
            Arc::new(JsonConfigSource),
            Arc::new(FileThenEnvCredentialSource),
            ServiceConfig::default(),
            Arc::new(LogRing::new(100)),
        ))
    }

    #[tokio::test]
    async fn get_status_reports_zero_users_when_nothing_scanned_yet() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(dir.path().to_path_buf());
        let response = dispatch(&orchestrator, IpcRequest::GetStatus).await;
        match response {
            IpcResponse::Status { active_users, .. } => assert_eq!(active_users, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_unknown_user_returns_error_response() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(dir.path().to_path_buf());
        let response = dispatch(
            &orchestrator,
            IpcRequest::PauseUser {
                user_id: "ghost".to_string(),
            },
        )
        .await;
        match response {
            IpcResponse::Error { error } => assert_eq!(error.code, "unknown_user"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reload_config_applies_immediately_when_nothing_is_downloading() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(dir.path().to_path_buf());
        let response = dispatch(&orchestrator, IpcRequest::ReloadConfig).await;
        match response {
            IpcResponse::ReloadConfig { applied, deferred, .. } => {
                assert!(applied);
                assert!(!deferred);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
