//! Newline-delimited JSON transport: one task per connection, dispatching
//! each line to the [`MultiUserOrchestrator`] and writing back one or more
//! response lines.

use super::protocol::{IpcRequest, IpcResponse, MAX_LINE_BYTES, REQUEST_READ_TIMEOUT};
use crate::error::{Error, Result};
use crate::orchestrator::MultiUserOrchestrator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Owns the bound IPC endpoint and accepts connections until [`Self::shutdown`]
/// is requested (via a `Shutdown` request or an external caller).
pub struct IpcServer {
    path: PathBuf,
    orchestrator: Arc<MultiUserOrchestrator>,
    cancel: CancellationToken,
}

impl IpcServer {
    /// Build a server bound to `path`, without listening yet.
    pub fn new(path: PathBuf, orchestrator: Arc<MultiUserOrchestrator>) -> Self {
        Self {
            path,
            orchestrator,
            cancel: CancellationToken::new(),
        }
    }

    /// A token that, when cancelled, stops [`Self::run`]'s accept loop. The
    /// `Shutdown` request cancels this internally.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind the endpoint (reclaiming a stale one if present) and accept
    /// connections until cancelled.
    #[cfg(unix)]
    pub async fn run(&self) -> Result<()> {
        reclaim_stale_endpoint(&self.path).await?;

        let listener = UnixListener::bind(&self.path)
            .map_err(|e| Error::Ipc(format!("failed to bind {}: {e}", self.path.display())))?;
        set_socket_permissions(&self.path).await;

        tracing::info!(path = %self.path.display(), "IPC server listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let orchestrator = self.orchestrator.clone();
                            let conn_cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, orchestrator, conn_cancel).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "IPC accept error");
                        }
                    }
                }
            }
        }

        let _ = tokio::fs::remove_file(&self.path).await;
        tracing::info!("IPC server stopped");
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn run(&self) -> Result<()> {
        // Named-pipe transport is out of scope for this reference build; the
        // protocol and handler are platform-independent, only the listener
        // differs.
        Err(Error::Ipc("IPC transport is only implemented for unix sockets".to_string()))
    }
}

/// Probe an existing socket path: if a live server is listening, refuse to
/// steal it; if the path exists but nothing answers (a stale file left by a
/// crashed process), remove it so `bind` can reclaim it.
#[cfg(unix)]
async fn reclaim_stale_endpoint(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    match UnixStream::connect(path).await {
        Ok(_) => Err(Error::IpcEndpointInUse),
        Err(_) => {
            tracing::warn!(path = %path.display(), "removing stale IPC socket from a previous run");
            tokio::fs::remove_file(path)
                .await
                .map_err(Error::Io)?;
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn set_socket_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
}

#[cfg(unix)]
async fn handle_connection(
    stream: UnixStream,
    orchestrator: Arc<MultiUserOrchestrator>,
    server_cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::with_capacity(MAX_LINE_BYTES, read_half).lines();

    loop {
        let line = tokio::time::timeout(REQUEST_READ_TIMEOUT, lines.next_line()).await;

        let line = match line {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "IPC connection read error");
                break;
            }
            Err(_) => {
                tracing::debug!("IPC connection idle past read deadline, closing");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: IpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let response = IpcResponse::Error {
                    error: crate::error::ErrorDetail {
                        code: "invalid_request".to_string(),
                        message: format!("malformed request: {e}"),
                    },
                };
                let _ = write_response(&mut write_half, &response).await;
                break;
            }
        };

        if matches!(request, IpcRequest::SubscribeLogs) {
            stream_logs(&orchestrator, &mut write_half, &server_cancel).await;
            continue;
        }

        let shutdown_requested = matches!(request, IpcRequest::Shutdown);
        let response = super::handler::dispatch(&orchestrator, request).await;
        if write_response(&mut write_half, &response).await.is_err() {
            break;
        }

        if shutdown_requested {
            server_cancel.cancel();
            break;
        }
    }
}

#[cfg(unix)]
async fn stream_logs(
    orchestrator: &Arc<MultiUserOrchestrator>,
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    server_cancel: &CancellationToken,
) {
    let (subscriber_id, mut rx) = orchestrator.log_ring().subscribe();

    loop {
        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(entry) => {
                        let response = IpcResponse::LogEntry(entry);
                        if write_response(write_half, &response).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = server_cancel.cancelled() => break,
        }
    }

    orchestrator.log_ring().unsubscribe(subscriber_id);
}

#[cfg(unix)]
async fn write_response(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &IpcResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"type":"error","error":{"code":"internal_error","message":"failed to encode response"}}"#
            .to_string()
    });
    line.push('\n');
    write_half.write_all(line.as_bytes()).await
}
