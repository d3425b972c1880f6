//! Authenticated JSON-over-HTTP client for the remote compute platform.
//!
//! Every outbound call goes through exactly one [`crate::rate_limiter::RateLimiter::wait`]
//! and is wrapped in [`crate::retry::with_retry`]. Errors are pre-classified
//! into [`crate::error::RemoteError`] variants so callers (the scan monitor,
//! the eligibility engine, the download executor) can make policy decisions
//! without re-deriving retryability.

mod pagination;

pub use pagination::{Page, PaginationOptions};

use crate::config::ServiceConfig;
use crate::error::{RemoteError, Result};
use crate::rate_limiter::{RateLimiter, WaitOutcome};
use crate::retry::with_retry;
use crate::types::{CustomField, Job, JobStatusEntry, RemoteFile, ServerTestResult};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Short-lived cloud storage credentials, requested per file before
/// handing off to the file-transfer collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageCredentials {
    /// Which cloud flavor these credentials are for, e.g. `"s3"`, `"gcs"`
    pub provider: String,
    /// Opaque credential payload, interpreted by the file-transfer worker
    pub payload: Value,
    /// When these credentials expire
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    results: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

/// Authenticated client for the remote platform's `/api/v2/` and
/// `/api/v3/` surfaces.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: url::Url,
    token: String,
    limiter: Arc<RateLimiter>,
    service_config: ServiceConfig,
}

impl RemoteClient {
    /// Build a client authenticated with `token`, routing every call
    /// through `limiter` and retrying per `service_config.retry`.
    pub fn new(token: String, limiter: Arc<RateLimiter>, service_config: ServiceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: service_config.api_base_url.clone(),
            token,
            limiter,
            service_config,
        }
    }

    fn build_url(&self, path: &str) -> Result<url::Url> {
        // Pagination hands us a `next` URL that may already be absolute; strip
        // any scheme+host prefix so we never leave the configured base.
        let path = path
            .find("/api/")
            .map(|idx| &path[idx..])
            .unwrap_or(path);
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Decode(format!("invalid path {path}: {e}")).into())
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let retry_config = self.service_config.retry.clone();
        let result = with_retry(&retry_config, || {
            self.attempt(cancel, method.clone(), path, body)
        })
        .await;

        match result {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RemoteError::Decode(e.to_string()).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Vec<u8>, RemoteError> {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }

        match self.limiter.wait(path, cancel).await {
            WaitOutcome::Ok => {}
            WaitOutcome::Cancelled => return Err(RemoteError::Cancelled),
        }

        let url = self
            .build_url(path)
            .map_err(|_| RemoteError::Decode(format!("invalid path {path}")))?;

        let mut req = self
            .http
            .request(method, url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = tokio::select! {
            result = req.send() => result.map_err(RemoteError::Network)?,
            _ = cancel.cancelled() => return Err(RemoteError::Cancelled),
        };

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let scope = crate::config::RateScope::classify(path);
            self.limiter.record_rate_limited(scope, retry_after);
            return Err(RemoteError::TooManyRequests {
                scope: format!("{scope:?}"),
                retry_after,
            });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Server {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::CONFLICT || looks_like_duplicate(&body) {
                return Err(RemoteError::FileAlreadyExists);
            }
            return Err(RemoteError::Client {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(RemoteError::Network)
    }

    /// `GET /api/v3/users/me/`
    pub async fn get_current_user(&self, cancel: &CancellationToken) -> Result<Value> {
        self.request_json(cancel, reqwest::Method::GET, "/api/v3/users/me/", None)
            .await
    }

    /// Fetch every page of a cursor-paginated list endpoint, concatenating
    /// results. Honors `options.newest_first` + `options.cutoff` for
    /// early-termination: once a page's every entry is older than the
    /// cutoff, that page is fetched (and kept — filtering is the caller's
    /// job) and pagination stops. A hard page cap prevents runaway loops; a
    /// warning is logged once the cap is approached.
    async fn paginate<T>(
        &self,
        cancel: &CancellationToken,
        first_path: &str,
        options: PaginationOptions,
    ) -> Result<Page<T>>
    where
        T: serde::de::DeserializeOwned + pagination::CreatedAt,
    {
        const MAX_PAGES: u32 = 1000;
        const WARN_THRESHOLD: u32 = 900;

        let mut items = Vec::new();
        let mut path = first_path.to_string();
        let mut pages_fetched = 0u32;

        loop {
            let response: ListResponse<T> = self
                .request_json(cancel, reqwest::Method::GET, &path, None)
                .await?;
            pages_fetched += 1;

            if pages_fetched >= WARN_THRESHOLD {
                tracing::warn!(pages_fetched, MAX_PAGES, "approaching pagination page cap");
            }
            if pages_fetched >= MAX_PAGES {
                tracing::error!(MAX_PAGES, "pagination page cap reached, stopping early");
                items.extend(response.results);
                return Ok(Page { items, pages_fetched });
            }

            let page_stops_here = options.newest_first
                && options
                    .cutoff
                    .map(|cutoff| {
                        response
                            .results
                            .iter()
                            .all(|item| item.created_at() < cutoff)
                    })
                    .unwrap_or(false);

            items.extend(response.results);

            if page_stops_here {
                return Ok(Page { items, pages_fetched });
            }

            match response.next {
                Some(next) => path = next,
                None => return Ok(Page { items, pages_fetched }),
            }
        }
    }

    /// `GET /api/v3/jobs/[?ordering=-dateInserted]`, fully paginated.
    pub async fn list_jobs(
        &self,
        cancel: &CancellationToken,
        options: PaginationOptions,
    ) -> Result<Page<Job>> {
        let mut path = "/api/v3/jobs/".to_string();
        if options.newest_first {
            path.push_str("?ordering=-dateInserted");
        }
        self.paginate(cancel, &path, options).await
    }

    /// `GET /api/v2/jobs/{id}/files/`, fully paginated, bulk-query scope.
    pub async fn list_job_files(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> Result<Vec<RemoteFile>> {
        let path = format!("/api/v2/jobs/{job_id}/files/");
        let page = self.paginate(cancel, &path, PaginationOptions::default()).await?;
        Ok(page.items)
    }

    /// `GET /api/v3/jobs/{id}/statuses/`, full status history.
    pub async fn get_job_statuses(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> Result<Vec<JobStatusEntry>> {
        let path = format!("/api/v3/jobs/{job_id}/statuses/");
        let page = self.paginate(cancel, &path, PaginationOptions::default()).await?;
        Ok(page.items)
    }

    /// `GET /api/v3/jobs/{id}/tags/`
    pub async fn get_job_tags(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> Result<Vec<String>> {
        let path = format!("/api/v3/jobs/{job_id}/tags/");
        let value: Value = self
            .request_json(cancel, reqwest::Method::GET, &path, None)
            .await?;
        Ok(parse_tag_list(&value))
    }

    /// `POST /api/v3/jobs/{id}/tags/`
    pub async fn add_job_tag(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        tag: &str,
    ) -> Result<()> {
        let path = format!("/api/v3/jobs/{job_id}/tags/");
        let body = serde_json::json!({ "tag": tag });
        let _: Value = self
            .request_json(cancel, reqwest::Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    /// `DELETE /api/v3/jobs/{id}/tags/`
    pub async fn remove_job_tag(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        tag: &str,
    ) -> Result<()> {
        let path = format!("/api/v3/jobs/{job_id}/tags/{tag}/");
        let _: Value = self
            .request_json(cancel, reqwest::Method::DELETE, &path, None)
            .await?;
        Ok(())
    }

    /// `GET /api/v3/jobs/{id}/custom-fields/`. The remote's response may be
    /// an array of `{name, value}` objects or a map keyed by field name;
    /// both shapes are normalized here.
    pub async fn get_job_custom_fields(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> Result<Vec<CustomField>> {
        let path = format!("/api/v3/jobs/{job_id}/custom-fields/");
        let value: Value = self
            .request_json(cancel, reqwest::Method::GET, &path, None)
            .await?;
        Ok(parse_custom_fields(&value))
    }

    /// `POST /api/v2/jobs/{id}/submit/`, submit scope.
    pub async fn submit_job(&self, cancel: &CancellationToken, job_id: &str) -> Result<()> {
        let path = format!("/api/v2/jobs/{job_id}/submit/");
        let _: Value = self
            .request_json(cancel, reqwest::Method::POST, &path, None)
            .await?;
        Ok(())
    }

    /// `POST /api/v3/credentials/`, keyed off a file's storage descriptor.
    pub async fn get_storage_credentials(
        &self,
        cancel: &CancellationToken,
        storage_descriptor: &str,
    ) -> Result<StorageCredentials> {
        let body = serde_json::json!({ "storage_descriptor": storage_descriptor });
        self.request_json(
            cancel,
            reqwest::Method::POST,
            "/api/v3/credentials/",
            Some(&body),
        )
        .await
    }

    /// `GET /api/v3/coretypes/`, fully paginated.
    pub async fn list_core_types(&self, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let page =
            self.paginate(cancel, "/api/v3/coretypes/", PaginationOptions::default())
                .await?;
        Ok(page.items)
    }

    /// `GET /api/v3/analyses/`, fully paginated.
    pub async fn list_analyses(&self, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let page =
            self.paginate(cancel, "/api/v3/analyses/", PaginationOptions::default())
                .await?;
        Ok(page.items)
    }

    /// Race a `GET /api/v3/users/me/` call against a 7-second wall clock
    /// ceiling, for the GUI's "test connection" surface.
    pub async fn test_connection(&self, cancel: &CancellationToken) -> ServerTestResult {
        let started = Instant::now();
        let deadline = tokio::time::sleep(Duration::from_secs(7));
        tokio::pin!(deadline);

        tokio::select! {
            result = self.get_current_user(cancel) => match result {
                Ok(_) => ServerTestResult {
                    success: true,
                    latency: Some(started.elapsed()),
                    error: None,
                },
                Err(e) => ServerTestResult {
                    success: false,
                    latency: None,
                    error: Some(e.to_string()),
                },
            },
            _ = &mut deadline => ServerTestResult {
                success: false,
                latency: None,
                error: Some("connection test timed out after 7s".to_string()),
            },
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub(crate) fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub(crate) fn retry_config(&self) -> &crate::config::RetryConfig {
        &self.service_config.retry
    }

    pub(crate) fn resolve_url(&self, path: &str) -> Result<url::Url> {
        self.build_url(path)
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 500;
    if body.len() > MAX {
        format!("{}...", &body[..MAX])
    } else {
        body.to_string()
    }
}

fn looks_like_duplicate(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("already exists") || lower.contains("duplicate") || lower.contains("conflict")
}

fn parse_tag_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .or_else(|| v.get("name").and_then(Value::as_str).map(str::to_string))
            })
            .collect(),
        Value::Object(obj) => obj
            .get("results")
            .and_then(Value::as_array)
            .map(|items| parse_tag_list(&Value::Array(items.clone())))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Accepts both wire shapes the remote uses for custom fields: an array of
/// `{name, value}` objects, or a map keyed by field name.
fn parse_custom_fields(value: &Value) -> Vec<CustomField> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?.to_string();
                let value = item
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Some(CustomField { name, value })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(name, entry)| {
                let value = entry
                    .get("value")
                    .and_then(Value::as_str)
                    .or_else(|| entry.as_str())
                    .unwrap_or_default()
                    .to_string();
                CustomField {
                    name: name.clone(),
                    value,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
